//! Event stream adapters.
//!
//! The in-memory stream lives in `creditx-events`; Redis Streams adapters are
//! compiled with the `redis` feature.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{
    ConsumerStats, HoldEventConsumerConfig, RedisHoldEventConsumer, RedisHoldEventConsumerHandle,
    RedisStreamsError, RedisStreamsPublisher,
};
