//! Distributed, multi-limit, hierarchical token-bucket rate limiting
//! over a transactional remote key-value store.
//!
//! [`Limiter`] is the entry point: it owns a [`store::StoreGateway`] and
//! exposes `acquire`/`available`/entity and config CRUD/namespace
//! management. The pure bucket algebra, keyspace schema, and error
//! taxonomy live in `tbucket-core`; everything in this crate is the async
//! engine built on top of it.

#![forbid(unsafe_code)]

pub mod acquire;
pub mod config;
pub mod entity;
pub mod lease;
pub mod limiter;
pub mod namespace;
pub mod store;
mod ttl;

pub use acquire::AcquireRequest;
pub use config::LimiterConfig;
pub use entity::Entity;
pub use lease::Lease;
pub use limiter::Limiter;
pub use namespace::{ScopedLimiter, SystemDefaults};
pub use store::{InMemoryGateway, OnUnavailable, StoreGateway};

#[cfg(feature = "dynamodb")]
pub use store::DynamoDbGateway;

pub use tbucket_core::error::{LimiterError, RateLimitExceeded, Side, ValidationError, Violation};
pub use tbucket_core::limit::Limit;
