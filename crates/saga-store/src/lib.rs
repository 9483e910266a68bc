//! Redis-backed saga storage.
//!
//! Each saga instance is a hash at `saga:<type>:<id>` holding its revision,
//! serialized data and the list of index entries that point at it.
//! Correlation properties are indexed in hashes sharded by the hash of the
//! correlated value, so that hot properties do not serialize all writers on
//! one key. Every write is a single Lua script enlisted in a
//! [`transaction::TransactionScope`].

pub mod config;
pub mod data;
pub mod error;
pub mod index;
mod scripts;
pub mod store;

pub use common::{Revision, SagaId};
pub use config::SagaStoreConfig;
pub use data::{SagaData, SagaRecord};
pub use error::{Result, SagaStoreError};
pub use index::IndexKey;
pub use store::{RedisSagaStore, SagaStorage};
