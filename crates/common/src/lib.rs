//! Shared building blocks for the Redis-backed saga and outbox stores.

pub mod hash;
pub mod naming;
pub mod types;

pub use hash::murmur3_32;
pub use naming::to_kebab_case;
pub use types::{Revision, SagaId};
