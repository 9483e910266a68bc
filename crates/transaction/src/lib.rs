//! Transaction scoping over Redis.
//!
//! Writers from independent subsystems (saga storage, outbox enqueue) enlist
//! their commands in a [`TransactionScope`] so that they commit together in a
//! single `MULTI`/`EXEC`, or run immediately when no transaction is open.
//! The scope is always passed explicitly; [`UnitOfWork`] owns the scope for
//! one unit of message processing and exposes the commit hook.

pub mod error;
pub mod provider;
pub mod scope;
pub mod unit_of_work;

pub use error::{ConcurrencyConflict, Result, TransactionError};
pub use provider::{RedisProvider, RedisSettings};
pub use scope::{ReplyCheck, ScopedOperation, TransactionScope};
pub use unit_of_work::{ScopeHandle, UnitOfWork};
