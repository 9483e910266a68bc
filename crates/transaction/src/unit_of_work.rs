use std::ops::{Deref, DerefMut};

use crate::Result;
use crate::provider::RedisProvider;
use crate::scope::TransactionScope;

/// The Redis transaction belonging to one unit of message processing.
///
/// A unit of work created with [`UnitOfWork::begin`] carries an ambient
/// transactional scope: every writer that asks for a scope receives the same
/// one, and [`UnitOfWork::commit`] executes everything they enlisted. Without
/// a transaction each caller gets a fresh immediate scope.
pub struct UnitOfWork {
    provider: RedisProvider,
    scope: Option<TransactionScope>,
}

impl UnitOfWork {
    /// Starts a unit of work with a new ambient transaction.
    pub fn begin(provider: &RedisProvider) -> Self {
        Self {
            provider: provider.clone(),
            scope: Some(provider.with_transaction()),
        }
    }

    /// Starts a unit of work that has no ambient transaction.
    pub fn unscoped(provider: &RedisProvider) -> Self {
        Self {
            provider: provider.clone(),
            scope: None,
        }
    }

    /// Attaches an existing scope as the ambient transaction.
    pub fn attach(provider: &RedisProvider, scope: TransactionScope) -> Self {
        Self {
            provider: provider.clone(),
            scope: Some(scope),
        }
    }

    /// Returns true when an ambient transaction is attached.
    pub fn has_transaction(&self) -> bool {
        self.scope.is_some()
    }

    /// Returns the ambient scope, or a fresh immediate scope when there is
    /// none.
    pub fn get_for_scope(&mut self) -> ScopeHandle<'_> {
        match self.scope.as_mut() {
            Some(scope) => ScopeHandle::Ambient(scope),
            None => ScopeHandle::Unscoped(self.provider.without_transaction()),
        }
    }

    /// Commits the ambient transaction, if any.
    pub async fn commit(self) -> Result<()> {
        match self.scope {
            Some(scope) => scope.commit().await,
            None => Ok(()),
        }
    }
}

/// A scope handed out by [`UnitOfWork::get_for_scope`].
pub enum ScopeHandle<'a> {
    /// The unit of work's shared transaction.
    Ambient(&'a mut TransactionScope),
    /// A throwaway scope that runs operations immediately.
    Unscoped(TransactionScope),
}

impl ScopeHandle<'_> {
    pub fn is_ambient(&self) -> bool {
        matches!(self, ScopeHandle::Ambient(_))
    }
}

impl Deref for ScopeHandle<'_> {
    type Target = TransactionScope;

    fn deref(&self) -> &TransactionScope {
        match self {
            ScopeHandle::Ambient(scope) => scope,
            ScopeHandle::Unscoped(scope) => scope,
        }
    }
}

impl DerefMut for ScopeHandle<'_> {
    fn deref_mut(&mut self) -> &mut TransactionScope {
        match self {
            ScopeHandle::Ambient(scope) => scope,
            ScopeHandle::Unscoped(scope) => scope,
        }
    }
}
