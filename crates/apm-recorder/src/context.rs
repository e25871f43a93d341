// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracks which transaction is active in each execution context.
//!
//! A single [`TransactionContext`] is created per process and shared through
//! an `Arc`. An execution context is either an OS thread or a cooperative task
//! identified by the caller. Each context has at most one active transaction;
//! nesting top-level transactions is a [`ContextError::AlreadyActive`].
//!
//! `current()` sits on the hot path of every instrumented call, so the
//! registry is behind an `RwLock` and lookups only take the read side.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread::{self, ThreadId};

use tracing::debug;

use crate::errors::ContextError;
use crate::transaction::Transaction;

/// Identity of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum ContextId {
    #[display("thread:{_0:?}")]
    Thread(ThreadId),
    /// Caller supplied id of a cooperative task.
    #[display("task:{_0}")]
    Task(u64),
}

impl ContextId {
    pub fn current_thread() -> Self {
        ContextId::Thread(thread::current().id())
    }
}

#[derive(Debug, Default)]
pub struct TransactionContext {
    active: RwLock<HashMap<ContextId, Arc<Transaction>>>,
}

impl TransactionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `transaction` the active transaction of the current thread.
    pub fn enter(&self, transaction: Arc<Transaction>) -> Result<(), ContextError> {
        self.enter_in(ContextId::current_thread(), transaction)
    }

    pub fn enter_in(
        &self,
        context: ContextId,
        transaction: Arc<Transaction>,
    ) -> Result<(), ContextError> {
        #[allow(clippy::expect_used)]
        let mut active = self.active.write().expect("lock poisoned");
        if let Some(existing) = active.get(&context) {
            return Err(ContextError::AlreadyActive {
                context: context.to_string(),
                active: existing.guid().to_string(),
            });
        }
        debug!(
            "Transaction {} entered execution context {context}",
            transaction.guid()
        );
        active.insert(context, transaction);
        Ok(())
    }

    /// Active transaction of the current thread, if any.
    pub fn current(&self) -> Option<Arc<Transaction>> {
        self.current_in(ContextId::current_thread())
    }

    pub fn current_in(&self, context: ContextId) -> Option<Arc<Transaction>> {
        #[allow(clippy::expect_used)]
        let active = self.active.read().expect("lock poisoned");
        active.get(&context).cloned()
    }

    /// Clears the current thread's entry for `transaction`.
    pub fn exit(&self, transaction: &Arc<Transaction>) -> Result<(), ContextError> {
        self.exit_in(ContextId::current_thread(), transaction)
    }

    /// Clears `context`'s entry. Fails, leaving the entry untouched, when the
    /// stored transaction is not `transaction`.
    pub fn exit_in(
        &self,
        context: ContextId,
        transaction: &Arc<Transaction>,
    ) -> Result<(), ContextError> {
        #[allow(clippy::expect_used)]
        let mut active = self.active.write().expect("lock poisoned");
        match active.get(&context) {
            None => Err(ContextError::NotActive {
                context: context.to_string(),
            }),
            Some(existing) if !Arc::ptr_eq(existing, transaction) => Err(ContextError::Mismatch {
                context: context.to_string(),
                active: existing.guid().to_string(),
                exiting: transaction.guid().to_string(),
            }),
            Some(_) => {
                active.remove(&context);
                debug!(
                    "Transaction {} exited execution context {context}",
                    transaction.guid()
                );
                Ok(())
            }
        }
    }

    /// Number of execution contexts with an active transaction.
    pub fn active_count(&self) -> usize {
        #[allow(clippy::expect_used)]
        let active = self.active.read().expect("lock poisoned");
        active.len()
    }
}
