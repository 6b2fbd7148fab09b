//! Transaction-manager boundary.
//!
//! The redelivery governor must only advance its bookkeeping when the
//! enclosing transaction commits. It consumes the transaction manager
//! through the narrow interface here: ask for the current transaction,
//! register a completion callback. [`LocalTransactionManager`] is the
//! in-process implementation used by embedding applications and tests; a
//! container supplies its own behind the same traits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Outcome a synchronization observes at completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Committed,
    RolledBack,
}

/// Callback registered against a transaction.
pub trait Synchronization: Send + Sync {
    /// Runs before the commit decision, on the commit path only.
    fn before_completion(&self) {}

    /// Runs after the transaction completes, with its outcome.
    fn after_completion(&self, status: CompletionStatus);
}

/// Adapter: a closure as an after-completion synchronization.
pub struct AfterCompletion<F>(pub F);

impl<F> Synchronization for AfterCompletion<F>
where
    F: Fn(CompletionStatus) + Send + Sync,
{
    fn after_completion(&self, status: CompletionStatus) {
        (self.0)(status)
    }
}

/// A transaction accepting synchronization registrations.
pub trait Transaction: Send + Sync {
    fn register_synchronization(&self, sync: Box<dyn Synchronization>);
}

/// Source of the calling context's current transaction.
pub trait TransactionManager: Send + Sync {
    /// The transaction active for the current work unit, if any.
    fn current_transaction(&self) -> Option<Arc<dyn Transaction>>;
}

/// In-process transaction: collects synchronizations, fires them once at
/// commit or rollback.
pub struct LocalTransaction {
    syncs: Mutex<Vec<Box<dyn Synchronization>>>,
    completed: AtomicBool,
}

impl LocalTransaction {
    pub fn new() -> Self {
        Self {
            syncs: Mutex::new(Vec::new()),
            completed: AtomicBool::new(false),
        }
    }

    /// Complete the transaction. Synchronizations fire exactly once; a
    /// second completion is a no-op.
    pub fn complete(&self, status: CompletionStatus) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        let syncs = std::mem::take(&mut *self.syncs.lock().unwrap_or_else(|e| e.into_inner()));
        if status == CompletionStatus::Committed {
            for sync in &syncs {
                sync.before_completion();
            }
        }
        for sync in &syncs {
            sync.after_completion(status);
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

impl Default for LocalTransaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction for LocalTransaction {
    fn register_synchronization(&self, sync: Box<dyn Synchronization>) {
        if self.is_completed() {
            tracing::warn!("synchronization registered on completed transaction, dropped");
            return;
        }
        self.syncs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sync);
    }
}

/// In-process transaction manager: one current transaction at a time.
pub struct LocalTransactionManager {
    current: Mutex<Option<Arc<LocalTransaction>>>,
}

impl LocalTransactionManager {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    /// Begin a transaction; it becomes the current one.
    pub fn begin(&self) -> Arc<LocalTransaction> {
        let tx = Arc::new(LocalTransaction::new());
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx.clone());
        tx
    }

    /// Commit the current transaction, if any.
    pub fn commit(&self) {
        self.finish(CompletionStatus::Committed)
    }

    /// Roll back the current transaction, if any.
    pub fn rollback(&self) {
        self.finish(CompletionStatus::RolledBack)
    }

    fn finish(&self, status: CompletionStatus) {
        let tx = self.current.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = tx {
            tx.complete(status);
        }
    }
}

impl Default for LocalTransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager for LocalTransactionManager {
    fn current_transaction(&self) -> Option<Arc<dyn Transaction>> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .map(|tx| tx as Arc<dyn Transaction>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_commit_fires_synchronizations() {
        let tm = LocalTransactionManager::new();
        let tx = tm.begin();

        let commits = Arc::new(AtomicUsize::new(0));
        let commits_clone = commits.clone();
        tx.register_synchronization(Box::new(AfterCompletion(move |status| {
            if status == CompletionStatus::Committed {
                commits_clone.fetch_add(1, Ordering::SeqCst);
            }
        })));

        tm.commit();
        assert_eq!(commits.load(Ordering::SeqCst), 1);
        assert!(tx.is_completed());
    }

    #[test]
    fn test_rollback_reports_rolled_back() {
        let tm = LocalTransactionManager::new();
        let tx = tm.begin();

        let observed = Arc::new(Mutex::new(None));
        let observed_clone = observed.clone();
        tx.register_synchronization(Box::new(AfterCompletion(move |status| {
            *observed_clone.lock().unwrap() = Some(status);
        })));

        tm.rollback();
        assert_eq!(
            *observed.lock().unwrap(),
            Some(CompletionStatus::RolledBack)
        );
    }

    #[test]
    fn test_current_transaction_cleared_after_completion() {
        let tm = LocalTransactionManager::new();
        assert!(tm.current_transaction().is_none());

        tm.begin();
        assert!(tm.current_transaction().is_some());

        tm.commit();
        assert!(tm.current_transaction().is_none());
    }

    #[test]
    fn test_double_completion_fires_once() {
        let tx = LocalTransaction::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        tx.register_synchronization(Box::new(AfterCompletion(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        })));

        tx.complete(CompletionStatus::Committed);
        tx.complete(CompletionStatus::RolledBack);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_registration_dropped() {
        let tx = LocalTransaction::new();
        tx.complete(CompletionStatus::Committed);

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        tx.register_synchronization(Box::new(AfterCompletion(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        })));
        tx.complete(CompletionStatus::Committed);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
