//! Staged all-or-nothing execution.
//!
//! A [`Transaction`] commits its stages strictly in order against one owned
//! context. When stage `k` fails, stages `k-1..=0` are rolled back in reverse
//! order (stage `k` itself is not) and the original error is returned. When
//! every stage commits, each stage's cleanup runs in forward order; cleanup
//! and rollback failures are logged and never replace the result.

use std::fmt;

/// One reversible unit of work over a context `C`.
///
/// `commit` must be atomic or undo its own partial effects before failing:
/// the engine never rolls back the stage whose commit failed.
pub trait Stage<C> {
    type Error: fmt::Display;

    fn name(&self) -> &'static str;

    fn commit(&mut self, ctx: &mut C) -> Result<(), Self::Error>;

    fn rollback(&mut self, _ctx: &mut C) -> Result<(), Self::Error> {
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut C) -> Result<(), Self::Error> {
        Ok(())
    }
}

pub struct Transaction<S> {
    name: &'static str,
    stages: Vec<S>,
}

impl<S> Transaction<S> {
    pub fn new(name: &'static str, stages: Vec<S>) -> Self {
        Self { name, stages }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn run<C>(mut self, ctx: &mut C) -> Result<(), S::Error>
    where
        S: Stage<C>,
    {
        let span = tracing::info_span!("transaction", txn = self.name, stages = self.stages.len());
        let _enter = span.enter();

        for index in 0..self.stages.len() {
            let stage = &mut self.stages[index];
            let stage_name = stage.name();
            let committed = {
                let _stage = tracing::debug_span!("stage", stage = stage_name).entered();
                stage.commit(ctx)
            };
            if let Err(err) = committed {
                tracing::warn!(stage = stage_name, error = %err, "stage failed; rolling back");
                self.unwind(index, ctx);
                return Err(err);
            }
            tracing::debug!(stage = stage_name, "stage committed");
        }

        for stage in &mut self.stages {
            let stage_name = stage.name();
            if let Err(err) = stage.cleanup(ctx) {
                tracing::warn!(stage = stage_name, error = %err, "stage cleanup failed");
            }
        }
        tracing::info!("transaction committed");
        Ok(())
    }

    /// Roll back the first `committed` stages, last first.
    fn unwind<C>(&mut self, committed: usize, ctx: &mut C)
    where
        S: Stage<C>,
    {
        for stage in self.stages[..committed].iter_mut().rev() {
            let stage_name = stage.name();
            let _stage = tracing::debug_span!("rollback", stage = stage_name).entered();
            match stage.rollback(ctx) {
                Ok(()) => tracing::debug!(stage = stage_name, "stage rolled back"),
                Err(err) => {
                    tracing::error!(stage = stage_name, error = %err, "stage rollback failed")
                }
            }
        }
    }
}

impl<S> fmt::Debug for Transaction<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("name", &self.name)
            .field("stages", &self.stages.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Commit(usize),
        Rollback(usize),
        Cleanup(usize),
    }

    #[derive(Default)]
    struct Journal {
        calls: Vec<Call>,
        produced: Vec<usize>,
    }

    struct Recording {
        index: usize,
        fail_commit: bool,
        fail_rollback: bool,
        fail_cleanup: bool,
    }

    impl Recording {
        fn new(index: usize) -> Self {
            Self {
                index,
                fail_commit: false,
                fail_rollback: false,
                fail_cleanup: false,
            }
        }
    }

    impl Stage<Journal> for Recording {
        type Error = String;

        fn name(&self) -> &'static str {
            "recording"
        }

        fn commit(&mut self, ctx: &mut Journal) -> Result<(), String> {
            ctx.calls.push(Call::Commit(self.index));
            if self.fail_commit {
                return Err(format!("commit {} failed", self.index));
            }
            ctx.produced.push(self.index);
            Ok(())
        }

        fn rollback(&mut self, ctx: &mut Journal) -> Result<(), String> {
            ctx.calls.push(Call::Rollback(self.index));
            ctx.produced.retain(|&i| i != self.index);
            if self.fail_rollback {
                return Err(format!("rollback {} failed", self.index));
            }
            Ok(())
        }

        fn cleanup(&mut self, ctx: &mut Journal) -> Result<(), String> {
            ctx.calls.push(Call::Cleanup(self.index));
            if self.fail_cleanup {
                return Err(format!("cleanup {} failed", self.index));
            }
            Ok(())
        }
    }

    fn stages(n: usize) -> Vec<Recording> {
        (0..n).map(Recording::new).collect()
    }

    #[test]
    fn success_runs_cleanup_forward() {
        let mut journal = Journal::default();
        Transaction::new("t", stages(3)).run(&mut journal).unwrap();
        assert_eq!(
            journal.calls,
            vec![
                Call::Commit(0),
                Call::Commit(1),
                Call::Commit(2),
                Call::Cleanup(0),
                Call::Cleanup(1),
                Call::Cleanup(2),
            ]
        );
    }

    #[test]
    fn failure_returns_original_error_after_unwinding() {
        let mut stages = stages(4);
        stages[2].fail_commit = true;
        stages[0].fail_rollback = true;
        let mut journal = Journal::default();
        let err = Transaction::new("t", stages).run(&mut journal).unwrap_err();
        assert_eq!(err, "commit 2 failed");
        assert_eq!(
            journal.calls,
            vec![
                Call::Commit(0),
                Call::Commit(1),
                Call::Commit(2),
                Call::Rollback(1),
                Call::Rollback(0),
            ]
        );
        assert!(journal.produced.is_empty());
    }

    #[test]
    fn cleanup_failures_do_not_fail_the_run() {
        let mut stages = stages(2);
        stages[0].fail_cleanup = true;
        let mut journal = Journal::default();
        Transaction::new("t", stages).run(&mut journal).unwrap();
        assert_eq!(journal.calls.last(), Some(&Call::Cleanup(1)));
        assert_eq!(journal.produced, vec![0, 1]);
    }

    #[test]
    fn empty_transaction_succeeds() {
        let mut journal = Journal::default();
        let txn: Transaction<Recording> = Transaction::new("t", Vec::new());
        assert!(txn.is_empty());
        txn.run(&mut journal).unwrap();
        assert!(journal.calls.is_empty());
    }

    proptest! {
        #[test]
        fn failing_stage_unwinds_strictly_in_reverse(n in 1usize..12, k in 0usize..12) {
            let k = k % n;
            let mut stages = stages(n);
            stages[k].fail_commit = true;
            let mut journal = Journal::default();
            let result = Transaction::new("prop", stages).run(&mut journal);
            prop_assert!(result.is_err());

            let mut expected: Vec<Call> = (0..=k).map(Call::Commit).collect();
            expected.extend((0..k).rev().map(Call::Rollback));
            prop_assert_eq!(&journal.calls, &expected);
            prop_assert!(!journal.calls.contains(&Call::Rollback(k)));
            prop_assert!(journal.produced.is_empty());
        }

        #[test]
        fn full_commit_leaves_every_effect(n in 0usize..12) {
            let mut journal = Journal::default();
            Transaction::new("prop", stages(n)).run(&mut journal).unwrap();
            prop_assert_eq!(journal.produced, (0..n).collect::<Vec<_>>());
        }
    }
}
