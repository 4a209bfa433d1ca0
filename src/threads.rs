//! Deferred spawning and collection of `thread` blocks.
//!
//! A thread block is recorded as a [`ThreadRecord`] when the script reaches
//! it but is only handed to the worker at the next `wait`, so that every
//! module a block refers to exists before any thread starts. All records
//! buffered before that `wait` are spawned together, once, and each is then
//! joined by name.

use crate::matcher::{judge, Expectation, Verdict};
use crate::protocol::Response;
use crate::session::{SessionError, SessionId, WorkerSession};
use crate::value::WireArg;
use log::debug;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("worker refused thread {name}: {message}")]
    Refused { name: String, message: String },
    #[error("thread {name}: {results} results for {calls} calls")]
    Misaligned { name: String, calls: usize, results: usize },
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// One call queued inside a thread block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedCall {
    pub function: String,
    pub args: Vec<WireArg>,
    pub expectation: Expectation,
    /// Script line, for reporting.
    pub line: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    pub name: String,
    /// Session that runs the thread.
    pub session: SessionId,
    /// Module the calls target inside that session; `None` is its main module.
    pub module: Option<String>,
    pub calls: Vec<BufferedCall>,
}

impl ThreadRecord {
    pub fn new(name: impl Into<String>, session: SessionId, module: Option<String>) -> ThreadRecord {
        ThreadRecord {
            name: name.into(),
            session,
            module,
            calls: Vec::new(),
        }
    }
}

/// Threads waiting to be spawned and threads waiting to be joined.
#[derive(Debug, Default)]
pub struct ThreadOrchestrator {
    pending: Vec<ThreadRecord>,
    spawned: Vec<ThreadRecord>,
    /// Threads the worker never started; their calls are already failed.
    failed: Vec<String>,
}

impl ThreadOrchestrator {
    pub fn new() -> ThreadOrchestrator {
        ThreadOrchestrator::default()
    }

    pub fn buffer(&mut self, record: ThreadRecord) {
        debug!("thread {}: buffered {} calls", record.name, record.calls.len());
        self.pending.push(record);
    }

    /// Drain the pending queue, in the order the blocks were written.
    pub fn take_pending(&mut self) -> Vec<ThreadRecord> {
        std::mem::take(&mut self.pending)
    }

    pub fn mark_spawned(&mut self, record: ThreadRecord) {
        self.spawned.push(record);
    }

    /// Remove a spawned thread so it can be joined.
    pub fn take_spawned(&mut self, name: &str) -> Option<ThreadRecord> {
        let idx = self.spawned.iter().position(|r| r.name == name)?;
        Some(self.spawned.remove(idx))
    }

    pub fn mark_failed(&mut self, record: &ThreadRecord) {
        self.failed.push(record.name.clone());
    }

    /// Whether `name` failed to spawn; a later wait for it has nothing left
    /// to count.
    pub fn take_failed(&mut self, name: &str) -> bool {
        match self.failed.iter().position(|n| n == name) {
            Some(idx) => {
                self.failed.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Sessions still referenced by a thread that has not been joined.
    pub fn sessions(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.pending.iter().chain(&self.spawned).map(|r| r.session)
    }

    /// Forget everything, returning the threads that were never joined.
    pub fn clear(&mut self) -> Vec<ThreadRecord> {
        self.failed.clear();
        let mut left = std::mem::take(&mut self.pending);
        left.append(&mut self.spawned);
        left
    }
}

/// Hand a buffered thread to the worker.
pub fn spawn(session: &mut WorkerSession, record: &ThreadRecord, timeout: Duration) -> Result<(), ThreadError> {
    session.thread_begin(&record.name, record.module.as_deref())?;
    for call in &record.calls {
        session.thread_invoke(&call.function, &call.args)?;
    }
    match session.thread_end(timeout)? {
        Response::Ok(_) => Ok(()),
        Response::Error(message) => Err(ThreadError::Refused {
            name: record.name.clone(),
            message,
        }),
    }
}

/// Join a spawned thread and judge each call's result, in submission order.
pub fn collect(
    session: &mut WorkerSession,
    record: &ThreadRecord,
    timeout: Duration,
) -> Result<Vec<Verdict>, ThreadError> {
    let results = session.thread_wait(&record.name, timeout)?;
    judge_results(record, &results)
}

/// Pair each buffered call with its result. Calls the worker did not report
/// a result for fail; more results than calls means the worker and the
/// record disagree about what ran, so nothing can be trusted.
pub fn judge_results(record: &ThreadRecord, results: &[Response]) -> Result<Vec<Verdict>, ThreadError> {
    if results.len() > record.calls.len() {
        return Err(ThreadError::Misaligned {
            name: record.name.clone(),
            calls: record.calls.len(),
            results: results.len(),
        });
    }
    Ok(record
        .calls
        .iter()
        .enumerate()
        .map(|(i, call)| match results.get(i) {
            Some(response) => judge(response, &call.expectation),
            None if call.expectation == Expectation::None => Verdict::Unchecked,
            None => Verdict::Fail(format!("thread {}: no result for {}", record.name, call.function)),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Expected;

    fn record(name: &str, session: SessionId) -> ThreadRecord {
        let mut r = ThreadRecord::new(name, session, None);
        r.calls.push(BufferedCall {
            function: "inc".into(),
            args: vec![],
            expectation: Expectation::None,
            line: 1,
        });
        r
    }

    #[test]
    fn pending_drains_once_in_order() {
        let mut threads = ThreadOrchestrator::new();
        threads.buffer(record("T1", 0));
        threads.buffer(record("T2", 0));

        let batch = threads.take_pending();
        assert_eq!(batch.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), ["T1", "T2"]);
        assert!(threads.take_pending().is_empty());
    }

    #[test]
    fn spawned_threads_are_joined_by_name() {
        let mut threads = ThreadOrchestrator::new();
        threads.mark_spawned(record("T1", 0));
        threads.mark_spawned(record("T2", 1));
        assert_eq!(threads.sessions().collect::<Vec<_>>(), [0, 1]);

        assert_eq!(threads.take_spawned("T2").map(|r| r.session), Some(1));
        assert!(threads.take_spawned("T2").is_none());
        assert_eq!(threads.clear().len(), 1);
    }

    #[test]
    fn failed_spawns_are_remembered_once() {
        let mut threads = ThreadOrchestrator::new();
        threads.mark_failed(&record("T1", 0));
        assert!(threads.take_spawned("T1").is_none());
        assert!(threads.take_failed("T1"));
        assert!(!threads.take_failed("T1"));
        assert!(!threads.take_failed("T2"));
    }

    fn checked(function: &str, value: u64) -> BufferedCall {
        BufferedCall {
            function: function.into(),
            args: vec![],
            expectation: Expectation::Return(vec![Expected::Scalar(value)]),
            line: 2,
        }
    }

    #[test]
    fn results_pair_with_calls_in_order() {
        let mut r = record("T", 0);
        r.calls.push(checked("count", 1));
        r.calls.push(checked("count", 1));

        let results = [Response::Ok(vec![1]), Response::Ok(vec![1]), Response::Ok(vec![2])];
        let verdicts = judge_results(&r, &results).unwrap();
        assert_eq!(verdicts[..2], [Verdict::Unchecked, Verdict::Pass]);
        assert!(matches!(verdicts[2], Verdict::Fail(_)));

        // a missing checked result fails; a missing unchecked one does not
        let verdicts = judge_results(&r, &results[..1]).unwrap();
        assert_eq!(verdicts[0], Verdict::Unchecked);
        assert!(matches!(verdicts[1], Verdict::Fail(_)));
        assert!(matches!(&verdicts[2], Verdict::Fail(msg) if msg.contains("no result for count")));
    }

    #[test]
    fn surplus_results_are_rejected() {
        let r = record("T", 0);
        let results = [Response::Ok(vec![1]), Response::Ok(vec![2])];
        assert!(matches!(
            judge_results(&r, &results),
            Err(ThreadError::Misaligned { calls: 1, results: 2, .. })
        ));
    }
}
