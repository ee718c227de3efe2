//! One-shot test harness
//!
//! Drives a single test run in three strictly sequential phases:
//!
//! 1. bootstrap: build the runtime handle and the suite from the arguments
//! 2. execution: run the suite against the handle
//! 3. teardown: release the handle
//!
//! Teardown runs whenever bootstrap produced a handle, whatever the
//! execution phase did, and the handle is released at most once. The
//! execution and teardown outcomes are recorded independently and combined
//! into a [`RunStatus`]. Errors and panics in any phase are caught and
//! reported on stderr.

use std::fmt;
use std::panic::{AssertUnwindSafe, Location};

use async_trait::async_trait;
use futures_util::FutureExt;

use crate::common::{panic_message, Error, Result};
use crate::rpc::Communicator;

/// A runtime resource that must be released once the run is over
#[async_trait]
pub trait RuntimeHandle: Send + Sync {
    /// Whether the handle can still be used
    fn is_open(&self) -> bool;

    /// Release every resource held by the handle
    async fn destroy(&self) -> Result<()>;
}

#[async_trait]
impl RuntimeHandle for Communicator {
    fn is_open(&self) -> bool {
        !self.is_destroyed()
    }

    async fn destroy(&self) -> Result<()> {
        Communicator::destroy(self).await
    }
}

/// A test suite run against an open runtime handle
///
/// Returning `Ok(false)` and returning an error both fail the run.
#[async_trait]
pub trait TestSuite<R: RuntimeHandle>: Send {
    async fn run(&mut self, handle: &R) -> Result<bool>;
}

/// Owns the runtime handle between bootstrap and teardown
///
/// [`HandleGuard::release`] is the normal way out. A guard dropped without
/// it still drops the handle, so no exit path leaks it.
pub struct HandleGuard<R: RuntimeHandle> {
    handle: Option<R>,
}

impl<R: RuntimeHandle> HandleGuard<R> {
    pub fn new(handle: R) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// The guarded handle; `None` once released
    pub fn handle(&self) -> Option<&R> {
        self.handle.as_ref()
    }

    /// Destroy the handle
    ///
    /// Consumes the guard, so a second release cannot be attempted. A
    /// destroy that reports success but leaves the handle open is a failure.
    pub async fn release(mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle.destroy().await?;
        test(!handle.is_open())
    }
}

impl<R: RuntimeHandle> Drop for HandleGuard<R> {
    fn drop(&mut self) {
        if self.handle.take().is_some() {
            tracing::warn!("Runtime handle dropped without being released");
        }
    }
}

/// The harness's own assertion primitive
///
/// Fails with the caller's location when `condition` is false.
#[track_caller]
pub fn test(condition: bool) -> Result<()> {
    if condition {
        return Ok(());
    }
    let location = Location::caller();
    Err(Error::TestAssertion(format!(
        "{}:{}:{}",
        location.file(),
        location.line(),
        location.column()
    )))
}

/// Final outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    /// No handle was created; nothing was released
    BootstrapFailed,
    ExecutionFailed,
    TeardownFailed,
    ExecutionAndTeardownFailed,
}

impl RunStatus {
    /// Combine the outcomes of the execution and teardown phases
    pub fn from_phases(execution_ok: bool, teardown_ok: bool) -> Self {
        match (execution_ok, teardown_ok) {
            (true, true) => Self::Success,
            (false, true) => Self::ExecutionFailed,
            (true, false) => Self::TeardownFailed,
            (false, false) => Self::ExecutionAndTeardownFailed,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == Self::Success
    }

    /// Process exit code: 0 on success, 1 for any failure
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Bootstrap,
    Execution,
    Teardown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Bootstrap => write!(f, "bootstrap"),
            Phase::Execution => write!(f, "test execution"),
            Phase::Teardown => write!(f, "teardown"),
        }
    }
}

fn report_error(phase: Phase, error: &Error) {
    tracing::error!(phase = %phase, kind = ?error.kind(), "{}", error);
    eprintln!("error during {phase}: {error}");
}

fn report_panic(phase: Phase, payload: &(dyn std::any::Any + Send)) {
    let message = panic_message(payload);
    tracing::error!(phase = %phase, "Panicked: {}", message);
    eprintln!("panic during {phase}: {message}");
}

/// Run bootstrap, execution and teardown in order
///
/// `bootstrap` receives `args` and returns the handle together with the
/// suite to run against it.
pub async fn run<R, S, B>(args: Vec<String>, bootstrap: B) -> RunStatus
where
    R: RuntimeHandle,
    S: TestSuite<R>,
    B: FnOnce(Vec<String>) -> Result<(R, S)>,
{
    let (guard, mut suite) = match std::panic::catch_unwind(AssertUnwindSafe(|| bootstrap(args))) {
        Ok(Ok((handle, suite))) => (HandleGuard::new(handle), suite),
        Ok(Err(e)) => {
            report_error(Phase::Bootstrap, &e);
            return RunStatus::BootstrapFailed;
        }
        Err(payload) => {
            report_panic(Phase::Bootstrap, payload.as_ref());
            return RunStatus::BootstrapFailed;
        }
    };

    let execution_ok = execute(&guard, &mut suite).await;
    let teardown_ok = teardown(guard).await;

    let status = RunStatus::from_phases(execution_ok, teardown_ok);
    tracing::debug!(status = ?status, "Run finished");
    status
}

async fn execute<R, S>(guard: &HandleGuard<R>, suite: &mut S) -> bool
where
    R: RuntimeHandle,
    S: TestSuite<R>,
{
    let outcome = AssertUnwindSafe(async {
        let handle = guard
            .handle()
            .ok_or_else(|| Error::Internal("runtime handle already released".to_string()))?;
        test(handle.is_open())?;
        suite.run(handle).await
    })
    .catch_unwind()
    .await;

    match outcome {
        Ok(Ok(true)) => true,
        Ok(Ok(false)) => {
            tracing::error!(phase = %Phase::Execution, "Test suite reported failure");
            eprintln!("error during {}: test suite reported failure", Phase::Execution);
            false
        }
        Ok(Err(e)) => {
            report_error(Phase::Execution, &e);
            false
        }
        Err(payload) => {
            report_panic(Phase::Execution, payload.as_ref());
            false
        }
    }
}

async fn teardown<R: RuntimeHandle>(guard: HandleGuard<R>) -> bool {
    match AssertUnwindSafe(guard.release()).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            report_error(Phase::Teardown, &e);
            false
        }
        Err(payload) => {
            report_panic(Phase::Teardown, payload.as_ref());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Copy, PartialEq)]
    enum Destroy {
        Ok,
        Fail,
        Panic,
        LeaveOpen,
    }

    #[derive(Clone, Copy)]
    enum Outcome {
        Pass,
        ReturnFalse,
        Fail,
        Panic,
    }

    struct FakeHandle {
        destroys: Arc<AtomicUsize>,
        open: AtomicBool,
        on_destroy: Destroy,
    }

    #[async_trait]
    impl RuntimeHandle for FakeHandle {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn destroy(&self) -> Result<()> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            match self.on_destroy {
                Destroy::Ok => {
                    self.open.store(false, Ordering::SeqCst);
                    Ok(())
                }
                Destroy::Fail => Err(Error::ConnectionLost("tcp -h 127.0.0.1 -p 1".into())),
                Destroy::Panic => panic!("destroy exploded"),
                Destroy::LeaveOpen => Ok(()),
            }
        }
    }

    struct FakeSuite {
        outcome: Outcome,
        runs: Arc<AtomicUsize>,
        saw_open_handle: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TestSuite<FakeHandle> for FakeSuite {
        async fn run(&mut self, handle: &FakeHandle) -> Result<bool> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.saw_open_handle.store(handle.is_open(), Ordering::SeqCst);
            match self.outcome {
                Outcome::Pass => Ok(true),
                Outcome::ReturnFalse => Ok(false),
                Outcome::Fail => Err(Error::ConnectFailed {
                    endpoint: "tcp -h 127.0.0.1 -p 1".into(),
                    source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
                }),
                Outcome::Panic => panic!("suite exploded"),
            }
        }
    }

    struct Observed {
        status: RunStatus,
        destroys: usize,
        runs: usize,
        saw_open_handle: bool,
    }

    async fn run_with(outcome: Outcome, on_destroy: Destroy) -> Observed {
        let destroys = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let saw_open_handle = Arc::new(AtomicBool::new(false));

        let status = {
            let destroys = destroys.clone();
            let runs = runs.clone();
            let saw_open_handle = saw_open_handle.clone();
            run(Vec::new(), move |_args| {
                Ok((
                    FakeHandle {
                        destroys,
                        open: AtomicBool::new(true),
                        on_destroy,
                    },
                    FakeSuite {
                        outcome,
                        runs,
                        saw_open_handle,
                    },
                ))
            })
            .await
        };

        Observed {
            status,
            destroys: destroys.load(Ordering::SeqCst),
            runs: runs.load(Ordering::SeqCst),
            saw_open_handle: saw_open_handle.load(Ordering::SeqCst),
        }
    }

    #[tokio::test]
    async fn test_all_phases_succeed() {
        let observed = run_with(Outcome::Pass, Destroy::Ok).await;
        assert_eq!(observed.status, RunStatus::Success);
        assert_eq!(observed.status.exit_code(), 0);
        assert_eq!(observed.destroys, 1);
        assert!(observed.saw_open_handle);
    }

    #[tokio::test]
    async fn test_execution_failure_still_tears_down() {
        for outcome in [Outcome::ReturnFalse, Outcome::Fail, Outcome::Panic] {
            let observed = run_with(outcome, Destroy::Ok).await;
            assert_eq!(observed.status, RunStatus::ExecutionFailed);
            assert_eq!(observed.status.exit_code(), 1);
            assert_eq!(observed.destroys, 1);
        }
    }

    #[tokio::test]
    async fn test_teardown_failure_fails_successful_run() {
        for on_destroy in [Destroy::Fail, Destroy::Panic, Destroy::LeaveOpen] {
            let observed = run_with(Outcome::Pass, on_destroy).await;
            assert_eq!(observed.status, RunStatus::TeardownFailed);
            assert_eq!(observed.status.exit_code(), 1);
            assert_eq!(observed.destroys, 1);
        }
    }

    #[tokio::test]
    async fn test_both_failures_are_kept() {
        let observed = run_with(Outcome::Fail, Destroy::Fail).await;
        assert_eq!(observed.status, RunStatus::ExecutionAndTeardownFailed);
        assert_eq!(observed.status.exit_code(), 1);
        assert_eq!(observed.destroys, 1);
    }

    #[tokio::test]
    async fn test_bootstrap_failure_skips_everything() {
        let status = run::<FakeHandle, FakeSuite, _>(Vec::new(), |_args| {
            Err(Error::Config("malformed".into()))
        })
        .await;
        assert_eq!(status, RunStatus::BootstrapFailed);
        assert_eq!(status.exit_code(), 1);

        let status = run::<FakeHandle, FakeSuite, _>(Vec::new(), |_args| panic!("no config")).await;
        assert_eq!(status, RunStatus::BootstrapFailed);
    }

    #[tokio::test]
    async fn test_bootstrap_receives_args() {
        let args = vec!["--Rpc.Trace.Network=1".to_string(), "extra".to_string()];
        let mut received = Vec::new();
        let status = run::<FakeHandle, FakeSuite, _>(args.clone(), |passed| {
            received = passed;
            Err(Error::Config("stop here".into()))
        })
        .await;
        assert_eq!(status, RunStatus::BootstrapFailed);
        assert_eq!(received, args);
    }

    #[tokio::test]
    async fn test_closed_handle_is_not_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let destroys = Arc::new(AtomicUsize::new(0));
        let status = {
            let runs = runs.clone();
            let destroys = destroys.clone();
            run(Vec::new(), move |_args| {
                Ok((
                    FakeHandle {
                        destroys,
                        open: AtomicBool::new(false),
                        on_destroy: Destroy::Ok,
                    },
                    FakeSuite {
                        outcome: Outcome::Pass,
                        runs,
                        saw_open_handle: Arc::new(AtomicBool::new(false)),
                    },
                ))
            })
            .await
        };
        assert_eq!(status, RunStatus::ExecutionFailed);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_consumes_guard() {
        let destroys = Arc::new(AtomicUsize::new(0));
        let guard = HandleGuard::new(FakeHandle {
            destroys: destroys.clone(),
            open: AtomicBool::new(true),
            on_destroy: Destroy::Ok,
        });
        assert!(guard.handle().is_some());
        guard.release().await.unwrap();
        assert_eq!(destroys.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_assertion_primitive() {
        assert!(test(true).is_ok());
        match test(false) {
            Err(Error::TestAssertion(location)) => assert!(location.contains("harness")),
            other => panic!("Expected TestAssertion, got {:?}", other),
        }
    }

    #[test]
    fn test_status_combination() {
        assert_eq!(RunStatus::from_phases(true, true), RunStatus::Success);
        assert_eq!(RunStatus::from_phases(false, true), RunStatus::ExecutionFailed);
        assert_eq!(RunStatus::from_phases(true, false), RunStatus::TeardownFailed);
        assert_eq!(RunStatus::from_phases(false, false), RunStatus::ExecutionAndTeardownFailed);
    }
}
