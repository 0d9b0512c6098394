//! Process supervisor
//!
//! Launches every instance as a supervised child process and watches them
//! concurrently: one monitor task per instance, a single shared RunState
//! map behind one lock, and a watch channel as the run-wide shutdown
//! signal. Cancellation is cooperative-then-forceful: SIGTERM, a bounded
//! grace interval, then SIGKILL.

use crate::sandbox::LaunchSpec;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Lifecycle of one instance. Transitions are strictly forward:
/// pending -> launching -> running -> exited | failed, with failed also
/// reachable straight from launching when the spawn itself is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Launching,
    Running(u32),
    Exited(i32),
    Failed(String),
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Exited(_) | InstanceState::Failed(_))
    }
}

/// Run-scoped state map: instance ordinal -> lifecycle state. All
/// transitions are serialized through the single mutex; monitors never
/// hold the lock across an await point.
#[derive(Debug)]
pub struct RunState {
    states: Vec<InstanceState>,
}

impl RunState {
    pub fn new(count: usize) -> Self {
        RunState {
            states: vec![InstanceState::Pending; count],
        }
    }

    pub fn snapshot(&self) -> Vec<InstanceState> {
        self.states.clone()
    }

    fn transition(&mut self, ordinal: usize, next: InstanceState) {
        log::debug!(
            "Instance {}: {:?} -> {:?}",
            ordinal,
            self.states[ordinal],
            next
        );
        self.states[ordinal] = next;
    }
}

/// Whether one instance reaching a terminal state ends the whole run.
///
/// `WaitForAll` is the default: a crashed sibling never tears down a
/// healthy session. `AnyExitEndsRun` is for games where an orphaned solo
/// instance is useless and should be cleaned up with its sibling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitPolicy {
    #[default]
    WaitForAll,
    AnyExitEndsRun,
}

/// Terminal result of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceOutcome {
    Exited(i32),
    Failed(String),
}

/// Terminal result of the whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every instance reached a terminal state on its own.
    AllCompleted(Vec<InstanceOutcome>),
    /// The escalation policy ended the run because of this instance.
    AbortedByFailure { instance: usize, error: String },
    /// An external cancellation request ended the run.
    Cancelled,
}

/// Clonable handle external signal handling uses to request the
/// graceful-then-forceful shutdown of a run.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Creates a cancellation handle and the receiver a run observes.
pub fn cancel_channel() -> (CancelHandle, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, rx)
}

pub struct Supervisor {
    pub policy: ExitPolicy,
    pub grace: Duration,
}

impl Supervisor {
    pub fn new(policy: ExitPolicy, grace: Duration) -> Self {
        Supervisor { policy, grace }
    }

    /// Launches and monitors all instances, returning once every instance
    /// is terminal. No instance is left running after this returns.
    pub async fn run(
        &self,
        specs: Vec<LaunchSpec>,
        state: Arc<Mutex<RunState>>,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> RunOutcome {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cancelled = Arc::new(AtomicBool::new(false));
        // First instance to reach a terminal state under the escalation
        // policy; siblings terminated by the teardown are not the cause.
        let trigger: Trigger = Arc::new(Mutex::new(None));

        // Bridge the external cancellation signal into the internal
        // shutdown channel so every monitor observes it at its next wake-up.
        let bridge = {
            let shutdown_tx = shutdown_tx.clone();
            let cancelled = Arc::clone(&cancelled);
            tokio::spawn(async move {
                loop {
                    if cancel_rx.changed().await.is_err() {
                        return;
                    }
                    if *cancel_rx.borrow() {
                        log::info!("Cancellation requested, shutting the run down");
                        cancelled.store(true, Ordering::SeqCst);
                        let _ = shutdown_tx.send(true);
                        return;
                    }
                }
            })
        };

        let mut monitors = JoinSet::new();
        for spec in specs {
            let state = Arc::clone(&state);
            let shutdown_tx = shutdown_tx.clone();
            let shutdown_rx = shutdown_rx.clone();
            let trigger = Arc::clone(&trigger);
            let policy = self.policy;
            let grace = self.grace;
            monitors.spawn(async move {
                monitor_instance(spec, state, shutdown_tx, shutdown_rx, trigger, policy, grace)
                    .await;
            });
        }

        // The only hard synchronization point: all instances terminal.
        while let Some(joined) = monitors.join_next().await {
            if let Err(e) = joined {
                log::error!("Instance monitor task panicked: {}", e);
            }
        }
        bridge.abort();

        let states = match state.lock() {
            Ok(state) => state.snapshot(),
            Err(poisoned) => poisoned.into_inner().snapshot(),
        };
        let trigger = match trigger.lock() {
            Ok(mut trigger) => trigger.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        self.outcome_from(&states, trigger, cancelled.load(Ordering::SeqCst))
    }

    fn outcome_from(
        &self,
        states: &[InstanceState],
        trigger: Option<(usize, InstanceState)>,
        cancelled: bool,
    ) -> RunOutcome {
        if cancelled {
            return RunOutcome::Cancelled;
        }

        if let Some((instance, cause)) = trigger {
            let error = match cause {
                InstanceState::Failed(error) => Some(error),
                InstanceState::Exited(code) if code != 0 => {
                    Some(format!("instance exited with code {code}"))
                }
                // A clean exit ended the run by policy; that is not a failure.
                _ => None,
            };
            if let Some(error) = error {
                return RunOutcome::AbortedByFailure { instance, error };
            }
        }

        let outcomes = states
            .iter()
            .map(|state| match state {
                InstanceState::Exited(code) => InstanceOutcome::Exited(*code),
                InstanceState::Failed(error) => InstanceOutcome::Failed(error.clone()),
                // Unreachable: run() only returns after all monitors finish,
                // and every monitor records a terminal state.
                other => InstanceOutcome::Failed(format!("non-terminal state {other:?}")),
            })
            .collect();
        RunOutcome::AllCompleted(outcomes)
    }
}

type Trigger = Arc<Mutex<Option<(usize, InstanceState)>>>;

/// Records the escalation cause if no sibling recorded one first, then
/// flips the run-wide shutdown signal.
fn escalate(trigger: &Trigger, shutdown_tx: &watch::Sender<bool>, ordinal: usize, cause: &InstanceState) {
    {
        let mut trigger = match trigger.lock() {
            Ok(trigger) => trigger,
            Err(poisoned) => poisoned.into_inner(),
        };
        if trigger.is_none() {
            *trigger = Some((ordinal, cause.clone()));
        }
    }
    let _ = shutdown_tx.send(true);
}

async fn monitor_instance(
    spec: LaunchSpec,
    state: Arc<Mutex<RunState>>,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
    trigger: Trigger,
    policy: ExitPolicy,
    grace: Duration,
) {
    let ordinal = spec.ordinal;
    set_state(&state, ordinal, InstanceState::Launching);

    let mut child = match spawn_instance(&spec) {
        Ok(child) => child,
        Err(e) => {
            log::error!("Instance {}: failed to start: {}", ordinal, e);
            let failed = InstanceState::Failed(e);
            if policy == ExitPolicy::AnyExitEndsRun {
                escalate(&trigger, &shutdown_tx, ordinal, &failed);
            }
            set_state(&state, ordinal, failed);
            return;
        }
    };

    let pid = child.id().unwrap_or(0);
    log::info!("Instance {} running with PID {}", ordinal, pid);
    set_state(&state, ordinal, InstanceState::Running(pid));

    let (final_state, via_shutdown) = loop {
        tokio::select! {
            status = child.wait() => {
                let state = match status {
                    Ok(status) => InstanceState::Exited(exit_code(status)),
                    Err(e) => InstanceState::Failed(format!("wait failed: {e}")),
                };
                break (state, false);
            }
            changed = shutdown_rx.changed() => {
                match changed {
                    // Shutdown channel gone; nothing left to observe, so
                    // just wait the child out.
                    Err(_) => {
                        let state = match child.wait().await {
                            Ok(status) => InstanceState::Exited(exit_code(status)),
                            Err(e) => InstanceState::Failed(format!("wait failed: {e}")),
                        };
                        break (state, false);
                    }
                    Ok(()) if *shutdown_rx.borrow() => {
                        break (terminate(&mut child, ordinal, grace).await, true);
                    }
                    Ok(()) => continue,
                }
            }
        }
    };

    log::info!("Instance {} terminal: {:?}", ordinal, final_state);
    // Only an instance that terminated on its own can end the run; one torn
    // down by the shutdown it observed is an effect, not a cause.
    if policy == ExitPolicy::AnyExitEndsRun && !via_shutdown {
        escalate(&trigger, &shutdown_tx, ordinal, &final_state);
    }
    set_state(&state, ordinal, final_state);
}

fn spawn_instance(spec: &LaunchSpec) -> Result<Child, String> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(&spec.env)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    // Instance output goes to its per-run log file; stdout stays ours.
    match std::fs::File::create(&spec.log_file) {
        Ok(log_file) => {
            match log_file.try_clone() {
                Ok(clone) => {
                    command.stdout(Stdio::from(log_file));
                    command.stderr(Stdio::from(clone));
                }
                Err(e) => {
                    log::warn!(
                        "Instance {}: could not clone log handle ({}), discarding output",
                        spec.ordinal,
                        e
                    );
                    command.stdout(Stdio::null()).stderr(Stdio::null());
                }
            }
        }
        Err(e) => {
            log::warn!(
                "Instance {}: could not open log file {} ({}), discarding output",
                spec.ordinal,
                spec.log_file.display(),
                e
            );
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }

    command
        .spawn()
        .map_err(|e| format!("failed to spawn '{}': {e}", spec.program))
}

/// Cooperative-then-forceful: SIGTERM, bounded grace, then SIGKILL.
async fn terminate(child: &mut Child, ordinal: usize, grace: Duration) -> InstanceState {
    if let Some(pid) = child.id() {
        log::info!("Instance {}: sending SIGTERM to PID {}", ordinal, pid);
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => InstanceState::Exited(exit_code(status)),
        Ok(Err(e)) => InstanceState::Failed(format!("wait failed during shutdown: {e}")),
        Err(_) => {
            log::warn!(
                "Instance {}: did not exit within {:?}, sending SIGKILL",
                ordinal,
                grace
            );
            if let Err(e) = child.kill().await {
                return InstanceState::Failed(format!("SIGKILL failed: {e}"));
            }
            match child.wait().await {
                Ok(status) => InstanceState::Exited(exit_code(status)),
                Err(e) => InstanceState::Failed(format!("wait failed after SIGKILL: {e}")),
            }
        }
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

fn set_state(state: &Arc<Mutex<RunState>>, ordinal: usize, next: InstanceState) {
    match state.lock() {
        Ok(mut state) => state.transition(ordinal, next),
        Err(poisoned) => poisoned.into_inner().transition(ordinal, next),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn script(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).expect("failed to write script");
        let mut perms = fs::metadata(&path).expect("no metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("failed to chmod");
        path
    }

    fn spec(dir: &Path, ordinal: usize, program: &Path) -> LaunchSpec {
        LaunchSpec {
            ordinal,
            program: program.display().to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: dir.to_path_buf(),
            log_file: dir.join(format!("instance_{}.log", ordinal + 1)),
        }
    }

    #[tokio::test]
    async fn test_all_instances_complete() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let ok = script(dir.path(), "ok.sh", "#!/bin/sh\nexit 0\n");

        let specs = vec![spec(dir.path(), 0, &ok), spec(dir.path(), 1, &ok)];
        let state = Arc::new(Mutex::new(RunState::new(2)));
        let (_handle, cancel_rx) = cancel_channel();

        let supervisor = Supervisor::new(ExitPolicy::WaitForAll, Duration::from_secs(5));
        let outcome = supervisor.run(specs, Arc::clone(&state), cancel_rx).await;

        assert_eq!(
            outcome,
            RunOutcome::AllCompleted(vec![
                InstanceOutcome::Exited(0),
                InstanceOutcome::Exited(0)
            ])
        );
        assert!(state
            .lock()
            .unwrap()
            .snapshot()
            .iter()
            .all(InstanceState::is_terminal));
    }

    #[tokio::test]
    async fn test_crash_with_escalation_tears_down_sibling() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let crash = script(dir.path(), "crash.sh", "#!/bin/sh\nexit 3\n");
        let hang = script(dir.path(), "hang.sh", "#!/bin/sh\nsleep 600\n");

        let specs = vec![spec(dir.path(), 0, &crash), spec(dir.path(), 1, &hang)];
        let state = Arc::new(Mutex::new(RunState::new(2)));
        let (_handle, cancel_rx) = cancel_channel();

        let supervisor = Supervisor::new(ExitPolicy::AnyExitEndsRun, Duration::from_secs(5));
        let outcome = supervisor.run(specs, Arc::clone(&state), cancel_rx).await;

        match outcome {
            RunOutcome::AbortedByFailure { instance, ref error } => {
                assert_eq!(instance, 0);
                assert!(error.contains("code 3"), "unexpected error: {error}");
            }
            other => panic!("expected AbortedByFailure, got {other:?}"),
        }

        // The sibling was terminated, not orphaned: SIGTERM maps to 128+15.
        let states = state.lock().unwrap().snapshot();
        assert_eq!(states[0], InstanceState::Exited(3));
        assert_eq!(states[1], InstanceState::Exited(143));
    }

    #[tokio::test]
    async fn test_cancellation_terminates_everything() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let hang = script(dir.path(), "hang.sh", "#!/bin/sh\nsleep 600\n");

        let specs = vec![spec(dir.path(), 0, &hang), spec(dir.path(), 1, &hang)];
        let state = Arc::new(Mutex::new(RunState::new(2)));
        let (handle, cancel_rx) = cancel_channel();

        let supervisor = Supervisor::new(ExitPolicy::WaitForAll, Duration::from_secs(5));
        let run = supervisor.run(specs, Arc::clone(&state), cancel_rx);
        tokio::pin!(run);

        tokio::select! {
            _ = &mut run => panic!("run finished before cancellation"),
            _ = tokio::time::sleep(Duration::from_millis(300)) => handle.cancel(),
        }
        let outcome = run.await;

        assert_eq!(outcome, RunOutcome::Cancelled);
        let states = state.lock().unwrap().snapshot();
        assert!(states.iter().all(InstanceState::is_terminal));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_recorded_not_fatal() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let ok = script(dir.path(), "ok.sh", "#!/bin/sh\nexit 0\n");
        let missing = dir.path().join("no-such-binary");

        let specs = vec![spec(dir.path(), 0, &missing), spec(dir.path(), 1, &ok)];
        let state = Arc::new(Mutex::new(RunState::new(2)));
        let (_handle, cancel_rx) = cancel_channel();

        let supervisor = Supervisor::new(ExitPolicy::WaitForAll, Duration::from_secs(5));
        let outcome = supervisor.run(specs, Arc::clone(&state), cancel_rx).await;

        match outcome {
            RunOutcome::AllCompleted(outcomes) => {
                assert!(matches!(outcomes[0], InstanceOutcome::Failed(_)));
                assert_eq!(outcomes[1], InstanceOutcome::Exited(0));
            }
            other => panic!("expected AllCompleted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_forceful_kill_after_grace() {
        let dir = TempDir::new().expect("failed to create temp dir");
        // Ignores SIGTERM, so only the SIGKILL phase can end it.
        let stubborn = script(
            dir.path(),
            "stubborn.sh",
            "#!/bin/sh\ntrap '' TERM\nsleep 600\n",
        );

        let specs = vec![spec(dir.path(), 0, &stubborn)];
        let state = Arc::new(Mutex::new(RunState::new(1)));
        let (handle, cancel_rx) = cancel_channel();

        let supervisor = Supervisor::new(ExitPolicy::WaitForAll, Duration::from_millis(300));
        let run = supervisor.run(specs, Arc::clone(&state), cancel_rx);
        tokio::pin!(run);

        tokio::select! {
            _ = &mut run => panic!("run finished before cancellation"),
            _ = tokio::time::sleep(Duration::from_millis(300)) => handle.cancel(),
        }
        let outcome = run.await;

        assert_eq!(outcome, RunOutcome::Cancelled);
        // SIGKILL maps to 128+9.
        assert_eq!(state.lock().unwrap().snapshot()[0], InstanceState::Exited(137));
    }
}
