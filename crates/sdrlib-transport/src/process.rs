//! Child process supervision.
//!
//! [`ChildProcess`] wraps one launched process. A monitor task owns the
//! tokio [`Child`](tokio::process::Child): it forwards stdout lines to the
//! owner, sends every stderr line to `tracing` unmodified, kills the process
//! on request, and reports the exit status.
//!
//! [`ProcessSupervisor`] sits on top and applies the restart policy: at most
//! one live child, stale socket removal before every spawn, readiness
//! detection, and the killing/restart/quitting flags that decide what an
//! exit means.

use std::fmt;
use std::io::ErrorKind;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use sdrlib_core::error::{Error, Result};

/// How long to keep reading stdout after the process has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Target used for forwarded child stderr.
pub const CHILD_LOG_TARGET: &str = "sdrlib::child";

/// What to launch.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Short name used in log lines.
    pub name: String,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let name = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string());
        ProcessSpec {
            program,
            args: Vec::new(),
            name,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// How a process announces that it is ready for connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyMarker {
    /// A stdout line containing this text.
    Contains(String),
    /// Any stdout output at all.
    AnyOutput,
}

impl ReadyMarker {
    pub fn matches(&self, line: &str) -> bool {
        match self {
            ReadyMarker::Contains(marker) => line.contains(marker.as_str()),
            ReadyMarker::AnyOutput => true,
        }
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        ExitOutcome {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Something the monitor task observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One line of stdout.
    Stdout(String),
    /// The process is gone. Always the last event.
    Exited(ExitOutcome),
}

/// A launched process and its monitor task.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Option<u32>,
    name: String,
    events: mpsc::UnboundedReceiver<ProcessEvent>,
    kill_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    exited: bool,
}

impl ChildProcess {
    /// Launch `spec` with piped stdout/stderr.
    ///
    /// The process is killed if the handle (and with it the monitor task)
    /// is dropped.
    pub fn spawn(spec: &ProcessSpec) -> Result<Self> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!(program = %spec.program.display(), error = %e, "spawn failed");
                Error::Spawn(format!("{}: {e}", spec.program.display()))
            })?;

        let pid = child.id();
        info!(name = %spec.name, pid = ?pid, args = ?spec.args, "process launched");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (event_tx, events) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let name = spec.name.clone();

        let task = tokio::spawn(monitor(child, name.clone(), stdout, stderr, event_tx, kill_rx));

        Ok(ChildProcess {
            pid,
            name,
            events,
            kill_tx: Some(kill_tx),
            task,
            exited: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_exited(&self) -> bool {
        self.exited
    }

    /// Wait for the next stdout line or the exit.
    ///
    /// Cancellation-safe. Returns `None` once the exit has been delivered.
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        if self.exited {
            return None;
        }
        match self.events.recv().await {
            Some(ProcessEvent::Exited(outcome)) => {
                self.exited = true;
                Some(ProcessEvent::Exited(outcome))
            }
            Some(event) => Some(event),
            None => {
                // Monitor task ended without reporting; treat as an exit.
                self.exited = true;
                Some(ProcessEvent::Exited(ExitOutcome::default()))
            }
        }
    }

    /// Ask the monitor to SIGKILL the process. Repeated calls are no-ops.
    pub fn kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            debug!(name = %self.name, pid = ?self.pid, "killing process");
            let _ = tx.send(());
        }
    }

    /// Kill the process and wait until it has been reaped.
    ///
    /// Returns the exit outcome, or `None` if it had already been delivered
    /// through [`next_event`](Self::next_event).
    pub async fn terminate(mut self) -> Option<ExitOutcome> {
        self.kill();
        let mut outcome = None;
        while let Some(event) = self.next_event().await {
            if let ProcessEvent::Exited(o) = event {
                outcome = Some(o);
            }
        }
        let _ = (&mut self.task).await;
        outcome
    }
}

async fn monitor(
    mut child: tokio::process::Child,
    name: String,
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
    event_tx: mpsc::UnboundedSender<ProcessEvent>,
    mut kill_rx: oneshot::Receiver<()>,
) {
    let mut stdout = stdout.map(|s| BufReader::new(s).lines());
    let mut stderr = stderr.map(|s| BufReader::new(s).lines());
    let mut kill_requested = false;

    loop {
        tokio::select! {
            biased;

            // A dropped handle counts as a kill request.
            _ = &mut kill_rx, if !kill_requested => {
                kill_requested = true;
                if let Err(e) = child.start_kill() {
                    warn!(name = %name, error = %e, "kill failed");
                }
            }

            line = async { stdout.as_mut()?.next_line().await.ok().flatten() }, if stdout.is_some() => {
                match line {
                    Some(line) => {
                        let _ = event_tx.send(ProcessEvent::Stdout(line));
                    }
                    None => stdout = None,
                }
            }

            line = async { stderr.as_mut()?.next_line().await.ok().flatten() }, if stderr.is_some() => {
                match line {
                    Some(line) => tracing::info!(target: CHILD_LOG_TARGET, name = %name, "{line}"),
                    None => stderr = None,
                }
            }

            status = child.wait() => {
                let outcome = match status {
                    Ok(status) => ExitOutcome::from(status),
                    Err(e) => {
                        warn!(name = %name, error = %e, "wait failed");
                        ExitOutcome::default()
                    }
                };
                debug!(name = %name, %outcome, "process exited");
                if let Some(lines) = stdout.as_mut() {
                    // Output written just before exit may still be in the pipe.
                    let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
                        while let Ok(Some(line)) = lines.next_line().await {
                            let _ = event_tx.send(ProcessEvent::Stdout(line));
                        }
                    })
                    .await;
                }
                let _ = event_tx.send(ProcessEvent::Exited(outcome));
                break;
            }
        }
    }
}

/// Remove a leftover socket file so a new process can bind the path.
pub fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

/// What an exit means for the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitDecision {
    /// The exit was not asked for and should be surfaced as a device error.
    pub report_error: bool,
    /// The process should come back.
    pub restart: bool,
}

/// Something the supervisor wants its owner to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The readiness marker was seen. Delivered once per spawn.
    Ready,
    /// Stdout after readiness, or before it when it did not match.
    Output(String),
    /// The process ended; the supervisor holds no child any more.
    Exited {
        outcome: ExitOutcome,
        decision: ExitDecision,
    },
}

/// Restart policy around a single child process.
#[derive(Debug)]
pub struct ProcessSupervisor {
    spec: ProcessSpec,
    marker: ReadyMarker,
    socket: Option<PathBuf>,
    child: Option<ChildProcess>,
    ready: bool,
    killing: bool,
    restart: bool,
    quitting: bool,
    restart_at: Option<Instant>,
    spawn_count: u32,
}

impl ProcessSupervisor {
    pub fn new(spec: ProcessSpec, marker: ReadyMarker) -> Self {
        ProcessSupervisor {
            spec,
            marker,
            socket: None,
            child: None,
            ready: false,
            killing: false,
            restart: false,
            quitting: false,
            restart_at: None,
            spawn_count: 0,
        }
    }

    /// Socket path that belongs to the process and is removed before each
    /// spawn.
    pub fn with_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket = Some(path.into());
        self
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.pid())
    }

    /// Number of successful launches so far.
    pub fn spawn_count(&self) -> u32 {
        self.spawn_count
    }

    /// Launch the process.
    ///
    /// Fails with [`Error::AlreadyRunning`] while a child is live and with
    /// [`Error::Terminated`] after [`shutdown`](Self::shutdown).
    pub fn spawn(&mut self) -> Result<()> {
        if self.quitting {
            return Err(Error::Terminated);
        }
        if self.child.is_some() {
            return Err(Error::AlreadyRunning);
        }
        self.restart_at = None;
        if let Some(path) = &self.socket {
            remove_stale_socket(path)?;
        }
        let child = ChildProcess::spawn(&self.spec)?;
        self.child = Some(child);
        self.ready = false;
        self.killing = false;
        self.restart = false;
        self.spawn_count += 1;
        Ok(())
    }

    /// Deliberately kill the live process.
    ///
    /// The resulting exit is not reported as an error. With `restart` set
    /// the exit decision still asks for a restart.
    pub fn kill(&mut self, restart: bool) {
        self.restart |= restart;
        if let Some(child) = self.child.as_mut() {
            self.killing = true;
            child.kill();
        }
    }

    /// Decide what an exit means given the current flags.
    pub fn decide(&self) -> ExitDecision {
        ExitDecision {
            report_error: !self.killing,
            restart: !self.quitting && (self.restart || !self.killing),
        }
    }

    /// Wait for the next thing worth reacting to. Pending while no child is
    /// live. Cancellation-safe.
    pub async fn next_event(&mut self) -> SupervisorEvent {
        loop {
            let Some(child) = self.child.as_mut() else {
                return std::future::pending().await;
            };
            match child.next_event().await {
                Some(ProcessEvent::Stdout(line)) => {
                    if !self.ready && self.marker.matches(&line) {
                        self.ready = true;
                        debug!(name = %self.spec.name, line = %line, "process ready");
                        return SupervisorEvent::Ready;
                    }
                    return SupervisorEvent::Output(line);
                }
                Some(ProcessEvent::Exited(outcome)) => {
                    let decision = self.decide();
                    self.child = None;
                    self.ready = false;
                    if decision.report_error {
                        error!(name = %self.spec.name, %outcome, "process died");
                    } else {
                        info!(name = %self.spec.name, %outcome, "process stopped");
                    }
                    return SupervisorEvent::Exited { outcome, decision };
                }
                None => {
                    self.child = None;
                    continue;
                }
            }
        }
    }

    /// Arm the in-place restart timer.
    pub fn schedule_restart(&mut self, delay: Duration) {
        if !self.quitting {
            self.restart_at = Some(Instant::now() + delay);
        }
    }

    pub fn restart_pending(&self) -> bool {
        self.restart_at.is_some()
    }

    /// When the in-place restart is due, if one is armed. Cleared by the
    /// next [`spawn`](Self::spawn).
    pub fn restart_at(&self) -> Option<Instant> {
        self.restart_at
    }

    /// Stop for good: cancel any restart, kill the child, and wait for it
    /// to be reaped.
    pub async fn shutdown(&mut self) -> Option<ExitOutcome> {
        self.quitting = true;
        self.restart_at = None;
        self.ready = false;
        let outcome = match self.child.take() {
            Some(child) => {
                self.killing = true;
                child.terminate().await
            }
            None => None,
        };
        if let Some(path) = &self.socket {
            let _ = remove_stale_socket(path);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("/bin/sh").args(["-c", script])
    }

    #[test]
    fn spec_name_from_program() {
        let spec = ProcessSpec::new("/usr/local/bin/airspy_tcp").arg("-p");
        assert_eq!(spec.name, "airspy_tcp");
        assert_eq!(spec.args, vec!["-p"]);
    }

    #[test]
    fn ready_marker_matching() {
        let m = ReadyMarker::Contains("Listening".into());
        assert!(m.matches("airspy_tcp: Listening on /tmp/x.sock"));
        assert!(!m.matches("starting"));
        assert!(ReadyMarker::AnyOutput.matches(""));
    }

    #[test]
    fn exit_outcome_display() {
        let by_signal = ExitOutcome {
            code: None,
            signal: Some(9),
        };
        assert_eq!(by_signal.to_string(), "signal 9");
        let by_code = ExitOutcome {
            code: Some(3),
            signal: None,
        };
        assert_eq!(by_code.to_string(), "exit code 3");
        assert!(!by_code.success());
    }

    #[tokio::test]
    async fn child_reports_stdout_then_exit() {
        let mut child = ChildProcess::spawn(&sh("echo hello; exit 3")).unwrap();
        let mut lines = Vec::new();
        let mut outcome = None;
        while let Some(ev) = child.next_event().await {
            match ev {
                ProcessEvent::Stdout(l) => lines.push(l),
                ProcessEvent::Exited(o) => outcome = Some(o),
            }
        }
        assert_eq!(lines, vec!["hello"]);
        assert_eq!(outcome.unwrap().code, Some(3));
        assert!(child.has_exited());
    }

    #[tokio::test]
    async fn terminate_kills_and_reaps() {
        let child = ChildProcess::spawn(&sh("sleep 30")).unwrap();
        let outcome = child.terminate().await.unwrap();
        assert_eq!(outcome.signal, Some(9));
    }

    #[tokio::test]
    async fn spawn_missing_program_is_spawn_error() {
        let err = ChildProcess::spawn(&ProcessSpec::new("/nonexistent/sdr-bridge")).unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
    }

    #[tokio::test]
    async fn supervisor_ready_then_unexpected_exit() {
        let mut sup = ProcessSupervisor::new(
            sh("echo booting; echo Listening; exit 1"),
            ReadyMarker::Contains("Listening".into()),
        );
        sup.spawn().unwrap();
        assert_eq!(sup.next_event().await, SupervisorEvent::Output("booting".into()));
        assert_eq!(sup.next_event().await, SupervisorEvent::Ready);
        match sup.next_event().await {
            SupervisorEvent::Exited { outcome, decision } => {
                assert_eq!(outcome.code, Some(1));
                assert!(decision.report_error);
                assert!(decision.restart);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn supervisor_refuses_second_spawn() {
        let mut sup = ProcessSupervisor::new(sh("sleep 30"), ReadyMarker::AnyOutput);
        sup.spawn().unwrap();
        assert!(matches!(sup.spawn(), Err(Error::AlreadyRunning)));
        sup.shutdown().await;
        assert!(matches!(sup.spawn(), Err(Error::Terminated)));
    }

    #[tokio::test]
    async fn deliberate_kill_is_quiet_unless_restart_requested() {
        let mut sup = ProcessSupervisor::new(sh("sleep 30"), ReadyMarker::AnyOutput);
        sup.spawn().unwrap();
        sup.kill(false);
        match sup.next_event().await {
            SupervisorEvent::Exited { decision, .. } => {
                assert!(!decision.report_error);
                assert!(!decision.restart);
            }
            other => panic!("unexpected: {other:?}"),
        }

        sup.spawn().unwrap();
        sup.kill(true);
        match sup.next_event().await {
            SupervisorEvent::Exited { outcome, decision } => {
                assert_eq!(outcome.signal, Some(9));
                assert!(!decision.report_error);
                assert!(decision.restart);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(sup.spawn_count(), 2);
    }

    #[tokio::test]
    async fn spawn_removes_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("airspy-1:4.sock");
        std::fs::write(&sock, b"stale").unwrap();
        let mut sup =
            ProcessSupervisor::new(sh("sleep 30"), ReadyMarker::AnyOutput).with_socket(&sock);
        sup.spawn().unwrap();
        assert!(!sock.exists());
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn restart_timer_cleared_by_spawn_and_shutdown() {
        let mut sup = ProcessSupervisor::new(sh("sleep 30"), ReadyMarker::AnyOutput);
        sup.schedule_restart(Duration::from_millis(5000));
        assert!(sup.restart_pending());
        assert!(sup.restart_at().unwrap() > Instant::now());
        sup.spawn().unwrap();
        assert!(!sup.restart_pending());

        sup.schedule_restart(Duration::from_millis(5000));
        sup.shutdown().await;
        assert!(!sup.restart_pending());
        sup.schedule_restart(Duration::from_millis(5000));
        assert!(!sup.restart_pending());
    }

    #[test]
    fn remove_missing_socket_is_ok() {
        assert!(remove_stale_socket(Path::new("/tmp/sdrlib-definitely-missing.sock")).is_ok());
    }
}
