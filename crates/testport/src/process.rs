//! Child server process: launch line, readiness detection, shutdown and
//! failure diagnostics.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use testport_core::atomic_io::write_file_set;
use testport_core::protocol::{
    PROP_AUTH_TOKEN, PROP_EXPECTED_SHA256, PROP_PROTOCOL_VERSION, PROP_SOCKET_PATH,
};
use testport_core::RuntimeManifest;
use thiserror::Error;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

pub const READY_MARKER_PREFIX: &str = "Done (";
pub const READY_MARKER_SUFFIX: &str = ")! For help, type \"help\"";
pub const OUTPUT_LOG_CAPACITY: usize = 10_000;
pub const DIAGNOSTIC_TAIL_LINES: usize = 40;
pub const DIAGNOSTICS_DIR_NAME: &str = "testport-diagnostics";
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_STATUS_GRACE: Duration = Duration::from_secs(2);

/// True for the vanilla "server is up" console line.
pub fn is_ready_line(line: &str) -> bool {
    match line.find(READY_MARKER_PREFIX) {
        Some(start) => line[start + READY_MARKER_PREFIX.len()..].contains(READY_MARKER_SUFFIX),
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub socket_path: PathBuf,
    pub protocol_version: String,
}

impl LaunchSpec {
    pub fn from_manifest(manifest: &RuntimeManifest, java: &Path) -> Self {
        let memory = format!("{}M", manifest.memory_mb);
        let args = vec![
            format!("-Xmx{memory}"),
            format!("-Xms{memory}"),
            format!("-D{PROP_SOCKET_PATH}={}", manifest.uds_socket_path.display()),
            format!("-D{PROP_AUTH_TOKEN}={}", manifest.agent_auth_token),
            format!("-D{PROP_PROTOCOL_VERSION}={}", manifest.runtime_protocol_version),
            format!("-D{PROP_EXPECTED_SHA256}={}", manifest.expected_agent_digest()),
            "-DIReallyKnowWhatIAmDoingISwear=true".to_string(),
            "-jar".to_string(),
            manifest.server_jar.display().to_string(),
            "--nogui".to_string(),
        ];
        Self {
            program: java.to_path_buf(),
            args,
            working_dir: manifest.server_directory.clone(),
            socket_path: manifest.uds_socket_path.clone(),
            protocol_version: manifest.runtime_protocol_version.clone(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyStopped,
    Graceful,
    Forced,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("server process is already {state}")]
    AlreadyRunning { state: ProcessState },
    #[error("server process handle is {state} and cannot be started again")]
    NotRestartable { state: ProcessState },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("server did not become ready within {timeout:?}; last output:\n{}", .tail.join("\n"))]
    StartupTimeout { timeout: Duration, tail: Vec<String> },
    #[error("server exited before becoming ready ({status}); last output:\n{}", .tail.join("\n"))]
    ExitedBeforeReady { status: String, tail: Vec<String> },
    #[error("failed to kill server process: {0}")]
    Kill(#[source] io::Error),
}

/// Bounded, shared console transcript of the child. Oldest lines are dropped first.
#[derive(Debug, Clone)]
pub struct OutputLog {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::with_capacity(OUTPUT_LOG_CAPACITY)
    }
}

impl OutputLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: Arc::default(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    pub fn tail(&self, count: usize) -> Vec<String> {
        let lines = self.lock();
        let skip = lines.len().saturating_sub(count);
        lines.iter().skip(skip).cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        match self.lines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

enum ReaderEvent {
    Ready,
    StdoutClosed,
}

pub struct ServerProcess {
    launch: LaunchSpec,
    diagnostics_root: PathBuf,
    state: ProcessState,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    readers: Vec<JoinHandle<()>>,
    output: OutputLog,
}

impl ServerProcess {
    /// Diagnostics land next to the server directory unless overridden.
    pub fn new(launch: LaunchSpec) -> Self {
        let diagnostics_root = default_diagnostics_root(&launch.working_dir);
        Self {
            launch,
            diagnostics_root,
            state: ProcessState::Idle,
            child: None,
            stdin: None,
            readers: Vec::new(),
            output: OutputLog::default(),
        }
    }

    pub fn with_diagnostics_root(mut self, root: PathBuf) -> Self {
        self.diagnostics_root = root;
        self
    }

    pub fn launch(&self) -> &LaunchSpec {
        &self.launch
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn output_snapshot(&self) -> Vec<String> {
        self.output.snapshot()
    }

    pub fn output_tail(&self, count: usize) -> Vec<String> {
        self.output.tail(count)
    }

    /// Spawns the server and blocks until its readiness line appears.
    pub fn start(&mut self, timeout: Duration) -> Result<(), ProcessError> {
        match self.state {
            ProcessState::Idle => {}
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping => {
                return Err(ProcessError::AlreadyRunning { state: self.state })
            }
            ProcessState::Stopped | ProcessState::Failed => {
                return Err(ProcessError::NotRestartable { state: self.state })
            }
        }

        self.state = ProcessState::Starting;
        info!(
            program = %self.launch.program.display(),
            working_dir = %self.launch.working_dir.display(),
            "server_process_starting"
        );

        let mut child = match self.launch.command().spawn() {
            Ok(child) => child,
            Err(source) => {
                self.state = ProcessState::Failed;
                return Err(ProcessError::Spawn {
                    program: self.launch.program.clone(),
                    source,
                });
            }
        };
        self.stdin = child.stdin.take();
        let (events, ready) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            self.spawn_reader("server-stdout", stdout, Some(events));
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_reader("server-stderr", stderr, None);
        }
        self.child = Some(child);

        match ready.recv_timeout(timeout) {
            Ok(ReaderEvent::Ready) => {
                self.state = ProcessState::Running;
                info!(pid = ?self.pid(), "server_process_ready");
                Ok(())
            }
            Ok(ReaderEvent::StdoutClosed) | Err(RecvTimeoutError::Disconnected) => {
                let status = self.wait_for_exit_status();
                self.write_diagnostics("startup-failure");
                self.abandon_child();
                warn!(status = %status, "server_process_exited_before_ready");
                Err(ProcessError::ExitedBeforeReady {
                    status,
                    tail: self.output.tail(DIAGNOSTIC_TAIL_LINES),
                })
            }
            Err(RecvTimeoutError::Timeout) => {
                self.write_diagnostics("startup-timeout");
                self.abandon_child();
                warn!(timeout = ?timeout, "server_process_startup_timeout");
                Err(ProcessError::StartupTimeout {
                    timeout,
                    tail: self.output.tail(DIAGNOSTIC_TAIL_LINES),
                })
            }
        }
    }

    /// Asks the server to `stop`, killing it when it does not exit within `timeout`.
    pub fn stop(&mut self, timeout: Duration) -> Result<StopOutcome, ProcessError> {
        let Some(mut child) = self.child.take() else {
            return Ok(StopOutcome::AlreadyStopped);
        };
        if let Ok(Some(status)) = child.try_wait() {
            self.stdin = None;
            self.join_readers();
            self.state = ProcessState::Stopped;
            info!(status = %status, "server_process_already_exited");
            return Ok(StopOutcome::AlreadyStopped);
        }

        self.state = ProcessState::Stopping;
        let requested = match self.stdin.take() {
            Some(mut stdin) => stdin.write_all(b"stop\n").and_then(|()| stdin.flush()),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "server stdin is not available",
            )),
        };

        let outcome = match requested {
            Ok(()) => match child.wait_timeout(timeout) {
                Ok(Some(status)) => {
                    info!(status = %status, "server_process_stopped");
                    StopOutcome::Graceful
                }
                Ok(None) => {
                    warn!(timeout = ?timeout, "server_process_stop_timeout");
                    self.force_kill(child)?;
                    StopOutcome::Forced
                }
                Err(error) => {
                    warn!(error = %error, "server_process_wait_failed");
                    self.force_kill(child)?;
                    StopOutcome::Forced
                }
            },
            Err(error) => {
                warn!(error = %error, "server_process_stop_request_failed");
                self.write_diagnostics("shutdown-failure");
                self.force_kill(child)?;
                StopOutcome::Forced
            }
        };

        self.join_readers();
        self.state = ProcessState::Stopped;
        Ok(outcome)
    }

    fn spawn_reader<R>(&mut self, name: &str, stream: R, events: Option<Sender<ReaderEvent>>)
    where
        R: Read + Send + 'static,
    {
        let output = self.output.clone();
        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut reader = BufReader::new(stream);
                let mut buffer = Vec::new();
                let mut signaled = false;
                loop {
                    buffer.clear();
                    match reader.read_until(b'\n', &mut buffer) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                    let line = decode_output_line(&buffer);
                    let ready = !signaled && is_ready_line(&line);
                    output.push(line);
                    if ready {
                        signaled = true;
                        if let Some(events) = &events {
                            let _ = events.send(ReaderEvent::Ready);
                        }
                    }
                }
                if let Some(events) = &events {
                    let _ = events.send(ReaderEvent::StdoutClosed);
                }
            });
        match spawned {
            Ok(handle) => self.readers.push(handle),
            Err(error) => warn!(reader = name, error = %error, "server_output_reader_unavailable"),
        }
    }

    fn wait_for_exit_status(&mut self) -> String {
        let Some(child) = self.child.as_mut() else {
            return "unknown status".to_string();
        };
        match child.wait_timeout(EXIT_STATUS_GRACE) {
            Ok(Some(status)) => describe_status(status),
            Ok(None) => "stdout closed while process kept running".to_string(),
            Err(error) => format!("status unavailable: {error}"),
        }
    }

    /// Kills a child that failed to start and marks the handle failed.
    fn abandon_child(&mut self) {
        self.stdin = None;
        if let Some(child) = self.child.take() {
            if let Err(error) = self.force_kill(child) {
                warn!(error = %error, "server_process_kill_failed");
            }
        }
        self.join_readers();
        self.state = ProcessState::Failed;
    }

    fn force_kill(&mut self, mut child: Child) -> Result<(), ProcessError> {
        let killed = child.kill();
        self.settle_kill(child, killed)
    }

    /// A child that survives the kill stays owned by the handle.
    fn settle_kill(&mut self, mut child: Child, killed: io::Result<()>) -> Result<(), ProcessError> {
        if let Err(error) = killed {
            if !matches!(child.try_wait(), Ok(Some(_))) {
                warn!(pid = child.id(), error = %error, "server_process_kill_failed");
                self.state = ProcessState::Failed;
                self.child = Some(child);
                return Err(ProcessError::Kill(error));
            }
        }
        let _ = child.wait();
        debug!("server_process_killed");
        Ok(())
    }

    fn join_readers(&mut self) {
        let deadline = Instant::now() + READER_JOIN_TIMEOUT;
        while self.readers.iter().any(|reader| !reader.is_finished()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        for reader in self.readers.drain(..) {
            if reader.is_finished() {
                let _ = reader.join();
            } else {
                warn!("server_output_reader_detached");
            }
        }
    }

    /// Best effort; a failed write is logged and otherwise ignored.
    pub fn write_diagnostics(&self, reason: &str) -> Option<PathBuf> {
        match write_bundle(&self.diagnostics_root, reason, &self.launch, &self.output) {
            Ok(bundle) => {
                info!(bundle = %bundle.display(), reason, "diagnostics_bundle_written");
                Some(bundle)
            }
            Err(error) => {
                warn!(reason, error = %error, "diagnostics_bundle_failed");
                None
            }
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Undecodable bytes become U+FFFD; the line terminator is dropped.
fn decode_output_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => status.to_string(),
    }
}

pub fn default_diagnostics_root(server_dir: &Path) -> PathBuf {
    server_dir
        .parent()
        .unwrap_or(server_dir)
        .join(DIAGNOSTICS_DIR_NAME)
}

fn write_bundle(
    root: &Path,
    reason: &str,
    launch: &LaunchSpec,
    output: &OutputLog,
) -> io::Result<PathBuf> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
    let mut bundle = root.join(format!("bundle-{stamp}"));
    let mut suffix = 1;
    while bundle.exists() {
        bundle = root.join(format!("bundle-{stamp}-{suffix}"));
        suffix += 1;
    }

    let mut log = output.snapshot().join("\n");
    if !log.is_empty() {
        log.push('\n');
    }
    let files = [
        ("reason.txt", format!("{reason}\n")),
        (
            "manifest-server-dir.txt",
            format!("{}\n", launch.working_dir.display()),
        ),
        (
            "manifest-socket-path.txt",
            format!("{}\n", launch.socket_path.display()),
        ),
        (
            "manifest-protocol-version.txt",
            format!("{}\n", launch.protocol_version),
        ),
        ("server-output.log", log),
    ];
    write_file_set(&bundle, &files)?;
    Ok(bundle)
}
