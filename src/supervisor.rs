//! Server process lifecycle.
//!
//! The `Supervisor` resolves an instance into a command line, spawns it with
//! piped standard streams, registers the live handle, starts the output relay
//! and waits for exit. Stopping only delivers an interrupt: the task that
//! waits on the process is the one that deregisters it, as soon as the exit
//! is reaped. Output still buffered in the pipes is relayed after that.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::Event;
use crate::instance::InstanceStore;
use crate::output::StreamKind;
use crate::registry::{ProcessHandle, ProcessRegistry, Registration};
use crate::relay::{self, RelayContext};
use crate::translate::Translator;

const GC_FLAG: &str = "-XX:+UseG1GC";
const NOGUI_FLAG: &str = "nogui";
// How long output readers may keep draining after the process exited.
const READER_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum StartError {
    #[error("no instance with id {0}")]
    UnknownInstance(String),
    #[error("no Java runtime for {0}: set java_path for the instance or globally")]
    NoRuntime(String),
    #[error("instance {0} is already running")]
    AlreadyRunning(String),
    #[error("failed to spawn {id}: {source}")]
    Spawn {
        id: String,
        source: std::io::Error,
    },
    #[error("failed to open {stream} pipe for {id}")]
    Pipe { id: String, stream: &'static str },
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// An interrupt was delivered; the process may still be running.
    Signalled { pid: u32 },
    /// Nothing is registered under that id.
    NotRunning,
    /// A server is registered but its process id is unknown, so it cannot be signalled.
    NoProcessId,
}

/// How a server run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub id: String,
    /// Exit code, or `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SupervisorOptions {
    /// Runtime used when an instance has none of its own.
    pub default_runtime: Option<PathBuf>,
    /// Remove ANSI escapes before translating output.
    pub strip_ansi: bool,
    /// Force-kill a stopped server that is still running after this long. Zero disables it.
    pub stop_grace: Duration,
}

/// Starts, stops and tracks server processes.
pub struct Supervisor {
    instances: Arc<InstanceStore>,
    registry: ProcessRegistry,
    translator: Arc<Translator>,
    options: SupervisorOptions,
    event_tx: mpsc::Sender<Event>,
}

impl Supervisor {
    pub fn new(
        instances: Arc<InstanceStore>,
        translator: Arc<Translator>,
        event_tx: mpsc::Sender<Event>,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            instances,
            registry: ProcessRegistry::new(),
            translator,
            options,
            event_tx,
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Ids of the servers currently running.
    pub fn running(&self) -> Vec<String> {
        self.registry.list()
    }

    /// Spawns a server and registers it without waiting for it to exit.
    ///
    /// `runtime_override` takes precedence over the instance's and the default runtime.
    pub async fn spawn(
        &self,
        id: &str,
        runtime_override: Option<&Path>,
    ) -> Result<RunningServer, StartError> {
        let mut instance = self
            .instances
            .get(id)
            .cloned()
            .ok_or_else(|| StartError::UnknownInstance(id.to_string()))?;
        let runtime = runtime_override
            .filter(|path| !path.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .or_else(|| resolve_runtime(&instance.java_path, self.options.default_runtime.as_deref()))
            .ok_or_else(|| StartError::NoRuntime(id.to_string()))?;
        let reservation = self
            .registry
            .reserve(id)
            .map_err(|_| StartError::AlreadyRunning(id.to_string()))?;

        instance.path = absolute(&instance.path);
        let runtime = if runtime.components().count() > 1 {
            absolute(&runtime)
        } else {
            runtime
        };
        let args = build_args(&instance.path, instance.memory, &instance.jvm_args);
        let _ = self
            .event_tx
            .send(Event::ServerStarting {
                name: instance.name.clone(),
                command: format_command(&runtime, &args),
            })
            .await;

        let mut command = Command::new(&runtime);
        command
            .args(&args)
            .current_dir(instance.working_dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                // Own process group, so the terminal's Ctrl-C reaches craftrack only,
                // and a default SIGINT disposition even if ours was inherited as ignored.
                let _ = libc::setpgid(0, 0);
                libc::signal(libc::SIGINT, libc::SIG_DFL);
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|source| StartError::Spawn {
            id: id.to_string(),
            source,
        })?;
        let pipe_error = |stream| StartError::Pipe {
            id: id.to_string(),
            stream,
        };
        let stdin = child.stdin.take().ok_or_else(|| pipe_error("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| pipe_error("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| pipe_error("stderr"))?;

        let pid = child.id();
        let handle = Arc::new(ProcessHandle::new(
            id,
            instance.name.clone(),
            pid,
            Some(Box::new(stdin)),
        ));
        // A failed registration drops `child`, which kills it.
        let registration = reservation
            .register(handle)
            .map_err(|_| StartError::AlreadyRunning(id.to_string()))?;
        tracing::info!(instance = %id, name = %instance.name, pid = ?pid, "server started");
        let _ = self
            .event_tx
            .send(Event::ServerStarted {
                name: instance.name.clone(),
                pid,
            })
            .await;

        let ctx = RelayContext {
            id: id.to_string(),
            name: instance.name.clone(),
            translator: self.translator.clone(),
            strip_ansi: self.options.strip_ansi,
            tx: self.event_tx.clone(),
        };
        let readers = vec![
            tokio::spawn(relay::read_stream(ctx.clone(), StreamKind::Stdout, stdout)),
            tokio::spawn(relay::read_stream(ctx, StreamKind::Stderr, stderr)),
        ];

        Ok(RunningServer {
            child,
            registration,
            readers,
            event_tx: self.event_tx.clone(),
        })
    }

    /// Runs a server to completion.
    ///
    /// When `input` is given, its lines are forwarded to the server's stdin
    /// until the caller sends `stop`, the input closes, or the server exits.
    pub async fn start(
        &self,
        id: &str,
        runtime_override: Option<&Path>,
        input: Option<&mut mpsc::Receiver<String>>,
    ) -> Result<ExitReport, StartError> {
        let server = self.spawn(id, runtime_override).await?;
        let Some(input) = input else {
            return Ok(server.wait().await);
        };
        let handle = server.handle();
        let exit = server.wait();
        tokio::pin!(exit);
        let report = tokio::select! {
            report = &mut exit => report,
            outcome = relay::forward_input(&handle, input) => {
                tracing::debug!(instance = %id, ?outcome, "input forwarding finished");
                exit.await
            }
        };
        Ok(report)
    }

    /// Delivers an interrupt to a running server. Does not wait for exit.
    pub async fn stop(&self, id: &str) -> StopOutcome {
        let Some(handle) = self.registry.lookup(id) else {
            tracing::info!(instance = %id, "stop requested but server is not running");
            return StopOutcome::NotRunning;
        };
        let Some(pid) = handle.pid() else {
            tracing::warn!(instance = %id, "stop requested but server has no process id");
            return StopOutcome::NoProcessId;
        };
        send_interrupt(pid);
        tracing::info!(instance = %id, pid, "interrupt sent");
        let _ = self
            .event_tx
            .send(Event::ServerSignalled {
                name: handle.name().to_string(),
            })
            .await;

        if !self.options.stop_grace.is_zero() {
            let registry = self.registry.clone();
            let grace = self.options.stop_grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if registry.is_current(&handle) {
                    tracing::warn!(
                        instance = %handle.instance_id(),
                        grace_ms = grace.as_millis() as u64,
                        "server ignored interrupt, killing"
                    );
                    handle.request_kill();
                }
            });
        }
        StopOutcome::Signalled { pid }
    }

    /// Stops every registered server. Returns how many were signalled.
    pub async fn stop_all(&self) -> usize {
        let mut signalled = 0;
        for id in self.registry.list() {
            if matches!(self.stop(&id).await, StopOutcome::Signalled { .. }) {
                signalled += 1;
            }
        }
        signalled
    }
}

/// A spawned, registered server whose exit has not been observed yet.
pub struct RunningServer {
    child: Child,
    registration: Registration,
    readers: Vec<JoinHandle<()>>,
    event_tx: mpsc::Sender<Event>,
}

impl RunningServer {
    pub fn handle(&self) -> Arc<ProcessHandle> {
        self.registration.handle().clone()
    }

    /// Waits for exit, deregisters, then lets the readers drain.
    pub async fn wait(self) -> ExitReport {
        let RunningServer {
            mut child,
            registration,
            readers,
            event_tx,
        } = self;
        let handle = registration.handle().clone();

        let status = tokio::select! {
            status = child.wait() => status,
            _ = handle.kill_requested() => {
                if let Err(err) = child.start_kill() {
                    tracing::debug!(instance = %handle.instance_id(), error = %err, "kill failed");
                }
                child.wait().await
            }
        };
        let code = match status {
            Ok(status) => status.code(),
            Err(err) => {
                tracing::warn!(instance = %handle.instance_id(), error = %err, "failed to wait for server");
                None
            }
        };
        // The pid is reaped now; stop must no longer find it.
        drop(registration);

        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(READER_DRAIN, reader).await.is_err() {
                tracing::debug!(instance = %handle.instance_id(), "output still open after exit");
                abort.abort();
            }
        }

        let id = handle.instance_id().to_string();
        let name = handle.name().to_string();
        tracing::info!(instance = %id, code = ?code, uptime_secs = handle.uptime().as_secs(), "server exited");
        let _ = event_tx
            .send(Event::ServerExited {
                name,
                code,
            })
            .await;
        ExitReport { id, code }
    }
}

/// Instance runtime if set, else the default; empty strings count as unset.
pub fn resolve_runtime(instance_runtime: &str, default: Option<&Path>) -> Option<PathBuf> {
    if !instance_runtime.trim().is_empty() {
        return Some(PathBuf::from(instance_runtime));
    }
    default
        .filter(|path| !path.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

/// JVM arguments: fixed heap, G1, the jar, `nogui`, then the extra arguments.
pub fn build_args(jar: &Path, memory: u32, extra: &str) -> Vec<String> {
    let heap = format!("{}M", memory);
    let mut args = vec![
        format!("-Xms{}", heap),
        format!("-Xmx{}", heap),
        GC_FLAG.to_string(),
        "-jar".to_string(),
        jar.to_string_lossy().into_owned(),
        NOGUI_FLAG.to_string(),
    ];
    args.extend(
        extra
            .split(' ')
            .filter(|token| !token.is_empty())
            .map(str::to_string),
    );
    args
}

pub fn format_command(runtime: &Path, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(1 + args.len());
    parts.push(runtime.to_string_lossy().into_owned());
    parts.extend(args.iter().cloned());
    shell_words::join(parts)
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(unix)]
fn send_interrupt(pid: u32) {
    let pid = pid as libc::pid_t;
    // Errors are ignored: the process may already be exiting.
    unsafe {
        if libc::kill(-pid, libc::SIGINT) != 0 {
            let _ = libc::kill(pid, libc::SIGINT);
        }
    }
}

#[cfg(windows)]
fn send_interrupt(pid: u32) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // CTRL_BREAK is the closest console signal to SIGINT for a new process group.
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(all(not(unix), not(windows)))]
fn send_interrupt(_pid: u32) {}
