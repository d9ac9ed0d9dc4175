use crate::backend::{CancelToken, Launch, ProcessController, ServerHandle};
use crate::command::detach;
use crate::{describe_status, RuntimeError};
use esmbt_schema::{Project, Readiness};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long to wait for a process to disappear after a forced kill.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Graceful and forced termination primitives. `Ok(false)` means the request
/// was not delivered, either because the process is gone or because it was
/// refused.
#[derive(Clone, Copy)]
struct Signals {
    terminate: fn(u32) -> Result<bool, RuntimeError>,
    kill: fn(u32) -> Result<bool, RuntimeError>,
}

const PLATFORM_SIGNALS: Signals = Signals {
    terminate: signal::terminate,
    kill: signal::kill,
};

/// Drives the game-server process: spawn, readiness polling, graceful then
/// forced termination.
pub struct ServerController {
    project: Project,
    /// Children spawned by this controller, kept so they can be reaped.
    children: Mutex<HashMap<u32, Child>>,
    signals: Signals,
}

impl ServerController {
    pub fn new(project: Project) -> Self {
        Self {
            project,
            children: Mutex::new(HashMap::new()),
            signals: PLATFORM_SIGNALS,
        }
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.project.config.server.poll_interval_ms)
    }

    /// Log file receiving the server's stdout and stderr.
    pub fn console_log_path(&self) -> PathBuf {
        self.project
            .resolve(&self.project.config.build.output_dir)
            .join("server.log")
    }

    fn binary(&self) -> PathBuf {
        self.project.program(&self.project.config.server.binary)
    }

    fn args(&self, launch: &Launch<'_>) -> Vec<String> {
        let extension = launch.artifact.path.to_string_lossy();
        let extension_dir = launch
            .artifact
            .path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.project
            .config
            .server
            .args
            .iter()
            .map(|arg| {
                arg.replace("{extension}", &extension)
                    .replace("{extension_dir}", &extension_dir)
                    .replace("{env}", launch.environment.as_str())
                    .replace("{log_level}", launch.log_level.as_str())
            })
            .collect()
    }

    /// `Some(status)` once the process has exited, `None` while it runs.
    fn exit_status(&self, pid: u32) -> Result<Option<String>, RuntimeError> {
        let mut children = self
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(child) = children.get_mut(&pid) {
            return match child.try_wait()? {
                Some(status) => {
                    children.remove(&pid);
                    Ok(Some(describe_status(status)))
                }
                None => Ok(None),
            };
        }
        drop(children);
        if signal::is_alive(pid) {
            Ok(None)
        } else {
            Ok(Some("not running".to_owned()))
        }
    }

    fn wait_for_exit(&self, pid: u32, limit: Duration) -> Result<bool, RuntimeError> {
        let deadline = Instant::now() + limit;
        loop {
            if self.exit_status(pid)?.is_some() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(self.poll_interval().min(Duration::from_millis(100)));
        }
    }
}

impl ProcessController for ServerController {
    fn discover(&self) -> Result<Option<ServerHandle>, RuntimeError> {
        let Some(name) = self.project.config.server.process_name.as_deref() else {
            return Ok(None);
        };
        let found = signal::find_by_name(name)?;
        if let Some(pid) = found {
            info!("found running server '{name}' (pid {pid})");
        }
        Ok(found.map(ServerHandle::new))
    }

    fn stop(&self, handle: &ServerHandle) -> Result<(), RuntimeError> {
        let pid = handle.pid;
        if self.exit_status(pid)?.is_some() {
            debug!("pid {pid} is not running, nothing to stop");
            return Ok(());
        }

        info!("stopping server ({handle})");
        let grace = Duration::from_secs(self.project.config.server.stop_grace_secs);
        if (self.signals.terminate)(pid)? {
            if self.wait_for_exit(pid, grace)? {
                return Ok(());
            }
            warn!(
                "pid {pid} did not exit within {}s of SIGTERM, sending SIGKILL",
                grace.as_secs()
            );
        } else if self.exit_status(pid)?.is_some() {
            debug!("pid {pid} exited before SIGTERM");
            return Ok(());
        } else {
            warn!("graceful stop of pid {pid} was refused, forcing it");
        }
        (self.signals.kill)(pid)?;
        if self.wait_for_exit(pid, KILL_WAIT)? {
            return Ok(());
        }
        Err(RuntimeError::ProcessControl(format!(
            "pid {pid} is still running after SIGKILL"
        )))
    }

    fn start(
        &self,
        launch: &Launch<'_>,
        cancel: &CancelToken,
    ) -> Result<ServerHandle, RuntimeError> {
        let server = &self.project.config.server;
        let mut probe = Probe::new(&self.project, &server.readiness)?;

        let console = self.console_log_path();
        if let Some(parent) = console.parent() {
            fs::create_dir_all(parent)?;
        }
        let stdout = File::create(&console)?;
        let stderr = stdout.try_clone()?;

        let mut cmd = Command::new(self.binary());
        cmd.args(self.args(launch))
            .current_dir(self.project.resolve(&server.working_dir))
            .env("ESM_EXTENSION_PATH", &launch.artifact.path)
            .env("ESM_LOG_LEVEL", launch.log_level.as_str())
            .env("ESM_ENV", launch.environment.as_str())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        detach(&mut cmd);
        debug!("launching server: {cmd:?}");
        let child = cmd.spawn().map_err(|e| {
            RuntimeError::SpawnFailed(format!("{}: {e}", self.binary().display()))
        })?;
        let handle = ServerHandle::new(child.id());
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.pid, child);
        info!("server launched ({handle}), waiting for readiness");

        let timeout = Duration::from_secs(server.startup_timeout_secs);
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled {
                    handle: Some(handle),
                });
            }
            if let Some(status) = self.exit_status(handle.pid)? {
                return Err(RuntimeError::ServerExited { handle, status });
            }
            match probe.ready(started.elapsed()) {
                Ok(true) => {
                    info!("server ready after {:.1}s", started.elapsed().as_secs_f64());
                    return Ok(handle);
                }
                Ok(false) => {}
                // Probe errors are not fatal while the child runs.
                Err(e) => warn!("readiness probe failed: {e}"),
            }
            if started.elapsed() >= timeout {
                return Err(RuntimeError::StartupTimeout {
                    handle,
                    waited_secs: timeout.as_secs(),
                });
            }
            std::thread::sleep(self.poll_interval());
        }
    }
}

/// A readiness check with the state it needs between polls.
enum Probe {
    Log {
        path: PathBuf,
        pattern: String,
        offset: u64,
        pending: String,
    },
    Tcp {
        addrs: Vec<SocketAddr>,
    },
    Process {
        settle: Duration,
    },
}

impl Probe {
    fn new(project: &Project, readiness: &Readiness) -> Result<Self, RuntimeError> {
        Ok(match readiness {
            Readiness::Log { path, pattern } => {
                let path = project.resolve(path);
                // Only lines written after launch count.
                let offset = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                Probe::Log {
                    path,
                    pattern: pattern.clone(),
                    offset,
                    pending: String::new(),
                }
            }
            Readiness::Tcp { address } => {
                let addrs: Vec<SocketAddr> = address.to_socket_addrs()?.collect();
                if addrs.is_empty() {
                    return Err(RuntimeError::SpawnFailed(format!(
                        "readiness address '{address}' did not resolve"
                    )));
                }
                Probe::Tcp { addrs }
            }
            Readiness::Process { settle_ms } => Probe::Process {
                settle: Duration::from_millis(*settle_ms),
            },
        })
    }

    fn ready(&mut self, elapsed: Duration) -> Result<bool, RuntimeError> {
        match self {
            Probe::Log {
                path,
                pattern,
                offset,
                pending,
            } => Ok(log_contains(path, pattern, offset, pending)?),
            Probe::Tcp { addrs } => Ok(addrs.iter().any(|addr| {
                TcpStream::connect_timeout(addr, Duration::from_millis(500)).is_ok()
            })),
            Probe::Process { settle } => Ok(elapsed >= *settle),
        }
    }
}

/// Read whatever was appended to `path` since `offset` and look for `pattern`.
/// A partial trailing line is carried over in `pending`.
fn log_contains(
    path: &Path,
    pattern: &str,
    offset: &mut u64,
    pending: &mut String,
) -> std::io::Result<bool> {
    let mut file = match OpenOptions::new().read(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();
    if len < *offset {
        // Truncated or replaced since launch.
        *offset = 0;
        pending.clear();
    }
    file.seek(SeekFrom::Start(*offset))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    *offset += buf.len() as u64;
    pending.push_str(&String::from_utf8_lossy(&buf));

    if pending.lines().any(|line| line.contains(pattern)) {
        return Ok(true);
    }
    if let Some(idx) = pending.rfind('\n') {
        pending.drain(..=idx);
    }
    Ok(false)
}

#[cfg(unix)]
mod signal {
    use crate::RuntimeError;

    fn to_pid(pid: u32) -> Result<i32, RuntimeError> {
        i32::try_from(pid).map_err(|_| {
            RuntimeError::ProcessControl(format!("invalid pid {pid}: exceeds i32 range"))
        })
    }

    /// Send `sig`. `Ok(false)` when the process no longer exists.
    fn send(pid: u32, sig: i32, name: &str) -> Result<bool, RuntimeError> {
        let pid_i32 = to_pid(pid)?;
        // SAFETY: kill() with a validated pid and a constant signal number has no
        // memory-safety preconditions.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(pid_i32, sig) };
        if ret == 0 {
            return Ok(true);
        }
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() == Some(libc::ESRCH) {
            Ok(false)
        } else {
            Err(RuntimeError::ProcessControl(format!(
                "failed to send {name} to pid {pid}: {errno}"
            )))
        }
    }

    pub fn terminate(pid: u32) -> Result<bool, RuntimeError> {
        send(pid, libc::SIGTERM, "SIGTERM")
    }

    pub fn kill(pid: u32) -> Result<bool, RuntimeError> {
        send(pid, libc::SIGKILL, "SIGKILL")
    }

    pub fn is_alive(pid: u32) -> bool {
        let Ok(pid_i32) = i32::try_from(pid) else {
            return false;
        };
        // Zombies still accept signal 0; treat them as gone.
        if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            if let Some(state) = stat.rsplit(')').next().and_then(|s| s.trim().chars().next()) {
                return state != 'Z' && state != 'X';
            }
        }
        // SAFETY: signal 0 performs only the existence/permission check.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(pid_i32, 0) };
        ret == 0
            || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    /// First process (other than ourselves) whose command name is `name`.
    #[cfg(target_os = "linux")]
    pub fn find_by_name(name: &str) -> Result<Option<u32>, RuntimeError> {
        // The kernel truncates comm to 15 bytes.
        let wanted: String = name.chars().take(15).collect();
        let own = std::process::id();
        for entry in std::fs::read_dir("/proc")?.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            if pid == own {
                continue;
            }
            let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) else {
                continue;
            };
            if comm.trim_end() == wanted && is_alive(pid) {
                return Ok(Some(pid));
            }
        }
        Ok(None)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn find_by_name(name: &str) -> Result<Option<u32>, RuntimeError> {
        tracing::debug!("process discovery by name ('{name}') is only supported on Linux");
        Ok(None)
    }
}

#[cfg(windows)]
mod signal {
    use crate::RuntimeError;
    use std::process::Command;

    /// `Ok(false)` when taskkill did not deliver the request. Console
    /// processes refuse a plain `taskkill /PID`, so callers check liveness.
    fn taskkill(pid: u32, force: bool) -> Result<bool, RuntimeError> {
        let mut cmd = Command::new("taskkill");
        if force {
            cmd.args(["/F", "/T"]);
        }
        let output = cmd.args(["/PID", &pid.to_string()]).output()?;
        if !output.status.success() {
            tracing::debug!(
                "taskkill {pid}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.status.success())
    }

    pub fn terminate(pid: u32) -> Result<bool, RuntimeError> {
        taskkill(pid, false)
    }

    pub fn kill(pid: u32) -> Result<bool, RuntimeError> {
        taskkill(pid, true)
    }

    pub fn is_alive(pid: u32) -> bool {
        Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH"])
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }

    pub fn find_by_name(name: &str) -> Result<Option<u32>, RuntimeError> {
        let image = if name.to_ascii_lowercase().ends_with(".exe") {
            name.to_owned()
        } else {
            format!("{name}.exe")
        };
        let output = Command::new("tasklist")
            .args(["/FI", &format!("IMAGENAME eq {image}"), "/FO", "CSV", "/NH"])
            .output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().find_map(|line| {
            line.split(',')
                .nth(1)
                .and_then(|pid| pid.trim_matches('"').parse().ok())
        }))
    }
}
