//! Execution gateways to worker hosts.
//!
//! A gateway is a long-lived interpreter process on the target host: a local
//! subprocess for `localhost`, or `ssh <host> <interpreter>` otherwise. Both
//! speak the same minimal protocol: a POSIX shell snippet is written to the
//! process's stdin and a single line of output is read back.

use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{FleetError, Result};
use crate::infrastructure::runner::CommandRunner;
use crate::rig::host::HostIdentity;
use crate::rig::mirror::{mirror_tree, rsync_args, MirrorOptions, SyncFilter, SyncStats};


/// Prints the absolute home directory of the gateway process. Always prints
/// exactly one line; the directory need not exist.
const HOME_DIR_SCRIPT: &str = r#"h="${HOME:-${HOMEPATH:-.}}"; case "$h" in /*) printf '%s\n' "$h" ;; .) pwd ;; *) printf '%s/%s\n' "$(pwd)" "$h" ;; esac"#;

/// Deadline for one request/response round-trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long an exiting gateway gets before it is killed.
const EXIT_GRACE: Duration = Duration::from_millis(500);


// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayKind {
    /// Local subprocess.
    Local,
    /// Remote interpreter over ssh.
    Ssh,
}

/// Capability contract shared by every gateway implementation.
pub trait Gateway: Send + Sync {
    fn kind(&self) -> GatewayKind;

    /// Resolve the absolute home directory of the gateway's process. One
    /// blocking round-trip.
    fn home_dir(&self) -> Result<String>;

    /// Mirror the filtered `source` tree to `dest` on the gateway's host.
    fn mirror(
        &self,
        source: &Path,
        filter: &SyncFilter,
        dest: &str,
        opts: MirrorOptions,
    ) -> Result<SyncStats>;

    /// Whether worker processes can be spawned through this gateway.
    /// Stand-ins used in tests return `false`.
    fn supports_remote_exec(&self) -> bool {
        true
    }

    fn is_alive(&self) -> bool;

    /// Terminate the gateway process. Idempotent.
    fn exit(&self);
}

/// Opens gateways for host identities.
pub trait GatewayFactory: Send + Sync {
    fn open(&self, host: &HostIdentity, interpreter: &str) -> Result<Arc<dyn Gateway>>;
}


// ---------------------------------------------------------------------------
// ProcessGatewayFactory
// ---------------------------------------------------------------------------

/// Production factory: `PopenGateway` for `localhost`, `SshGateway` otherwise.
pub struct ProcessGatewayFactory {
    runner: Arc<dyn CommandRunner>,
}

impl ProcessGatewayFactory {
    /// `runner` executes rsync for ssh transfers.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        ProcessGatewayFactory { runner }
    }
}

impl GatewayFactory for ProcessGatewayFactory {
    fn open(&self, host: &HostIdentity, interpreter: &str) -> Result<Arc<dyn Gateway>> {
        if host.is_local() {
            Ok(Arc::new(PopenGateway::spawn(interpreter)?))
        } else {
            Ok(Arc::new(SshGateway::spawn(
                host.hostname(),
                interpreter,
                self.runner.clone(),
            )?))
        }
    }
}


// ---------------------------------------------------------------------------
// ProcessChannel
// ---------------------------------------------------------------------------

/// Line-oriented request/response over a child's stdin/stdout. Stdout is
/// drained by a reader thread so that every read can carry a deadline.
struct ProcessChannel {
    host: String,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    lines: Mutex<Receiver<String>>,
    timeout: Duration,
}

impl ProcessChannel {
    fn spawn(host: &str, mut command: Command, timeout: Duration) -> Result<Self> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| FleetError::Connection {
                host: host.to_string(),
                reason: format!("could not start gateway process: {}", e),
            })?;
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                return Err(FleetError::Connection {
                    host: host.to_string(),
                    reason: "gateway process has no stdio pipes".into(),
                });
            }
        };
        let lines = match spawn_reader(host, stdout) {
            Ok(lines) => lines,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(FleetError::Connection {
                    host: host.to_string(),
                    reason: format!("could not start gateway reader: {}", e),
                });
            }
        };
        Ok(ProcessChannel {
            host: host.to_string(),
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            lines: Mutex::new(lines),
            timeout,
        })
    }

    /// Send `script` and return the first line it prints.
    fn request(&self, script: &str) -> Result<String> {
        {
            let mut guard = self.stdin.lock().map_err(|_| self.lost("stdin lock poisoned"))?;
            let stdin = guard.as_mut().ok_or_else(|| self.lost("gateway already exited"))?;
            writeln!(stdin, "{}", script)
                .and_then(|_| stdin.flush())
                .map_err(|e| self.lost(&format!("write failed: {}", e)))?;
        }

        let received = self
            .lines
            .lock()
            .map_err(|_| self.lost("stdout lock poisoned"))?
            .recv_timeout(self.timeout);
        match received {
            Ok(line) => Ok(line.trim_end_matches(['\r', '\n']).to_string()),
            Err(RecvTimeoutError::Timeout) => Err(self.lost(&format!(
                "no response within {} ms",
                self.timeout.as_millis()
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                let detail = self.collect_stderr();
                Err(self.lost(&format!("gateway closed before responding: {}", detail)))
            }
        }
    }

    /// Stderr of a gateway that has exited (or been killed).
    fn collect_stderr(&self) -> String {
        let mut child = match self.child.lock() {
            Ok(child) => child,
            Err(_) => return String::new(),
        };
        if reap(&mut child, EXIT_GRACE).is_none() {
            let _ = child.kill();
            let _ = child.wait();
        }
        let mut err = String::new();
        if let Some(mut stderr) = child.stderr.take() {
            let _ = stderr.read_to_string(&mut err);
        }
        err.trim().to_string()
    }

    fn is_alive(&self) -> bool {
        match self.child.lock() {
            Ok(mut child) => matches!(child.try_wait(), Ok(None)),
            Err(_) => false,
        }
    }

    /// Close stdin, give the interpreter a moment to exit, then kill it.
    fn shutdown(&self) {
        if let Ok(mut stdin) = self.stdin.lock() {
            stdin.take();
        }
        if let Ok(mut child) = self.child.lock() {
            if reap(&mut child, EXIT_GRACE).is_none() {
                tracing::debug!("gateway to {} ignored eof, killing", self.host);
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }

    fn lost(&self, reason: &str) -> FleetError {
        FleetError::Connection {
            host: self.host.clone(),
            reason: reason.to_string(),
        }
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Forward each stdout line to the returned receiver until EOF.
fn spawn_reader(host: &str, stdout: ChildStdout) -> std::io::Result<Receiver<String>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("gateway-{}", host))
        .spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}

/// Poll `child` until it exits or `grace` elapses.
fn reap(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            _ => return None,
        }
    }
}


// ---------------------------------------------------------------------------
// PopenGateway
// ---------------------------------------------------------------------------

/// Gateway to an interpreter subprocess on the controller's own machine.
pub struct PopenGateway {
    channel: ProcessChannel,
}

impl PopenGateway {
    pub fn spawn(interpreter: &str) -> Result<Self> {
        let channel = ProcessChannel::spawn("localhost", Command::new(interpreter), REQUEST_TIMEOUT)?;
        tracing::debug!("spawned local gateway '{}'", interpreter);
        Ok(PopenGateway { channel })
    }
}

impl Gateway for PopenGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Local
    }

    fn home_dir(&self) -> Result<String> {
        self.channel.request(HOME_DIR_SCRIPT)
    }

    fn mirror(
        &self,
        source: &Path,
        filter: &SyncFilter,
        dest: &str,
        opts: MirrorOptions,
    ) -> Result<SyncStats> {
        mirror_tree(source, Path::new(dest), filter, opts).map_err(|e| FleetError::SyncTransfer {
            host: self.channel.host.clone(),
            message: e.to_string(),
        })
    }

    fn is_alive(&self) -> bool {
        self.channel.is_alive()
    }

    fn exit(&self) {
        self.channel.shutdown();
    }
}

impl fmt::Debug for PopenGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PopenGateway").finish()
    }
}


// ---------------------------------------------------------------------------
// SshGateway
// ---------------------------------------------------------------------------

/// Gateway to an interpreter on a remote host over ssh. Transfers go through
/// rsync, executed by the injected runner.
pub struct SshGateway {
    hostname: String,
    channel: ProcessChannel,
    runner: Arc<dyn CommandRunner>,
}

impl SshGateway {
    pub fn spawn(hostname: &str, interpreter: &str, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let mut command = Command::new("ssh");
        command.args(ssh_args(hostname, interpreter));
        let channel = ProcessChannel::spawn(hostname, command, REQUEST_TIMEOUT)?;
        tracing::debug!("spawned ssh gateway to {}", hostname);
        Ok(SshGateway {
            hostname: hostname.to_string(),
            channel,
            runner,
        })
    }
}

/// Arguments for `ssh` that start `interpreter` on `hostname` without ever
/// prompting.
fn ssh_args(hostname: &str, interpreter: &str) -> Vec<String> {
    vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "ConnectTimeout=10".to_string(),
        hostname.to_string(),
        interpreter.to_string(),
    ]
}

impl Gateway for SshGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Ssh
    }

    fn home_dir(&self) -> Result<String> {
        self.channel.request(HOME_DIR_SCRIPT)
    }

    fn mirror(
        &self,
        source: &Path,
        filter: &SyncFilter,
        dest: &str,
        opts: MirrorOptions,
    ) -> Result<SyncStats> {
        rsync_transfer(self.runner.as_ref(), &self.hostname, source, filter, dest, opts)
    }

    fn is_alive(&self) -> bool {
        self.channel.is_alive()
    }

    fn exit(&self) {
        self.channel.shutdown();
    }
}

/// Mirror `source` to `hostname:dest` with one rsync run through `runner`.
/// rsync output is not parsed, so the stats stay at zero.
fn rsync_transfer(
    runner: &dyn CommandRunner,
    hostname: &str,
    source: &Path,
    filter: &SyncFilter,
    dest: &str,
    opts: MirrorOptions,
) -> Result<SyncStats> {
    let args = rsync_args(source, filter, hostname, dest, opts);
    let output = runner
        .run("rsync", &args)
        .map_err(|message| FleetError::SyncTransfer {
            host: hostname.to_string(),
            message,
        })?;
    if opts.verbose {
        for line in output.lines() {
            tracing::info!(host = %hostname, "{}", line);
        }
    }
    Ok(SyncStats::default())
}

impl fmt::Debug for SshGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshGateway")
            .field("hostname", &self.hostname)
            .finish()
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
