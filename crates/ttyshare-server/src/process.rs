//! Process handle: one child process attached to a pseudo-terminal
//!
//! Spawning yields three independently owned parts:
//! - [`ProcessHandle`]: resize and input. Lives in the session state.
//! - the output reader, drained on a blocking thread by [`pump_output`]
//! - the child, owned by the output pump. It is reaped by
//!   [`wait_or_terminate`], which stops it once the session no longer wants it.

use crate::error::{RelayError, Result};
use bytes::Bytes;
#[cfg(not(unix))]
use portable_pty::ChildKiller;
use portable_pty::{Child, CommandBuilder, MasterPty, NativePtySystem, PtySize, PtySystem};
use std::future::Future;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use ttyshare_proto::TermSize;

/// Terminal type advertised to every spawned program
pub const TERM: &str = "xterm-256color";

/// Command line plus the environment it runs in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            working_dir: None,
            env: Vec::new(),
        }
    }

    /// Shell-quoted command line, for logs and narration
    pub fn display(&self) -> String {
        shell_words::join(&self.argv)
    }

    fn to_builder(&self) -> Result<CommandBuilder> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| RelayError::Spawn {
                command: String::new(),
                message: "empty command".to_string(),
            })?;

        let mut builder = CommandBuilder::new(program);
        builder.args(args);
        builder.env("TERM", TERM);
        for (key, value) in &self.env {
            builder.env(key, value);
        }

        let cwd = match &self.working_dir {
            Some(dir) => Some(dir.clone()),
            None => std::env::current_dir().ok(),
        };
        if let Some(cwd) = cwd {
            builder.cwd(cwd);
        }

        Ok(builder)
    }
}

/// Control side of a running process
pub struct ProcessHandle {
    master: Mutex<Box<dyn MasterPty + Send>>,
    input_tx: mpsc::Sender<Vec<u8>>,
    pid: Option<u32>,
}

/// Everything produced by [`spawn`]
pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    pub reader: Box<dyn Read + Send>,
    pub child: Box<dyn Child + Send + Sync>,
}

/// Spawn `command` on a fresh PTY of the given size
pub fn spawn(command: &CommandSpec, size: TermSize) -> Result<SpawnedProcess> {
    let shown = command.display();
    let spawn_err = |message: String| RelayError::Spawn {
        command: shown.clone(),
        message,
    };

    let pty_system = NativePtySystem::default();
    let pair = pty_system
        .openpty(pty_size(size))
        .map_err(|e| spawn_err(format!("openpty: {}", e)))?;

    let builder = command.to_builder()?;
    let child = pair
        .slave
        .spawn_command(builder)
        .map_err(|e| spawn_err(e.to_string()))?;
    // The reader only sees EOF once every slave handle is closed
    drop(pair.slave);

    let pid = child.process_id();
    info!("Spawned `{}` with PID {:?} at {}", shown, pid, size);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| spawn_err(format!("reader: {}", e)))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|e| spawn_err(format!("writer: {}", e)))?;

    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(256);
    tokio::task::spawn_blocking(move || {
        while let Some(data) = input_rx.blocking_recv() {
            if writer.write_all(&data).is_err() || writer.flush().is_err() {
                debug!("PTY writer closed");
                break;
            }
        }
    });

    Ok(SpawnedProcess {
        handle: ProcessHandle {
            master: Mutex::new(pair.master),
            input_tx,
            pid,
        },
        reader,
        child,
    })
}

fn pty_size(size: TermSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn resize(&self, size: TermSize) -> Result<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| RelayError::Pty("master lock poisoned".to_string()))?;
        master
            .resize(pty_size(size))
            .map_err(|e| RelayError::Pty(format!("resize failed: {}", e)))
    }

    /// Sender feeding the PTY writer thread
    pub fn input(&self) -> mpsc::Sender<Vec<u8>> {
        self.input_tx.clone()
    }
}

/// Drain `reader` on a blocking thread in reads of `read_size` bytes.
/// The receiver closes on EOF or read error.
pub fn pump_output(mut reader: Box<dyn Read + Send>, read_size: usize) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(64);
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; read_size.max(1)];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // EIO is how Linux reports a closed slave
                    debug!("PTY read ended: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

/// How often an unreaped child is checked for exit
const REAP_POLL: Duration = Duration::from_millis(50);

/// Reap a child, or stop it with [`terminate`] if `stop` resolves first.
/// Returns the exit code and whether the child had to be stopped.
pub async fn wait_or_terminate(
    mut child: Box<dyn Child + Send + Sync>,
    stop: impl Future<Output = ()>,
    grace: Duration,
) -> (i32, bool) {
    tokio::pin!(stop);
    let mut poll = tokio::time::interval(REAP_POLL);
    loop {
        tokio::select! {
            _ = poll.tick() => {
                if let Some(code) = try_reap(&mut child) {
                    return (code, false);
                }
            }
            _ = &mut stop => break,
        }
    }
    (terminate(child, grace).await, true)
}

/// Stop a child the session no longer wants and reap it.
///
/// The child leads its own process group. The group gets SIGHUP first; if it
/// is still running after `grace`, SIGKILL. Only this task reaps the child
/// and it signals only after seeing it unreaped, so the pid cannot have been
/// recycled.
pub async fn terminate(mut child: Box<dyn Child + Send + Sync>, grace: Duration) -> i32 {
    if let Some(code) = try_reap(&mut child) {
        return code;
    }
    signal(&mut child, false);

    let deadline = tokio::time::Instant::now() + grace;
    let mut forced = false;
    loop {
        tokio::time::sleep(REAP_POLL).await;
        if let Some(code) = try_reap(&mut child) {
            return code;
        }
        if !forced && tokio::time::Instant::now() >= deadline {
            warn!(
                "PID {:?} still running {:?} after hangup, killing",
                child.process_id(),
                grace
            );
            signal(&mut child, true);
            forced = true;
        }
    }
}

fn try_reap(child: &mut Box<dyn Child + Send + Sync>) -> Option<i32> {
    match child.try_wait() {
        Ok(Some(status)) => Some(status.exit_code() as i32),
        Ok(None) => None,
        Err(e) => {
            error!("Failed to wait for PID {:?}: {}", child.process_id(), e);
            Some(1)
        }
    }
}

fn signal(child: &mut Box<dyn Child + Send + Sync>, force: bool) {
    #[cfg(unix)]
    {
        let signal = if force { libc::SIGKILL } else { libc::SIGHUP };
        signal_group(child.process_id(), signal);
    }
    #[cfg(not(unix))]
    {
        let _ = force;
        if let Err(e) = child.kill() {
            debug!("Kill failed: {}", e);
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: libc::c_int) {
    let Some(pid) = pid else {
        return;
    };
    let pid = pid as libc::pid_t;
    // Whole group first, so helpers the program started go too
    let delivered = unsafe { libc::kill(-pid, signal) == 0 || libc::kill(pid, signal) == 0 };
    if !delivered {
        debug!(
            "Signal {} to PID {} failed: {}",
            signal,
            pid,
            std::io::Error::last_os_error()
        );
    }
}
