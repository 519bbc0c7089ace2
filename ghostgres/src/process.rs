//! Supervision of external PostgreSQL programs

use crate::error::{GhostgresError, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::debug;

/// Most recent server output kept for error reports
const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

/// PostgreSQL shutdown modes and the signals that request them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Wait for clients to disconnect (SIGTERM)
    Smart,
    /// Roll back open transactions and disconnect clients (SIGINT)
    Fast,
    /// Abort without a clean shutdown (SIGQUIT)
    Immediate,
}

impl ShutdownMode {
    pub fn signal(self) -> Signal {
        match self {
            Self::Smart => Signal::SIGTERM,
            Self::Fast => Signal::SIGINT,
            Self::Immediate => Signal::SIGQUIT,
        }
    }
}

/// How a supervised process ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited with status 0
    Exited,
    /// Terminated by the given signal, without an exit code
    Signaled(i32),
}

/// A running server process and its captured output
pub struct ServerProcess {
    program: PathBuf,
    child: Child,
    output: Arc<Mutex<Vec<u8>>>,
    drains: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ServerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerProcess")
            .field("program", &self.program)
            .field("pid", &self.child.id())
            .finish()
    }
}

impl ServerProcess {
    /// Launch `program`. Returns as soon as the OS has accepted the exec; it
    /// does not wait for the program to become ready.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(program: &Path, args: &[String]) -> Result<Self> {
        debug!("Spawning {:?} {:?}", program, args);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(program, e))?;

        let output = Arc::new(Mutex::new(Vec::new()));
        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drains.push(drain(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(drain(stderr, output.clone()));
        }

        Ok(Self {
            program: program.to_path_buf(),
            child,
            output,
            drains,
        })
    }

    /// OS process id, `None` once the process has been reaped
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Output captured so far (stdout and stderr interleaved)
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.output.lock()).into_owned()
    }

    /// Ask the process to shut down. Does not wait for it to exit.
    pub fn signal(&self, mode: ShutdownMode) -> Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        debug!("Sending {:?} to {:?} (pid {})", mode.signal(), self.program, pid);
        signal::kill(Pid::from_raw(pid as i32), mode.signal())?;
        Ok(())
    }

    /// Wait for the process to exit.
    ///
    /// A non-zero exit is an error carrying the captured output. Termination by
    /// a signal (the way a signalled shutdown ends) is a normal outcome.
    ///
    /// Cancel safe: dropping the future leaves the process running and
    /// supervised.
    pub async fn wait(&mut self) -> Result<ExitOutcome> {
        let status = self.child.wait().await?;
        for drain in std::mem::take(&mut self.drains) {
            let _ = drain.await;
        }

        if status.success() {
            debug!("{:?} exited cleanly", self.program);
            return Ok(ExitOutcome::Exited);
        }

        match (status.code(), status.signal()) {
            (None, Some(sig)) => {
                debug!("{:?} terminated by signal {}", self.program, sig);
                Ok(ExitOutcome::Signaled(sig))
            }
            _ => Err(GhostgresError::ExternalProcess {
                program: self.program.clone(),
                reason: status.to_string(),
                output: self.output(),
            }),
        }
    }
}

/// Run `program` to completion and return its combined stdout and stderr.
///
/// A spawn failure or non-zero exit is an error carrying the output.
pub async fn run_to_completion(program: &Path, args: &[String]) -> Result<String> {
    debug!("Running {:?} {:?}", program, args);

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| spawn_error(program, e))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        return Err(GhostgresError::ExternalProcess {
            program: program.to_path_buf(),
            reason: output.status.to_string(),
            output: combined,
        });
    }

    Ok(combined)
}

fn spawn_error(program: &Path, e: std::io::Error) -> GhostgresError {
    GhostgresError::ExternalProcess {
        program: program.to_path_buf(),
        reason: e.to_string(),
        output: String::new(),
    }
}

fn drain<R>(mut reader: R, sink: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut captured = sink.lock();
                    captured.extend_from_slice(&buf[..n]);
                    if captured.len() > MAX_CAPTURED_OUTPUT {
                        let excess = captured.len() - MAX_CAPTURED_OUTPUT;
                        captured.drain(..excess);
                    }
                }
            }
        }
    })
}
