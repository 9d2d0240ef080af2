//! Process transport: the non-blocking pipe surface a session drives.
//!
//! [`Transport`] is the seam between the engine and a server process. Every
//! call returns immediately; [`ProcessTransport`] achieves that by pumping the
//! child's pipes through tokio tasks and exposing channel ends.

use std::io;
use std::mem;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;

use crate::types::ServerConfig;

const READ_CHUNK_BYTES: usize = 8 * 1024;

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Non-blocking access to a language server process.
pub trait Transport {
    /// Queue bytes for the server's stdin. `Ok(n)` with `n < bytes.len()`
    /// is a partial write; `Ok(0)` means nothing was accepted.
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;
    /// Up to `max` bytes of stdout, or `None` when nothing is available yet.
    fn read_stdout(&mut self, max: usize) -> Option<Vec<u8>>;
    /// Up to `max` bytes of stderr, or `None` when nothing is available yet.
    fn read_stderr(&mut self, max: usize) -> Option<Vec<u8>>;
    fn running(&mut self) -> bool;
    fn kill(&mut self);
    /// Release the process without blocking: stdin is closed once queued
    /// bytes are written, and the process is killed if it has not exited
    /// within `grace`.
    fn close(&mut self, grace: Duration);
}

/// A spawned language server whose pipes are serviced by tokio tasks.
///
/// Must be created inside a tokio runtime.
pub struct ProcessTransport {
    /// `None` once handed off by [`Transport::close`].
    child: Option<Child>,
    stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
    stdout_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    stderr_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    stdout_pending: Vec<u8>,
    stderr_pending: Vec<u8>,
}

impl ProcessTransport {
    pub fn spawn(config: &ServerConfig, cwd: &Path) -> Result<Self> {
        let resolved_cmd = which::which(config.command())
            .with_context(|| format!("{} not found in PATH", config.command()))?;
        let mut cmd = Command::new(&resolved_cmd);
        cmd.args(config.args())
            .envs(&config.env)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", config.command()))?;

        let stdout = child.stdout.take().context("no stdout from child")?;
        let stderr = child.stderr.take().context("no stderr from child")?;
        let mut stdin = child.stdin.take().context("no stdin from child")?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(bytes) = stdin_rx.recv().await {
                if let Err(e) = stdin.write_all(&bytes).await {
                    tracing::warn!("LSP write error: {e}");
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    tracing::warn!("LSP flush error: {e}");
                    break;
                }
            }
        });

        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(stdout, stdout_tx, "stdout"));
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(stderr, stderr_tx, "stderr"));

        Ok(Self {
            child: Some(child),
            stdin_tx: Some(stdin_tx),
            stdout_rx,
            stderr_rx,
            stdout_pending: Vec::new(),
            stderr_pending: Vec::new(),
        })
    }
}

async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    stream: &'static str,
) {
    loop {
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                buf.truncate(n);
                if tx.send(buf).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("LSP {stream} read error: {e}");
                break;
            }
        }
    }
}

/// Collect up to `max` bytes from `pending` plus whatever the channel holds.
fn drain(
    pending: &mut Vec<u8>,
    rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    max: usize,
) -> Option<Vec<u8>> {
    while pending.len() < max {
        match rx.try_recv() {
            Ok(chunk) => pending.extend_from_slice(&chunk),
            Err(_) => break,
        }
    }
    if pending.is_empty() {
        return None;
    }
    let rest = if pending.len() > max {
        pending.split_off(max)
    } else {
        Vec::new()
    };
    Some(mem::replace(pending, rest))
}

impl Transport for ProcessTransport {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let Some(stdin_tx) = self.stdin_tx.as_ref() else {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "server stdin closed"));
        };
        match stdin_tx.try_send(bytes.to_vec()) {
            Ok(()) => Ok(bytes.len()),
            Err(TrySendError::Full(_)) => Ok(0),
            Err(TrySendError::Closed(_)) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "server stdin closed",
            )),
        }
    }

    fn read_stdout(&mut self, max: usize) -> Option<Vec<u8>> {
        drain(&mut self.stdout_pending, &mut self.stdout_rx, max)
    }

    fn read_stderr(&mut self, max: usize) -> Option<Vec<u8>> {
        drain(&mut self.stderr_pending, &mut self.stderr_rx, max)
    }

    fn running(&mut self) -> bool {
        self.child
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }

    fn kill(&mut self) {
        if let Some(child) = self.child.as_mut()
            && let Err(e) = child.start_kill()
        {
            tracing::debug!("LSP kill failed: {e}");
        }
    }

    fn close(&mut self, grace: Duration) {
        // Dropping the sender lets the writer task flush what is queued, then
        // drop stdin so the server sees EOF.
        self.stdin_tx = None;
        let Some(mut child) = self.child.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if timeout(grace, child.wait()).await.is_err() {
                        tracing::debug!("LSP server didn't exit in time, killing");
                        let _ = child.kill().await;
                    }
                });
            }
            Err(_) => {
                if let Err(e) = child.start_kill() {
                    tracing::debug!("LSP kill failed: {e}");
                }
            }
        }
    }
}
