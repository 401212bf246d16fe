// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent app-server subprocess lifecycle.
//!
//! Spawns the agent binary in app-server mode, wires its stdio pipes into an
//! [`RpcClient`], and keeps a bounded tail of stderr for post-mortem
//! diagnostics.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::debug;

use super::client::RpcClient;

/// Maximum number of stderr bytes retained per subprocess.
const STDERR_CAPACITY: usize = 64 * 1024;

/// Configures how the app-server process is started.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Path to the agent binary.
    pub binary: PathBuf,
    /// Transport address (default `stdio://`).
    pub listen_addr: String,
}

impl SpawnOptions {
    /// Spawn options for a binary with the default stdio transport.
    pub fn new(binary: impl AsRef<Path>) -> Self {
        Self {
            binary: binary.as_ref().to_path_buf(),
            listen_addr: "stdio://".to_string(),
        }
    }
}

/// A running app-server subprocess with an attached JSON-RPC client.
pub struct AppServerProcess {
    child: Child,
    client: RpcClient,
    stderr: Arc<Mutex<Vec<u8>>>,
}

impl AppServerProcess {
    /// Start the subprocess and attach a client to its stdio pipes.
    pub fn spawn(opts: SpawnOptions) -> std::io::Result<Self> {
        let mut child = Command::new(&opts.binary)
            .arg("app-server")
            .arg("--listen")
            .arg(&opts.listen_addr)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "missing stdin pipe")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "missing stdout pipe")
        })?;
        let stderr_pipe = child.stderr.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "missing stderr pipe")
        })?;

        let stderr = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::clone(&stderr);
        tokio::spawn(async move {
            let mut pipe = stderr_pipe;
            let mut chunk = [0u8; 4096];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut buf = stderr_buf.lock().await;
                        buf.extend_from_slice(&chunk[..n]);
                        // Keep only the tail once over capacity.
                        if buf.len() > STDERR_CAPACITY {
                            let excess = buf.len() - STDERR_CAPACITY;
                            buf.drain(..excess);
                        }
                    }
                }
            }
        });

        let client = RpcClient::new(stdin, stdout);
        debug!(binary = %opts.binary.display(), "spawned app-server process");

        Ok(Self {
            child,
            client,
            stderr,
        })
    }

    /// The JSON-RPC client attached to this process.
    pub fn client(&self) -> RpcClient {
        self.client.clone()
    }

    /// Captured stderr output from the subprocess.
    pub async fn stderr(&self) -> String {
        let buf = self.stderr.lock().await;
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Shut down the process by closing its stdin (signalling EOF to the
    /// child) and waiting for it to exit.
    pub async fn close(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.client.close().await;
        self.child.wait().await
    }
}
