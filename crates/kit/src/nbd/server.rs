//! `qemu-nbd` subprocess management
//!
//! An [`NbdServer`] exports one disk image over a private Unix socket for
//! the lifetime of the value. The server holds an exclusive lock on the
//! image, so the child is always reaped: explicitly via
//! [`NbdServer::shutdown`] after the client disconnected, or by `Drop`
//! (kill + wait) on any other exit path.

use std::io::{BufRead, BufReader, Read};
use std::os::unix::net::UnixStream;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use indicatif::ProgressBar;
use tracing::debug;

use super::Session;
use crate::common_opts::ImageFormat;
use crate::utils::wait_for_readiness;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Options controlling how the NBD server subprocess is launched.
#[derive(Parser, Debug, Clone)]
pub struct NbdServerOpts {
    /// Path to the qemu-nbd binary
    #[clap(long = "qemu-nbd", env = "VMKIT_QEMU_NBD", default_value = "qemu-nbd")]
    pub qemu_nbd: Utf8PathBuf,

    /// Disk image format (probed by qemu-nbd if not specified)
    #[clap(long)]
    pub format: Option<ImageFormat>,

    /// Seconds to wait for the server socket to appear, and for the server
    /// to exit after disconnecting
    #[clap(long, default_value_t = 30)]
    pub server_timeout: u64,
}

impl Default for NbdServerOpts {
    fn default() -> Self {
        Self {
            qemu_nbd: "qemu-nbd".into(),
            format: None,
            server_timeout: 30,
        }
    }
}

impl NbdServerOpts {
    fn timeout(&self) -> Duration {
        Duration::from_secs(self.server_timeout)
    }

    /// Build the server command line for `image`, listening on `socket`.
    fn command(&self, image: &Utf8Path, socket: &Utf8Path) -> Command {
        let mut cmd = Command::new(&self.qemu_nbd);
        cmd.arg(format!("--socket={socket}"));
        if let Some(format) = self.format {
            cmd.arg(format!("--format={format}"));
        }
        cmd.arg(image);
        cmd
    }
}

/// A running `qemu-nbd` exporting one image.
#[derive(Debug)]
pub struct NbdServer {
    child: Option<Child>,
    socket: Utf8PathBuf,
    timeout: Duration,
    drains: Vec<JoinHandle<()>>,
    // Holds the socket directory alive until the server is gone
    _tmpdir: tempfile::TempDir,
}

impl NbdServer {
    /// Launch the server for `image`.
    pub fn spawn(opts: &NbdServerOpts, image: &Utf8Path) -> Result<Self> {
        if !image.exists() {
            return Err(eyre!("Disk image does not exist: {image}"));
        }

        let tmpdir = tempfile::Builder::new()
            .prefix("vmkit-nbd")
            .tempdir()
            .context("Creating NBD socket directory")?;
        let socket = Utf8Path::from_path(tmpdir.path())
            .ok_or_else(|| eyre!("Temporary directory is not valid UTF-8"))?
            .join("nbd.sock");

        let mut cmd = opts.command(image, &socket);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!("Spawning NBD server: {cmd:?}");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to execute {}", opts.qemu_nbd))?;

        let mut drains = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            drains.push(drain("stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(drain("stderr", stderr));
        }

        Ok(Self {
            child: Some(child),
            socket,
            timeout: opts.timeout(),
            drains,
            _tmpdir: tmpdir,
        })
    }

    /// Connect to the server, waiting for its socket to accept connections,
    /// and perform the NBD handshake.
    pub fn connect(&mut self) -> Result<Session<UnixStream>> {
        let socket = self.socket.clone();
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| eyre!("NBD server already shut down"))?;

        let progress = ProgressBar::hidden();
        let (stream, elapsed) = wait_for_readiness(
            &progress,
            "Waiting for qemu-nbd",
            || {
                if let Some(status) = child.try_wait()? {
                    return Err(eyre!("NBD server exited before accepting connections: {status}"));
                }
                match UnixStream::connect(&socket) {
                    Ok(stream) => Ok(Some(stream)),
                    Err(e) => {
                        debug!("Connecting to {socket}: {e}");
                        Ok(None)
                    }
                }
            },
            self.timeout,
            POLL_INTERVAL,
        )?;
        debug!("Connected to NBD server after {}ms", elapsed.as_millis());

        Session::connect(stream).context("NBD handshake")
    }

    /// Wait for the server to exit after the client disconnected.
    ///
    /// The server is killed if it has not exited within the configured
    /// timeout.
    pub fn shutdown(mut self) -> Result<ExitStatus> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| eyre!("NBD server already shut down"))?;

        let waited = wait_for_readiness(
            &ProgressBar::hidden(),
            "Waiting for qemu-nbd to exit",
            || Ok(child.try_wait()?),
            self.timeout,
            POLL_INTERVAL,
        );
        let status = match waited {
            Ok((status, _)) => status,
            Err(e) => {
                debug!("NBD server did not exit on its own ({e}), killing it");
                reap(child)?
            }
        };
        // The child only leaves `self` once reaped; on error `Drop` retries
        self.child = None;
        self.join_drains();
        debug!("NBD server exited: {status}");
        Ok(status)
    }

    fn join_drains(&mut self) {
        for handle in self.drains.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for NbdServer {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            match reap(&mut child) {
                Ok(status) => debug!("Reaped NBD server: {status}"),
                Err(e) => tracing::warn!("Failed to reap NBD server: {e}"),
            }
            self.join_drains();
        }
    }
}

fn reap(child: &mut Child) -> Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }
    // Already-exited races are fine; wait() below reports the real status
    let _ = child.kill();
    child.wait().context("Waiting for NBD server")
}

/// Forward a child output stream to the log, line by line.
fn drain(name: &'static str, stream: impl Read + Send + 'static) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            match line {
                Ok(line) => debug!(target: "vmkit::nbd::server", "qemu-nbd {name}: {line}"),
                Err(_) => break,
            }
        }
    })
}
