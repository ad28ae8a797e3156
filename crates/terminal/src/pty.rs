//! PTY (pseudo-terminal) management
//!
//! Spawns the backing process of a terminal session and talks to it through
//! the PTY master.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use rustix::termios::{tcsetwinsize, Winsize};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open PTY: {0}")]
    Open(std::io::Error),

    #[error("failed to spawn process: {0}")]
    Spawn(std::io::Error),

    #[error("failed to set window size: {0}")]
    Winsize(rustix::io::Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn errno_to_io(e: rustix::io::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(e.raw_os_error())
}

/// What to run inside a new PTY
#[derive(Debug, Clone, Copy)]
pub struct PtyCommand<'a> {
    /// Command line run via `$SHELL -c`; `None` starts an interactive login shell
    pub command: Option<&'a str>,

    /// Working directory of the child
    pub working_dir: &'a Path,

    /// Extra environment, layered over the parent's environment
    pub env: &'a HashMap<String, String>,

    pub cols: u16,
    pub rows: u16,
}

/// PTY handle for a single session
pub struct Pty {
    /// Master side of PTY (for reading/writing)
    master: File,

    /// Child process
    child: Child,

    /// Current window size
    winsize: Winsize,

    /// Whether we've already detected the child exited
    exited: bool,
}

/// Open a master/slave pair sized to `winsize`, returning the master and the
/// slave path.
fn open_pair(winsize: Winsize) -> Result<(OwnedFd, String), PtyError> {
    let master_fd = rustix::pty::openpt(rustix::pty::OpenptFlags::RDWR | rustix::pty::OpenptFlags::NOCTTY)
        .map_err(|e| PtyError::Open(errno_to_io(e)))?;

    rustix::pty::grantpt(&master_fd).map_err(|e| PtyError::Open(errno_to_io(e)))?;
    rustix::pty::unlockpt(&master_fd).map_err(|e| PtyError::Open(errno_to_io(e)))?;

    let slave_name_buf = [0u8; 256];
    let slave_name = rustix::pty::ptsname(&master_fd, slave_name_buf)
        .map_err(|e| PtyError::Open(errno_to_io(e)))?;

    let slave_path = slave_name
        .to_str()
        .map_err(|_| {
            PtyError::Open(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "invalid PTY slave name",
            ))
        })?
        .to_string();

    tcsetwinsize(&master_fd, winsize).map_err(PtyError::Winsize)?;

    Ok((master_fd, slave_path))
}

impl Pty {
    /// Spawn a process attached to a fresh PTY
    pub fn spawn(spec: &PtyCommand<'_>) -> Result<Self, PtyError> {
        let winsize = Winsize {
            ws_row: spec.rows,
            ws_col: spec.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        let (master_fd, slave_path) = open_pair(winsize)?;

        let slave = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&slave_path)
            .map_err(PtyError::Open)?;

        // Each Stdio must own a distinct fd
        let slave_fd = slave.into_raw_fd();
        let slave_fd_out = unsafe { libc::dup(slave_fd) };
        let slave_fd_err = unsafe { libc::dup(slave_fd) };

        if slave_fd_out < 0 || slave_fd_err < 0 {
            unsafe {
                libc::close(slave_fd);
                if slave_fd_out >= 0 {
                    libc::close(slave_fd_out);
                }
            }
            return Err(PtyError::Open(std::io::Error::last_os_error()));
        }

        let shell = spec
            .env
            .get("SHELL")
            .cloned()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string());

        let mut cmd = Command::new(&shell);
        match spec.command {
            Some(command) => {
                cmd.arg("-c").arg(command);
            }
            None => {
                cmd.arg("-l");
            }
        }
        cmd.current_dir(spec.working_dir)
            .env("TERM", "xterm-256color")
            .envs(spec.env.iter());

        let child = unsafe {
            cmd.stdin(Stdio::from_raw_fd(slave_fd))
                .stdout(Stdio::from_raw_fd(slave_fd_out))
                .stderr(Stdio::from_raw_fd(slave_fd_err))
                .pre_exec(move || {
                    // New session with the slave as controlling terminal
                    libc::setsid();
                    libc::ioctl(slave_fd, libc::TIOCSCTTY, 0);
                    Ok(())
                })
                .spawn()
                .map_err(PtyError::Spawn)?
        };

        let master = File::from(master_fd);

        tracing::debug!(
            pid = child.id(),
            shell,
            command = ?spec.command,
            cols = spec.cols,
            rows = spec.rows,
            "spawned PTY process"
        );

        Ok(Self {
            master,
            child,
            winsize,
            exited: false,
        })
    }

    /// Resize the PTY and notify the child
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        tcsetwinsize(self.master.as_fd(), self.winsize).map_err(PtyError::Winsize)?;

        unsafe {
            libc::kill(self.child.id() as i32, libc::SIGWINCH);
        }

        Ok(())
    }

    /// Run `op` on the master with O_NONBLOCK set, restoring the flags afterwards
    fn with_nonblocking<T>(
        &mut self,
        op: impl FnOnce(&mut File) -> std::io::Result<T>,
    ) -> Result<std::io::Result<T>, PtyError> {
        let flags = rustix::fs::fcntl_getfl(self.master.as_fd()).map_err(errno_to_io)?;
        rustix::fs::fcntl_setfl(self.master.as_fd(), flags | rustix::fs::OFlags::NONBLOCK)
            .map_err(errno_to_io)?;

        let result = op(&mut self.master);

        rustix::fs::fcntl_setfl(self.master.as_fd(), flags).map_err(errno_to_io)?;
        Ok(result)
    }

    /// Read available data from PTY (non-blocking, 0 = nothing pending)
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, PtyError> {
        match self.with_nonblocking(|master| master.read(buf))? {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(PtyError::Io(e)),
        }
    }

    /// Write data to PTY (non-blocking)
    ///
    /// Returns the number of bytes written, 0 when the PTY buffer is full.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, PtyError> {
        match self.with_nonblocking(|master| master.write(data))? {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(PtyError::Io(e)),
        }
    }

    /// Process id of the child
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Check if child process is still running
    pub fn is_running(&mut self) -> bool {
        if self.exited {
            return false;
        }

        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.exited = true;
                tracing::debug!(?status, "PTY process exited");
                false
            }
            Err(e) => {
                self.exited = true;
                tracing::warn!(error = ?e, "error checking PTY process status");
                false
            }
        }
    }

    /// Get current window size as (cols, rows)
    pub fn winsize(&self) -> (u16, u16) {
        (self.winsize.ws_col, self.winsize.ws_row)
    }

    /// Terminate the child: SIGHUP first so shells can save history, then
    /// SIGKILL after a grace period.
    pub fn terminate(&mut self) {
        if self.exited {
            return;
        }

        let pid = self.child.id() as i32;
        unsafe {
            libc::kill(pid, libc::SIGHUP);
        }

        let start = std::time::Instant::now();
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => {
                    self.exited = true;
                    return;
                }
                Ok(None) => {
                    if start.elapsed() > std::time::Duration::from_millis(500) {
                        break;
                    }
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(_) => break,
            }
        }

        let _ = self.child.kill();
        let _ = self.child.wait();
        self.exited = true;
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        self.terminate();
    }
}
