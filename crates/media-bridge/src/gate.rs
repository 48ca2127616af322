//! Named-pipe handoff and readiness gating
//!
//! A consumer that attaches to a FIFO before any writer exists sees an
//! immediate end-of-stream. [`ReadinessGate`] opens the read side
//! non-blocking *before* the producer is launched and then waits, bounded,
//! until the producer has actually written something (or died trying).

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::process::ManagedProcess;

/// Longest single poll(2) while waiting on a gate
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Retry period while waiting for a FIFO reader to appear
const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Create a FIFO at `path` (mode 0600), replacing any non-FIFO file there
pub fn ensure_fifo(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => return Ok(()),
        Ok(_) => {
            debug!("Replacing non-FIFO file at {}", path.display());
            fs::remove_file(path)?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!("Cannot stat {}: {}, recreating", path.display(), e);
            let _ = fs::remove_file(path);
        }
    }

    mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| {
        BridgeError::stream_wiring(format!("mkfifo {} failed: {}", path.display(), e))
    })
}

/// Remove a FIFO, ignoring a missing file
pub fn remove_fifo(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed FIFO {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove FIFO {}: {}", path.display(), e),
    }
}

/// Wait up to `timeout` for `fd` to become readable (data or hang-up)
pub(crate) fn poll_readable<F: AsFd>(fd: &F, timeout: Duration) -> io::Result<bool> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    match poll(&mut fds, millis) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(fds[0]
            .revents()
            .map_or(false, |events| events.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))),
        Err(Errno::EINTR) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Switch a stream handle to non-blocking mode
pub(crate) fn set_nonblocking<F: AsRawFd>(fd: &F) -> Result<()> {
    let raw = fd.as_raw_fd();
    let flags = fcntl(raw, FcntlArg::F_GETFL)
        .map_err(|e| BridgeError::stream_wiring(format!("F_GETFL failed: {}", e)))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(raw, FcntlArg::F_SETFL(flags))
        .map_err(|e| BridgeError::stream_wiring(format!("F_SETFL O_NONBLOCK failed: {}", e)))?;
    Ok(())
}

/// Non-blocking guard handle on the read side of a FIFO
#[derive(Debug)]
pub struct ReadinessGate {
    path: PathBuf,
    guard: Option<File>,
}

impl ReadinessGate {
    /// Open the read side before the producer starts
    pub fn open_guard(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let guard = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .map_err(|e| {
                BridgeError::stream_wiring(format!(
                    "failed to open FIFO guard for {}: {}",
                    path.display(),
                    e
                ))
            })?;
        debug!("Opened FIFO guard on {}", path.display());
        Ok(Self {
            path,
            guard: Some(guard),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.guard.is_some()
    }

    /// Block until the FIFO is readable, the companion exits, or `timeout` elapses
    pub fn wait_readable(
        &self,
        timeout: Duration,
        mut companion: Option<&mut ManagedProcess>,
    ) -> Result<()> {
        let guard = self
            .guard
            .as_ref()
            .ok_or_else(|| BridgeError::invalid_state("FIFO guard already closed"))?;

        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(BridgeError::timeout(
                    format!("writer on FIFO {}", self.path.display()),
                    timeout,
                ));
            }

            if let Some(process) = companion.as_deref_mut() {
                if let Some(err) = process.exited_error() {
                    return Err(err);
                }
            }

            if poll_readable(guard, (deadline - now).min(POLL_SLICE))? {
                debug!("FIFO {} is readable", self.path.display());
                return Ok(());
            }
        }
    }

    /// Hand the guard over as the stream's read handle
    pub fn take_reader(&mut self) -> Option<File> {
        self.guard.take()
    }

    /// Close the guard; safe to call repeatedly
    pub fn close_guard(&mut self) {
        if self.guard.take().is_some() {
            debug!("Closed FIFO guard on {}", self.path.display());
        }
    }
}

/// Open the write side of a FIFO once its consumer has attached
///
/// The open is non-blocking and retried while no reader exists (ENXIO),
/// bounded by `timeout`, failing early if `consumer` exits.
pub fn open_fifo_writer(
    path: &Path,
    timeout: Duration,
    mut consumer: Option<&mut ManagedProcess>,
) -> Result<File> {
    let deadline = Instant::now() + timeout;
    loop {
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Ok(file) => {
                debug!("Opened FIFO writer on {}", path.display());
                return Ok(file);
            }
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {}
            Err(e) => {
                return Err(BridgeError::stream_wiring(format!(
                    "failed to open FIFO writer for {}: {}",
                    path.display(),
                    e
                )))
            }
        }

        if let Some(process) = consumer.as_deref_mut() {
            if let Some(err) = process.exited_error() {
                return Err(err);
            }
        }
        if Instant::now() >= deadline {
            return Err(BridgeError::timeout(
                format!("reader on FIFO {}", path.display()),
                timeout,
            ));
        }
        thread::sleep(OPEN_RETRY_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_ensure_fifo_replaces_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/call_1_mic.pcm");

        ensure_fifo(&path).unwrap();
        assert!(fs::metadata(&path).unwrap().file_type().is_fifo());
        // Idempotent
        ensure_fifo(&path).unwrap();

        remove_fifo(&path);
        fs::write(&path, b"stale").unwrap();
        ensure_fifo(&path).unwrap();
        assert!(fs::metadata(&path).unwrap().file_type().is_fifo());

        remove_fifo(&path);
        remove_fifo(&path);
        assert!(!path.exists());
    }

    #[test]
    fn test_guard_becomes_readable_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.pcm");
        ensure_fifo(&path).unwrap();

        let gate = ReadinessGate::open_guard(&path).unwrap();
        let mut writer = open_fifo_writer(&path, Duration::from_secs(1), None).unwrap();
        writer.write_all(&[1, 2, 3, 4]).unwrap();

        gate.wait_readable(Duration::from_secs(1), None).unwrap();
    }

    #[test]
    fn test_close_guard_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.pcm");
        ensure_fifo(&path).unwrap();

        let mut gate = ReadinessGate::open_guard(&path).unwrap();
        assert!(gate.is_open());
        gate.close_guard();
        gate.close_guard();
        assert!(!gate.is_open());
        assert!(matches!(
            gate.wait_readable(Duration::from_millis(10), None),
            Err(BridgeError::InvalidState(_))
        ));
    }

    #[test]
    fn test_writer_open_times_out_without_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orphan.pcm");
        ensure_fifo(&path).unwrap();

        let err = open_fifo_writer(&path, Duration::from_millis(100), None).unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }));
    }
}
