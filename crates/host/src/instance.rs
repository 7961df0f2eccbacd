//! Single-instance guard and startup signal
//!
//! The instance lock is an `flock(2)`-held file under the runtime directory.
//! The kernel drops the lock when the holder exits, so a crashed host never
//! blocks the next one. The startup signal is a marker file written once the
//! host is fully started and removed on shutdown; external tools wait for it
//! with [`StartupSignal::wait`].

use common::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const LOCK_FILE_MODE: u32 = 0o644;

/// Result of trying to become the running instance
pub enum LockOutcome {
    Acquired(InstanceLock),
    /// Another process holds the lock. Not an error.
    AlreadyHeld,
}

/// Held instance lock, released on drop
pub struct InstanceLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl InstanceLock {
    pub fn lock_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{}.lock", name))
    }

    /// Try to take the machine-wide lock named `name` without blocking
    ///
    /// The file is created world-readable and opened read-only, so hosts
    /// started by different users contend for the same lock. A lock file
    /// this process may not open belongs to another user's host and counts
    /// as held.
    pub fn acquire(dir: &Path, name: &str) -> Result<LockOutcome> {
        fs::create_dir_all(dir).map_err(|e| {
            Error::InstanceLock(format!("Failed to create {}: {}", dir.display(), e))
        })?;

        let path = Self::lock_path(dir, name);
        let file = match open_lock_file(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                warn!("Instance lock {} is not accessible: {}", path.display(), e);
                return Ok(LockOutcome::AlreadyHeld);
            }
            Err(e) => {
                return Err(Error::InstanceLock(format!(
                    "Failed to open {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, Errno::EWOULDBLOCK)) => {
                debug!("Instance lock {} is held elsewhere", path.display());
                return Ok(LockOutcome::AlreadyHeld);
            }
            Err((_, errno)) => {
                return Err(Error::InstanceLock(format!(
                    "Failed to lock {}: {}",
                    path.display(),
                    errno
                )));
            }
        };

        // Best effort; the file may belong to another user.
        if let Err(e) = fs::write(&path, format!("{}\n", std::process::id())) {
            debug!("Not recording pid in {}: {}", path.display(), e);
        }

        info!("Acquired instance lock {}", path.display());
        Ok(LockOutcome::Acquired(Self { _lock: lock, path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Open an existing lock file read-only, creating it if missing
fn open_lock_file(path: &Path) -> std::io::Result<File> {
    match File::open(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .mode(LOCK_FILE_MODE)
                .open(path)?;
            // The umask may have narrowed the mode.
            file.set_permissions(fs::Permissions::from_mode(LOCK_FILE_MODE))?;
            Ok(file)
        }
        other => other,
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        debug!("Released instance lock {}", self.path.display());
    }
}

/// Startup completion marker
pub struct StartupSignal {
    path: PathBuf,
    set: bool,
}

impl StartupSignal {
    pub fn signal_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{}.started", name))
    }

    /// Create the signal in the unset state
    ///
    /// Must be called while holding the instance lock: any marker already
    /// present was left by a previous instance and is removed.
    pub fn create(dir: &Path, name: &str) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            Error::StartupSignal(format!("Failed to create {}: {}", dir.display(), e))
        })?;

        let path = Self::signal_path(dir, name);
        match fs::remove_file(&path) {
            Ok(()) => debug!("Removed stale startup signal {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::StartupSignal(format!(
                    "Failed to clear {}: {}",
                    path.display(),
                    e
                )));
            }
        }

        Ok(Self { path, set: false })
    }

    /// Announce that startup has completed
    pub fn set(&mut self) -> Result<()> {
        let tmp = self.path.with_extension("started.tmp");
        fs::write(&tmp, format!("{}\n", std::process::id()))
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|e| {
                Error::StartupSignal(format!("Failed to write {}: {}", self.path.display(), e))
            })?;

        self.set = true;
        debug!("Startup signal set at {}", self.path.display());
        Ok(())
    }

    pub fn is_set(&self) -> bool {
        self.set
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether some instance has signalled startup
    pub fn is_signalled(dir: &Path, name: &str) -> bool {
        Self::signal_path(dir, name).exists()
    }

    /// Wait up to `timeout` for a running instance to signal startup
    pub async fn wait(dir: &Path, name: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if Self::is_signalled(dir, name) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }
}

impl Drop for StartupSignal {
    fn drop(&mut self) {
        if self.set {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!("Failed to remove startup signal {}: {}", self.path.display(), e);
            }
        }
    }
}
