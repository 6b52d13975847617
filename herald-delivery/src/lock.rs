//! Process-external mutual exclusion for drain cycles
//!
//! One advisory file lock per queue type, taken with `flock(2)` semantics via
//! `fs2`. The OS drops the lock when the holding process exits, so a crashed
//! worker never wedges the queue.

use std::{
    fs::{File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use fs2::FileExt;
use herald_common::internal;
use tokio::time::Instant;

use crate::error::LockError;

/// Lock guarding the mail queue
pub const SEND_MAIL: &str = "send_mail";
/// Lock guarding the notice-batch queue
pub const SEND_NOTICES: &str = "send_notices";

/// How often a waiting `acquire` retries
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct DrainLock {
    name: String,
    path: PathBuf,
    file: Option<File>,
}

impl DrainLock {
    /// Describe the lock `<dir>/<name>.lock`; nothing is touched until `acquire`
    pub fn new(dir: impl AsRef<Path>, name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: dir.as_ref().join(format!("{name}.lock")),
            file: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Take the lock
    ///
    /// A zero `timeout` fails at once when the lock is held elsewhere;
    /// otherwise the lock is polled until `timeout` has passed. Calling this
    /// while already holding the lock succeeds immediately.
    ///
    /// # Errors
    /// - `AlreadyLocked` when contended and `timeout` is zero
    /// - `Timeout` when still contended after `timeout`
    /// - `Io` if the lock file cannot be opened or locked
    pub async fn acquire(&mut self, timeout: Duration) -> Result<(), LockError> {
        if self.is_held() {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;

        loop {
            if self.try_acquire().await? {
                internal!(level = DEBUG, "Acquired drain lock {}", self.name);
                return Ok(());
            }

            if timeout.is_zero() {
                return Err(LockError::AlreadyLocked {
                    name: self.name.clone(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    name: self.name.clone(),
                    waited: timeout,
                });
            }

            tokio::time::sleep(RETRY_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn try_acquire(&mut self) -> Result<bool, LockError> {
        let path = self.path.clone();
        let file = tokio::task::spawn_blocking(move || open_locked(&path))
            .await
            .map_err(std::io::Error::other)??;

        let Some(file) = file else {
            return Ok(false);
        };

        self.file = Some(file);
        Ok(true)
    }

    /// Give the lock up. Safe to call any number of times, held or not.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                internal!(
                    level = WARN,
                    "Failed to unlock {}, closing the handle instead: {e}",
                    self.name
                );
            }
            internal!(level = DEBUG, "Released drain lock {}", self.name);
        }
    }
}

impl Drop for DrainLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Open the lock file and try to flock it; `None` when someone else holds it
fn open_locked(path: &Path) -> std::io::Result<Option<File>> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?;

    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(e) if is_contended(&e) => return Ok(None),
        Err(e) => return Err(e),
    }

    // Informational only; the flock is what excludes other holders
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;

    Ok(Some(file))
}

fn is_contended(error: &std::io::Error) -> bool {
    error.kind() == ErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn test_only_one_holder() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = DrainLock::new(dir.path(), SEND_MAIL);
        let mut second = DrainLock::new(dir.path(), SEND_MAIL);

        first.acquire(Duration::ZERO).await.unwrap();
        let err = second.acquire(Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, LockError::AlreadyLocked { .. }));
        assert!(!second.is_held());

        first.release();
        second.acquire(Duration::ZERO).await.unwrap();
        assert!(second.is_held());
    }

    #[tokio::test]
    async fn test_release_without_holding_leaves_the_holder_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut holder = DrainLock::new(dir.path(), SEND_MAIL);
        let mut bystander = DrainLock::new(dir.path(), SEND_MAIL);
        let mut third = DrainLock::new(dir.path(), SEND_MAIL);

        holder.acquire(Duration::ZERO).await.unwrap();

        bystander.release();
        bystander.release();
        assert!(!bystander.is_held());
        assert!(holder.is_held());

        let err = third.acquire(Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, LockError::AlreadyLocked { .. }));

        holder.release();
        third.acquire(Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_creates_missing_lock_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = DrainLock::new(dir.path().join("run/herald"), SEND_MAIL);

        lock.acquire(Duration::ZERO).await.unwrap();
        assert!(lock.path().is_file());
    }

    #[tokio::test]
    async fn test_reacquire_while_held_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = DrainLock::new(dir.path(), SEND_NOTICES);

        lock.acquire(Duration::ZERO).await.unwrap();
        lock.acquire(Duration::ZERO).await.unwrap();
        assert!(lock.is_held());
        assert_eq!(lock.path(), dir.path().join("send_notices.lock"));
    }

    #[tokio::test]
    async fn test_distinct_names_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let mut mail = DrainLock::new(dir.path(), SEND_MAIL);
        let mut notices = DrainLock::new(dir.path(), SEND_NOTICES);

        mail.acquire(Duration::ZERO).await.unwrap();
        notices.acquire(Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut scoped = DrainLock::new(dir.path(), SEND_MAIL);
            scoped.acquire(Duration::ZERO).await.unwrap();
        }

        let mut next = DrainLock::new(dir.path(), SEND_MAIL);
        next.acquire(Duration::ZERO).await.unwrap();
    }
}
