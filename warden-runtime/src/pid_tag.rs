//! Pid-tag lock
//!
//! A file `<dir>/<tag>` holding the owner's process id. Creating it with
//! create-new semantics is the lock; deleting it is the release. A holder that
//! crashes leaves the file behind and nothing here reclaims it.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::LockError;

/// A held pid-tag lock
///
/// Dropping an unreleased tag removes the file with a blocking call; async
/// code should call [`PidTag::release`] instead.
#[derive(Debug)]
pub struct PidTag {
    tag: String,
    path: PathBuf,
    owner_pid: u32,
    created_at: DateTime<Utc>,
    released: bool,
}

impl PidTag {
    /// Create `<dir>/<tag>` exclusively, writing the current process id
    pub async fn acquire(tag: &str, dir: impl AsRef<Path>) -> Result<Self, LockError> {
        Self::acquire_for(tag, dir, std::process::id()).await
    }

    /// As [`PidTag::acquire`], recording `owner_pid` as the holder
    pub async fn acquire_for(
        tag: &str,
        dir: impl AsRef<Path>,
        owner_pid: u32,
    ) -> Result<Self, LockError> {
        validate_tag(tag)?;
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(tag);

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let owner = read_owner(&path).await;
                return Err(LockError::AlreadyExists {
                    tag: tag.to_string(),
                    path,
                    owner,
                });
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = write_pid(&mut file, owner_pid).await {
            // Do not leave a lock behind that nobody holds
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e.into());
        }

        debug!(tag, path = %path.display(), owner_pid, "Acquired pid tag");
        Ok(Self {
            tag: tag.to_string(),
            path,
            owner_pid,
            created_at: Utc::now(),
            released: false,
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Stop owning the lock without deleting the file
    ///
    /// For a worker that outlived its supervisor's shutdown; the file stays
    /// until someone releases it explicitly.
    pub fn keep(mut self) -> PathBuf {
        self.released = true;
        warn!(tag = %self.tag, path = %self.path.display(), "Leaving pid tag in place");
        std::mem::take(&mut self.path)
    }

    /// Delete the lock file
    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(tag = %self.tag, "Released pid tag");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(tag = %self.tag, "Pid tag was already removed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for PidTag {
    fn drop(&mut self) {
        if !self.released {
            // Aborted tasks land here; an aborted process never does
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(tag = %self.tag, error = %e, "Failed to remove pid tag on drop");
                }
            }
        }
    }
}

async fn write_pid(file: &mut tokio::fs::File, pid: u32) -> std::io::Result<()> {
    file.write_all(pid.to_string().as_bytes()).await?;
    file.flush().await?;
    file.sync_all().await
}

/// Process id recorded in a lock file, if readable
pub async fn read_owner(path: &Path) -> Option<u32> {
    tokio::fs::read_to_string(path)
        .await
        .ok()
        .and_then(|content| content.trim().parse().ok())
}

/// Whether `<dir>/<tag>` currently exists
pub async fn is_held(tag: &str, dir: impl AsRef<Path>) -> Result<bool, LockError> {
    validate_tag(tag)?;
    Ok(tokio::fs::try_exists(dir.as_ref().join(tag)).await?)
}

/// Remove a lock file left by someone else (operator action)
pub async fn force_release(tag: &str, dir: impl AsRef<Path>) -> Result<bool, LockError> {
    validate_tag(tag)?;
    match tokio::fs::remove_file(dir.as_ref().join(tag)).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// A tag must be a single plain file name
pub fn validate_tag(tag: &str) -> Result<(), LockError> {
    let valid = !tag.is_empty()
        && tag != "."
        && tag != ".."
        && !tag.contains(['/', '\\', '\0'])
        && tag.len() <= 200;

    if valid {
        Ok(())
    } else {
        Err(LockError::InvalidTag(tag.to_string()))
    }
}
