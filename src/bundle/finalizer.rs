//! Atomic publication of staged bundles.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use uuid::Uuid;

use super::StagedBundle;
use crate::error::PublishError;
use crate::fsutil;
use crate::job::{JobId, JobState};

/// A bundle visible to the commander.
#[derive(Debug, Clone)]
pub struct PublishedBundle {
    pub job_id: JobId,
    pub path: PathBuf,
    pub state: JobState,
}

/// Moves staged bundles into the done directory.
#[derive(Debug, Clone)]
pub struct BundleFinalizer {
    done_dir: PathBuf,
}

impl BundleFinalizer {
    pub fn new(done_dir: PathBuf) -> Self {
        Self { done_dir }
    }

    /// Publish a staged bundle under `done/<id>`.
    ///
    /// On error the staged directory is left exactly as it was.
    pub async fn publish(&self, staged: &StagedBundle) -> Result<PublishedBundle, PublishError> {
        let path = self.republish(&staged.job_id, &staged.path).await?;
        info!(
            job_id = %staged.job_id,
            state = %staged.manifest.state,
            exit_status = staged.manifest.exit_status,
            destination = %path.display(),
            "Published bundle"
        );
        Ok(PublishedBundle {
            job_id: staged.job_id.clone(),
            path,
            state: staged.manifest.state,
        })
    }

    /// Publish a finalized staging directory by path (startup recovery).
    pub async fn republish(&self, id: &JobId, staged_path: &Path) -> Result<PathBuf, PublishError> {
        let id = id.clone();
        let staged_path = staged_path.to_path_buf();
        let done_dir = self.done_dir.clone();
        let join_id = id.clone();
        tokio::task::spawn_blocking(move || publish_blocking(&id, &staged_path, &done_dir))
            .await
            .unwrap_or_else(|e| {
                Err(PublishError::Io {
                    id: join_id,
                    source: io::Error::other(e),
                })
            })
    }
}

fn publish_blocking(id: &JobId, staged: &Path, done_dir: &Path) -> Result<PathBuf, PublishError> {
    let destination = done_dir.join(id);

    if fs::symlink_metadata(staged).is_err() {
        return Err(PublishError::MissingStaged {
            id: id.clone(),
            path: staged.to_path_buf(),
        });
    }
    if fs::symlink_metadata(&destination).is_ok() {
        return Err(PublishError::AlreadyExists {
            id: id.clone(),
            destination,
        });
    }

    match fsutil::rename_noreplace(staged, &destination) {
        Ok(()) => {}
        Err(e) if fsutil::is_target_taken(&e) => {
            return Err(PublishError::AlreadyExists {
                id: id.clone(),
                destination,
            });
        }
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            warn!(job_id = %id, "Staging and done are on different filesystems, copying");
            publish_by_copy(id, staged, done_dir)?;
        }
        Err(source) => {
            return Err(PublishError::Io {
                id: id.clone(),
                source,
            });
        }
    }

    if let Err(e) = fsutil::sync_dir(done_dir) {
        warn!(job_id = %id, error = %e, "Failed to sync done directory");
    }
    Ok(destination)
}

/// Copy into a hidden sibling of the destination, then rename it into place.
pub(crate) fn publish_by_copy(id: &JobId, staged: &Path, done_dir: &Path) -> Result<(), PublishError> {
    let destination = done_dir.join(id);
    let temp = done_dir.join(format!(".{id}.partial-{}", Uuid::new_v4().simple()));
    let io_err = |source| PublishError::Io {
        id: id.clone(),
        source,
    };

    if let Err(e) = fsutil::copy_dir_all(staged, &temp) {
        discard(&temp);
        return Err(io_err(e));
    }

    match fsutil::rename_noreplace(&temp, &destination) {
        Ok(()) => {}
        Err(e) => {
            discard(&temp);
            return Err(if fsutil::is_target_taken(&e) {
                PublishError::AlreadyExists {
                    id: id.clone(),
                    destination,
                }
            } else {
                io_err(e)
            });
        }
    }

    if let Err(e) = fs::remove_dir_all(staged) {
        warn!(job_id = %id, error = %e, "Published copy but failed to clear staging");
    }
    Ok(())
}

fn discard(temp: &Path) {
    if let Err(e) = fs::remove_dir_all(temp) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %temp.display(), error = %e, "Failed to remove partial bundle copy");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged_dir(root: &Path, id: &str) -> PathBuf {
        let dir = root.join("staging").join(id);
        fs::create_dir_all(dir.join("out")).unwrap();
        fs::write(dir.join("report.xml"), "<report/>").unwrap();
        fs::write(dir.join("out/hosts.txt"), "10.0.0.1\n").unwrap();
        dir
    }

    #[test]
    fn copy_publish_lands_complete_bundle() {
        let tmp = tempfile::tempdir().unwrap();
        let done = tmp.path().join("done");
        fs::create_dir(&done).unwrap();
        let id = JobId::parse("abc123").unwrap();
        let staged = staged_dir(tmp.path(), "abc123");

        publish_by_copy(&id, &staged, &done).unwrap();

        assert!(!staged.exists());
        assert_eq!(
            fs::read_to_string(done.join("abc123/out/hosts.txt")).unwrap(),
            "10.0.0.1\n"
        );
        // No leftover temp directory.
        let entries: Vec<_> = fs::read_dir(&done).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn copy_publish_refuses_existing_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let done = tmp.path().join("done");
        fs::create_dir_all(done.join("abc123")).unwrap();
        let id = JobId::parse("abc123").unwrap();
        let staged = staged_dir(tmp.path(), "abc123");

        let err = publish_by_copy(&id, &staged, &done).unwrap_err();
        assert!(matches!(err, PublishError::AlreadyExists { .. }));
        assert!(staged.join("report.xml").exists());
        let entries: Vec<_> = fs::read_dir(&done).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn republish_missing_staging() {
        let tmp = tempfile::tempdir().unwrap();
        let finalizer = BundleFinalizer::new(tmp.path().join("done"));
        let id = JobId::parse("gone").unwrap();
        let err = finalizer
            .republish(&id, &tmp.path().join("staging/gone"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::MissingStaged { .. }));
    }
}
