//! On-disk store for finished job outputs.
//!
//! Every completed job owns exactly one PNG named after its id. The file is
//! written before the job is marked completed, so a `result_uri` always
//! points at bytes that exist.

use crate::error::CoreResult;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Creates the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> CoreResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn path_for(&self, job_id: &str) -> PathBuf {
        self.root.join(format!("{}.png", job_id))
    }

    /// URI clients use to fetch the artifact.
    pub fn uri_for(job_id: &str) -> String {
        format!("/api/artifacts/{}", job_id)
    }

    /// Writes the PNG for `job_id` and returns its URI.
    pub async fn save(&self, job_id: &str, png: &[u8]) -> CoreResult<String> {
        // Write to a temporary name first so a reader never sees half a file.
        let path = self.path_for(job_id);
        let partial = self.root.join(format!("{}.png.part", job_id));
        tokio::fs::write(&partial, png).await?;
        tokio::fs::rename(&partial, &path).await?;
        Ok(Self::uri_for(job_id))
    }

    pub fn exists(&self, job_id: &str) -> bool {
        self.path_for(job_id).is_file()
    }

    /// Deletes the artifact. A missing file is not an error.
    pub async fn remove(&self, job_id: &str) -> CoreResult<()> {
        match tokio::fs::remove_file(self.path_for(job_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path().join("artifacts")).unwrap();

        let uri = store.save("job-1", b"\x89PNG fake").await.unwrap();
        assert_eq!(uri, "/api/artifacts/job-1");
        assert!(store.exists("job-1"));
        assert_eq!(std::fs::read(store.path_for("job-1")).unwrap(), b"\x89PNG fake");

        store.remove("job-1").await.unwrap();
        assert!(!store.exists("job-1"));
        store.remove("job-1").await.unwrap();
    }
}
