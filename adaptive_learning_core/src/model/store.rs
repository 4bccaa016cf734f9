//! On-disk model artifacts: a directory holding `model.json` plus a
//! `metadata.json` sidecar. Both files are replaced atomically and the model
//! bytes are verified against a blake3 checksum on load.

use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{Model, ModelMetadata};
use crate::error::{CoreError, CoreResult};

pub const MODEL_FILE: &str = "model.json";
pub const METADATA_FILE: &str = "metadata.json";

/// Handle on a model artifact directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifact {
    dir: PathBuf,
}

/// Raw bytes of an artifact, used to roll a failed update back.
#[derive(Debug, Clone)]
pub struct ArtifactSnapshot {
    model: Vec<u8>,
    metadata: Vec<u8>,
}

impl ModelArtifact {
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn model_path(&self) -> PathBuf {
        self.dir.join(MODEL_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    pub fn exists(&self) -> bool {
        self.model_path().is_file() && self.metadata_path().is_file()
    }

    /// Write the model and its metadata. The checksum and `updated_at` of
    /// `metadata` are refreshed in place.
    pub fn save(&self, model: &Model, metadata: &mut ModelMetadata) -> CoreResult<()> {
        let model_bytes = serde_json::to_vec(model)?;
        metadata.checksum = blake3::hash(&model_bytes).to_hex().to_string();
        metadata.updated_at = Utc::now();
        metadata.architecture = model.architecture_stats();

        let metadata_bytes = serde_json::to_vec_pretty(metadata)?;
        self.write_pair(&model_bytes, &metadata_bytes)?;
        debug!("Saved model artifact to {:?}", self.dir);
        Ok(())
    }

    /// Rewrite only the metadata sidecar.
    pub fn save_metadata(&self, metadata: &ModelMetadata) -> CoreResult<()> {
        let bytes = serde_json::to_vec_pretty(metadata)?;
        self.write_atomic(&self.metadata_path(), &bytes)
    }

    pub fn load(&self) -> CoreResult<(Model, ModelMetadata)> {
        let metadata = self.load_metadata()?;
        let path = self.model_path();
        let bytes = fs::read(&path).map_err(|e| CoreError::model_io(&path, e))?;

        let checksum = blake3::hash(&bytes).to_hex().to_string();
        if !metadata.checksum.is_empty() && checksum != metadata.checksum {
            return Err(CoreError::model_io(
                &path,
                format!("checksum mismatch: expected {}, found {}", metadata.checksum, checksum),
            ));
        }

        let model = serde_json::from_slice(&bytes).map_err(|e| CoreError::model_io(&path, e))?;
        Ok((model, metadata))
    }

    pub fn load_metadata(&self) -> CoreResult<ModelMetadata> {
        let path = self.metadata_path();
        let bytes = fs::read(&path).map_err(|e| CoreError::model_io(&path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| CoreError::model_io(&path, e))
    }

    pub fn snapshot(&self) -> CoreResult<ArtifactSnapshot> {
        let model_path = self.model_path();
        let metadata_path = self.metadata_path();
        Ok(ArtifactSnapshot {
            model: fs::read(&model_path).map_err(|e| CoreError::model_io(&model_path, e))?,
            metadata: fs::read(&metadata_path).map_err(|e| CoreError::model_io(&metadata_path, e))?,
        })
    }

    pub fn restore(&self, snapshot: &ArtifactSnapshot) -> CoreResult<()> {
        self.write_pair(&snapshot.model, &snapshot.metadata)?;
        debug!("Restored model artifact at {:?}", self.dir);
        Ok(())
    }

    /// Replace both files. When the metadata write fails the previous model
    /// bytes are put back, so the pair on disk still matches its checksum.
    fn write_pair(&self, model_bytes: &[u8], metadata_bytes: &[u8]) -> CoreResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| CoreError::model_io(&self.dir, e))?;
        let model_path = self.model_path();
        let previous = fs::read(&model_path).ok();

        self.write_atomic(&model_path, model_bytes)?;
        if let Err(e) = self.write_atomic(&self.metadata_path(), metadata_bytes) {
            let rollback = match &previous {
                Some(bytes) => self.write_atomic(&model_path, bytes),
                None => {
                    fs::remove_file(&model_path).map_err(|e| CoreError::model_io(&model_path, e))
                }
            };
            if let Err(rollback) = rollback {
                warn!("Failed to roll back {:?}: {}", model_path, rollback);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Temp file in the same directory, then rename over the target.
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> CoreResult<()> {
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| CoreError::model_io(path, e))?;
        tmp.write_all(bytes).map_err(|e| CoreError::model_io(path, e))?;
        tmp.as_file().sync_all().map_err(|e| CoreError::model_io(path, e))?;
        tmp.persist(path).map_err(|e| CoreError::model_io(path, e.error))?;
        Ok(())
    }
}
