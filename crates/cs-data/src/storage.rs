use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use cs_types::CsResult;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

/// Descriptor written once into every pipeline directory.
pub const PIPELINE_DESCRIPTOR: &str = "pipeline.json";

/// Identifies the pipeline whose trials live in a directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDescriptor {
    pub id: String,
    pub nodes: Vec<String>,
    pub input_path: String,
    pub created_at: DateTime<Utc>,
}

/// Storage manager for per-pipeline result directories
#[derive(Debug, Clone)]
pub struct StorageManager {
    pub data_root: PathBuf,
}

impl StorageManager {
    pub fn new<P: AsRef<Path>>(data_root: P) -> CsResult<Self> {
        let data_root = data_root.as_ref().to_path_buf();
        fs::create_dir_all(&data_root)?;

        Ok(Self { data_root })
    }

    /// Directory holding the trials and backend output of one pipeline
    pub fn pipeline_dir(&self, dir_name: &str) -> PathBuf {
        self.data_root.join(dir_name)
    }

    /// Create the pipeline directory and its descriptor if they do not exist yet.
    pub fn ensure_pipeline_dir(&self, descriptor: &PipelineDescriptor) -> CsResult<PathBuf> {
        let dir = self.pipeline_dir(&descriptor.id);
        fs::create_dir_all(&dir)?;

        let descriptor_path = dir.join(PIPELINE_DESCRIPTOR);
        if !descriptor_path.exists() {
            let bytes = serde_json::to_vec_pretty(descriptor)?;
            write_atomic(&descriptor_path, &bytes)?;
            tracing::debug!(pipeline = %descriptor.id, dir = %dir.display(), "Created pipeline directory");
        }

        Ok(dir)
    }

    /// List the pipelines stored under the data root
    pub fn list_pipelines(&self) -> CsResult<Vec<PipelineDescriptor>> {
        let mut pipelines = Vec::new();

        if !self.data_root.exists() {
            return Ok(pipelines);
        }

        for entry in fs::read_dir(&self.data_root)? {
            let path = entry?.path().join(PIPELINE_DESCRIPTOR);
            if !path.is_file() {
                continue;
            }

            let parsed = fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| {
                    serde_json::from_slice::<PipelineDescriptor>(&bytes).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(descriptor) => pipelines.push(descriptor),
                Err(e) => {
                    tracing::warn!("Skipping unreadable pipeline descriptor {}: {}", path.display(), e);
                }
            }
        }

        pipelines.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(pipelines)
    }

    /// Get storage statistics
    pub fn get_stats(&self) -> CsResult<StorageStats> {
        fn scan_directory(path: &Path, stats: &mut (u64, u64)) -> std::io::Result<()> {
            for entry in fs::read_dir(path)? {
                let entry = entry?;
                let path = entry.path();

                if path.is_dir() {
                    scan_directory(&path, stats)?;
                } else {
                    stats.0 += 1;
                    stats.1 += entry.metadata()?.len();
                }
            }
            Ok(())
        }

        let mut stats = (0u64, 0u64);
        if self.data_root.exists() {
            scan_directory(&self.data_root, &mut stats)?;
        }

        Ok(StorageStats {
            pipelines: self.list_pipelines()?.len(),
            total_files: stats.0,
            total_size_bytes: stats.1,
            data_root: self.data_root.clone(),
        })
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub pipelines: usize,
    pub total_files: u64,
    pub total_size_bytes: u64,
    pub data_root: PathBuf,
}

impl StorageStats {
    pub fn total_size_mb(&self) -> f64 {
        self.total_size_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Replace `path` with `bytes` so that readers see either the old or the new
/// content, never a partial write.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
