//! Upload coordination: resolve the remote file, declare its chunk count,
//! then push every chunk through a bounded pool of worker threads.

use crate::chunker::ChunkDescriptor;
use crate::error::ApiError;
use indicatif::ProgressBar;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// An entry of the remote file listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
}

/// The remote file operations the coordinator depends on.
pub trait FileApi: Sync {
    fn list_files(&self) -> Result<Vec<RemoteFile>, ApiError>;
    /// Create a file entry with `chunkCount: 0` and return its id.
    fn create_file(&self, name: &str) -> Result<String, ApiError>;
    fn set_chunk_count(&self, file_id: &str, chunk_count: usize) -> Result<(), ApiError>;
    fn put_chunk(&self, file_id: &str, index: usize, data: Vec<u8>, compressed: bool) -> Result<(), ApiError>;
}

/// Remote file resolved for this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileHandle {
    pub file_id: String,
    pub declared_chunk_count: usize,
}

/// Outcome of one chunk.
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub sequence_index: usize,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadReport {
    pub target_name: String,
    pub remote: RemoteFileHandle,
    /// One entry per chunk, ordered by `sequence_index`.
    pub results: Vec<UploadResult>,
}

impl UploadReport {
    pub fn is_success(&self) -> bool {
        self.results.len() == self.remote.declared_chunk_count && self.results.iter().all(|r| r.success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &UploadResult> {
        self.results.iter().filter(|r| !r.success)
    }
}

/// Name the upload lands under: the explicit import data source when given,
/// otherwise the file's base name.
pub fn resolve_target_name(file_path: &Path, import_data_source: Option<&str>) -> String {
    match import_data_source {
        Some(name) if !name.trim().is_empty() => name.to_string(),
        _ => file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_path.to_string_lossy().into_owned()),
    }
}

pub struct UploadCoordinator<'a, A: FileApi> {
    api: &'a A,
    max_concurrency: usize,
    progress: ProgressBar,
}

impl<'a, A: FileApi> UploadCoordinator<'a, A> {
    pub fn new(api: &'a A, max_concurrency: usize) -> Self {
        Self {
            api,
            max_concurrency: max_concurrency.max(1),
            progress: ProgressBar::hidden(),
        }
    }

    /// Report each finished chunk on `progress`.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Reuse the id of a same-named remote file or create a new one.
    pub fn resolve_file_id(&self, target_name: &str) -> Result<String, ApiError> {
        let existing = self.api.list_files()?;
        if let Some(file) = existing.into_iter().find(|f| f.name == target_name) {
            tracing::info!(name = target_name, file_id = %file.id, "reusing existing remote file");
            return Ok(file.id);
        }
        let id = self.api.create_file(target_name)?;
        tracing::info!(name = target_name, file_id = %id, "created remote file");
        Ok(id)
    }

    /// Run the whole upload.
    ///
    /// Errors before the fan-out (listing, creating, declaring the count)
    /// are returned as `Err`. Chunk failures are reported per chunk in the
    /// returned [`UploadReport`]; the first one stops workers from picking up
    /// further chunks.
    pub fn upload(
        &self,
        file_path: &Path,
        import_data_source: Option<&str>,
        chunks: &[ChunkDescriptor],
    ) -> Result<UploadReport, ApiError> {
        let target_name = resolve_target_name(file_path, import_data_source);
        let file_id = self.resolve_file_id(&target_name)?;

        self.api.set_chunk_count(&file_id, chunks.len())?;
        let remote = RemoteFileHandle {
            file_id,
            declared_chunk_count: chunks.len(),
        };
        tracing::info!(file_id = %remote.file_id, chunk_count = chunks.len(), "declared chunk count");

        let results = if chunks.is_empty() {
            Vec::new()
        } else {
            self.fan_out(&remote.file_id, chunks)
        };

        Ok(UploadReport {
            target_name,
            remote,
            results,
        })
    }

    fn fan_out(&self, file_id: &str, chunks: &[ChunkDescriptor]) -> Vec<UploadResult> {
        let workers = self.max_concurrency.min(chunks.len());
        let cursor = AtomicUsize::new(0);
        let aborted = AtomicBool::new(false);
        let results = Mutex::new(Vec::with_capacity(chunks.len()));

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    if aborted.load(Ordering::SeqCst) {
                        break;
                    }
                    let i = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(chunk) = chunks.get(i) else { break };

                    let outcome = self.upload_one(file_id, chunk);
                    if outcome.is_err() {
                        aborted.store(true, Ordering::SeqCst);
                    }
                    self.progress.inc(1);
                    let result = UploadResult {
                        sequence_index: chunk.sequence_index,
                        success: outcome.is_ok(),
                        error: outcome.err(),
                    };
                    results
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .push(result);
                });
            }
        });

        let mut results = results.into_inner().unwrap_or_else(|p| p.into_inner());
        let attempted: HashSet<usize> = results.iter().map(|r| r.sequence_index).collect();
        // Chunks no worker reached after an abort.
        for chunk in chunks {
            if !attempted.contains(&chunk.sequence_index) {
                results.push(UploadResult {
                    sequence_index: chunk.sequence_index,
                    success: false,
                    error: Some("skipped after an earlier chunk failed".to_string()),
                });
            }
        }
        results.sort_by_key(|r| r.sequence_index);
        results
    }

    fn upload_one(&self, file_id: &str, chunk: &ChunkDescriptor) -> Result<(), String> {
        let data = std::fs::read(&chunk.local_path).map_err(|e| {
            tracing::error!(path = %chunk.local_path.display(), error = %e, "failed to read chunk");
            format!("failed to read {}: {e}", chunk.local_path.display())
        })?;
        tracing::info!(index = chunk.sequence_index, bytes = data.len(), "uploading chunk");
        match self.api.put_chunk(file_id, chunk.sequence_index, data, chunk.compressed) {
            Ok(()) => {
                tracing::info!(index = chunk.sequence_index, "finished uploading chunk");
                Ok(())
            }
            Err(e) => {
                tracing::error!(index = chunk.sequence_index, error = %e, "chunk upload failed");
                Err(e.to_string())
            }
        }
    }
}
