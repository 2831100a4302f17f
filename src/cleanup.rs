//! Removal of local chunk files once an upload is over.

use std::path::Path;

/// Delete every path in `paths`, continuing past failures.
///
/// Returns how many files were actually removed.
pub fn delete_files<P: AsRef<Path>>(paths: &[P]) -> usize {
    let mut deleted = 0;
    for path in paths {
        let path = path.as_ref();
        match std::fs::remove_file(path) {
            Ok(()) => {
                tracing::info!(file = %path.display(), "deleted");
                deleted += 1;
            }
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "failed to delete file");
            }
        }
    }
    deleted
}
