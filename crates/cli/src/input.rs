//! Loading the input list of repositories.

use std::path::Path;

use indexer::{IndexerError, RepositoryRecord};

/// Reads the JSON array of repository records at `path`.
///
/// Fields other than `name` are carried along untouched.
///
/// # Errors
///
/// [`IndexerError::Input`] if the file cannot be read, is not a JSON array of
/// objects with a string `name`, or any `name` is empty.
pub async fn load_repositories(path: &Path) -> Result<Vec<RepositoryRecord>, IndexerError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| IndexerError::input(format!("cannot read {}: {e}", path.display())))?;

    let records: Vec<RepositoryRecord> = serde_json::from_slice(&bytes).map_err(|e| {
        IndexerError::input(format!(
            "{} is not a JSON array of repository records: {e}",
            path.display()
        ))
    })?;

    if let Some(index) = records.iter().position(|r| r.name.as_str().is_empty()) {
        return Err(IndexerError::input(format!(
            "record {index} in {} has an empty name",
            path.display()
        )));
    }

    tracing::debug!(path = %path.display(), records = records.len(), "Loaded input list");
    Ok(records)
}
