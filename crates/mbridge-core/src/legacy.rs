//! Conversion of legacy single-file storage into the directory layout
//!
//! Older installations kept all controller state in one JSON file shaped as
//! `{ "<context>": { "<key>": <value> } }`. The directory layout used by
//! [`StorageService`] keeps one document per context instead. Conversion runs
//! once: when the target directory already exists the legacy file is ignored.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::storage::{validate_name, NodeStorage, StorageError, StorageService};

/// Where converted storage lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedStorage {
    /// Storage root to hand to [`StorageService::new`]
    pub output_dir: PathBuf,
    /// Namespace of the node inside the storage root
    pub id: String,
    /// Whether a legacy file was converted by this call
    pub converted: bool,
}

/// Resolve a storage location, converting a legacy JSON file if one is found
///
/// `location` is split into `<output_dir>/<id>[.json]`. If it names an
/// existing file and `<output_dir>/<id>/` does not exist yet, every context of
/// the file is written to the directory layout.
pub async fn convert_legacy_storage(location: &Path) -> Result<ConvertedStorage, StorageError> {
    let output_dir = location
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let id = location
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| StorageError::InvalidName(location.display().to_string()))?
        .to_string();

    let mut result = ConvertedStorage {
        output_dir,
        id,
        converted: false,
    };

    let is_file = match tokio::fs::metadata(location).await {
        Ok(meta) => meta.is_file(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => return Err(e.into()),
    };
    if !is_file {
        return Ok(result);
    }

    let target = result.output_dir.join(&result.id);
    if tokio::fs::try_exists(&target).await? {
        warn!(
            legacy = %location.display(),
            target = %target.display(),
            "Legacy storage file present but already converted, ignoring it"
        );
        return Ok(result);
    }

    let content = tokio::fs::read_to_string(location).await?;
    let contexts = match serde_json::from_str(&content)? {
        Value::Object(contexts) => contexts,
        _ => return Err(StorageError::NotAnObject(location.to_path_buf())),
    };

    // Staged so a failed run leaves no target directory behind
    let staging_id = format!("{}.converting", result.id);
    let staging = StorageService::new(&result.output_dir).open(&staging_id)?;
    if tokio::fs::try_exists(staging.dir()).await? {
        tokio::fs::remove_dir_all(staging.dir()).await?;
    }

    let count = match write_contexts(&staging, contexts).await {
        Ok(count) => count,
        Err(e) => {
            if let Err(cleanup) = tokio::fs::remove_dir_all(staging.dir()).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        staging = %staging.dir().display(),
                        error = %cleanup,
                        "Failed to remove staging directory"
                    );
                }
            }
            return Err(e);
        }
    };
    tokio::fs::create_dir_all(staging.dir()).await?;
    tokio::fs::rename(staging.dir(), &target).await?;

    info!(
        legacy = %location.display(),
        target = %target.display(),
        contexts = count,
        "Converted legacy storage file"
    );
    result.converted = true;
    Ok(result)
}

async fn write_contexts(
    node: &NodeStorage,
    contexts: Map<String, Value>,
) -> Result<usize, StorageError> {
    for name in contexts.keys() {
        validate_name(name)?;
    }

    let mut count = 0usize;
    for (name, entries) in contexts {
        let entries = match entries {
            Value::Object(entries) => entries,
            other => {
                // Top-level scalars were stored without a context
                let mut wrapped = Map::new();
                wrapped.insert(name.clone(), other);
                wrapped
            }
        };
        node.context(&name)?.replace_all(entries).await?;
        count += 1;
    }
    Ok(count)
}
