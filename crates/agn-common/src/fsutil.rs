//! Atomic JSON snapshot helpers used by every engine's persistence layer.

use crate::CommonError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Writes `value` as JSON to `path` via a temporary file in the same
/// directory followed by a rename, so a crashed save leaves the last
/// committed file in place.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), CommonError> {
    let serialized = serde_json::to_vec_pretty(value)
        .map_err(|e| CommonError::SerializationError(format!("snapshot {path:?}: {e}")))?;
    let parent = path
        .parent()
        .ok_or_else(|| CommonError::IoError(format!("snapshot path {path:?} has no parent")))?;
    fs::create_dir_all(parent)
        .map_err(|e| CommonError::IoError(format!("create dir {parent:?}: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &serialized)
        .map_err(|e| CommonError::IoError(format!("write snapshot {tmp:?}: {e}")))?;
    fs::rename(&tmp, path)
        .map_err(|e| CommonError::IoError(format!("commit snapshot {path:?}: {e}")))?;
    Ok(())
}

/// Reads a JSON value from `path`, returning `None` when the file does not
/// exist yet.
pub fn read_json_if_exists<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, CommonError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)
        .map_err(|e| CommonError::IoError(format!("read snapshot {path:?}: {e}")))?;
    if contents.trim().is_empty() {
        return Ok(None);
    }
    let value = serde_json::from_str(&contents)
        .map_err(|e| CommonError::DeserializationError(format!("parse snapshot {path:?}: {e}")))?;
    Ok(Some(value))
}
