//! File I/O helpers.
//!
//! Everything we persist is small JSON, so we read and write whole files at
//! once and let the parsers work on strings.

use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt as _,
};

use crate::prelude::*;

/// Read TOML or JSON from a file.
///
/// Files ending in `.json`, or whose first non-blank character is `{`, are
/// parsed as JSON. Everything else is TOML.
pub async fn read_json_or_toml<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let data = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))?;
    let is_json = path.extension().is_some_and(|ext| ext == "json")
        || data.trim_start().starts_with('{');
    if is_json {
        serde_json::from_str(&data).with_context(|| {
            format!("Failed to parse JSON from file at path: {:?}", path)
        })
    } else {
        toml::from_str(&data).with_context(|| {
            format!("Failed to parse TOML from file at path: {:?}", path)
        })
    }
}

/// Read a JSON file, returning `None` if it doesn't exist.
pub async fn read_json_if_exists<T>(path: &Path) -> Result<Option<T>>
where
    T: serde::de::DeserializeOwned,
{
    let data = match fs::read_to_string(path).await {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to read file at path: {:?}", path));
        }
    };
    let value = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse JSON from file at path: {:?}", path))?;
    Ok(Some(value))
}

/// Write `value` as pretty JSON, replacing any existing file atomically.
///
/// We write a sibling temporary file and rename it into place, so readers in
/// other processes never see a half-written record.
pub async fn write_json_atomic<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }
    let json = serde_json::to_vec_pretty(value).context("Failed to serialize JSON")?;
    let tmp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    fs::write(&tmp_path, &json)
        .await
        .with_context(|| format!("Failed to write file at path: {:?}", tmp_path))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("Failed to move {:?} into place at {:?}", tmp_path, path))
}

/// Append one JSON record as a line to a JSONL file.
pub async fn append_jsonl<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let mut line = serde_json::to_vec(value).context("Failed to serialize JSON")?;
    line.push(b'\n');
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open file at path: {:?}", path))?;
    file.write_all(&line)
        .await
        .with_context(|| format!("Failed to append to file at path: {:?}", path))?;
    file.flush()
        .await
        .with_context(|| format!("Failed to flush file at path: {:?}", path))
}

/// Delete a file, treating "already gone" as success.
pub async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to delete file at path: {:?}", path)),
    }
}
