use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::index::IndexRecord;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ManifestEntry {
    name: String,
    path: String,
    last_modified_date_time: Option<String>,
}

/// Writes a human-readable `id -> {name, path, lastModifiedDateTime}` map
/// of the index, replacing the previous file atomically.
pub async fn write_manifest(target: &Path, records: &[IndexRecord]) -> Result<(), ManifestError> {
    let entries: BTreeMap<&str, ManifestEntry> = records
        .iter()
        .map(|record| {
            (
                record.id.as_str(),
                ManifestEntry {
                    name: record.name.clone(),
                    path: record.local_path.to_string_lossy().into_owned(),
                    last_modified_date_time: record.modified_at.and_then(format_timestamp),
                },
            )
        })
        .collect();
    let body = serde_json::to_vec_pretty(&entries)?;

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = target.with_extension("json.tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, target).await?;
    Ok(())
}

fn format_timestamp(unix: i64) -> Option<String> {
    OffsetDateTime::from_unix_timestamp(unix)
        .ok()
        .and_then(|value| value.format(&Rfc3339).ok())
}
