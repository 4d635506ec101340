//! Dataset acquisition.
//!
//! A dataset is either a local file or an HTTP(S) URL. URLs are downloaded
//! once into the data directory; an existing file with the same name is
//! reused. The resolved absolute path is what the entrypoint receives.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::domain::{EngineError, Result};

const FALLBACK_FILE_NAME: &str = "custom_dataset.csv";

/// Where a dataset comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetRef {
    Local(PathBuf),
    Remote { url: String, file_name: Option<String> },
}

impl DatasetRef {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            Self::Remote {
                url: trimmed.to_string(),
                file_name: None,
            }
        } else {
            Self::Local(PathBuf::from(trimmed))
        }
    }

    /// Save a downloaded dataset under `name` instead of the URL's file name.
    pub fn with_file_name(self, name: impl Into<String>) -> Self {
        match self {
            Self::Remote { url, .. } => Self::Remote {
                url,
                file_name: Some(name.into()),
            },
            local => local,
        }
    }

    /// Resolve to an absolute local path, downloading into `data_dir` if
    /// needed.
    pub async fn resolve(&self, data_dir: &Path) -> Result<PathBuf> {
        match self {
            Self::Local(path) => resolve_local(path),
            Self::Remote { url, file_name } => {
                let name = file_name
                    .clone()
                    .unwrap_or_else(|| file_name_from_url(url));
                let target = data_dir.join(name);
                if target.is_file() {
                    info!(path = %target.display(), "dataset already present, skipping download");
                } else {
                    download(url, data_dir, &target).await?;
                }
                resolve_local(&target)
            }
        }
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Remote { url, .. } => f.write_str(url),
        }
    }
}

fn resolve_local(path: &Path) -> Result<PathBuf> {
    if !path.is_file() {
        return Err(EngineError::Dataset(format!(
            "dataset {} does not exist",
            path.display()
        )));
    }
    path.canonicalize()
        .map_err(|e| EngineError::Dataset(format!("cannot resolve {}: {e}", path.display())))
}

/// Last URL path segment when it looks like a file name.
pub fn file_name_from_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let after_scheme = without_query
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_query);
    let path = after_scheme.split_once('/').map(|(_, p)| p).unwrap_or("");
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() && name.contains('.') => name.to_string(),
        _ => FALLBACK_FILE_NAME.to_string(),
    }
}

async fn download(url: &str, data_dir: &Path, target: &Path) -> Result<()> {
    info!(url = %url, path = %target.display(), "downloading dataset");
    tokio::fs::create_dir_all(data_dir).await.map_err(|e| {
        EngineError::Dataset(format!("cannot create {}: {e}", data_dir.display()))
    })?;

    let response = reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| EngineError::Dataset(format!("download of {url} failed: {e}")))?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| EngineError::Dataset(format!("download of {url} failed: {e}")))?;

    let partial = target.with_extension("part");
    tokio::fs::write(&partial, &bytes).await?;
    tokio::fs::rename(&partial, target).await?;
    info!(bytes = bytes.len(), "dataset saved");
    Ok(())
}
