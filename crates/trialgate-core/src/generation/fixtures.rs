//! Offline replay of saved candidates.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::domain::{EngineError, Result};

use super::{CandidateGenerator, GenerationError, GenerationRequest};

/// Serves saved candidate files in name order, trial `i` getting file
/// `i % len`.
#[derive(Debug, Clone)]
pub struct FixtureGenerator {
    files: Vec<PathBuf>,
}

impl FixtureGenerator {
    /// Collect every `.py` file in `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            EngineError::config(format!("cannot read candidates dir {}: {e}", dir.display()))
        })?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "py") {
                files.push(path);
            }
        }
        files.sort();
        Self::from_files(files)
    }

    pub fn from_files(files: Vec<PathBuf>) -> Result<Self> {
        if files.is_empty() {
            return Err(EngineError::config("no candidate files to replay"));
        }
        Ok(Self { files })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    fn file_for(&self, trial_index: usize) -> &Path {
        &self.files[trial_index % self.files.len()]
    }
}

#[async_trait]
impl CandidateGenerator for FixtureGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest<'_>,
    ) -> std::result::Result<String, GenerationError> {
        let path = self.file_for(request.trial_index);
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GenerationError::Fixture(format!("{}: {e}", path.display())))
    }

    fn name(&self) -> &str {
        "fixtures"
    }
}
