//! Application metadata from binary paths and the operating system.

use async_trait::async_trait;
use std::path::Path;

/// Error from an OS metadata query.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("not supported on this platform")]
    NotSupported,

    #[error("binary not found")]
    NotFound,

    #[error("empty output")]
    EmptyOutput,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl MetadataError {
    /// Whether the error is an ordinary outcome that should not be reported.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            MetadataError::NotSupported | MetadataError::NotFound | MetadataError::EmptyOutput
        )
    }
}

/// Queries the operating system for application details.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// A display name for the binary at `path`.
    async fn binary_name(&self, path: &Path) -> Result<String, MetadataError>;
}

/// Metadata source for platforms without a richer name lookup.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSystemMetadata;

#[async_trait]
impl MetadataSource for NoSystemMetadata {
    async fn binary_name(&self, _path: &Path) -> Result<String, MetadataError> {
        Err(MetadataError::NotSupported)
    }
}

/// The bare filename of `path`.
pub fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Generate a display name from a binary path: the last extension is
/// dropped, separators become spaces and every word is capitalized.
pub fn generate_binary_name(path: &str) -> String {
    let name = file_name(path);
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    };

    stem.split(['.', '-', '_', ' '])
        .filter(|word| !word.is_empty())
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
