//! Site list file loader.
//!
//! Site lists use the simple domain-list format: one domain per line, `#`
//! starts a comment line, blank lines are ignored and whitespace is trimmed.
//!
//! ```text
//! # Social
//! facebook.com
//! instagram.com
//! ```

use std::io::BufRead;
use std::path::{Path, PathBuf};

/// Error type for site list loading operations.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// File was not found at the specified path.
    #[error("file not found: {0:?}")]
    NotFound(PathBuf),

    /// Permission denied when accessing the file.
    #[error("permission denied: {0:?}")]
    PermissionDenied(PathBuf),

    /// I/O error while reading the file.
    #[error("I/O error reading {path:?}")]
    Io {
        /// Path to the file that caused the error.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Parse site list content into raw domain entries.
///
/// # Errors
///
/// Returns an I/O error if reading from `reader` fails.
pub fn parse_site_list(reader: &mut dyn BufRead) -> std::io::Result<Vec<String>> {
    let mut sites = Vec::new();
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        sites.push(trimmed.to_string());
    }

    Ok(sites)
}

/// Load a site list from a local file.
///
/// # Errors
///
/// Returns a [`LoadError`] if the file is missing, unreadable, or not UTF-8.
pub async fn load_site_list(path: &Path) -> Result<Vec<String>, LoadError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => LoadError::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => LoadError::PermissionDenied(path.to_path_buf()),
            _ => LoadError::Io {
                path: path.to_path_buf(),
                source: err,
            },
        })?;

    let sites = parse_site_list(&mut content.as_bytes()).map_err(|err| LoadError::Io {
        path: path.to_path_buf(),
        source: err,
    })?;

    tracing::debug!(path = ?path, count = sites.len(), "loaded site list");
    Ok(sites)
}
