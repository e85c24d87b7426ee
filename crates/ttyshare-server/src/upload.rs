//! Viewer file uploads
//!
//! Files land flat in one directory; the filename a viewer sends is never
//! allowed to pick a different one.

use crate::error::{RelayError, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Reduce a viewer-supplied name to a bare filename. `None` for anything
/// that could escape the upload directory.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let name = name.trim();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    if name.contains(['/', '\\', '\0']) {
        return None;
    }
    Some(name.to_string())
}

/// Store an upload and return its absolute path
pub async fn save_upload(
    upload_dir: &Path,
    filename: &str,
    content: &[u8],
    max_bytes: usize,
) -> Result<PathBuf> {
    let name = sanitize_filename(filename)
        .ok_or_else(|| RelayError::Upload(format!("invalid filename {:?}", filename)))?;
    if content.len() > max_bytes {
        return Err(RelayError::Upload(format!(
            "{} is {} bytes, limit is {}",
            name,
            content.len(),
            max_bytes
        )));
    }

    tokio::fs::create_dir_all(upload_dir).await?;
    let dir = tokio::fs::canonicalize(upload_dir).await?;
    let path = dir.join(&name);
    tokio::fs::write(&path, content).await?;

    info!("Saved upload {} ({} bytes)", path.display(), content.len());
    Ok(path)
}
