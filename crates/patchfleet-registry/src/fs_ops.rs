use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

/// Writes `content` next to `destination` and renames it into place, so a
/// concurrent reader sees either the old file or the new one, never a
/// partial write.
pub(crate) fn write_file_atomically(destination: &Path, content: &[u8]) -> Result<()> {
    let parent = destination
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent)
        .with_context(|| format!("failed creating cache directory {}", parent.display()))?;

    let file_name = destination
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("buildref-cache.json");
    let staged = parent.join(format!(
        ".{file_name}.tmp-{}-{}",
        std::process::id(),
        unique_suffix()
    ));

    if let Err(err) = fs::write(&staged, content) {
        let _ = fs::remove_file(&staged);
        return Err(err)
            .with_context(|| format!("failed writing staged cache file {}", staged.display()));
    }

    if let Err(err) = fs::rename(&staged, destination) {
        let _ = fs::remove_file(&staged);
        return Err(err).with_context(|| {
            format!(
                "failed moving staged cache file into place: {}",
                destination.display()
            )
        });
    }

    Ok(())
}

pub(crate) fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed reading {}", path.display())),
    }
}

pub(crate) fn unique_suffix() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}
