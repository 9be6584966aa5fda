//! Archive extraction for downloaded packages.
//!
//! npm tarballs wrap their contents in a `package/` directory, and git-host
//! archives in `owner-repo-sha/`. Extraction therefore goes through a
//! temporary sibling directory first: when exactly one top-level directory
//! comes out, its contents are promoted into the destination; otherwise the
//! entries land as-is.

mod zip;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use flate2::read::GzDecoder;
use log::debug;
use tar::Archive;

pub use zip::extract_zip;

use crate::runtime::Runtime;

/// Extract an archive, dispatching on the file extension.
pub fn extract_archive(
    runtime: &Arc<dyn Runtime>,
    archive_path: &Path,
    extract_to: &Path,
) -> Result<()> {
    let name = archive_path.to_string_lossy().to_lowercase();
    if name.ends_with(".zip") {
        extract_zip(runtime, archive_path, extract_to)
    } else {
        extract_tar_gz(runtime, archive_path, extract_to)
    }
}

/// Extract a gzipped tarball into `extract_to`.
#[tracing::instrument(skip(runtime))]
pub fn extract_tar_gz(
    runtime: &Arc<dyn Runtime>,
    archive_path: &Path,
    extract_to: &Path,
) -> Result<()> {
    debug!("Extracting tarball to {:?}...", extract_to);
    let file = runtime
        .open(archive_path)
        .with_context(|| format!("Failed to open archive at {:?}", archive_path))?;
    let decoder = GzDecoder::new(file);
    let mut archive = Archive::new(decoder);

    let temp_dir = temp_sibling(extract_to)?;
    if runtime.exists(&temp_dir) {
        runtime.remove_dir_all(&temp_dir)?;
    }
    runtime.create_dir_all(&temp_dir)?;

    for entry in archive.entries().context("Failed to read archive entries")? {
        let mut entry = entry?;
        let entry_type = entry.header().entry_type();

        // PAX global/extended headers are metadata, not files.
        if entry_type == tar::EntryType::XGlobalHeader || entry_type == tar::EntryType::XHeader {
            continue;
        }

        let entry_path = entry.path()?.to_path_buf();
        let full_path = safe_join(&temp_dir, &entry_path)?;

        if entry_type.is_dir() {
            runtime.create_dir_all(&full_path)?;
        } else if entry_type.is_file() {
            if let Some(parent) = full_path.parent() {
                runtime.create_dir_all(parent)?;
            }
            let mut dest = runtime.create_file(&full_path)?;
            std::io::copy(&mut entry, &mut dest)
                .with_context(|| format!("Failed to extract {:?}", full_path))?;
        }
        // Symlinks and hard links are dropped: package contents are plain files.
    }

    promote_contents(runtime, &temp_dir, extract_to)
}

/// Reject archive entries that would escape the extraction root.
pub(crate) fn safe_join(root: &Path, entry: &Path) -> Result<PathBuf> {
    let mut out = root.to_path_buf();
    for component in entry.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(anyhow!("archive entry {:?} escapes the extraction root", entry)),
        }
    }
    Ok(out)
}

fn temp_sibling(extract_to: &Path) -> Result<PathBuf> {
    let name = extract_to
        .file_name()
        .ok_or_else(|| anyhow!("extraction target {:?} has no file name", extract_to))?;
    Ok(extract_to.with_file_name(format!("{}_unpack", name.to_string_lossy())))
}

/// Move the unpacked tree into place, flattening a single top-level directory.
pub(crate) fn promote_contents(
    runtime: &Arc<dyn Runtime>,
    temp_dir: &Path,
    extract_to: &Path,
) -> Result<()> {
    let entries = runtime
        .read_dir(temp_dir)
        .context("Failed to read unpack directory")?;

    let source_dir = match entries.as_slice() {
        [] => return Err(anyhow!("archive appears to be empty")),
        [single] if runtime.is_dir(single) => single.clone(),
        _ => temp_dir.to_path_buf(),
    };

    runtime.create_dir_all(extract_to)?;
    for item in runtime.read_dir(&source_dir)? {
        let name = item
            .file_name()
            .ok_or_else(|| anyhow!("unpacked entry {:?} has no file name", item))?;
        runtime.rename(&item, &extract_to.join(name))?;
    }

    runtime.remove_dir_all(temp_dir)?;
    Ok(())
}
