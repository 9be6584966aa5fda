//! Zip archive extraction.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::debug;
use zip::ZipArchive;

use super::{promote_contents, safe_join};
use crate::runtime::Runtime;

/// Extract a `.zip` archive into `extract_to`, flattening a single top-level
/// directory the same way the tarball path does.
pub fn extract_zip(
    runtime: &Arc<dyn Runtime>,
    archive_path: &Path,
    extract_to: &Path,
) -> Result<()> {
    debug!("Extracting zip archive to {:?}...", extract_to);

    // The zip format needs Seek; buffer the archive since Runtime::open only
    // hands out readers. Package archives are small enough for this.
    let mut reader = runtime
        .open(archive_path)
        .with_context(|| format!("Failed to open archive at {:?}", archive_path))?;
    let mut buffer = Vec::new();
    reader
        .read_to_end(&mut buffer)
        .with_context(|| format!("Failed to read archive {:?}", archive_path))?;

    let mut archive = ZipArchive::new(std::io::Cursor::new(buffer))
        .context("Failed to parse ZIP archive")?;

    let name = extract_to
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("extraction target {:?} has no file name", extract_to))?;
    let temp_dir = extract_to.with_file_name(format!("{}_unpack", name.to_string_lossy()));
    if runtime.exists(&temp_dir) {
        runtime.remove_dir_all(&temp_dir)?;
    }
    runtime.create_dir_all(&temp_dir)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).context("Failed to read zip entry")?;
        let Some(entry_path) = entry.enclosed_name() else {
            // enclosed_name already rejects traversal; skip anything dubious.
            continue;
        };
        let full_path = safe_join(&temp_dir, &entry_path)?;

        if entry.is_dir() {
            runtime.create_dir_all(&full_path)?;
        } else {
            if let Some(parent) = full_path.parent() {
                runtime.create_dir_all(parent)?;
            }
            let mut dest = runtime.create_file(&full_path)?;
            std::io::copy(&mut entry, &mut dest)
                .with_context(|| format!("Failed to extract {:?}", full_path))?;
        }
    }

    promote_contents(runtime, &temp_dir, extract_to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RealRuntime;
    use std::fs;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    fn make_zip(files: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, content) in files {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_extract_zip_flattens_single_dir() {
        let dir = tempdir().unwrap();
        let archive_path = dir.path().join("pkg.zip");
        fs::write(
            &archive_path,
            make_zip(&[
                ("repo-abc123/package.json", r#"{"name":"z","version":"1.0.0"}"#),
                ("repo-abc123/index.js", "module.exports = 'z';"),
            ]),
        )
        .unwrap();

        let dest = dir.path().join("out");
        let runtime: Arc<dyn Runtime> = Arc::new(RealRuntime);
        extract_zip(&runtime, &archive_path, &dest).unwrap();

        assert!(dest.join("package.json").exists());
        assert!(dest.join("index.js").exists());
    }

    #[test]
    fn test_extract_zip_rejects_garbage() {
        let dir = tempdir().unwrap();
        let archive_path = dir.path().join("bad.zip");
        fs::write(&archive_path, "not a zip").unwrap();

        let dest = dir.path().join("out");
        let runtime: Arc<dyn Runtime> = Arc::new(RealRuntime);
        assert!(extract_zip(&runtime, &archive_path, &dest).is_err());
    }
}
