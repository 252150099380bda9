//! Builds the tar archives streamed into a job to deliver its artifacts.
//!
//! Archives are built in memory with deterministic headers so that delivering the same inputs twice
//! sends the same bytes.

use std::io::Write;
use std::path::Path;

use anyhow::Context;
use gust_core::prelude::GustResult;
use tar::{Builder, Header};
use walkdir::WalkDir;

const FILE_MODE: u32 = 0o644;
const EXECUTABLE_MODE: u32 = 0o755;

/// Archive a single executable under its file name.
pub fn executable_archive(path: &Path) -> GustResult<Vec<u8>> {
    let name = file_name(path)?;
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read executable {}", path.display()))?;

    let mut tar = new_builder();
    write_entry(&mut tar, &name, &data, EXECUTABLE_MODE)?;
    finish(tar)
}

/// Archive every file below `dir`, keyed by its path relative to `dir`.
pub fn context_archive(dir: &Path) -> GustResult<Vec<u8>> {
    if !dir.is_dir() {
        anyhow::bail!("Context path {} is not a directory", dir.display());
    }

    let mut tar = new_builder();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(dir)
            .context("Walked outside of the context directory")?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let data = std::fs::read(entry.path())
            .with_context(|| format!("Failed to read {}", entry.path().display()))?;

        write_entry(&mut tar, &name, &data, mode_of(&entry)?)?;
    }

    finish(tar)
}

/// Archive a single file under `name`, which may contain directories.
pub fn file_archive(name: &str, data: &[u8]) -> GustResult<Vec<u8>> {
    let mut tar = new_builder();
    write_entry(&mut tar, name, data, FILE_MODE)?;
    finish(tar)
}

pub(crate) fn file_name(path: &Path) -> GustResult<String> {
    Ok(path
        .file_name()
        .with_context(|| format!("No file name in {}", path.display()))?
        .to_string_lossy()
        .to_string())
}

fn new_builder() -> Builder<Vec<u8>> {
    let mut tar = Builder::new(Vec::new());
    tar.mode(tar::HeaderMode::Deterministic);
    tar
}

fn write_entry<W: Write>(tar: &mut Builder<W>, path: &str, data: &[u8], mode: u32) -> GustResult<()> {
    let mut header = Header::new_gnu();
    header.set_path(path).with_context(|| format!("Invalid archive path {path}"))?;
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_cksum();

    tar.append(&header, data)
        .with_context(|| format!("Failed to append {path} to archive"))?;
    Ok(())
}

fn finish(tar: Builder<Vec<u8>>) -> GustResult<Vec<u8>> {
    tar.into_inner().context("Failed to finish archive")
}

#[cfg(unix)]
fn mode_of(entry: &walkdir::DirEntry) -> GustResult<u32> {
    use std::os::unix::fs::PermissionsExt;

    let executable = entry.metadata()?.permissions().mode() & 0o111 != 0;
    Ok(if executable { EXECUTABLE_MODE } else { FILE_MODE })
}

#[cfg(not(unix))]
fn mode_of(_entry: &walkdir::DirEntry) -> GustResult<u32> {
    Ok(FILE_MODE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Read;

    fn entries(archive: &[u8]) -> Vec<(String, u32, String)> {
        let mut archive = tar::Archive::new(archive);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let path = entry.path().unwrap().to_string_lossy().to_string();
                let mode = entry.header().mode().unwrap();
                let mut data = String::new();
                entry.read_to_string(&mut data).unwrap();
                (path, mode, data)
            })
            .collect()
    }

    #[test]
    fn context_archive_is_relative_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("nested/c.txt"), "c").unwrap();

        let archive = context_archive(dir.path()).unwrap();

        assert_eq!(
            vec![
                ("a.txt".to_string(), 0o644, "a".to_string()),
                ("b.txt".to_string(), 0o644, "b".to_string()),
                ("nested/c.txt".to_string(), 0o644, "c".to_string()),
            ],
            entries(&archive)
        );
        assert_eq!(archive, context_archive(dir.path()).unwrap());
    }

    #[test]
    fn executable_is_marked_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("suite-bin");
        std::fs::write(&path, "#!/bin/sh").unwrap();

        let archive = executable_archive(&path).unwrap();

        assert_eq!(
            vec![("suite-bin".to_string(), 0o755, "#!/bin/sh".to_string())],
            entries(&archive)
        );
    }

    #[test]
    fn missing_context_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(context_archive(&dir.path().join("missing")).is_err());
    }
}
