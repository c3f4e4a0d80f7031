//! Snapshot archives of the deployed tree.
//!
//! Local snapshots are zip files written in-process. Entry names are relative to the deploy
//! root so that extracting over the deploy root puts every file back where it was taken from.
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::DeployError;

pub const SNAPSHOT_PREFIX: &str = "backup_";

/// `20240131_235959`, UTC.
pub fn timestamp(now: OffsetDateTime) -> Result<String, DeployError> {
    let format = format_description!("[year][month][day]_[hour][minute][second]");
    now.format(&format)
        .map_err(|e| DeployError::Archive(format!("formatting timestamp: {e}")))
}

/// Inverse of [timestamp]. Used to order snapshots by when they were taken rather than by
/// filesystem mtime.
pub fn parse_timestamp(value: &str) -> Option<OffsetDateTime> {
    let format = format_description!("[year][month][day]_[hour][minute][second]");
    PrimitiveDateTime::parse(value, &format)
        .ok()
        .map(|dt| dt.assume_utc())
}

pub fn snapshot_name(now: OffsetDateTime, extension: &str) -> Result<String, DeployError> {
    Ok(format!("{SNAPSHOT_PREFIX}{}.{extension}", timestamp(now)?))
}

/// Timestamp embedded in a snapshot file name, if it is one of ours.
pub fn snapshot_time(file_name: &str) -> Option<OffsetDateTime> {
    let rest = file_name.strip_prefix(SNAPSHOT_PREFIX)?;
    let stamp = rest.split('.').next()?;
    parse_timestamp(stamp)
}

/// Most recent snapshot in `dir` by embedded timestamp.
pub fn latest_snapshot(dir: &Path) -> Result<Option<PathBuf>, DeployError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(DeployError::io(format!("listing {}", dir.display()), e)),
    };

    let mut latest: Option<(OffsetDateTime, PathBuf)> = None;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(taken) = snapshot_time(&name) {
            if latest.as_ref().map_or(true, |(t, _)| taken > *t) {
                latest = Some((taken, entry.path()));
            }
        }
    }
    Ok(latest.map(|(_, path)| path))
}

fn entry_name(path: &Path, base: &Path) -> Result<String, DeployError> {
    let relative = path.strip_prefix(base).map_err(|_| {
        DeployError::Archive(format!(
            "{} is not below {}",
            path.display(),
            base.display()
        ))
    })?;
    //Zip entry names always use forward slashes
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    Ok(parts.join("/"))
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> u32 {
    0o644
}

fn add_tree(
    writer: &mut ZipWriter<File>,
    dir: &Path,
    base: &Path,
    options: SimpleFileOptions,
    count: &mut usize,
) -> Result<(), DeployError> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| DeployError::io(format!("reading {}", dir.display()), e))?
        .flatten()
        .map(|e| e.path())
        .collect();
    entries.sort();

    for path in entries {
        let metadata = fs::symlink_metadata(&path)
            .map_err(|e| DeployError::io(format!("inspecting {}", path.display()), e))?;
        let name = entry_name(&path, base)?;

        if metadata.file_type().is_symlink() {
            //Links are usually venv interpreters, left in place on restore
            debug!("ARCHIVE: Skipping symlink {}", path.display());
        } else if metadata.is_dir() {
            writer.add_directory(name, options)?;
            add_tree(writer, &path, base, options, count)?;
        } else {
            writer.start_file(name, options.unix_permissions(file_mode(&metadata)))?;
            let mut source = File::open(&path)
                .map_err(|e| DeployError::io(format!("opening {}", path.display()), e))?;
            io::copy(&mut source, writer)
                .map_err(|e| DeployError::io(format!("archiving {}", path.display()), e))?;
            *count += 1;
        }
    }
    Ok(())
}

/// Compresses `tree` into a new zip at `dest`, naming entries relative to `base`. Returns the
/// number of files written.
pub fn write_zip(tree: &Path, base: &Path, dest: &Path) -> Result<usize, DeployError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| DeployError::io(format!("creating {}", parent.display()), e))?;
    }
    let file = File::create(dest)
        .map_err(|e| DeployError::io(format!("creating {}", dest.display()), e))?;

    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut count = 0;

    writer.add_directory(entry_name(tree, base)?, options)?;
    add_tree(&mut writer, tree, base, options, &mut count)?;
    writer.finish()?;
    Ok(count)
}

/// Extracts every entry of `archive` below `into`, overwriting files that already exist.
/// Files not present in the archive are left alone.
pub fn extract_zip(archive: &Path, into: &Path) -> Result<usize, DeployError> {
    let file = File::open(archive)
        .map_err(|e| DeployError::io(format!("opening {}", archive.display()), e))?;
    let mut zip = ZipArchive::new(file)?;

    let mut count = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(DeployError::Archive(format!(
                "{} contains an entry outside the archive root: {}",
                archive.display(),
                entry.name()
            )));
        };
        let dest = into.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&dest)
                .map_err(|e| DeployError::io(format!("creating {}", dest.display()), e))?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| DeployError::io(format!("creating {}", parent.display()), e))?;
        }
        let mut out = File::create(&dest)
            .map_err(|e| DeployError::io(format!("creating {}", dest.display()), e))?;
        io::copy(&mut entry, &mut out)
            .map_err(|e| DeployError::io(format!("restoring {}", dest.display()), e))?;
        restore_mode(&dest, entry.unix_mode())?;
        count += 1;
    }
    Ok(count)
}

#[cfg(unix)]
fn restore_mode(path: &Path, mode: Option<u32>) -> Result<(), DeployError> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
            .map_err(|e| DeployError::io(format!("setting mode on {}", path.display()), e))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn restore_mode(_path: &Path, _mode: Option<u32>) -> Result<(), DeployError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use time::macros::datetime;

    use super::{
        extract_zip, latest_snapshot, parse_timestamp, snapshot_name, snapshot_time, timestamp,
        write_zip,
    };

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "amarktai-archive-{}-{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_that_timestamp_round_trips_through_name() {
        let now = datetime!(2024-01-31 23:59:58 UTC);
        assert_eq!(timestamp(now).unwrap(), "20240131_235958");

        let name = snapshot_name(now, "tar.gz").unwrap();
        assert_eq!(name, "backup_20240131_235958.tar.gz");
        assert_eq!(snapshot_time(&name), Some(now));
        assert_eq!(parse_timestamp("not-a-time"), None);
        assert_eq!(snapshot_time("notes.txt"), None);
    }

    #[test]
    fn test_that_latest_snapshot_uses_embedded_time() {
        let dir = scratch("latest");
        fs::write(dir.join("backup_20240101_000000.zip"), "").unwrap();
        fs::write(dir.join("backup_20240301_120000.zip"), "").unwrap();
        fs::write(dir.join("backup_20240215_080000.zip"), "").unwrap();
        fs::write(dir.join("deploy_history.csv"), "").unwrap();

        let latest = latest_snapshot(&dir).unwrap().unwrap();
        assert_eq!(latest, dir.join("backup_20240301_120000.zip"));
        assert!(latest_snapshot(&dir.join("missing")).unwrap().is_none());
    }

    #[test]
    fn test_that_restore_overwrites_changed_files() {
        let root = scratch("restore");
        let deploy = root.join("app");
        fs::create_dir_all(deploy.join("backend/routes")).unwrap();
        fs::write(deploy.join("backend/server.py"), "v1").unwrap();
        fs::write(deploy.join("backend/routes/system.py"), "ping v1").unwrap();

        let archive = root.join("backups/backup_20240101_000000.zip");
        let written = write_zip(&deploy.join("backend"), &deploy, &archive).unwrap();
        assert_eq!(written, 2);

        fs::write(deploy.join("backend/server.py"), "v2").unwrap();
        fs::write(deploy.join("backend/new.py"), "added").unwrap();

        let restored = extract_zip(&archive, &deploy).unwrap();
        assert_eq!(restored, 2);
        assert_eq!(
            fs::read_to_string(deploy.join("backend/server.py")).unwrap(),
            "v1"
        );
        assert_eq!(
            fs::read_to_string(deploy.join("backend/routes/system.py")).unwrap(),
            "ping v1"
        );
        //Extraction is an overlay, not a mirror
        assert!(deploy.join("backend/new.py").exists());
    }
}
