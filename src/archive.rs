//! Streaming backup and restore of a server directory.
//!
//! Archives are tar streams wrapped in gzip, named `backup-<YYYYMMDD-HHMMSS>.tar.gz`, each
//! with a `.sha256` sidecar. The backup store is pruned from the walk so an archive never
//! contains earlier archives.
use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufReader, BufWriter, Read, Write},
    os::unix::fs::PermissionsExt,
    path::{Component, Path, PathBuf},
};

use chrono::{Local, NaiveDateTime};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use sha2::{Digest, Sha256};
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, info, warn};

use crate::constants::{
    BACKUP_DIR_NAME, BACKUP_FILE_EXTENSION, BACKUP_FILE_PREFIX, BACKUP_TIMESTAMP_FORMAT,
    CHECKSUM_SIDECAR_EXTENSION,
};
use crate::error::ArchiveError;

/// Counts of what a restore wrote.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestoreSummary {
    pub directories: usize,
    pub files: usize,
    pub symlinks: usize,
    pub skipped: usize,
}

/// Writes `reader` into a hasher and returns the lowercase hex digest.
fn sha256_hex(mut reader: impl Read) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn sidecar_path(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(CHECKSUM_SIDECAR_EXTENSION);
    PathBuf::from(name)
}

/// Creates a new archive file under `destination` that no other backup is using.
fn create_archive_file(destination: &Path) -> io::Result<(PathBuf, File)> {
    let stamp = Local::now().format(BACKUP_TIMESTAMP_FORMAT).to_string();

    let mut attempt = 0u32;
    loop {
        let name = if attempt == 0 {
            format!("{BACKUP_FILE_PREFIX}{stamp}{BACKUP_FILE_EXTENSION}")
        } else {
            format!("{BACKUP_FILE_PREFIX}{stamp}-{attempt}{BACKUP_FILE_EXTENSION}")
        };
        let path = destination.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
            Err(err) => return Err(err),
        }
    }
}

/// Archives `source` into a new timestamp-named file under `destination`.
///
/// The walk is sorted, so the same tree always produces records in the same order. If
/// `destination` lies inside `source` its subtree is skipped entirely. A failure part way
/// through leaves a truncated archive behind; earlier archives are never touched.
pub fn create_backup(source: &Path, destination: &Path) -> Result<PathBuf, ArchiveError> {
    fs::create_dir_all(destination)?;
    let source = source.canonicalize()?;
    let excluded = destination.canonicalize()?;

    let (archive_path, file) = create_archive_file(destination)?;
    debug!(
        "Writing backup of {} to {}",
        source.display(),
        archive_path.display()
    );

    let result = write_archive(&source, &excluded, file);
    if let Err(err) = result {
        warn!(
            "Backup {} is incomplete and should not be restored: {err}",
            archive_path.display()
        );
        return Err(err.into());
    }

    let checksum = sha256_hex(BufReader::new(File::open(&archive_path)?))?;
    let file_name = archive_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    fs::write(sidecar_path(&archive_path), format!("{checksum}  {file_name}\n"))?;

    info!("Backup written to {}", archive_path.display());
    Ok(archive_path)
}

fn write_archive(source: &Path, excluded: &Path, file: File) -> io::Result<()> {
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);

    append_tree(&mut builder, source, source, excluded)?;

    let encoder = builder.into_inner()?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    writer.get_ref().sync_all()
}

fn append_tree<W: Write>(
    builder: &mut Builder<W>,
    root: &Path,
    dir: &Path,
    excluded: &Path,
) -> io::Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        if path == excluded {
            debug!("Skipping backup store {}", path.display());
            continue;
        }

        let relative = match path.strip_prefix(root) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => continue,
        };
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            builder.append_dir(&relative, &path)?;
            append_tree(builder, root, &path, excluded)?;
        } else if file_type.is_file() {
            append_file(builder, &path, &relative)?;
        } else if file_type.is_symlink() {
            builder.append_path_with_name(&path, &relative)?;
        } else {
            debug!("Skipping special file {}", path.display());
        }
    }

    Ok(())
}

/// Streams one regular file into the archive.
///
/// The size recorded in the header is taken from the open handle; content is clamped or
/// zero-padded to it so a file growing or shrinking mid-read cannot break tar framing.
fn append_file<W: Write>(builder: &mut Builder<W>, path: &Path, relative: &Path) -> io::Result<()> {
    let file = File::open(path)?;
    let metadata = file.metadata()?;
    let size = metadata.len();

    let mut header = Header::new_gnu();
    header.set_metadata(&metadata);
    header.set_size(size);

    let data = file.take(size).chain(io::repeat(0)).take(size);
    builder.append_data(&mut header, relative, data)
}

/// Rejects absolute paths and parent-directory components.
fn safe_relative(path: &Path) -> Option<&Path> {
    let safe = path
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
    safe.then_some(path)
}

/// Creates `relative` under `root` one component at a time.
///
/// An existing symlink along the way is followed only when it resolves inside `root`, so
/// no entry can be written through a link that escapes the restore target.
fn create_dir_within(root: &Path, relative: &Path, entry: &Path) -> Result<PathBuf, ArchiveError> {
    let mut current = root.to_path_buf();
    for component in relative.components() {
        let Component::Normal(name) = component else {
            continue;
        };
        current.push(name);
        match current.symlink_metadata() {
            Ok(meta) if meta.file_type().is_symlink() => {
                if !current.canonicalize()?.starts_with(root) {
                    return Err(ArchiveError::UnsafePath(entry.to_path_buf()));
                }
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => fs::create_dir(&current)?,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(current)
}

fn is_in_backup_store(path: &Path) -> bool {
    path.components()
        .find(|component| !matches!(component, Component::CurDir))
        .is_some_and(|first| first.as_os_str() == BACKUP_DIR_NAME)
}

/// Verifies `archive` against its sidecar when one exists.
pub fn verify_backup(archive: &Path) -> Result<(), ArchiveError> {
    let sidecar = sidecar_path(archive);
    let recorded = match fs::read_to_string(&sidecar) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!("No checksum recorded for {}", archive.display());
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    let expected = recorded
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    let actual = sha256_hex(BufReader::new(File::open(archive)?))?;

    if expected != actual {
        return Err(ArchiveError::ChecksumMismatch {
            path: archive.to_path_buf(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Restores `archive` into `target`.
///
/// Entries under the backup store are skipped. Existing files are truncated and
/// overwritten. This is not transactional: an error mid-stream leaves a partially restored
/// tree.
pub fn restore_backup(archive: &Path, target: &Path) -> Result<RestoreSummary, ArchiveError> {
    if !archive.is_file() {
        return Err(ArchiveError::NotFound(archive.to_path_buf()));
    }
    verify_backup(archive)?;

    fs::create_dir_all(target)?;
    let root = target.canonicalize()?;
    let decoder = GzDecoder::new(BufReader::new(File::open(archive)?));
    let mut tar = Archive::new(decoder);
    let mut summary = RestoreSummary::default();
    // Applied after the walk so a read-only directory can still receive its contents.
    let mut directory_modes = Vec::new();

    for entry in tar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if is_in_backup_store(&path) {
            summary.skipped += 1;
            continue;
        }
        let relative = safe_relative(&path).ok_or_else(|| ArchiveError::UnsafePath(path.clone()))?;
        let destination = root.join(relative);
        let mode = entry.header().mode().unwrap_or(0o644);

        match entry.header().entry_type() {
            EntryType::Directory => {
                create_dir_within(&root, relative, &path)?;
                directory_modes.push((destination, mode));
                summary.directories += 1;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = relative.parent() {
                    create_dir_within(&root, parent, &path)?;
                }
                if destination.symlink_metadata().is_ok_and(|meta| meta.file_type().is_symlink()) {
                    fs::remove_file(&destination)?;
                }
                let mut file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&destination)?;
                io::copy(&mut entry, &mut file)?;
                file.set_permissions(fs::Permissions::from_mode(mode))?;
                summary.files += 1;
            }
            EntryType::Symlink => {
                if let Some(parent) = relative.parent() {
                    create_dir_within(&root, parent, &path)?;
                }
                if destination.symlink_metadata().is_ok() {
                    fs::remove_file(&destination)?;
                }
                entry.unpack_in(&root)?;
                summary.symlinks += 1;
            }
            other => {
                debug!("Skipping {:?} entry {}", other, path.display());
                summary.skipped += 1;
            }
        }
    }

    // Deepest first, so a parent never loses write access before its children are set.
    directory_modes.sort_by(|(a, _), (b, _)| b.cmp(a));
    for (directory, mode) in directory_modes {
        fs::set_permissions(&directory, fs::Permissions::from_mode(mode))?;
    }

    info!(
        "Restored {} files and {} directories from {}",
        summary.files,
        summary.directories,
        archive.display()
    );
    Ok(summary)
}

/// Lists archives in `store`, oldest first. A missing store yields an empty list.
pub fn list_backups(store: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let entries = match fs::read_dir(store) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut backups = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(BACKUP_FILE_PREFIX)
            && name.ends_with(BACKUP_FILE_EXTENSION)
            && entry.file_type()?.is_file()
        {
            backups.push(entry.path());
        }
    }

    backups.sort_by_cached_key(|path| (archive_order(path), path.clone()));
    Ok(backups)
}

/// Creation order of an archive name: its timestamp, then its collision suffix.
///
/// Names that do not carry a timestamp sort before every timestamped archive.
fn archive_order(path: &Path) -> Option<(NaiveDateTime, u32)> {
    let name = path.file_name()?.to_str()?;
    let stem = name
        .strip_prefix(BACKUP_FILE_PREFIX)?
        .strip_suffix(BACKUP_FILE_EXTENSION)?;

    if let Ok(stamp) = NaiveDateTime::parse_from_str(stem, BACKUP_TIMESTAMP_FORMAT) {
        return Some((stamp, 0));
    }
    let (stamp, suffix) = stem.rsplit_once('-')?;
    let stamp = NaiveDateTime::parse_from_str(stamp, BACKUP_TIMESTAMP_FORMAT).ok()?;
    Some((stamp, suffix.parse().ok()?))
}

/// Deletes all but the newest `keep` archives (and their sidecars) in `store`.
pub fn prune_backups(store: &Path, keep: usize) -> Result<Vec<PathBuf>, ArchiveError> {
    let backups = list_backups(store)?;
    let excess = backups.len().saturating_sub(keep);
    let mut removed = Vec::with_capacity(excess);

    for archive in backups.into_iter().take(excess) {
        fs::remove_file(&archive)?;
        let sidecar = sidecar_path(&archive);
        if let Err(err) = fs::remove_file(&sidecar)
            && err.kind() != io::ErrorKind::NotFound
        {
            return Err(err.into());
        }
        debug!("Pruned backup {}", archive.display());
        removed.push(archive);
    }

    Ok(removed)
}
