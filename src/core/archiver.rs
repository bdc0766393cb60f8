//! Directory archiver.
//!
//! Streams a directory tree into a deflate-compressed zip. Entry names are
//! relative to the source directory, so the directory's own name is not part
//! of the archive. The archive is built next to the output as
//! `<output>.partial` and only renamed into place once it has been finalised
//! and synced, so a failed run never leaves something that looks usable.

use std::fs::{self, File, Metadata};
use std::io::{self, BufWriter, Read, Seek, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Datelike, Local, Timelike};
use thiserror::Error;
use tracing::{debug, info, warn};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::core::progress::{ArchiveProgress, ProgressReporter};

/// Buffer size for file I/O operations
const BUFFER_SIZE: usize = 128 * 1024;

/// Maximum deflate level
const COMPRESSION_LEVEL: i64 = 9;

/// Entries at least this large need zip64 headers
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Source path '{}' does not exist", .0.display())]
    SourceNotFound(PathBuf),

    #[error("Source path '{}' is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("I/O error while archiving '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ArchiveError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn zip(path: &Path, err: ZipError) -> Self {
        let source = match err {
            ZipError::Io(e) => e,
            other => io::Error::other(other),
        };
        Self::io(path, source)
    }
}

/// Source directory and destination file for one archive operation.
#[derive(Debug, Clone)]
pub struct ArchiveTask {
    pub source: PathBuf,
    pub output: PathBuf,
}

/// What a finished archive operation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// Files, directories and links written to the archive
    pub entries: u64,
    /// Bytes read from source files
    pub processed_bytes: u64,
    /// Pre-scan estimate used for progress, if it could be computed
    pub estimated_bytes: Option<u64>,
    /// Size of the finished archive on disk
    pub archive_bytes: u64,
}

/// Run [`archive_directory`] on the blocking thread pool.
pub async fn archive_directory_async(
    task: ArchiveTask,
    progress: Arc<dyn ProgressReporter>,
) -> Result<ArchiveSummary, ArchiveError> {
    let output = task.output.clone();
    tokio::task::spawn_blocking(move || {
        archive_directory(&task.source, &task.output, progress.as_ref())
    })
    .await
    .map_err(|e| ArchiveError::io(&output, io::Error::other(e)))?
}

/// Archive the contents of `source` into the zip file at `output`.
///
/// Fails with [`ArchiveError::SourceNotFound`] before touching `output` when
/// the source is missing. Success is only reported once the archive is
/// finalised, flushed, synced and in place at `output`.
pub fn archive_directory(
    source: &Path,
    output: &Path,
    progress: &dyn ProgressReporter,
) -> Result<ArchiveSummary, ArchiveError> {
    let metadata = match fs::metadata(source) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ArchiveError::SourceNotFound(source.to_path_buf()));
        }
        Err(e) => return Err(ArchiveError::io(source, e)),
    };
    if !metadata.is_dir() {
        return Err(ArchiveError::NotADirectory(source.to_path_buf()));
    }

    let start_time = Instant::now();
    let estimated_bytes = estimate_size(source);
    let summary = archive_with_estimate(source, output, estimated_bytes, progress)?;

    info!(
        output = %output.display(),
        entries = summary.entries,
        processed_bytes = summary.processed_bytes,
        archive_bytes = summary.archive_bytes,
        duration = %humantime::format_duration(round_to_millis(start_time.elapsed())),
        "Archive complete"
    );

    Ok(summary)
}

/// Best-effort pre-scan for the progress total. `None` when the tree cannot be walked.
fn estimate_size(source: &Path) -> Option<u64> {
    match directory_size(source) {
        Ok(total) => Some(total),
        Err(e) => {
            warn!(
                source = %source.display(),
                error = %e,
                "Could not compute directory size, progress total unknown"
            );
            None
        }
    }
}

fn archive_with_estimate(
    source: &Path,
    output: &Path,
    estimated_bytes: Option<u64>,
    progress: &dyn ProgressReporter,
) -> Result<ArchiveSummary, ArchiveError> {
    debug!(
        source = %source.display(),
        output = %output.display(),
        estimated_bytes = ?estimated_bytes,
        "Starting archive"
    );

    let partial = partial_path(output)?;

    progress.start(estimated_bytes);
    let result = write_archive(source, &partial, progress);
    progress.finish();

    let (entries, processed_bytes) = match result {
        Ok(counts) => counts,
        Err(e) => {
            if let Err(remove_err) = fs::remove_file(&partial) {
                debug!(
                    path = %partial.display(),
                    error = %remove_err,
                    "Failed to remove partial archive"
                );
            }
            return Err(e);
        }
    };

    fs::rename(&partial, output).map_err(|e| ArchiveError::io(output, e))?;

    let archive_bytes = fs::metadata(output)
        .map_err(|e| ArchiveError::io(output, e))?
        .len();

    Ok(ArchiveSummary {
        entries,
        processed_bytes,
        estimated_bytes,
        archive_bytes,
    })
}

/// Total size in bytes of all regular files below `path`. Links are not followed.
pub fn directory_size(path: &Path) -> io::Result<u64> {
    let mut total: u64 = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.path().symlink_metadata()?;
        if metadata.is_dir() {
            total += directory_size(&entry.path())?;
        } else if metadata.is_file() {
            total += metadata.len();
        }
    }
    Ok(total)
}

fn partial_path(output: &Path) -> Result<PathBuf, ArchiveError> {
    let file_name = output.file_name().ok_or_else(|| {
        ArchiveError::io(
            output,
            io::Error::new(io::ErrorKind::InvalidInput, "output path has no file name"),
        )
    })?;
    let mut partial = file_name.to_os_string();
    partial.push(".partial");
    Ok(output.with_file_name(partial))
}

/// Running totals while walking the source tree.
struct WalkState<'a> {
    processed_bytes: u64,
    entries: u64,
    buffer: Vec<u8>,
    progress: &'a dyn ProgressReporter,
}

fn write_archive(
    source: &Path,
    partial: &Path,
    progress: &dyn ProgressReporter,
) -> Result<(u64, u64), ArchiveError> {
    let file = File::create(partial).map_err(|e| ArchiveError::io(partial, e))?;
    let mut zip = ZipWriter::new(BufWriter::with_capacity(BUFFER_SIZE, file));

    let mut state = WalkState {
        processed_bytes: 0,
        entries: 0,
        buffer: vec![0u8; BUFFER_SIZE],
        progress,
    };

    add_directory_contents(&mut zip, source, source, &mut state)?;

    let writer = zip.finish().map_err(|e| ArchiveError::zip(partial, e))?;
    let file = writer
        .into_inner()
        .map_err(|e| ArchiveError::io(partial, e.into_error()))?;
    file.sync_all().map_err(|e| ArchiveError::io(partial, e))?;

    Ok((state.entries, state.processed_bytes))
}

fn add_directory_contents<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    base: &Path,
    current: &Path,
    state: &mut WalkState<'_>,
) -> Result<(), ArchiveError> {
    let mut children = fs::read_dir(current)
        .and_then(|entries| entries.collect::<io::Result<Vec<_>>>())
        .map_err(|e| ArchiveError::io(current, e))?;
    children.sort_by_key(|entry| entry.file_name());

    for child in children {
        let path = child.path();
        let metadata = path
            .symlink_metadata()
            .map_err(|e| ArchiveError::io(&path, e))?;
        let name = entry_name(base, &path);
        let options = entry_options(&metadata);

        if metadata.is_dir() {
            zip.add_directory(name, options)
                .map_err(|e| ArchiveError::zip(&path, e))?;
            state.entries += 1;
            add_directory_contents(zip, base, &path, state)?;
        } else if metadata.is_file() {
            let options = options.large_file(metadata.len() >= ZIP64_THRESHOLD);
            zip.start_file(name, options)
                .map_err(|e| ArchiveError::zip(&path, e))?;
            append_file(zip, &path, state)?;
            state.entries += 1;
        } else if metadata.file_type().is_symlink() {
            let target = fs::read_link(&path).map_err(|e| ArchiveError::io(&path, e))?;
            zip.add_symlink(name, target.to_string_lossy().into_owned(), options)
                .map_err(|e| ArchiveError::zip(&path, e))?;
            state.entries += 1;
        } else {
            debug!(path = %path.display(), "Skipping special file");
        }
    }

    Ok(())
}

/// Copy one file into the current zip entry, reporting after every read.
fn append_file<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    path: &Path,
    state: &mut WalkState<'_>,
) -> Result<(), ArchiveError> {
    let mut file = File::open(path).map_err(|e| ArchiveError::io(path, e))?;

    loop {
        let bytes_read = match file.read(&mut state.buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ArchiveError::io(path, e)),
        };

        zip.write_all(&state.buffer[..bytes_read])
            .map_err(|e| ArchiveError::io(path, e))?;

        state.processed_bytes += bytes_read as u64;
        state.progress.update(ArchiveProgress {
            processed_bytes: state.processed_bytes,
        });
    }

    Ok(())
}

/// Archive entry name: path relative to `base`, `/`-separated.
fn entry_name(base: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn entry_options(metadata: &Metadata) -> SimpleFileOptions {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(COMPRESSION_LEVEL))
        .unix_permissions(metadata.permissions().mode());

    match modified_time(metadata) {
        Some(time) => options.last_modified_time(time),
        None => options,
    }
}

/// Zip timestamps are local time with two-second precision, from 1980 on.
fn modified_time(metadata: &Metadata) -> Option<zip::DateTime> {
    let modified: DateTime<Local> = metadata.modified().ok()?.into();
    zip::DateTime::from_date_and_time(
        u16::try_from(modified.year()).ok()?,
        modified.month() as u8,
        modified.day() as u8,
        modified.hour() as u8,
        modified.minute() as u8,
        modified.second() as u8,
    )
    .ok()
}

fn round_to_millis(duration: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_millis(duration.as_millis() as u64)
}
