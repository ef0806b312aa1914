//! Transfer unit: copy or move one file with chunked I/O.
//!
//! A transfer is a single attempt. Failures are reported with the
//! underlying error and never retried here.

use std::io::{ErrorKind, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::{debug, trace};

use framemover_core::{EngineConfig, OperationKind, TransferError};

use crate::control::BatchControl;

/// Receives byte-level progress increments from a running transfer.
pub trait ByteSink: Send + Sync {
    fn record_bytes(&self, bytes: u64);
}

impl ByteSink for AtomicU64 {
    fn record_bytes(&self, bytes: u64) {
        self.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Tunables for a single transfer.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Bytes per read/write.
    pub chunk_size: usize,
    /// Files above this size are split across `chunk_streams`.
    pub large_file_threshold: u64,
    /// Concurrent byte-range streams for large files.
    pub chunk_streams: usize,
    /// Copy permissions and modification time.
    pub preserve_metadata: bool,
}

impl TransferOptions {
    /// Derive transfer options from the engine config and a batch's stream width.
    pub fn from_config(config: &EngineConfig, chunk_streams: usize) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            large_file_threshold: config.large_file_threshold,
            chunk_streams: chunk_streams.max(1),
            preserve_metadata: config.preserve_metadata,
        }
    }

    fn is_large(&self, size: u64) -> bool {
        self.chunk_streams > 1 && size > self.large_file_threshold
    }
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default(), EngineConfig::default().chunk_streams)
    }
}

/// Copy or move `source` to `destination`.
///
/// Parent directories of the destination are created as needed. An
/// existing destination is never overwritten. Returns the number of bytes
/// transferred.
pub async fn transfer(
    source: &Path,
    destination: &Path,
    kind: OperationKind,
    options: &TransferOptions,
    control: &Arc<BatchControl>,
    sink: &Arc<dyn ByteSink>,
) -> Result<u64, TransferError> {
    control.checkpoint().await?;

    let metadata = fs::metadata(source)
        .await
        .map_err(|e| TransferError::io(source, e))?;
    if !metadata.is_file() {
        return Err(TransferError::NotAFile {
            path: source.to_path_buf(),
        });
    }
    if fs::symlink_metadata(destination).await.is_ok() {
        return Err(TransferError::AlreadyExists {
            path: destination.to_path_buf(),
        });
    }

    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::io(parent, e))?;
    }

    match kind {
        OperationKind::Copy => {
            copy_file(source, destination, metadata.len(), options, control, sink).await
        }
        OperationKind::Move => {
            move_file(source, destination, metadata.len(), options, control, sink).await
        }
    }
}

/// Move a file, renaming in place when both paths share a volume.
async fn move_file(
    source: &Path,
    destination: &Path,
    size: u64,
    options: &TransferOptions,
    control: &Arc<BatchControl>,
    sink: &Arc<dyn ByteSink>,
) -> Result<u64, TransferError> {
    if same_volume(source, destination).await {
        control.checkpoint().await?;
        match fs::rename(source, destination).await {
            Ok(()) => {
                sink.record_bytes(size);
                return Ok(size);
            }
            Err(e) if e.kind() == ErrorKind::CrossesDevices => {
                debug!(source = %source.display(), "rename crossed devices, copying instead");
            }
            Err(e) => return Err(TransferError::io(source, e)),
        }
    }

    let bytes = copy_file(source, destination, size, options, control, sink).await?;

    // The copy is verified at this point; only now may the source go.
    if let Err(e) = fs::remove_file(source).await {
        discard_partial(destination).await;
        return Err(TransferError::io(source, e));
    }

    Ok(bytes)
}

/// Copy a file and verify the written size. The source is never touched.
async fn copy_file(
    source: &Path,
    destination: &Path,
    size: u64,
    options: &TransferOptions,
    control: &Arc<BatchControl>,
    sink: &Arc<dyn ByteSink>,
) -> Result<u64, TransferError> {
    // create_new guards against racing writers; on failure nothing of ours exists yet.
    let dest_file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(destination)
        .await
        .map_err(|e| TransferError::io(destination, e))?;

    let result = if options.is_large(size) {
        copy_parallel(source, destination, dest_file, size, options, control, sink).await
    } else {
        copy_stream(source, destination, dest_file, options, control, sink.as_ref()).await
    };

    let written = match result {
        Ok(written) => written,
        Err(e) => {
            discard_partial(destination).await;
            return Err(e);
        }
    };

    let actual = match fs::metadata(destination).await {
        Ok(metadata) => metadata.len(),
        Err(e) => {
            discard_partial(destination).await;
            return Err(TransferError::io(destination, e));
        }
    };
    if written != size || actual != size {
        discard_partial(destination).await;
        return Err(TransferError::SizeMismatch {
            path: destination.to_path_buf(),
            expected: size,
            actual: actual.min(written),
        });
    }

    if options.preserve_metadata {
        if let Err(e) = preserve_metadata(source, destination).await {
            debug!(path = %destination.display(), error = %e, "could not preserve metadata");
        }
    }

    Ok(written)
}

/// Single-stream chunked copy.
async fn copy_stream(
    source: &Path,
    destination: &Path,
    mut writer: File,
    options: &TransferOptions,
    control: &BatchControl,
    sink: &dyn ByteSink,
) -> Result<u64, TransferError> {
    let mut reader = File::open(source)
        .await
        .map_err(|e| TransferError::io(source, e))?;
    let mut buf = vec![0u8; options.chunk_size];
    let mut written = 0u64;

    loop {
        control.checkpoint().await?;

        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| TransferError::io(source, e))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| TransferError::io(destination, e))?;
        written += n as u64;
        sink.record_bytes(n as u64);
    }

    writer
        .flush()
        .await
        .map_err(|e| TransferError::io(destination, e))?;
    Ok(written)
}

/// Copy a large file as several concurrent byte ranges.
async fn copy_parallel(
    source: &Path,
    destination: &Path,
    dest_file: File,
    size: u64,
    options: &TransferOptions,
    control: &Arc<BatchControl>,
    sink: &Arc<dyn ByteSink>,
) -> Result<u64, TransferError> {
    dest_file
        .set_len(size)
        .await
        .map_err(|e| TransferError::io(destination, e))?;
    drop(dest_file);

    let ranges = split_ranges(size, options.chunk_streams, options.chunk_size);
    trace!(path = %source.display(), streams = ranges.len(), "parallel copy");

    let mut streams = JoinSet::new();
    for (start, end) in ranges {
        let source = source.to_path_buf();
        let destination = destination.to_path_buf();
        let control = Arc::clone(control);
        let sink = Arc::clone(sink);
        let chunk_size = options.chunk_size;
        streams.spawn(async move {
            copy_range(&source, &destination, start, end, chunk_size, &control, sink.as_ref())
                .await
        });
    }

    let mut written = 0u64;
    let mut failure = None;
    while let Some(joined) = streams.join_next().await {
        match joined {
            Ok(Ok(bytes)) => written += bytes,
            Ok(Err(e)) => {
                failure.get_or_insert(e);
                streams.abort_all();
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                failure.get_or_insert(TransferError::Io {
                    path: destination.to_path_buf(),
                    source: std::io::Error::other(e),
                });
                streams.abort_all();
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(written),
    }
}

/// Copy bytes `[start, end)` of `source` into the same range of `destination`.
async fn copy_range(
    source: &Path,
    destination: &Path,
    start: u64,
    end: u64,
    chunk_size: usize,
    control: &BatchControl,
    sink: &dyn ByteSink,
) -> Result<u64, TransferError> {
    let mut reader = File::open(source)
        .await
        .map_err(|e| TransferError::io(source, e))?;
    let mut writer = OpenOptions::new()
        .write(true)
        .open(destination)
        .await
        .map_err(|e| TransferError::io(destination, e))?;
    reader
        .seek(SeekFrom::Start(start))
        .await
        .map_err(|e| TransferError::io(source, e))?;
    writer
        .seek(SeekFrom::Start(start))
        .await
        .map_err(|e| TransferError::io(destination, e))?;

    let mut buf = vec![0u8; chunk_size];
    let mut position = start;
    while position < end {
        control.checkpoint().await?;

        let want = chunk_size.min((end - position) as usize);
        let n = reader
            .read(&mut buf[..want])
            .await
            .map_err(|e| TransferError::io(source, e))?;
        if n == 0 {
            return Err(TransferError::io(
                source,
                std::io::Error::new(ErrorKind::UnexpectedEof, "source shrank during copy"),
            ));
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| TransferError::io(destination, e))?;
        position += n as u64;
        sink.record_bytes(n as u64);
    }

    writer
        .flush()
        .await
        .map_err(|e| TransferError::io(destination, e))?;
    Ok(end - start)
}

/// Split `size` bytes into at most `streams` chunk-aligned ranges.
fn split_ranges(size: u64, streams: usize, chunk_size: usize) -> Vec<(u64, u64)> {
    if size == 0 {
        return Vec::new();
    }
    let chunk = chunk_size.max(1) as u64;
    // No stream gets less than one chunk.
    let streams = (streams.max(1) as u64).min(size.div_ceil(chunk));
    let per_stream = size.div_ceil(streams).div_ceil(chunk) * chunk;

    let mut ranges = Vec::with_capacity(size.div_ceil(per_stream) as usize);
    let mut start = 0;
    while start < size {
        let end = (start + per_stream).min(size);
        ranges.push((start, end));
        start = end;
    }
    ranges
}

/// Whether a rename from `source` into `destination`'s directory can be atomic.
#[cfg(unix)]
async fn same_volume(source: &Path, destination: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let Some(parent) = destination.parent() else {
        return false;
    };
    match (fs::metadata(source).await, fs::metadata(parent).await) {
        (Ok(src), Ok(dst)) => src.dev() == dst.dev(),
        _ => false,
    }
}

/// Whether a rename from `source` into `destination`'s directory can be atomic.
#[cfg(not(unix))]
async fn same_volume(source: &Path, destination: &Path) -> bool {
    // Same drive letter or share.
    source.components().next() == destination.components().next()
}

/// Copy modification time and permissions from `source` to `destination`.
async fn preserve_metadata(source: &Path, destination: &Path) -> std::io::Result<()> {
    let metadata = fs::metadata(source).await?;

    // mtime first: permissions may make the destination read-only.
    let modified = metadata.modified()?;
    let file = OpenOptions::new()
        .write(true)
        .open(destination)
        .await?
        .into_std()
        .await;
    tokio::task::spawn_blocking(move || file.set_modified(modified))
        .await
        .map_err(std::io::Error::other)??;

    fs::set_permissions(destination, metadata.permissions()).await
}

/// Remove a partially written destination.
async fn discard_partial(destination: &Path) {
    if let Err(e) = fs::remove_file(destination).await {
        if e.kind() != ErrorKind::NotFound {
            debug!(path = %destination.display(), error = %e, "failed to remove partial file");
        }
    }
}
