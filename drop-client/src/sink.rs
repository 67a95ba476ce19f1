//! Destinations for received bytes.
//!
//! The receiver engine writes through the [`Sink`] trait and never knows
//! whether bytes land in memory or on disk. The caller picks a
//! [`SinkProvider`] before starting the engine:
//!
//! - [`MemorySinkProvider`] - buffers the whole file in memory
//! - [`DirectorySinkProvider`] - writes `<name>.part` in a directory, renamed on finalize
//! - [`FallbackSinkProvider`] - tries a persistent provider first, falls back to another

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use drop_types::TransferMetadata;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Sink errors. Never retried.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The user declined to choose a destination.
    #[error("destination declined")]
    Declined,

    /// No destination could be provided.
    #[error("destination unavailable: {0}")]
    Unavailable(String),

    /// Write outside the announced file size.
    #[error("write of {len} bytes at {offset} exceeds size {size}")]
    OutOfBounds {
        /// Write offset.
        offset: u64,
        /// Write length.
        len: usize,
        /// Announced size.
        size: u64,
    },

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a finalized transfer ended up.
#[derive(Clone, PartialEq, Eq)]
pub enum SinkOutput {
    /// Held in memory.
    Memory {
        /// Original file name.
        filename: String,
        /// File contents.
        data: Vec<u8>,
    },
    /// Written to disk.
    File(PathBuf),
}

impl std::fmt::Debug for SinkOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkOutput::Memory { filename, data } => f
                .debug_struct("Memory")
                .field("filename", filename)
                .field("len", &data.len())
                .finish(),
            SinkOutput::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

/// Positional write destination for one transfer.
#[async_trait]
pub trait Sink: Send {
    /// Write `bytes` at `offset`.
    async fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<(), SinkError>;

    /// Close the destination and hand back the result.
    async fn finalize(self: Box<Self>) -> Result<SinkOutput, SinkError>;

    /// Discard everything written.
    async fn abort(self: Box<Self>);
}

/// Opens a sink for an incoming transfer.
#[async_trait]
pub trait SinkProvider: Send + Sync {
    /// Acquire a destination for `metadata`. May fail or be declined.
    async fn open(&self, metadata: &TransferMetadata) -> Result<Box<dyn Sink>, SinkError>;
}

/// In-memory sink.
#[derive(Debug)]
pub struct MemorySink {
    filename: String,
    size: u64,
    data: Vec<u8>,
}

impl MemorySink {
    /// Create a sink for a `size`-byte file.
    pub fn new(filename: impl Into<String>, size: u64) -> Self {
        Self {
            filename: filename.into(),
            size,
            data: Vec::new(),
        }
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<(), SinkError> {
        let end = offset
            .checked_add(bytes.len() as u64)
            .filter(|end| *end <= self.size)
            .ok_or(SinkError::OutOfBounds {
                offset,
                len: bytes.len(),
                size: self.size,
            })?;
        let (start, end) = (offset as usize, end as usize);
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    async fn finalize(self: Box<Self>) -> Result<SinkOutput, SinkError> {
        let mut data = self.data;
        data.resize(self.size as usize, 0);
        Ok(SinkOutput::Memory {
            filename: self.filename,
            data,
        })
    }

    async fn abort(self: Box<Self>) {}
}

/// Hands out [`MemorySink`]s up to a size limit.
#[derive(Debug, Clone)]
pub struct MemorySinkProvider {
    max_size: u64,
}

impl MemorySinkProvider {
    /// Default limit: 512 MiB.
    pub const DEFAULT_MAX_SIZE: u64 = 512 * 1024 * 1024;

    /// Provider refusing files larger than `max_size`.
    pub fn new(max_size: u64) -> Self {
        Self { max_size }
    }
}

impl Default for MemorySinkProvider {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_SIZE)
    }
}

#[async_trait]
impl SinkProvider for MemorySinkProvider {
    async fn open(&self, metadata: &TransferMetadata) -> Result<Box<dyn Sink>, SinkError> {
        if metadata.total_size > self.max_size {
            return Err(SinkError::Unavailable(format!(
                "{} bytes exceeds in-memory limit of {}",
                metadata.total_size, self.max_size
            )));
        }
        Ok(Box::new(MemorySink::new(
            metadata.filename.clone(),
            metadata.total_size,
        )))
    }
}

/// Disk-backed sink writing to a `.part` file.
#[derive(Debug)]
pub struct FileSink {
    file: File,
    part_path: PathBuf,
    final_path: PathBuf,
    size: u64,
}

impl FileSink {
    /// Create `<final_path>.part`, truncating any leftover.
    pub async fn create(final_path: PathBuf, size: u64) -> Result<Self, SinkError> {
        let mut part = final_path.clone().into_os_string();
        part.push(".part");
        let part_path = PathBuf::from(part);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&part_path)
            .await?;
        Ok(Self {
            file,
            part_path,
            final_path,
            size,
        })
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<(), SinkError> {
        if offset.saturating_add(bytes.len() as u64) > self.size {
            return Err(SinkError::OutOfBounds {
                offset,
                len: bytes.len(),
                size: self.size,
            });
        }
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(bytes).await?;
        Ok(())
    }

    async fn finalize(self: Box<Self>) -> Result<SinkOutput, SinkError> {
        let mut file = self.file;
        file.set_len(self.size).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&self.part_path, &self.final_path).await?;
        debug!(path = %self.final_path.display(), "file sink finalized");
        Ok(SinkOutput::File(self.final_path))
    }

    async fn abort(self: Box<Self>) {
        drop(self.file);
        if let Err(e) = tokio::fs::remove_file(&self.part_path).await {
            warn!(path = %self.part_path.display(), error = %e, "failed to remove partial file");
        }
    }
}

/// Hands out [`FileSink`]s inside one directory.
#[derive(Debug, Clone)]
pub struct DirectorySinkProvider {
    dir: PathBuf,
}

impl DirectorySinkProvider {
    /// Provider writing into `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The target directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl SinkProvider for DirectorySinkProvider {
    async fn open(&self, metadata: &TransferMetadata) -> Result<Box<dyn Sink>, SinkError> {
        let is_dir = tokio::fs::metadata(&self.dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(SinkError::Unavailable(format!(
                "{} is not a directory",
                self.dir.display()
            )));
        }
        let path = unique_path(&self.dir, &safe_file_name(&metadata.filename)).await;
        Ok(Box::new(FileSink::create(path, metadata.total_size).await?))
    }
}

/// Try `primary`; if it is unavailable, use `fallback`.
///
/// A [`SinkError::Declined`] from `primary` is final.
#[derive(Debug, Clone)]
pub struct FallbackSinkProvider<P, F> {
    primary: P,
    fallback: F,
}

impl<P, F> FallbackSinkProvider<P, F> {
    /// Combine two providers.
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl<P: SinkProvider, F: SinkProvider> SinkProvider for FallbackSinkProvider<P, F> {
    async fn open(&self, metadata: &TransferMetadata) -> Result<Box<dyn Sink>, SinkError> {
        match self.primary.open(metadata).await {
            Ok(sink) => Ok(sink),
            Err(SinkError::Declined) => Err(SinkError::Declined),
            Err(e) => {
                warn!(error = %e, "persistent sink unavailable, falling back");
                self.fallback.open(metadata).await
            }
        }
    }
}

/// Last path component with separators and control characters replaced.
fn safe_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() || c == ':' { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

/// `dir/name`, or `dir/stem (n).ext` if taken.
async fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !exists(&candidate).await {
        return candidate;
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    for n in 1.. {
        let file = match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(file);
        if !exists(&candidate).await {
            return candidate;
        }
    }
    unreachable!("unbounded range")
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drop_types::TransferId;

    fn metadata(name: &str, size: u64) -> TransferMetadata {
        TransferMetadata {
            transfer_id: TransferId::new(),
            filename: name.into(),
            total_size: size,
            mime_type: "text/plain".into(),
            last_modified: 0,
        }
    }

    struct Declining;

    #[async_trait]
    impl SinkProvider for Declining {
        async fn open(&self, _: &TransferMetadata) -> Result<Box<dyn Sink>, SinkError> {
            Err(SinkError::Declined)
        }
    }

    #[tokio::test]
    async fn memory_sink_positional_writes() {
        let mut sink: Box<dyn Sink> = Box::new(MemorySink::new("a.txt", 10));
        sink.write(5, b"world").await.unwrap();
        sink.write(0, b"hello").await.unwrap();
        match sink.finalize().await.unwrap() {
            SinkOutput::Memory { filename, data } => {
                assert_eq!(filename, "a.txt");
                assert_eq!(data, b"helloworld");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn memory_sink_rejects_out_of_bounds() {
        let mut sink = MemorySink::new("a", 4);
        let result = sink.write(2, b"abc").await;
        assert!(matches!(result, Err(SinkError::OutOfBounds { .. })));
    }

    #[tokio::test]
    async fn memory_provider_enforces_limit() {
        let provider = MemorySinkProvider::new(100);
        assert!(provider.open(&metadata("a", 100)).await.is_ok());
        assert!(matches!(
            provider.open(&metadata("a", 101)).await,
            Err(SinkError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn file_sink_renames_on_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let provider = DirectorySinkProvider::new(dir.path());
        let mut sink = provider.open(&metadata("notes.txt", 6)).await.unwrap();
        assert!(dir.path().join("notes.txt.part").exists());

        sink.write(3, b"def").await.unwrap();
        sink.write(0, b"abc").await.unwrap();
        let output = sink.finalize().await.unwrap();

        let final_path = dir.path().join("notes.txt");
        assert_eq!(output, SinkOutput::File(final_path.clone()));
        assert_eq!(std::fs::read(final_path).unwrap(), b"abcdef");
        assert!(!dir.path().join("notes.txt.part").exists());
    }

    #[tokio::test]
    async fn file_sink_abort_removes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let provider = DirectorySinkProvider::new(dir.path());
        let mut sink = provider.open(&metadata("big.bin", 100)).await.unwrap();
        sink.write(0, &[0u8; 10]).await.unwrap();
        sink.abort().await;
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn existing_files_are_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"old").unwrap();
        let provider = DirectorySinkProvider::new(dir.path());
        let sink = provider.open(&metadata("a.txt", 0)).await.unwrap();
        let output = sink.finalize().await.unwrap();
        assert_eq!(output, SinkOutput::File(dir.path().join("a (1).txt")));
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn missing_directory_falls_back_to_memory() {
        let provider = FallbackSinkProvider::new(
            DirectorySinkProvider::new("/nonexistent/sharedrop/downloads"),
            MemorySinkProvider::default(),
        );
        let sink = provider.open(&metadata("a", 0)).await.unwrap();
        assert!(matches!(
            sink.finalize().await.unwrap(),
            SinkOutput::Memory { .. }
        ));
    }

    #[tokio::test]
    async fn decline_is_not_retried_on_fallback() {
        let provider = FallbackSinkProvider::new(Declining, MemorySinkProvider::default());
        assert!(matches!(
            provider.open(&metadata("a", 1)).await,
            Err(SinkError::Declined)
        ));
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(safe_file_name("../../etc/passwd"), "passwd");
        assert_eq!(safe_file_name("C:\\Users\\me\\photo.jpg"), "photo.jpg");
        assert_eq!(safe_file_name(".hidden"), "hidden");
        assert_eq!(safe_file_name("..."), "download");
        assert_eq!(safe_file_name("a\u{0}b"), "a_b");
    }
}
