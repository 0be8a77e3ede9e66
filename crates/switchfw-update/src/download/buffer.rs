//! Staging buffer for one firmware download

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{FirmwareError, FirmwareResult};
use crate::image::create_filename_tlv;
use crate::platform::Feedback;

/// Filename used when the source names none
pub const UNKNOWN_FILENAME: &str = "<unknown>";

enum Storage {
    Memory(Vec<u8>),
    File(File),
}

/// Outcome of offering a chunk to a download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Chunk appended
    Accepted,
    /// Chunk already received; ignored
    Duplicate,
}

/// Bytes of one download plus its chunk bookkeeping
///
/// Data lives in memory, or in an anonymous temporary file when staged in a
/// directory. [`FirmwareDownload::seal`] makes the whole image available as
/// one contiguous buffer.
pub struct FirmwareDownload {
    storage: Storage,
    length: usize,
    max_size: usize,
    filename: String,
    total_chunks: u32,
    last_chunk: u32,
    feedback: Option<Arc<dyn Feedback>>,
    last_error: Option<String>,
}

impl std::fmt::Debug for FirmwareDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirmwareDownload")
            .field("length", &self.length)
            .field("max_size", &self.max_size)
            .field("filename", &self.filename)
            .field("total_chunks", &self.total_chunks)
            .field("last_chunk", &self.last_chunk)
            .finish_non_exhaustive()
    }
}

/// A finished download ready for the orchestrator
pub struct StagedImage {
    /// Image bytes
    pub data: Vec<u8>,
    /// Name the image was downloaded under
    pub filename: String,
    /// Progress channel of the requester
    pub feedback: Option<Arc<dyn Feedback>>,
}

impl std::fmt::Debug for StagedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedImage")
            .field("length", &self.data.len())
            .field("filename", &self.filename)
            .finish_non_exhaustive()
    }
}

impl FirmwareDownload {
    /// In-memory download of at most `max_size` bytes
    pub fn new(max_size: usize) -> Self {
        Self {
            storage: Storage::Memory(Vec::new()),
            length: 0,
            max_size,
            filename: UNKNOWN_FILENAME.to_string(),
            total_chunks: 0,
            last_chunk: 0,
            feedback: None,
            last_error: None,
        }
    }

    /// Download staged in a temporary file inside `dir`
    pub fn in_dir(dir: &Path, max_size: usize) -> FirmwareResult<Self> {
        let file = tempfile::tempfile_in(dir)?;
        debug!("Staging download in {}", dir.display());
        Ok(Self {
            storage: Storage::File(file),
            ..Self::new(max_size)
        })
    }

    /// Download already holding `data`
    pub fn from_vec(data: Vec<u8>, max_size: usize) -> FirmwareResult<Self> {
        if data.len() > max_size {
            return Err(FirmwareError::SizeExceeded {
                max: max_size,
                attempted: data.len(),
            });
        }
        Ok(Self {
            length: data.len(),
            storage: Storage::Memory(data),
            ..Self::new(max_size)
        })
    }

    /// Attach a progress channel
    pub fn set_feedback(&mut self, feedback: Arc<dyn Feedback>) {
        self.feedback = Some(feedback);
    }

    /// Progress channel, if any
    pub fn feedback(&self) -> Option<&Arc<dyn Feedback>> {
        self.feedback.as_ref()
    }

    /// Emit a line on the progress channel
    pub fn say(&self, text: &str) {
        if let Some(feedback) = &self.feedback {
            feedback.line(text);
        }
    }

    /// Bytes received so far
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether nothing has been received
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Append bytes
    ///
    /// # Errors
    ///
    /// Returns [`FirmwareError::SizeExceeded`] when the download would grow
    /// past its maximum; nothing is appended in that case.
    pub fn write(&mut self, bytes: &[u8]) -> FirmwareResult<()> {
        let attempted = self.length.saturating_add(bytes.len());
        if attempted > self.max_size {
            let err = FirmwareError::SizeExceeded {
                max: self.max_size,
                attempted,
            };
            self.last_error = Some(err.to_string());
            return Err(err);
        }
        match &mut self.storage {
            Storage::Memory(data) => data.extend_from_slice(bytes),
            Storage::File(file) => file.write_all(bytes)?,
        }
        self.length = attempted;
        trace!("Download holds {} bytes", self.length);
        Ok(())
    }

    /// Make the data contiguous in memory and return it
    pub fn seal(&mut self) -> FirmwareResult<&[u8]> {
        if let Storage::File(file) = &mut self.storage {
            let mut data = Vec::with_capacity(self.length);
            file.seek(SeekFrom::Start(0))?;
            file.read_to_end(&mut data)?;
            self.storage = Storage::Memory(data);
        }
        match &self.storage {
            Storage::Memory(data) => Ok(data.as_slice()),
            Storage::File(_) => Err(FirmwareError::protocol("download not sealed")),
        }
    }

    /// Record the source name from a URL or path: the part after the last
    /// `/`, or `<unknown>` when that is empty
    pub fn set_filename(&mut self, url: &str) {
        let base = url.rsplit('/').next().unwrap_or_default();
        self.filename = if base.is_empty() {
            UNKNOWN_FILENAME.to_string()
        } else {
            base.to_string()
        };
    }

    /// Source name
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Declare how many chunks the session will send
    pub fn set_total_chunks(&mut self, total: u32) -> FirmwareResult<()> {
        if total == 0 {
            return Err(FirmwareError::protocol("session must declare at least one chunk"));
        }
        self.total_chunks = total;
        Ok(())
    }

    /// Declared chunk count
    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Chunk number the session expects next
    pub fn next_expected_chunk(&self) -> u32 {
        self.last_chunk.saturating_add(1)
    }

    /// Highest chunk number received, 0 before the first
    pub fn last_received_chunk(&self) -> u32 {
        self.last_chunk
    }

    /// Whether chunk `n` has been received
    pub fn has_chunk(&self, n: u32) -> bool {
        n >= 1 && n <= self.last_chunk
    }

    /// Whether every declared chunk has been received
    pub fn is_complete(&self) -> bool {
        self.total_chunks > 0 && self.last_chunk == self.total_chunks
    }

    /// Offer chunk `n` (1-based)
    ///
    /// Chunks at or below the last received one are duplicates and ignored;
    /// a chunk beyond the next expected one is rejected.
    pub fn accept_chunk(&mut self, n: u32, bytes: &[u8]) -> FirmwareResult<ChunkOutcome> {
        if n == 0 || n > self.total_chunks {
            return Err(FirmwareError::protocol(format!(
                "chunk {} outside 1..={}",
                n, self.total_chunks
            )));
        }
        if self.has_chunk(n) {
            trace!("Ignoring duplicate chunk {}", n);
            return Ok(ChunkOutcome::Duplicate);
        }
        let expected = self.next_expected_chunk();
        if n != expected {
            let err = FirmwareError::ChunkOutOfOrder { expected, got: n };
            self.last_error = Some(err.to_string());
            return Err(err);
        }
        self.write(bytes)?;
        self.last_chunk = n;
        Ok(ChunkOutcome::Accepted)
    }

    /// Append a stage-2 filename record carrying the source name
    ///
    /// Nothing is appended for an empty name.
    pub fn append_filename_tlv(&mut self) -> FirmwareResult<()> {
        let Some(record) = create_filename_tlv(&self.filename) else {
            debug!("No filename record for an unnamed download");
            return Ok(());
        };
        debug!("Appending filename record for {}", self.filename);
        self.write(&record)
    }

    /// Last error recorded against this download
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Seal and hand over the image
    pub fn finish(mut self) -> FirmwareResult<StagedImage> {
        self.seal()?;
        let data = match self.storage {
            Storage::Memory(data) => data,
            Storage::File(_) => return Err(FirmwareError::protocol("download not sealed")),
        };
        Ok(StagedImage {
            data,
            filename: self.filename,
            feedback: self.feedback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_from_url() {
        let mut download = FirmwareDownload::new(16);
        download.set_filename("tftp://10.0.0.1/images/new.mfi");
        assert_eq!(download.filename(), "new.mfi");
        download.set_filename("http://host/dir/");
        assert_eq!(download.filename(), UNKNOWN_FILENAME);
        download.set_filename("plain.bin");
        assert_eq!(download.filename(), "plain.bin");
    }

    #[test]
    fn test_size_limit_keeps_existing_data() {
        let mut download = FirmwareDownload::new(8);
        assert!(download.write(&[1; 6]).is_ok());
        assert!(matches!(
            download.write(&[2; 3]),
            Err(FirmwareError::SizeExceeded { max: 8, attempted: 9 })
        ));
        assert_eq!(download.len(), 6);
        assert!(download.last_error().is_some());
    }

    #[test]
    fn test_file_staging() -> FirmwareResult<()> {
        let dir = tempfile::tempdir()?;
        let mut download = FirmwareDownload::in_dir(dir.path(), 1024)?;
        download.write(b"hello ")?;
        download.write(b"world")?;
        assert_eq!(download.seal()?, b"hello world");
        Ok(())
    }

    #[test]
    fn test_chunk_sequence() -> FirmwareResult<()> {
        let mut download = FirmwareDownload::new(1024);
        download.set_total_chunks(3)?;
        assert_eq!(download.accept_chunk(1, b"a")?, ChunkOutcome::Accepted);
        assert!(matches!(
            download.accept_chunk(3, b"c"),
            Err(FirmwareError::ChunkOutOfOrder { expected: 2, got: 3 })
        ));
        assert_eq!(download.accept_chunk(2, b"b")?, ChunkOutcome::Accepted);
        assert_eq!(download.accept_chunk(2, b"b")?, ChunkOutcome::Duplicate);
        assert_eq!(download.accept_chunk(3, b"c")?, ChunkOutcome::Accepted);
        assert!(download.is_complete());
        assert_eq!(download.accept_chunk(1, b"a")?, ChunkOutcome::Duplicate);
        assert!(download.accept_chunk(4, b"d").is_err());
        assert!(download.accept_chunk(0, b"").is_err());
        assert_eq!(download.finish()?.data, b"abc");
        Ok(())
    }
}
