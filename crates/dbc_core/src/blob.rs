use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::DbError;

/// Pull-based byte source consumed by BLOB binds and retrievals.
///
/// `read` returns the number of bytes written into `buf`; zero means end of
/// stream. Implementations must tolerate calls after `close()` by failing
/// cleanly rather than panicking.
pub trait InputStream: Send {
    /// Fill `buf` with up to `buf.len()` bytes. Returns 0 at end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DbError>;

    /// Discard up to `n` bytes; returns how many were actually skipped.
    fn skip(&mut self, n: u64) -> Result<u64, DbError> {
        let mut remaining = n;
        let mut scratch = [0u8; 4096];
        while remaining > 0 {
            let want = scratch.len().min(remaining as usize);
            let got = self.read(&mut scratch[..want])?;
            if got == 0 {
                break;
            }
            remaining -= got as u64;
        }
        Ok(n - remaining)
    }

    /// Release the underlying source. Further reads fail.
    fn close(&mut self) -> Result<(), DbError>;
}

/// In-memory `InputStream` over a shared byte buffer.
pub struct MemoryInputStream {
    data: Arc<[u8]>,
    pos: usize,
    closed: bool,
}

impl MemoryInputStream {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into().into(),
            pos: 0,
            closed: false,
        }
    }

    fn from_shared(data: Arc<[u8]>) -> Self {
        Self {
            data,
            pos: 0,
            closed: false,
        }
    }
}

impl InputStream for MemoryInputStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DbError> {
        if self.closed {
            return Err(DbError::result_exhausted("stream is closed"));
        }
        let remaining = &self.data[self.pos..];
        let n = buf.len().min(remaining.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }

    fn skip(&mut self, n: u64) -> Result<u64, DbError> {
        if self.closed {
            return Err(DbError::result_exhausted("stream is closed"));
        }
        let remaining = (self.data.len() - self.pos) as u64;
        let skipped = n.min(remaining);
        self.pos += skipped as usize;
        Ok(skipped)
    }

    fn close(&mut self) -> Result<(), DbError> {
        self.closed = true;
        Ok(())
    }
}

enum BlobState {
    /// Fully materialized bytes.
    Memory(Arc<[u8]>),
    /// Stream not yet drained; `None` after a failed materialization.
    Pending(Option<Box<dyn InputStream>>),
}

/// Binary large object: a byte buffer with a length, addressable by range.
///
/// Backed either by an in-memory buffer or by an `InputStream` that is
/// drained on first random access. Handles are cheap to clone and share the
/// underlying buffer.
#[derive(Clone)]
pub struct Blob {
    state: Arc<Mutex<BlobState>>,
}

impl Blob {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BlobState::Memory(bytes.into().into()))),
        }
    }

    pub fn from_stream(stream: Box<dyn InputStream>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BlobState::Pending(Some(stream)))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BlobState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Full contents, draining the backing stream on first call.
    pub fn bytes(&self) -> Result<Arc<[u8]>, DbError> {
        let mut state = self.lock();
        match &mut *state {
            BlobState::Memory(data) => Ok(data.clone()),
            BlobState::Pending(stream) => {
                let mut stream = stream
                    .take()
                    .ok_or_else(|| DbError::protocol("blob stream already consumed"))?;
                let mut data = Vec::new();
                let mut chunk = [0u8; 8192];
                loop {
                    let got = stream.read(&mut chunk)?;
                    if got == 0 {
                        break;
                    }
                    data.extend_from_slice(&chunk[..got]);
                }
                stream.close()?;
                let shared: Arc<[u8]> = data.into();
                *state = BlobState::Memory(shared.clone());
                Ok(shared)
            }
        }
    }

    pub fn len(&self) -> Result<u64, DbError> {
        Ok(self.bytes()?.len() as u64)
    }

    pub fn is_empty(&self) -> Result<bool, DbError> {
        Ok(self.bytes()?.is_empty())
    }

    /// Copy out `len` bytes starting at `offset`, clamped to the blob length.
    pub fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>, DbError> {
        let data = self.bytes()?;
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        Ok(data[start..end].to_vec())
    }

    /// Pull-based view over the (materialized) contents.
    pub fn stream(&self) -> Result<Box<dyn InputStream>, DbError> {
        Ok(Box::new(MemoryInputStream::from_shared(self.bytes()?)))
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.lock() {
            BlobState::Memory(data) => write!(f, "Blob({} bytes)", data.len()),
            BlobState::Pending(_) => write!(f, "Blob(<stream>)"),
        }
    }
}

impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        match (self.bytes(), other.bytes()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Blob, InputStream, MemoryInputStream};

    #[test]
    fn memory_stream_reads_skips_and_closes() {
        let mut stream = MemoryInputStream::new(b"hello world".to_vec());

        let mut buf = [0u8; 5];
        assert_eq!(stream.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");

        assert_eq!(stream.skip(1).unwrap(), 1);

        let mut rest = [0u8; 16];
        assert_eq!(stream.read(&mut rest).unwrap(), 5);
        assert_eq!(&rest[..5], b"world");
        assert_eq!(stream.read(&mut rest).unwrap(), 0);

        stream.close().unwrap();
        assert!(stream.read(&mut rest).is_err());
    }

    #[test]
    fn stream_backed_blob_materializes_once() {
        let blob = Blob::from_stream(Box::new(MemoryInputStream::new(vec![1u8, 2, 3, 4])));
        assert_eq!(blob.len().unwrap(), 4);
        assert_eq!(blob.read_range(1, 2).unwrap(), vec![2, 3]);
        assert_eq!(&*blob.bytes().unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn range_reads_clamp_to_length() {
        let blob = Blob::from_bytes(vec![9u8, 8, 7]);
        assert_eq!(blob.read_range(2, 10).unwrap(), vec![7]);
        assert!(blob.read_range(5, 1).unwrap().is_empty());
    }

    #[test]
    fn equality_compares_contents() {
        let a = Blob::from_bytes(b"abc".to_vec());
        let b = Blob::from_stream(Box::new(MemoryInputStream::new(b"abc".to_vec())));
        assert_eq!(a, b);
    }
}
