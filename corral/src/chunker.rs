//! Streaming compress-and-split writer used by OCI push to turn one large
//! disk file into a sequence of bounded, independently-pushable chunks.

use std::io::Write;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::{Arc, Mutex, PoisonError};

use sha2::{Digest, Sha256};

use crate::Result;

/// One emitted chunk: its compressed bytes plus metadata about the
/// uncompressed data they represent.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Compressed bytes, ready to push as a blob.
    pub data: Vec<u8>,
    /// Byte length of the uncompressed input this chunk covers.
    pub uncompressed_size: u64,
    /// `sha256:<hex>` of the uncompressed input this chunk covers.
    pub uncompressed_digest: String,
}

/// Wraps a raw sink (the chunker's accumulation buffer) with whatever
/// compression format the caller wants (LZ4 frame, for native disks).
/// Called once per chunk so each chunk is an independently-decodable
/// compressed stream.
pub type CompressorFactory = Box<dyn Fn(Box<dyn Write + Send>) -> Box<dyn Write + Send>>;

type SharedBuf = Arc<Mutex<Vec<u8>>>;

struct BufSink(SharedBuf);

impl Write for BufSink {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A `Write` sink that, as compressed output accumulates past a target
/// size, closes out the current chunk and emits it to a bounded channel
/// — providing backpressure to whatever is driving the writes.
pub struct Chunker {
    target_size: usize,
    make_compressor: CompressorFactory,
    sender: SyncSender<Chunk>,
    inner: Box<dyn Write + Send>,
    buf: SharedBuf,
    uncompressed_size: u64,
    hasher: Sha256,
    emitted_any: bool,
}

impl Chunker {
    /// Creates a chunker targeting `target_size` bytes of *compressed*
    /// output per chunk. Returns the chunker (a `Write` sink) and the
    /// receiving half of the channel chunks are emitted on.
    #[must_use]
    pub fn new(target_size: usize, make_compressor: CompressorFactory) -> (Self, Receiver<Chunk>) {
        // An unbuffered (capacity-0) channel: the producer blocks on send
        // until the consumer is ready to receive, which is the
        // backpressure contract.
        let (sender, receiver) = sync_channel(0);
        let buf: SharedBuf = Arc::default();
        let inner = make_compressor(Box::new(BufSink(buf.clone())));

        let chunker = Self {
            target_size,
            make_compressor,
            sender,
            inner,
            buf,
            uncompressed_size: 0,
            hasher: Sha256::new(),
            emitted_any: false,
        };
        (chunker, receiver)
    }

    fn buffered_len(&self) -> usize {
        self.buf.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Drops the current compressor (flushing/finalizing it — e.g. an LZ4
    /// frame footer), emits a [`Chunk`] for everything buffered so far,
    /// and starts a fresh compressor/buffer/hasher for the next chunk.
    fn emit_chunk(&mut self) -> Result<()> {
        self.inner.flush()?;
        self.inner = Box::new(std::io::sink());

        let data = std::mem::take(&mut *self.buf.lock().unwrap_or_else(PoisonError::into_inner));
        let chunk = Chunk {
            data,
            uncompressed_size: self.uncompressed_size,
            uncompressed_digest: format!("sha256:{:x}", self.hasher.finalize_reset()),
        };

        self.sender.send(chunk).map_err(|_| crate::Error::Canceled)?;

        self.uncompressed_size = 0;
        self.emitted_any = true;
        self.inner = (self.make_compressor)(Box::new(BufSink(self.buf.clone())));
        Ok(())
    }

    /// Flushes any buffered data and emits a final chunk iff the buffer is
    /// non-empty or no chunk has ever been emitted (so an empty input
    /// still produces exactly one empty chunk).
    pub fn close(mut self) -> Result<()> {
        if self.buffered_len() > 0 || !self.emitted_any {
            self.emit_chunk()?;
        }
        Ok(())
    }
}

impl Write for Chunker {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        if self.buffered_len() >= self.target_size {
            self.emit_chunk().map_err(|e| std::io::Error::other(e.to_string()))?;
        }

        self.hasher.update(data);
        self.uncompressed_size += data.len() as u64;
        self.inner.write_all(data)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn passthrough_factory() -> CompressorFactory {
        Box::new(|sink| sink)
    }

    #[test]
    fn empty_input_emits_exactly_one_empty_chunk() {
        let (chunker, receiver) = Chunker::new(1024, passthrough_factory());
        chunker.close().expect("close");

        let chunks: Vec<Chunk> = receiver.iter().collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].uncompressed_size, 0);
        assert_eq!(chunks[0].uncompressed_digest, format!("sha256:{:x}", Sha256::new().finalize()));
    }

    #[test]
    fn concatenated_chunks_cover_every_written_byte() {
        let (mut chunker, receiver) = Chunker::new(8, passthrough_factory());

        std::thread::scope(|scope| {
            scope.spawn(|| {
                chunker.write_all(b"0123456789abcdef").expect("write");
                chunker.close().expect("close");
            });

            let chunks: Vec<Chunk> = receiver.iter().collect();
            let total: u64 = chunks.iter().map(|c| c.uncompressed_size).sum();
            assert_eq!(total, 16);
        });
    }

    #[test]
    fn small_target_size_splits_into_multiple_chunks() {
        let (mut chunker, receiver) = Chunker::new(4, passthrough_factory());

        std::thread::scope(|scope| {
            scope.spawn(|| {
                chunker.write_all(b"aaaaaaaaaaaaaaaa").expect("write");
                chunker.close().expect("close");
            });

            let chunks: Vec<Chunk> = receiver.iter().collect();
            assert!(chunks.len() > 1, "expected more than one chunk, got {}", chunks.len());
        });
    }
}
