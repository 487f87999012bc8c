//! Decoder for Apple's dictionary-chained LZ4 block stream format used by
//! some pre-built disk images (distinct from the standard LZ4 frame format
//! `flate2`/`lz4_flex`'s frame API already handles).
//!
//! Each block begins with a 4-byte ASCII marker (`bv41`/`bv4-`/`bv4$`)
//! followed by a little-endian `u32` payload length, and — except for the
//! first block — is decompressed using the *previous* block's decoded
//! bytes as an LZ4 "external dictionary", chaining the whole stream
//! together rather than letting any one block stand alone.

use std::io::Read;

use crate::{Error, Result};

/// Hard cap on any single block's declared size, so a corrupt or hostile
/// stream can't coerce an unbounded allocation.
const MAX_BLOCK_SIZE: usize = 128 * 1024 * 1024;

const MARKER_LEN: usize = 4;
const COMPRESSED_MARKER: &[u8; MARKER_LEN] = b"bv41";
const UNCOMPRESSED_MARKER: &[u8; MARKER_LEN] = b"bv4-";
const END_MARKER: &[u8; MARKER_LEN] = b"bv4$";

/// Decodes an entire Apple-Stream payload into the concatenation of its
/// decoded blocks.
pub fn decode(mut reader: impl Read) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut dict: Vec<u8> = Vec::new();

    loop {
        let mut marker = [0u8; MARKER_LEN];
        if !read_exact_or_eof(&mut reader, &mut marker)? {
            break;
        }

        if &marker == END_MARKER {
            break;
        }

        let block = match &marker {
            UNCOMPRESSED_MARKER => {
                let len = read_u32_len(&mut reader)?;
                let mut payload = vec![0u8; len];
                reader.read_exact(&mut payload).map_err(Error::Io)?;
                payload
            }
            COMPRESSED_MARKER => {
                // Compressed blocks carry both the uncompressed and
                // compressed lengths up front -- the raw LZ4 block format
                // has no self-terminating end marker, so the decoder needs
                // the exact target size to stop at.
                let uncompressed_size = read_u32_len(&mut reader)?;
                let compressed_size = read_u32_len(&mut reader)?;

                let mut payload = vec![0u8; compressed_size];
                reader.read_exact(&mut payload).map_err(Error::Io)?;

                let decoded = lz4_flex::block::decompress_with_dict(&payload, uncompressed_size, &dict)
                    .map_err(|e| Error::Decompression(format!("Apple-Stream block decode failed: {e}")))?;
                if decoded.len() != uncompressed_size {
                    return Err(Error::Decompression(format!(
                        "Apple-Stream block declared {uncompressed_size} uncompressed bytes but decoded {}",
                        decoded.len()
                    )));
                }
                decoded
            }
            other => {
                return Err(Error::Decompression(format!(
                    "unrecognized Apple-Stream block marker {:?}",
                    String::from_utf8_lossy(other)
                )));
            }
        };

        out.extend_from_slice(&block);
        dict = block;
    }

    Ok(out)
}

/// Reads a little-endian `u32` length field and enforces [`MAX_BLOCK_SIZE`].
fn read_u32_len(reader: &mut impl Read) -> Result<usize> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).map_err(Error::Io)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_BLOCK_SIZE {
        return Err(Error::Decompression(format!(
            "Apple-Stream block of {len} bytes exceeds the {MAX_BLOCK_SIZE}-byte cap"
        )));
    }
    Ok(len)
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(Error::Decompression("Apple-Stream truncated mid-marker".into()));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(marker: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(marker);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn compressed_block(uncompressed_size: usize, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(COMPRESSED_MARKER);
        out.extend_from_slice(&(uncompressed_size as u32).to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn single_uncompressed_block_decodes_verbatim() {
        let mut stream = block(UNCOMPRESSED_MARKER, b"hello world");
        stream.extend_from_slice(END_MARKER);

        let decoded = decode(stream.as_slice()).expect("decode");
        assert_eq!(decoded, b"hello world");
    }

    #[test]
    fn missing_end_marker_is_still_accepted_at_eof() {
        let stream = block(UNCOMPRESSED_MARKER, b"no trailer");
        let decoded = decode(stream.as_slice()).expect("decode");
        assert_eq!(decoded, b"no trailer");
    }

    #[test]
    fn oversized_block_length_is_rejected() {
        let mut stream = Vec::new();
        stream.extend_from_slice(COMPRESSED_MARKER);
        stream.extend_from_slice(&(MAX_BLOCK_SIZE as u32 + 1).to_le_bytes());
        stream.extend_from_slice(&0u32.to_le_bytes());

        let err = decode(stream.as_slice()).expect_err("must reject oversized block");
        assert!(matches!(err, Error::Decompression(_)));
    }

    #[test]
    fn unrecognized_marker_is_rejected() {
        let stream = block(b"xxxx", b"");
        let err = decode(stream.as_slice()).expect_err("must reject unknown marker");
        assert!(matches!(err, Error::Decompression(_)));
    }

    #[test]
    fn second_block_chains_off_first_blocks_dictionary() {
        let first = b"the quick brown fox jumps over the lazy dog";
        let second = b"the quick brown fox";
        let compressed_second = lz4_flex::block::compress_with_dict(second, first);

        let mut stream = block(UNCOMPRESSED_MARKER, first);
        stream.extend_from_slice(&compressed_block(second.len(), &compressed_second));
        stream.extend_from_slice(END_MARKER);

        let decoded = decode(stream.as_slice()).expect("decode");
        assert_eq!(decoded, [first.as_slice(), b"the quick brown fox"].concat());
    }
}
