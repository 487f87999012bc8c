//! Zero-fill-skipping copy (to preserve sparse files across a filesystem
//! copy) and a `FICLONE` reflink fast path.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::Result;

const BLOCK_SIZE: usize = 64 * 1024;

/// Copies `src` into `dst` starting at `dst`'s current position, skipping
/// any 64 KiB block that is entirely zero so the destination filesystem
/// can represent it as a hole. `dst` is expected to already be sized (via
/// `set_len`/truncate) to at least the source's length.
pub fn sparse_copy(dst: &File, src: &File) -> Result<()> {
    sparse_copy_at(dst, 0, src)
}

/// As [`sparse_copy`], but writes starting at byte offset `offset` of
/// `dst` rather than its current position — used by disk pull to
/// reassemble layers that each own a disjoint byte range of the same
/// file.
pub fn sparse_copy_at(dst: &File, offset: u64, mut src: impl Read) -> Result<()> {
    let mut dst = dst.try_clone()?;
    dst.seek(SeekFrom::Start(offset))?;

    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut pos: u64 = 0;

    loop {
        let n = read_full(&mut src, &mut buf)?;
        if n == 0 {
            break;
        }

        if !buf[..n].iter().all(|&b| b == 0) {
            dst.seek(SeekFrom::Start(offset + pos))?;
            dst.write_all(&buf[..n])?;
        }

        pos += n as u64;

        if n < BLOCK_SIZE {
            break;
        }
    }

    Ok(())
}

/// Reads up to `buf.len()` bytes, stopping early only at EOF (unlike a
/// single `Read::read`, which may return short reads for reasons other
/// than EOF). Mirrors the Go implementation's "n>0 before err" ordering:
/// a short final read is still written before returning.
fn read_full(src: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(crate::Error::Io(e)),
        }
    }
    Ok(filled)
}

/// Attempts a `FICLONE` reflink of `src` onto `dst`. Returns
/// [`crate::Error::Platform`] when the filesystem does not support it, in
/// which case the caller should fall back to [`sparse_copy`].
pub fn clone_file(dst: &File, src: &File) -> Result<()> {
    use std::os::fd::AsRawFd;
    crate::sys::ficlone(dst.as_raw_fd(), src.as_raw_fd())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    #[test]
    fn zero_input_writes_no_bytes_but_dst_keeps_its_truncated_length() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src_path = dir.path().join("src");
        let dst_path = dir.path().join("dst");

        let zeros = vec![0u8; BLOCK_SIZE * 3];
        std::fs::write(&src_path, &zeros).expect("write src");

        let dst = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&dst_path)
            .expect("open dst");
        dst.set_len(zeros.len() as u64).expect("truncate");

        let src = File::open(&src_path).expect("open src");
        sparse_copy(&dst, &src).expect("copy");

        let metadata = std::fs::metadata(&dst_path).expect("metadata");
        assert_eq!(metadata.len(), zeros.len() as u64);
    }

    #[test]
    fn nonzero_bytes_are_copied_verbatim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src_path = dir.path().join("src");
        let dst_path = dir.path().join("dst");

        let mut data = vec![0u8; BLOCK_SIZE * 2 + 123];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        std::fs::write(&src_path, &data).expect("write src");

        let dst = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&dst_path)
            .expect("open dst");
        dst.set_len(data.len() as u64).expect("truncate");

        let src = File::open(&src_path).expect("open src");
        sparse_copy(&dst, &src).expect("copy");

        let mut copied = Vec::new();
        File::open(&dst_path).expect("reopen").read_to_end(&mut copied).expect("read");
        assert_eq!(copied, data);
    }

    #[test]
    fn partial_final_block_is_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src_path = dir.path().join("src");
        let dst_path = dir.path().join("dst");

        let data = b"short tail, not a full block".to_vec();
        std::fs::write(&src_path, &data).expect("write src");

        let dst = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&dst_path)
            .expect("open dst");
        dst.set_len(data.len() as u64).expect("truncate");

        let src = File::open(&src_path).expect("open src");
        sparse_copy(&dst, &src).expect("copy");

        let copied = std::fs::read(&dst_path).expect("read");
        assert_eq!(copied, data);
    }
}
