//! Dual-region connection buffer.
//!
//! Bytes in `[read_pos, write_pos)` are readable, `[write_pos, capacity)` is
//! writable, and `[0, read_pos)` is reclaimable by compaction. [`Buffer::fill_from`]
//! reads with a stack-allocated overflow region as the second iovec so a single
//! syscall can ingest more than the writable region currently holds.

use std::io::{IoSliceMut, Read, Write};

/// Size of the spill region handed to `read_vectored` as the second entry.
const OVERFLOW_LEN: usize = 64 * 1024;

/// A growable byte buffer with separate read and write offsets.
#[derive(Debug)]
pub struct Buffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    /// Creates a buffer with `capacity` writable bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Number of bytes available to be read.
    pub fn readable_len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Number of bytes that can be written without reallocating or compacting.
    pub fn writable_len(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    /// Number of already-consumed bytes that compaction would reclaim.
    pub fn reclaimable_len(&self) -> usize {
        self.read_pos
    }

    /// The readable region.
    pub fn readable(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// The writable region. Call [`Buffer::advance_write`] after filling it.
    pub fn writable_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.write_pos..]
    }

    /// Consumes `n` readable bytes. `n` must not exceed [`Buffer::readable_len`].
    pub fn advance_read(&mut self, n: usize) {
        assert!(n <= self.readable_len());
        self.read_pos += n;
    }

    /// Marks `n` writable bytes as written.
    pub fn advance_write(&mut self, n: usize) {
        assert!(n <= self.writable_len());
        self.write_pos += n;
    }

    /// Makes room for at least `n` writable bytes, compacting when the
    /// reclaimable prefix suffices and growing otherwise.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_len() >= n {
            return;
        }
        if self.writable_len() + self.reclaimable_len() < n {
            self.buf.resize(self.write_pos + n + 1, 0);
        } else {
            let readable = self.readable_len();
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
    }

    /// Appends `bytes` to the writable region, growing as needed.
    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        self.buf[self.write_pos..self.write_pos + bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
    }

    /// One scatter-gather read from `src` into the writable region plus a
    /// 64 KiB overflow region; overflow is appended afterwards. Returns the
    /// total number of bytes ingested.
    pub fn fill_from<R: Read>(&mut self, src: &mut R) -> std::io::Result<usize> {
        let mut overflow = [0u8; OVERFLOW_LEN];
        let writable = self.writable_len();
        let n = {
            let write_pos = self.write_pos;
            let mut iov = [
                IoSliceMut::new(&mut self.buf[write_pos..]),
                IoSliceMut::new(&mut overflow),
            ];
            src.read_vectored(&mut iov)?
        };
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.buf.len();
            self.append(&overflow[..n - writable]);
        }
        Ok(n)
    }

    /// One plain write of the readable region to `dst`, consuming what was
    /// accepted.
    pub fn drain_to<W: Write>(&mut self, dst: &mut W) -> std::io::Result<usize> {
        let n = dst.write(self.readable())?;
        self.read_pos += n;
        Ok(n)
    }

    /// Discards all content and rewinds both offsets.
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::io::{IoSliceMut, Read, Write};

    use super::Buffer;

    /// Reader that fills every vectored slice it is handed, in order.
    struct Flood(Vec<u8>);

    impl Read for Flood {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.0.len());
            buf[..n].copy_from_slice(&self.0[..n]);
            self.0.drain(..n);
            Ok(n)
        }

        fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> std::io::Result<usize> {
            let mut total = 0;
            for buf in bufs {
                total += self.read(buf)?;
            }
            Ok(total)
        }
    }

    /// Writer that accepts at most a fixed number of bytes per call.
    struct Choked(Vec<u8>, usize);

    impl Write for Choked {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.1);
            self.0.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn appends_concatenate_in_order() {
        let mut buf = Buffer::new(8);
        buf.append(b"hello");
        buf.append(b", ");
        buf.append(b"world");
        assert_eq!(b"hello, world", buf.readable());
        buf.advance_read(7);
        assert_eq!(b"world", buf.readable());
    }

    #[test]
    fn ensure_writable_compacts_when_reclaimable_suffices() {
        let mut buf = Buffer::new(16);
        buf.append(b"0123456789");
        buf.advance_read(6);
        // writable = 6, reclaimable = 6, so 10 fits after compaction
        buf.ensure_writable(10);
        assert_eq!(b"6789", buf.readable());
        assert!(buf.writable_len() >= 10);
        assert_eq!(0, buf.reclaimable_len());
    }

    #[test]
    fn ensure_writable_grows_at_capacity_boundary() {
        let mut buf = Buffer::new(16);
        buf.append(b"0123456789");
        buf.advance_read(6);
        // writable (6) + reclaimable (6) = 12 < 13, so the region must grow
        buf.ensure_writable(13);
        assert!(buf.writable_len() >= 13);
        assert_eq!(b"6789", buf.readable());
    }

    #[test]
    fn fill_spills_into_overflow_region() {
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let mut src = Flood(payload.clone());
        let mut buf = Buffer::new(1024);
        let n = buf.fill_from(&mut src).unwrap();
        assert_eq!(3000, n);
        assert_eq!(payload.as_slice(), buf.readable());
    }

    #[test]
    fn fill_within_writable_region() {
        let mut src = Flood(b"abc".to_vec());
        let mut buf = Buffer::new(1024);
        assert_eq!(3, buf.fill_from(&mut src).unwrap());
        assert_eq!(b"abc", buf.readable());
        assert_eq!(1021, buf.writable_len());
    }

    #[test]
    fn drain_consumes_only_accepted_bytes() {
        let mut buf = Buffer::new(64);
        buf.append(b"0123456789");
        let mut dst = Choked(Vec::new(), 4);
        assert_eq!(4, buf.drain_to(&mut dst).unwrap());
        assert_eq!(b"456789", buf.readable());
        assert_eq!(4, buf.drain_to(&mut dst).unwrap());
        assert_eq!(2, buf.drain_to(&mut dst).unwrap());
        assert_eq!(b"0123456789", dst.0.as_slice());
        assert_eq!(0, buf.readable_len());
    }

    #[test]
    fn reset_rewinds_offsets() {
        let mut buf = Buffer::new(8);
        buf.append(b"data");
        buf.advance_read(2);
        buf.reset();
        assert_eq!(0, buf.readable_len());
        assert_eq!(0, buf.reclaimable_len());
        assert_eq!(8, buf.writable_len());
    }
}
