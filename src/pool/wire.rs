//! Frame encoding for worker streams
//!
//! Every message is a sequence of fields in a fixed order agreed by both
//! sides: little-endian `i32`/`i64` integers and length-prefixed strings
//! (`i32` byte length, then the bytes, no terminator). There are no frame
//! delimiters or resync markers, so any decode error leaves the stream
//! unusable and is treated as fatal by the pool.
//!
//! Writers build a whole message in a [`Frame`] and send it in one write;
//! readers pull fields one at a time with [`FrameReader`].

use crate::error::{WireError, WireResult};
use std::io::{self, Read, Write};

/// Largest string accepted from a peer
pub const MAX_STRING_LEN: usize = 64 * 1024 * 1024;

/// Largest string list accepted from a peer
pub const MAX_LIST_LEN: usize = 1 << 20;

/// An outgoing message under construction
#[derive(Debug, Default, Clone)]
pub struct Frame {
    buf: Vec<u8>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Booleans travel as `i32` 0/1
    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.put_i32(i32::from(v))
    }

    pub fn put_str(&mut self, s: &str) -> &mut Self {
        self.put_i32(s.len() as i32);
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    /// Count-prefixed list of strings
    pub fn put_strs(&mut self, list: &[String]) -> &mut Self {
        self.put_i32(list.len() as i32);
        for s in list {
            self.put_str(s);
        }
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Write the whole frame to `w` and flush
    pub fn send<W: Write>(&self, w: &mut W) -> WireResult<()> {
        w.write_all(&self.buf)?;
        w.flush()?;
        Ok(())
    }
}

/// Field-by-field decoder over a byte stream
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn fill(&mut self, buf: &mut [u8]) -> WireResult<()> {
        self.inner.read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => WireError::UnexpectedEof,
            _ => WireError::Io(e),
        })
    }

    pub fn get_i32(&mut self) -> WireResult<i32> {
        let mut b = [0u8; 4];
        self.fill(&mut b)?;
        Ok(i32::from_le_bytes(b))
    }

    pub fn get_i64(&mut self) -> WireResult<i64> {
        let mut b = [0u8; 8];
        self.fill(&mut b)?;
        Ok(i64::from_le_bytes(b))
    }

    pub fn get_bool(&mut self) -> WireResult<bool> {
        Ok(self.get_i32()? != 0)
    }

    /// Read a non-negative `i32` length or count, bounded by `max`
    fn get_len(&mut self, max: usize) -> WireResult<usize> {
        let len = self.get_i32()?;
        if len < 0 {
            return Err(WireError::NegativeLength(len));
        }
        let len = len as usize;
        if len > max {
            return Err(WireError::TooLong { len, max });
        }
        Ok(len)
    }

    pub fn get_bytes(&mut self) -> WireResult<Vec<u8>> {
        let len = self.get_len(MAX_STRING_LEN)?;
        let mut data = vec![0u8; len];
        self.fill(&mut data)?;
        Ok(data)
    }

    pub fn get_string(&mut self) -> WireResult<String> {
        String::from_utf8(self.get_bytes()?).map_err(|_| WireError::InvalidUtf8)
    }

    pub fn get_strings(&mut self) -> WireResult<Vec<String>> {
        let count = self.get_len(MAX_LIST_LEN)?;
        let mut out = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            out.push(self.get_string()?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(frame: &Frame) -> FrameReader<Cursor<Vec<u8>>> {
        FrameReader::new(Cursor::new(frame.as_bytes().to_vec()))
    }

    #[test]
    fn test_field_layout_is_little_endian() {
        let mut f = Frame::new();
        f.put_i32(1).put_str("ab");
        assert_eq!(f.as_bytes(), &[1, 0, 0, 0, 2, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn test_mixed_message() {
        let mut f = Frame::new();
        f.put_i32(-7)
            .put_i64(1 << 40)
            .put_bool(true)
            .put_str("dir/file")
            .put_strs(&["h1".to_string(), "h2".to_string()]);

        let mut r = reader(&f);
        assert_eq!(r.get_i32().unwrap(), -7);
        assert_eq!(r.get_i64().unwrap(), 1 << 40);
        assert!(r.get_bool().unwrap());
        assert_eq!(r.get_string().unwrap(), "dir/file");
        assert_eq!(r.get_strings().unwrap(), vec!["h1", "h2"]);
        assert!(matches!(r.get_i32(), Err(WireError::UnexpectedEof)));
    }

    #[test]
    fn test_negative_length_is_malformed() {
        let mut f = Frame::new();
        f.put_i32(-1);
        assert!(matches!(
            reader(&f).get_string(),
            Err(WireError::NegativeLength(-1))
        ));
    }

    #[test]
    fn test_short_string_is_eof() {
        let mut f = Frame::new();
        f.put_i32(10);
        f.buf.extend_from_slice(b"abc");
        assert!(matches!(reader(&f).get_string(), Err(WireError::UnexpectedEof)));
    }

    #[test]
    fn test_empty_string() {
        let mut f = Frame::new();
        f.put_str("");
        assert_eq!(reader(&f).get_string().unwrap(), "");
    }
}
