//! Cancellation plumbing for blocking session I/O.

use crate::{GitError, Result};
use std::io::{self, BufRead, Read, Write};
use tokio_util::sync::CancellationToken;

/// Fails with [`GitError::Cancelled`] once `token` fired.
pub(crate) fn check(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(GitError::Cancelled)
    } else {
        Ok(())
    }
}

fn cancelled() -> io::Error {
    io::Error::other("session cancelled")
}

/// Writer that stops accepting bytes once the token fires.
pub(crate) struct CancellableWriter<'a, W: ?Sized> {
    inner: &'a mut W,
    token: &'a CancellationToken,
}

impl<'a, W: Write + ?Sized> CancellableWriter<'a, W> {
    pub(crate) fn new(inner: &'a mut W, token: &'a CancellationToken) -> Self {
        Self { inner, token }
    }
}

impl<W: Write + ?Sized> Write for CancellableWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.token.is_cancelled() {
            return Err(cancelled());
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader that fails the next fill once the token fires.
pub(crate) struct CancellableReader<'a, R: ?Sized> {
    inner: &'a mut R,
    token: &'a CancellationToken,
}

impl<'a, R: BufRead + ?Sized> CancellableReader<'a, R> {
    pub(crate) fn new(inner: &'a mut R, token: &'a CancellationToken) -> Self {
        Self { inner, token }
    }
}

impl<R: BufRead + ?Sized> Read for CancellableReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.token.is_cancelled() {
            return Err(cancelled());
        }
        self.inner.read(buf)
    }
}

impl<R: BufRead + ?Sized> BufRead for CancellableReader<'_, R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.token.is_cancelled() {
            return Err(cancelled());
        }
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_writer_stops_after_cancel() {
        let token = CancellationToken::new();
        let mut out = Vec::new();
        {
            let mut writer = CancellableWriter::new(&mut out, &token);
            writer.write_all(b"abc").unwrap();
            token.cancel();
            assert!(writer.write_all(b"def").is_err());
        }
        assert_eq!(out, b"abc");
    }

    #[test]
    fn test_reader_stops_after_cancel() {
        let token = CancellationToken::new();
        let mut input = Cursor::new(b"abcdef".to_vec());
        let mut reader = CancellableReader::new(&mut input, &token);
        let mut buf = [0u8; 3];
        reader.read_exact(&mut buf).unwrap();
        token.cancel();
        assert!(reader.read_exact(&mut buf).is_err());
        assert!(check(&token).is_err());
    }
}
