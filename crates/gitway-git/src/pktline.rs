//! Git pkt-line format implementation.
//!
//! The pkt-line format is used for all git protocol communication.
//! Each line is prefixed with a 4-character hex length that counts the
//! prefix itself, or one of the special markers "0000" (flush), "0001"
//! (delimiter) and "0002" (response end).

use crate::{GitError, Result};
use std::io::{self, Read, Write};

/// Largest frame on the wire, length prefix included.
pub const MAX_PKT_LEN: usize = 65520;
/// Largest payload a data frame can carry.
pub const MAX_DATA_LEN: usize = MAX_PKT_LEN - 4;

/// A pkt-line packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// Data line with content.
    Data(Vec<u8>),
    /// Flush packet (0000).
    Flush,
    /// Delimiter packet (0001).
    Delimiter,
    /// Response-end packet (0002).
    ResponseEnd,
}

impl PktLine {
    /// Creates a data packet from a string slice.
    pub fn from_string(s: &str) -> Self {
        Self::Data(s.as_bytes().to_vec())
    }

    /// Creates a data packet from bytes.
    pub fn from_bytes(b: impl Into<Vec<u8>>) -> Self {
        Self::Data(b.into())
    }

    /// Encodes the packet to bytes.
    ///
    /// Payloads longer than [`MAX_DATA_LEN`] are rejected, never truncated.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::Data(data) => encode(data),
            Self::Flush => Ok(b"0000".to_vec()),
            Self::Delimiter => Ok(b"0001".to_vec()),
            Self::ResponseEnd => Ok(b"0002".to_vec()),
        }
    }

    /// Returns true if this is a flush packet.
    pub fn is_flush(&self) -> bool {
        matches!(self, Self::Flush)
    }

    /// Returns the data content, or None for special packets.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Returns the data as a string, trimming any trailing newline.
    pub fn as_str(&self) -> Option<&str> {
        self.data()
            .and_then(|d| std::str::from_utf8(d).ok())
            .map(|s| s.trim_end_matches('\n'))
    }
}

/// Frames `data` as a single pkt-line.
pub fn encode(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() > MAX_DATA_LEN {
        return Err(GitError::Framing(format!(
            "payload of {} bytes exceeds {}",
            data.len(),
            MAX_DATA_LEN
        )));
    }
    let mut result = format!("{:04x}", data.len() + 4).into_bytes();
    result.extend_from_slice(data);
    Ok(result)
}

/// Lazily decodes frames from `reader`.
pub fn decode<R: Read>(reader: R) -> PktLineReader<R> {
    PktLineReader::new(reader)
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Reader for pkt-line format.
///
/// Reads exactly one frame per call and never buffers past it, so the
/// underlying stream can be handed to a pack parser afterwards.
pub struct PktLineReader<R> {
    reader: R,
    failed: bool,
}

impl<R: Read> PktLineReader<R> {
    /// Creates a new pkt-line reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            failed: false,
        }
    }

    /// Reads the next packet, `None` on a clean end of stream.
    pub fn read(&mut self) -> Result<Option<PktLine>> {
        let mut len_buf = [0u8; 4];
        match read_full(&mut self.reader, &mut len_buf)? {
            0 => return Ok(None),
            4 => {}
            _ => return Err(GitError::Framing("truncated length prefix".to_string())),
        }

        if !len_buf.iter().all(u8::is_ascii_hexdigit) {
            return Err(GitError::Framing(format!(
                "invalid length prefix {:?}",
                String::from_utf8_lossy(&len_buf)
            )));
        }
        // All four bytes are ASCII hex digits at this point.
        let len = len_buf
            .iter()
            .fold(0usize, |acc, b| (acc << 4) | (*b as char).to_digit(16).unwrap_or(0) as usize);

        match len {
            0 => Ok(Some(PktLine::Flush)),
            1 => Ok(Some(PktLine::Delimiter)),
            2 => Ok(Some(PktLine::ResponseEnd)),
            3 => Err(GitError::Framing("length too small".to_string())),
            _ if len > MAX_PKT_LEN => Err(GitError::Framing(format!(
                "length {} exceeds {}",
                len, MAX_PKT_LEN
            ))),
            _ => {
                let mut data = vec![0u8; len - 4];
                if read_full(&mut self.reader, &mut data)? != data.len() {
                    return Err(GitError::Framing("truncated packet".to_string()));
                }
                Ok(Some(PktLine::Data(data)))
            }
        }
    }

    /// Reads the next packet, treating end of stream as a protocol error.
    pub fn read_required(&mut self) -> Result<PktLine> {
        self.read()?
            .ok_or_else(|| GitError::Protocol("unexpected end of stream".to_string()))
    }

    /// Reads all packets until a flush packet.
    pub fn read_until_flush(&mut self) -> Result<Vec<PktLine>> {
        let mut packets = Vec::new();
        loop {
            match self.read()? {
                Some(PktLine::Flush) | None => break,
                Some(pkt) => packets.push(pkt),
            }
        }
        Ok(packets)
    }

    /// Returns a mutable reference to the inner reader.
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Consumes the reader and returns the inner reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read> Iterator for PktLineReader<R> {
    type Item = Result<PktLine>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.read() {
            Ok(Some(pkt)) => Some(Ok(pkt)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Writer for pkt-line format.
pub struct PktLineWriter<W> {
    writer: W,
}

impl<W: Write> PktLineWriter<W> {
    /// Creates a new pkt-line writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes a packet.
    pub fn write(&mut self, pkt: &PktLine) -> Result<()> {
        self.writer.write_all(&pkt.encode()?)?;
        Ok(())
    }

    /// Writes a data line.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(&encode(data)?)?;
        Ok(())
    }

    /// Writes a string line (with newline).
    pub fn write_line(&mut self, s: &str) -> Result<()> {
        let mut data = s.as_bytes().to_vec();
        if !s.ends_with('\n') {
            data.push(b'\n');
        }
        self.write_data(&data)
    }

    /// Writes an `ERR <message>` line, the protocol's fatal error report.
    pub fn write_error(&mut self, message: &str) -> Result<()> {
        self.write_line(&format!("ERR {}", message))
    }

    /// Writes a flush packet.
    pub fn flush_pkt(&mut self) -> Result<()> {
        self.write(&PktLine::Flush)
    }

    /// Flushes the underlying writer.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Returns a mutable reference to the inner writer.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Returns the inner writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}
