//! Sideband multiplexing.
//!
//! With `side-band` or `side-band-64k` negotiated, every response frame
//! starts with a channel byte: 1 for pack or report data, 2 for progress
//! text, 3 for a fatal error that ends the stream.

use crate::capabilities::{Capabilities, SIDE_BAND, SIDE_BAND_64K};
use crate::pktline::{self, MAX_PKT_LEN};
use crate::Result;
use std::io::{self, Write};

/// Sideband channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Band {
    Data = 1,
    Progress = 2,
    Error = 3,
}

/// Which sideband flavour, if any, the client negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SidebandMode {
    #[default]
    Disabled,
    /// `side-band`: frames of at most 1000 bytes.
    Basic,
    /// `side-band-64k`: frames of at most 65520 bytes.
    Large,
}

impl SidebandMode {
    /// Picks the mode from negotiated capabilities, preferring 64k.
    pub fn from_capabilities(caps: &Capabilities) -> Self {
        if caps.contains(SIDE_BAND_64K) {
            Self::Large
        } else if caps.contains(SIDE_BAND) {
            Self::Basic
        } else {
            Self::Disabled
        }
    }

    /// True when pack data is multiplexed.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Payload bytes per frame after the length prefix and channel byte.
    pub fn max_payload(&self) -> usize {
        match self {
            Self::Basic => 1000 - 5,
            Self::Large | Self::Disabled => MAX_PKT_LEN - 5,
        }
    }
}

/// Writes `data` on `band`, split into as many frames as needed.
pub fn write_band<W: Write + ?Sized>(
    writer: &mut W,
    mode: SidebandMode,
    band: Band,
    data: &[u8],
) -> Result<()> {
    for chunk in data.chunks(mode.max_payload()) {
        let mut frame = Vec::with_capacity(chunk.len() + 1);
        frame.push(band as u8);
        frame.extend_from_slice(chunk);
        writer.write_all(&pktline::encode(&frame)?)?;
    }
    Ok(())
}

/// Adapts a stream so that every write becomes channel-1 frames.
pub struct SidebandWriter<'a, W: ?Sized> {
    inner: &'a mut W,
    mode: SidebandMode,
}

impl<'a, W: Write + ?Sized> SidebandWriter<'a, W> {
    /// Wraps `inner`, chunking writes into band 1 frames.
    pub fn new(inner: &'a mut W, mode: SidebandMode) -> Self {
        Self { inner, mode }
    }
}

impl<W: Write + ?Sized> Write for SidebandWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(self.mode.max_payload());
        write_band(self.inner, self.mode, Band::Data, &buf[..n])
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
