//! Segmentation header of the On-demand Ranging Data characteristic.
//!
//! Every notification or indication carries one header byte followed by up to
//! `ATT_MTU - 5` bytes of the flat procedure image.

use crate::error::{Error, Result};

/// Mask of the 6-bit rolling segment counter.
pub const SEG_COUNTER_MASK: u8 = 0x3f;

/// One-byte segmentation header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Set on the first segment of a transfer session.
    pub first_seg: bool,
    /// Set on the segment that completes the transfer session.
    pub last_seg: bool,
    /// Rolling 6-bit counter, starting at 0 for each session.
    pub seg_counter: u8,
}

impl SegmentHeader {
    /// Encoded length in bytes.
    pub const LEN: usize = 1;

    pub fn encode(&self) -> u8 {
        u8::from(self.first_seg)
            | (u8::from(self.last_seg) << 1)
            | ((self.seg_counter & SEG_COUNTER_MASK) << 2)
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        let raw = *buf.first().ok_or(Error::BufferTooShort)?;

        Ok(Self {
            first_seg: raw & 0x01 != 0,
            last_seg: raw & 0x02 != 0,
            seg_counter: raw >> 2,
        })
    }
}
