//! # Wire Codec
//!
//! Bit-packed Ranging Service frame formats. Everything on the wire is
//! little-endian; bit fields are packed explicitly with shift/mask routines
//! so the layout is an ABI contract of this module, not of the compiler.

pub mod rascp;
pub mod ranging;
pub mod segment;

pub use rascp::{Command, CpOpcode, Response, ResponseCode, CP_WRITE_MAX_LEN};
pub use ranging::{RangingHeader, SubeventHeader};
pub use segment::SegmentHeader;
