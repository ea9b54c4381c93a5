//! # rasd-ras: Ranging Service Protocol State Machines
//!
//! This crate implements the GATT Ranging Service (RAS) transport for
//! Bluetooth LE Channel Sounding: a Ranging Responder (RRSP, server) buffers
//! procedure results delivered by the local controller and hands them to a
//! Ranging Requestor (RREQ, client) as a segmented, control-point-gated
//! on-demand transfer.
//!
//! ## Architecture Overview
//!
//! ```text
//! rasd-ras/
//! ├── error       - Unified protocol error type and ATT status mapping
//! ├── types       - Connection handles, 12-bit ranging counters, time
//! ├── wire        - Bit-packed headers and RAS-CP command/response frames
//! ├── pool        - Ranging-data buffer pool (allocation, overwrite, claims)
//! ├── ingest      - Controller subevent reassembly into procedure buffers
//! ├── rrsp        - Server core: RAS-CP handling and the segment streamer
//! ├── rreq        - Client core: segment reassembly and the ACK handshake
//! ├── gatt        - Boundary traits towards the host GATT stack
//! └── service     - Fixed GATT attribute table of the Ranging Service
//! ```
//!
//! ## Design Principles
//!
//! 1. **Pure State Machine**: No I/O, threads or clocks. The library consumes
//!    GATT writes, controller subevents and deferred work items, and produces
//!    outbound notifications/indications through the [`gatt`] boundary traits.
//!
//! 2. **Deferred Execution**: GATT attribute callbacks never run protocol
//!    logic inline. [`rrsp::RrspCore::on_control_point_write`] only validates
//!    and copies; everything else happens when the host pumps
//!    [`rrsp::RrspWork`] items through [`rrsp::RrspCore::process`].
//!
//! 3. **Explicit Wire Layout**: Every bit-packed header is encoded and decoded
//!    with shift/mask routines over little-endian bytes. Compiler struct
//!    layout is never part of the wire contract.
//!
//! 4. **Deterministic**: State transitions depend only on inputs and the time
//!    value the host passes in, which keeps every scenario unit-testable.

#![forbid(unsafe_code)]

pub mod error;
pub mod gatt;
pub mod ingest;
pub mod pool;
pub mod rreq;
pub mod rrsp;
pub mod service;
pub mod types;
pub mod wire;

pub use error::{Error, Result};
pub use pool::{BufferClaim, PoolEvent, RdBufferPool};
pub use rreq::{RreqCore, RreqEvent};
pub use rrsp::{RrspCore, RrspWork, SessionState};
pub use types::{ConnId, Instant, RangingCounter};

/// UUID of the Ranging Service.
pub const RANGING_SERVICE_UUID: u16 = 0x185b;

/// UUID of the RAS Features characteristic.
pub const RAS_FEATURES_UUID: u16 = 0x2c14;

/// UUID of the Real-time Ranging Data characteristic.
pub const RAS_REALTIME_RD_UUID: u16 = 0x2c15;

/// UUID of the On-demand Ranging Data characteristic.
pub const RAS_ONDEMAND_RD_UUID: u16 = 0x2c16;

/// UUID of the RAS Control Point characteristic.
pub const RAS_CP_UUID: u16 = 0x2c17;

/// UUID of the Ranging Data Ready characteristic.
pub const RAS_RD_READY_UUID: u16 = 0x2c18;

/// UUID of the Ranging Data Overwritten characteristic.
pub const RAS_RD_OVERWRITTEN_UUID: u16 = 0x2c19;
