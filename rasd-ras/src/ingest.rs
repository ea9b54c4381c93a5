//! # Producer Ingest
//!
//! Receives CS subevent results from the local controller and reassembles
//! them into the RAS ranging-data format inside the buffer pool. The first
//! subevent of a procedure allocates a buffer and writes the ranging header;
//! every subevent appends a subevent header and its step records; the
//! procedure-done status decides whether the buffer becomes ready or is
//! discarded.
//!
//! Ingest never allocates outside the pool and never blocks. Failure to
//! obtain or fill a buffer drops the procedure and is non-fatal to the
//! connection.

use crate::error::Error;
use crate::pool::RdBufferPool;
use crate::types::{ConnId, RangingCounter};
use crate::wire::{RangingHeader, SubeventHeader};
use tracing::{debug, error, warn};

/// Procedure-level done status reported with each subevent result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcedureDoneStatus {
    /// All subevents of the procedure have been reported.
    Complete = 0x0,
    /// More subevents of this procedure will follow.
    Ongoing = 0x1,
    /// The procedure was aborted by the controller.
    Aborted = 0xf,
}

/// Subevent-level done status reported with each subevent result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubeventDoneStatus {
    Complete = 0x0,
    Aborted = 0xf,
}

/// Per-connection CS configuration the ranging header is stamped from.
///
/// TODO: source these from the negotiated CS configuration; the controller
/// interface consumed here does not expose them yet.
#[derive(Debug, Clone, Copy)]
pub struct CsContext {
    pub selected_tx_power: i8,
    pub antenna_paths_mask: u8,
}

impl Default for CsContext {
    fn default() -> Self {
        Self {
            selected_tx_power: 0,
            antenna_paths_mask: 1,
        }
    }
}

/// Header fields of one controller subevent result.
#[derive(Debug, Clone, Copy)]
pub struct SubeventResultHeader {
    pub procedure_counter: u16,
    pub config_id: u8,
    pub start_acl_conn_event: u16,
    pub frequency_compensation: i16,
    pub procedure_done_status: ProcedureDoneStatus,
    pub subevent_done_status: SubeventDoneStatus,
    pub procedure_abort_reason: u8,
    pub subevent_abort_reason: u8,
    pub reference_power_level: i8,
    pub num_steps_reported: u8,
}

impl Default for SubeventResultHeader {
    fn default() -> Self {
        Self {
            procedure_counter: 0,
            config_id: 0,
            start_acl_conn_event: 0,
            frequency_compensation: 0,
            procedure_done_status: ProcedureDoneStatus::Complete,
            subevent_done_status: SubeventDoneStatus::Complete,
            procedure_abort_reason: 0,
            subevent_abort_reason: 0,
            reference_power_level: 0,
            num_steps_reported: 0,
        }
    }
}

/// One subevent result delivered by the controller.
///
/// `step_data` is the controller's packed step stream: per step a mode byte,
/// a channel byte, a length byte, then that many data bytes.
#[derive(Debug, Clone, Copy)]
pub struct SubeventResult<'a> {
    pub header: SubeventResultHeader,
    pub step_data: Option<&'a [u8]>,
}

/// Cursor state threaded through the step parser.
struct StepScratch<'a> {
    buf: &'a [u8],
    offset: usize,
    current_step: u16,
}

impl<'a> StepScratch<'a> {
    fn next_step(&mut self) -> Option<(u8, &'a [u8])> {
        let rest = self.buf.get(self.offset..)?;
        if rest.len() < 3 {
            return None;
        }

        let mode = rest[0];
        // rest[1] is the step channel; the RAS wire format does not carry it.
        let data_len = usize::from(rest[2]);
        let data = rest.get(3..3 + data_len)?;

        self.offset += 3 + data_len;
        self.current_step += 1;
        Some((mode, data))
    }

    fn exhausted(&self) -> bool {
        self.offset >= self.buf.len()
    }
}

/// Feed one controller subevent result into the pool.
///
/// Resource failures (no buffer, storage overflow, malformed step stream)
/// drop the procedure and log; they never propagate to the caller.
pub fn subevent_data_available(
    pool: &mut RdBufferPool,
    cs: &CsContext,
    conn: ConnId,
    result: &SubeventResult<'_>,
) {
    let counter = RangingCounter::new(result.header.procedure_counter);

    let slot = match pool.writing_slot(conn, counter) {
        Some(slot) => slot,
        None => {
            // A procedure the controller moved past without completing can
            // never finish; abandon it before allocating.
            if let Some(stale) = pool.stale_writing_slot(conn, counter) {
                warn!(%conn, %counter, "abandoning incomplete procedure");
                pool.discard_write(stale);
            }

            // First subevent of a new procedure.
            let slot = match pool.open_for_write(conn, counter) {
                Ok(slot) => slot,
                Err(err) => {
                    error!(%conn, %counter, %err, "failed to allocate ranging data buffer");
                    return;
                }
            };

            pool.set_ranging_header(
                slot,
                RangingHeader {
                    ranging_counter: counter,
                    config_id: result.header.config_id,
                    selected_tx_power: cs.selected_tx_power,
                    antenna_paths_mask: cs.antenna_paths_mask,
                },
            );
            slot
        }
    };

    if let Err(err) = append_subevent_block(pool, slot, result) {
        warn!(%conn, %counter, %err, "dropping procedure");
        pool.discard_write(slot);
        return;
    }

    match result.header.procedure_done_status {
        ProcedureDoneStatus::Complete => {
            debug!(%conn, %counter, "procedure complete");
            pool.complete_write(slot);
        }
        ProcedureDoneStatus::Aborted => {
            debug!(%conn, %counter, "procedure aborted by controller");
            pool.discard_write(slot);
        }
        ProcedureDoneStatus::Ongoing => {}
    }
}

fn append_subevent_block(
    pool: &mut RdBufferPool,
    slot: usize,
    result: &SubeventResult<'_>,
) -> crate::error::Result<()> {
    let hdr = &result.header;

    pool.append_subevent(
        slot,
        &SubeventHeader {
            start_acl_conn_event: hdr.start_acl_conn_event,
            freq_compensation: hdr.frequency_compensation,
            ranging_done_status: hdr.procedure_done_status as u8,
            subevent_done_status: hdr.subevent_done_status as u8,
            ranging_abort_reason: hdr.procedure_abort_reason,
            subevent_abort_reason: hdr.subevent_abort_reason,
            ref_power_level: hdr.reference_power_level,
            num_steps_reported: hdr.num_steps_reported,
        },
    )?;

    let Some(step_data) = result.step_data else {
        return Ok(());
    };

    let mut scratch = StepScratch {
        buf: step_data,
        offset: 0,
        current_step: 0,
    };

    while let Some((mode, data)) = scratch.next_step() {
        pool.append_step(slot, mode, data)?;
    }

    if !scratch.exhausted() {
        // Truncated step record inside the controller stream.
        return Err(Error::BufferTooShort);
    }

    if scratch.current_step != u16::from(hdr.num_steps_reported) {
        warn!(
            reported = hdr.num_steps_reported,
            parsed = scratch.current_step,
            "step count mismatch in controller stream"
        );
    }

    Ok(())
}
