//! # RREQ Core (Ranging Requestor)
//!
//! Per-connection client state machine. It subscribes to the server's
//! Ranging Service characteristics, drives the GET → segments → Complete →
//! ACK cycle over RAS-CP, and reassembles on-demand segments into a
//! caller-supplied buffer.
//!
//! Reassembly is strictly in-order: the rolling 6-bit segment counter must
//! match the expected value and segment 0 must carry the first-segment flag.
//! Any violation latches an error; remaining segments of the session are
//! drained and the transfer completes exactly once, either with the full
//! image or with an error and no data.

use crate::error::{Error, Result};
use crate::gatt::{Characteristic, GattPeer, SubscriptionKind};
use crate::types::{ConnId, RangingCounter};
use crate::wire::segment::SEG_COUNTER_MASK;
use crate::wire::{Command, RangingHeader, Response, ResponseCode, SegmentHeader, SubeventHeader};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// RAS-CP handshake state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpState {
    /// No RAS-CP write outstanding.
    Idle,
    /// Get Ranging Data written, awaiting the response code.
    GetRdWritten,
    /// ACK Ranging Data written, awaiting the response code.
    AckRdWritten,
}

/// Application-visible events polled off an [`RreqCore`].
#[derive(Debug, PartialEq, Eq)]
pub enum RreqEvent {
    /// The server announced a newly stored procedure.
    RangingDataReady { ranging_counter: RangingCounter },
    /// The server announced it overwrote a stored procedure the client was
    /// not currently fetching.
    RangingDataOverwritten { ranging_counter: RangingCounter },
    /// A Get Ranging Data transfer finished. Fires exactly once per GET,
    /// with either the complete flat image or an error and no data.
    GetComplete {
        ranging_counter: RangingCounter,
        result: Result<Vec<u8>>,
    },
}

struct GetInProgress {
    ranging_counter: RangingCounter,
    /// Caller-supplied output; spare capacity is the receive bound.
    out: Vec<u8>,
    next_expected_segment: u8,
    last_segment_received: bool,
    error: bool,
}

/// Per-connection Ranging Requestor instance.
pub struct RreqCore {
    conn: ConnId,
    cp_state: CpState,
    get: Option<GetInProgress>,
    events: VecDeque<RreqEvent>,
}

impl RreqCore {
    pub fn new(conn: ConnId) -> Self {
        Self {
            conn,
            cp_state: CpState::Idle,
            get: None,
            events: VecDeque::new(),
        }
    }

    pub fn conn(&self) -> ConnId {
        self.conn
    }

    pub fn cp_state(&self) -> CpState {
        self.cp_state
    }

    /// Next pending application event, if any.
    pub fn poll_event(&mut self) -> Option<RreqEvent> {
        self.events.pop_front()
    }

    /// Subscribe to all Ranging Service characteristics used by the
    /// on-demand transfer cycle.
    pub fn subscribe_all<P: GattPeer>(&mut self, peer: &mut P) -> Result<()> {
        peer.subscribe(Characteristic::ControlPoint, SubscriptionKind::Indicate)?;
        for chrc in [
            Characteristic::OnDemandRangingData,
            Characteristic::RangingDataReady,
            Characteristic::RangingDataOverwritten,
        ] {
            peer.subscribe(chrc, SubscriptionKind::Notify)?;
            peer.subscribe(chrc, SubscriptionKind::Indicate)?;
        }
        Ok(())
    }

    /// Start fetching the procedure stored under `ranging_counter`.
    ///
    /// `out` supplies the output storage: received bytes are appended and its
    /// spare capacity bounds the transfer. Fails with [`Error::Busy`] while a
    /// previous GET or RAS-CP exchange is outstanding.
    pub fn get_ranging_data<P: GattPeer>(
        &mut self,
        peer: &mut P,
        out: Vec<u8>,
        ranging_counter: RangingCounter,
    ) -> Result<()> {
        if self.get.is_some() || self.cp_state != CpState::Idle {
            return Err(Error::Busy);
        }

        let mut cmd = Vec::with_capacity(3);
        Command::GetRangingData { ranging_counter }.encode(&mut cmd);
        peer.write_without_response(Characteristic::ControlPoint, &cmd)?;

        debug!(conn = %self.conn, %ranging_counter, "get ranging data written");
        self.get = Some(GetInProgress {
            ranging_counter,
            out,
            next_expected_segment: 0,
            last_segment_received: false,
            error: false,
        });
        self.cp_state = CpState::GetRdWritten;
        Ok(())
    }

    /// Incoming On-demand Ranging Data notification or indication.
    pub fn on_ondemand_rd(&mut self, data: &[u8]) {
        let Some(get) = self.get.as_mut() else {
            debug!(conn = %self.conn, "unexpected on-demand ranging data");
            return;
        };

        if data.len() < 2 {
            debug!(conn = %self.conn, "on-demand segment too short");
            get.error = true;
            return;
        }

        if get.last_segment_received {
            debug!(conn = %self.conn, "segment after last; ignoring");
            return;
        }

        if get.error {
            // Already failing this counter; drain the rest of the session.
            return;
        }

        let Ok(header) = SegmentHeader::parse(data) else {
            return;
        };
        let payload = &data[SegmentHeader::LEN..];

        if header.first_seg && header.seg_counter != 0 {
            debug!(conn = %self.conn, seg = header.seg_counter, "first segment with nonzero counter");
            get.error = true;
            return;
        }

        if header.seg_counter != get.next_expected_segment {
            debug!(
                conn = %self.conn,
                expected = get.next_expected_segment,
                got = header.seg_counter,
                "out-of-order segment not supported"
            );
            get.error = true;
            return;
        }

        if get.out.capacity() - get.out.len() < payload.len() {
            debug!(conn = %self.conn, "output buffer too small for next segment");
            get.error = true;
            return;
        }

        get.out.extend_from_slice(payload);
        if header.last_seg {
            get.last_segment_received = true;
        }
        get.next_expected_segment = header.seg_counter.wrapping_add(1) & SEG_COUNTER_MASK;
    }

    /// Incoming RAS-CP indication.
    pub fn on_control_point_indication<P: GattPeer>(&mut self, peer: &mut P, data: &[u8]) {
        let rsp = match Response::parse(data) {
            Ok(rsp) => rsp,
            Err(err) => {
                debug!(conn = %self.conn, %err, "undecodable RAS-CP indication");
                return;
            }
        };

        match rsp {
            Response::CompleteRangingData { ranging_counter } => {
                let in_progress = self
                    .get
                    .as_ref()
                    .is_some_and(|get| get.ranging_counter == ranging_counter);
                if !in_progress {
                    debug!(conn = %self.conn, %ranging_counter, "unexpected complete RD counter");
                    return;
                }

                self.ack_ranging_data(peer, ranging_counter);
            }
            Response::RspCode(code) => self.handle_rsp_code(code),
        }
    }

    /// Incoming Ranging Data Ready notification or indication.
    pub fn on_rd_ready(&mut self, data: &[u8]) {
        let Some(ranging_counter) = parse_counter_value(data) else {
            debug!(conn = %self.conn, "ranging data ready payload size error");
            return;
        };

        self.events
            .push_back(RreqEvent::RangingDataReady { ranging_counter });
    }

    /// Incoming Ranging Data Overwritten notification or indication.
    pub fn on_rd_overwritten(&mut self, data: &[u8]) {
        let Some(ranging_counter) = parse_counter_value(data) else {
            debug!(conn = %self.conn, "ranging data overwritten payload size error");
            return;
        };

        let fetching = self
            .get
            .as_ref()
            .is_some_and(|get| get.ranging_counter == ranging_counter);
        if fetching {
            if self.cp_state != CpState::Idle {
                // A RAS-CP exchange is outstanding; its response decides.
                debug!(conn = %self.conn, %ranging_counter, "overwritten while RAS-CP pending");
                return;
            }

            warn!(conn = %self.conn, %ranging_counter, "counter overwritten whilst receiving");
            if let Some(get) = self.get.as_mut() {
                get.error = true;
            }
            self.finish();
            return;
        }

        self.events
            .push_back(RreqEvent::RangingDataOverwritten { ranging_counter });
    }

    /// Tear down on disconnect. No completion event fires; the connection is
    /// gone and so is the transfer.
    pub fn teardown(&mut self) {
        self.get = None;
        self.cp_state = CpState::Idle;
        self.events.clear();
    }

    fn ack_ranging_data<P: GattPeer>(&mut self, peer: &mut P, ranging_counter: RangingCounter) {
        let mut cmd = Vec::with_capacity(3);
        Command::AckRangingData { ranging_counter }.encode(&mut cmd);

        match peer.write_without_response(Characteristic::ControlPoint, &cmd) {
            Ok(()) => {
                debug!(conn = %self.conn, %ranging_counter, "ack ranging data written");
                self.cp_state = CpState::AckRdWritten;
            }
            Err(err) => {
                warn!(conn = %self.conn, %ranging_counter, %err, "ack write failed");
                if let Some(get) = self.get.as_mut() {
                    get.error = true;
                }
                self.finish();
            }
        }
    }

    fn handle_rsp_code(&mut self, code: ResponseCode) {
        match self.cp_state {
            CpState::Idle => {
                if self.get.is_some() && code == ResponseCode::ProcedureNotCompleted {
                    warn!(conn = %self.conn, "procedure aborted whilst receiving");
                    if let Some(get) = self.get.as_mut() {
                        get.error = true;
                    }
                    self.finish();
                    return;
                }

                debug!(conn = %self.conn, ?code, "unexpected RAS-CP response code");
            }
            CpState::GetRdWritten => {
                self.cp_state = CpState::Idle;

                if code != ResponseCode::Success {
                    debug!(conn = %self.conn, ?code, "get ranging data rejected");
                    if let Some(get) = self.get.as_mut() {
                        get.error = true;
                    }
                    self.finish();
                }
            }
            CpState::AckRdWritten => {
                self.cp_state = CpState::Idle;

                if code != ResponseCode::Success {
                    debug!(conn = %self.conn, ?code, "ack ranging data rejected");
                }
                self.finish();
            }
        }
    }

    /// Complete the in-progress GET, exactly once.
    fn finish(&mut self) {
        let Some(mut get) = self.get.take() else {
            return;
        };

        if !get.last_segment_received {
            debug!(conn = %self.conn, "ranging data completed with missing segments");
            get.error = true;
        }

        let result = if get.error {
            Err(Error::Incomplete)
        } else {
            Ok(get.out)
        };

        self.events.push_back(RreqEvent::GetComplete {
            ranging_counter: get.ranging_counter,
            result,
        });
    }
}

fn parse_counter_value(data: &[u8]) -> Option<RangingCounter> {
    if data.len() != 2 {
        return None;
    }
    Some(RangingCounter::new(u16::from_le_bytes([data[0], data[1]])))
}

/// Walk a reassembled ranging-data image.
///
/// Invokes `on_subevent` for every subevent header and `on_step` for every
/// step, passing the step mode and the remaining bytes; `on_step` returns the
/// step-data length to consume (mode-dependent), or `None` to stop walking.
/// Returns the ranging header of the image.
pub fn ranging_data_parse<FS, FD>(
    image: &[u8],
    mut on_subevent: FS,
    mut on_step: FD,
) -> Result<RangingHeader>
where
    FS: FnMut(&SubeventHeader) -> bool,
    FD: FnMut(u8, &[u8]) -> Option<usize>,
{
    let header = RangingHeader::parse(image)?;
    let mut rest = &image[RangingHeader::LEN..];

    while rest.len() >= SubeventHeader::LEN {
        let subevent = SubeventHeader::parse(rest)?;
        rest = &rest[SubeventHeader::LEN..];

        if subevent.num_steps_reported == 0 || rest.is_empty() {
            return Ok(header);
        }

        if !on_subevent(&subevent) {
            return Ok(header);
        }

        for _ in 0..subevent.num_steps_reported {
            let (&mode, step_rest) = rest.split_first().ok_or(Error::BufferTooShort)?;

            let Some(data_len) = on_step(mode, step_rest) else {
                return Ok(header);
            };
            if data_len > step_rest.len() {
                return Err(Error::BufferTooShort);
            }
            rest = &step_rest[data_len..];
        }
    }

    Ok(header)
}
