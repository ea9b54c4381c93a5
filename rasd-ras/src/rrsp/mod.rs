//! # RRSP Core (Ranging Responder)
//!
//! Per-connection server state machine. It accepts RAS-CP writes, streams
//! claimed procedure buffers to the peer as MTU-sized segments, raises the
//! ready/overwritten status characteristics, and supervises the
//! acknowledgement handshake.
//!
//! ## Deferred Execution
//!
//! The GATT write callback only runs [`RrspCore::on_control_point_write`],
//! which validates, copies the payload and hands back a work item. All
//! protocol logic happens in [`RrspCore::process`], which the host invokes
//! from its work queue; follow-up work items returned from `process` must be
//! re-enqueued, never executed inline. This keeps the full code path out of
//! the GATT stack's locks.
//!
//! ## Streaming Model
//!
//! Sending a segment is asynchronous-complete: the streamer posts one
//! notification or indication and exits. The host feeds the stack's
//! sent/confirmed signals back as [`RrspWork::SegmentSent`] /
//! [`RrspWork::IndicateConfirmed`], which trigger the next segment. A failed
//! send rewinds the read cursor and retries on the next wake.

mod rascp;

use crate::error::Error;
use crate::gatt::{AttError, Characteristic, GattLink, SubscriptionKind};
use crate::pool::{BufferClaim, RdBufferPool};
use crate::types::{ConnId, Instant, RangingCounter};
use crate::wire::segment::SEG_COUNTER_MASK;
use crate::wire::{SegmentHeader, CP_WRITE_MAX_LEN};
use core::time::Duration;
use tracing::{debug, warn};

/// Streaming session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No active transfer, no claim held.
    Idle,
    /// Claim held, segments being emitted.
    Streaming,
    /// All segments sent, Complete Ranging Data indicated, waiting for the
    /// peer's ACK.
    AwaitingAck,
}

/// Deferred work items of one RRSP context.
///
/// Tagged messages delivered through the host work queue; they replace the
/// callback-plus-backpointer chains a stack-native implementation would use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RrspWork {
    /// A RAS-CP command was copied into the context and awaits handling.
    CommandWrite,
    /// The streamer should emit the next segment.
    StreamWake,
    /// The stack finished sending a notification.
    SegmentSent,
    /// The peer confirmed an indication.
    IndicateConfirmed,
    /// A ready/overwritten status counter is pending transmission.
    StatusPending,
    /// The RAS-CP response timer may have expired.
    RascpTimeout,
}

/// Per-connection Ranging Responder instance.
pub struct RrspCore {
    conn: ConnId,
    state: SessionState,
    active: Option<BufferClaim>,
    /// Rolling session segment counter; only the low 6 bits go on the wire.
    segment_counter: u16,
    cmd_buf: [u8; CP_WRITE_MAX_LEN],
    cmd_len: usize,
    cmd_pending: bool,
    pending_ready: Option<RangingCounter>,
    pending_overwritten: Option<RangingCounter>,
    rascp_deadline: Option<Instant>,
    rascp_timeout: Duration,
}

impl RrspCore {
    /// Default bound on waiting for the peer's ACK after a Complete Ranging
    /// Data indication.
    pub const DEFAULT_RASCP_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(conn: ConnId, rascp_timeout: Duration) -> Self {
        Self {
            conn,
            state: SessionState::Idle,
            active: None,
            segment_counter: 0,
            cmd_buf: [0; CP_WRITE_MAX_LEN],
            cmd_len: 0,
            cmd_pending: false,
            pending_ready: None,
            pending_overwritten: None,
            rascp_deadline: None,
            rascp_timeout,
        }
    }

    pub fn conn(&self) -> ConnId {
        self.conn
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// GATT-context entry point for a RAS-CP attribute write.
    ///
    /// Runs synchronously under the stack's locks, so it only validates and
    /// copies: the caller must enqueue the returned work item and fail the
    /// ATT write with the returned error code otherwise.
    pub fn on_control_point_write<L: GattLink>(
        &mut self,
        link: &L,
        payload: &[u8],
    ) -> core::result::Result<RrspWork, AttError> {
        if !link.is_subscribed(Characteristic::ControlPoint, SubscriptionKind::Indicate) {
            return Err(AttError::CccConfig);
        }

        if self.cmd_pending {
            return Err(AttError::WriteRequestRejected);
        }

        let len = payload.len().min(CP_WRITE_MAX_LEN);
        self.cmd_buf[..len].copy_from_slice(&payload[..len]);
        self.cmd_len = len;
        self.cmd_pending = true;

        debug!(conn = %self.conn, len = payload.len(), "RAS-CP write accepted");
        Ok(RrspWork::CommandWrite)
    }

    /// Record a procedure-ready event for status notification.
    ///
    /// A single pending slot is kept: if a second procedure completes before
    /// the first status went out, the newer counter wins.
    pub fn ranging_data_ready(&mut self, ranging_counter: RangingCounter) -> RrspWork {
        if let Some(stale) = self.pending_ready.replace(ranging_counter) {
            debug!(conn = %self.conn, %stale, "ready status superseded before send");
        }
        RrspWork::StatusPending
    }

    /// Record a procedure-overwritten event for status notification.
    pub fn ranging_data_overwritten(&mut self, ranging_counter: RangingCounter) -> RrspWork {
        if let Some(stale) = self.pending_overwritten.replace(ranging_counter) {
            debug!(conn = %self.conn, %stale, "overwritten status superseded before send");
        }
        RrspWork::StatusPending
    }

    /// Deadline of the RAS-CP response timer, while armed.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.rascp_deadline
    }

    /// Execute one deferred work item. Returned items must be re-enqueued by
    /// the host.
    pub fn process<L: GattLink>(
        &mut self,
        work: RrspWork,
        now: Instant,
        pool: &mut RdBufferPool,
        link: &mut L,
    ) -> Vec<RrspWork> {
        match work {
            RrspWork::CommandWrite => self.handle_command(pool, link),
            RrspWork::StreamWake | RrspWork::SegmentSent | RrspWork::IndicateConfirmed => {
                self.stream_step(now, pool, link)
            }
            RrspWork::StatusPending => self.flush_status(link),
            RrspWork::RascpTimeout => self.handle_rascp_timeout(now, pool),
        }
    }

    /// Tear down on disconnect: drop the claim and all pending state.
    pub fn teardown(&mut self, pool: &mut RdBufferPool) {
        if let Some(claim) = self.active.take() {
            let _ = pool.release(claim);
        }
        self.state = SessionState::Idle;
        self.cmd_pending = false;
        self.pending_ready = None;
        self.pending_overwritten = None;
        self.rascp_deadline = None;
    }

    fn stream_step<L: GattLink>(
        &mut self,
        now: Instant,
        pool: &mut RdBufferPool,
        link: &mut L,
    ) -> Vec<RrspWork> {
        if self.state != SessionState::Streaming {
            return Vec::new();
        }
        let Some(claim) = self.active.as_ref() else {
            return Vec::new();
        };

        // Up to ATT_MTU-4 octets fill the characteristic message; one more
        // byte is reserved for the segmentation header.
        let Some(max_data_len) = usize::from(link.mtu()).checked_sub(4 + SegmentHeader::LEN)
        else {
            warn!(conn = %self.conn, mtu = link.mtu(), "MTU too small to stream");
            return Vec::new();
        };
        if max_data_len == 0 {
            warn!(conn = %self.conn, mtu = link.mtu(), "MTU too small to stream");
            return Vec::new();
        }

        let ranging_counter = claim.ranging_counter();
        let first_seg = pool.read_offset(claim) == 0;

        let mut segment = vec![0u8; SegmentHeader::LEN + max_data_len];
        let pulled = pool.pull(claim, &mut segment[SegmentHeader::LEN..]);
        if pulled == 0 {
            warn!(conn = %self.conn, %ranging_counter, "stream wake with no data left");
            return Vec::new();
        }
        let last_seg = pool.bytes_remaining(claim) == 0;
        segment.truncate(SegmentHeader::LEN + pulled);

        segment[0] = SegmentHeader {
            first_seg,
            last_seg,
            seg_counter: self.segment_counter as u8 & SEG_COUNTER_MASK,
        }
        .encode();

        match self.ondemand_send(link, &segment) {
            Ok(()) => {
                debug!(
                    conn = %self.conn,
                    seg_counter = self.segment_counter & u16::from(SEG_COUNTER_MASK),
                    len = pulled,
                    last_seg,
                    "segment sent"
                );
                self.segment_counter = self.segment_counter.wrapping_add(1);

                if last_seg {
                    self.send_complete_rd(link, ranging_counter);
                    self.state = SessionState::AwaitingAck;
                    self.rascp_deadline = Some(now.saturating_add(self.rascp_timeout));
                }
                Vec::new()
            }
            Err(Error::NotSubscribed) => {
                // No path to the peer; rewind and wait for a new wake.
                warn!(conn = %self.conn, "on-demand ranging data not subscribed");
                if let Some(claim) = self.active.as_ref() {
                    pool.rewind(claim, pulled as u16);
                }
                Vec::new()
            }
            Err(err) => {
                warn!(conn = %self.conn, %err, "segment send failed; rewinding");
                if let Some(claim) = self.active.as_ref() {
                    pool.rewind(claim, pulled as u16);
                }
                vec![RrspWork::StreamWake]
            }
        }
    }

    fn flush_status<L: GattLink>(&mut self, link: &mut L) -> Vec<RrspWork> {
        // Overwritten goes first: the eviction happened before the procedure
        // that displaced it became ready.
        if let Some(ranging_counter) = self.pending_overwritten.take() {
            if let Err(err) =
                status_send(link, Characteristic::RangingDataOverwritten, ranging_counter)
            {
                warn!(conn = %self.conn, %ranging_counter, %err, "overwritten status send failed");
            }
        }

        if let Some(ranging_counter) = self.pending_ready.take() {
            if let Err(err) =
                status_send(link, Characteristic::RangingDataReady, ranging_counter)
            {
                warn!(conn = %self.conn, %ranging_counter, %err, "ready status send failed");
            }
        }

        Vec::new()
    }

    fn handle_rascp_timeout(&mut self, now: Instant, pool: &mut RdBufferPool) -> Vec<RrspWork> {
        if self.state != SessionState::AwaitingAck {
            return Vec::new();
        }
        let Some(deadline) = self.rascp_deadline else {
            return Vec::new();
        };
        if now < deadline {
            return Vec::new();
        }

        warn!(conn = %self.conn, "no ACK within RAS-CP timeout; abandoning session");
        if let Some(claim) = self.active.take() {
            let _ = pool.release(claim);
        }
        self.state = SessionState::Idle;
        self.rascp_deadline = None;
        Vec::new()
    }

    fn ondemand_send<L: GattLink>(&self, link: &mut L, data: &[u8]) -> crate::Result<()> {
        let chrc = Characteristic::OnDemandRangingData;
        if link.is_subscribed(chrc, SubscriptionKind::Notify) {
            link.notify(chrc, data)
        } else if link.is_subscribed(chrc, SubscriptionKind::Indicate) {
            link.indicate(chrc, data)
        } else {
            Err(Error::NotSubscribed)
        }
    }
}

fn status_send<L: GattLink>(
    link: &mut L,
    chrc: Characteristic,
    ranging_counter: RangingCounter,
) -> crate::Result<()> {
    let data = ranging_counter.value().to_le_bytes();
    if link.is_subscribed(chrc, SubscriptionKind::Notify) {
        link.notify(chrc, &data)
    } else if link.is_subscribed(chrc, SubscriptionKind::Indicate) {
        link.indicate(chrc, &data)
    } else {
        Err(Error::NotSubscribed)
    }
}
