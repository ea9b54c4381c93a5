//! # Ranging-Data Buffer Pool
//!
//! Fixed pool of procedure buffers keyed by `(connection, ranging counter)`.
//! The producer side (controller ingest) fills buffers marked `busy`; once a
//! procedure completes the buffer flips to `ready` and becomes claimable by
//! the streaming side. Consumers hold claims (refcounts) while reading, and
//! the allocator only ever overwrites buffers that are ready, unclaimed and
//! not being written.
//!
//! Buffer-state happenings surface through a polled event queue
//! ([`RdBufferPool::poll_event`]) instead of registered callback lists, so
//! the host can forward them to per-connection work queues without re-entrant
//! borrows.

use crate::error::{Error, Result};
use crate::types::{ConnId, RangingCounter, SUBEVENTS_REGION_LEN};
use crate::wire::{RangingHeader, SubeventHeader};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::debug;

/// Buffer-pool event, drained by the host after pool-mutating calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    /// A complete procedure has been stored and is claimable.
    ProcedureReady {
        conn: ConnId,
        ranging_counter: RangingCounter,
    },
    /// A stored procedure was evicted to make room for a newer one before the
    /// peer acknowledged it.
    ProcedureOverwritten {
        conn: ConnId,
        ranging_counter: RangingCounter,
    },
}

/// Claim on a ready procedure buffer.
///
/// Holding a claim keeps the buffer refcounted so the allocator will not
/// evict it. Claims are handles, not borrows: every access revalidates that
/// the slot still stores the claimed procedure.
#[derive(Debug)]
pub struct BufferClaim {
    slot: usize,
    conn: ConnId,
    ranging_counter: RangingCounter,
}

impl BufferClaim {
    pub fn ranging_counter(&self) -> RangingCounter {
        self.ranging_counter
    }
}

struct BufferSlot {
    conn: Option<ConnId>,
    ranging_counter: RangingCounter,
    /// A complete procedure is stored.
    ready: bool,
    /// Ingest is writing into this buffer.
    busy: bool,
    /// The peer acknowledged this procedure; overwriting it is silent.
    acked: bool,
    /// Outstanding claims. Atomic because producer ingest may move to an
    /// interrupt-like context; all other pool state assumes the single
    /// cooperative consumer thread (or an external mutex).
    refcount: AtomicU8,
    /// Write offset into `subevents`.
    subevent_cursor: u16,
    /// Read offset into the flat image (header and subevents combined).
    read_cursor: u16,
    header: RangingHeader,
    subevents: Box<[u8]>,
}

impl BufferSlot {
    fn new() -> Self {
        Self {
            conn: None,
            ranging_counter: RangingCounter::new(0),
            ready: false,
            busy: false,
            acked: false,
            refcount: AtomicU8::new(0),
            subevent_cursor: 0,
            read_cursor: 0,
            header: RangingHeader {
                ranging_counter: RangingCounter::new(0),
                config_id: 0,
                selected_tx_power: 0,
                antenna_paths_mask: 0,
            },
            subevents: vec![0u8; SUBEVENTS_REGION_LEN].into_boxed_slice(),
        }
    }

    fn reset(&mut self) {
        self.conn = None;
        self.ready = false;
        self.busy = false;
        self.acked = false;
        self.refcount.store(0, Ordering::Relaxed);
        self.subevent_cursor = 0;
        self.read_cursor = 0;
    }

    fn init_for_write(&mut self, conn: ConnId, ranging_counter: RangingCounter) {
        self.conn = Some(conn);
        self.ranging_counter = ranging_counter;
        self.ready = false;
        self.busy = true;
        self.acked = false;
        self.refcount.store(0, Ordering::Relaxed);
        self.subevent_cursor = 0;
        self.read_cursor = 0;
    }

    fn image_len(&self) -> usize {
        RangingHeader::LEN + usize::from(self.subevent_cursor)
    }

    fn evictable(&self) -> bool {
        self.ready && !self.busy && self.refcount.load(Ordering::Relaxed) == 0
    }
}

/// Fixed pool of procedure buffers shared by all connections.
pub struct RdBufferPool {
    slots: Vec<BufferSlot>,
    buffers_per_conn: usize,
    events: VecDeque<PoolEvent>,
}

impl RdBufferPool {
    /// Create a pool sized for `max_conn` connections with `buffers_per_conn`
    /// procedure buffers each. All storage is allocated up front.
    pub fn new(max_conn: usize, buffers_per_conn: usize) -> Self {
        let count = max_conn * buffers_per_conn;
        Self {
            slots: (0..count).map(|_| BufferSlot::new()).collect(),
            buffers_per_conn,
            events: VecDeque::new(),
        }
    }

    /// Next pending pool event, if any.
    pub fn poll_event(&mut self) -> Option<PoolEvent> {
        self.events.pop_front()
    }

    /// Whether a complete, unacknowledged procedure is stored for this key.
    pub fn ready_check(&self, conn: ConnId, ranging_counter: RangingCounter) -> bool {
        self.find_ready(conn, ranging_counter).is_some()
    }

    /// Claim the stored procedure for reading. Fails with
    /// [`Error::NoRecords`] if no matching ready buffer exists.
    pub fn claim(&mut self, conn: ConnId, ranging_counter: RangingCounter) -> Result<BufferClaim> {
        let slot = self
            .find_ready(conn, ranging_counter)
            .ok_or(Error::NoRecords)?;

        self.slots[slot].refcount.fetch_add(1, Ordering::Relaxed);
        self.slots[slot].read_cursor = 0;

        Ok(BufferClaim {
            slot,
            conn,
            ranging_counter,
        })
    }

    /// Release a claim. The buffer stays stored and re-claimable until it is
    /// evicted or its connection goes away.
    pub fn release(&mut self, claim: BufferClaim) -> Result<()> {
        let slot = self.checked_slot(&claim)?;
        let refs = self.slots[slot].refcount.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(refs > 0);
        Ok(())
    }

    /// Mark the claimed procedure as acknowledged by the peer. An acked
    /// buffer stops being visible to [`Self::ready_check`]/[`Self::claim`]
    /// and is evicted without an overwritten event.
    pub fn mark_acked(&mut self, claim: &BufferClaim) -> Result<()> {
        let slot = self.checked_slot(claim)?;
        self.slots[slot].acked = true;
        Ok(())
    }

    /// Copy up to `out.len()` bytes of the flat procedure image from the
    /// claim's read cursor, advancing it. Returns 0 once exhausted.
    pub fn pull(&mut self, claim: &BufferClaim, out: &mut [u8]) -> usize {
        let Ok(slot) = self.checked_slot(claim) else {
            return 0;
        };
        let slot = &mut self.slots[slot];

        let cursor = usize::from(slot.read_cursor);
        let remaining = slot.image_len().saturating_sub(cursor);
        let n = remaining.min(out.len());
        if n == 0 {
            return 0;
        }

        let mut header = [0u8; RangingHeader::LEN];
        slot.header.encode(&mut header.as_mut_slice());

        for (i, byte) in out[..n].iter_mut().enumerate() {
            let offset = cursor + i;
            *byte = if offset < RangingHeader::LEN {
                header[offset]
            } else {
                slot.subevents[offset - RangingHeader::LEN]
            };
        }

        slot.read_cursor += n as u16;
        n
    }

    /// Move the read cursor back by `n` bytes after a failed transmit.
    pub fn rewind(&mut self, claim: &BufferClaim, n: u16) {
        if let Ok(slot) = self.checked_slot(claim) {
            let slot = &mut self.slots[slot];
            debug_assert!(slot.read_cursor >= n);
            slot.read_cursor = slot.read_cursor.saturating_sub(n);
        }
    }

    /// Current read offset into the flat image.
    pub fn read_offset(&self, claim: &BufferClaim) -> u16 {
        self.checked_slot(claim)
            .map(|slot| self.slots[slot].read_cursor)
            .unwrap_or(0)
    }

    /// Bytes of the flat image left beyond the read cursor.
    pub fn bytes_remaining(&self, claim: &BufferClaim) -> usize {
        self.checked_slot(claim)
            .map(|slot| {
                self.slots[slot]
                    .image_len()
                    .saturating_sub(usize::from(self.slots[slot].read_cursor))
            })
            .unwrap_or(0)
    }

    /// Total length of the flat image under this claim.
    pub fn image_len(&self, claim: &BufferClaim) -> usize {
        self.checked_slot(claim)
            .map(|slot| self.slots[slot].image_len())
            .unwrap_or(0)
    }

    /// Free every buffer owned by `conn`. Outstanding claims are stale after
    /// a disconnect, so refcounts are deliberately ignored.
    pub fn on_connection_lost(&mut self, conn: ConnId) {
        for slot in &mut self.slots {
            if slot.conn == Some(conn) {
                slot.reset();
            }
        }
        self.events.retain(|ev| match ev {
            PoolEvent::ProcedureReady { conn: c, .. }
            | PoolEvent::ProcedureOverwritten { conn: c, .. } => *c != conn,
        });
    }

    /// Number of buffers currently owned by `conn`.
    pub fn buffer_count(&self, conn: ConnId) -> usize {
        self.slots.iter().filter(|s| s.conn == Some(conn)).count()
    }

    // ------------------------------------------------------------------
    // Producer-side interface (crate-internal, used by `ingest`)
    // ------------------------------------------------------------------

    /// Slot currently being written for this key, if any.
    pub(crate) fn writing_slot(&self, conn: ConnId, ranging_counter: RangingCounter) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.conn == Some(conn) && s.ranging_counter == ranging_counter && s.busy && !s.ready
        })
    }

    /// Busy slot of this connection holding a different counter. At most one
    /// buffer per connection is ever busy, so a stale one must be abandoned
    /// before a new procedure starts.
    pub(crate) fn stale_writing_slot(
        &self,
        conn: ConnId,
        ranging_counter: RangingCounter,
    ) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.conn == Some(conn) && s.ranging_counter != ranging_counter && s.busy
        })
    }

    /// Allocate a buffer for a new procedure.
    ///
    /// While the connection is under its buffer quota any free slot is used.
    /// At quota, the oldest evictable buffer (12-bit wrap-aware) is recycled,
    /// emitting [`PoolEvent::ProcedureOverwritten`] unless it was acked.
    pub(crate) fn open_for_write(
        &mut self,
        conn: ConnId,
        ranging_counter: RangingCounter,
    ) -> Result<usize> {
        let mut conn_buffers = 0;
        let mut free_slot = None;
        let mut victim: Option<usize> = None;

        for (i, slot) in self.slots.iter().enumerate() {
            if slot.conn == Some(conn) {
                conn_buffers += 1;

                if slot.evictable() {
                    let older = match victim {
                        Some(v) => slot
                            .ranging_counter
                            .precedes(self.slots[v].ranging_counter),
                        None => true,
                    };
                    if older {
                        victim = Some(i);
                    }
                }
            } else if slot.conn.is_none() && free_slot.is_none() {
                free_slot = Some(i);
            }
        }

        if conn_buffers < self.buffers_per_conn {
            if let Some(slot) = free_slot {
                self.slots[slot].init_for_write(conn, ranging_counter);
                return Ok(slot);
            }
            return Err(Error::NoBuffers);
        }

        let slot = victim.ok_or(Error::NoBuffers)?;
        let evicted_counter = self.slots[slot].ranging_counter;
        if !self.slots[slot].acked {
            self.events.push_back(PoolEvent::ProcedureOverwritten {
                conn,
                ranging_counter: evicted_counter,
            });
        }
        debug!(%conn, %evicted_counter, "recycling oldest stored procedure");

        self.slots[slot].reset();
        self.slots[slot].init_for_write(conn, ranging_counter);
        Ok(slot)
    }

    pub(crate) fn set_ranging_header(&mut self, slot: usize, header: RangingHeader) {
        self.slots[slot].header = header;
    }

    /// Append a subevent header at the write cursor.
    pub(crate) fn append_subevent(&mut self, slot: usize, header: &SubeventHeader) -> Result<()> {
        let s = &mut self.slots[slot];
        let cursor = usize::from(s.subevent_cursor);
        if cursor + SubeventHeader::LEN > s.subevents.len() {
            return Err(Error::StorageExhausted);
        }

        let mut region = &mut s.subevents[cursor..cursor + SubeventHeader::LEN];
        header.encode(&mut region);
        s.subevent_cursor += SubeventHeader::LEN as u16;
        Ok(())
    }

    /// Append one step record (mode byte then data) at the write cursor.
    pub(crate) fn append_step(&mut self, slot: usize, mode: u8, data: &[u8]) -> Result<()> {
        let s = &mut self.slots[slot];
        let cursor = usize::from(s.subevent_cursor);
        if cursor + 1 + data.len() > s.subevents.len() {
            return Err(Error::StorageExhausted);
        }

        s.subevents[cursor] = mode;
        s.subevents[cursor + 1..cursor + 1 + data.len()].copy_from_slice(data);
        s.subevent_cursor += (1 + data.len()) as u16;
        Ok(())
    }

    /// Complete the procedure: flip `busy` to `ready` and emit the ready
    /// event.
    pub(crate) fn complete_write(&mut self, slot: usize) {
        let s = &mut self.slots[slot];
        debug_assert!(s.busy && !s.ready);
        s.busy = false;
        s.ready = true;

        if let Some(conn) = s.conn {
            self.events.push_back(PoolEvent::ProcedureReady {
                conn,
                ranging_counter: s.ranging_counter,
            });
        }
    }

    /// Drop an in-progress procedure (abort or overflow); no event fires.
    pub(crate) fn discard_write(&mut self, slot: usize) {
        self.slots[slot].reset();
    }

    fn find_ready(&self, conn: ConnId, ranging_counter: RangingCounter) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.conn == Some(conn)
                && s.ranging_counter == ranging_counter
                && s.ready
                && !s.busy
                && !s.acked
        })
    }

    fn checked_slot(&self, claim: &BufferClaim) -> Result<usize> {
        let slot = self.slots.get(claim.slot).ok_or(Error::StaleClaim)?;
        if slot.conn == Some(claim.conn)
            && slot.ranging_counter == claim.ranging_counter
            && slot.ready
        {
            Ok(claim.slot)
        } else {
            Err(Error::StaleClaim)
        }
    }
}
