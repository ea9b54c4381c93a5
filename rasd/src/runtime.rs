//! Connection registry and deferred work-queue pump.
//!
//! The protocol cores are pure state machines; this module is the host glue
//! that owns them. A [`RasHost`] maps connection handles to RRSP contexts,
//! shares one buffer pool between ingest and streaming, and pumps the
//! deferred work items (command handling, segment streaming, status
//! notifications, timers) that GATT callbacks and the controller enqueue.
//!
//! GATT-context entry points ([`RasHost::control_point_write`], the
//! [`WorkScheduler`] sent/confirmed signals) never run protocol logic; they
//! validate, enqueue and return. The embedder pumps the queue from its
//! cooperative thread with [`RasHost::run_until_idle`] and drives the RAS-CP
//! response timer off [`RasHost::next_deadline`].

use crate::config::RasConfig;
use crate::telemetry::{record_metric, MetricsEvent};
use crossbeam_channel::{unbounded, Receiver, Sender};
use rasd_ras::gatt::GattLink;
use rasd_ras::ingest::{subevent_data_available, CsContext, SubeventResult};
use rasd_ras::pool::{PoolEvent, RdBufferPool};
use rasd_ras::rrsp::{RrspCore, RrspWork, SessionState};
use rasd_ras::types::{ConnId, Instant};
use rasd_ras::{Error, Result};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Cloneable handle for enqueuing work from GATT-stack callbacks.
#[derive(Clone)]
pub struct WorkScheduler {
    tx: Sender<(ConnId, RrspWork)>,
}

impl WorkScheduler {
    /// The stack finished sending a notification on this connection.
    pub fn notification_sent(&self, conn: ConnId) {
        let _ = self.tx.send((conn, RrspWork::SegmentSent));
    }

    /// The peer confirmed an indication on this connection.
    pub fn indicate_confirmed(&self, conn: ConnId) {
        let _ = self.tx.send((conn, RrspWork::IndicateConfirmed));
    }
}

struct Session<L> {
    core: RrspCore,
    link: L,
}

/// Per-process Ranging Service host.
pub struct RasHost<L: GattLink> {
    config: RasConfig,
    cs: CsContext,
    pool: RdBufferPool,
    sessions: HashMap<ConnId, Session<L>>,
    work_tx: Sender<(ConnId, RrspWork)>,
    work_rx: Receiver<(ConnId, RrspWork)>,
}

impl<L: GattLink> RasHost<L> {
    pub fn new(config: RasConfig) -> Self {
        let pool = RdBufferPool::new(config.max_active_conn, config.rd_buffers_per_conn);
        let (work_tx, work_rx) = unbounded();

        Self {
            config,
            cs: CsContext::default(),
            pool,
            sessions: HashMap::new(),
            work_tx,
            work_rx,
        }
    }

    /// Handle for the GATT layer's sent/confirmed callbacks.
    pub fn scheduler(&self) -> WorkScheduler {
        WorkScheduler {
            tx: self.work_tx.clone(),
        }
    }

    /// Allocate a server context for a new connection.
    pub fn connected(&mut self, conn: ConnId, link: L) -> Result<()> {
        if self.sessions.contains_key(&conn) {
            return Err(Error::Busy);
        }
        if self.sessions.len() >= self.config.max_active_conn {
            warn!(%conn, "no free RRSP context");
            return Err(Error::NoBuffers);
        }

        debug!(%conn, "allocating RRSP context");
        self.sessions.insert(
            conn,
            Session {
                core: RrspCore::new(conn, self.config.rascp_timeout()),
                link,
            },
        );
        Ok(())
    }

    /// Tear down everything owned by a disconnected peer: its context, its
    /// pool buffers and any queued work items.
    pub fn disconnected(&mut self, conn: ConnId) {
        debug!(%conn, "freeing RRSP context");
        if let Some(mut session) = self.sessions.remove(&conn) {
            session.core.teardown(&mut self.pool);
        }
        self.pool.on_connection_lost(conn);

        let queued: Vec<_> = self.work_rx.try_iter().collect();
        for (owner, work) in queued {
            if owner != conn {
                let _ = self.work_tx.send((owner, work));
            }
        }
    }

    /// Controller delivery of one CS subevent result.
    pub fn subevent_data_available(&mut self, conn: ConnId, result: &SubeventResult<'_>) {
        subevent_data_available(&mut self.pool, &self.cs, conn, result);
        self.route_pool_events();
    }

    /// GATT attribute write on RAS-CP. Returns the ATT application error
    /// code to fail the write with, if any.
    pub fn control_point_write(
        &mut self,
        conn: ConnId,
        payload: &[u8],
    ) -> core::result::Result<(), u8> {
        let Some(session) = self.sessions.get_mut(&conn) else {
            warn!(%conn, "RAS-CP write without context");
            return Err(rasd_ras::gatt::AttError::WriteRequestRejected.code());
        };

        match session.core.on_control_point_write(&session.link, payload) {
            Ok(work) => {
                let _ = self.work_tx.send((conn, work));
                Ok(())
            }
            Err(att) => {
                record_metric(MetricsEvent::CommandRejected);
                Err(att.code())
            }
        }
    }

    /// Earliest RAS-CP response deadline across all sessions.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter_map(|session| session.core.next_timeout())
            .min()
    }

    /// Enqueue timeout work for every session whose deadline has passed.
    pub fn handle_timeouts(&mut self, now: Instant) {
        for (conn, session) in &self.sessions {
            let due = session
                .core
                .next_timeout()
                .is_some_and(|deadline| deadline <= now);
            if due && session.core.state() == SessionState::AwaitingAck {
                record_metric(MetricsEvent::AckTimeout);
                let _ = self.work_tx.send((*conn, RrspWork::RascpTimeout));
            }
        }
    }

    /// Drain and execute queued work items until the queue is empty.
    pub fn run_until_idle(&mut self, now: Instant) {
        while let Ok((conn, work)) = self.work_rx.try_recv() {
            let Some(session) = self.sessions.get_mut(&conn) else {
                debug!(%conn, ?work, "dropping work for vanished connection");
                continue;
            };

            let follow = session
                .core
                .process(work, now, &mut self.pool, &mut session.link);
            for work in follow {
                let _ = self.work_tx.send((conn, work));
            }
        }
    }

    /// Session state accessor, mainly for supervision and tests.
    pub fn session_state(&self, conn: ConnId) -> Option<SessionState> {
        self.sessions.get(&conn).map(|session| session.core.state())
    }

    fn route_pool_events(&mut self) {
        while let Some(event) = self.pool.poll_event() {
            let (conn, work) = match event {
                PoolEvent::ProcedureReady {
                    conn,
                    ranging_counter,
                } => {
                    record_metric(MetricsEvent::ProcedureStored);
                    let Some(session) = self.sessions.get_mut(&conn) else {
                        continue;
                    };
                    (conn, session.core.ranging_data_ready(ranging_counter))
                }
                PoolEvent::ProcedureOverwritten {
                    conn,
                    ranging_counter,
                } => {
                    record_metric(MetricsEvent::ProcedureOverwritten);
                    let Some(session) = self.sessions.get_mut(&conn) else {
                        continue;
                    };
                    (conn, session.core.ranging_data_overwritten(ranging_counter))
                }
            };
            let _ = self.work_tx.send((conn, work));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasd_ras::gatt::{Characteristic, SubscriptionKind};
    use rasd_ras::ingest::{ProcedureDoneStatus, SubeventResultHeader};
    use rasd_ras::wire::{Response, ResponseCode, SegmentHeader};
    use std::sync::{Arc, Mutex};

    const CONN: ConnId = ConnId(3);

    #[derive(Default)]
    struct LinkState {
        notifications: Vec<(Characteristic, Vec<u8>)>,
        indications: Vec<(Characteristic, Vec<u8>)>,
    }

    #[derive(Clone, Default)]
    struct SharedLink {
        state: Arc<Mutex<LinkState>>,
    }

    impl GattLink for SharedLink {
        fn mtu(&self) -> u16 {
            27
        }

        fn is_subscribed(&self, _chrc: Characteristic, _kind: SubscriptionKind) -> bool {
            true
        }

        fn notify(&mut self, chrc: Characteristic, data: &[u8]) -> Result<()> {
            self.state.lock().unwrap().notifications.push((chrc, data.to_vec()));
            Ok(())
        }

        fn indicate(&mut self, chrc: Characteristic, data: &[u8]) -> Result<()> {
            self.state.lock().unwrap().indications.push((chrc, data.to_vec()));
            Ok(())
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn now() -> Instant {
        Instant::from_nanos(0)
    }

    fn ingest_complete_procedure(host: &mut RasHost<SharedLink>, counter: u16) {
        let blob = [1u8, 9, 3, 0xaa, 0xbb, 0xcc];
        host.subevent_data_available(
            CONN,
            &SubeventResult {
                header: SubeventResultHeader {
                    procedure_counter: counter,
                    num_steps_reported: 1,
                    procedure_done_status: ProcedureDoneStatus::Complete,
                    ..Default::default()
                },
                step_data: Some(&blob),
            },
        );
    }

    #[test]
    fn test_connected_capacity() {
        let mut host: RasHost<SharedLink> = RasHost::new(RasConfig::default());
        host.connected(CONN, SharedLink::default()).unwrap();

        assert_eq!(
            host.connected(CONN, SharedLink::default()),
            Err(Error::Busy)
        );
        assert_eq!(
            host.connected(ConnId(4), SharedLink::default()),
            Err(Error::NoBuffers)
        );
    }

    #[test]
    fn test_ready_status_flows_to_link() {
        let mut host = RasHost::new(RasConfig::default());
        let link = SharedLink::default();
        host.connected(CONN, link.clone()).unwrap();

        ingest_complete_procedure(&mut host, 7);
        host.run_until_idle(now());

        let state = link.state.lock().unwrap();
        assert_eq!(
            state.notifications,
            vec![(Characteristic::RangingDataReady, vec![0x07, 0x00])]
        );
    }

    #[test]
    fn test_full_transfer_over_work_queue() {
        init_tracing();
        let mut host = RasHost::new(RasConfig::default());
        let link = SharedLink::default();
        host.connected(CONN, link.clone()).unwrap();
        let scheduler = host.scheduler();

        ingest_complete_procedure(&mut host, 7);
        host.run_until_idle(now());

        host.control_point_write(CONN, &[0x00, 0x07, 0x00]).unwrap();

        // Pump, acknowledging each notification like the stack would.
        let mut delivered = 0;
        loop {
            host.run_until_idle(now());
            let pending = {
                let state = link.state.lock().unwrap();
                state.notifications.len() - delivered
            };
            if pending == 0 {
                break;
            }
            for _ in 0..pending {
                scheduler.notification_sent(CONN);
                delivered += 1;
            }
        }

        assert_eq!(host.session_state(CONN), Some(SessionState::AwaitingAck));

        let state = link.state.lock().unwrap();
        // Ready status + one segment (the 16-byte image fits a single MTU).
        let segments: Vec<_> = state
            .notifications
            .iter()
            .filter(|(chrc, _)| *chrc == Characteristic::OnDemandRangingData)
            .collect();
        assert_eq!(segments.len(), 1);
        let header = SegmentHeader::parse(&segments[0].1).unwrap();
        assert!(header.first_seg && header.last_seg);

        let responses: Vec<_> = state
            .indications
            .iter()
            .map(|(_, data)| Response::parse(data).unwrap())
            .collect();
        assert_eq!(
            responses,
            vec![
                Response::RspCode(ResponseCode::Success),
                Response::CompleteRangingData {
                    ranging_counter: rasd_ras::RangingCounter::new(7)
                },
            ]
        );
        drop(state);

        // ACK completes the cycle.
        host.control_point_write(CONN, &[0x01, 0x07, 0x00]).unwrap();
        host.run_until_idle(now());
        assert_eq!(host.session_state(CONN), Some(SessionState::Idle));
    }

    #[test]
    fn test_write_without_context_rejected() {
        let mut host: RasHost<SharedLink> = RasHost::new(RasConfig::default());
        assert_eq!(
            host.control_point_write(CONN, &[0x00, 0x07, 0x00]),
            Err(0xfc)
        );
    }

    #[test]
    fn test_timeout_via_deadline() {
        init_tracing();
        let mut host = RasHost::new(RasConfig::default());
        let link = SharedLink::default();
        host.connected(CONN, link.clone()).unwrap();
        let scheduler = host.scheduler();

        ingest_complete_procedure(&mut host, 7);
        host.run_until_idle(now());
        host.control_point_write(CONN, &[0x00, 0x07, 0x00]).unwrap();
        host.run_until_idle(now());
        scheduler.notification_sent(CONN);
        host.run_until_idle(now());
        assert_eq!(host.session_state(CONN), Some(SessionState::AwaitingAck));

        let deadline = host.next_deadline().unwrap();
        host.handle_timeouts(deadline);
        host.run_until_idle(deadline);

        assert_eq!(host.session_state(CONN), Some(SessionState::Idle));
        assert_eq!(host.next_deadline(), None);
    }

    #[test]
    fn test_disconnect_clears_state() {
        let mut host = RasHost::new(RasConfig::default());
        host.connected(CONN, SharedLink::default()).unwrap();
        ingest_complete_procedure(&mut host, 7);

        host.disconnected(CONN);
        host.run_until_idle(now());

        assert_eq!(host.session_state(CONN), None);
        // The context slot is reusable immediately.
        host.connected(CONN, SharedLink::default()).unwrap();
    }
}
