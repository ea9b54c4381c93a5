//! End-to-end loopback tests coupling an RRSP server core to an RREQ client
//! core through in-memory GATT fakes.
//!
//! The harness plays the roles the host stack would: it pumps the server's
//! deferred work queue, delivers outbound notifications/indications to the
//! client, feeds sent-callbacks back as work items, and routes the client's
//! control-point writes into the server.

use rasd_ras::gatt::{Characteristic, GattLink, GattPeer, SubscriptionKind};
use rasd_ras::ingest::{
    subevent_data_available, CsContext, ProcedureDoneStatus, SubeventResult, SubeventResultHeader,
};
use rasd_ras::pool::{PoolEvent, RdBufferPool};
use rasd_ras::rreq::{RreqCore, RreqEvent};
use rasd_ras::rrsp::{RrspCore, RrspWork, SessionState};
use rasd_ras::types::{ConnId, Instant, RangingCounter};
use rasd_ras::wire::{RangingHeader, SubeventHeader};
use std::collections::VecDeque;

const CONN: ConnId = ConnId(7);

#[derive(Default)]
struct TestLink {
    mtu: u16,
    outbox: Vec<(Characteristic, Vec<u8>, bool)>,
}

impl GattLink for TestLink {
    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn is_subscribed(&self, _chrc: Characteristic, kind: SubscriptionKind) -> bool {
        // The loopback client subscribes to everything; segments go out as
        // notifications, RAS-CP responses as indications.
        match kind {
            SubscriptionKind::Notify | SubscriptionKind::Indicate => true,
        }
    }

    fn notify(&mut self, chrc: Characteristic, data: &[u8]) -> rasd_ras::Result<()> {
        self.outbox.push((chrc, data.to_vec(), true));
        Ok(())
    }

    fn indicate(&mut self, chrc: Characteristic, data: &[u8]) -> rasd_ras::Result<()> {
        self.outbox.push((chrc, data.to_vec(), false));
        Ok(())
    }
}

#[derive(Default)]
struct TestPeer {
    writes: VecDeque<(Characteristic, Vec<u8>)>,
}

impl GattPeer for TestPeer {
    fn write_without_response(&mut self, chrc: Characteristic, data: &[u8]) -> rasd_ras::Result<()> {
        self.writes.push_back((chrc, data.to_vec()));
        Ok(())
    }

    fn subscribe(&mut self, _chrc: Characteristic, _kind: SubscriptionKind) -> rasd_ras::Result<()> {
        Ok(())
    }
}

struct Harness {
    pool: RdBufferPool,
    server: RrspCore,
    client: RreqCore,
    link: TestLink,
    peer: TestPeer,
    work: VecDeque<RrspWork>,
    now: Instant,
    segments_seen: usize,
}

impl Harness {
    fn new(buffers_per_conn: usize, mtu: u16) -> Self {
        Self {
            pool: RdBufferPool::new(1, buffers_per_conn),
            server: RrspCore::new(CONN, RrspCore::DEFAULT_RASCP_TIMEOUT),
            client: RreqCore::new(CONN),
            link: TestLink {
                mtu,
                ..Default::default()
            },
            peer: TestPeer::default(),
            work: VecDeque::new(),
            now: Instant::from_nanos(0),
            segments_seen: 0,
        }
    }

    /// Feed one complete single-subevent procedure whose flat image is
    /// exactly `image_len` bytes.
    fn ingest_procedure(&mut self, counter: u16, image_len: usize) {
        let mut step_region = image_len - RangingHeader::LEN - SubeventHeader::LEN;
        let mut blob = Vec::new();
        let mut steps = 0u8;
        while step_region > 0 {
            let data_len = (step_region - 1).min(35);
            blob.push(2); // mode
            blob.push(9); // channel, dropped on the wire
            blob.push(data_len as u8);
            for i in 0..data_len {
                blob.push((counter as u8).wrapping_add(i as u8).wrapping_add(steps));
            }
            step_region -= 1 + data_len;
            steps += 1;
        }

        subevent_data_available(
            &mut self.pool,
            &CsContext::default(),
            CONN,
            &SubeventResult {
                header: SubeventResultHeader {
                    procedure_counter: counter,
                    config_id: 1,
                    num_steps_reported: steps,
                    procedure_done_status: ProcedureDoneStatus::Complete,
                    ..Default::default()
                },
                step_data: Some(&blob),
            },
        );

        self.drain_pool_events();
        self.pump();
    }

    fn drain_pool_events(&mut self) {
        while let Some(event) = self.pool.poll_event() {
            let work = match event {
                PoolEvent::ProcedureReady {
                    ranging_counter, ..
                } => self.server.ranging_data_ready(ranging_counter),
                PoolEvent::ProcedureOverwritten {
                    ranging_counter, ..
                } => self.server.ranging_data_overwritten(ranging_counter),
            };
            self.work.push_back(work);
        }
    }

    /// Run server work, wire deliveries and client writes until quiescent.
    fn pump(&mut self) {
        loop {
            let mut progressed = false;

            while let Some(work) = self.work.pop_front() {
                progressed = true;
                let follow = self
                    .server
                    .process(work, self.now, &mut self.pool, &mut self.link);
                self.work.extend(follow);
                self.drain_pool_events();
                self.deliver_outbox();
            }

            self.deliver_outbox();

            while let Some((chrc, data)) = self.peer.writes.pop_front() {
                progressed = true;
                assert_eq!(chrc, Characteristic::ControlPoint);
                match self.server.on_control_point_write(&self.link, &data) {
                    Ok(work) => self.work.push_back(work),
                    Err(err) => panic!("control point write failed: {err:?}"),
                }
            }

            if !progressed {
                break;
            }
        }
    }

    fn deliver_outbox(&mut self) {
        for (chrc, data, was_notify) in std::mem::take(&mut self.link.outbox) {
            match chrc {
                Characteristic::OnDemandRangingData => {
                    self.segments_seen += 1;
                    self.client.on_ondemand_rd(&data);
                    self.work.push_back(if was_notify {
                        RrspWork::SegmentSent
                    } else {
                        RrspWork::IndicateConfirmed
                    });
                }
                Characteristic::ControlPoint => {
                    self.client.on_control_point_indication(&mut self.peer, &data);
                }
                Characteristic::RangingDataReady => self.client.on_rd_ready(&data),
                Characteristic::RangingDataOverwritten => self.client.on_rd_overwritten(&data),
                other => panic!("unexpected characteristic {other:?}"),
            }
        }
    }

    /// Fetch a procedure end-to-end and return the client-side result.
    fn get(&mut self, counter: u16, capacity: usize) -> rasd_ras::Result<Vec<u8>> {
        self.client
            .get_ranging_data(
                &mut self.peer,
                Vec::with_capacity(capacity),
                RangingCounter::new(counter),
            )
            .unwrap();
        self.pump();

        match self.client.poll_event() {
            Some(RreqEvent::GetComplete {
                ranging_counter,
                result,
            }) => {
                assert_eq!(ranging_counter, RangingCounter::new(counter));
                result
            }
            other => panic!("expected GetComplete, got {other:?}"),
        }
    }

    /// Pull the flat image the server holds, for comparison.
    fn server_image(&mut self, counter: u16) -> Vec<u8> {
        let claim = self.pool.claim(CONN, RangingCounter::new(counter)).unwrap();
        let mut image = vec![0u8; self.pool.image_len(&claim)];
        assert_eq!(self.pool.pull(&claim, &mut image), image.len());
        self.pool.release(claim).unwrap();
        image
    }
}

#[test]
fn test_happy_path_1200_bytes_mtu_27() {
    let mut harness = Harness::new(2, 27);
    harness.ingest_procedure(7, 1200);

    // The server announced the stored procedure.
    assert_eq!(
        harness.client.poll_event(),
        Some(RreqEvent::RangingDataReady {
            ranging_counter: RangingCounter::new(7)
        })
    );

    let expected = harness.server_image(7);
    assert_eq!(expected.len(), 1200);

    let image = harness.get(7, 1200).unwrap();

    // MTU 27 leaves 22 payload bytes per segment.
    assert_eq!(harness.segments_seen, 1200usize.div_ceil(22));
    assert_eq!(image, expected);
    assert_eq!(harness.server.state(), SessionState::Idle);

    // The acked procedure is no longer retrievable.
    assert!(!harness
        .pool
        .ready_check(CONN, RangingCounter::new(7)));
}

#[test]
fn test_segment_counter_rollover_past_64() {
    let mut harness = Harness::new(2, 27);
    harness.ingest_procedure(3, 1800);
    harness.client.poll_event();

    let expected = harness.server_image(3);
    let image = harness.get(3, 1800).unwrap();

    assert!(harness.segments_seen > 64);
    assert_eq!(image, expected);
}

#[test]
fn test_mtu_change_mid_session() {
    let mut harness = Harness::new(2, 27);
    harness.ingest_procedure(4, 400);
    harness.client.poll_event();
    let expected = harness.server_image(4);

    // Start the transfer but hold back all sent-callbacks so only the GET
    // response and the first segment go out at MTU 27.
    harness
        .client
        .get_ranging_data(
            &mut harness.peer,
            Vec::with_capacity(400),
            RangingCounter::new(4),
        )
        .unwrap();
    let (chrc, data) = harness.peer.writes.pop_front().unwrap();
    assert_eq!(chrc, Characteristic::ControlPoint);
    let first = harness
        .server
        .on_control_point_write(&harness.link, &data)
        .unwrap();
    let follow = harness
        .server
        .process(first, harness.now, &mut harness.pool, &mut harness.link);
    for work in follow {
        harness
            .server
            .process(work, harness.now, &mut harness.pool, &mut harness.link);
    }
    assert_eq!(harness.server.state(), SessionState::Streaming);

    // MTU renegotiated mid-session; every following segment uses it.
    harness.link.mtu = 120;
    harness.pump();

    match harness.client.poll_event() {
        Some(RreqEvent::GetComplete { result, .. }) => {
            assert_eq!(result.unwrap(), expected);
        }
        other => panic!("expected GetComplete, got {other:?}"),
    }
    // One 22-byte segment, then (400 - 22) bytes at 115 per segment.
    assert_eq!(harness.segments_seen, 1 + (400 - 22usize).div_ceil(115));
}

#[test]
fn test_pool_overwrite_notifies_client() {
    let mut harness = Harness::new(2, 27);
    harness.ingest_procedure(1, 100);
    harness.ingest_procedure(2, 100);
    harness.client.poll_event();
    harness.client.poll_event();

    harness.ingest_procedure(3, 100);

    let mut events = Vec::new();
    while let Some(event) = harness.client.poll_event() {
        events.push(event);
    }
    assert!(events.contains(&RreqEvent::RangingDataOverwritten {
        ranging_counter: RangingCounter::new(1)
    }));
    assert!(events.contains(&RreqEvent::RangingDataReady {
        ranging_counter: RangingCounter::new(3)
    }));
}

#[test]
fn test_acked_overwrite_is_silent() {
    let mut harness = Harness::new(2, 27);
    harness.ingest_procedure(1, 100);
    harness.ingest_procedure(2, 100);
    harness.client.poll_event();
    harness.client.poll_event();

    // Full transfer cycle acks counter 1.
    harness.get(1, 100).unwrap();

    // Counter 3 evicts the acked counter 1: no overwritten notification.
    harness.ingest_procedure(3, 100);
    let mut events = Vec::new();
    while let Some(event) = harness.client.poll_event() {
        events.push(event);
    }
    assert_eq!(
        events,
        vec![RreqEvent::RangingDataReady {
            ranging_counter: RangingCounter::new(3)
        }]
    );

    // Counter 4 evicts the unacked counter 2, which is announced.
    harness.ingest_procedure(4, 100);
    assert_eq!(
        harness.client.poll_event(),
        Some(RreqEvent::RangingDataOverwritten {
            ranging_counter: RangingCounter::new(2)
        })
    );
}

#[test]
fn test_get_unknown_counter_fails_cleanly() {
    let mut harness = Harness::new(2, 27);
    harness.ingest_procedure(1, 100);
    harness.client.poll_event();

    let result = harness.get(9, 100);
    assert!(result.is_err());

    // The stored procedure is still intact afterwards.
    let image = harness.get(1, 100).unwrap();
    assert_eq!(image.len(), 100);
}

#[test]
fn test_overwritten_during_receive_completes_once_with_error() {
    let mut harness = Harness::new(2, 27);
    harness.ingest_procedure(10, 400);
    harness.client.poll_event();

    // Start the GET and stream exactly three segments.
    harness
        .client
        .get_ranging_data(
            &mut harness.peer,
            Vec::with_capacity(400),
            RangingCounter::new(10),
        )
        .unwrap();
    let (_, data) = harness.peer.writes.pop_front().unwrap();
    let first = harness
        .server
        .on_control_point_write(&harness.link, &data)
        .unwrap();
    let mut queue = VecDeque::from([first]);
    while harness.segments_seen < 3 {
        let work = queue.pop_front().unwrap();
        queue.extend(
            harness
                .server
                .process(work, harness.now, &mut harness.pool, &mut harness.link),
        );
        harness.deliver_outbox();
        queue.append(&mut harness.work);
    }
    assert!(harness.client.poll_event().is_none());

    // The peer announces the in-flight counter as overwritten.
    harness.client.on_rd_overwritten(&10u16.to_le_bytes());

    match harness.client.poll_event() {
        Some(RreqEvent::GetComplete {
            ranging_counter,
            result,
        }) => {
            assert_eq!(ranging_counter, RangingCounter::new(10));
            assert!(result.is_err());
        }
        other => panic!("expected GetComplete, got {other:?}"),
    }

    // Remaining segments drain without a second completion.
    harness.work.append(&mut queue);
    harness.pump();
    assert!(harness.client.poll_event().is_none());
}
