//! RAS Control Point command handling for the RRSP core.

use super::{RrspCore, RrspWork, SessionState};
use crate::gatt::{Characteristic, GattLink};
use crate::pool::RdBufferPool;
use crate::types::RangingCounter;
use crate::wire::{Command, Response, ResponseCode};
use tracing::{debug, warn};

impl RrspCore {
    pub(super) fn handle_command<L: GattLink>(
        &mut self,
        pool: &mut RdBufferPool,
        link: &mut L,
    ) -> Vec<RrspWork> {
        self.cmd_pending = false;

        if self.state == SessionState::Streaming {
            self.send_rsp_code(link, ResponseCode::ServerBusy);
            return Vec::new();
        }

        let cmd = match Command::parse(&self.cmd_buf[..self.cmd_len]) {
            Ok(cmd) => cmd,
            Err(code) => {
                debug!(conn = %self.conn, ?code, "RAS-CP command rejected");
                self.send_rsp_code(link, code);
                return Vec::new();
            }
        };

        match cmd {
            Command::GetRangingData { ranging_counter } => {
                self.handle_get(ranging_counter, pool, link)
            }
            Command::AckRangingData { ranging_counter } => {
                self.handle_ack(ranging_counter, pool, link)
            }
        }
    }

    fn handle_get<L: GattLink>(
        &mut self,
        ranging_counter: RangingCounter,
        pool: &mut RdBufferPool,
        link: &mut L,
    ) -> Vec<RrspWork> {
        debug!(conn = %self.conn, %ranging_counter, "GET ranging data");

        if self.active.is_some() {
            self.send_rsp_code(link, ResponseCode::ServerBusy);
            return Vec::new();
        }

        if !pool.ready_check(self.conn, ranging_counter) {
            self.send_rsp_code(link, ResponseCode::NoRecordsFound);
            return Vec::new();
        }

        self.send_rsp_code(link, ResponseCode::Success);

        match pool.claim(self.conn, ranging_counter) {
            Ok(claim) => {
                self.active = Some(claim);
                self.segment_counter = 0;
                self.state = SessionState::Streaming;
                vec![RrspWork::StreamWake]
            }
            Err(err) => {
                warn!(conn = %self.conn, %ranging_counter, %err, "claim failed after ready check");
                Vec::new()
            }
        }
    }

    fn handle_ack<L: GattLink>(
        &mut self,
        ranging_counter: RangingCounter,
        pool: &mut RdBufferPool,
        link: &mut L,
    ) -> Vec<RrspWork> {
        debug!(conn = %self.conn, %ranging_counter, "ACK ranging data");

        let claim = match self.active.take() {
            Some(claim) if claim.ranging_counter() == ranging_counter => claim,
            other => {
                self.active = other;
                self.send_rsp_code(link, ResponseCode::NoRecordsFound);
                return Vec::new();
            }
        };
        if let Err(err) = pool.mark_acked(&claim) {
            warn!(conn = %self.conn, %ranging_counter, %err, "ack on stale claim");
        }
        let _ = pool.release(claim);

        self.state = SessionState::Idle;
        self.rascp_deadline = None;
        self.send_rsp_code(link, ResponseCode::Success);
        Vec::new()
    }

    pub(super) fn send_complete_rd<L: GattLink>(
        &self,
        link: &mut L,
        ranging_counter: RangingCounter,
    ) {
        let mut rsp = Vec::with_capacity(3);
        Response::CompleteRangingData { ranging_counter }.encode(&mut rsp);

        if let Err(err) = link.indicate(Characteristic::ControlPoint, &rsp) {
            warn!(conn = %self.conn, %ranging_counter, %err, "complete RD indication failed");
        }
    }

    pub(super) fn send_rsp_code<L: GattLink>(&self, link: &mut L, code: ResponseCode) {
        let mut rsp = Vec::with_capacity(2);
        Response::RspCode(code).encode(&mut rsp);

        if let Err(err) = link.indicate(Characteristic::ControlPoint, &rsp) {
            warn!(conn = %self.conn, ?code, %err, "RAS-CP response indication failed");
        }
    }
}
