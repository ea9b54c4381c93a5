//! RAS Control Point command and response frames.
//!
//! Commands are written without response to the RAS-CP characteristic;
//! responses come back as indications on the same characteristic. Command
//! validation lives here so the server core can map a raw write directly to
//! either a decoded command or the response code it must indicate.

use crate::error::{Error, Result};
use crate::types::RangingCounter;
use bytes::BufMut;

/// Maximum accepted RAS-CP write length: one opcode byte plus four parameter
/// bytes.
pub const CP_WRITE_MAX_LEN: usize = 5;

/// RAS Control Point command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CpOpcode {
    GetRangingData = 0x00,
    AckRangingData = 0x01,
    RetrieveLostSegments = 0x02,
    AbortOperation = 0x03,
    SetFilter = 0x04,
}

impl CpOpcode {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x00 => Some(Self::GetRangingData),
            0x01 => Some(Self::AckRangingData),
            0x02 => Some(Self::RetrieveLostSegments),
            0x03 => Some(Self::AbortOperation),
            0x04 => Some(Self::SetFilter),
            _ => None,
        }
    }
}

/// RAS Control Point response opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RspOpcode {
    CompleteRangingData = 0x00,
    CompleteLostSegments = 0x01,
    RspCode = 0x02,
}

/// RAS Control Point response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    Reserved = 0x00,
    Success = 0x01,
    OpcodeNotSupported = 0x02,
    InvalidParameter = 0x03,
    SuccessPersisted = 0x04,
    AbortUnsuccessful = 0x05,
    ProcedureNotCompleted = 0x06,
    ServerBusy = 0x07,
    NoRecordsFound = 0x08,
}

impl ResponseCode {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x00 => Some(Self::Reserved),
            0x01 => Some(Self::Success),
            0x02 => Some(Self::OpcodeNotSupported),
            0x03 => Some(Self::InvalidParameter),
            0x04 => Some(Self::SuccessPersisted),
            0x05 => Some(Self::AbortUnsuccessful),
            0x06 => Some(Self::ProcedureNotCompleted),
            0x07 => Some(Self::ServerBusy),
            0x08 => Some(Self::NoRecordsFound),
            _ => None,
        }
    }
}

/// Decoded RAS-CP command.
///
/// Only the two opcodes of the on-demand transfer cycle decode successfully.
/// Everything else yields the [`ResponseCode`] the server must indicate back,
/// so the parse result is the complete validation verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    GetRangingData { ranging_counter: RangingCounter },
    AckRangingData { ranging_counter: RangingCounter },
}

impl Command {
    pub fn parse(payload: &[u8]) -> core::result::Result<Self, ResponseCode> {
        let (&opcode, params) = payload
            .split_first()
            .ok_or(ResponseCode::InvalidParameter)?;

        match CpOpcode::from_u8(opcode) {
            Some(CpOpcode::GetRangingData) => {
                let counter = parse_counter_param(params)?;
                Ok(Command::GetRangingData {
                    ranging_counter: counter,
                })
            }
            Some(CpOpcode::AckRangingData) => {
                let counter = parse_counter_param(params)?;
                Ok(Command::AckRangingData {
                    ranging_counter: counter,
                })
            }
            // Lost-segment retrieval, abort and filtering are recognised but
            // not implemented.
            Some(_) | None => Err(ResponseCode::OpcodeNotSupported),
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            Command::GetRangingData { ranging_counter } => {
                buf.put_u8(CpOpcode::GetRangingData as u8);
                buf.put_u16_le(ranging_counter.value());
            }
            Command::AckRangingData { ranging_counter } => {
                buf.put_u8(CpOpcode::AckRangingData as u8);
                buf.put_u16_le(ranging_counter.value());
            }
        }
    }
}

fn parse_counter_param(params: &[u8]) -> core::result::Result<RangingCounter, ResponseCode> {
    if params.len() != 2 {
        return Err(ResponseCode::InvalidParameter);
    }

    Ok(RangingCounter::new(u16::from_le_bytes([
        params[0], params[1],
    ])))
}

/// Decoded RAS-CP response indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    CompleteRangingData { ranging_counter: RangingCounter },
    RspCode(ResponseCode),
}

impl Response {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            Response::CompleteRangingData { ranging_counter } => {
                buf.put_u8(RspOpcode::CompleteRangingData as u8);
                buf.put_u16_le(ranging_counter.value());
            }
            Response::RspCode(code) => {
                buf.put_u8(RspOpcode::RspCode as u8);
                buf.put_u8(*code as u8);
            }
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (&opcode, params) = payload.split_first().ok_or(Error::BufferTooShort)?;

        match opcode {
            x if x == RspOpcode::CompleteRangingData as u8 => {
                if params.len() != 2 {
                    return Err(Error::BufferTooShort);
                }
                Ok(Response::CompleteRangingData {
                    ranging_counter: RangingCounter::new(u16::from_le_bytes([
                        params[0], params[1],
                    ])),
                })
            }
            x if x == RspOpcode::RspCode as u8 => {
                if params.len() != 1 {
                    return Err(Error::BufferTooShort);
                }
                ResponseCode::from_u8(params[0])
                    .map(Response::RspCode)
                    .ok_or(Error::UnknownOpcode)
            }
            _ => Err(Error::UnknownOpcode),
        }
    }
}
