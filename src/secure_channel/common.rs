/*
 *
 *    Copyright (c) 2020-2022 Project CHIP Authors
 *
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

use num_derive::FromPrimitive;

use crate::error::*;
use crate::utils::writebuf::WriteBuf;

use super::status_report::{GeneralCode, StatusReport};

pub const PROTO_ID_SECURE_CHANNEL: u16 = 0x00;

#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    MsgCounterSyncReq = 0x00,
    MsgCounterSyncResp = 0x01,
    MRPStandAloneAck = 0x10,
    PBKDFParamRequest = 0x20,
    PBKDFParamResponse = 0x21,
    PASEPake1 = 0x22,
    PASEPake2 = 0x23,
    PASEPake3 = 0x24,
    CASESigma1 = 0x30,
    CASESigma2 = 0x31,
    CASESigma3 = 0x32,
    CASESigma2Resume = 0x33,
    StatusReport = 0x40,
}

impl OpCode {
    pub fn from_u8(opcode: u8) -> Option<Self> {
        num::FromPrimitive::from_u8(opcode)
    }

    pub fn is_session_establishment(&self) -> bool {
        matches!(
            self,
            Self::PBKDFParamRequest
                | Self::PBKDFParamResponse
                | Self::PASEPake1
                | Self::PASEPake2
                | Self::PASEPake3
                | Self::CASESigma1
                | Self::CASESigma2
                | Self::CASESigma3
                | Self::CASESigma2Resume
        )
    }
}

#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SCStatusCodes {
    SessionEstablishmentSuccess = 0,
    NoSharedTrustRoots = 1,
    InvalidParameter = 2,
    CloseSession = 3,
    Busy = 4,
    SessionNotFound = 5,
}

impl SCStatusCodes {
    pub fn general_code(&self) -> GeneralCode {
        match self {
            Self::SessionEstablishmentSuccess | Self::CloseSession => GeneralCode::Success,
            Self::Busy
            | Self::InvalidParameter
            | Self::NoSharedTrustRoots
            | Self::SessionNotFound => GeneralCode::Failure,
        }
    }
}

/// Progress of a PASE or CASE handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstablishmentState {
    Init,
    SentRequest,
    ReceivedResponse,
    KeysDerived,
    Established,
    Failed,
}

/// Minimum wait advertised in a Busy status report, in milliseconds.
pub const BUSY_WAIT_MS: u16 = 500;

pub fn create_sc_status_report(
    wb: &mut WriteBuf,
    status_code: SCStatusCodes,
    proto_data: Option<&[u8]>,
) -> Result<(), Error> {
    StatusReport {
        general_code: status_code.general_code(),
        proto_id: PROTO_ID_SECURE_CHANNEL as u32,
        proto_code: status_code as u16,
        proto_data: proto_data.unwrap_or(&[]),
    }
    .encode(wb)
}

/// Encodes a secure channel status report into a freshly allocated payload.
pub fn sc_status_report_payload(
    status_code: SCStatusCodes,
    proto_data: Option<&[u8]>,
) -> Result<Vec<u8>, Error> {
    let mut buf = [0; 16];
    let mut wb = WriteBuf::new(&mut buf);
    create_sc_status_report(&mut wb, status_code, proto_data)?;

    Ok(wb.as_slice().to_vec())
}

pub fn busy_status_report_payload() -> Result<Vec<u8>, Error> {
    sc_status_report_payload(SCStatusCodes::Busy, Some(&BUSY_WAIT_MS.to_le_bytes()))
}

/// Decodes a secure channel status report, mapping anything but success to
/// the matching error.
pub fn check_sc_status(payload: &[u8]) -> Result<SCStatusCodes, Error> {
    let report = StatusReport::decode(payload)?;
    if report.proto_id != PROTO_ID_SECURE_CHANNEL as u32 {
        Err(ErrorCode::InvalidProto)?;
    }

    let status: SCStatusCodes =
        num::FromPrimitive::from_u16(report.proto_code).ok_or(ErrorCode::InvalidData)?;

    match status {
        SCStatusCodes::SessionEstablishmentSuccess | SCStatusCodes::CloseSession => Ok(status),
        SCStatusCodes::NoSharedTrustRoots => Err(ErrorCode::NoSharedTrustRoots.into()),
        SCStatusCodes::Busy => Err(ErrorCode::Busy.into()),
        SCStatusCodes::SessionNotFound => Err(ErrorCode::SessionNotFound.into()),
        SCStatusCodes::InvalidParameter => Err(ErrorCode::InvalidArgument.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_report_layout() {
        let payload = busy_status_report_payload().unwrap();
        // Failure, SC protocol, Busy, 500 ms
        assert_eq!(payload, [1, 0, 0, 0, 0, 0, 4, 0, 0xf4, 0x01]);
    }

    #[test]
    fn test_check_status() {
        let ok = sc_status_report_payload(SCStatusCodes::SessionEstablishmentSuccess, None).unwrap();
        assert_eq!(
            check_sc_status(&ok).unwrap(),
            SCStatusCodes::SessionEstablishmentSuccess
        );

        let busy = busy_status_report_payload().unwrap();
        assert_eq!(
            check_sc_status(&busy).map_err(|e| e.code()),
            Err(ErrorCode::Busy)
        );

        let roots = sc_status_report_payload(SCStatusCodes::NoSharedTrustRoots, None).unwrap();
        assert_eq!(
            check_sc_status(&roots).map_err(|e| e.code()),
            Err(ErrorCode::NoSharedTrustRoots)
        );
    }

    #[test]
    fn test_opcode_classes() {
        assert!(OpCode::CASESigma2Resume.is_session_establishment());
        assert!(!OpCode::StatusReport.is_session_establishment());
        assert_eq!(OpCode::from_u8(0x10), Some(OpCode::MRPStandAloneAck));
        assert_eq!(OpCode::from_u8(0x11), None);
    }
}
