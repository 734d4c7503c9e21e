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

use crate::secure_channel::common::{OpCode, PROTO_ID_SECURE_CHANNEL};

/// What kind of traffic an exchange carries. Decides which messages the
/// exchange accepts and whether they must arrive encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeDispatch {
    /// Application protocols over a secure session.
    Application,
    /// A throwaway exchange that only acknowledges an unmatched message.
    Ephemeral,
    /// PASE or CASE handshake traffic over an unauthenticated session.
    SessionEstablishment,
}

impl ExchangeDispatch {
    pub fn message_permitted(&self, proto_id: u16, opcode: u8) -> bool {
        if proto_id != PROTO_ID_SECURE_CHANNEL {
            return matches!(self, Self::Application);
        }

        let Some(opcode) = OpCode::from_u8(opcode) else {
            return false;
        };

        match self {
            Self::Application => matches!(
                opcode,
                OpCode::MRPStandAloneAck
                    | OpCode::StatusReport
                    | OpCode::MsgCounterSyncReq
                    | OpCode::MsgCounterSyncResp
            ),
            Self::Ephemeral => opcode == OpCode::MRPStandAloneAck,
            Self::SessionEstablishment => {
                opcode.is_session_establishment()
                    || matches!(opcode, OpCode::StatusReport | OpCode::MRPStandAloneAck)
            }
        }
    }

    /// Whether messages on the exchange must arrive over a secure session.
    ///
    /// # Panics
    ///
    /// Ephemeral exchanges never receive, so asking them is a programming
    /// error.
    pub fn is_encryption_required(&self) -> bool {
        match self {
            Self::Application => true,
            Self::SessionEstablishment => false,
            Self::Ephemeral => panic!("Encryption requirement queried on an ephemeral exchange"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SC: u16 = PROTO_ID_SECURE_CHANNEL;
    const IM: u16 = 0x0001;

    #[test]
    fn test_application() {
        let d = ExchangeDispatch::Application;
        assert!(d.message_permitted(IM, 0x02));
        assert!(d.message_permitted(SC, OpCode::StatusReport as u8));
        assert!(d.message_permitted(SC, OpCode::MsgCounterSyncReq as u8));
        assert!(d.message_permitted(SC, OpCode::MsgCounterSyncResp as u8));
        assert!(d.message_permitted(SC, OpCode::MRPStandAloneAck as u8));
        assert!(!d.message_permitted(SC, OpCode::PBKDFParamRequest as u8));
        assert!(!d.message_permitted(SC, OpCode::CASESigma1 as u8));
        assert!(!d.message_permitted(SC, 0x7f));
        assert!(d.is_encryption_required());
    }

    #[test]
    fn test_session_establishment() {
        let d = ExchangeDispatch::SessionEstablishment;
        assert!(d.message_permitted(SC, OpCode::PBKDFParamRequest as u8));
        assert!(d.message_permitted(SC, OpCode::PASEPake3 as u8));
        assert!(d.message_permitted(SC, OpCode::CASESigma2Resume as u8));
        assert!(d.message_permitted(SC, OpCode::StatusReport as u8));
        assert!(!d.message_permitted(SC, OpCode::MsgCounterSyncReq as u8));
        assert!(!d.message_permitted(IM, 0x02));
        assert!(!d.is_encryption_required());
    }

    #[test]
    fn test_ephemeral() {
        let d = ExchangeDispatch::Ephemeral;
        assert!(d.message_permitted(SC, OpCode::MRPStandAloneAck as u8));
        assert!(!d.message_permitted(SC, OpCode::StatusReport as u8));
        assert!(!d.message_permitted(IM, 0x02));
    }

    #[test]
    #[should_panic]
    fn test_ephemeral_encryption_query_panics() {
        ExchangeDispatch::Ephemeral.is_encryption_required();
    }
}
