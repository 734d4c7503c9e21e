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

use core::fmt;

use crate::error::*;
use crate::secure_channel::common::{OpCode, PROTO_ID_SECURE_CHANNEL};
use crate::utils::parsebuf::ParseBuf;
use crate::utils::writebuf::WriteBuf;

use super::network::{Address, MAX_RX_PACKET_SIZE, MAX_TX_PACKET_SIZE};
use super::plain_hdr::{self, PlainHdr};
use super::proto_hdr::{self, ProtoHdr};

pub const MAX_RX_BUF_SIZE: usize = MAX_RX_PACKET_SIZE;
pub const MAX_TX_BUF_SIZE: usize = MAX_TX_PACKET_SIZE;

/// A received message after decryption and header decoding.
#[derive(Debug, Clone)]
pub struct Packet {
    pub peer: Address,
    pub plain: PlainHdr,
    pub proto: ProtoHdr,
    pub payload: Vec<u8>,
    /// Set when the message counter was already seen. Duplicates are still
    /// processed by MRP but never delivered.
    pub duplicate: bool,
}

impl Packet {
    pub fn is_sc(&self) -> bool {
        self.proto.proto_id == PROTO_ID_SECURE_CHANNEL
    }

    pub fn sc_opcode(&self) -> Option<OpCode> {
        if self.is_sc() {
            OpCode::from_u8(self.proto.proto_opcode)
        } else {
            None
        }
    }

    pub fn is_standalone_ack(&self) -> bool {
        self.sc_opcode() == Some(OpCode::MRPStandAloneAck)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] [{}]", self.peer, self.plain, self.proto)?;
        if self.duplicate {
            write!(f, " (dup)")?;
        }

        Ok(())
    }
}

/// Decodes only the plain header of a datagram.
pub fn peek_plain_hdr(data: &[u8]) -> Result<PlainHdr, Error> {
    let mut buf = [0; plain_hdr::max_plain_hdr_len()];
    let len = data.len().min(buf.len());
    buf[..len].copy_from_slice(&data[..len]);

    let mut pb = ParseBuf::new(&mut buf[..len]);
    let mut plain = PlainHdr::new();
    plain.decode(&mut pb)?;

    Ok(plain)
}

/// Decodes a datagram in place. When `key` is given, the part following the
/// plain header is decrypted with it, using `nonce_nodeid` as the sender id
/// in the nonce.
pub fn decode_datagram(
    data: &mut [u8],
    key: Option<(&[u8], u64)>,
) -> Result<(PlainHdr, ProtoHdr, Vec<u8>), Error> {
    let mut pb = ParseBuf::new(data);

    let mut plain = PlainHdr::new();
    plain.decode(&mut pb)?;

    if let Some((key, nonce_nodeid)) = key {
        proto_hdr::decrypt_in_place(plain.ctr, plain.sec_flags(), nonce_nodeid, &mut pb, key)?;
    }

    let mut proto = ProtoHdr::new();
    proto.decode(&mut pb)?;

    Ok((plain, proto, pb.as_slice().to_vec()))
}

/// Builds a datagram: plain header, then protocol header and payload,
/// encrypted with `key` when one is given.
pub fn encode_datagram(
    plain: &PlainHdr,
    proto: &ProtoHdr,
    payload: &[u8],
    key: Option<(&[u8], u64)>,
) -> Result<Vec<u8>, Error> {
    let mut buf = [0; MAX_TX_BUF_SIZE];
    let mut wb = WriteBuf::new(&mut buf);
    wb.reserve(plain_hdr::max_plain_hdr_len())?;

    proto.encode(&mut wb)?;
    wb.append(payload)?;

    let mut hdr_buf = [0; plain_hdr::max_plain_hdr_len()];
    let mut hdr_wb = WriteBuf::new(&mut hdr_buf);
    plain.encode(&mut hdr_wb)?;
    let hdr = hdr_wb.as_slice();

    if let Some((key, nonce_nodeid)) = key {
        proto_hdr::encrypt_in_place(plain.ctr, plain.sec_flags(), nonce_nodeid, hdr, &mut wb, key)?;
    }

    wb.prepend(hdr)?;

    Ok(wb.as_slice().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plaintext_datagram() {
        let mut plain = PlainHdr::new();
        plain.ctr = 77;
        plain.set_src_nodeid(Some(0xfffffffd_00000001));

        let mut proto = ProtoHdr::new();
        proto.exch_id = 3;
        proto.proto_id = PROTO_ID_SECURE_CHANNEL;
        proto.proto_opcode = OpCode::PBKDFParamRequest as u8;
        proto.set_initiator(true);

        let mut data = encode_datagram(&plain, &proto, &[1, 2, 3], None).unwrap();
        assert_eq!(peek_plain_hdr(&data).unwrap().ctr, 77);

        let (dplain, dproto, payload) = decode_datagram(&mut data, None).unwrap();
        assert_eq!(dplain.get_src_nodeid(), Some(0xfffffffd_00000001));
        assert_eq!(dproto, proto);
        assert_eq!(payload, [1, 2, 3]);
    }

    #[test]
    fn test_encrypted_datagram() {
        let key = [0x42; 16];

        let mut plain = PlainHdr::new();
        plain.sess_id = 9;
        plain.ctr = 1000;

        let mut proto = ProtoHdr::new();
        proto.exch_id = 4;
        proto.proto_id = 1;
        proto.proto_opcode = 2;
        proto.set_reliable();

        let mut data = encode_datagram(&plain, &proto, b"hello", Some((&key, 5))).unwrap();
        assert!(!data.windows(5).any(|w| w == b"hello"));

        let (_, dproto, payload) = decode_datagram(&mut data.clone(), Some((&key, 5))).unwrap();
        assert_eq!(dproto, proto);
        assert_eq!(payload, b"hello");

        // Wrong sender node id in the nonce
        assert!(decode_datagram(&mut data, Some((&key, 6))).is_err());
    }

    #[test]
    fn test_oversized_payload() {
        let payload = [0; MAX_TX_BUF_SIZE];
        assert_eq!(
            encode_datagram(&PlainHdr::new(), &ProtoHdr::new(), &payload, None)
                .map_err(|e| e.code()),
            Err(ErrorCode::NoSpace)
        );
    }
}
