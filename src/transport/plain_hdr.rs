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

use bitflags::bitflags;
use log::trace;

use crate::error::*;
use crate::group_id::GroupId;
use crate::utils::parsebuf::ParseBuf;
use crate::utils::writebuf::WriteBuf;

bitflags! {
    #[repr(transparent)]
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MsgFlags: u8 {
        const DSIZ_UNICAST_NODEID = 0x01;
        const DSIZ_GROUPCAST_NODEID = 0x02;
        const SRC_ADDR_PRESENT = 0x04;
    }
}

impl fmt::Display for MsgFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = false;
        for (flag, str) in [
            (Self::SRC_ADDR_PRESENT, "S"),
            (Self::DSIZ_UNICAST_NODEID, "U"),
            (Self::DSIZ_GROUPCAST_NODEID, "G"),
        ] {
            if self.contains(flag) {
                if sep {
                    write!(f, "|")?;
                }

                write!(f, "{}", str)?;
                sep = true;
            }
        }

        Ok(())
    }
}

/// The session type carried in the low bits of the security flags.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    #[default]
    Unicast,
    Group,
}

const SEC_FLAGS_SESSION_TYPE_MASK: u8 = 0x03;
const SEC_FLAGS_PRIVACY: u8 = 0x80;
const SEC_FLAGS_CONTROL: u8 = 0x40;
const SEC_FLAGS_EXTENSIONS: u8 = 0x20;

/// The unencrypted header in front of every message.
#[derive(Debug, Default, Clone)]
pub struct PlainHdr {
    flags: MsgFlags,
    pub sess_id: u16,
    sec_flags: u8,
    pub ctr: u32,
    src_nodeid: u64,
    dst_nodeid: u64,
}

impl PlainHdr {
    #[inline(always)]
    pub const fn new() -> Self {
        Self {
            flags: MsgFlags::empty(),
            sess_id: 0,
            sec_flags: 0,
            ctr: 0,
            src_nodeid: 0,
            dst_nodeid: 0,
        }
    }

    pub fn session_type(&self) -> SessionType {
        if self.sec_flags & SEC_FLAGS_SESSION_TYPE_MASK == 1 {
            SessionType::Group
        } else {
            SessionType::Unicast
        }
    }

    pub fn set_session_type(&mut self, session_type: SessionType) {
        self.sec_flags &= !SEC_FLAGS_SESSION_TYPE_MASK;
        if session_type == SessionType::Group {
            self.sec_flags |= 1;
        }
    }

    /// The raw security flags byte, which is also the first byte of the
    /// AEAD nonce.
    pub fn sec_flags(&self) -> u8 {
        self.sec_flags
    }

    pub fn get_src_nodeid(&self) -> Option<u64> {
        if self.flags.contains(MsgFlags::SRC_ADDR_PRESENT) {
            Some(self.src_nodeid)
        } else {
            None
        }
    }

    pub fn set_src_nodeid(&mut self, id: Option<u64>) {
        if let Some(id) = id {
            self.flags |= MsgFlags::SRC_ADDR_PRESENT;
            self.src_nodeid = id;
        } else {
            self.flags.remove(MsgFlags::SRC_ADDR_PRESENT);
            self.src_nodeid = 0;
        }
    }

    pub fn get_dst_unicast_nodeid(&self) -> Option<u64> {
        if self.flags.contains(MsgFlags::DSIZ_UNICAST_NODEID) {
            Some(self.dst_nodeid)
        } else {
            None
        }
    }

    pub fn set_dst_unicast_nodeid(&mut self, id: Option<u64>) {
        self.flags
            .remove(MsgFlags::DSIZ_UNICAST_NODEID | MsgFlags::DSIZ_GROUPCAST_NODEID);
        self.dst_nodeid = 0;

        if let Some(id) = id {
            self.flags |= MsgFlags::DSIZ_UNICAST_NODEID;
            self.dst_nodeid = id;
        }
    }

    pub fn get_dst_group(&self) -> Option<GroupId> {
        if self.flags.contains(MsgFlags::DSIZ_GROUPCAST_NODEID) {
            Some(GroupId(self.dst_nodeid as u16))
        } else {
            None
        }
    }

    pub fn set_dst_group(&mut self, id: Option<GroupId>) {
        self.flags
            .remove(MsgFlags::DSIZ_UNICAST_NODEID | MsgFlags::DSIZ_GROUPCAST_NODEID);
        self.dst_nodeid = 0;

        if let Some(id) = id {
            self.flags |= MsgFlags::DSIZ_GROUPCAST_NODEID;
            self.dst_nodeid = id.0 as u64;
        }
    }

    pub fn decode(&mut self, msg: &mut ParseBuf) -> Result<(), Error> {
        self.flags = MsgFlags::from_bits(msg.le_u8()?).ok_or(ErrorCode::Invalid)?;
        self.sess_id = msg.le_u16()?;
        self.sec_flags = msg.le_u8()?;
        self.ctr = msg.le_u32()?;

        if self.sec_flags & (SEC_FLAGS_PRIVACY | SEC_FLAGS_CONTROL | SEC_FLAGS_EXTENSIONS) != 0 {
            // Privacy obfuscation, control messages and header extensions are
            // not supported
            Err(ErrorCode::Invalid)?;
        }

        if self.sec_flags & SEC_FLAGS_SESSION_TYPE_MASK > 1 {
            Err(ErrorCode::Invalid)?;
        }

        if self.flags.contains(MsgFlags::SRC_ADDR_PRESENT) {
            self.src_nodeid = msg.le_u64()?;
        }

        let unicast = self.flags.contains(MsgFlags::DSIZ_UNICAST_NODEID);
        let group = self.flags.contains(MsgFlags::DSIZ_GROUPCAST_NODEID);

        match (unicast, group) {
            (true, true) => Err(ErrorCode::Invalid)?,
            (true, false) => self.dst_nodeid = msg.le_u64()?,
            (false, true) => self.dst_nodeid = msg.le_u16()? as u64,
            (false, false) => self.dst_nodeid = 0,
        }

        if self.session_type() == SessionType::Group && !group {
            Err(ErrorCode::Invalid)?;
        }

        trace!("[decode] {}", self);
        Ok(())
    }

    pub fn encode(&self, resp_buf: &mut WriteBuf) -> Result<(), Error> {
        trace!("[encode] {}", self);
        resp_buf.le_u8(self.flags.bits())?;
        resp_buf.le_u16(self.sess_id)?;
        resp_buf.le_u8(self.sec_flags)?;
        resp_buf.le_u32(self.ctr)?;

        if let Some(src_nodeid) = self.get_src_nodeid() {
            resp_buf.le_u64(src_nodeid)?;
        }

        if let Some(dst_nodeid) = self.get_dst_unicast_nodeid() {
            resp_buf.le_u64(dst_nodeid)?;
        } else if let Some(group) = self.get_dst_group() {
            resp_buf.le_u16(group.0)?;
        }

        Ok(())
    }

    pub fn is_encrypted(&self) -> bool {
        self.sess_id != 0 || self.session_type() == SessionType::Group
    }
}

impl fmt::Display for PlainHdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.flags.is_empty() {
            write!(f, "{},", self.flags)?;
        }

        write!(f, "SID:{:x},CTR:{:x}", self.sess_id, self.ctr)?;

        if self.session_type() == SessionType::Group {
            write!(f, ",GROUP")?;
        }

        if let Some(src_nodeid) = self.get_src_nodeid() {
            write!(f, ",SRC:{:x}", src_nodeid)?;
        }

        if let Some(dst_nodeid) = self.get_dst_unicast_nodeid() {
            write!(f, ",DST:{:x}", dst_nodeid)?;
        }

        if let Some(group) = self.get_dst_group() {
            write!(f, ",GRP:{:x}", group.0)?;
        }

        Ok(())
    }
}

pub const fn max_plain_hdr_len() -> usize {
    // flags
    1 +
    // session ID
        2 +
    // security flags
        1 +
    // message ctr
        4 +
    // [optional] source node ID
        8 +
    // [optional] destination node ID
        8
}
