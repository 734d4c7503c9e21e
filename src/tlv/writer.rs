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

use crate::{error::*, utils::writebuf::WriteBuf};

use super::{ElementTypeCode, TagType, TAG_CONTROL_ANONYMOUS, TAG_CONTROL_CONTEXT, TAG_SHIFT_BITS};

pub struct TLVWriter<'a, 'b> {
    buf: &'a mut WriteBuf<'b>,
}

impl<'a, 'b> TLVWriter<'a, 'b> {
    pub fn new(buf: &'a mut WriteBuf<'b>) -> Self {
        TLVWriter { buf }
    }

    fn put_control_tag(&mut self, tag_type: TagType, val_type: ElementTypeCode) -> Result<(), Error> {
        match tag_type {
            TagType::Anonymous => self
                .buf
                .le_u8((TAG_CONTROL_ANONYMOUS << TAG_SHIFT_BITS) | val_type as u8),
            TagType::Context(tag) => {
                self.buf
                    .le_u8((TAG_CONTROL_CONTEXT << TAG_SHIFT_BITS) | val_type as u8)?;
                self.buf.le_u8(tag)
            }
        }
    }

    pub fn u8(&mut self, tag_type: TagType, data: u8) -> Result<(), Error> {
        self.put_control_tag(tag_type, ElementTypeCode::U8)?;
        self.buf.le_u8(data)
    }

    pub fn u16(&mut self, tag_type: TagType, data: u16) -> Result<(), Error> {
        if data <= 0xff {
            self.u8(tag_type, data as u8)
        } else {
            self.put_control_tag(tag_type, ElementTypeCode::U16)?;
            self.buf.le_u16(data)
        }
    }

    pub fn u32(&mut self, tag_type: TagType, data: u32) -> Result<(), Error> {
        if data <= 0xffff {
            self.u16(tag_type, data as u16)
        } else {
            self.put_control_tag(tag_type, ElementTypeCode::U32)?;
            self.buf.le_u32(data)
        }
    }

    pub fn u64(&mut self, tag_type: TagType, data: u64) -> Result<(), Error> {
        if data <= 0xffff_ffff {
            self.u32(tag_type, data as u32)
        } else {
            self.put_control_tag(tag_type, ElementTypeCode::U64)?;
            self.buf.le_u64(data)
        }
    }

    pub fn bool(&mut self, tag_type: TagType, val: bool) -> Result<(), Error> {
        if val {
            self.put_control_tag(tag_type, ElementTypeCode::True)
        } else {
            self.put_control_tag(tag_type, ElementTypeCode::False)
        }
    }

    pub fn null(&mut self, tag_type: TagType) -> Result<(), Error> {
        self.put_control_tag(tag_type, ElementTypeCode::Null)
    }

    /// Octet string with a one-byte length.
    pub fn str8(&mut self, tag_type: TagType, data: &[u8]) -> Result<(), Error> {
        let len = u8::try_from(data.len()).map_err(|_| ErrorCode::InvalidArgument)?;
        self.put_control_tag(tag_type, ElementTypeCode::Str8l)?;
        self.buf.le_u8(len)?;
        self.buf.copy_from_slice(data)
    }

    /// Octet string with a two-byte length.
    pub fn str16(&mut self, tag_type: TagType, data: &[u8]) -> Result<(), Error> {
        let len = u16::try_from(data.len()).map_err(|_| ErrorCode::InvalidArgument)?;
        self.put_control_tag(tag_type, ElementTypeCode::Str16l)?;
        self.buf.le_u16(len)?;
        self.buf.copy_from_slice(data)
    }

    /// Octet string using the narrowest length prefix that fits.
    pub fn str(&mut self, tag_type: TagType, data: &[u8]) -> Result<(), Error> {
        if data.len() <= u8::MAX as usize {
            self.str8(tag_type, data)
        } else {
            self.str16(tag_type, data)
        }
    }

    pub fn utf8(&mut self, tag_type: TagType, data: &str) -> Result<(), Error> {
        let len = u8::try_from(data.len()).map_err(|_| ErrorCode::InvalidArgument)?;
        self.put_control_tag(tag_type, ElementTypeCode::Utf8l)?;
        self.buf.le_u8(len)?;
        self.buf.copy_from_slice(data.as_bytes())
    }

    pub fn start_struct(&mut self, tag_type: TagType) -> Result<(), Error> {
        self.put_control_tag(tag_type, ElementTypeCode::Struct)
    }

    pub fn start_array(&mut self, tag_type: TagType) -> Result<(), Error> {
        self.put_control_tag(tag_type, ElementTypeCode::Array)
    }

    pub fn start_list(&mut self, tag_type: TagType) -> Result<(), Error> {
        self.put_control_tag(tag_type, ElementTypeCode::List)
    }

    pub fn end_container(&mut self) -> Result<(), Error> {
        self.put_control_tag(TagType::Anonymous, ElementTypeCode::EndCnt)
    }

    pub fn get_tail(&self) -> usize {
        self.buf.get_tail()
    }

    pub fn rewind_to(&mut self, anchor: usize) {
        self.buf.rewind_tail_to(anchor);
    }
}

#[cfg(test)]
mod tests {
    use super::{TLVWriter, TagType};
    use crate::utils::writebuf::WriteBuf;

    #[test]
    fn test_write_success() {
        let mut buf = [0; 20];
        let mut writebuf = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut writebuf);

        tw.start_struct(TagType::Anonymous).unwrap();
        tw.u8(TagType::Anonymous, 12).unwrap();
        tw.u8(TagType::Context(1), 13).unwrap();
        tw.u16(TagType::Anonymous, 0x1212).unwrap();
        tw.bool(TagType::Context(2), true).unwrap();
        tw.str8(TagType::Context(3), &[10, 11]).unwrap();
        tw.end_container().unwrap();

        assert_eq!(
            writebuf.as_slice(),
            [21, 4, 12, 36, 1, 13, 5, 0x12, 0x12, 41, 2, 48, 3, 2, 10, 11, 24]
        );
    }

    #[test]
    fn test_write_overflow() {
        let mut buf = [0; 4];
        let mut writebuf = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut writebuf);

        tw.u8(TagType::Context(1), 1).unwrap();
        assert!(tw.u16(TagType::Context(2), 0x1234).is_err());
    }

    #[test]
    fn test_rewind() {
        let mut buf = [0; 8];
        let mut writebuf = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut writebuf);

        tw.u8(TagType::Context(1), 1).unwrap();
        let anchor = tw.get_tail();
        tw.u8(TagType::Context(2), 2).unwrap();
        tw.rewind_to(anchor);

        assert_eq!(writebuf.as_slice(), [0x24, 1, 1]);
    }
}
