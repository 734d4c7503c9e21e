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

use byteorder::{ByteOrder, LittleEndian};
use log::error;

use crate::error::*;

use super::{
    ElementTypeCode, TagType, TAG_CONTROL_ANONYMOUS, TAG_CONTROL_CONTEXT, TAG_MASK,
    TAG_SHIFT_BITS, TYPE_MASK,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType<'a> {
    S8(i8),
    S16(i16),
    S32(i32),
    S64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    False,
    True,
    Utf8(&'a [u8]),
    Str(&'a [u8]),
    Null,
    /// Container contents, up to and excluding the matching end marker.
    Struct(&'a [u8]),
    Array(&'a [u8]),
    List(&'a [u8]),
    EndCnt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TLVElement<'a> {
    tag_type: TagType,
    element_type: ElementType<'a>,
}

fn take<'a>(buf: &'a [u8], off: &mut usize, len: usize) -> Result<&'a [u8], Error> {
    let end = off.checked_add(len).ok_or(ErrorCode::TruncatedPacket)?;
    let slice = buf.get(*off..end).ok_or(ErrorCode::TruncatedPacket)?;
    *off = end;
    Ok(slice)
}

/// Walks a container's elements until the end marker at the same depth and
/// returns the number of bytes consumed, end marker excluded.
fn container_len(buf: &[u8]) -> Result<usize, Error> {
    let mut off = 0;
    loop {
        let element = read_element(buf, &mut off)?;
        if element.element_type == ElementType::EndCnt {
            return Ok(off - 1);
        }
    }
}

fn read_element<'a>(buf: &'a [u8], off: &mut usize) -> Result<TLVElement<'a>, Error> {
    let control = take(buf, off, 1)?[0];

    let tag_type = match (control & TAG_MASK) >> TAG_SHIFT_BITS {
        TAG_CONTROL_ANONYMOUS => TagType::Anonymous,
        TAG_CONTROL_CONTEXT => TagType::Context(take(buf, off, 1)?[0]),
        other => {
            error!("Unsupported TLV tag control {}", other);
            Err(ErrorCode::TLVTypeMismatch)?
        }
    };

    let code: ElementTypeCode =
        num::FromPrimitive::from_u8(control & TYPE_MASK).ok_or(ErrorCode::TLVTypeMismatch)?;

    let element_type = match code {
        ElementTypeCode::S8 => ElementType::S8(take(buf, off, 1)?[0] as i8),
        ElementTypeCode::S16 => ElementType::S16(LittleEndian::read_i16(take(buf, off, 2)?)),
        ElementTypeCode::S32 => ElementType::S32(LittleEndian::read_i32(take(buf, off, 4)?)),
        ElementTypeCode::S64 => ElementType::S64(LittleEndian::read_i64(take(buf, off, 8)?)),
        ElementTypeCode::U8 => ElementType::U8(take(buf, off, 1)?[0]),
        ElementTypeCode::U16 => ElementType::U16(LittleEndian::read_u16(take(buf, off, 2)?)),
        ElementTypeCode::U32 => ElementType::U32(LittleEndian::read_u32(take(buf, off, 4)?)),
        ElementTypeCode::U64 => ElementType::U64(LittleEndian::read_u64(take(buf, off, 8)?)),
        ElementTypeCode::False => ElementType::False,
        ElementTypeCode::True => ElementType::True,
        ElementTypeCode::Utf8l => {
            let len = take(buf, off, 1)?[0] as usize;
            ElementType::Utf8(take(buf, off, len)?)
        }
        ElementTypeCode::Utf16l => {
            let len = LittleEndian::read_u16(take(buf, off, 2)?) as usize;
            ElementType::Utf8(take(buf, off, len)?)
        }
        ElementTypeCode::Str8l => {
            let len = take(buf, off, 1)?[0] as usize;
            ElementType::Str(take(buf, off, len)?)
        }
        ElementTypeCode::Str16l => {
            let len = LittleEndian::read_u16(take(buf, off, 2)?) as usize;
            ElementType::Str(take(buf, off, len)?)
        }
        ElementTypeCode::Null => ElementType::Null,
        ElementTypeCode::Struct | ElementTypeCode::Array | ElementTypeCode::List => {
            let rest = buf.get(*off..).ok_or(ErrorCode::TruncatedPacket)?;
            let len = container_len(rest)?;
            let contents = take(buf, off, len)?;
            // Skip the end marker
            take(buf, off, 1)?;

            match code {
                ElementTypeCode::Struct => ElementType::Struct(contents),
                ElementTypeCode::Array => ElementType::Array(contents),
                _ => ElementType::List(contents),
            }
        }
        ElementTypeCode::EndCnt => ElementType::EndCnt,
    };

    Ok(TLVElement {
        tag_type,
        element_type,
    })
}

impl<'a> TLVElement<'a> {
    pub fn get_tag(&self) -> TagType {
        self.tag_type
    }

    pub fn get_element_type(&self) -> ElementType<'a> {
        self.element_type
    }

    pub fn check_ctx_tag(&self, tag: u8) -> bool {
        self.tag_type == TagType::Context(tag)
    }

    pub fn u8(&self) -> Result<u8, Error> {
        u8::try_from(self.u64()?).map_err(|_| ErrorCode::TLVTypeMismatch.into())
    }

    pub fn u16(&self) -> Result<u16, Error> {
        u16::try_from(self.u64()?).map_err(|_| ErrorCode::TLVTypeMismatch.into())
    }

    pub fn u32(&self) -> Result<u32, Error> {
        u32::try_from(self.u64()?).map_err(|_| ErrorCode::TLVTypeMismatch.into())
    }

    /// Any unsigned integer element, widened.
    pub fn u64(&self) -> Result<u64, Error> {
        match self.element_type {
            ElementType::U8(v) => Ok(v as u64),
            ElementType::U16(v) => Ok(v as u64),
            ElementType::U32(v) => Ok(v as u64),
            ElementType::U64(v) => Ok(v),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn bool(&self) -> Result<bool, Error> {
        match self.element_type {
            ElementType::False => Ok(false),
            ElementType::True => Ok(true),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn slice(&self) -> Result<&'a [u8], Error> {
        match self.element_type {
            ElementType::Str(s) | ElementType::Utf8(s) => Ok(s),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn str(&self) -> Result<&'a str, Error> {
        match self.element_type {
            ElementType::Utf8(s) => Ok(core::str::from_utf8(s)?),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn null(&self) -> Result<(), Error> {
        match self.element_type {
            ElementType::Null => Ok(()),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn confirm_struct(&self) -> Result<TLVElement<'a>, Error> {
        match self.element_type {
            ElementType::Struct(_) => Ok(*self),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn confirm_array(&self) -> Result<TLVElement<'a>, Error> {
        match self.element_type {
            ElementType::Array(_) => Ok(*self),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    /// Iterates the direct children of a container element.
    pub fn enter(&self) -> Option<TLVContainerIterator<'a>> {
        match self.element_type {
            ElementType::Struct(c) | ElementType::Array(c) | ElementType::List(c) => {
                Some(TLVContainerIterator { buf: c, off: 0 })
            }
            _ => None,
        }
    }

    /// Finds the direct child with the given context tag.
    pub fn find_tag(&self, tag: u32) -> Result<TLVElement<'a>, Error> {
        let tag = u8::try_from(tag).map_err(|_| ErrorCode::TLVNotFound)?;
        let mut iter = self.enter().ok_or(ErrorCode::TLVTypeMismatch)?;

        loop {
            match iter.try_next()? {
                Some(element) if element.check_ctx_tag(tag) => return Ok(element),
                Some(_) => (),
                None => Err(ErrorCode::TLVNotFound)?,
            }
        }
    }
}

pub struct TLVContainerIterator<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> TLVContainerIterator<'a> {
    fn try_next(&mut self) -> Result<Option<TLVElement<'a>>, Error> {
        if self.off >= self.buf.len() {
            return Ok(None);
        }

        read_element(self.buf, &mut self.off).map(Some)
    }
}

impl<'a> Iterator for TLVContainerIterator<'a> {
    type Item = TLVElement<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.try_next().ok().flatten()
    }
}

pub fn get_root_node(b: &[u8]) -> Result<TLVElement, Error> {
    let mut off = 0;
    read_element(b, &mut off)
}

pub fn get_root_node_struct(b: &[u8]) -> Result<TLVElement, Error> {
    get_root_node(b)?.confirm_struct()
}

#[cfg(test)]
mod tests {
    use super::{get_root_node, get_root_node_struct, ElementType, TagType};
    use crate::error::ErrorCode;

    #[test]
    fn test_parse_struct_members() {
        // {1: u8 13, 2: true, 3: str [10, 11]}
        let b = [21, 36, 1, 13, 41, 2, 48, 3, 2, 10, 11, 24];
        let root = get_root_node_struct(&b).unwrap();

        assert_eq!(root.get_tag(), TagType::Anonymous);
        assert_eq!(root.find_tag(1).unwrap().u8().unwrap(), 13);
        assert!(root.find_tag(2).unwrap().bool().unwrap());
        assert_eq!(root.find_tag(3).unwrap().slice().unwrap(), [10, 11]);
        assert_eq!(root.enter().unwrap().count(), 3);
    }

    #[test]
    fn test_skips_nested_containers() {
        // {1: {1: 5}, 2: 7}
        let b = [21, 0x35, 1, 0x24, 1, 5, 24, 0x24, 2, 7, 24];
        let root = get_root_node_struct(&b).unwrap();

        assert_eq!(root.find_tag(2).unwrap().u8().unwrap(), 7);
        let inner = root.find_tag(1).unwrap().confirm_struct().unwrap();
        assert_eq!(inner.find_tag(1).unwrap().u8().unwrap(), 5);
    }

    #[test]
    fn test_truncated() {
        let b = [21, 48, 3, 5, 10, 11];
        assert_eq!(
            get_root_node(&b).map_err(|e| e.code()),
            Err(ErrorCode::TruncatedPacket)
        );
    }

    #[test]
    fn test_type_mismatch() {
        let b = [21, 41, 2, 24];
        let root = get_root_node_struct(&b).unwrap();
        assert_eq!(
            root.find_tag(2).unwrap().u8().map_err(|e| e.code()),
            Err(ErrorCode::TLVTypeMismatch)
        );
        assert_eq!(
            get_root_node(&[0x24, 1, 9]).unwrap().get_element_type(),
            ElementType::U8(9)
        );
    }
}
