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

//! Matter TLV, restricted to what the secure channel messages need:
//! anonymous and context-specific tags, integers, booleans, octet and UTF-8
//! strings, null and containers.

mod parser;
mod writer;

pub use parser::*;
pub use writer::*;

pub(crate) const TAG_SHIFT_BITS: u8 = 5;
pub(crate) const TAG_MASK: u8 = 0xe0;
pub(crate) const TYPE_MASK: u8 = 0x1f;

pub(crate) const TAG_CONTROL_ANONYMOUS: u8 = 0;
pub(crate) const TAG_CONTROL_CONTEXT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagType {
    Anonymous,
    Context(u8),
}

/// Element type codes, the low five bits of the control octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive)]
pub(crate) enum ElementTypeCode {
    S8 = 0,
    S16 = 1,
    S32 = 2,
    S64 = 3,
    U8 = 4,
    U16 = 5,
    U32 = 6,
    U64 = 7,
    False = 8,
    True = 9,
    Utf8l = 12,
    Utf16l = 13,
    Str8l = 16,
    Str16l = 17,
    Null = 20,
    Struct = 21,
    Array = 22,
    List = 23,
    EndCnt = 24,
}
