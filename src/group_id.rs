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

//! Node and group identifiers.

use core::fmt;

pub type NodeId = u64;
pub type FabricIndex = u8;

pub const UNSPECIFIED_NODE_ID: NodeId = 0;

/// Upper bound (inclusive) of the operational node id range.
pub const MAX_OPERATIONAL_NODE_ID: NodeId = 0xFFFF_FFEF_FFFF_FFFF;

/// Temporary local node ids are used by unauthenticated sessions before the
/// peer has an operational identity.
pub const MIN_TEMPORARY_LOCAL_NODE_ID: NodeId = 0xFFFF_FFFE_0000_0000;

const GROUP_NODE_ID_PREFIX: NodeId = 0xFFFF_FFFF_FFFF_0000;

pub fn is_operational_node_id(id: NodeId) -> bool {
    id != UNSPECIFIED_NODE_ID && id <= MAX_OPERATIONAL_NODE_ID
}

/// A 16-bit multicast group identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u16);

impl GroupId {
    pub const UNDEFINED: Self = Self(0x0000);

    pub const MIN_FABRIC_SCOPED: Self = Self(0x0001);
    pub const MAX_FABRIC_SCOPED: Self = Self(0x7FFF);

    pub const MIN_UNIVERSAL: Self = Self(0x8000);
    pub const MAX_UNIVERSAL: Self = Self(0xFFFF);

    pub const MIN_RESERVED_UNIVERSAL: Self = Self(0x8000);
    pub const MAX_RESERVED_UNIVERSAL: Self = Self(0xFEFF);

    pub const MIN_RESERVED_OPERATIONAL: Self = Self(0xFF00);
    pub const MAX_RESERVED_OPERATIONAL: Self = Self(0xFFFC);

    pub const ALL_PROXIES: Self = Self(0xFFFD);
    pub const ALL_NON_SLEEPY: Self = Self(0xFFFE);
    pub const ALL_NODES: Self = Self(0xFFFF);

    pub const fn is_valid(&self) -> bool {
        self.0 != Self::UNDEFINED.0
    }

    pub const fn is_fabric_scoped(&self) -> bool {
        self.0 >= Self::MIN_FABRIC_SCOPED.0 && self.0 <= Self::MAX_FABRIC_SCOPED.0
    }

    pub const fn is_universal(&self) -> bool {
        self.0 >= Self::MIN_UNIVERSAL.0
    }

    pub const fn is_reserved_universal(&self) -> bool {
        self.0 >= Self::MIN_RESERVED_UNIVERSAL.0 && self.0 <= Self::MAX_RESERVED_UNIVERSAL.0
    }

    pub const fn is_reserved_operational(&self) -> bool {
        self.0 >= Self::MIN_RESERVED_OPERATIONAL.0 && self.0 <= Self::MAX_RESERVED_OPERATIONAL.0
    }

    pub const fn is_all_nodes(&self) -> bool {
        self.0 == Self::ALL_NODES.0
    }

    pub const fn is_all_non_sleepy(&self) -> bool {
        self.0 == Self::ALL_NON_SLEEPY.0
    }

    pub const fn is_all_proxies(&self) -> bool {
        self.0 == Self::ALL_PROXIES.0
    }

    /// The node id a group is addressed by in message headers and ACLs.
    pub const fn as_node_id(&self) -> NodeId {
        GROUP_NODE_ID_PREFIX | self.0 as NodeId
    }

    pub const fn from_node_id(id: NodeId) -> Option<Self> {
        if id & GROUP_NODE_ID_PREFIX == GROUP_NODE_ID_PREFIX {
            Some(Self(id as u16))
        } else {
            None
        }
    }
}

impl From<u16> for GroupId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undefined() {
        assert!(!GroupId(0).is_valid());
        assert!(!GroupId(0).is_fabric_scoped());
        assert!(!GroupId(0).is_universal());
    }

    #[test]
    fn test_fabric_scoped_range() {
        assert!(GroupId(0x0001).is_fabric_scoped());
        assert!(GroupId(0x7FFF).is_fabric_scoped());
        assert!(!GroupId(0x0001).is_universal());
        assert!(!GroupId(0x8000).is_fabric_scoped());
    }

    #[test]
    fn test_universal_ranges() {
        let g = GroupId(0x8000);
        assert!(g.is_universal());
        assert!(g.is_reserved_universal());
        assert!(!g.is_fabric_scoped());

        assert!(GroupId(0xFEFF).is_reserved_universal());
        assert!(!GroupId(0xFF00).is_reserved_universal());
        assert!(GroupId(0xFF00).is_reserved_operational());
        assert!(GroupId(0xFFFC).is_reserved_operational());
        assert!(!GroupId(0xFFFD).is_reserved_operational());

        assert!(GroupId::ALL_PROXIES.is_all_proxies());
        assert!(GroupId::ALL_NON_SLEEPY.is_all_non_sleepy());
        assert!(GroupId::ALL_NODES.is_all_nodes());
        assert!(GroupId::ALL_NODES.is_universal());
    }

    #[test]
    fn test_group_node_id() {
        let g = GroupId(0x0101);
        assert_eq!(g.as_node_id(), 0xFFFF_FFFF_FFFF_0101);
        assert_eq!(GroupId::from_node_id(g.as_node_id()), Some(g));
        assert_eq!(GroupId::from_node_id(0x1234), None);
        assert!(!is_operational_node_id(g.as_node_id()));
        assert!(is_operational_node_id(0x1234));
    }
}
