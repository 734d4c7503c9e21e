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

//! Receive-side message counter windows used for replay detection.

use crate::group_id::{FabricIndex, NodeId};

const MSG_RX_STATE_BITMAP_LEN: u32 = 16;

/// The outcome of checking a received message counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrCheck {
    /// First time this counter is seen; the window was advanced.
    New,
    /// The counter was seen before, or equals the current maximum. The message
    /// is still acknowledged but never delivered.
    Duplicate,
    /// An encrypted counter behind the window. The message is dropped.
    Rejected,
}

impl CtrCheck {
    pub fn is_new(&self) -> bool {
        matches!(self, Self::New)
    }
}

/// A sliding window of [`MSG_RX_STATE_BITMAP_LEN`] counters below the
/// largest counter received so far.
#[derive(Debug, Clone)]
pub struct RxCtrState {
    max_ctr: u32,
    ctr_bitmap: u16,
}

impl RxCtrState {
    /// A window trusting `max_ctr` as the first received counter; everything
    /// behind it counts as already seen.
    pub fn new(max_ctr: u32) -> Self {
        Self {
            max_ctr,
            ctr_bitmap: 0xffff,
        }
    }

    /// A window synchronized to `max_ctr` by the counter synchronization
    /// protocol. Counters inside the window are still unseen, so messages
    /// the peer sent before the synchronization response are accepted.
    pub fn new_synced(max_ctr: u32) -> Self {
        Self {
            max_ctr,
            ctr_bitmap: 0,
        }
    }

    pub fn max_ctr(&self) -> u32 {
        self.max_ctr
    }

    fn contains(&self, bit_number: u32) -> bool {
        (self.ctr_bitmap & (1 << bit_number)) != 0
    }

    fn insert(&mut self, bit_number: u32) {
        self.ctr_bitmap |= 1 << bit_number;
    }

    /// Checks `msg_ctr` against the window and records it when new.
    pub fn post_recv(&mut self, msg_ctr: u32, is_encrypted: bool) -> CtrCheck {
        // Counters wrap; a forward distance below 2^31 is "ahead"
        let idiff = msg_ctr.wrapping_sub(self.max_ctr) as i32;
        let udiff = idiff.unsigned_abs();

        if idiff == 0 {
            CtrCheck::Duplicate
        } else if (-(MSG_RX_STATE_BITMAP_LEN as i32)..0).contains(&idiff) {
            let index = udiff - 1;
            if self.contains(index) {
                CtrCheck::Duplicate
            } else {
                self.insert(index);
                CtrCheck::New
            }
        } else if idiff > 0 {
            self.max_ctr = msg_ctr;
            if udiff < MSG_RX_STATE_BITMAP_LEN {
                // The previous max_ctr moves into the window
                self.ctr_bitmap <<= udiff;
                self.insert(udiff - 1);
            } else {
                self.ctr_bitmap = 0xffff;
            }
            CtrCheck::New
        } else if !is_encrypted {
            // The peer has probably rebooted and picked a new random counter
            self.max_ctr = msg_ctr;
            self.ctr_bitmap = 0xffff;
            CtrCheck::New
        } else {
            CtrCheck::Rejected
        }
    }
}

/// Max number of unique group message senders tracked for replay protection.
pub const MAX_GROUP_CTR_ENTRIES: usize = 16;

#[derive(Debug)]
struct GroupCtrEntry {
    fab_idx: FabricIndex,
    src_nodeid: NodeId,
    rx_ctr: RxCtrState,
    last_used: u32,
}

/// Replay state for group messages, keyed by (fabric, source node).
///
/// Group sessions are not negotiated, so the first counter seen from a sender
/// is trusted. When full, the least recently used sender is forgotten.
#[derive(Debug)]
pub struct GroupCtrStore {
    entries: heapless::Vec<GroupCtrEntry, MAX_GROUP_CTR_ENTRIES>,
    clock: u32,
}

impl GroupCtrStore {
    pub const fn new() -> Self {
        Self {
            entries: heapless::Vec::new(),
            clock: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn post_recv(&mut self, fab_idx: FabricIndex, src_nodeid: NodeId, msg_ctr: u32) -> CtrCheck {
        self.clock = self.clock.wrapping_add(1);

        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.fab_idx == fab_idx && e.src_nodeid == src_nodeid)
        {
            entry.last_used = self.clock;
            return entry.rx_ctr.post_recv(msg_ctr, true);
        }

        let new_entry = GroupCtrEntry {
            fab_idx,
            src_nodeid,
            rx_ctr: RxCtrState::new(msg_ctr),
            last_used: self.clock,
        };

        if let Err(new_entry) = self.entries.push(new_entry) {
            let lru = self
                .entries
                .iter_mut()
                .min_by_key(|e| e.last_used);

            if let Some(lru) = lru {
                *lru = new_entry;
            }
        }

        CtrCheck::New
    }
}

impl Default for GroupCtrStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{CtrCheck, RxCtrState};

    const ENCRYPTED: bool = true;
    const NOT_ENCRYPTED: bool = false;

    fn assert_new(c: CtrCheck) {
        assert_eq!(c, CtrCheck::New);
    }

    fn assert_dup(c: CtrCheck) {
        assert_eq!(c, CtrCheck::Duplicate);
    }

    #[test]
    fn new_msg_ctr() {
        let mut s = RxCtrState::new(101);

        assert_new(s.post_recv(103, ENCRYPTED));
        assert_new(s.post_recv(104, ENCRYPTED));
        assert_new(s.post_recv(106, ENCRYPTED));
        assert_eq!(s.max_ctr, 106);
        assert_eq!(s.ctr_bitmap, 0b1111_1111_1111_0110);

        assert_new(s.post_recv(118, NOT_ENCRYPTED));
        assert_eq!(s.ctr_bitmap, 0b0110_1000_0000_0000);
        assert_new(s.post_recv(119, NOT_ENCRYPTED));
        assert_new(s.post_recv(121, NOT_ENCRYPTED));
        assert_eq!(s.ctr_bitmap, 0b0100_0000_0000_0110);
    }

    #[test]
    fn dup_max_ctr() {
        let mut s = RxCtrState::new(101);

        assert_new(s.post_recv(103, ENCRYPTED));
        assert_dup(s.post_recv(103, ENCRYPTED));
        assert_dup(s.post_recv(103, NOT_ENCRYPTED));

        assert_eq!(s.max_ctr, 103);
        assert_eq!(s.ctr_bitmap, 0b1111_1111_1111_1110);
    }

    #[test]
    fn dup_in_rx_bitmap() {
        let mut ctr = 101;
        let mut s = RxCtrState::new(101);
        for _ in 1..8 {
            ctr += 2;
            assert_new(s.post_recv(ctr, ENCRYPTED));
        }
        assert_new(s.post_recv(116, ENCRYPTED));
        assert_new(s.post_recv(117, ENCRYPTED));
        assert_eq!(s.max_ctr, 117);
        assert_eq!(s.ctr_bitmap, 0b1010_1010_1010_1011);

        // left edge of the window
        assert_dup(s.post_recv(101, ENCRYPTED));
        assert_dup(s.post_recv(101, NOT_ENCRYPTED));

        // right edge of the window
        assert_dup(s.post_recv(116, ENCRYPTED));
        assert_dup(s.post_recv(116, NOT_ENCRYPTED));

        assert_new(s.post_recv(102, ENCRYPTED));
        assert_dup(s.post_recv(102, ENCRYPTED));
        assert_eq!(s.ctr_bitmap, 0b1110_1010_1010_1011);
    }

    #[test]
    fn valid_corners_in_rx_bitmap() {
        let mut ctr = 102;
        let mut s = RxCtrState::new(101);
        for _ in 1..9 {
            ctr += 2;
            assert_new(s.post_recv(ctr, ENCRYPTED));
        }
        assert_eq!(s.max_ctr, 118);
        assert_eq!(s.ctr_bitmap, 0b0010_1010_1010_1010);

        assert_new(s.post_recv(102, ENCRYPTED));
        assert_eq!(s.ctr_bitmap, 0b1010_1010_1010_1010);

        assert_new(s.post_recv(117, ENCRYPTED));
        assert_eq!(s.ctr_bitmap, 0b1010_1010_1010_1011);
    }

    #[test]
    fn encrypted_behind_window_rejected() {
        let mut s = RxCtrState::new(65534);

        assert_new(s.post_recv(65535, ENCRYPTED));
        assert_new(s.post_recv(65536, ENCRYPTED));
        assert_eq!(s.post_recv(0, ENCRYPTED), CtrCheck::Rejected);
        assert_eq!(s.post_recv(65536 - 17, ENCRYPTED), CtrCheck::Rejected);
        assert_eq!(s.max_ctr(), 65536);
    }

    #[test]
    fn encrypted_counter_wraps() {
        let mut s = RxCtrState::new(u32::MAX - 1);

        assert_new(s.post_recv(u32::MAX, ENCRYPTED));
        assert_new(s.post_recv(0, ENCRYPTED));
        assert_new(s.post_recv(1, ENCRYPTED));
        assert_dup(s.post_recv(u32::MAX, ENCRYPTED));
    }

    #[test]
    fn unencrypted_wraparound() {
        let mut s = RxCtrState::new(65534);

        assert_new(s.post_recv(65536, NOT_ENCRYPTED));
        assert_new(s.post_recv(0, NOT_ENCRYPTED));
    }

    #[test]
    fn unencrypted_device_reboot() {
        let mut s = RxCtrState::new(20010);

        assert_new(s.post_recv(20011, NOT_ENCRYPTED));
        assert_new(s.post_recv(0, NOT_ENCRYPTED));
        assert_eq!(s.max_ctr(), 0);
    }

    #[test]
    fn synced_window_accepts_earlier_counters() {
        let mut s = RxCtrState::new_synced(500);

        assert_dup(s.post_recv(500, ENCRYPTED));
        assert_new(s.post_recv(498, ENCRYPTED));
        assert_new(s.post_recv(499, ENCRYPTED));
        assert_dup(s.post_recv(498, ENCRYPTED));
        assert_eq!(s.post_recv(483, ENCRYPTED), CtrCheck::Rejected);
    }

    mod group_ctr {
        use super::super::{CtrCheck, GroupCtrStore, MAX_GROUP_CTR_ENTRIES};

        #[test]
        fn trust_first_accepts_new_sender() {
            let mut store = GroupCtrStore::new();
            assert_eq!(store.post_recv(1, 0x1111, 100), CtrCheck::New);
        }

        #[test]
        fn rejects_duplicate_counter() {
            let mut store = GroupCtrStore::new();
            assert!(store.post_recv(1, 0x1111, 100).is_new());
            assert_eq!(store.post_recv(1, 0x1111, 100), CtrCheck::Duplicate);
        }

        #[test]
        fn accepts_incrementing_counters() {
            let mut store = GroupCtrStore::new();
            assert!(store.post_recv(1, 0x1111, 100).is_new());
            assert!(store.post_recv(1, 0x1111, 101).is_new());
            assert!(store.post_recv(1, 0x1111, 102).is_new());
        }

        #[test]
        fn separate_tracking_per_sender() {
            let mut store = GroupCtrStore::new();
            assert!(store.post_recv(1, 0x1111, 100).is_new());
            assert!(store.post_recv(1, 0x2222, 100).is_new());
            assert!(store.post_recv(2, 0x1111, 100).is_new());
            assert_eq!(store.len(), 3);
        }

        #[test]
        fn evicts_lru_when_full() {
            let mut store = GroupCtrStore::new();
            for i in 0..MAX_GROUP_CTR_ENTRIES {
                assert!(store.post_recv(1, i as u64, 100).is_new());
            }

            // Touch sender 0 so sender 1 becomes the LRU entry
            assert!(store.post_recv(1, 0, 101).is_new());

            assert!(store.post_recv(1, 0xFFFF, 200).is_new());
            assert_eq!(store.len(), MAX_GROUP_CTR_ENTRIES);

            // Sender 0 is still tracked, sender 1 was forgotten
            assert_eq!(store.post_recv(1, 0, 101), CtrCheck::Duplicate);
            assert!(store.post_recv(1, 1, 100).is_new());
        }
    }
}
