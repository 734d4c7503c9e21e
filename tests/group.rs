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

use core::cell::RefCell;
use std::rc::Rc;

use matter_transport::error::ErrorCode;
use matter_transport::fabric::FabricAuthority;
use matter_transport::group_id::{FabricIndex, GroupId, NodeId};
use matter_transport::persist::MemPsm;
use matter_transport::transport::mgr::Event;
use matter_transport::transport::session::GroupPacket;
use matter_transport::{Matter, MatterConfig};

use common::{new_matter, test_rand, E2eRunner};

mod common;

const FABRIC_ID: u64 = 0xfab0_0002;
const CONTROLLER: NodeId = 0x0a0a_0001;
const DEVICE: NodeId = 0x0b0b_0002;
const GROUP: GroupId = GroupId(0x0101);
const EPOCH_KEY: [u8; 16] = [
    0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7, 0xa8, 0xa9, 0xaa, 0xab, 0xac, 0xad, 0xae,
    0xaf,
];

const PROTO: u16 = 0xfff1;
const OPCODE: u8 = 0x03;

fn join(matter: &Matter<'_>, authority: &FabricAuthority, node_id: NodeId) -> FabricIndex {
    matter
        .add_fabric(authority.new_node_fabric(test_rand, node_id).unwrap())
        .unwrap()
}

fn take_group_messages(events: &mut Vec<Event>) -> Vec<GroupPacket> {
    let mut packets = Vec::new();

    events.retain(|e| match e {
        Event::GroupMessage(packet) => {
            packets.push(packet.clone());
            false
        }
        _ => true,
    });

    packets
}

#[test]
fn test_group_message_delivered_once() {
    let (psm_a, psm_b) = (MemPsm::new(), MemPsm::new());
    let (matter_a, matter_b) = (
        new_matter(MatterConfig::new(), &psm_a),
        new_matter(MatterConfig::new(), &psm_b),
    );

    let authority = FabricAuthority::new(test_rand, FABRIC_ID).unwrap();
    let fab_a = join(&matter_a, &authority, CONTROLLER);
    let fab_b = join(&matter_b, &authority, DEVICE);
    matter_a.set_group_key(fab_a, GROUP, &EPOCH_KEY).unwrap();
    matter_b.set_group_key(fab_b, GROUP, &EPOCH_KEY).unwrap();

    let mut runner = E2eRunner::new(&matter_a, &matter_b).unwrap();

    let captured = Rc::new(RefCell::new(Vec::new()));
    let sink = captured.clone();
    runner.set_filter(move |a_to_b, data| {
        if a_to_b {
            sink.borrow_mut().push(data.to_vec());
        }
        true
    });

    for payload in [&b"on"[..], &b"off"[..]] {
        runner
            .a
            .send_group(fab_a, GROUP, E2eRunner::b_addr(), PROTO, OPCODE, payload)
            .unwrap();
    }
    runner.pump();

    let packets = take_group_messages(&mut runner.b_events);
    assert_eq!(packets.len(), 2);
    for (packet, payload) in packets.iter().zip([&b"on"[..], &b"off"[..]]) {
        assert_eq!(packet.fab_idx, fab_b);
        assert_eq!(packet.group_id, GROUP);
        assert_eq!(packet.src_nodeid, CONTROLLER);
        assert_eq!(packet.packet.proto.proto_opcode, OPCODE);
        assert_eq!(packet.packet.payload, payload);
    }

    // Group messages are never acknowledged
    assert_eq!(captured.borrow().len(), 2);
    assert!(!runner.b.has_outgoing());

    // Replays are dropped
    let replay = captured.borrow()[1].clone();
    runner
        .b
        .handle_message_received(E2eRunner::a_addr(), &replay)
        .unwrap();
    runner.pump();
    assert!(runner.b_events.is_empty());

    // One outgoing group session, reused
    assert_eq!(runner.a.session_mgr().len(), 1);
}

#[test]
fn test_group_message_without_key_dropped() {
    let (psm_a, psm_b) = (MemPsm::new(), MemPsm::new());
    let (matter_a, matter_b) = (
        new_matter(MatterConfig::new(), &psm_a),
        new_matter(MatterConfig::new(), &psm_b),
    );

    let authority = FabricAuthority::new(test_rand, FABRIC_ID).unwrap();
    let fab_a = join(&matter_a, &authority, CONTROLLER);
    let fab_b = join(&matter_b, &authority, DEVICE);
    matter_a.set_group_key(fab_a, GROUP, &EPOCH_KEY).unwrap();

    // B knows the group, under another key
    let mut other_key = EPOCH_KEY;
    other_key[0] ^= 0xff;
    matter_b.set_group_key(fab_b, GROUP, &other_key).unwrap();

    let mut runner = E2eRunner::new(&matter_a, &matter_b).unwrap();

    runner
        .a
        .send_group(fab_a, GROUP, E2eRunner::b_addr(), PROTO, OPCODE, b"hi")
        .unwrap();
    assert_eq!(runner.pump(), 1);

    assert!(runner.b_events.is_empty());
    assert!(runner.b.session_mgr().is_empty());
}

#[test]
fn test_send_group_needs_key() {
    let (psm, peer_psm) = (MemPsm::new(), MemPsm::new());
    let matter = new_matter(MatterConfig::new(), &psm);

    let authority = FabricAuthority::new(test_rand, FABRIC_ID).unwrap();
    let fab_idx = join(&matter, &authority, CONTROLLER);

    let peer = new_matter(MatterConfig::new(), &peer_psm);
    let mut runner = E2eRunner::new(&matter, &peer).unwrap();

    assert_eq!(
        runner
            .a
            .send_group(fab_idx, GROUP, E2eRunner::b_addr(), PROTO, OPCODE, b"")
            .map_err(|e| e.code()),
        Err(ErrorCode::NotFound)
    );
    assert_eq!(
        runner
            .a
            .send_group(fab_idx + 1, GROUP, E2eRunner::b_addr(), PROTO, OPCODE, b"")
            .map_err(|e| e.code()),
        Err(ErrorCode::NoFabricId)
    );
    assert!(!runner.a.has_outgoing());
    assert!(runner.a.session_mgr().is_empty());
}
