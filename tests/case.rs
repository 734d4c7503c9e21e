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

use matter_transport::error::ErrorCode;
use matter_transport::fabric::FabricAuthority;
use matter_transport::group_id::{FabricIndex, NodeId};
use matter_transport::persist::MemPsm;
use matter_transport::transport::exchange::SendOptions;
use matter_transport::transport::mgr::Event;
use matter_transport::transport::session::{CaseDetails, SessionMode};
use matter_transport::{Matter, MatterConfig};

use common::{new_matter, test_rand, E2eRunner};

mod common;

const FABRIC_ID: u64 = 0xfab0_0001;
const CONTROLLER: NodeId = 0x1122_3344;
const DEVICE: NodeId = 0x5566_7788;

fn join(matter: &Matter<'_>, authority: &FabricAuthority, node_id: NodeId) -> FabricIndex {
    matter
        .add_fabric(authority.new_node_fabric(test_rand, node_id).unwrap())
        .unwrap()
}

#[test]
fn test_case_between_fabric_members() {
    let (psm_a, psm_b) = (MemPsm::new(), MemPsm::new());
    let (matter_a, matter_b) = (
        new_matter(MatterConfig::new(), &psm_a),
        new_matter(MatterConfig::new(), &psm_b),
    );

    let authority = FabricAuthority::new(test_rand, FABRIC_ID).unwrap();
    let fab_a = join(&matter_a, &authority, CONTROLLER);
    let fab_b = join(&matter_b, &authority, DEVICE);

    let mut runner = E2eRunner::new(&matter_a, &matter_b).unwrap();

    runner
        .a
        .establish_case(E2eRunner::b_addr(), fab_a, DEVICE)
        .unwrap();
    runner.pump();

    let [Event::SessionEstablished {
        session: sess_a,
        peer_node_id: Some(DEVICE),
        mode,
    }] = runner.a_events.as_slice()
    else {
        panic!("unexpected events: {:?}", runner.a_events);
    };
    assert_eq!(*mode, SessionMode::Case(CaseDetails { fab_idx: fab_a }));

    let [Event::SessionEstablished {
        session: sess_b,
        peer_node_id: Some(CONTROLLER),
        mode,
    }] = runner.b_events.as_slice()
    else {
        panic!("unexpected events: {:?}", runner.b_events);
    };
    assert_eq!(*mode, SessionMode::Case(CaseDetails { fab_idx: fab_b }));

    let (sess_a, sess_b) = (*sess_a, *sess_b);

    let a = runner.a.session(sess_a).unwrap();
    let b = runner.b.session(sess_b).unwrap();
    assert_eq!(a.local_nodeid(), CONTROLLER);
    assert_eq!(a.peer_nodeid(), Some(DEVICE));
    assert_eq!(b.local_nodeid(), DEVICE);
    assert_eq!(b.peer_nodeid(), Some(CONTROLLER));
    assert_eq!(a.att_challenge(), b.att_challenge());

    runner.a_events.clear();
    runner.b_events.clear();

    // Traffic flows both ways over the new session
    let exchange = runner.a.new_exchange(sess_a).unwrap();
    runner
        .a
        .send(exchange, 0xfff1, 1, b"hello", SendOptions::reliable())
        .unwrap();
    runner.pump();

    let Some(Event::Message(req)) = runner.b_events.pop() else {
        panic!("request not delivered");
    };
    assert_eq!(req.session, sess_b);
    assert_eq!(req.payload, b"hello");

    runner
        .b
        .send(req.exchange, 0xfff1, 2, b"world", SendOptions::reliable())
        .unwrap();
    runner.pump();

    assert_eq!(
        E2eRunner::take_messages(&mut runner.a_events),
        vec![b"world".to_vec()]
    );
}

#[test]
fn test_case_with_foreign_fabric_fails() {
    let (psm_a, psm_b) = (MemPsm::new(), MemPsm::new());
    let (matter_a, matter_b) = (
        new_matter(MatterConfig::new(), &psm_a),
        new_matter(MatterConfig::new(), &psm_b),
    );

    let ours = FabricAuthority::new(test_rand, FABRIC_ID).unwrap();
    let theirs = FabricAuthority::new(test_rand, FABRIC_ID).unwrap();
    let fab_a = join(&matter_a, &ours, CONTROLLER);
    join(&matter_b, &theirs, DEVICE);

    let mut runner = E2eRunner::new(&matter_a, &matter_b).unwrap();

    let exchange = runner
        .a
        .establish_case(E2eRunner::b_addr(), fab_a, DEVICE)
        .unwrap();
    runner.pump();

    assert!(matches!(
        runner.a_events.as_slice(),
        [Event::SessionEstablishmentFailed {
            exchange: failed,
            error: ErrorCode::NoSharedTrustRoots,
        }] if *failed == exchange
    ));
    assert!(matches!(
        runner.b_events.as_slice(),
        [Event::SessionEstablishmentFailed {
            error: ErrorCode::NoSharedTrustRoots,
            ..
        }]
    ));

    assert!(runner.a.exchange_mgr().is_empty());
    assert!(runner.b.exchange_mgr().is_empty());
}

#[test]
fn test_case_needs_local_fabric() {
    let (psm_a, psm_b) = (MemPsm::new(), MemPsm::new());
    let (matter_a, matter_b) = (
        new_matter(MatterConfig::new(), &psm_a),
        new_matter(MatterConfig::new(), &psm_b),
    );
    let mut runner = E2eRunner::new(&matter_a, &matter_b).unwrap();

    assert_eq!(
        runner
            .a
            .establish_case(E2eRunner::b_addr(), 1, DEVICE)
            .map_err(|e| e.code()),
        Err(ErrorCode::NoFabricId)
    );

    // Nothing is left behind
    assert!(runner.a.session_mgr().is_empty());
    assert!(runner.a.exchange_mgr().is_empty());
    assert!(!runner.a.has_outgoing());
}
