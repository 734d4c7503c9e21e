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

use core::cell::{Cell, RefCell};
use core::time::Duration;
use std::rc::Rc;

use matter_transport::error::ErrorCode;
use matter_transport::persist::MemPsm;
use matter_transport::secure_channel::common::OpCode;
use matter_transport::transport::exchange::{ExchangeId, ExchangeState, SendOptions};
use matter_transport::transport::mgr::{AppDelegate, Event, TransportMgr};
use matter_transport::transport::packet::peek_plain_hdr;
use matter_transport::transport::session::{SessionHandle, MAX_SESSIONS};
use matter_transport::MatterConfig;

use common::{forged_datagram, new_matter, E2eRunner};

mod common;

const PROTO: u16 = 0xfff1;
const OPCODE: u8 = 0x01;

#[test]
fn test_replayed_datagram_not_delivered() {
    let (psm_a, psm_b) = (MemPsm::new(), MemPsm::new());
    let (matter_a, matter_b) = (
        new_matter(MatterConfig::new(), &psm_a),
        new_matter(MatterConfig::new(), &psm_b),
    );
    let mut runner = E2eRunner::new(&matter_a, &matter_b).unwrap();
    let (sess_a, _) = runner.establish_pase();

    let captured = Rc::new(RefCell::new(Vec::new()));
    let sink = captured.clone();
    runner.set_filter(move |a_to_b, data| {
        if a_to_b {
            sink.borrow_mut().push(data.to_vec());
        }
        true
    });

    let exchange = runner.a.new_exchange(sess_a).unwrap();
    runner
        .a
        .send(exchange, PROTO, OPCODE, b"once", SendOptions::reliable())
        .unwrap();
    runner.pump();
    assert_eq!(
        E2eRunner::take_messages(&mut runner.b_events),
        vec![b"once".to_vec()]
    );

    let replay = captured.borrow()[0].clone();
    for _ in 0..3 {
        runner
            .b
            .handle_message_received(E2eRunner::a_addr(), &replay)
            .unwrap();
    }
    runner.pump();

    assert!(E2eRunner::take_messages(&mut runner.b_events).is_empty());
    assert!(runner.b_events.is_empty());
}

#[test]
fn test_retransmission_until_acked() {
    let (psm_a, psm_b) = (MemPsm::new(), MemPsm::new());
    let (matter_a, matter_b) = (
        new_matter(MatterConfig::new(), &psm_a),
        new_matter(MatterConfig::new(), &psm_b),
    );
    let mut runner = E2eRunner::new(&matter_a, &matter_b).unwrap();
    let (sess_a, _) = runner.establish_pase();

    // The first two transmissions are lost
    let dropped = Rc::new(RefCell::new(Vec::new()));
    let sink = dropped.clone();
    runner.set_filter(move |a_to_b, data| {
        if a_to_b && sink.borrow().len() < 2 {
            sink.borrow_mut().push(data.to_vec());
            return false;
        }
        true
    });

    let exchange = runner.a.new_exchange(sess_a).unwrap();
    runner
        .a
        .send(exchange, PROTO, OPCODE, b"retry", SendOptions::reliable())
        .unwrap();
    runner.pump();
    assert!(runner.b_events.is_empty());

    runner.settle(Duration::from_millis(100), Duration::from_secs(10));

    // Retransmissions resend the same bytes
    let dropped = dropped.borrow();
    assert_eq!(dropped.len(), 2);
    assert_eq!(dropped[0], dropped[1]);

    assert_eq!(
        E2eRunner::take_messages(&mut runner.b_events),
        vec![b"retry".to_vec()]
    );
    assert!(runner.a_events.is_empty());
    assert!(runner.a.next_deadline().is_none());
}

#[test]
fn test_standalone_ack_when_no_reply() {
    let (psm_a, psm_b) = (MemPsm::new(), MemPsm::new());
    let (matter_a, matter_b) = (
        new_matter(MatterConfig::new(), &psm_a),
        new_matter(MatterConfig::new(), &psm_b),
    );
    let mut runner = E2eRunner::new(&matter_a, &matter_b).unwrap();
    let (sess_a, _) = runner.establish_pase();

    let from_b = Rc::new(Cell::new(0));
    let counter = from_b.clone();
    runner.set_filter(move |a_to_b, _| {
        if !a_to_b {
            counter.set(counter.get() + 1);
        }
        true
    });

    let exchange = runner.a.new_exchange(sess_a).unwrap();
    runner
        .a
        .send(exchange, PROTO, OPCODE, b"ack me", SendOptions::reliable())
        .unwrap();
    runner.pump();

    // The ack waits for a reply to ride on
    assert_eq!(from_b.get(), 0);
    assert!(runner.b.next_deadline().is_some());

    runner.advance(Duration::from_millis(100));
    assert_eq!(from_b.get(), 0);

    runner.settle(Duration::from_millis(100), Duration::from_secs(10));
    assert!(from_b.get() >= 1);
    assert!(runner.a.next_deadline().is_none());
    assert!(runner.b.next_deadline().is_none());
    assert!(runner.a_events.is_empty());
    assert_eq!(E2eRunner::take_messages(&mut runner.b_events).len(), 1);
}

#[test]
fn test_delivery_failed_after_max_transmissions() {
    let (psm_a, psm_b) = (MemPsm::new(), MemPsm::new());
    let (matter_a, matter_b) = (
        new_matter(MatterConfig::new(), &psm_a),
        new_matter(MatterConfig::new(), &psm_b),
    );
    let mut runner = E2eRunner::new(&matter_a, &matter_b).unwrap();
    let (sess_a, _) = runner.establish_pase();

    let sent = Rc::new(Cell::new(0));
    let counter = sent.clone();
    runner.set_filter(move |a_to_b, _| {
        if a_to_b {
            counter.set(counter.get() + 1);
        }
        false
    });

    let exchange = runner.a.new_exchange(sess_a).unwrap();
    runner
        .a
        .send(exchange, PROTO, OPCODE, b"lost", SendOptions::reliable())
        .unwrap();
    runner.settle(Duration::from_millis(100), Duration::from_secs(60));

    assert_eq!(sent.get(), MatterConfig::new().mrp.max_transmissions as usize);
    assert!(matches!(
        runner.a_events.as_slice(),
        [Event::DeliveryFailed { exchange: failed, session }]
            if *failed == exchange && *session == sess_a
    ));
}

#[derive(Default)]
struct Timeouts {
    timed_out: Vec<(ExchangeId, SessionHandle)>,
    failed: usize,
}

impl AppDelegate for Timeouts {
    fn on_response_timeout(
        &mut self,
        _mgr: &mut TransportMgr<'_>,
        exchange: ExchangeId,
        session: SessionHandle,
    ) {
        self.timed_out.push((exchange, session));
    }

    fn on_delivery_failed(
        &mut self,
        _mgr: &mut TransportMgr<'_>,
        _exchange: ExchangeId,
        _session: SessionHandle,
    ) {
        self.failed += 1;
    }
}

#[test]
fn test_response_timeout_after_retries() {
    let (psm_a, psm_b) = (MemPsm::new(), MemPsm::new());
    let (matter_a, matter_b) = (
        new_matter(MatterConfig::new(), &psm_a),
        new_matter(MatterConfig::new(), &psm_b),
    );
    let mut runner = E2eRunner::new(&matter_a, &matter_b).unwrap();
    let (sess_a, _) = runner.establish_pase();

    let exchange = runner.a.new_exchange(sess_a).unwrap();
    runner
        .a
        .send(
            exchange,
            PROTO,
            OPCODE,
            b"anyone?",
            SendOptions::reliable().with_response(Duration::from_secs(5), 3),
        )
        .unwrap();

    // Nothing reaches the peer; step the clock by hand so the delegate sees
    // the events
    let mut delegate = Timeouts::default();
    let mut requests = 0;
    for _ in 0..250 {
        while runner.a.pop_outgoing().is_some() {
            requests += 1;
        }

        common::advance(Duration::from_millis(100));
        runner.a.poll_timers().unwrap();
        runner.a.process_events(&mut delegate);
    }

    assert_eq!(delegate.timed_out, vec![(exchange, sess_a)]);
    assert_eq!(delegate.failed, 0);
    assert_eq!(
        runner.a.exchange(exchange).unwrap().state(),
        ExchangeState::TimedOut
    );
    assert!(runner.a.next_deadline().is_none());

    // The original request plus three re-sends, each with its MRP retries
    assert!(requests > 4);
}

#[test]
fn test_request_resent_with_fresh_counter() {
    let (psm_a, psm_b) = (MemPsm::new(), MemPsm::new());
    let (matter_a, matter_b) = (
        new_matter(MatterConfig::new(), &psm_a),
        new_matter(MatterConfig::new(), &psm_b),
    );
    let mut runner = E2eRunner::new(&matter_a, &matter_b).unwrap();
    let (sess_a, _) = runner.establish_pase();

    let counters = Rc::new(RefCell::new(Vec::new()));
    let sink = counters.clone();
    runner.set_filter(move |a_to_b, data| {
        if a_to_b {
            sink.borrow_mut().push(peek_plain_hdr(data).unwrap().ctr);
        }
        true
    });

    let exchange = runner.a.new_exchange(sess_a).unwrap();
    runner
        .a
        .send(
            exchange,
            PROTO,
            OPCODE,
            b"again",
            SendOptions::reliable().with_response(Duration::from_secs(5), 1),
        )
        .unwrap();
    runner.settle(Duration::from_millis(500), Duration::from_secs(30));

    // The peer acks but never answers: one re-send, then the timeout
    assert_eq!(
        E2eRunner::take_messages(&mut runner.b_events),
        vec![b"again".to_vec(), b"again".to_vec()]
    );
    assert!(matches!(
        runner.a_events.as_slice(),
        [Event::ResponseTimeout { .. }]
    ));

    // Retransmissions repeat a counter, the re-sent request does not
    let mut unique = counters.borrow().clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), 2);
}

#[test]
fn test_cancel_drops_pending_work() {
    let (psm_a, psm_b) = (MemPsm::new(), MemPsm::new());
    let (matter_a, matter_b) = (
        new_matter(MatterConfig::new(), &psm_a),
        new_matter(MatterConfig::new(), &psm_b),
    );
    let mut runner = E2eRunner::new(&matter_a, &matter_b).unwrap();
    let (sess_a, _) = runner.establish_pase();
    runner.set_filter(|_, _| false);

    let exchange = runner.a.new_exchange(sess_a).unwrap();
    runner
        .a
        .send(
            exchange,
            PROTO,
            OPCODE,
            b"never mind",
            SendOptions::reliable().with_response(Duration::from_secs(5), 3),
        )
        .unwrap();
    runner.pump();

    runner.a.cancel_exchange(exchange).unwrap();
    assert!(runner.a.exchange(exchange).is_none());
    assert!(runner.a.next_deadline().is_none());
    assert_eq!(
        runner
            .a
            .send(exchange, PROTO, OPCODE, b"", SendOptions::reliable())
            .map_err(|e| e.code()),
        Err(ErrorCode::NoExchange)
    );

    assert_eq!(runner.advance(Duration::from_secs(30)), 0);
    assert!(!runner.a.has_outgoing());
    assert!(runner.a_events.is_empty());
}

#[test]
fn test_unpermitted_message_dropped() {
    let (psm_a, psm_b) = (MemPsm::new(), MemPsm::new());
    let (matter_a, matter_b) = (
        new_matter(MatterConfig::new(), &psm_a),
        new_matter(MatterConfig::new(), &psm_b),
    );
    let mut runner = E2eRunner::new(&matter_a, &matter_b).unwrap();
    let (sess_a, _) = runner.establish_pase();

    let open_exchanges = runner.b.exchange_mgr().len();

    // A handshake opcode has no business on a secure session
    let exchange = runner.a.new_exchange(sess_a).unwrap();
    runner
        .a
        .send(
            exchange,
            0,
            OpCode::PASEPake1 as u8,
            b"",
            SendOptions::unreliable(),
        )
        .unwrap();
    runner.pump();

    assert!(runner.b_events.is_empty());
    assert_eq!(runner.b.exchange_mgr().len(), open_exchanges);
}

#[test]
fn test_close_session_notifies_peer() {
    let (psm_a, psm_b) = (MemPsm::new(), MemPsm::new());
    let (matter_a, matter_b) = (
        new_matter(MatterConfig::new(), &psm_a),
        new_matter(MatterConfig::new(), &psm_b),
    );
    let mut runner = E2eRunner::new(&matter_a, &matter_b).unwrap();
    let (sess_a, sess_b) = runner.establish_pase();

    runner.a.close_session(sess_a).unwrap();
    runner.pump();

    assert!(matches!(
        runner.a_events.as_slice(),
        [Event::SessionClosed { session }] if *session == sess_a
    ));
    assert!(matches!(
        runner.b_events.as_slice(),
        [Event::SessionClosed { session }] if *session == sess_b
    ));
    assert!(runner.a.session(sess_a).is_none());
    assert!(runner.b.session(sess_b).is_none());
    assert!(runner.b.exchange_mgr().for_session(sess_b).is_empty());

    assert_eq!(
        runner.a.close_session(sess_a).map_err(|e| e.code()),
        Err(ErrorCode::NoSession)
    );
}

#[test]
fn test_strangers_cannot_evict_secure_session() {
    let (psm_a, psm_b) = (MemPsm::new(), MemPsm::new());
    let (matter_a, matter_b) = (
        new_matter(MatterConfig::new(), &psm_a),
        new_matter(MatterConfig::new(), &psm_b),
    );
    let mut runner = E2eRunner::new(&matter_a, &matter_b).unwrap();
    let (sess_a, sess_b) = runner.establish_pase();
    runner.advance(Duration::from_secs(1));

    // Strangers keep opening unauthenticated sessions on B; they only ever
    // push each other out
    for i in 0..2 * MAX_SESSIONS as u64 {
        let stranger = forged_datagram(
            0,
            Some(0xFFFF_FFFE_0000_0000 + i),
            1,
            OpCode::MRPStandAloneAck,
            false,
        );
        runner
            .b
            .handle_message_received(E2eRunner::a_addr(), &stranger)
            .unwrap();
    }

    assert!(runner.b.session_mgr().is_full());
    assert!(runner.b.session(sess_b).is_some());
    runner.pump();
    assert!(runner.a_events.is_empty());
    assert!(runner.b_events.is_empty());

    // A handshake B starts itself may take the slot of the idle secure
    // session. The handshake goes nowhere.
    runner.set_filter(|a_to_b, data| a_to_b || peek_plain_hdr(data).unwrap().sess_id != 0);
    runner
        .b
        .establish_pase(E2eRunner::a_addr(), common::PASSCODE)
        .unwrap();
    assert!(runner.b.session(sess_b).is_none());
    runner.pump();

    assert!(matches!(
        runner.b_events.as_slice(),
        [Event::SessionClosed { session }] if *session == sess_b
    ));
    assert!(matches!(
        runner.a_events.as_slice(),
        [Event::SessionClosed { session }] if *session == sess_a
    ));
}

#[test]
fn test_decryption_failures_close_session() {
    let (psm_a, psm_b) = (MemPsm::new(), MemPsm::new());
    let (matter_a, matter_b) = (
        new_matter(MatterConfig::new(), &psm_a),
        new_matter(MatterConfig::new(), &psm_b),
    );
    let mut runner = E2eRunner::new(&matter_a, &matter_b).unwrap();
    let (sess_a, sess_b) = runner.establish_pase();

    let sess_id = runner.b.session(sess_b).unwrap().local_sess_id();
    let max = MatterConfig::new().max_decrypt_failures as u32;

    for ctr in 0..max {
        assert!(runner.b.session(sess_b).is_some());

        let forged = forged_datagram(sess_id, None, 1000 + ctr, OpCode::MRPStandAloneAck, false);
        runner
            .b
            .handle_message_received(E2eRunner::a_addr(), &forged)
            .unwrap();
    }

    assert!(runner.b.session(sess_b).is_none());
    // The peer is not told
    assert!(!runner.b.has_outgoing());
    runner.pump();

    assert!(matches!(
        runner.b_events.as_slice(),
        [Event::SessionClosed { session }] if *session == sess_b
    ));
    assert!(runner.a.session(sess_a).is_some());
}
