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

#![allow(dead_code)]

use core::cell::{Cell, RefCell};
use core::time::Duration;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use matter_transport::error::Error;
use matter_transport::group_id::NodeId;
use matter_transport::persist::MemPsm;
use matter_transport::secure_channel::common::{OpCode, PROTO_ID_SECURE_CHANNEL};
use matter_transport::secure_channel::spake2p::VerifierData;
use matter_transport::transport::mgr::{Event, TransportMgr};
use matter_transport::transport::exchange::MessageMeta;
use matter_transport::transport::network::Address;
use matter_transport::transport::packet::encode_datagram;
use matter_transport::transport::plain_hdr::PlainHdr;
use matter_transport::transport::proto_hdr::ProtoHdr;
use matter_transport::transport::session::SessionHandle;
use matter_transport::{CommissioningData, Matter, MatterConfig};

pub const PASSCODE: u32 = 20202021;
pub const DISCRIMINATOR: u16 = 3840;

pub fn init_env_logger() {
    let _ = env_logger::try_init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
}

thread_local! {
    static NOW: Cell<Duration> = const { Cell::new(Duration::from_secs(1000)) };
    static RNG: RefCell<StdRng> = RefCell::new(StdRng::seed_from_u64(0x4d41_5454));
}

/// The mock clock every test node runs on. Only moves with [`advance`].
pub fn test_epoch() -> Duration {
    NOW.with(Cell::get)
}

pub fn advance(by: Duration) {
    NOW.with(|now| now.set(now.get() + by));
}

/// Seeded randomness, so a failing run can be replayed.
pub fn test_rand(buf: &mut [u8]) {
    RNG.with(|rng| rng.borrow_mut().fill_bytes(buf));
}

pub fn new_matter(config: MatterConfig, psm: &MemPsm) -> Matter<'_> {
    Matter::new(config, psm, test_epoch, test_rand)
}

pub fn commissioning_data() -> CommissioningData {
    CommissioningData {
        verifier: VerifierData::new_with_pw(PASSCODE, test_rand),
        discriminator: DISCRIMINATOR,
    }
}

/// Builds a secure channel datagram by hand. With a non-zero `sess_id` it
/// is encrypted with a key the receiver does not have.
pub fn forged_datagram(
    sess_id: u16,
    src_nodeid: Option<NodeId>,
    ctr: u32,
    opcode: OpCode,
    reliable: bool,
) -> Vec<u8> {
    let mut plain = PlainHdr::new();
    plain.sess_id = sess_id;
    plain.ctr = ctr;
    plain.set_src_nodeid(src_nodeid);

    let mut proto = ProtoHdr::new();
    MessageMeta::new(PROTO_ID_SECURE_CHANNEL, opcode as u8, reliable).set_into(&mut proto);
    proto.exch_id = ctr as u16;
    proto.set_initiator(true);

    let key = [0x5a; 16];
    let key = (sess_id != 0).then_some((&key[..], 0));

    encode_datagram(&plain, &proto, &[], key).unwrap()
}

/// Two transport stacks wired back to back through an in-memory network.
///
/// Node A is usually the controller and node B the device.
pub struct E2eRunner<'a> {
    pub a: TransportMgr<'a>,
    pub b: TransportMgr<'a>,
    pub a_events: Vec<Event>,
    pub b_events: Vec<Event>,
    filter: Option<Box<dyn FnMut(bool, &[u8]) -> bool>>,
}

impl<'a> E2eRunner<'a> {
    pub const A_ADDR: &'static str = "[fd00::a]:5540";
    pub const B_ADDR: &'static str = "[fd00::b]:5540";

    pub fn new(a: &'a Matter<'a>, b: &'a Matter<'a>) -> Result<Self, Error> {
        init_env_logger();

        Ok(Self {
            a: TransportMgr::new(a)?,
            b: TransportMgr::new(b)?,
            a_events: Vec::new(),
            b_events: Vec::new(),
            filter: None,
        })
    }

    pub fn a_addr() -> Address {
        Address::Udp(Self::A_ADDR.parse().unwrap())
    }

    pub fn b_addr() -> Address {
        Address::Udp(Self::B_ADDR.parse().unwrap())
    }

    /// Installs a filter deciding which datagrams make it across. It gets
    /// `true` for datagrams travelling from A to B.
    pub fn set_filter<F>(&mut self, filter: F)
    where
        F: FnMut(bool, &[u8]) -> bool + 'static,
    {
        self.filter = Some(Box::new(filter));
    }

    pub fn clear_filter(&mut self) {
        self.filter = None;
    }

    /// Moves datagrams between the nodes until both outboxes are empty.
    /// Returns how many were delivered.
    pub fn pump(&mut self) -> usize {
        let mut delivered = 0;

        loop {
            let mut moved = false;

            while let Some((_, data)) = self.a.pop_outgoing() {
                moved = true;
                if self.pass(true, &data) {
                    self.b.handle_message_received(Self::a_addr(), &data).unwrap();
                    delivered += 1;
                }
            }

            while let Some((_, data)) = self.b.pop_outgoing() {
                moved = true;
                if self.pass(false, &data) {
                    self.a.handle_message_received(Self::b_addr(), &data).unwrap();
                    delivered += 1;
                }
            }

            if !moved {
                break;
            }
        }

        self.collect_events();

        delivered
    }

    fn pass(&mut self, a_to_b: bool, data: &[u8]) -> bool {
        self.filter.as_mut().map_or(true, |f| f(a_to_b, data))
    }

    fn collect_events(&mut self) {
        while let Some(event) = self.a.next_event() {
            self.a_events.push(event);
        }

        while let Some(event) = self.b.next_event() {
            self.b_events.push(event);
        }
    }

    /// Advances the clock, fires what is due on both nodes and pumps.
    pub fn advance(&mut self, by: Duration) -> usize {
        advance(by);

        self.a.poll_timers().unwrap();
        self.b.poll_timers().unwrap();

        self.pump()
    }

    /// Steps the clock in `step` increments until neither node has a timer
    /// armed, or `limit` has elapsed.
    pub fn settle(&mut self, step: Duration, limit: Duration) {
        let mut elapsed = Duration::ZERO;

        while elapsed < limit && (self.a.next_deadline().is_some() || self.b.next_deadline().is_some())
        {
            self.advance(step);
            elapsed += step;
        }
    }

    /// Commissions B from A over PASE. Returns the session on each side.
    pub fn establish_pase(&mut self) -> (SessionHandle, SessionHandle) {
        self.b
            .matter()
            .start_commissioning(commissioning_data())
            .unwrap();

        self.a.establish_pase(Self::b_addr(), PASSCODE).unwrap();
        self.pump();

        (
            Self::take_established(&mut self.a_events),
            Self::take_established(&mut self.b_events),
        )
    }

    /// Removes and returns the first `SessionEstablished` in `events`.
    pub fn take_established(events: &mut Vec<Event>) -> SessionHandle {
        let index = events
            .iter()
            .position(|e| matches!(e, Event::SessionEstablished { .. }))
            .expect("no session established");

        match events.remove(index) {
            Event::SessionEstablished { session, .. } => session,
            _ => unreachable!(),
        }
    }

    /// Removes and returns the payloads of the application messages in
    /// `events`.
    pub fn take_messages(events: &mut Vec<Event>) -> Vec<Vec<u8>> {
        let mut payloads = Vec::new();

        events.retain(|e| match e {
            Event::Message(msg) => {
                payloads.push(msg.payload.clone());
                false
            }
            _ => true,
        });

        payloads
    }
}
