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

use core::time::Duration;

use log::{debug, warn};

use super::network::Address;

/// Message Reliability Protocol parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrpConfig {
    /// Delay before the first retransmission.
    pub base_interval: Duration,
    /// Transmissions of one message, including the first one.
    pub max_transmissions: u8,
    /// Retransmissions sent at the base interval before backoff kicks in.
    pub backoff_threshold: u8,
    /// Backoff multiplier as a ratio (numerator, denominator).
    pub backoff_base: (u32, u32),
    /// How long a pending ack waits for an outgoing message to ride on.
    pub standalone_ack_timeout: Duration,
}

impl MrpConfig {
    pub const fn new() -> Self {
        Self {
            base_interval: Duration::from_millis(200),
            max_transmissions: 10,
            backoff_threshold: 3,
            backoff_base: (16, 10),
            standalone_ack_timeout: Duration::from_millis(200),
        }
    }

    /// The wait after the `transmissions`-th transmission of a message.
    pub fn retrans_interval(&self, transmissions: u8) -> Duration {
        let exponent = transmissions
            .saturating_sub(1)
            .saturating_sub(self.backoff_threshold);

        let mut interval = self.base_interval.as_millis() as u64;
        for _ in 0..exponent {
            interval = interval * self.backoff_base.0 as u64 / self.backoff_base.1 as u64;
        }

        Duration::from_millis(interval)
    }
}

impl Default for MrpConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A reliable message waiting for its ack. The encoded datagram is kept so
/// retransmissions are byte-identical.
#[derive(Debug)]
pub struct RetransEntry {
    msg_ctr: u32,
    datagram: Vec<u8>,
    peer: Address,
    transmissions: u8,
    next_at: Duration,
}

impl RetransEntry {
    pub fn msg_ctr(&self) -> u32 {
        self.msg_ctr
    }

    pub fn transmissions(&self) -> u8 {
        self.transmissions
    }
}

#[derive(Debug, Clone)]
pub struct AckEntry {
    msg_ctr: u32,
    deadline: Duration,
}

/// The per-exchange MRP state: at most one unacknowledged outgoing message
/// and at most one pending ack.
#[derive(Debug, Default)]
pub struct ReliableMessage {
    retrans: Option<RetransEntry>,
    ack: Option<AckEntry>,
}

impl ReliableMessage {
    pub const fn new() -> Self {
        Self {
            retrans: None,
            ack: None,
        }
    }

    pub fn is_retrans_pending(&self) -> bool {
        self.retrans.is_some()
    }

    pub fn is_ack_pending(&self) -> bool {
        self.ack.is_some()
    }

    pub fn retrans(&self) -> Option<&RetransEntry> {
        self.retrans.as_ref()
    }

    /// Takes the pending ack so it can be piggybacked on an outgoing
    /// message.
    pub fn take_ack(&mut self) -> Option<u32> {
        self.ack.take().map(|ack| ack.msg_ctr)
    }

    /// Records a reliable message that was just sent.
    pub fn post_send(
        &mut self,
        msg_ctr: u32,
        datagram: &[u8],
        peer: Address,
        now: Duration,
        config: &MrpConfig,
    ) {
        if let Some(old) = self.retrans.as_ref() {
            warn!(
                "Replacing unacknowledged message {:x} with {:x}",
                old.msg_ctr, msg_ctr
            );
        }

        self.retrans = Some(RetransEntry {
            msg_ctr,
            datagram: datagram.to_vec(),
            peer,
            transmissions: 1,
            next_at: now + config.retrans_interval(1),
        });
    }

    /// Processes an ack counter carried by a received message. Returns
    /// `true` when it acknowledged the pending message.
    pub fn on_ack(&mut self, ack_ctr: u32) -> bool {
        match self.retrans.as_ref() {
            Some(entry) if entry.msg_ctr == ack_ctr => {
                debug!("Message {:x} acknowledged", ack_ctr);
                self.retrans = None;
                true
            }
            Some(entry) => {
                // The peer may still be retransmitting an older message
                debug!(
                    "Ack for {:x} does not match pending {:x}",
                    ack_ctr, entry.msg_ctr
                );
                false
            }
            None => false,
        }
    }

    /// Schedules an ack for a received reliable message. When an ack for a
    /// different message is still pending, that counter is returned and has
    /// to be acknowledged right away.
    pub fn schedule_ack(&mut self, msg_ctr: u32, now: Duration, config: &MrpConfig) -> Option<u32> {
        let previous = self
            .ack
            .take()
            .map(|ack| ack.msg_ctr)
            .filter(|ctr| *ctr != msg_ctr);

        self.ack = Some(AckEntry {
            msg_ctr,
            deadline: now + config.standalone_ack_timeout,
        });

        previous
    }

    pub fn is_ack_due(&self, now: Duration) -> bool {
        self.ack.as_ref().map_or(false, |ack| ack.deadline <= now)
    }

    pub fn is_retrans_due(&self, now: Duration) -> bool {
        self.retrans
            .as_ref()
            .map_or(false, |entry| entry.next_at <= now)
    }

    /// Produces the next retransmission of the pending message. Returns
    /// `None` (and forgets the message) once all transmissions are used up.
    pub fn retransmit(&mut self, now: Duration, config: &MrpConfig) -> Option<(Address, Vec<u8>)> {
        let entry = self.retrans.as_mut()?;

        if entry.transmissions >= config.max_transmissions {
            warn!(
                "Message {:x} not acknowledged after {} transmissions",
                entry.msg_ctr, entry.transmissions
            );
            self.retrans = None;
            return None;
        }

        entry.transmissions += 1;
        entry.next_at = now + config.retrans_interval(entry.transmissions);
        debug!(
            "Retransmitting {:x} ({}/{})",
            entry.msg_ctr, entry.transmissions, config.max_transmissions
        );

        Some((entry.peer, entry.datagram.clone()))
    }

    pub fn clear_retrans(&mut self) {
        self.retrans = None;
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        let retrans = self.retrans.as_ref().map(|entry| entry.next_at);
        let ack = self.ack.as_ref().map(|ack| ack.deadline);

        match (retrans, ack) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
