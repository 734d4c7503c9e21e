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

use log::{debug, info};

use crate::error::*;
use crate::persist::PersistentStorage;
use crate::utils::rand::Rand;

/// Initial counters are random but leave headroom below wraparound.
pub const MSG_CTR_INIT_MASK: u32 = 0x0fff_ffff;

/// Key the global encrypted counter is persisted under.
pub const GLOBAL_ENCRYPTED_CTR_KEY: &str = "GlobalMCTR";

/// Number of counter values reserved on each write to persistent storage.
pub const GLOBAL_ENCRYPTED_CTR_EPOCH: u32 = 1000;

fn random_init(rand: Rand) -> u32 {
    let mut buf = [0; 4];
    rand(&mut buf);

    u32::from_le_bytes(buf) & MSG_CTR_INIT_MASK
}

/// A plain, in-memory message counter.
///
/// Used both per secure session and as the global unencrypted counter shared
/// by all unauthenticated sessions.
#[derive(Debug, Clone)]
pub struct MessageCounter {
    next: u32,
}

impl MessageCounter {
    pub fn new(rand: Rand) -> Self {
        Self {
            next: random_init(rand),
        }
    }

    pub const fn new_with(next: u32) -> Self {
        Self { next }
    }

    /// The counter the next call to [`MessageCounter::next`] returns.
    pub fn peek(&self) -> u32 {
        self.next
    }

    pub fn next(&mut self) -> u32 {
        let ctr = self.next;
        self.next = self.next.wrapping_add(1);

        ctr
    }
}

/// The counter used for group messages.
///
/// Group keys are long lived, so a counter value must never repeat across
/// reboots. The counter reserves values in epochs: the end of the current
/// epoch is written to storage before any value from it is handed out, and
/// after a restart counting resumes from the stored value.
pub struct GlobalEncryptedCounter<'a> {
    psm: &'a dyn PersistentStorage,
    next: u32,
    limit: u32,
}

impl<'a> GlobalEncryptedCounter<'a> {
    pub fn load(psm: &'a dyn PersistentStorage, rand: Rand) -> Result<Self, Error> {
        let mut buf = [0; 4];
        let next = match psm.load(GLOBAL_ENCRYPTED_CTR_KEY, &mut buf)? {
            Some(data) => {
                let data: [u8; 4] = data.try_into()?;
                let next = u32::from_le_bytes(data);
                info!("Global encrypted counter restored at {}", next);
                next
            }
            None => {
                let next = random_init(rand);
                info!("Global encrypted counter initialized at {}", next);
                next
            }
        };

        let mut this = Self {
            psm,
            next,
            limit: next,
        };
        this.reserve()?;

        Ok(this)
    }

    fn reserve(&mut self) -> Result<(), Error> {
        let limit = self.next.wrapping_add(GLOBAL_ENCRYPTED_CTR_EPOCH);
        self.psm
            .store(GLOBAL_ENCRYPTED_CTR_KEY, &limit.to_le_bytes())?;
        self.limit = limit;
        debug!("Global encrypted counter reserved up to {}", limit);

        Ok(())
    }

    pub fn peek(&self) -> u32 {
        self.next
    }

    pub fn next(&mut self) -> Result<u32, Error> {
        if self.next == self.limit {
            self.reserve()?;
        }

        let ctr = self.next;
        self.next = self.next.wrapping_add(1);

        Ok(ctr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemPsm;

    fn fixed_rand(buf: &mut [u8]) {
        buf.fill(0xff);
    }

    #[test]
    fn test_session_counter_is_masked() {
        let mut ctr = MessageCounter::new(fixed_rand);
        assert_eq!(ctr.peek(), MSG_CTR_INIT_MASK);
        assert_eq!(ctr.next(), MSG_CTR_INIT_MASK);
        assert_eq!(ctr.next(), MSG_CTR_INIT_MASK + 1);
    }

    #[test]
    fn test_session_counter_wraps() {
        let mut ctr = MessageCounter::new_with(u32::MAX);
        assert_eq!(ctr.next(), u32::MAX);
        assert_eq!(ctr.next(), 0);
    }

    #[test]
    fn test_global_counter_never_repeats_across_restarts() {
        let psm = MemPsm::new();

        let mut seen = std::collections::HashSet::new();

        for _ in 0..3 {
            let mut ctr = GlobalEncryptedCounter::load(&psm, fixed_rand).unwrap();
            for _ in 0..(GLOBAL_ENCRYPTED_CTR_EPOCH + 10) {
                assert!(seen.insert(ctr.next().unwrap()));
            }
        }

        // Restart without handing out anything: still no reuse
        let mut ctr = GlobalEncryptedCounter::load(&psm, fixed_rand).unwrap();
        assert!(seen.insert(ctr.next().unwrap()));
    }

    #[test]
    fn test_global_counter_persists_limit() {
        let psm = MemPsm::new();
        let ctr = GlobalEncryptedCounter::load(&psm, fixed_rand).unwrap();

        let mut buf = [0; 4];
        let stored = psm.load(GLOBAL_ENCRYPTED_CTR_KEY, &mut buf).unwrap().unwrap();
        assert_eq!(
            u32::from_le_bytes(stored.try_into().unwrap()),
            ctr.peek() + GLOBAL_ENCRYPTED_CTR_EPOCH
        );
    }
}
