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
use core::time::Duration;

use log::info;

use crate::error::*;
use crate::fabric::{Fabric, FabricMgr};
use crate::group_id::{FabricIndex, GroupId};
use crate::persist::PersistentStorage;
use crate::secure_channel::msg_counter::CounterSyncConfig;
use crate::secure_channel::pake::{PaseMgr, PASE_DISCARD_TIMEOUT};
use crate::secure_channel::spake2p::VerifierData;
use crate::transport::mrp::MrpConfig;
use crate::transport::network::MATTER_PORT;
use crate::transport::session::MAX_DECRYPT_FAILURES;
use crate::utils::{epoch::Epoch, rand::Rand};

/// Device Commissioning Data
#[derive(Debug, Clone)]
pub struct CommissioningData {
    /// The data like password or verifier that is required to authenticate
    pub verifier: VerifierData,
    /// The 12-bit discriminator used to differentiate between multiple devices
    pub discriminator: u16,
}

/// Tunables of the transport stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatterConfig {
    pub mrp: MrpConfig,
    /// Consecutive decryption failures after which a secure session is
    /// closed.
    pub max_decrypt_failures: u8,
    pub counter_sync: CounterSyncConfig,
    /// How long a stalled PASE handshake blocks new ones.
    pub pase_discard_timeout: Duration,
    /// Response timeout for each step of a CASE handshake we initiate.
    pub case_timeout: Duration,
    pub port: u16,
}

impl MatterConfig {
    pub const fn new() -> Self {
        Self {
            mrp: MrpConfig::new(),
            max_decrypt_failures: MAX_DECRYPT_FAILURES,
            counter_sync: CounterSyncConfig::new(),
            pase_discard_timeout: PASE_DISCARD_TIMEOUT,
            case_timeout: Duration::from_secs(30),
            port: MATTER_PORT,
        }
    }
}

impl Default for MatterConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The primary Matter Object
///
/// Holds what outlives any single transport instance: configuration, the
/// fabric table, the commissioning state and the injected clock, randomness
/// and storage. Several instances can coexist in one process.
pub struct Matter<'a> {
    config: MatterConfig,
    pub(crate) fabric_mgr: RefCell<FabricMgr>,
    pub(crate) pase_mgr: RefCell<PaseMgr>,
    pub(crate) psm: &'a dyn PersistentStorage,
    pub(crate) epoch: Epoch,
    pub(crate) rand: Rand,
}

impl<'a> Matter<'a> {
    #[inline(always)]
    pub fn new_default(config: MatterConfig, psm: &'a dyn PersistentStorage) -> Self {
        use crate::utils::epoch::sys_epoch;
        use crate::utils::rand::sys_rand;

        Self::new(config, psm, sys_epoch, sys_rand)
    }

    /// Creates a new Matter object
    ///
    /// # Parameters
    /// * psm: storage for state that must survive a reboot (the global
    ///   encrypted message counter)
    /// * epoch: the clock all timers run against
    /// * rand: the randomness source for counters, session ids and key
    ///   material
    #[inline(always)]
    pub fn new(
        config: MatterConfig,
        psm: &'a dyn PersistentStorage,
        epoch: Epoch,
        rand: Rand,
    ) -> Self {
        Self {
            config,
            fabric_mgr: RefCell::new(FabricMgr::new()),
            pase_mgr: RefCell::new(PaseMgr::new()),
            psm,
            epoch,
            rand,
        }
    }

    pub fn config(&self) -> &MatterConfig {
        &self.config
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn rand(&self) -> Rand {
        self.rand
    }

    pub fn add_fabric(&self, fabric: Fabric) -> Result<FabricIndex, Error> {
        self.fabric_mgr.borrow_mut().add(fabric)
    }

    pub fn remove_fabric(&self, fab_idx: FabricIndex) -> Result<(), Error> {
        self.fabric_mgr.borrow_mut().remove(fab_idx)
    }

    pub fn fabric_count(&self) -> usize {
        self.fabric_mgr.borrow().iter().count()
    }

    /// Installs the epoch key of a group on one of our fabrics.
    pub fn set_group_key(
        &self,
        fab_idx: FabricIndex,
        group_id: GroupId,
        epoch_key: &[u8],
    ) -> Result<(), Error> {
        self.fabric_mgr
            .borrow_mut()
            .get_fabric_mut(fab_idx)
            .ok_or(ErrorCode::NoFabricId)?
            .set_group_key(group_id, epoch_key)
    }

    /// Opens the commissioning window: PASE handshakes are accepted with the
    /// given verifier. Returns `false` if the window was already open.
    pub fn start_commissioning(&self, dev_comm: CommissioningData) -> Result<bool, Error> {
        if self.pase_mgr.borrow().is_pase_session_enabled() {
            return Ok(false);
        }

        self.pase_mgr
            .borrow_mut()
            .enable_pase_session(dev_comm.verifier, dev_comm.discriminator)?;
        info!("Commissioning window open");

        Ok(true)
    }

    pub fn stop_commissioning(&self) {
        self.pase_mgr.borrow_mut().disable_pase_session();
    }

    pub fn is_commissioning_open(&self) -> bool {
        self.pase_mgr.borrow().is_pase_session_enabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::FabricAuthority;
    use crate::persist::MemPsm;
    use crate::utils::{epoch::dummy_epoch, rand::sys_rand};

    #[test]
    fn test_default_config() {
        let config = MatterConfig::default();
        assert_eq!(config.port, 5540);
        assert_eq!(config.max_decrypt_failures, 8);
        assert_eq!(config.pase_discard_timeout, Duration::from_secs(60));
        assert_eq!(config.mrp.max_transmissions, 10);
    }

    #[test]
    fn test_commissioning_window() {
        let psm = MemPsm::new();
        let matter = Matter::new(MatterConfig::new(), &psm, dummy_epoch, sys_rand);

        let dev_comm = CommissioningData {
            verifier: VerifierData::new_with_pw(20202021, sys_rand),
            discriminator: 3840,
        };

        assert!(matter.start_commissioning(dev_comm.clone()).unwrap());
        assert!(matter.is_commissioning_open());
        assert!(!matter.start_commissioning(dev_comm).unwrap());

        matter.stop_commissioning();
        assert!(!matter.is_commissioning_open());
    }

    #[test]
    fn test_group_key_needs_fabric() {
        let psm = MemPsm::new();
        let matter = Matter::new(MatterConfig::new(), &psm, dummy_epoch, sys_rand);

        let err = matter
            .set_group_key(1, GroupId(0x0101), &[0x5a; 16])
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoFabricId);

        let authority = FabricAuthority::new(sys_rand, 0xfab).unwrap();
        let fab_idx = matter
            .add_fabric(authority.new_node_fabric(sys_rand, 7).unwrap())
            .unwrap();
        matter
            .set_group_key(fab_idx, GroupId(0x0101), &[0x5a; 16])
            .unwrap();
        assert_eq!(matter.fabric_count(), 1);
    }
}
