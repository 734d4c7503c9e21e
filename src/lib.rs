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

//! The Matter secure session and message transport layer.
//!
//! Sessions (unauthenticated, PASE, CASE and group), exchanges with the
//! Message Reliability Protocol, message counter synchronization and the
//! network plumbing underneath, driven either directly through
//! [`transport::mgr::TransportMgr`] or by the async [`transport::runner::Runner`].
//!
//! # Examples
//! ```
//! use matter_transport::{Matter, MatterConfig, CommissioningData};
//! use matter_transport::persist::MemPsm;
//! use matter_transport::secure_channel::spake2p::VerifierData;
//! use matter_transport::transport::mgr::TransportMgr;
//! use matter_transport::utils::rand::sys_rand;
//!
//! let psm = MemPsm::new();
//! let matter = Matter::new_default(MatterConfig::new(), &psm);
//!
//! matter
//!     .start_commissioning(CommissioningData {
//!         verifier: VerifierData::new_with_pw(20202021, sys_rand),
//!         discriminator: 3840,
//!     })
//!     .unwrap();
//!
//! let mut mgr = TransportMgr::new(&matter).unwrap();
//! assert!(mgr.next_event().is_none());
//! ```

pub mod core;
pub mod crypto;
pub mod error;
pub mod fabric;
pub mod group_id;
pub mod group_keys;
pub mod persist;
pub mod secure_channel;
pub mod tlv;
pub mod transport;
pub mod utils;

pub use crate::core::*;
