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

pub mod counter;
pub mod dedup;
pub mod dispatch;
pub mod exchange;
pub mod mgr;
pub mod mrp;
pub mod network;
pub mod packet;
pub mod pipe;
pub mod plain_hdr;
pub mod proto_hdr;
pub mod runner;
pub mod session;
pub mod tcp;
pub mod udp;
