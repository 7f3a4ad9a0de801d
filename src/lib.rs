/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

pub mod agent;
pub mod common;
pub mod config;
pub mod daemon;
pub mod datapath;
pub mod error;
pub mod netcfg;
pub mod openflow;
pub mod plugin;
pub mod policy;
pub mod rpc;
pub mod state;
pub mod utils;

pub use agent::OfnetAgent;
pub use daemon::NetDaemon;
pub use plugin::NetPlugin;

// Well-known control ports: agents answer RPC on 9002, masters on 9001,
// the bridge dials the OpenFlow listener on 6633.
pub const OFNET_AGENT_PORT: u16 = 9002;
pub const OFNET_MASTER_PORT: u16 = 9001;
pub const OPENFLOW_PORT: u16 = 6633;
