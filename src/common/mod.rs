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

pub mod endpoint;
pub mod node;

pub use endpoint::{Endpoint, EndpointId, EndpointInfo, EndpointType};
pub use node::HostNode;

// Flow priorities shared by all datapaths.
pub const FLOW_MATCH_PRIORITY: u16 = 100;
pub const FLOW_FLOOD_PRIORITY: u16 = 10;
pub const FLOW_MISS_PRIORITY: u16 = 1;
pub const FLOW_POLICY_PRIORITY_OFFSET: u16 = 10;

// Pipeline table ids, fixed so every datapath composes with the policy
// tables the same way. Table 0 classifies.
pub const VLAN_TBL_ID: u8 = 1;
pub const DST_GRP_TBL_ID: u8 = 2;
pub const POLICY_TBL_ID: u8 = 3;
pub const IP_TBL_ID: u8 = 4;
pub const MAC_DEST_TBL_ID: u8 = 5;

// Metadata bit 0: frame was received on a VTEP port, never flood it back
// into a tunnel.
pub const METADATA_RX_VTEP: u64 = 1 << 0;
