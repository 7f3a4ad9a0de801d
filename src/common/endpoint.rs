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

use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::net::MacAddr;

// Cluster-wide endpoint identifier. Today this is the endpoint IP address;
// a VRF-qualified key would be needed for overlapping address spaces.
pub type EndpointId = String;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    #[default]
    Internal,
    External,
}

// One virtual NIC of a container, as gossiped between agents and masters.
// `port_no` is only meaningful on the owning host.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Endpoint {
    #[serde(rename = "EndpointID")]
    pub endpoint_id: EndpointId,
    pub endpoint_type: EndpointType,
    pub endpoint_group: i32,
    pub ip_addr: IpAddr,
    pub mac_addr: MacAddr,
    pub vlan: u16,
    pub vni: u32,
    pub vrf_id: u16,
    pub originator_ip: IpAddr,
    pub port_no: u32,
    pub timestamp: DateTime<Utc>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint {
            endpoint_id: String::new(),
            endpoint_type: EndpointType::Internal,
            endpoint_group: 0,
            ip_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            mac_addr: MacAddr::ZERO,
            vlan: 0,
            vni: 0,
            vrf_id: 0,
            originator_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_no: 0,
            timestamp: DateTime::<Utc>::MIN_UTC,
        }
    }
}

// Local endpoint registration request, as handed in by the container
// runtime plumbing. The agent fills in the rest of the record.
#[derive(Clone, Debug)]
pub struct EndpointInfo {
    pub port_no: u32,
    pub endpoint_group: i32,
    pub mac_addr: MacAddr,
    pub vlan: u16,
    pub ip_addr: IpAddr,
}
