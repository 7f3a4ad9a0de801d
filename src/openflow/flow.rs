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

use std::net::Ipv4Addr;

use crate::utils::net::MacAddr;

pub const ETH_TYPE_IP: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;

pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

// Match half of a flow entry. Unset fields are wildcards. L4 ports are kept
// per protocol so a rule can arm both TCP and UDP matches at once and let
// `ip_proto` disambiguate.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlowMatch {
    pub priority: u16,
    pub in_port: Option<u32>,
    pub ethertype: Option<u16>,
    pub mac_da: Option<MacAddr>,
    pub mac_sa: Option<MacAddr>,
    pub vlan_id: Option<u16>,
    pub ip_da: Option<Ipv4Addr>,
    pub ip_da_mask: Option<Ipv4Addr>,
    pub ip_sa: Option<Ipv4Addr>,
    pub ip_sa_mask: Option<Ipv4Addr>,
    pub ip_proto: Option<u8>,
    pub tcp_src_port: Option<u16>,
    pub tcp_dst_port: Option<u16>,
    pub udp_src_port: Option<u16>,
    pub udp_dst_port: Option<u16>,
    pub tcp_flags: Option<u16>,
    pub tcp_flags_mask: Option<u16>,
    pub metadata: Option<u64>,
    pub metadata_mask: Option<u64>,
    pub tunnel_id: Option<u64>,
}

// Packet rewrites applied before the flow's next element.
#[derive(Clone, Debug, PartialEq)]
pub enum FlowAction {
    SetVlan(u16),
    PopVlan,
    SetMacDa(MacAddr),
    SetMacSa(MacAddr),
    SetTunnelId(u64),
    SetMetadata { value: u64, mask: u64 },
}

// Where a matching packet goes next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowTarget {
    Table(u8),
    Port(u32),
    // All ports in the packet's VLAN, tunnels included.
    Flood,
    // Flood restricted to non-tunnel ports.
    FloodLocal,
    Controller,
    Drop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowModCmd {
    Add,
    Delete,
}

// One unit of work for the flow programmer.
#[derive(Clone, Debug, PartialEq)]
pub struct FlowMod {
    pub cmd: FlowModCmd,
    pub table_id: u8,
    pub cookie: u64,
    pub fmatch: FlowMatch,
    pub actions: Vec<FlowAction>,
    pub next: Option<FlowTarget>,
}
