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

// Datapath variants: each one translates endpoint, VTEP and VLAN events
// into flow edits for one encapsulation mode. Exactly one is active per
// agent, chosen at construction.

mod vlan;
mod vrouter;
mod vxlan;

pub use vlan::VlanBridge;
pub use vrouter::Vrouter;
pub use vxlan::Vxlan;

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use crate::common::{Endpoint, HostNode};
use crate::error::{Error, Result};
use crate::openflow::{OfSwitch, PacketIn};
use crate::policy::PolicyAgent;

pub trait Datapath: Send {
    fn switch_connected(&mut self, sw: &Arc<OfSwitch>) -> Result<()>;
    fn switch_disconnected(&mut self, sw: &Arc<OfSwitch>);
    // Called when a new master joins, before local endpoints are
    // re-announced. Datapath-specific sync hook.
    fn master_added(&mut self, master: &HostNode) -> Result<()>;
    fn packet_rcvd(&mut self, sw: &Arc<OfSwitch>, pkt: &PacketIn);
    fn add_local_endpoint(&mut self, endpoint: &Endpoint) -> Result<()>;
    fn remove_local_endpoint(&mut self, endpoint: &Endpoint) -> Result<()>;
    fn add_endpoint(&mut self, endpoint: &Endpoint) -> Result<()>;
    fn remove_endpoint(&mut self, endpoint: &Endpoint) -> Result<()>;
    fn add_vtep_port(&mut self, port: u32, remote_ip: IpAddr) -> Result<()>;
    fn remove_vtep_port(&mut self, port: u32, remote_ip: IpAddr) -> Result<()>;
    fn add_vlan(&mut self, vlan: u16, vni: u32) -> Result<()>;
    fn remove_vlan(&mut self, vlan: u16, vni: u32) -> Result<()>;
    // The policy agent owned by this datapath.
    fn policy(&mut self) -> &mut PolicyAgent;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatapathKind {
    Vxlan,
    Vlan,
    Vrouter,
}

impl FromStr for DatapathKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vxlan" => Ok(DatapathKind::Vxlan),
            "vlan" => Ok(DatapathKind::Vlan),
            "vrouter" => Ok(DatapathKind::Vrouter),
            _ => Err(Error::InvalidConfig(format!("unknown datapath: {}", s))),
        }
    }
}

pub fn new_datapath(kind: DatapathKind) -> Box<dyn Datapath> {
    match kind {
        DatapathKind::Vxlan => Box::new(Vxlan::new()),
        DatapathKind::Vlan => Box::new(VlanBridge::new()),
        DatapathKind::Vrouter => Box::new(Vrouter::new()),
    }
}
