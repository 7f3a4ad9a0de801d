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

// Adapter between desired state and the agent: the config-watch loop talks
// to this façade, which resolves state objects and drives the agent's
// local API. Holds the agent by reference; no global state.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;

use crate::agent::OfnetAgent;
use crate::common::{EndpointInfo, HostNode};
use crate::error::{Error, Result};
use crate::netcfg::{EndpointState, NetworkState, PktTagType};
use crate::state::StateDriver;
use crate::utils::net::MacAddr;

// Local endpoint OF ports and VTEP tunnel ports live in disjoint ranges so
// the bridge wiring (veth plumbing, OVSDB tunnel creation) and the agent
// agree on stable numbers.
const LOCAL_PORT_BASE: u32 = 1;
const VTEP_PORT_BASE: u32 = 2000;
// Internal vlans allocated for vxlan networks on this host.
const LOCAL_VLAN_BASE: u16 = 1;

pub struct NetPlugin {
    host_label: String,
    vtep_ip: IpAddr,
    vlan_if: String,
    state: Arc<dyn StateDriver>,
    agent: Arc<OfnetAgent>,
    inner: Mutex<PluginState>,
}

#[derive(Default)]
struct PluginState {
    // network id -> (local vlan, vni)
    networks: HashMap<String, (u16, u32)>,
    next_vlan: u16,
    // endpoint id -> local OF port
    ep_ports: HashMap<String, u32>,
    next_port: u32,
    // peer host ip -> tunnel OF port
    peer_ports: HashMap<IpAddr, u32>,
    next_vtep_port: u32,
}

impl NetPlugin {
    pub fn new(
        host_label: String,
        vtep_ip: IpAddr,
        vlan_if: String,
        state: Arc<dyn StateDriver>,
        agent: Arc<OfnetAgent>,
    ) -> Result<NetPlugin> {
        if host_label.is_empty() {
            return Err(Error::EmptyHostLabel);
        }
        Ok(NetPlugin {
            host_label,
            vtep_ip,
            vlan_if,
            state,
            agent,
            inner: Mutex::new(PluginState {
                next_vlan: LOCAL_VLAN_BASE,
                next_port: LOCAL_PORT_BASE,
                next_vtep_port: VTEP_PORT_BASE,
                ..Default::default()
            }),
        })
    }

    pub fn host_label(&self) -> &str {
        &self.host_label
    }

    pub fn vlan_if(&self) -> &str {
        &self.vlan_if
    }

    pub fn agent(&self) -> &Arc<OfnetAgent> {
        &self.agent
    }

    // Maps a network onto the agent's VLAN<->VNI tables. Vxlan networks get
    // a host-local vlan; vlan networks use their wire tag directly.
    pub fn create_network(&self, id: &str) -> Result<()> {
        let net = NetworkState::read(self.state.as_ref(), id)?;
        let mut inner = self.inner.lock();
        if inner.networks.contains_key(id) {
            return Ok(());
        }
        let (vlan, vni) = match net.pkt_tag_type {
            PktTagType::Vxlan => {
                let vlan = inner.next_vlan;
                inner.next_vlan += 1;
                (vlan, net.pkt_tag)
            }
            PktTagType::Vlan => (net.pkt_tag as u16, net.pkt_tag),
        };
        info!("creating network {} (vlan {}, vni {})", id, vlan, vni);
        self.agent.add_vlan(vlan, vni)?;
        inner.networks.insert(id.to_owned(), (vlan, vni));
        Ok(())
    }

    pub fn delete_network(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let (vlan, vni) = inner
            .networks
            .remove(id)
            .ok_or_else(|| Error::NetworkNotFound(id.to_owned()))?;
        info!("deleting network {} (vlan {}, vni {})", id, vlan, vni);
        self.agent.remove_vlan(vlan, vni)
    }

    pub fn fetch_network(&self, _id: &str) -> Result<NetworkState> {
        Err(Error::NotImplemented)
    }

    // Materializes an endpoint on the local bridge. Port wiring itself is
    // container-runtime plumbing; the façade owns the port numbering.
    pub fn create_endpoint(&self, id: &str) -> Result<()> {
        let ep = EndpointState::read(self.state.as_ref(), id)?;
        let mut inner = self.inner.lock();
        if inner.ep_ports.contains_key(id) {
            return Ok(());
        }
        let (vlan, _) = *inner
            .networks
            .get(&ep.net_id)
            .ok_or_else(|| Error::NetworkNotFound(ep.net_id.clone()))?;

        let ip_addr: IpAddr = ep
            .ip_address
            .parse()
            .map_err(|_| Error::ParseAddrFailed(ep.ip_address.clone()))?;
        let mac_addr: MacAddr = ep.mac_address.parse()?;

        let port_no = inner.next_port;
        inner.next_port += 1;

        info!("creating endpoint {} on port {}", id, port_no);
        self.agent.add_local_endpoint(EndpointInfo {
            port_no,
            endpoint_group: 0,
            mac_addr,
            vlan,
            ip_addr,
        })?;
        inner.ep_ports.insert(id.to_owned(), port_no);
        Ok(())
    }

    pub fn delete_endpoint(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let port_no = inner
            .ep_ports
            .remove(id)
            .ok_or_else(|| Error::EndpointNotFound(id.to_owned()))?;
        info!("deleting endpoint {} on port {}", id, port_no);
        self.agent.remove_local_endpoint(port_no)
    }

    pub fn fetch_endpoint(&self, _id: &str) -> Result<EndpointState> {
        Err(Error::NotImplemented)
    }

    // Peer host discovery: allocate a tunnel port for the peer's VTEP and
    // hand it to the agent.
    pub fn add_peer_host(&self, node: &HostNode) -> Result<()> {
        let peer_ip: IpAddr = node
            .host_addr
            .parse()
            .map_err(|_| Error::ParseAddrFailed(node.host_addr.clone()))?;
        if peer_ip == self.vtep_ip {
            warn!("ignoring self as peer host: {}", peer_ip);
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let port = match inner.peer_ports.get(&peer_ip) {
            Some(port) => *port,
            None => {
                let port = inner.next_vtep_port;
                inner.next_vtep_port += 1;
                inner.peer_ports.insert(peer_ip, port);
                port
            }
        };
        self.agent.add_vtep_port(port, peer_ip)
    }

    pub fn delete_peer_host(&self, node: &HostNode) -> Result<()> {
        let peer_ip: IpAddr = node
            .host_addr
            .parse()
            .map_err(|_| Error::ParseAddrFailed(node.host_addr.clone()))?;
        let mut inner = self.inner.lock();
        let port = inner
            .peer_ports
            .remove(&peer_ip)
            .ok_or_else(|| Error::VtepNotFound(peer_ip.to_string()))?;
        self.agent.remove_vtep_port(port, peer_ip)
    }

    pub fn add_master(&self, node: &HostNode) -> Result<()> {
        self.agent.add_master(node)
    }

    pub fn delete_master(&self, node: &HostNode) -> Result<()> {
        self.agent.remove_master(node)
    }
}
