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

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use ahash::AHashMap;
use log::{debug, info, trace};

use super::Datapath;
use crate::common::{
    Endpoint, EndpointId, HostNode, DST_GRP_TBL_ID, FLOW_FLOOD_PRIORITY, FLOW_MATCH_PRIORITY,
    FLOW_MISS_PRIORITY, IP_TBL_ID, MAC_DEST_TBL_ID, METADATA_RX_VTEP, VLAN_TBL_ID,
};
use crate::error::{Error, Result};
use crate::openflow::{
    Flow, FlowAction, FlowMatch, FlowTarget, OfSwitch, PacketIn, Table, ETH_TYPE_IP,
};
use crate::policy::{src_group_metadata, PolicyAgent};

// VXLAN overlay datapath. Local traffic is tagged with the network's
// internal VLAN; traffic towards remote endpoints leaves through the VTEP
// tunnel port carrying the network's VNI. Pipeline:
//
//   table 0 -> VLAN_TBL -> DST_GRP_TBL -> POLICY_TBL -> IP_TBL -> MAC_DEST_TBL
pub struct Vxlan {
    policy: PolicyAgent,
    switch: Option<Arc<OfSwitch>>,
    vlan_table: Option<Table>,
    ip_table: Option<Table>,
    mac_dest_table: Option<Table>,
    // scaffolding flows: table misses, flood rules
    pipeline_flows: Vec<Flow>,
    // local endpoint port classification, keyed by OF port
    port_vlan_flows: HashMap<u32, Flow>,
    // per endpoint forwarding entries
    mac_flows: AHashMap<EndpointId, Flow>,
    ip_flows: AHashMap<EndpointId, Flow>,
    // tunnel ingress classification, keyed (vtep port, vni)
    vtep_ingress_flows: HashMap<(u32, u32), Flow>,
    vteps: HashMap<IpAddr, u32>,
    vlans: HashMap<u16, u32>,
}

impl Vxlan {
    pub fn new() -> Vxlan {
        Vxlan {
            policy: PolicyAgent::new(),
            switch: None,
            vlan_table: None,
            ip_table: None,
            mac_dest_table: None,
            pipeline_flows: Vec::new(),
            port_vlan_flows: HashMap::new(),
            mac_flows: AHashMap::new(),
            ip_flows: AHashMap::new(),
            vtep_ingress_flows: HashMap::new(),
            vteps: HashMap::new(),
            vlans: HashMap::new(),
        }
    }

    fn vlan_table(&self) -> Result<&Table> {
        self.vlan_table.as_ref().ok_or(Error::SwitchNotConnected)
    }

    fn ip_table(&self) -> Result<&Table> {
        self.ip_table.as_ref().ok_or(Error::SwitchNotConnected)
    }

    fn mac_dest_table(&self) -> Result<&Table> {
        self.mac_dest_table.as_ref().ok_or(Error::SwitchNotConnected)
    }

    fn endpoint_ipv4(endpoint: &Endpoint) -> Result<std::net::Ipv4Addr> {
        match endpoint.ip_addr {
            IpAddr::V4(v4) => Ok(v4),
            IpAddr::V6(_) => Err(Error::ParseAddrFailed(endpoint.ip_addr.to_string())),
        }
    }

    // Frames arriving on a tunnel are mapped back to the network's VLAN
    // and marked so they are never flooded into another tunnel.
    fn install_vtep_ingress(&mut self, port: u32, vlan: u16, vni: u32) -> Result<()> {
        if self.vtep_ingress_flows.contains_key(&(port, vni)) {
            return Ok(());
        }
        let mut flow = self.vlan_table()?.new_flow(FlowMatch {
            priority: FLOW_MATCH_PRIORITY,
            in_port: Some(port),
            tunnel_id: Some(vni as u64),
            ..Default::default()
        });
        flow.push_action(FlowAction::SetVlan(vlan));
        flow.set_metadata(METADATA_RX_VTEP, METADATA_RX_VTEP);
        flow.install(FlowTarget::Table(DST_GRP_TBL_ID))?;
        self.vtep_ingress_flows.insert((port, vni), flow);
        Ok(())
    }
}

impl Datapath for Vxlan {
    fn switch_connected(&mut self, sw: &Arc<OfSwitch>) -> Result<()> {
        info!("vxlan datapath: switch {:#x} connected", sw.dpid());
        self.switch = Some(sw.clone());
        self.policy.switch_connected(sw);

        let table0 = sw.new_table(0);
        let vlan_table = sw.new_table(VLAN_TBL_ID);
        let ip_table = sw.new_table(IP_TBL_ID);
        let mac_dest_table = sw.new_table(MAC_DEST_TBL_ID);

        // classification: everything enters the vlan table
        let mut class_miss = table0.new_flow(FlowMatch {
            priority: FLOW_MISS_PRIORITY,
            ..Default::default()
        });
        class_miss.install(FlowTarget::Table(VLAN_TBL_ID))?;
        self.pipeline_flows.push(class_miss);

        // frames from unknown ports are dropped
        let mut vlan_miss = vlan_table.new_flow(FlowMatch {
            priority: FLOW_MISS_PRIORITY,
            ..Default::default()
        });
        vlan_miss.install(FlowTarget::Drop)?;
        self.pipeline_flows.push(vlan_miss);

        self.policy.init_tables(IP_TBL_ID)?;

        // unresolved IPs fall through to L2 forwarding
        let mut ip_miss = ip_table.new_flow(FlowMatch {
            priority: FLOW_MISS_PRIORITY,
            ..Default::default()
        });
        ip_miss.install(FlowTarget::Table(MAC_DEST_TBL_ID))?;
        self.pipeline_flows.push(ip_miss);

        // tunnel-received frames flood to local ports only
        let mut vtep_flood = mac_dest_table.new_flow(FlowMatch {
            priority: FLOW_FLOOD_PRIORITY,
            metadata: Some(METADATA_RX_VTEP),
            metadata_mask: Some(METADATA_RX_VTEP),
            ..Default::default()
        });
        vtep_flood.install(FlowTarget::FloodLocal)?;
        self.pipeline_flows.push(vtep_flood);

        let mut mac_miss = mac_dest_table.new_flow(FlowMatch {
            priority: FLOW_MISS_PRIORITY,
            ..Default::default()
        });
        mac_miss.install(FlowTarget::Flood)?;
        self.pipeline_flows.push(mac_miss);

        self.vlan_table = Some(vlan_table);
        self.ip_table = Some(ip_table);
        self.mac_dest_table = Some(mac_dest_table);

        // tunnel classification for VTEPs and VLANs known before (re)connect;
        // endpoints are re-pushed by the masters instead
        let pairs: Vec<(u32, u16, u32)> = self
            .vteps
            .values()
            .flat_map(|port| self.vlans.iter().map(move |(vlan, vni)| (*port, *vlan, *vni)))
            .collect();
        for (port, vlan, vni) in pairs {
            self.install_vtep_ingress(port, vlan, vni)?;
        }
        Ok(())
    }

    fn switch_disconnected(&mut self, sw: &Arc<OfSwitch>) {
        info!("vxlan datapath: switch {:#x} disconnected", sw.dpid());
        self.switch = None;
        self.vlan_table = None;
        self.ip_table = None;
        self.mac_dest_table = None;
        self.pipeline_flows.clear();
        self.port_vlan_flows.clear();
        self.mac_flows.clear();
        self.ip_flows.clear();
        self.vtep_ingress_flows.clear();
        self.policy.switch_disconnected();
    }

    fn master_added(&mut self, master: &HostNode) -> Result<()> {
        // endpoint gossip covers the forwarding database, nothing extra
        debug!("vxlan datapath: master {} added", master);
        Ok(())
    }

    fn packet_rcvd(&mut self, sw: &Arc<OfSwitch>, pkt: &PacketIn) {
        trace!(
            "vxlan datapath: packet-in on switch {:#x} port {}, {} bytes",
            sw.dpid(),
            pkt.in_port,
            pkt.data.len()
        );
    }

    fn add_local_endpoint(&mut self, endpoint: &Endpoint) -> Result<()> {
        // ingress: tag with the network vlan and stamp the source group
        let mut vlan_flow = self.vlan_table()?.new_flow(FlowMatch {
            priority: FLOW_MATCH_PRIORITY,
            in_port: Some(endpoint.port_no),
            ..Default::default()
        });
        vlan_flow.push_action(FlowAction::SetVlan(endpoint.vlan));
        let (metadata, mask) = src_group_metadata(endpoint.endpoint_group);
        vlan_flow.set_metadata(metadata, mask);
        vlan_flow.install(FlowTarget::Table(DST_GRP_TBL_ID))?;

        // egress L2: known MAC goes straight to the port
        let mut mac_flow = self.mac_dest_table()?.new_flow(FlowMatch {
            priority: FLOW_MATCH_PRIORITY,
            vlan_id: Some(endpoint.vlan),
            mac_da: Some(endpoint.mac_addr),
            ..Default::default()
        });
        mac_flow.push_action(FlowAction::PopVlan);
        mac_flow.install(FlowTarget::Port(endpoint.port_no))?;

        // egress L3: local delivery by destination IP
        let mut ip_flow = self.ip_table()?.new_flow(FlowMatch {
            priority: FLOW_MATCH_PRIORITY,
            ethertype: Some(ETH_TYPE_IP),
            ip_da: Some(Self::endpoint_ipv4(endpoint)?),
            ..Default::default()
        });
        ip_flow.push_action(FlowAction::PopVlan);
        ip_flow.install(FlowTarget::Port(endpoint.port_no))?;

        self.policy.add_endpoint(endpoint)?;

        self.port_vlan_flows.insert(endpoint.port_no, vlan_flow);
        self.mac_flows.insert(endpoint.endpoint_id.clone(), mac_flow);
        self.ip_flows.insert(endpoint.endpoint_id.clone(), ip_flow);
        Ok(())
    }

    fn remove_local_endpoint(&mut self, endpoint: &Endpoint) -> Result<()> {
        if let Some(mut flow) = self.port_vlan_flows.remove(&endpoint.port_no) {
            flow.delete()?;
        }
        if let Some(mut flow) = self.mac_flows.remove(&endpoint.endpoint_id) {
            flow.delete()?;
        }
        if let Some(mut flow) = self.ip_flows.remove(&endpoint.endpoint_id) {
            flow.delete()?;
        }
        self.policy.del_endpoint(endpoint)
    }

    fn add_endpoint(&mut self, endpoint: &Endpoint) -> Result<()> {
        let vtep_port = *self
            .vteps
            .get(&endpoint.originator_ip)
            .ok_or_else(|| Error::VtepNotFound(endpoint.originator_ip.to_string()))?;

        let mut mac_flow = self.mac_dest_table()?.new_flow(FlowMatch {
            priority: FLOW_MATCH_PRIORITY,
            vlan_id: Some(endpoint.vlan),
            mac_da: Some(endpoint.mac_addr),
            ..Default::default()
        });
        mac_flow.push_action(FlowAction::PopVlan);
        mac_flow.push_action(FlowAction::SetTunnelId(endpoint.vni as u64));
        mac_flow.install(FlowTarget::Port(vtep_port))?;

        let mut ip_flow = self.ip_table()?.new_flow(FlowMatch {
            priority: FLOW_MATCH_PRIORITY,
            ethertype: Some(ETH_TYPE_IP),
            ip_da: Some(Self::endpoint_ipv4(endpoint)?),
            ..Default::default()
        });
        ip_flow.push_action(FlowAction::PopVlan);
        ip_flow.push_action(FlowAction::SetTunnelId(endpoint.vni as u64));
        ip_flow.install(FlowTarget::Port(vtep_port))?;

        self.policy.add_endpoint(endpoint)?;

        self.mac_flows.insert(endpoint.endpoint_id.clone(), mac_flow);
        self.ip_flows.insert(endpoint.endpoint_id.clone(), ip_flow);
        Ok(())
    }

    fn remove_endpoint(&mut self, endpoint: &Endpoint) -> Result<()> {
        if let Some(mut flow) = self.mac_flows.remove(&endpoint.endpoint_id) {
            flow.delete()?;
        }
        if let Some(mut flow) = self.ip_flows.remove(&endpoint.endpoint_id) {
            flow.delete()?;
        }
        self.policy.del_endpoint(endpoint)
    }

    fn add_vtep_port(&mut self, port: u32, remote_ip: IpAddr) -> Result<()> {
        info!("vxlan datapath: adding VTEP port {} for {}", port, remote_ip);
        self.vteps.insert(remote_ip, port);
        let vlans: Vec<(u16, u32)> = self.vlans.iter().map(|(v, n)| (*v, *n)).collect();
        for (vlan, vni) in vlans {
            self.install_vtep_ingress(port, vlan, vni)?;
        }
        Ok(())
    }

    fn remove_vtep_port(&mut self, port: u32, remote_ip: IpAddr) -> Result<()> {
        info!("vxlan datapath: removing VTEP port {} for {}", port, remote_ip);
        self.vteps.remove(&remote_ip);
        let stale: Vec<(u32, u32)> = self
            .vtep_ingress_flows
            .keys()
            .filter(|(p, _)| *p == port)
            .copied()
            .collect();
        for key in stale {
            if let Some(mut flow) = self.vtep_ingress_flows.remove(&key) {
                flow.delete()?;
            }
        }
        Ok(())
    }

    fn add_vlan(&mut self, vlan: u16, vni: u32) -> Result<()> {
        self.vlans.insert(vlan, vni);
        if self.switch.is_none() {
            // tunnel classification is installed on connect
            return Ok(());
        }
        let vteps: Vec<u32> = self.vteps.values().copied().collect();
        for port in vteps {
            self.install_vtep_ingress(port, vlan, vni)?;
        }
        Ok(())
    }

    fn remove_vlan(&mut self, vlan: u16, vni: u32) -> Result<()> {
        self.vlans.remove(&vlan);
        let stale: Vec<(u32, u32)> = self
            .vtep_ingress_flows
            .keys()
            .filter(|(_, n)| *n == vni)
            .copied()
            .collect();
        for key in stale {
            if let Some(mut flow) = self.vtep_ingress_flows.remove(&key) {
                flow.delete()?;
            }
        }
        Ok(())
    }

    fn policy(&mut self) -> &mut PolicyAgent {
        &mut self.policy
    }
}

impl Default for Vxlan {
    fn default() -> Self {
        Self::new()
    }
}
