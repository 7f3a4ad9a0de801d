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
use log::{debug, info, trace, warn};

use super::Datapath;
use crate::common::{
    Endpoint, EndpointId, HostNode, DST_GRP_TBL_ID, FLOW_MATCH_PRIORITY, FLOW_MISS_PRIORITY,
    MAC_DEST_TBL_ID, VLAN_TBL_ID,
};
use crate::error::{Error, Result};
use crate::openflow::{Flow, FlowAction, FlowMatch, FlowTarget, OfSwitch, PacketIn, Table};
use crate::policy::{src_group_metadata, PolicyAgent};

// 802.1Q bridge datapath: no tunnel encapsulation, the uplink carries the
// tags. Remote endpoints are reached by flooding within the VLAN, so only
// local endpoints install forwarding state. Pipeline:
//
//   table 0 -> VLAN_TBL -> DST_GRP_TBL -> POLICY_TBL -> MAC_DEST_TBL
pub struct VlanBridge {
    policy: PolicyAgent,
    switch: Option<Arc<OfSwitch>>,
    vlan_table: Option<Table>,
    mac_dest_table: Option<Table>,
    pipeline_flows: Vec<Flow>,
    port_vlan_flows: HashMap<u32, Flow>,
    mac_flows: AHashMap<EndpointId, Flow>,
    vlans: HashMap<u16, u32>,
}

impl VlanBridge {
    pub fn new() -> VlanBridge {
        VlanBridge {
            policy: PolicyAgent::new(),
            switch: None,
            vlan_table: None,
            mac_dest_table: None,
            pipeline_flows: Vec::new(),
            port_vlan_flows: HashMap::new(),
            mac_flows: AHashMap::new(),
            vlans: HashMap::new(),
        }
    }

    fn vlan_table(&self) -> Result<&Table> {
        self.vlan_table.as_ref().ok_or(Error::SwitchNotConnected)
    }

    fn mac_dest_table(&self) -> Result<&Table> {
        self.mac_dest_table.as_ref().ok_or(Error::SwitchNotConnected)
    }
}

impl Datapath for VlanBridge {
    fn switch_connected(&mut self, sw: &Arc<OfSwitch>) -> Result<()> {
        info!("vlan datapath: switch {:#x} connected", sw.dpid());
        self.switch = Some(sw.clone());
        self.policy.switch_connected(sw);

        let table0 = sw.new_table(0);
        let vlan_table = sw.new_table(VLAN_TBL_ID);
        let mac_dest_table = sw.new_table(MAC_DEST_TBL_ID);

        let mut class_miss = table0.new_flow(FlowMatch {
            priority: FLOW_MISS_PRIORITY,
            ..Default::default()
        });
        class_miss.install(FlowTarget::Table(VLAN_TBL_ID))?;
        self.pipeline_flows.push(class_miss);

        let mut vlan_miss = vlan_table.new_flow(FlowMatch {
            priority: FLOW_MISS_PRIORITY,
            ..Default::default()
        });
        vlan_miss.install(FlowTarget::Drop)?;
        self.pipeline_flows.push(vlan_miss);

        self.policy.init_tables(MAC_DEST_TBL_ID)?;

        // unknown unicast floods within the vlan, uplink included
        let mut mac_miss = mac_dest_table.new_flow(FlowMatch {
            priority: FLOW_MISS_PRIORITY,
            ..Default::default()
        });
        mac_miss.install(FlowTarget::Flood)?;
        self.pipeline_flows.push(mac_miss);

        self.vlan_table = Some(vlan_table);
        self.mac_dest_table = Some(mac_dest_table);
        Ok(())
    }

    fn switch_disconnected(&mut self, sw: &Arc<OfSwitch>) {
        info!("vlan datapath: switch {:#x} disconnected", sw.dpid());
        self.switch = None;
        self.vlan_table = None;
        self.mac_dest_table = None;
        self.pipeline_flows.clear();
        self.port_vlan_flows.clear();
        self.mac_flows.clear();
        self.policy.switch_disconnected();
    }

    fn master_added(&mut self, master: &HostNode) -> Result<()> {
        debug!("vlan datapath: master {} added", master);
        Ok(())
    }

    fn packet_rcvd(&mut self, sw: &Arc<OfSwitch>, pkt: &PacketIn) {
        trace!(
            "vlan datapath: packet-in on switch {:#x} port {}, {} bytes",
            sw.dpid(),
            pkt.in_port,
            pkt.data.len()
        );
    }

    fn add_local_endpoint(&mut self, endpoint: &Endpoint) -> Result<()> {
        let mut vlan_flow = self.vlan_table()?.new_flow(FlowMatch {
            priority: FLOW_MATCH_PRIORITY,
            in_port: Some(endpoint.port_no),
            ..Default::default()
        });
        vlan_flow.push_action(FlowAction::SetVlan(endpoint.vlan));
        let (metadata, mask) = src_group_metadata(endpoint.endpoint_group);
        vlan_flow.set_metadata(metadata, mask);
        vlan_flow.install(FlowTarget::Table(DST_GRP_TBL_ID))?;

        let mut mac_flow = self.mac_dest_table()?.new_flow(FlowMatch {
            priority: FLOW_MATCH_PRIORITY,
            vlan_id: Some(endpoint.vlan),
            mac_da: Some(endpoint.mac_addr),
            ..Default::default()
        });
        mac_flow.push_action(FlowAction::PopVlan);
        mac_flow.install(FlowTarget::Port(endpoint.port_no))?;

        self.policy.add_endpoint(endpoint)?;

        self.port_vlan_flows.insert(endpoint.port_no, vlan_flow);
        self.mac_flows.insert(endpoint.endpoint_id.clone(), mac_flow);
        Ok(())
    }

    fn remove_local_endpoint(&mut self, endpoint: &Endpoint) -> Result<()> {
        if let Some(mut flow) = self.port_vlan_flows.remove(&endpoint.port_no) {
            flow.delete()?;
        }
        if let Some(mut flow) = self.mac_flows.remove(&endpoint.endpoint_id) {
            flow.delete()?;
        }
        self.policy.del_endpoint(endpoint)
    }

    // Remote endpoints need no forwarding entries, the uplink flood finds
    // them; only policy classification is installed.
    fn add_endpoint(&mut self, endpoint: &Endpoint) -> Result<()> {
        self.policy.add_endpoint(endpoint)
    }

    fn remove_endpoint(&mut self, endpoint: &Endpoint) -> Result<()> {
        self.policy.del_endpoint(endpoint)
    }

    fn add_vtep_port(&mut self, port: u32, remote_ip: IpAddr) -> Result<()> {
        warn!(
            "vlan datapath has no tunnels, ignoring VTEP port {} for {}",
            port, remote_ip
        );
        Ok(())
    }

    fn remove_vtep_port(&mut self, _port: u32, _remote_ip: IpAddr) -> Result<()> {
        Ok(())
    }

    fn add_vlan(&mut self, vlan: u16, vni: u32) -> Result<()> {
        // the uplink trunks every vlan, nothing to install
        self.vlans.insert(vlan, vni);
        Ok(())
    }

    fn remove_vlan(&mut self, vlan: u16, _vni: u32) -> Result<()> {
        self.vlans.remove(&vlan);
        Ok(())
    }

    fn policy(&mut self) -> &mut PolicyAgent {
        &mut self.policy
    }
}

impl Default for VlanBridge {
    fn default() -> Self {
        Self::new()
    }
}
