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

// The per-host agent. Owns every in-memory table (endpoints, VTEPs,
// VLAN<->VNI, masters), orchestrates the datapath and policy agent, and
// services RPCs from the masters. One bridge per host, fully controlled by
// this agent.
//
// Every table lives behind one mutex. RPC handler threads, OpenFlow
// callbacks and config-watch callbacks all serialize on it; outbound RPC
// to masters deliberately happens under the lock so per-endpoint ordering
// between install and announce is free.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::{Endpoint, EndpointId, EndpointInfo, EndpointType, HostNode};
use crate::datapath::{new_datapath, Datapath, DatapathKind};
use crate::error::{Error, Result};
use crate::openflow::{AppInterface, Controller, OfSwitch, PacketIn, TraceProgrammer};
use crate::policy::PolicyRule;
use crate::rpc::{RpcHub, RpcServer, RpcService};

const DELETE_DRAIN: Duration = Duration::from_millis(100);

pub struct OfnetAgent {
    local_ip: IpAddr,
    my_addr: String,
    my_port: u16,
    connected: AtomicBool,
    rpc_server: RpcServer,
    hub: RpcHub,
    controller: Mutex<Option<Controller>>,
    inner: Mutex<AgentInner>,
}

struct AgentInner {
    datapath: Box<dyn Datapath>,
    switch: Option<Arc<OfSwitch>>,
    // masters keyed "addr:port"
    master_db: HashMap<String, HostNode>,
    // port and VNI to vlan mappings
    port_vlan_map: HashMap<u32, u16>,
    vlan_vni_map: HashMap<u16, u32>,
    vni_vlan_map: HashMap<u32, u16>,
    // remote VTEP ip to local tunnel port
    vtep_table: HashMap<IpAddr, u32>,
    // all known endpoints, cluster wide
    endpoint_db: AHashMap<EndpointId, Endpoint>,
    // local OF port to endpoint id
    local_endpoint_db: HashMap<u32, EndpointId>,
}

impl OfnetAgent {
    // Creates the agent and its RPC server. The OpenFlow listener starts
    // separately via `listen`.
    pub fn new(kind: DatapathKind, local_ip: IpAddr, rpc_port: u16) -> Result<Arc<OfnetAgent>> {
        let rpc_server = RpcServer::new(rpc_port)?;
        let my_port = rpc_server.port();

        let agent = Arc::new(OfnetAgent {
            local_ip,
            my_addr: local_ip.to_string(),
            my_port,
            connected: AtomicBool::new(false),
            rpc_server,
            hub: RpcHub::new(),
            controller: Mutex::new(None),
            inner: Mutex::new(AgentInner {
                datapath: new_datapath(kind),
                switch: None,
                master_db: HashMap::new(),
                port_vlan_map: HashMap::new(),
                vlan_vni_map: HashMap::new(),
                vni_vlan_map: HashMap::new(),
                vtep_table: HashMap::new(),
                endpoint_db: AHashMap::new(),
                local_endpoint_db: HashMap::new(),
            }),
        });

        agent.rpc_server.register(
            "OfnetAgent",
            Arc::new(AgentRpc {
                agent: Arc::downgrade(&agent),
            }),
        );
        agent.rpc_server.register(
            "PolicyAgent",
            Arc::new(PolicyRpc {
                agent: Arc::downgrade(&agent),
            }),
        );
        Ok(agent)
    }

    // Starts listening for the bridge's OpenFlow connection.
    pub fn listen(self: &Arc<Self>, of_addr: &str) -> Result<()> {
        let app: Arc<dyn AppInterface> = self.clone();
        let controller = Controller::new(Arc::downgrade(&app), Arc::new(TraceProgrammer::new()));
        controller.listen(of_addr)?;
        *self.controller.lock() = Some(controller);
        Ok(())
    }

    pub fn my_addr(&self) -> &str {
        &self.my_addr
    }

    pub fn my_port(&self) -> u16 {
        self.my_port
    }

    pub fn is_switch_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn wait_for_switch_connection(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_switch_connected() {
                return true;
            }
            thread::sleep(Duration::from_millis(100));
        }
        self.is_switch_connected()
    }

    // Tears the agent down: switch listener, RPC listener, then a short
    // drain for in-flight handlers.
    pub fn delete(&self) {
        if let Some(controller) = self.controller.lock().take() {
            controller.delete();
        }
        self.rpc_server.stop();
        thread::sleep(DELETE_DRAIN);
    }

    // FIXME: this needs to be VRF qualified to allow overlapping addresses.
    fn endpoint_id(ip: IpAddr) -> EndpointId {
        ip.to_string()
    }

    // Registers a local endpoint: resolve the VNI, install datapath state,
    // index it, then announce it to every known master. A failed announce
    // is returned to the caller but the local install stays; masters
    // tolerate re-announcement on reconnect.
    pub fn add_local_endpoint(&self, endpoint: EndpointInfo) -> Result<()> {
        let mut inner = self.inner.lock();

        let vni = match inner.vlan_vni_map.get(&endpoint.vlan) {
            Some(vni) => *vni,
            None => {
                error!("VNI for vlan {} is not known", endpoint.vlan);
                return Err(Error::UnknownVlan(endpoint.vlan));
            }
        };
        inner.port_vlan_map.insert(endpoint.port_no, endpoint.vlan);

        let ep_id = Self::endpoint_id(endpoint.ip_addr);
        let epreg = Endpoint {
            endpoint_id: ep_id.clone(),
            endpoint_type: EndpointType::Internal,
            endpoint_group: endpoint.endpoint_group,
            ip_addr: endpoint.ip_addr,
            mac_addr: endpoint.mac_addr,
            vlan: endpoint.vlan,
            vni,
            vrf_id: 0,
            originator_ip: self.local_ip,
            port_no: endpoint.port_no,
            timestamp: Utc::now(),
        };

        inner.datapath.add_local_endpoint(&epreg)?;

        inner.endpoint_db.insert(ep_id.clone(), epreg.clone());
        inner.local_endpoint_db.insert(endpoint.port_no, ep_id);

        // announce to all masters; local install is never rolled back
        for master in inner.master_db.values() {
            info!("sending endpoint {} to master {}", epreg.endpoint_id, master);
            let client = self.hub.client(&master.host_addr, master.host_port);
            if let Err(e) = client.call("OfnetMaster.EndpointAdd", &epreg) {
                error!(
                    "failed to add endpoint {} to master {}: {}",
                    epreg.endpoint_id, master, e
                );
                return Err(e);
            }
        }
        Ok(())
    }

    // Removes a local endpoint by port. Master failures are logged, not
    // returned: the local endpoint is definitively gone.
    pub fn remove_local_endpoint(&self, port_no: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.port_vlan_map.remove(&port_no);

        let ep_id = inner
            .local_endpoint_db
            .remove(&port_no)
            .ok_or_else(|| Error::EndpointNotFound(format!("port {}", port_no)))?;
        let epreg = match inner.endpoint_db.remove(&ep_id) {
            Some(ep) => ep,
            None => return Err(Error::EndpointNotFound(ep_id)),
        };

        if let Err(e) = inner.datapath.remove_local_endpoint(&epreg) {
            error!("error deleting endpoint on port {}: {}", port_no, e);
        }

        for master in inner.master_db.values() {
            info!(
                "sending DELETE endpoint {} to master {}",
                epreg.endpoint_id, master
            );
            let client = self.hub.client(&master.host_addr, master.host_port);
            if let Err(e) = client.call("OfnetMaster.EndpointDel", &epreg) {
                error!(
                    "failed to delete endpoint {} on master {}: {}",
                    epreg.endpoint_id, master, e
                );
            }
        }
        Ok(())
    }

    // Maps a remote VTEP ip to its local tunnel port.
    pub fn add_vtep_port(&self, port_no: u32, remote_ip: IpAddr) -> Result<()> {
        let mut inner = self.inner.lock();
        // duplicate adds are no-ops
        if inner.vtep_table.get(&remote_ip) == Some(&port_no) {
            return Ok(());
        }
        info!("adding VTEP port {} for remote {}", port_no, remote_ip);
        inner.vtep_table.insert(remote_ip, port_no);
        inner.datapath.add_vtep_port(port_no, remote_ip)
    }

    // Removes a VTEP and uninstalls every endpoint homed behind it.
    pub fn remove_vtep_port(&self, port_no: u32, remote_ip: IpAddr) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.vtep_table.remove(&remote_ip);

        let orphaned: Vec<Endpoint> = inner
            .endpoint_db
            .values()
            .filter(|ep| ep.originator_ip == remote_ip)
            .cloned()
            .collect();
        for ep in orphaned {
            if let Err(e) = inner.datapath.remove_endpoint(&ep) {
                error!("error uninstalling endpoint {}: {}", ep.endpoint_id, e);
            }
            inner.endpoint_db.remove(&ep.endpoint_id);
        }

        inner.datapath.remove_vtep_port(port_no, remote_ip)
    }

    // Maps a vlan to a VXLAN VNI.
    pub fn add_vlan(&self, vlan: u16, vni: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.vlan_vni_map.insert(vlan, vni);
        inner.vni_vlan_map.insert(vni, vlan);
        inner.datapath.add_vlan(vlan, vni)
    }

    // Removing a vlan that still has endpoints is a caller bug the agent
    // cannot recover from.
    pub fn remove_vlan(&self, vlan: u16, vni: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.vlan_vni_map.remove(&vlan);
        inner.vni_vlan_map.remove(&vni);

        for ep in inner.endpoint_db.values() {
            if ep.vni == vni {
                panic!(
                    "vlan {} still has endpoints, endpoint: {}",
                    vlan, ep.endpoint_id
                );
            }
        }

        inner.datapath.remove_vlan(vlan, vni)
    }

    // Registers with a master, lets the datapath sync, then re-announces
    // every local endpoint. The master stays in the DB on partial failure
    // so a later convergence pass can retry.
    pub fn add_master(&self, master: &HostNode) -> Result<()> {
        let mut inner = self.inner.lock();
        info!("adding master {}", master);
        inner.master_db.insert(master.key(), master.clone());

        let my_info = HostNode::new(self.my_addr.clone(), self.my_port);
        let client = self.hub.client(&master.host_addr, master.host_port);
        if let Err(e) = client.call("OfnetMaster.RegisterNode", &my_info) {
            error!("failed to register with master {}: {}", master, e);
            return Err(e);
        }

        if let Err(e) = inner.datapath.master_added(master) {
            error!("error in master added callback for {}: {}", master, e);
        }

        let local: Vec<Endpoint> = inner
            .local_endpoint_db
            .values()
            .filter_map(|id| inner.endpoint_db.get(id))
            .filter(|ep| ep.originator_ip == self.local_ip)
            .cloned()
            .collect();
        for epreg in local {
            info!("sending endpoint {} to master {}", epreg.endpoint_id, master);
            if let Err(e) = client.call("OfnetMaster.EndpointAdd", &epreg) {
                error!(
                    "failed to add endpoint {} to master {}: {}",
                    epreg.endpoint_id, master, e
                );
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn remove_master(&self, master: &HostNode) -> Result<()> {
        info!("deleting master {}", master);
        self.inner.lock().master_db.remove(&master.key());
        self.hub.forget(&master.host_addr, master.host_port);
        Ok(())
    }

    pub fn master_count(&self) -> usize {
        self.inner.lock().master_db.len()
    }

    // Remote endpoint gossip from a master. Echoes of our own endpoints
    // are dropped; conflicting adds resolve last-writer-wins on the
    // timestamp; an unknown VTEP is reported so the master can retry once
    // peer discovery converges.
    pub fn endpoint_add(&self, epreg: &Endpoint) -> Result<()> {
        debug!(
            "EndpointAdd for {} (originator {})",
            epreg.endpoint_id, epreg.originator_ip
        );
        let mut inner = self.inner.lock();

        if epreg.originator_ip == self.local_ip {
            return Ok(());
        }

        if let Some(old) = inner.endpoint_db.get(&epreg.endpoint_id) {
            if epreg.timestamp <= old.timestamp {
                // ours is at least as recent, nothing to do
                return Ok(());
            }
            let old = old.clone();
            if let Err(e) = inner.datapath.remove_endpoint(&old) {
                error!("error deleting old endpoint {}: {}", old.endpoint_id, e);
            }
            inner.endpoint_db.remove(&old.endpoint_id);
        }

        if !inner.vtep_table.contains_key(&epreg.originator_ip) {
            warn!(
                "could not find VTEP for endpoint {} from {}",
                epreg.endpoint_id, epreg.originator_ip
            );
            return Err(Error::VtepNotFound(epreg.originator_ip.to_string()));
        }

        inner.datapath.add_endpoint(epreg)?;
        inner
            .endpoint_db
            .insert(epreg.endpoint_id.clone(), epreg.clone());
        Ok(())
    }

    // Remote endpoint removal. Idempotent: duplicate deletes from
    // multiple masters are silent.
    pub fn endpoint_del(&self, epreg: &Endpoint) -> Result<()> {
        let mut inner = self.inner.lock();

        if epreg.originator_ip == self.local_ip {
            return Ok(());
        }
        if !inner.endpoint_db.contains_key(&epreg.endpoint_id) {
            return Ok(());
        }

        if let Err(e) = inner.datapath.remove_endpoint(epreg) {
            error!("error deleting endpoint {}: {}", epreg.endpoint_id, e);
        }
        inner.endpoint_db.remove(&epreg.endpoint_id);
        Ok(())
    }

    pub fn dummy_rpc(&self) -> Result<()> {
        info!("received dummy RPC call");
        Ok(())
    }

    pub fn add_rule(&self, rule: PolicyRule) -> Result<()> {
        self.inner.lock().datapath.policy().add_rule(rule)
    }

    pub fn del_rule(&self, rule_id: &str) -> Result<()> {
        self.inner.lock().datapath.policy().del_rule(rule_id)
    }

    pub fn endpoint_count(&self) -> usize {
        self.inner.lock().endpoint_db.len()
    }

    pub fn local_endpoint_count(&self) -> usize {
        self.inner.lock().local_endpoint_db.len()
    }

    pub fn get_endpoint(&self, ep_id: &str) -> Option<Endpoint> {
        self.inner.lock().endpoint_db.get(ep_id).cloned()
    }
}

impl AppInterface for OfnetAgent {
    fn switch_connected(&self, sw: &Arc<OfSwitch>) {
        info!("switch {:#x} connected", sw.dpid());
        let mut inner = self.inner.lock();
        inner.switch = Some(sw.clone());
        if let Err(e) = inner.datapath.switch_connected(sw) {
            error!("error initializing datapath tables: {}", e);
            return;
        }
        drop(inner);
        self.connected.store(true, Ordering::Relaxed);
    }

    fn switch_disconnected(&self, sw: &Arc<OfSwitch>) {
        info!("switch {:#x} disconnected", sw.dpid());
        let mut inner = self.inner.lock();
        inner.datapath.switch_disconnected(sw);
        inner.switch = None;
        drop(inner);
        self.connected.store(false, Ordering::Relaxed);
    }

    fn packet_rcvd(&self, sw: &Arc<OfSwitch>, pkt: PacketIn) {
        let mut inner = self.inner.lock();
        inner.datapath.packet_rcvd(sw, &pkt);
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VtepPortReq {
    port_no: u32,
    remote_ip: IpAddr,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VlanReq {
    vlan: u16,
    vni: u32,
}

// RPC façade for the `OfnetAgent` service.
struct AgentRpc {
    agent: Weak<OfnetAgent>,
}

impl AgentRpc {
    fn agent(&self) -> std::result::Result<Arc<OfnetAgent>, String> {
        self.agent
            .upgrade()
            .ok_or_else(|| "agent is shutting down".to_owned())
    }
}

fn rpc_result(result: Result<()>) -> std::result::Result<Value, String> {
    match result {
        Ok(()) => Ok(Value::Bool(true)),
        Err(e) => Err(e.to_string()),
    }
}

impl RpcService for AgentRpc {
    fn call(&self, method: &str, params: Value) -> std::result::Result<Value, String> {
        let agent = self.agent()?;
        let parse = |e: serde_json::Error| format!("bad params: {}", e);
        match method {
            "AddMaster" => {
                let node: HostNode = serde_json::from_value(params).map_err(parse)?;
                rpc_result(agent.add_master(&node))
            }
            "RemoveMaster" => {
                let node: HostNode = serde_json::from_value(params).map_err(parse)?;
                rpc_result(agent.remove_master(&node))
            }
            "EndpointAdd" => {
                let ep: Endpoint = serde_json::from_value(params).map_err(parse)?;
                rpc_result(agent.endpoint_add(&ep))
            }
            "EndpointDel" => {
                let ep: Endpoint = serde_json::from_value(params).map_err(parse)?;
                rpc_result(agent.endpoint_del(&ep))
            }
            "AddVtepPort" => {
                let req: VtepPortReq = serde_json::from_value(params).map_err(parse)?;
                rpc_result(agent.add_vtep_port(req.port_no, req.remote_ip))
            }
            "RemoveVtepPort" => {
                let req: VtepPortReq = serde_json::from_value(params).map_err(parse)?;
                rpc_result(agent.remove_vtep_port(req.port_no, req.remote_ip))
            }
            "AddVlan" => {
                let req: VlanReq = serde_json::from_value(params).map_err(parse)?;
                rpc_result(agent.add_vlan(req.vlan, req.vni))
            }
            "RemoveVlan" => {
                let req: VlanReq = serde_json::from_value(params).map_err(parse)?;
                rpc_result(agent.remove_vlan(req.vlan, req.vni))
            }
            "DummyRpc" => rpc_result(agent.dummy_rpc()),
            _ => Err(format!("unknown method: {}", method)),
        }
    }
}

// RPC façade for the `PolicyAgent` service.
struct PolicyRpc {
    agent: Weak<OfnetAgent>,
}

impl RpcService for PolicyRpc {
    fn call(&self, method: &str, params: Value) -> std::result::Result<Value, String> {
        let agent = self
            .agent
            .upgrade()
            .ok_or_else(|| "agent is shutting down".to_owned())?;
        let parse = |e: serde_json::Error| format!("bad params: {}", e);
        match method {
            "AddRule" => {
                let rule: PolicyRule = serde_json::from_value(params).map_err(parse)?;
                rpc_result(agent.add_rule(rule))
            }
            "DelRule" => {
                let rule: PolicyRule = serde_json::from_value(params).map_err(parse)?;
                rpc_result(agent.del_rule(&rule.rule_id))
            }
            _ => Err(format!("unknown method: {}", method)),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use parking_lot::Mutex as PlMutex;

    use super::*;
    use crate::openflow::RecordingProgrammer;
    use crate::utils::net::MacAddr;

    fn test_agent() -> (Arc<OfnetAgent>, Arc<RecordingProgrammer>) {
        let agent =
            OfnetAgent::new(DatapathKind::Vxlan, "192.168.2.10".parse().unwrap(), 0).unwrap();
        let prog = Arc::new(RecordingProgrammer::new());
        let sw = OfSwitch::new(1, prog.clone());
        agent.switch_connected(&sw);
        (agent, prog)
    }

    fn local_info(ip: &str, port: u32) -> EndpointInfo {
        EndpointInfo {
            port_no: port,
            endpoint_group: 1,
            mac_addr: "02:02:0a:01:01:01".parse::<MacAddr>().unwrap(),
            vlan: 10,
            ip_addr: ip.parse().unwrap(),
        }
    }

    fn remote_endpoint(ip: &str, originator: &str, ts_secs: i64) -> Endpoint {
        Endpoint {
            endpoint_id: ip.to_owned(),
            ip_addr: ip.parse().unwrap(),
            mac_addr: "02:02:0a:01:01:02".parse::<MacAddr>().unwrap(),
            vlan: 10,
            vni: 100,
            originator_ip: originator.parse().unwrap(),
            timestamp: Utc.timestamp_opt(ts_secs, 0).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn local_endpoint_round_trip() {
        let (agent, _) = test_agent();

        // vlan must be mapped first
        let err = agent.add_local_endpoint(local_info("10.1.1.1", 3));
        assert!(matches!(err, Err(Error::UnknownVlan(10))));

        agent.add_vlan(10, 100).unwrap();
        agent.add_local_endpoint(local_info("10.1.1.1", 3)).unwrap();
        assert_eq!(agent.endpoint_count(), 1);
        assert_eq!(agent.local_endpoint_count(), 1);
        let ep = agent.get_endpoint("10.1.1.1").unwrap();
        assert_eq!(ep.vni, 100);
        assert_eq!(ep.originator_ip, "192.168.2.10".parse::<IpAddr>().unwrap());
        assert_eq!(ep.port_no, 3);

        agent.remove_local_endpoint(3).unwrap();
        assert_eq!(agent.endpoint_count(), 0);
        assert_eq!(agent.local_endpoint_count(), 0);

        // removing again reports the missing endpoint
        assert!(matches!(
            agent.remove_local_endpoint(3),
            Err(Error::EndpointNotFound(_))
        ));
    }

    #[test]
    fn endpoint_add_echo_is_noop() {
        let (agent, prog) = test_agent();
        agent.add_vlan(10, 100).unwrap();
        let before = prog.mods().len();

        let echo = remote_endpoint("10.1.1.5", "192.168.2.10", 10);
        agent.endpoint_add(&echo).unwrap();
        assert_eq!(agent.endpoint_count(), 0);
        assert_eq!(prog.mods().len(), before);
    }

    #[test]
    fn endpoint_add_requires_vtep() {
        let (agent, _) = test_agent();
        agent.add_vlan(10, 100).unwrap();

        let ep = remote_endpoint("10.1.1.5", "192.168.2.11", 10);
        assert!(matches!(
            agent.endpoint_add(&ep),
            Err(Error::VtepNotFound(_))
        ));
        // nothing indexed, the master retry can succeed later
        assert_eq!(agent.endpoint_count(), 0);

        agent.add_vtep_port(20, "192.168.2.11".parse().unwrap()).unwrap();
        agent.endpoint_add(&ep).unwrap();
        assert_eq!(agent.endpoint_count(), 1);
    }

    #[test]
    fn endpoint_add_last_writer_wins() {
        let (agent, prog) = test_agent();
        agent.add_vlan(10, 100).unwrap();
        agent.add_vtep_port(20, "192.168.2.11".parse().unwrap()).unwrap();
        agent.add_vtep_port(21, "192.168.2.12".parse().unwrap()).unwrap();

        let newer = remote_endpoint("10.1.1.5", "192.168.2.11", 10);
        agent.endpoint_add(&newer).unwrap();
        let installed = prog.mods().len();

        // an older conflicting add leaves the newer endpoint untouched
        let older = remote_endpoint("10.1.1.5", "192.168.2.12", 5);
        agent.endpoint_add(&older).unwrap();
        assert_eq!(prog.mods().len(), installed);
        assert_eq!(
            agent.get_endpoint("10.1.1.5").unwrap().originator_ip,
            "192.168.2.11".parse::<IpAddr>().unwrap()
        );

        // a newer one replaces it
        let newest = remote_endpoint("10.1.1.5", "192.168.2.12", 20);
        agent.endpoint_add(&newest).unwrap();
        assert_eq!(
            agent.get_endpoint("10.1.1.5").unwrap().originator_ip,
            "192.168.2.12".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn endpoint_del_is_idempotent() {
        let (agent, _) = test_agent();
        agent.add_vlan(10, 100).unwrap();
        agent.add_vtep_port(20, "192.168.2.11".parse().unwrap()).unwrap();

        let ep = remote_endpoint("10.1.1.5", "192.168.2.11", 10);
        // unknown endpoint: silent
        agent.endpoint_del(&ep).unwrap();

        agent.endpoint_add(&ep).unwrap();
        agent.endpoint_del(&ep).unwrap();
        assert_eq!(agent.endpoint_count(), 0);
        agent.endpoint_del(&ep).unwrap();
    }

    #[test]
    fn remove_vtep_sweeps_its_endpoints() {
        let (agent, _) = test_agent();
        agent.add_vlan(10, 100).unwrap();
        agent.add_vtep_port(20, "192.168.2.11".parse().unwrap()).unwrap();
        agent.add_vtep_port(21, "192.168.2.12".parse().unwrap()).unwrap();

        agent
            .endpoint_add(&remote_endpoint("10.1.1.5", "192.168.2.11", 10))
            .unwrap();
        agent
            .endpoint_add(&remote_endpoint("10.1.1.6", "192.168.2.11", 10))
            .unwrap();
        agent
            .endpoint_add(&remote_endpoint("10.1.1.7", "192.168.2.12", 10))
            .unwrap();
        assert_eq!(agent.endpoint_count(), 3);

        agent
            .remove_vtep_port(20, "192.168.2.11".parse().unwrap())
            .unwrap();
        assert_eq!(agent.endpoint_count(), 1);
        assert!(agent.get_endpoint("10.1.1.7").is_some());
    }

    #[test]
    #[should_panic(expected = "still has endpoints")]
    fn remove_vlan_with_endpoints_aborts() {
        let (agent, _) = test_agent();
        agent.add_vlan(10, 100).unwrap();
        agent.add_vtep_port(20, "192.168.2.11".parse().unwrap()).unwrap();
        agent
            .endpoint_add(&remote_endpoint("10.1.1.5", "192.168.2.11", 10))
            .unwrap();
        let _ = agent.remove_vlan(10, 100);
    }

    // Records calls made to a fake master.
    #[derive(Default)]
    struct FakeMaster {
        calls: PlMutex<Vec<(String, Value)>>,
    }

    impl RpcService for FakeMaster {
        fn call(&self, method: &str, params: Value) -> std::result::Result<Value, String> {
            self.calls.lock().push((method.to_owned(), params));
            Ok(Value::Bool(true))
        }
    }

    fn fake_master() -> (RpcServer, Arc<FakeMaster>) {
        let server = RpcServer::new(0).unwrap();
        let master = Arc::new(FakeMaster::default());
        server.register("OfnetMaster", master.clone());
        (server, master)
    }

    fn endpoint_adds(master: &FakeMaster) -> Vec<Value> {
        master
            .calls
            .lock()
            .iter()
            .filter(|(m, _)| m == "EndpointAdd")
            .map(|(_, p)| p.clone())
            .collect()
    }

    #[test]
    fn two_master_gossip() {
        let (agent, _) = test_agent();
        agent.add_vlan(10, 100).unwrap();

        let (srv1, m1) = fake_master();
        let (srv2, m2) = fake_master();

        agent
            .add_master(&HostNode::new("127.0.0.1", srv1.port()))
            .unwrap();
        assert_eq!(agent.master_count(), 1);
        // registration carries our RPC address
        {
            let calls = m1.calls.lock();
            assert_eq!(calls[0].0, "RegisterNode");
            assert_eq!(calls[0].1["HostPort"], agent.my_port());
        }

        agent
            .add_master(&HostNode::new("127.0.0.1", srv2.port()))
            .unwrap();

        agent.add_local_endpoint(local_info("10.1.1.1", 3)).unwrap();

        // both masters got the endpoint exactly once
        assert_eq!(endpoint_adds(&m1).len(), 1);
        assert_eq!(endpoint_adds(&m2).len(), 1);
        assert_eq!(endpoint_adds(&m1)[0]["EndpointID"], "10.1.1.1");

        // a master added after the endpoint gets it during add_master
        let (srv3, m3) = fake_master();
        agent
            .add_master(&HostNode::new("127.0.0.1", srv3.port()))
            .unwrap();
        assert_eq!(endpoint_adds(&m3).len(), 1);

        // removal notifies the masters that are still around
        agent
            .remove_master(&HostNode::new("127.0.0.1", srv2.port()))
            .unwrap();
        agent.remove_local_endpoint(3).unwrap();
        assert_eq!(
            m1.calls
                .lock()
                .iter()
                .filter(|(m, _)| m == "EndpointDel")
                .count(),
            1
        );
        assert_eq!(
            m2.calls
                .lock()
                .iter()
                .filter(|(m, _)| m == "EndpointDel")
                .count(),
            0
        );

        srv1.stop();
        srv2.stop();
        srv3.stop();
        agent.delete();
    }

    #[test]
    fn add_remove_add_master_reannounces_once() {
        let (agent, _) = test_agent();
        agent.add_vlan(10, 100).unwrap();
        agent.add_local_endpoint(local_info("10.1.1.1", 3)).unwrap();

        let (srv, master) = fake_master();
        let node = HostNode::new("127.0.0.1", srv.port());

        agent.add_master(&node).unwrap();
        agent.remove_master(&node).unwrap();
        agent.add_master(&node).unwrap();

        // one announce per add_master, none in between
        assert_eq!(endpoint_adds(&master).len(), 2);
        srv.stop();
        agent.delete();
    }
}
