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

// Group-based security rules, compiled into the policy table.
//
// Metadata format between tables:
//
//	 6             3 3             1 1             0 0
//	 3             1 0             6 5             1 0
//	+-------------+-+---------------+---------------+-+
//	|    ....U    |U|    SrcGrp     |    DstGrp     |V|
//	+-------------+-+---------------+---------------+-+
//
//	U: unused
//	SrcGrp: source endpoint group
//	DstGrp: destination endpoint group
//	V: received on a VTEP port, don't flood back into tunnels

use std::sync::Arc;

use ahash::AHashMap;
use bitflags::bitflags;
use ipnet::Ipv4Net;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::common::{
    Endpoint, EndpointId, DST_GRP_TBL_ID, FLOW_MATCH_PRIORITY, FLOW_MISS_PRIORITY,
    FLOW_POLICY_PRIORITY_OFFSET, POLICY_TBL_ID,
};
use crate::error::{Error, Result};
use crate::openflow::{
    Flow, FlowMatch, FlowTarget, OfSwitch, Table, ETH_TYPE_IP, IP_PROTO_TCP,
};

bitflags! {
    struct TcpFlags: u16 {
        const SYN = 0x02;
        const ACK = 0x10;
    }
}

const DST_GRP_METADATA_MASK: u64 = 0xfffe;
const SRC_GRP_METADATA_MASK: u64 = 0x7fff_0000;

// Metadata value and mask matching the destination endpoint group.
pub fn dst_group_metadata(group: i32) -> (u64, u64) {
    (((group as u64) << 1) & DST_GRP_METADATA_MASK, DST_GRP_METADATA_MASK)
}

// Metadata value and mask matching the source endpoint group.
pub fn src_group_metadata(group: i32) -> (u64, u64) {
    (((group as u64) << 16) & SRC_GRP_METADATA_MASK, SRC_GRP_METADATA_MASK)
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    #[default]
    Accept,
    Deny,
}

// One group-based security rule. IP addresses are CIDR strings; empty
// fields are wildcards; group 0 means any group.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyRule {
    pub rule_id: String,
    pub priority: u16,
    #[serde(default)]
    pub src_endpoint_group: i32,
    #[serde(default)]
    pub dst_endpoint_group: i32,
    #[serde(default)]
    pub src_ip_addr: String,
    #[serde(default)]
    pub dst_ip_addr: String,
    #[serde(default)]
    pub ip_protocol: u8,
    #[serde(default)]
    pub src_port: u16,
    #[serde(default)]
    pub dst_port: u16,
    #[serde(default)]
    pub tcp_flags: String,
    pub action: RuleAction,
}

struct RuleEntry {
    rule: PolicyRule,
    flow: Flow,
}

// Owns the destination-group classification table and the policy rule
// table. All mutation happens under the owning agent's lock.
pub struct PolicyAgent {
    switch: Option<Arc<OfSwitch>>,
    dst_grp_table: Option<Table>,
    policy_table: Option<Table>,
    next_table: Option<Table>,
    // one compiled flow per rule id
    rules: AHashMap<String, RuleEntry>,
    // dst group classification flows, per endpoint
    dst_grp_flows: AHashMap<EndpointId, Flow>,
    // table miss flows, held so they stay alive with the pipeline
    miss_flows: Vec<Flow>,
}

impl PolicyAgent {
    pub fn new() -> PolicyAgent {
        PolicyAgent {
            switch: None,
            dst_grp_table: None,
            policy_table: None,
            next_table: None,
            rules: AHashMap::new(),
            dst_grp_flows: AHashMap::new(),
            miss_flows: Vec::new(),
        }
    }

    pub fn switch_connected(&mut self, sw: &Arc<OfSwitch>) {
        self.switch = Some(sw.clone());
    }

    // Compiled flows died with the switch connection; the masters re-push
    // endpoints and rules after reconnect.
    pub fn switch_disconnected(&mut self) {
        self.switch = None;
        self.dst_grp_table = None;
        self.policy_table = None;
        self.next_table = None;
        self.rules.clear();
        self.dst_grp_flows.clear();
        self.miss_flows.clear();
    }

    // Creates the dst-group and policy tables and their miss flows. Missing
    // `next_tbl_id` means the datapath wired the pipeline wrong, which is
    // unrecoverable.
    pub fn init_tables(&mut self, next_tbl_id: u8) -> Result<()> {
        let sw = self.switch.as_ref().ok_or(Error::SwitchNotConnected)?;

        let next_table = match sw.get_table(next_tbl_id) {
            Some(t) => t,
            None => panic!("policy init: next table {} does not exist", next_tbl_id),
        };
        let dst_grp_table = sw.new_table(DST_GRP_TBL_ID);
        let policy_table = sw.new_table(POLICY_TBL_ID);

        // packets that miss dst group lookup still traverse policy
        let mut miss = dst_grp_table.new_flow(FlowMatch {
            priority: FLOW_MISS_PRIORITY,
            ..Default::default()
        });
        miss.install(FlowTarget::Table(POLICY_TBL_ID))?;
        self.miss_flows.push(miss);

        // packets that match no rule continue down the pipeline
        let mut miss = policy_table.new_flow(FlowMatch {
            priority: FLOW_MISS_PRIORITY,
            ..Default::default()
        });
        miss.install(FlowTarget::Table(next_tbl_id))?;
        self.miss_flows.push(miss);

        self.dst_grp_table = Some(dst_grp_table);
        self.policy_table = Some(policy_table);
        self.next_table = Some(next_table);
        Ok(())
    }

    // Classifies traffic towards `endpoint`: match its IP, stamp the dst
    // group metadata, continue to the policy table.
    pub fn add_endpoint(&mut self, endpoint: &Endpoint) -> Result<()> {
        if self.dst_grp_flows.contains_key(&endpoint.endpoint_id) {
            warn!(
                "dst group flow for endpoint {} already exists",
                endpoint.endpoint_id
            );
            return Ok(());
        }
        let table = self
            .dst_grp_table
            .as_ref()
            .ok_or(Error::SwitchNotConnected)?;

        let ip_da = match endpoint.ip_addr {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(_) => {
                return Err(Error::ParseAddrFailed(endpoint.ip_addr.to_string()))
            }
        };
        let mut flow = table.new_flow(FlowMatch {
            priority: FLOW_MATCH_PRIORITY,
            ethertype: Some(ETH_TYPE_IP),
            ip_da: Some(ip_da),
            ..Default::default()
        });
        let (metadata, mask) = dst_group_metadata(endpoint.endpoint_group);
        flow.set_metadata(metadata, mask);
        flow.install(FlowTarget::Table(POLICY_TBL_ID))?;

        self.dst_grp_flows.insert(endpoint.endpoint_id.clone(), flow);
        Ok(())
    }

    pub fn del_endpoint(&mut self, endpoint: &Endpoint) -> Result<()> {
        let mut flow = self
            .dst_grp_flows
            .remove(&endpoint.endpoint_id)
            .ok_or_else(|| Error::EndpointNotFound(endpoint.endpoint_id.clone()))?;
        flow.delete()?;
        Ok(())
    }

    // Compiles `rule` into a single policy table flow. Identical
    // re-submission is a no-op; re-submission with different content is
    // refused so reconcilers have to delete first.
    pub fn add_rule(&mut self, rule: PolicyRule) -> Result<()> {
        if let Some(existing) = self.rules.get(&rule.rule_id) {
            if existing.rule == rule {
                return Ok(());
            }
            warn!(
                "rule conflict: new {:?} vs installed {:?}",
                rule, existing.rule
            );
            return Err(Error::RuleConflict(rule.rule_id));
        }

        let policy_table = self
            .policy_table
            .as_ref()
            .ok_or(Error::SwitchNotConnected)?;
        let next_tbl_id = self.next_table.as_ref().unwrap().id();

        info!("adding rule: {:?}", rule);

        let mut fmatch = FlowMatch {
            priority: FLOW_POLICY_PRIORITY_OFFSET + rule.priority,
            ethertype: Some(ETH_TYPE_IP),
            ..Default::default()
        };

        if !rule.dst_ip_addr.is_empty() {
            let net: Ipv4Net = rule
                .dst_ip_addr
                .parse()
                .map_err(|_| Error::ParseAddrFailed(rule.dst_ip_addr.clone()))?;
            fmatch.ip_da = Some(net.addr());
            fmatch.ip_da_mask = Some(net.netmask());
        }
        if !rule.src_ip_addr.is_empty() {
            let net: Ipv4Net = rule
                .src_ip_addr
                .parse()
                .map_err(|_| Error::ParseAddrFailed(rule.src_ip_addr.clone()))?;
            fmatch.ip_sa = Some(net.addr());
            fmatch.ip_sa_mask = Some(net.netmask());
        }

        if rule.src_endpoint_group != 0 && rule.dst_endpoint_group != 0 {
            let (src_metadata, src_mask) = src_group_metadata(rule.src_endpoint_group);
            let (dst_metadata, dst_mask) = dst_group_metadata(rule.dst_endpoint_group);
            fmatch.metadata = Some(src_metadata | dst_metadata);
            fmatch.metadata_mask = Some(src_mask | dst_mask);
        } else if rule.src_endpoint_group != 0 {
            let (metadata, mask) = src_group_metadata(rule.src_endpoint_group);
            fmatch.metadata = Some(metadata);
            fmatch.metadata_mask = Some(mask);
        } else if rule.dst_endpoint_group != 0 {
            let (metadata, mask) = dst_group_metadata(rule.dst_endpoint_group);
            fmatch.metadata = Some(metadata);
            fmatch.metadata_mask = Some(mask);
        }

        if rule.ip_protocol != 0 {
            fmatch.ip_proto = Some(rule.ip_protocol);
        }
        // ports arm both protocols, ip_proto picks at match time
        if rule.src_port != 0 {
            fmatch.tcp_src_port = Some(rule.src_port);
            fmatch.udp_src_port = Some(rule.src_port);
        }
        if rule.dst_port != 0 {
            fmatch.tcp_dst_port = Some(rule.dst_port);
            fmatch.udp_dst_port = Some(rule.dst_port);
        }

        if rule.ip_protocol == IP_PROTO_TCP && !rule.tcp_flags.is_empty() {
            let (flags, mask) = parse_tcp_flags(&rule.tcp_flags)?;
            fmatch.tcp_flags = Some(flags);
            fmatch.tcp_flags_mask = Some(mask);
        }

        let mut flow = policy_table.new_flow(fmatch);
        let target = match rule.action {
            RuleAction::Accept => FlowTarget::Table(next_tbl_id),
            RuleAction::Deny => FlowTarget::Drop,
        };
        flow.install(target)?;

        self.rules.insert(rule.rule_id.clone(), RuleEntry { rule, flow });
        Ok(())
    }

    pub fn del_rule(&mut self, rule_id: &str) -> Result<()> {
        let mut entry = self
            .rules
            .remove(rule_id)
            .ok_or_else(|| Error::RuleNotFound(rule_id.to_owned()))?;
        entry.flow.delete()?;
        Ok(())
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn dst_flow_count(&self) -> usize {
        self.dst_grp_flows.len()
    }
}

impl Default for PolicyAgent {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_tcp_flags(spec: &str) -> Result<(u16, u16)> {
    let (flags, mask) = match spec {
        "syn" => (TcpFlags::SYN, TcpFlags::SYN),
        "syn,ack" => (TcpFlags::SYN | TcpFlags::ACK, TcpFlags::SYN | TcpFlags::ACK),
        "ack" => (TcpFlags::ACK, TcpFlags::ACK),
        "syn,!ack" => (TcpFlags::SYN, TcpFlags::SYN | TcpFlags::ACK),
        "!syn,ack" => (TcpFlags::ACK, TcpFlags::SYN | TcpFlags::ACK),
        _ => return Err(Error::UnknownTcpFlag(spec.to_owned())),
    };
    Ok((flags.bits(), mask.bits()))
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::openflow::RecordingProgrammer;

    fn connected_agent() -> (PolicyAgent, Arc<RecordingProgrammer>, Arc<OfSwitch>) {
        let prog = Arc::new(RecordingProgrammer::new());
        let sw = OfSwitch::new(1, prog.clone());
        sw.new_table(crate::common::MAC_DEST_TBL_ID);
        let mut agent = PolicyAgent::new();
        agent.switch_connected(&sw);
        agent.init_tables(crate::common::MAC_DEST_TBL_ID).unwrap();
        (agent, prog, sw)
    }

    fn endpoint(ip: &str, group: i32) -> Endpoint {
        Endpoint {
            endpoint_id: ip.to_owned(),
            endpoint_group: group,
            ip_addr: ip.parse::<IpAddr>().unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn metadata_layout() {
        assert_eq!(dst_group_metadata(42), (0x54, 0xfffe));
        assert_eq!(src_group_metadata(42), (42 << 16, 0x7fff_0000));
        // 15-bit fields saturate into their masks
        assert_eq!(dst_group_metadata(0x7fff), (0xfffe, 0xfffe));
        assert_eq!(src_group_metadata(0x7fff), (0x7fff_0000, 0x7fff_0000));
    }

    #[test]
    fn init_tables_installs_miss_flows() {
        let (_, prog, _) = connected_agent();
        let dst_miss = prog.live_in_table(DST_GRP_TBL_ID);
        assert_eq!(dst_miss.len(), 1);
        assert_eq!(dst_miss[0].fmatch.priority, FLOW_MISS_PRIORITY);
        assert_eq!(dst_miss[0].next, Some(FlowTarget::Table(POLICY_TBL_ID)));

        let policy_miss = prog.live_in_table(POLICY_TBL_ID);
        assert_eq!(policy_miss.len(), 1);
        assert_eq!(
            policy_miss[0].next,
            Some(FlowTarget::Table(crate::common::MAC_DEST_TBL_ID))
        );
    }

    #[test]
    fn compile_deny_rule() {
        let (mut agent, prog, _) = connected_agent();
        agent
            .add_rule(PolicyRule {
                rule_id: "rule-1".to_owned(),
                priority: 7,
                src_ip_addr: "10.0.0.0/24".to_owned(),
                dst_endpoint_group: 42,
                action: RuleAction::Deny,
                ..Default::default()
            })
            .unwrap();

        let flows = prog.live_in_table(POLICY_TBL_ID);
        // miss flow plus the compiled rule
        let rule_flow = flows
            .iter()
            .find(|f| f.fmatch.priority != FLOW_MISS_PRIORITY)
            .unwrap();
        assert_eq!(rule_flow.fmatch.priority, FLOW_POLICY_PRIORITY_OFFSET + 7);
        assert_eq!(rule_flow.fmatch.ip_sa, Some(Ipv4Addr::new(10, 0, 0, 0)));
        assert_eq!(
            rule_flow.fmatch.ip_sa_mask,
            Some(Ipv4Addr::new(255, 255, 255, 0))
        );
        assert_eq!(rule_flow.fmatch.metadata, Some(0x54));
        assert_eq!(rule_flow.fmatch.metadata_mask, Some(0xfffe));
        assert_eq!(rule_flow.next, Some(FlowTarget::Drop));
    }

    #[test]
    fn rule_resubmission() {
        let (mut agent, prog, _) = connected_agent();
        let rule = PolicyRule {
            rule_id: "rule-1".to_owned(),
            priority: 1,
            src_endpoint_group: 10,
            action: RuleAction::Accept,
            ..Default::default()
        };
        agent.add_rule(rule.clone()).unwrap();
        let installed = prog.mods().len();

        // identical rule: no-op
        agent.add_rule(rule.clone()).unwrap();
        assert_eq!(prog.mods().len(), installed);
        assert_eq!(agent.rule_count(), 1);

        // same id, different content: conflict
        let mut changed = rule.clone();
        changed.priority = 2;
        match agent.add_rule(changed) {
            Err(Error::RuleConflict(id)) => assert_eq!(id, "rule-1"),
            other => panic!("unexpected: {:?}", other),
        }

        // delete then re-add with new content succeeds
        agent.del_rule("rule-1").unwrap();
        let mut changed = rule;
        changed.priority = 2;
        agent.add_rule(changed).unwrap();
        assert_eq!(agent.rule_count(), 1);
    }

    #[test]
    fn tcp_flag_compilation() {
        let (mut agent, prog, _) = connected_agent();
        for (i, (spec, flags, mask)) in [
            ("syn", 0x02u16, 0x02u16),
            ("ack", 0x10, 0x10),
            ("syn,ack", 0x12, 0x12),
            ("syn,!ack", 0x02, 0x12),
            ("!syn,ack", 0x10, 0x12),
        ]
        .iter()
        .enumerate()
        {
            agent
                .add_rule(PolicyRule {
                    rule_id: format!("rule-{}", i),
                    priority: i as u16,
                    ip_protocol: 6,
                    tcp_flags: spec.to_string(),
                    action: RuleAction::Accept,
                    ..Default::default()
                })
                .unwrap();
            let flows = prog.live_in_table(POLICY_TBL_ID);
            let flow = flows
                .iter()
                .find(|f| f.fmatch.priority == FLOW_POLICY_PRIORITY_OFFSET + i as u16)
                .unwrap();
            assert_eq!(flow.fmatch.tcp_flags, Some(*flags), "spec {}", spec);
            assert_eq!(flow.fmatch.tcp_flags_mask, Some(*mask), "spec {}", spec);
        }

        match agent.add_rule(PolicyRule {
            rule_id: "bad".to_owned(),
            ip_protocol: 6,
            tcp_flags: "fin".to_owned(),
            action: RuleAction::Deny,
            ..Default::default()
        }) {
            Err(Error::UnknownTcpFlag(spec)) => assert_eq!(spec, "fin"),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(agent.rule_count(), 5);
    }

    #[test]
    fn ports_arm_both_protocols() {
        let (mut agent, prog, _) = connected_agent();
        agent
            .add_rule(PolicyRule {
                rule_id: "rule-1".to_owned(),
                priority: 1,
                ip_protocol: 17,
                dst_port: 53,
                action: RuleAction::Accept,
                ..Default::default()
            })
            .unwrap();
        let flows = prog.live_in_table(POLICY_TBL_ID);
        let flow = flows
            .iter()
            .find(|f| f.fmatch.priority != FLOW_MISS_PRIORITY)
            .unwrap();
        assert_eq!(flow.fmatch.tcp_dst_port, Some(53));
        assert_eq!(flow.fmatch.udp_dst_port, Some(53));
        assert_eq!(flow.fmatch.ip_proto, Some(17));
    }

    #[test]
    fn endpoint_classification() {
        let (mut agent, prog, _) = connected_agent();
        let ep = endpoint("10.2.2.2", 7);
        agent.add_endpoint(&ep).unwrap();

        let flows = prog.live_in_table(DST_GRP_TBL_ID);
        let class = flows
            .iter()
            .find(|f| f.fmatch.priority == FLOW_MATCH_PRIORITY)
            .unwrap();
        assert_eq!(class.fmatch.ip_da, Some(Ipv4Addr::new(10, 2, 2, 2)));
        let (md, mask) = dst_group_metadata(7);
        assert!(class
            .actions
            .iter()
            .any(|a| *a == crate::openflow::FlowAction::SetMetadata { value: md, mask }));
        assert_eq!(class.next, Some(FlowTarget::Table(POLICY_TBL_ID)));

        // duplicate add is tolerated, delete removes, second delete errors
        agent.add_endpoint(&ep).unwrap();
        assert_eq!(agent.dst_flow_count(), 1);
        agent.del_endpoint(&ep).unwrap();
        assert!(matches!(
            agent.del_endpoint(&ep),
            Err(Error::EndpointNotFound(_))
        ));
        assert_eq!(
            prog.live_in_table(DST_GRP_TBL_ID)
                .iter()
                .filter(|f| f.fmatch.priority == FLOW_MATCH_PRIORITY)
                .count(),
            0
        );
    }
}
