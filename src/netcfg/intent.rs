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

// Tenant intent: the declarative form networks and endpoints are submitted
// in. Applying intent allocates packet tags and subnets and materializes
// the `nets/` and `eps/` state the agents consume.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use super::{EndpointState, NetworkState, PktTagType, TENANT_PREFIX};
use crate::error::{Error, Result};
use crate::state::StateDriver;

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "PascalCase")]
pub struct TenantCfg {
    pub name: String,
    #[serde(default)]
    pub default_net_type: Option<PktTagType>,
    #[serde(default)]
    pub subnet_pool: String,
    #[serde(default)]
    pub alloc_subnet_len: u8,
    #[serde(default, rename = "Vlans")]
    pub vlans: String,
    #[serde(default, rename = "Vxlans")]
    pub vxlans: String,
    #[serde(default)]
    pub networks: Vec<NetworkCfg>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkCfg {
    pub name: String,
    #[serde(default)]
    pub pkt_tag: Option<u32>,
    #[serde(default)]
    pub pkt_tag_type: Option<PktTagType>,
    #[serde(default)]
    pub endpoints: Vec<EndpointCfg>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointCfg {
    pub container: String,
    #[serde(default)]
    pub host: String,
}

// An inclusive numeric tag range in its `"lo-hi"` submission form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagRange {
    pub min: u32,
    pub max: u32,
}

impl TagRange {
    pub fn parse(s: &str) -> Result<TagRange> {
        let parse_err = || Error::InvalidConfig(format!("invalid tag range: {}", s));
        let (lo, hi) = s.split_once('-').ok_or_else(parse_err)?;
        let min = lo.trim().parse().map_err(|_| parse_err())?;
        let max = hi.trim().parse().map_err(|_| parse_err())?;
        if min > max {
            return Err(parse_err());
        }
        Ok(TagRange { min, max })
    }

    pub fn contains(&self, tag: u32) -> bool {
        tag >= self.min && tag <= self.max
    }
}

impl TenantCfg {
    pub fn state_key(name: &str) -> String {
        format!("{}{}", TENANT_PREFIX, name)
    }

    fn net_type(&self, net: &NetworkCfg) -> PktTagType {
        net.pkt_tag_type
            .or(self.default_net_type)
            .unwrap_or_default()
    }

    fn tag_range(&self, kind: PktTagType) -> Result<(TagRange, &str)> {
        let raw = match kind {
            PktTagType::Vlan => &self.vlans,
            PktTagType::Vxlan => &self.vxlans,
        };
        if raw.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "tenant {} has no {:?} range configured",
                self.name, kind
            )));
        }
        Ok((TagRange::parse(raw)?, raw.as_str()))
    }
}

// Records the tenant intent so later binding submissions can resolve
// container membership.
pub fn create_tenant(driver: &dyn StateDriver, tenant: &TenantCfg) -> Result<()> {
    if tenant.name.is_empty() {
        return Err(Error::InvalidConfig("tenant name is empty".to_owned()));
    }
    driver.write(
        &TenantCfg::state_key(&tenant.name),
        &serde_json::to_vec(tenant)?,
    )
}

// Materializes `nets/` state for each of the tenant's networks, drawing
// packet tags from the tenant range. An explicit tag outside the range is
// rejected.
pub fn create_networks(driver: &dyn StateDriver, tenant: &TenantCfg) -> Result<()> {
    let pool: Option<Ipv4Net> = tenant.subnet_pool.parse().ok();

    // explicit tags claim their slot before auto allocation starts
    let mut used: Vec<u32> = tenant.networks.iter().filter_map(|n| n.pkt_tag).collect();

    for (idx, net) in tenant.networks.iter().enumerate() {
        let kind = tenant.net_type(net);
        let (range, range_str) = tenant.tag_range(kind)?;

        let tag = match net.pkt_tag {
            Some(tag) => {
                if !range.contains(tag) {
                    let kind_str = match kind {
                        PktTagType::Vlan => "vlan",
                        PktTagType::Vxlan => "vxlan",
                    };
                    return Err(Error::InvalidConfig(format!(
                        "{} {} does not adhere to tenant's {} range {}",
                        kind_str, tag, kind_str, range_str
                    )));
                }
                tag
            }
            None => {
                let tag = (range.min..=range.max)
                    .find(|t| !used.contains(t))
                    .ok_or_else(|| {
                        Error::InvalidConfig(format!(
                            "tenant {} {:?} range {} exhausted",
                            tenant.name, kind, range_str
                        ))
                    })?;
                used.push(tag);
                tag
            }
        };

        let (subnet_ip, subnet_len) = match pool {
            Some(pool) if tenant.alloc_subnet_len >= pool.prefix_len() => {
                let step = 1u32 << (32 - tenant.alloc_subnet_len);
                let base = u32::from(pool.network()) + idx as u32 * step;
                (
                    std::net::Ipv4Addr::from(base).to_string(),
                    tenant.alloc_subnet_len,
                )
            }
            _ => (String::new(), 0),
        };

        let state = NetworkState {
            id: net.name.clone(),
            tenant: tenant.name.clone(),
            pkt_tag_type: kind,
            pkt_tag: tag,
            ext_pkt_tag: if kind == PktTagType::Vxlan { tag } else { 0 },
            subnet_ip,
            subnet_len,
            default_gw: String::new(),
            ep_alloc_cursor: 0,
        };
        state.write(driver)?;
    }
    Ok(())
}

// Materializes `eps/` state. Endpoints of vxlan networks without a homing
// host stay unmaterialized until a binding supplies one.
pub fn create_endpoints(driver: &dyn StateDriver, tenant: &TenantCfg) -> Result<()> {
    for net in tenant.networks.iter() {
        let kind = tenant.net_type(net);
        for ep in net.endpoints.iter() {
            if kind == PktTagType::Vxlan && ep.host.is_empty() {
                continue;
            }
            materialize_endpoint(driver, &net.name, &ep.container, &ep.host)?;
        }
    }
    Ok(())
}

// Late host binding: resolves each container through the stored tenant
// intent and materializes (or re-homes) its endpoint state.
pub fn create_ep_bindings(driver: &dyn StateDriver, bindings: &[EndpointCfg]) -> Result<()> {
    let tenants: Vec<TenantCfg> = driver
        .read_all(TENANT_PREFIX)?
        .into_iter()
        .filter_map(|item| serde_json::from_slice(&item.value).ok())
        .collect();

    for binding in bindings.iter() {
        let net = tenants
            .iter()
            .flat_map(|t| t.networks.iter())
            .find(|n| n.endpoints.iter().any(|e| e.container == binding.container))
            .ok_or_else(|| Error::EndpointNotFound(binding.container.clone()))?;
        materialize_endpoint(driver, &net.name, &binding.container, &binding.host)?;
    }
    Ok(())
}

fn materialize_endpoint(
    driver: &dyn StateDriver,
    net_id: &str,
    container: &str,
    host: &str,
) -> Result<()> {
    let ep_id = EndpointState::ep_id(net_id, container);

    // re-homing an existing endpoint only updates the host
    if let Ok(mut existing) = EndpointState::read(driver, &ep_id) {
        existing.homing_host = host.to_owned();
        return existing.write(driver);
    }

    let mut net = NetworkState::read(driver, net_id)?;
    let (ip, mac) = if net.subnet_ip.is_empty() {
        (String::new(), String::new())
    } else {
        let ip = net.alloc_ip()?;
        (ip.to_string(), super::mac_for_ip(ip).to_string())
    };
    // persist the moved allocation cursor
    net.write(driver)?;

    let state = EndpointState {
        id: ep_id,
        net_id: net_id.to_owned(),
        container: container.to_owned(),
        homing_host: host.to_owned(),
        vtep_ip: String::new(),
        ip_address: ip,
        mac_address: mac,
        int_pkt_tag: net.pkt_tag,
    };
    state.write(driver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemStateDriver;

    fn apply(driver: &MemStateDriver, cfg: &str) -> Result<()> {
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Intent {
            tenants: Vec<TenantCfg>,
        }
        let intent: Intent = serde_json::from_str(cfg).unwrap();
        for tenant in intent.tenants.iter() {
            create_tenant(driver, tenant)?;
            create_networks(driver, tenant)?;
            create_endpoints(driver, tenant)?;
        }
        Ok(())
    }

    fn verify_keys(driver: &MemStateDriver, keys: &[&str]) {
        let state_keys = driver.keys();
        for key in keys {
            assert!(
                state_keys.iter().any(|k| k.contains(key)),
                "key '{}' was not populated, have {:?}",
                key,
                state_keys
            );
        }
    }

    fn verify_keys_do_not_exist(driver: &MemStateDriver, keys: &[&str]) {
        let state_keys = driver.keys();
        for key in keys {
            assert!(
                !state_keys.iter().any(|k| k.contains(key)),
                "key '{}' was populated",
                key
            );
        }
    }

    #[test]
    fn vlan_config() {
        let driver = MemStateDriver::new();
        apply(
            &driver,
            r#"{
            "Tenants" : [{
                "Name"           : "tenant-one",
                "DefaultNetType" : "vlan",
                "SubnetPool"     : "11.1.0.0/16",
                "AllocSubnetLen" : 24,
                "Vlans"          : "11-28",
                "Networks" : [{
                    "Name" : "orange",
                    "Endpoints" : [
                        { "Container" : "myContainer1" },
                        { "Container" : "myContainer2" }
                    ]
                },
                {
                    "Name" : "purple",
                    "Endpoints" : [
                        { "Container" : "myContainer3" },
                        { "Container" : "myContainer4" }
                    ]
                }]
            }]}"#,
        )
        .unwrap();

        verify_keys(
            &driver,
            &[
                "tenant-one",
                "nets/orange",
                "nets/purple",
                "myContainer1",
                "myContainer2",
                "myContainer3",
                "myContainer4",
            ],
        );

        // vlan tags drawn from the tenant range in order
        let orange = NetworkState::read(&driver, "orange").unwrap();
        assert_eq!(orange.pkt_tag, 11);
        assert_eq!(orange.pkt_tag_type, PktTagType::Vlan);
        let purple = NetworkState::read(&driver, "purple").unwrap();
        assert_eq!(purple.pkt_tag, 12);

        // addressing carved from the subnet pool
        let ep = EndpointState::read(&driver, "orange-myContainer1").unwrap();
        assert_eq!(ep.ip_address, "11.1.0.1");
        assert_eq!(ep.mac_address, "02:02:0b:01:00:01");
    }

    #[test]
    fn vxlan_config_with_late_host_bindings() {
        let driver = MemStateDriver::new();
        apply(
            &driver,
            r#"{
            "Tenants" : [{
                "Name"           : "tenant-one",
                "DefaultNetType" : "vxlan",
                "SubnetPool"     : "11.1.0.0/16",
                "AllocSubnetLen" : 24,
                "Vxlans"         : "10001-14000",
                "Networks" : [{
                    "Name" : "orange",
                    "Endpoints" : [
                        { "Container" : "myContainer1" },
                        { "Container" : "myContainer3" }
                    ]
                },
                {
                    "Name" : "purple",
                    "Endpoints" : [
                        { "Container" : "myContainer2" },
                        { "Container" : "myContainer4" }
                    ]
                }]
            }]}"#,
        )
        .unwrap();

        verify_keys(&driver, &["tenant-one", "nets/orange", "nets/purple"]);
        verify_keys_do_not_exist(
            &driver,
            &[
                "myContainer1",
                "myContainer2",
                "myContainer3",
                "myContainer4",
            ],
        );

        let bindings = vec![
            EndpointCfg {
                container: "myContainer1".to_owned(),
                host: "host1".to_owned(),
            },
            EndpointCfg {
                container: "myContainer2".to_owned(),
                host: "host1".to_owned(),
            },
            EndpointCfg {
                container: "myContainer3".to_owned(),
                host: "host2".to_owned(),
            },
            EndpointCfg {
                container: "myContainer4".to_owned(),
                host: "host2".to_owned(),
            },
        ];
        create_ep_bindings(&driver, &bindings).unwrap();

        verify_keys(
            &driver,
            &[
                "myContainer1",
                "myContainer2",
                "myContainer3",
                "myContainer4",
            ],
        );
        let ep = EndpointState::read(&driver, "orange-myContainer3").unwrap();
        assert_eq!(ep.homing_host, "host2");
    }

    #[test]
    fn vxlan_config_with_hosts_materializes_endpoints() {
        let driver = MemStateDriver::new();
        apply(
            &driver,
            r#"{
            "Tenants" : [{
                "Name"           : "tenant-one",
                "DefaultNetType" : "vxlan",
                "SubnetPool"     : "11.1.0.0/16",
                "AllocSubnetLen" : 24,
                "Vxlans"         : "10001-14000",
                "Networks" : [{
                    "Name" : "orange",
                    "Endpoints" : [
                        { "Container" : "myContainer1", "Host" : "host1" },
                        { "Container" : "myContainer3", "Host" : "host2" }
                    ]
                }]
            }]}"#,
        )
        .unwrap();

        verify_keys(&driver, &["nets/orange", "myContainer1", "myContainer3"]);
    }

    fn apply_verify_range_tag(cfg: &str, expect_err: Option<&str>) {
        let driver = MemStateDriver::new();
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Intent {
            tenants: Vec<TenantCfg>,
        }
        let intent: Intent = serde_json::from_str(cfg).unwrap();
        let tenant = &intent.tenants[0];
        create_tenant(&driver, tenant).unwrap();
        let result = create_networks(&driver, tenant);
        match expect_err {
            None => assert!(result.is_ok(), "unexpected error: {:?}", result.err()),
            Some(msg) => assert_eq!(result.unwrap_err().to_string(), msg),
        }
    }

    fn range_cfg(name: &str, pkt_tag: u32, pkt_tag_type: &str, vlans: bool) -> String {
        let ranges = if vlans {
            r#""Vlans" : "1201-1500", "Vxlans" : "2001-3000","#
        } else {
            r#""Vxlans" : "2001-3000","#
        };
        format!(
            r#"{{
            "Tenants" : [{{
                "Name"           : "{}",
                "DefaultNetType" : "vxlan",
                "SubnetPool"     : "11.1.0.0/16",
                "AllocSubnetLen" : 24,
                {}
                "Networks" : [{{
                    "Name"       : "net1",
                    "PktTag"     : {},
                    "PktTagType" : "{}"
                }}]
            }}]}}"#,
            name, ranges, pkt_tag, pkt_tag_type
        )
    }

    #[test]
    fn pkt_tag_out_of_range() {
        apply_verify_range_tag(
            &range_cfg("tenant1", 2000, "vxlan", false),
            Some("vxlan 2000 does not adhere to tenant's vxlan range 2001-3000"),
        );
        apply_verify_range_tag(&range_cfg("tenant2", 2001, "vxlan", false), None);
        apply_verify_range_tag(&range_cfg("tenant3", 3000, "vxlan", false), None);
        apply_verify_range_tag(
            &range_cfg("tenant4", 3001, "vxlan", false),
            Some("vxlan 3001 does not adhere to tenant's vxlan range 2001-3000"),
        );
        apply_verify_range_tag(
            &range_cfg("tenant5", 1200, "vlan", true),
            Some("vlan 1200 does not adhere to tenant's vlan range 1201-1500"),
        );
        apply_verify_range_tag(&range_cfg("tenant6", 1201, "vlan", true), None);
        apply_verify_range_tag(&range_cfg("tenant7", 1500, "vlan", true), None);
        apply_verify_range_tag(
            &range_cfg("tenant8", 1501, "vlan", true),
            Some("vlan 1501 does not adhere to tenant's vlan range 1201-1500"),
        );
    }

    #[test]
    fn tag_range_parse() {
        assert_eq!(TagRange::parse("11-28").unwrap(), TagRange { min: 11, max: 28 });
        assert!(TagRange::parse("28-11").is_err());
        assert!(TagRange::parse("11").is_err());
        assert!(TagRange::parse("a-b").is_err());
    }
}
