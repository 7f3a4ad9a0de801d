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

// Desired network and endpoint state as stored in the KV store. Networks
// live under `nets/<name>`, endpoints under `eps/<net>-<container>`,
// tenant intent under `tenants/<name>`.

mod intent;

pub use intent::{
    create_endpoints, create_ep_bindings, create_networks, create_tenant, EndpointCfg, NetworkCfg,
    TagRange, TenantCfg,
};

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::StateDriver;
use crate::utils::net::MacAddr;

pub const NET_PREFIX: &str = "nets/";
pub const EP_PREFIX: &str = "eps/";
pub const TENANT_PREFIX: &str = "tenants/";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PktTagType {
    Vlan,
    #[default]
    Vxlan,
}

// One logical network.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkState {
    #[serde(rename = "ID")]
    pub id: String,
    pub tenant: String,
    pub pkt_tag_type: PktTagType,
    pub pkt_tag: u32,
    pub ext_pkt_tag: u32,
    pub subnet_ip: String,
    pub subnet_len: u8,
    pub default_gw: String,
    // next host number to hand to an endpoint in this subnet
    pub ep_alloc_cursor: u32,
}

// One endpoint's desired placement and addressing.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointState {
    #[serde(rename = "ID")]
    pub id: String,
    pub net_id: String,
    #[serde(rename = "ContName")]
    pub container: String,
    pub homing_host: String,
    #[serde(rename = "VtepIP")]
    pub vtep_ip: String,
    pub ip_address: String,
    pub mac_address: String,
    pub int_pkt_tag: u32,
}

impl NetworkState {
    pub fn state_key(id: &str) -> String {
        format!("{}{}", NET_PREFIX, id)
    }

    pub fn read(driver: &dyn StateDriver, id: &str) -> Result<NetworkState> {
        let raw = driver.read(&Self::state_key(id))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn read_all(driver: &dyn StateDriver) -> Result<Vec<NetworkState>> {
        let mut nets = Vec::new();
        for item in driver.read_all(NET_PREFIX)? {
            nets.push(serde_json::from_slice(&item.value)?);
        }
        Ok(nets)
    }

    pub fn write(&self, driver: &dyn StateDriver) -> Result<()> {
        driver.write(&Self::state_key(&self.id), &serde_json::to_vec(self)?)
    }

    pub fn clear(&self, driver: &dyn StateDriver) -> Result<()> {
        driver.clear(&Self::state_key(&self.id))
    }

    // Hands out the next free host address in this network's subnet.
    pub fn alloc_ip(&mut self) -> Result<IpAddr> {
        let base: Ipv4Addr = self
            .subnet_ip
            .parse()
            .map_err(|_| Error::ParseAddrFailed(self.subnet_ip.clone()))?;
        self.ep_alloc_cursor += 1;
        if !(2..=30).contains(&self.subnet_len)
            || self.ep_alloc_cursor >= (1u32 << (32 - self.subnet_len)) - 1
        {
            return Err(Error::InvalidConfig(format!(
                "subnet {}/{} exhausted",
                self.subnet_ip, self.subnet_len
            )));
        }
        Ok(IpAddr::V4(Ipv4Addr::from(
            u32::from(base) + self.ep_alloc_cursor,
        )))
    }
}

impl EndpointState {
    pub fn ep_id(net: &str, container: &str) -> String {
        format!("{}-{}", net, container)
    }

    pub fn state_key(id: &str) -> String {
        format!("{}{}", EP_PREFIX, id)
    }

    pub fn read(driver: &dyn StateDriver, id: &str) -> Result<EndpointState> {
        let raw = driver.read(&Self::state_key(id))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn read_all(driver: &dyn StateDriver) -> Result<Vec<EndpointState>> {
        let mut eps = Vec::new();
        for item in driver.read_all(EP_PREFIX)? {
            eps.push(serde_json::from_slice(&item.value)?);
        }
        Ok(eps)
    }

    pub fn write(&self, driver: &dyn StateDriver) -> Result<()> {
        driver.write(&Self::state_key(&self.id), &serde_json::to_vec(self)?)
    }

    pub fn clear(&self, driver: &dyn StateDriver) -> Result<()> {
        driver.clear(&Self::state_key(&self.id))
    }
}

// Container MACs are derived from the allocated IP, `02:02` prefixed, so
// they are stable and unique within a subnet pool.
pub fn mac_for_ip(ip: IpAddr) -> MacAddr {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            MacAddr::from([0x02, 0x02, o[0], o[1], o[2], o[3]])
        }
        IpAddr::V6(_) => MacAddr::ZERO,
    }
}
