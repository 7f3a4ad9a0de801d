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

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

// Daemon configuration, JSON, loaded once at startup. Driver names select
// implementations; the instance block identifies this host.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub drivers: Drivers,
    #[serde(default, rename = "plugin-instance")]
    pub instance: InstanceInfo,
    #[serde(default)]
    pub etcd: EtcdConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub ovs: OvsConfig,
}

#[derive(Debug, Deserialize, Default)]
pub struct Drivers {
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct InstanceInfo {
    #[serde(default, rename = "host-label")]
    pub host_label: String,
    #[serde(default, rename = "vtep-ip")]
    pub vtep_ip: String,
    #[serde(default, rename = "vlan-if")]
    pub vlan_if: String,
    #[serde(default, rename = "ctrl-ip")]
    pub ctrl_ip: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct EtcdConfig {
    #[serde(default)]
    pub machines: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct DockerConfig {
    #[serde(default)]
    pub socket: String,
}

#[derive(Debug, Deserialize)]
pub struct OvsConfig {
    pub dbip: String,
    pub dbport: u16,
}

impl Default for OvsConfig {
    fn default() -> Self {
        OvsConfig {
            dbip: "127.0.0.1".to_owned(),
            dbport: 6640,
        }
    }
}

impl Config {
    pub fn from_str(raw: &str) -> Result<Config> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        Self::from_str(&fs::read_to_string(path)?)
    }

    pub fn load_from_stdin() -> Result<Config> {
        let mut raw = String::new();
        std::io::stdin().read_to_string(&mut raw)?;
        Self::from_str(&raw)
    }

    // Synthesizes the configuration used when no file is given, mirroring
    // the CLI defaults.
    pub fn default_config(host_label: &str, vtep_ip: &str, vlan_if: &str, ctrl_ip: &str) -> Config {
        Config {
            drivers: Drivers {
                network: "vxlan".to_owned(),
                endpoint: "vxlan".to_owned(),
                state: "memory".to_owned(),
            },
            instance: InstanceInfo {
                host_label: host_label.to_owned(),
                vtep_ip: vtep_ip.to_owned(),
                vlan_if: vlan_if.to_owned(),
                ctrl_ip: ctrl_ip.to_owned(),
            },
            etcd: EtcdConfig {
                machines: vec!["http://127.0.0.1:4001".to_owned()],
            },
            docker: DockerConfig {
                socket: "unix:///var/run/docker.sock".to_owned(),
            },
            ovs: Default::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.instance.host_label.is_empty() {
            return Err(Error::EmptyHostLabel);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_validate() {
        let config = Config::from_str(
            r#"{
            "drivers": { "network": "vxlan", "state": "etcd" },
            "plugin-instance": {
                "host-label": "host1",
                "vtep-ip": "192.168.2.10",
                "vlan-if": "eth2"
            },
            "etcd": { "machines": ["http://127.0.0.1:4001"] },
            "docker": { "socket": "unix:///var/run/docker.sock" },
            "ovs": { "dbip": "127.0.0.1", "dbport": 6640 }
        }"#,
        )
        .unwrap();
        assert_eq!(config.instance.host_label, "host1");
        assert_eq!(config.drivers.network, "vxlan");
        assert_eq!(config.ovs.dbport, 6640);
    }

    #[test]
    fn missing_host_label_is_fatal() {
        let result = Config::from_str(r#"{ "plugin-instance": { "vtep-ip": "1.2.3.4" } }"#);
        assert!(matches!(result, Err(Error::EmptyHostLabel)));
    }

    #[test]
    fn default_config_is_valid() {
        let config = Config::default_config("host1", "192.168.2.10", "eth2", "192.168.2.10");
        assert!(config.validate().is_ok());
        assert_eq!(config.etcd.machines.len(), 1);
    }
}
