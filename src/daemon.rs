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

// The watch loop of the enclosing plugin daemon: restore current desired
// state at boot, then react to change events. Network creates are
// processed before the endpoints that reference them; that ordering is
// guaranteed by the master writing the store, not re-derived here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::error::Result;
use crate::netcfg::{EndpointState, NetworkState, EP_PREFIX, NET_PREFIX};
use crate::plugin::NetPlugin;
use crate::state::{StateDriver, WatchEvent};

const WATCH_POLL: Duration = Duration::from_millis(100);

// An endpoint state concerns this host when it is homed here, unless it is
// a remote record carrying a VTEP binding.
pub fn skip_host(vtep_ip: &str, homing_host: &str, my_host_label: &str) -> bool {
    (vtep_ip.is_empty() && homing_host != my_host_label)
        || (!vtep_ip.is_empty() && homing_host == my_host_label)
}

pub struct NetDaemon {
    plugin: Arc<NetPlugin>,
    state: Arc<dyn StateDriver>,
    shutdown: Arc<AtomicBool>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl NetDaemon {
    pub fn new(plugin: Arc<NetPlugin>, state: Arc<dyn StateDriver>) -> NetDaemon {
        NetDaemon {
            plugin,
            state,
            shutdown: Arc::new(AtomicBool::new(false)),
            watchers: Mutex::new(Vec::new()),
        }
    }

    // Replays the current snapshot, then starts watching for changes.
    pub fn run(&self) -> Result<()> {
        self.process_current_state()?;

        let (net_tx, net_rx) = mpsc::channel();
        self.state.watch_all(NET_PREFIX, net_tx)?;
        let plugin = self.plugin.clone();
        let shutdown = self.shutdown.clone();
        let handle = thread::Builder::new()
            .name("net-watch".to_owned())
            .spawn(move || loop {
                match net_rx.recv_timeout(WATCH_POLL) {
                    Ok(event) => process_net_event(&plugin, event),
                    Err(RecvTimeoutError::Timeout) => {
                        if shutdown.load(Ordering::Relaxed) {
                            return;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            })?;
        self.watchers.lock().push(handle);

        let (ep_tx, ep_rx) = mpsc::channel();
        self.state.watch_all(EP_PREFIX, ep_tx)?;
        let plugin = self.plugin.clone();
        let shutdown = self.shutdown.clone();
        let handle = thread::Builder::new()
            .name("ep-watch".to_owned())
            .spawn(move || loop {
                match ep_rx.recv_timeout(WATCH_POLL) {
                    Ok(event) => process_ep_event(&plugin, event),
                    Err(RecvTimeoutError::Timeout) => {
                        if shutdown.load(Ordering::Relaxed) {
                            return;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            })?;
        self.watchers.lock().push(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.watchers.lock().drain(..) {
            let _ = handle.join();
        }
    }

    // Boot-time restore: networks first, then the endpoints homed here.
    fn process_current_state(&self) -> Result<()> {
        for (idx, net) in NetworkState::read_all(self.state.as_ref())?
            .iter()
            .enumerate()
        {
            debug!("read net key[{}] {}, populating state", idx, net.id);
            if let Err(e) = self.plugin.create_network(&net.id) {
                error!("network create for {} failed: {}", net.id, e);
            }
        }
        for (idx, ep) in EndpointState::read_all(self.state.as_ref())?
            .iter()
            .enumerate()
        {
            debug!("read ep key[{}] {}, populating state", idx, ep.id);
            self.process_ep_state(ep);
        }
        Ok(())
    }

    fn process_ep_state(&self, ep: &EndpointState) {
        if skip_host(&ep.vtep_ip, &ep.homing_host, self.plugin.host_label()) {
            info!(
                "skipping mismatching host for ep {} (ep's host {}, my host {})",
                ep.id,
                ep.homing_host,
                self.plugin.host_label()
            );
            return;
        }
        if let Err(e) = self.plugin.create_endpoint(&ep.id) {
            error!("endpoint create for {} failed: {}", ep.id, e);
        }
    }
}

fn parse_net(event_side: Option<&crate::state::StateItem>) -> Option<NetworkState> {
    event_side.and_then(|item| serde_json::from_slice(&item.value).ok())
}

fn parse_ep(event_side: Option<&crate::state::StateItem>) -> Option<EndpointState> {
    event_side.and_then(|item| serde_json::from_slice(&item.value).ok())
}

fn process_net_event(plugin: &NetPlugin, event: WatchEvent) {
    match (parse_net(event.prev.as_ref()), parse_net(event.curr.as_ref())) {
        (Some(net), None) => {
            info!("received delete for network {}", net.id);
            if let Err(e) = plugin.delete_network(&net.id) {
                error!("network delete for {} failed: {}", net.id, e);
            }
        }
        // a modify is replayed as a create
        (_, Some(net)) => {
            info!("received create for network {}", net.id);
            if let Err(e) = plugin.create_network(&net.id) {
                error!("network create for {} failed: {}", net.id, e);
            }
        }
        (None, None) => warn!("network watch event with no state"),
    }
}

fn process_ep_event(plugin: &NetPlugin, event: WatchEvent) {
    match (parse_ep(event.prev.as_ref()), parse_ep(event.curr.as_ref())) {
        (Some(ep), None) => {
            info!("received delete for endpoint {}", ep.id);
            if skip_host(&ep.vtep_ip, &ep.homing_host, plugin.host_label()) {
                return;
            }
            if let Err(e) = plugin.delete_endpoint(&ep.id) {
                error!("endpoint delete for {} failed: {}", ep.id, e);
            }
        }
        // late host binding arrives as a modify, handled as a create
        (_, Some(ep)) => {
            if skip_host(&ep.vtep_ip, &ep.homing_host, plugin.host_label()) {
                info!(
                    "skipping mismatching host for ep {} (ep's host {})",
                    ep.id, ep.homing_host
                );
                return;
            }
            info!("received create for endpoint {}", ep.id);
            if let Err(e) = plugin.create_endpoint(&ep.id) {
                error!("endpoint create for {} failed: {}", ep.id, e);
            }
        }
        (None, None) => warn!("endpoint watch event with no state"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::agent::OfnetAgent;
    use crate::datapath::DatapathKind;
    use crate::netcfg::{self, PktTagType};
    use crate::openflow::{AppInterface, OfSwitch, RecordingProgrammer};
    use crate::state::MemStateDriver;

    #[test]
    fn skip_host_matrix() {
        // no vtep binding: only our own endpoints are processed
        assert!(!skip_host("", "host1", "host1"));
        assert!(skip_host("", "host2", "host1"));
        // vtep-bound records are remote state, skip our own
        assert!(skip_host("192.168.2.10", "host1", "host1"));
        assert!(!skip_host("192.168.2.10", "host2", "host1"));
    }

    fn seed(driver: &MemStateDriver) {
        let tenant = netcfg::TenantCfg {
            name: "tenant-one".to_owned(),
            default_net_type: Some(PktTagType::Vxlan),
            subnet_pool: "11.1.0.0/16".to_owned(),
            alloc_subnet_len: 24,
            vxlans: "10001-14000".to_owned(),
            networks: vec![netcfg::NetworkCfg {
                name: "orange".to_owned(),
                endpoints: vec![
                    netcfg::EndpointCfg {
                        container: "myContainer1".to_owned(),
                        host: "host1".to_owned(),
                    },
                    netcfg::EndpointCfg {
                        container: "myContainer2".to_owned(),
                        host: "host2".to_owned(),
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        };
        netcfg::create_tenant(driver, &tenant).unwrap();
        netcfg::create_networks(driver, &tenant).unwrap();
        netcfg::create_endpoints(driver, &tenant).unwrap();
    }

    fn test_daemon() -> (NetDaemon, Arc<MemStateDriver>, Arc<NetPlugin>) {
        let driver = Arc::new(MemStateDriver::new());
        let agent =
            OfnetAgent::new(DatapathKind::Vxlan, "192.168.2.10".parse().unwrap(), 0).unwrap();
        let sw = OfSwitch::new(1, Arc::new(RecordingProgrammer::new()));
        agent.switch_connected(&sw);
        let plugin = Arc::new(
            NetPlugin::new(
                "host1".to_owned(),
                "192.168.2.10".parse().unwrap(),
                "eth2".to_owned(),
                driver.clone(),
                agent,
            )
            .unwrap(),
        );
        let daemon = NetDaemon::new(plugin.clone(), driver.clone());
        (daemon, driver, plugin)
    }

    fn wait_until<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn boot_restore_processes_only_local_endpoints() {
        let (daemon, driver, plugin) = test_daemon();
        seed(&driver);

        daemon.run().unwrap();
        // myContainer1 is homed here, myContainer2 elsewhere
        assert_eq!(plugin.agent().local_endpoint_count(), 1);
        daemon.stop();
    }

    #[test]
    fn watch_picks_up_late_bindings() {
        let (daemon, driver, plugin) = test_daemon();
        seed(&driver);
        daemon.run().unwrap();
        assert_eq!(plugin.agent().local_endpoint_count(), 1);

        // a late binding re-homes container2 onto this host
        netcfg::create_ep_bindings(
            driver.as_ref(),
            &[netcfg::EndpointCfg {
                container: "myContainer2".to_owned(),
                host: "host1".to_owned(),
            }],
        )
        .unwrap();

        let plugin2 = plugin.clone();
        wait_until(move || plugin2.agent().local_endpoint_count() == 2);
        daemon.stop();
    }
}
