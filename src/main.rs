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

use std::env;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::info;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::iterator::Signals;

use ofnet_agent::config::Config;
use ofnet_agent::datapath::DatapathKind;
use ofnet_agent::state::{MemStateDriver, StateDriver};
use ofnet_agent::utils::{logger, net::get_local_addr};
use ofnet_agent::{NetDaemon, NetPlugin, OfnetAgent, OFNET_AGENT_PORT, OPENFLOW_PORT};

#[derive(Parser)]
struct Opts {
    /// Label used to identify endpoints homed for this host, defaults to
    /// the host name. With -config, host-label must come from the
    /// configuration.
    #[clap(long = "host-label")]
    host_label: Option<String>,

    /// Plugin mode: docker|kubernetes
    #[clap(long = "plugin-mode", default_value = "docker")]
    plugin_mode: String,

    /// Plugin configuration; use '-' to read from stdin
    #[clap(long = "config")]
    config: Option<String>,

    /// My VTEP ip address
    #[clap(long = "vtep-ip")]
    vtep_ip: Option<String>,

    /// Local ip address to be used for control communication
    #[clap(long = "ctrl-ip")]
    ctrl_ip: Option<String>,

    /// Uplink interface for VLAN switching
    #[clap(long = "vlan-if", default_value = "eth2")]
    vlan_if: String,

    /// Log to syslog at proto://ip:port; use 'kernel' for the local syslog
    #[clap(long)]
    syslog: Option<String>,

    /// Show debugging information
    #[clap(long)]
    debug: bool,

    /// Format logs as JSON
    #[clap(long = "json-log")]
    json_log: bool,
}

fn wait_on_signals() -> Result<()> {
    let mut signals = Signals::new(TERM_SIGNALS)?;
    signals.forever().next();
    signals.handle().close();
    Ok(())
}

fn new_state_driver(name: &str) -> Result<Arc<dyn StateDriver>> {
    match name {
        // the etcd binding is deployment plumbing; in-process state serves
        // single-host setups and tests
        "memory" | "fakedriver" => Ok(Arc::new(MemStateDriver::new())),
        other => bail!("unknown state driver: {}", other),
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    // datapath programming needs root
    if !nix::unistd::Uid::effective().is_root() {
        bail!("this process can only be run as root");
    }

    if opts.debug {
        env::set_var("CONTIV_TRACE", "1");
    }
    let _logger = logger::init(opts.debug, opts.json_log, opts.syslog.as_deref())
        .context("logger initialization failed")?;

    let local_ip = get_local_addr().context("error getting local address")?;
    let host_label = match opts.host_label {
        Some(label) => label,
        None => hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .ok_or_else(|| anyhow!("failed to fetch hostname"))?,
    };
    let vtep_ip = opts.vtep_ip.unwrap_or_else(|| local_ip.to_string());
    let ctrl_ip = opts.ctrl_ip.unwrap_or_else(|| local_ip.to_string());

    let config = match opts.config.as_deref() {
        None => {
            info!("config not specified, using default config");
            Config::default_config(&host_label, &vtep_ip, &opts.vlan_if, &ctrl_ip)
        }
        Some("-") => Config::load_from_stdin().context("reading config from stdin failed")?,
        Some(path) => {
            Config::load_from_file(path).context("reading config from file failed")?
        }
    };

    // config values win over CLI defaults
    let host_label = config.instance.host_label.clone();
    let vtep_ip: IpAddr = if config.instance.vtep_ip.is_empty() {
        vtep_ip.parse()
    } else {
        config.instance.vtep_ip.parse()
    }
    .map_err(|e| anyhow!("invalid vtep ip: {}", e))?;
    let ctrl_ip: IpAddr = if config.instance.ctrl_ip.is_empty() {
        ctrl_ip.parse()
    } else {
        config.instance.ctrl_ip.parse()
    }
    .map_err(|e| anyhow!("invalid ctrl ip: {}", e))?;
    let vlan_if = if config.instance.vlan_if.is_empty() {
        opts.vlan_if.clone()
    } else {
        config.instance.vlan_if.clone()
    };

    match opts.plugin_mode.as_str() {
        "docker" => info!("serving container runtime on {}", config.docker.socket),
        "kubernetes" => info!("running in kubernetes plugin mode"),
        other => bail!("unknown plugin mode {} -- should be docker | kubernetes", other),
    }

    let datapath: DatapathKind = config
        .drivers
        .network
        .parse()
        .map_err(|e| anyhow!("{}", e))?;
    let state = new_state_driver(&config.drivers.state)?;

    let agent = OfnetAgent::new(datapath, ctrl_ip, OFNET_AGENT_PORT)?;
    agent.listen(&format!("0.0.0.0:{}", OPENFLOW_PORT))?;

    let plugin = Arc::new(NetPlugin::new(
        host_label,
        vtep_ip,
        vlan_if,
        state.clone(),
        agent.clone(),
    )?);

    let daemon = NetDaemon::new(plugin, state);
    daemon.run()?;

    wait_on_signals()?;

    daemon.stop();
    agent.delete();
    Ok(())
}
