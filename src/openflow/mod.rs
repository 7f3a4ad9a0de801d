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

// Thin model over the OpenFlow 1.3 pipeline: tables, flows, matches and
// actions, plus the controller listener the switch dials into. The wire
// encoder/decoder is an external library; everything the agent installs
// crosses the `FlowProgrammer` boundary as a `FlowMod`.

mod controller;
mod flow;
mod switch;

pub use controller::{AppInterface, Controller, PacketIn};
pub use flow::{
    FlowAction, FlowMatch, FlowMod, FlowModCmd, FlowTarget, ETH_TYPE_ARP, ETH_TYPE_IP,
    IP_PROTO_TCP, IP_PROTO_UDP,
};
pub use switch::{Flow, OfSwitch, Table};

use std::env;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::error::Result;

// Emits flow-mods towards the switch connection. Implementations own the
// OpenFlow encoding and transport.
pub trait FlowProgrammer: Send + Sync {
    fn flow_mod(&self, fm: &FlowMod) -> Result<()>;
}

// Logs every flow-mod instead of encoding it. Stands in for the wire
// encoder wherever one is not wired up, and doubles as the datapath trace
// hook: with CONTIV_TRACE=1 every mod is logged at debug level.
pub struct TraceProgrammer {
    verbose: bool,
}

impl TraceProgrammer {
    pub fn new() -> Self {
        TraceProgrammer {
            verbose: env::var("CONTIV_TRACE").map_or(false, |v| v == "1"),
        }
    }
}

impl Default for TraceProgrammer {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowProgrammer for TraceProgrammer {
    fn flow_mod(&self, fm: &FlowMod) -> Result<()> {
        if self.verbose {
            debug!(
                "flow-mod {:?} table {} cookie {:#x}: {:?} -> {:?} via {:?}",
                fm.cmd, fm.table_id, fm.cookie, fm.fmatch, fm.next, fm.actions
            );
        } else {
            trace!("flow-mod {:?} table {} cookie {:#x}", fm.cmd, fm.table_id, fm.cookie);
        }
        Ok(())
    }
}

// Keeps every flow-mod it sees. Test double, also usable as a dry-run sink.
#[derive(Default)]
pub struct RecordingProgrammer {
    mods: Mutex<Vec<FlowMod>>,
}

impl RecordingProgrammer {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn mods(&self) -> Vec<FlowMod> {
        self.mods.lock().clone()
    }

    // Adds in `table` that have not been deleted since.
    pub fn live_in_table(&self, table_id: u8) -> Vec<FlowMod> {
        let mods = self.mods.lock();
        let mut live: Vec<FlowMod> = Vec::new();
        for m in mods.iter().filter(|m| m.table_id == table_id) {
            match m.cmd {
                FlowModCmd::Add => live.push(m.clone()),
                FlowModCmd::Delete => live.retain(|l| l.cookie != m.cookie),
            }
        }
        live
    }

    pub fn clear(&self) {
        self.mods.lock().clear();
    }
}

impl FlowProgrammer for RecordingProgrammer {
    fn flow_mod(&self, fm: &FlowMod) -> Result<()> {
        self.mods.lock().push(fm.clone());
        Ok(())
    }
}
