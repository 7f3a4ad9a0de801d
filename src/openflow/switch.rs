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

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use super::flow::{FlowAction, FlowMatch, FlowMod, FlowModCmd, FlowTarget};
use super::FlowProgrammer;
use crate::error::Result;

// One connected bridge. Tracks which table ids exist and which cookies are
// installed; the flows themselves live on the switch, reachable through the
// programmer.
pub struct OfSwitch {
    dpid: u64,
    programmer: Arc<dyn FlowProgrammer>,
    next_cookie: AtomicU64,
    state: Mutex<SwitchState>,
}

#[derive(Default)]
struct SwitchState {
    tables: HashSet<u8>,
    installed: HashSet<u64>,
}

impl OfSwitch {
    pub fn new(dpid: u64, programmer: Arc<dyn FlowProgrammer>) -> Arc<Self> {
        Arc::new(OfSwitch {
            dpid,
            programmer,
            next_cookie: AtomicU64::new(1),
            state: Mutex::new(Default::default()),
        })
    }

    pub fn dpid(&self) -> u64 {
        self.dpid
    }

    // Registering an already known table id is a no-op.
    pub fn new_table(self: &Arc<Self>, id: u8) -> Table {
        self.state.lock().tables.insert(id);
        Table {
            switch: self.clone(),
            id,
        }
    }

    pub fn get_table(self: &Arc<Self>, id: u8) -> Option<Table> {
        if self.state.lock().tables.contains(&id) {
            Some(Table {
                switch: self.clone(),
                id,
            })
        } else {
            None
        }
    }

    pub fn installed_flow_count(&self) -> usize {
        self.state.lock().installed.len()
    }

    fn alloc_cookie(&self) -> u64 {
        self.next_cookie.fetch_add(1, Ordering::Relaxed)
    }

    fn program(&self, fm: &FlowMod) -> Result<()> {
        self.programmer.flow_mod(fm)?;
        let mut state = self.state.lock();
        match fm.cmd {
            FlowModCmd::Add => {
                state.installed.insert(fm.cookie);
            }
            FlowModCmd::Delete => {
                state.installed.remove(&fm.cookie);
            }
        }
        Ok(())
    }
}

// Handle on one pipeline table.
#[derive(Clone)]
pub struct Table {
    switch: Arc<OfSwitch>,
    id: u8,
}

impl Table {
    pub fn id(&self) -> u8 {
        self.id
    }

    // Builds a flow in this table. Nothing reaches the switch until
    // `install` is called.
    pub fn new_flow(&self, fmatch: FlowMatch) -> Flow {
        Flow {
            switch: self.switch.clone(),
            table_id: self.id,
            cookie: self.switch.alloc_cookie(),
            fmatch,
            actions: Vec::new(),
            next: None,
        }
    }
}

// One flow entry. Mutated only under the agent lock, like every other
// datapath structure.
pub struct Flow {
    switch: Arc<OfSwitch>,
    table_id: u8,
    cookie: u64,
    fmatch: FlowMatch,
    actions: Vec<FlowAction>,
    next: Option<FlowTarget>,
}

impl Flow {
    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn table_id(&self) -> u8 {
        self.table_id
    }

    pub fn fmatch(&self) -> &FlowMatch {
        &self.fmatch
    }

    pub fn actions(&self) -> &[FlowAction] {
        &self.actions
    }

    pub fn next(&self) -> Option<FlowTarget> {
        self.next
    }

    pub fn push_action(&mut self, action: FlowAction) {
        self.actions.push(action);
    }

    pub fn set_metadata(&mut self, value: u64, mask: u64) {
        self.actions.push(FlowAction::SetMetadata { value, mask });
    }

    // Sends the flow to the switch, chained to `next`. Re-installing an
    // already installed flow re-sends it (the switch treats a same-match
    // same-priority add as a modify).
    pub fn install(&mut self, next: FlowTarget) -> Result<()> {
        self.next = Some(next);
        self.switch.program(&FlowMod {
            cmd: FlowModCmd::Add,
            table_id: self.table_id,
            cookie: self.cookie,
            fmatch: self.fmatch.clone(),
            actions: self.actions.clone(),
            next: self.next,
        })
    }

    pub fn delete(&mut self) -> Result<()> {
        if self.next.is_none() {
            warn!(
                "deleting flow {:#x} in table {} that was never installed",
                self.cookie, self.table_id
            );
        }
        self.switch.program(&FlowMod {
            cmd: FlowModCmd::Delete,
            table_id: self.table_id,
            cookie: self.cookie,
            fmatch: self.fmatch.clone(),
            actions: Vec::new(),
            next: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openflow::RecordingProgrammer;

    #[test]
    fn install_and_delete_bookkeeping() {
        let prog = Arc::new(RecordingProgrammer::new());
        let sw = OfSwitch::new(1, prog.clone());
        let table = sw.new_table(5);

        let mut flow = table.new_flow(FlowMatch {
            priority: 100,
            ..Default::default()
        });
        flow.push_action(FlowAction::PopVlan);
        flow.install(FlowTarget::Port(3)).unwrap();
        assert_eq!(sw.installed_flow_count(), 1);

        let mods = prog.mods();
        assert_eq!(mods.len(), 1);
        assert_eq!(mods[0].cmd, FlowModCmd::Add);
        assert_eq!(mods[0].table_id, 5);
        assert_eq!(mods[0].next, Some(FlowTarget::Port(3)));

        flow.delete().unwrap();
        assert_eq!(sw.installed_flow_count(), 0);
        assert!(prog.live_in_table(5).is_empty());
    }

    #[test]
    fn tables_are_registered_once() {
        let prog = Arc::new(RecordingProgrammer::new());
        let sw = OfSwitch::new(1, prog);
        assert!(sw.get_table(2).is_none());
        let t = sw.new_table(2);
        assert_eq!(t.id(), 2);
        assert_eq!(sw.get_table(2).unwrap().id(), 2);

        // distinct flows get distinct cookies
        let f1 = t.new_flow(Default::default());
        let f2 = t.new_flow(Default::default());
        assert_ne!(f1.cookie(), f2.cookie());
    }
}
