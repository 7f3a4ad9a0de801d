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

// Desired state lives in an external KV store; the agent reads snapshots
// and watches for changes. Drivers hide the store behind this contract.

mod mem;

pub use mem::MemStateDriver;

use std::sync::mpsc::Sender;

use crate::error::Result;

#[derive(Clone, Debug, PartialEq)]
pub struct StateItem {
    pub key: String,
    pub value: Vec<u8>,
}

// Change notification. `prev == None` is a create, `curr == None` a
// delete; both set is a modify, which consumers treat as a create (late
// host binding rewrites endpoint state in place).
#[derive(Clone, Debug)]
pub struct WatchEvent {
    pub prev: Option<StateItem>,
    pub curr: Option<StateItem>,
}

pub trait StateDriver: Send + Sync {
    fn read(&self, key: &str) -> Result<Vec<u8>>;
    fn read_all(&self, prefix: &str) -> Result<Vec<StateItem>>;
    fn write(&self, key: &str, value: &[u8]) -> Result<()>;
    fn clear(&self, key: &str) -> Result<()>;
    // Deliver change events for keys under `prefix` on `tx` until the
    // receiver goes away.
    fn watch_all(&self, prefix: &str, tx: Sender<WatchEvent>) -> Result<()>;
}
