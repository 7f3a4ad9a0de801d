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

use std::fmt;

use serde::{Deserialize, Serialize};

// Address of a peer control-plane node (master or agent).
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct HostNode {
    pub host_addr: String,
    pub host_port: u16,
}

impl HostNode {
    pub fn new<S: Into<String>>(addr: S, port: u16) -> Self {
        HostNode {
            host_addr: addr.into(),
            host_port: port,
        }
    }

    // DB key for a node, `"addr:port"`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host_addr, self.host_port)
    }
}

impl fmt::Display for HostNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host_addr, self.host_port)
    }
}
