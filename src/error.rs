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

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("empty host-label passed in configuration")]
    EmptyHostLabel,
    #[error("unknown vlan {0}")]
    UnknownVlan(u16),
    #[error("VTEP not found for {0}")]
    VtepNotFound(String),
    #[error("rule {0} already exists")]
    RuleConflict(String),
    #[error("rule not found: {0}")]
    RuleNotFound(String),
    #[error("unknown TCP flags: {0}")]
    UnknownTcpFlag(String),
    #[error("endpoint not found: {0}")]
    EndpointNotFound(String),
    #[error("switch not connected")]
    SwitchNotConnected,
    #[error("network not found: {0}")]
    NetworkNotFound(String),
    #[error("rpc: {0}")]
    Rpc(String),
    #[error("state key not found: {0}")]
    StateKeyNotFound(String),
    #[error("{0}")]
    InvalidConfig(String),
    #[error("not implemented")]
    NotImplemented,
    #[error(transparent)]
    ParseUtf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("parse mac address failed from: {0}")]
    ParseMacFailed(String),
    #[error("parse address failed from: {0}")]
    ParseAddrFailed(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
