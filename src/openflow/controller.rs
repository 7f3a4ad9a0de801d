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

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use super::switch::OfSwitch;
use super::FlowProgrammer;
use crate::error::Result;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// Packet punted to the controller. Payload decoding is left to the
// OpenFlow library feeding this in.
#[derive(Clone, Debug)]
pub struct PacketIn {
    pub in_port: u32,
    pub data: Vec<u8>,
}

// Callbacks the agent implements to learn about switch lifecycle events.
pub trait AppInterface: Send + Sync {
    fn switch_connected(&self, sw: &Arc<OfSwitch>);
    fn switch_disconnected(&self, sw: &Arc<OfSwitch>);
    fn packet_rcvd(&self, sw: &Arc<OfSwitch>, pkt: PacketIn);
}

// Listens for the bridge's OpenFlow connection and promotes it to
// switch-connected callbacks. Session decoding (hello, features,
// packet-in) belongs to the external OpenFlow library; the connection is
// held open here so its loss maps to switch-disconnected.
pub struct Controller {
    app: Weak<dyn AppInterface>,
    programmer: Arc<dyn FlowProgrammer>,
    shutdown: Arc<AtomicBool>,
    next_dpid: Arc<AtomicU64>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    pub fn new(app: Weak<dyn AppInterface>, programmer: Arc<dyn FlowProgrammer>) -> Self {
        Controller {
            app,
            programmer,
            shutdown: Arc::new(AtomicBool::new(false)),
            next_dpid: Arc::new(AtomicU64::new(1)),
            accept_handle: Mutex::new(None),
        }
    }

    // Binds `addr` and services switch connections until `delete`.
    pub fn listen(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!("listening for openflow connections on {}", addr);

        let app = self.app.clone();
        let programmer = self.programmer.clone();
        let shutdown = self.shutdown.clone();
        let next_dpid = self.next_dpid.clone();
        let handle = thread::Builder::new()
            .name("of-listener".to_owned())
            .spawn(move || loop {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                match listener.accept() {
                    Ok((stream, peer)) => {
                        debug!("switch connection from {}", peer);
                        let dpid = next_dpid.fetch_add(1, Ordering::Relaxed);
                        let app = app.clone();
                        let programmer = programmer.clone();
                        let shutdown = shutdown.clone();
                        let _ = thread::Builder::new()
                            .name(format!("of-conn-{}", dpid))
                            .spawn(move || serve_switch(stream, dpid, app, programmer, shutdown));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL_INTERVAL);
                    }
                    Err(e) => {
                        warn!("openflow accept failed: {}", e);
                        return;
                    }
                }
            })?;
        *self.accept_handle.lock() = Some(handle);
        Ok(())
    }

    pub fn delete(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.accept_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn serve_switch(
    mut stream: TcpStream,
    dpid: u64,
    app: Weak<dyn AppInterface>,
    programmer: Arc<dyn FlowProgrammer>,
    shutdown: Arc<AtomicBool>,
) {
    let sw = OfSwitch::new(dpid, programmer);
    let Some(strong) = app.upgrade() else {
        return;
    };
    strong.switch_connected(&sw);
    drop(strong);

    let _ = stream.set_read_timeout(Some(ACCEPT_POLL_INTERVAL));
    let mut buf = [0u8; 4096];
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match stream.read(&mut buf) {
            // connection closed by the switch
            Ok(0) => break,
            // session messages are consumed by the OpenFlow library layer
            Ok(_) => {}
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                warn!("openflow connection error on dpid {}: {}", dpid, e);
                break;
            }
        }
    }

    if let Some(strong) = app.upgrade() {
        strong.switch_disconnected(&sw);
    }
}
