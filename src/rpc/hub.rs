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

// Bidirectional request/reply plumbing between agents and masters. The wire
// format is newline-delimited JSON: requests carry `id`, `method`
// ("Service.Method") and `params`, replies echo `id` with either `result`
// or `error`. Calls are synchronous; timeouts are transport-level.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Serialize, Deserialize, Debug)]
struct RpcRequest {
    id: u64,
    method: String,
    params: Value,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct RpcResponse {
    id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

// One named service. The hub routes `Name.Method` to the service
// registered as `Name`.
pub trait RpcService: Send + Sync {
    fn call(&self, method: &str, params: Value) -> std::result::Result<Value, String>;
}

pub struct RpcServer {
    services: Arc<RwLock<HashMap<String, Arc<dyn RpcService>>>>,
    shutdown: Arc<AtomicBool>,
    port: u16,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RpcServer {
    // Binds `0.0.0.0:port` and starts serving. Port 0 picks an ephemeral
    // port, readable back through `port()`.
    pub fn new(port: u16) -> Result<RpcServer> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();

        let services: Arc<RwLock<HashMap<String, Arc<dyn RpcService>>>> = Default::default();
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_services = services.clone();
        let accept_shutdown = shutdown.clone();
        let handle = thread::Builder::new()
            .name("rpc-listener".to_owned())
            .spawn(move || loop {
                if accept_shutdown.load(Ordering::Relaxed) {
                    return;
                }
                match listener.accept() {
                    Ok((stream, peer)) => {
                        let services = accept_services.clone();
                        let shutdown = accept_shutdown.clone();
                        let _ = thread::Builder::new()
                            .name(format!("rpc-conn-{}", peer))
                            .spawn(move || serve_conn(stream, peer, services, shutdown));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(POLL_INTERVAL);
                    }
                    Err(e) => {
                        warn!("rpc accept failed: {}", e);
                        return;
                    }
                }
            })?;

        Ok(RpcServer {
            services,
            shutdown,
            port,
            accept_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn register(&self, name: &str, service: Arc<dyn RpcService>) {
        self.services.write().insert(name.to_owned(), service);
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.accept_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn serve_conn(
    stream: TcpStream,
    peer: SocketAddr,
    services: Arc<RwLock<HashMap<String, Arc<dyn RpcService>>>>,
    shutdown: Arc<AtomicBool>,
) {
    let _ = stream.set_read_timeout(Some(POLL_INTERVAL));
    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(e) => {
            warn!("rpc connection from {} unusable: {}", peer, e);
            return;
        }
    };
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => return,
            Ok(_) => {}
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => {
                debug!("rpc connection from {} closed: {}", peer, e);
                return;
            }
        }
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(req) => dispatch(&services, req),
            Err(e) => RpcResponse {
                id: 0,
                error: Some(format!("malformed request: {}", e)),
                ..Default::default()
            },
        };
        let mut body = match serde_json::to_vec(&resp) {
            Ok(b) => b,
            Err(e) => {
                warn!("rpc response serialization failed: {}", e);
                return;
            }
        };
        body.push(b'\n');
        if writer.write_all(&body).is_err() {
            return;
        }
    }
}

fn dispatch(
    services: &RwLock<HashMap<String, Arc<dyn RpcService>>>,
    req: RpcRequest,
) -> RpcResponse {
    let Some((service_name, method)) = req.method.split_once('.') else {
        return RpcResponse {
            id: req.id,
            error: Some(format!("malformed method name: {}", req.method)),
            ..Default::default()
        };
    };
    let service = services.read().get(service_name).cloned();
    match service {
        Some(service) => match service.call(method, req.params) {
            Ok(result) => RpcResponse {
                id: req.id,
                result: Some(result),
                ..Default::default()
            },
            Err(e) => RpcResponse {
                id: req.id,
                error: Some(e),
                ..Default::default()
            },
        },
        None => RpcResponse {
            id: req.id,
            error: Some(format!("unknown service: {}", service_name)),
            ..Default::default()
        },
    }
}

struct ClientConn {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

// Reconnecting client for one peer. Safe to share; calls serialize on the
// connection.
pub struct RpcClient {
    addr: String,
    timeout: Duration,
    next_id: AtomicU64,
    conn: Mutex<Option<ClientConn>>,
}

impl RpcClient {
    pub fn new(host: &str, port: u16) -> RpcClient {
        RpcClient {
            addr: format!("{}:{}", host, port),
            timeout: DEFAULT_TIMEOUT,
            next_id: AtomicU64::new(1),
            conn: Mutex::new(None),
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn connect(&self) -> Result<ClientConn> {
        let sockaddr = self
            .addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::ParseAddrFailed(self.addr.clone()))?;
        let stream = TcpStream::connect_timeout(&sockaddr, CONNECT_TIMEOUT)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        let writer = stream.try_clone()?;
        Ok(ClientConn {
            reader: BufReader::new(stream),
            writer,
        })
    }

    pub fn call<P: Serialize>(&self, method: &str, params: &P) -> Result<Value> {
        let mut guard = self.conn.lock();
        if guard.is_none() {
            *guard = Some(self.connect()?);
        }

        let req = RpcRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: method.to_owned(),
            params: serde_json::to_value(params)?,
        };
        let mut body = serde_json::to_vec(&req)?;
        body.push(b'\n');

        let conn = guard.as_mut().unwrap();
        let mut line = String::new();
        let io_result = conn
            .writer
            .write_all(&body)
            .and_then(|_| conn.reader.read_line(&mut line));
        match io_result {
            Ok(0) => {
                *guard = None;
                return Err(Error::Rpc(format!("{}: connection closed", self.addr)));
            }
            Ok(_) => {}
            Err(e) => {
                // reconnect on the next call
                *guard = None;
                return Err(Error::Rpc(format!("{}: {}", self.addr, e)));
            }
        }

        let resp: RpcResponse = serde_json::from_str(&line)?;
        if resp.id != req.id {
            *guard = None;
            return Err(Error::Rpc(format!(
                "{}: response id {} does not match request id {}",
                self.addr, resp.id, req.id
            )));
        }
        match resp.error {
            Some(e) => Err(Error::Rpc(e)),
            None => Ok(resp.result.unwrap_or(Value::Null)),
        }
    }
}

// Client cache keyed by `"host:port"`. Owned by whoever talks to peers;
// never a process-wide singleton.
#[derive(Default)]
pub struct RpcHub {
    clients: Mutex<HashMap<String, Arc<RpcClient>>>,
}

impl RpcHub {
    pub fn new() -> RpcHub {
        Default::default()
    }

    pub fn client(&self, host: &str, port: u16) -> Arc<RpcClient> {
        let key = format!("{}:{}", host, port);
        self.clients
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(RpcClient::new(host, port)))
            .clone()
    }

    pub fn forget(&self, host: &str, port: u16) {
        self.clients.lock().remove(&format!("{}:{}", host, port));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoService;

    impl RpcService for EchoService {
        fn call(&self, method: &str, params: Value) -> std::result::Result<Value, String> {
            match method {
                "Echo" => Ok(params),
                "Fail" => Err("deliberate failure".to_owned()),
                _ => Err(format!("unknown method: {}", method)),
            }
        }
    }

    #[test]
    fn round_trip_and_dispatch() {
        let server = RpcServer::new(0).unwrap();
        server.register("Test", Arc::new(EchoService));

        let hub = RpcHub::new();
        let client = hub.client("127.0.0.1", server.port());

        let result = client
            .call("Test.Echo", &serde_json::json!({"x": 7}))
            .unwrap();
        assert_eq!(result, serde_json::json!({"x": 7}));

        match client.call("Test.Fail", &Value::Null) {
            Err(Error::Rpc(msg)) => assert_eq!(msg, "deliberate failure"),
            other => panic!("unexpected result: {:?}", other),
        }

        match client.call("Nope.Echo", &Value::Null) {
            Err(Error::Rpc(msg)) => assert!(msg.contains("unknown service")),
            other => panic!("unexpected result: {:?}", other),
        }

        server.stop();
    }

    #[test]
    fn hub_caches_clients() {
        let hub = RpcHub::new();
        let a = hub.client("127.0.0.1", 9001);
        let b = hub.client("127.0.0.1", 9001);
        assert!(Arc::ptr_eq(&a, &b));
        hub.forget("127.0.0.1", 9001);
        let c = hub.client("127.0.0.1", 9001);
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
