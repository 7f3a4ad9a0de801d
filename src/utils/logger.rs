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

use std::io::{Result, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
#[cfg(unix)]
use std::os::unix::net::UnixDatagram;
use std::process;
use std::sync::Mutex;

use chrono::Local;
use flexi_logger::{
    colored_opt_format, writers::LogWriter, DeferredNow, Duplicate, Logger, LoggerHandle, Record,
};
use log::Level;

const SYSLOG_TAG: &str = "ofnet-agent";
// facility 3 (daemon), see RFC 3164
const SYSLOG_FACILITY: u8 = 3;

enum SyslogTarget {
    Udp(UdpSocket, SocketAddr),
    Tcp(Mutex<Option<TcpStream>>, SocketAddr),
    #[cfg(unix)]
    Kernel(UnixDatagram),
}

// Ships log records to a syslog collector, RFC 3164 framed. Modeled after
// the UDP remote log shipper used elsewhere in the agent family.
pub struct SyslogWriter {
    target: SyslogTarget,
    hostname: String,
}

impl SyslogWriter {
    // `spec` is `proto://host:port` or the literal `kernel` for the local
    // syslog socket.
    pub fn new(spec: &str) -> Result<Self> {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();

        #[cfg(unix)]
        if spec == "kernel" {
            let socket = UnixDatagram::unbound()?;
            socket.connect("/dev/log")?;
            return Ok(SyslogWriter {
                target: SyslogTarget::Kernel(socket),
                hostname,
            });
        }

        let (proto, addr) = spec.split_once("://").ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("malformed syslog spec: {}", spec),
            )
        })?;
        let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unresolvable syslog address: {}", spec),
            )
        })?;
        let target = match proto {
            "udp" => SyslogTarget::Udp(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?, addr),
            "tcp" => SyslogTarget::Tcp(Mutex::new(TcpStream::connect(addr).ok()), addr),
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("unsupported syslog protocol: {}", proto),
                ))
            }
        };
        Ok(SyslogWriter { target, hostname })
    }

    fn severity(level: Level) -> u8 {
        match level {
            Level::Error => 3,
            Level::Warn => 4,
            Level::Info => 6,
            Level::Debug | Level::Trace => 7,
        }
    }

    fn send(&self, buf: &[u8]) -> Result<()> {
        match &self.target {
            SyslogTarget::Udp(socket, addr) => {
                socket.send_to(buf, addr)?;
            }
            SyslogTarget::Tcp(stream, addr) => {
                let mut guard = stream.lock().unwrap();
                if guard.is_none() {
                    *guard = Some(TcpStream::connect(addr)?);
                }
                if let Err(e) = guard.as_mut().unwrap().write_all(buf) {
                    // drop the stream so the next record reconnects
                    *guard = None;
                    return Err(e);
                }
            }
            #[cfg(unix)]
            SyslogTarget::Kernel(socket) => {
                socket.send(buf)?;
            }
        }
        Ok(())
    }
}

impl LogWriter for SyslogWriter {
    fn write(&self, _now: &mut DeferredNow, record: &Record<'_>) -> Result<()> {
        let pri = SYSLOG_FACILITY * 8 + Self::severity(record.level());
        let message = format!(
            "<{}>{} {} {}[{}]: [{}] {}\n",
            pri,
            Local::now().format("%b %e %H:%M:%S"),
            self.hostname,
            SYSLOG_TAG,
            process::id(),
            record.level(),
            record.args(),
        );
        self.send(message.as_bytes())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

fn json_format(
    w: &mut dyn Write,
    _now: &mut DeferredNow,
    record: &Record<'_>,
) -> std::result::Result<(), std::io::Error> {
    let line = serde_json::json!({
        "time": Local::now().to_rfc3339(),
        "level": record.level().to_string(),
        "module": record.module_path().unwrap_or(""),
        "msg": record.args().to_string(),
    });
    write!(w, "{}", line)
}

// Build the process logger: stderr always, optionally mirrored to syslog,
// optionally JSON formatted.
pub fn init(debug: bool, json_log: bool, syslog: Option<&str>) -> anyhow::Result<LoggerHandle> {
    let spec = if debug { "debug" } else { "info" };
    let mut logger = Logger::try_with_env_or_str(spec)?;
    logger = if json_log {
        logger.format(json_format)
    } else {
        logger.format(colored_opt_format)
    };
    let logger = match syslog {
        Some(spec) => logger
            .log_to_writer(Box::new(SyslogWriter::new(spec)?))
            .duplicate_to_stderr(Duplicate::All),
        None => logger.log_to_stderr(),
    };
    Ok(logger.start()?)
}
