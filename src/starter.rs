//! Locating and launching verification engines.
//!
//! The starter either launches a local engine binary on a free port of the
//! configured range, or addresses a remote engine on the first in-range port
//! not already in use. Channels are opened lazily: the RPC runtime connects
//! on first use, so starting never blocks longer than the channel-connect
//! timeout.

use std::net::TcpListener;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

use crate::config::{EngineConfig, EngineLocality};
use crate::connection::EngineConnection;
use crate::error::{EngineError, EngineResult};

/// Launch attempts per connection before giving up on a local engine.
const LAUNCH_ATTEMPTS: u32 = 3;

/// How long a freshly launched process gets before the alive check.
const ALIVE_GRACE: Duration = Duration::from_millis(300);

/// TCP connect timeout applied to the lazy channel.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Keep-alive ping interval for idle engine channels.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Produces new engine connections on demand.
///
/// `Ok(None)` means no connection can be produced right now: the port range
/// is exhausted, or a local process never reported alive. A hard spawn
/// failure is an error and is not retried by the pool.
#[tonic::async_trait]
pub trait ConnectionStarter: Send + Sync {
    /// Tries to produce one new connection for `config`.
    ///
    /// `used_ports` lists the ports of the engine's already-open
    /// connections, so remote engines are not dialed twice on one port.
    async fn try_start_new_connection(
        &self,
        config: &Arc<EngineConfig>,
        used_ports: &[u16],
    ) -> EngineResult<Option<EngineConnection>>;
}

/// Default starter: spawns local binaries, dials remote engines.
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineStarter;

#[tonic::async_trait]
impl ConnectionStarter for EngineStarter {
    async fn try_start_new_connection(
        &self,
        config: &Arc<EngineConfig>,
        used_ports: &[u16],
    ) -> EngineResult<Option<EngineConnection>> {
        match &config.locality {
            EngineLocality::Local { binary, address } => {
                start_local(config, binary, address).await
            }
            EngineLocality::Remote { address } => connect_remote(config, address, used_ports),
        }
    }
}

async fn start_local(
    config: &Arc<EngineConfig>,
    binary: &Path,
    address: &str,
) -> EngineResult<Option<EngineConnection>> {
    let Some(port) = free_port(config, address) else {
        debug!(engine = %config.name, "no free port in range");
        return Ok(None);
    };

    for attempt in 1..=LAUNCH_ATTEMPTS {
        let mut child = spawn_engine(binary, address, port)?;
        tokio::time::sleep(ALIVE_GRACE).await;

        match child.try_wait() {
            // Still running: the engine is alive and owns the port.
            Ok(None) => {
                let channel = open_channel(address, port)?;
                debug!(engine = %config.name, port, "local engine started");
                return Ok(Some(EngineConnection::new(
                    Arc::clone(config),
                    channel,
                    port,
                    Some(child),
                )));
            }
            Ok(Some(status)) => {
                warn!(engine = %config.name, attempt, %status, "engine exited before reporting alive");
            }
            Err(cause) => {
                return Err(EngineError::ProcessStart {
                    binary: binary.to_path_buf(),
                    cause,
                });
            }
        }
    }

    warn!(engine = %config.name, "unable to start local engine");
    Ok(None)
}

fn connect_remote(
    config: &Arc<EngineConfig>,
    address: &str,
    used_ports: &[u16],
) -> EngineResult<Option<EngineConnection>> {
    let Some(port) = config.ports().find(|port| !used_ports.contains(port)) else {
        debug!(engine = %config.name, "all in-range ports are in use");
        return Ok(None);
    };

    let channel = open_channel(address, port)?;
    debug!(engine = %config.name, port, "remote engine connection opened");
    Ok(Some(EngineConnection::new(
        Arc::clone(config),
        channel,
        port,
        None,
    )))
}

/// First port of the range that is not already bound on `address`.
fn free_port(config: &EngineConfig, address: &str) -> Option<u16> {
    config
        .ports()
        .find(|port| TcpListener::bind((address, *port)).is_ok())
}

fn spawn_engine(binary: &Path, address: &str, port: u16) -> EngineResult<Child> {
    let mut child = Command::new(binary)
        .arg("-p")
        .arg(format!("{address}:{port}"))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|cause| EngineError::ProcessStart {
            binary: binary.to_path_buf(),
            cause,
        })?;

    // stderr is merged with stdout: both land on the same log target.
    if let Some(stdout) = child.stdout.take() {
        forward_output(stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        forward_output(stderr);
    }
    Ok(child)
}

fn forward_output(pipe: impl AsyncRead + Unpin + Send + 'static) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "veribridge::engine", "{line}");
        }
    });
}

fn open_channel(address: &str, port: u16) -> EngineResult<Channel> {
    let endpoint = Endpoint::from_shared(format!("http://{address}:{port}"))
        .map_err(|cause| EngineError::Protocol {
            message: format!("invalid engine address '{address}:{port}': {cause}"),
        })?
        .connect_timeout(CONNECT_TIMEOUT)
        .http2_keep_alive_interval(KEEP_ALIVE_INTERVAL)
        .keep_alive_while_idle(true);
    Ok(endpoint.connect_lazy())
}
