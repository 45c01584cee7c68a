//! One established RPC channel, plus the owned OS process for local
//! engines, to a single verification engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::Child;
use tonic::transport::Channel;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::transport::VerificationEngineClient;

/// Grace period for channel/process shutdown before forcing closure.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(45);

/// A live connection to one engine.
///
/// Created by the connection starter and owned by the pool that started
/// it. The process handle is present iff the engine is local; no two
/// connections share a process.
#[derive(Debug)]
pub struct EngineConnection {
    config: Arc<EngineConfig>,
    port: u16,
    channel: Mutex<Option<Channel>>,
    process: tokio::sync::Mutex<Option<Child>>,
    closed: AtomicBool,
    #[cfg(test)]
    pub(crate) fail_close: AtomicBool,
}

impl EngineConnection {
    pub(crate) fn new(
        config: Arc<EngineConfig>,
        channel: Channel,
        port: u16,
        process: Option<Child>,
    ) -> Self {
        Self {
            config,
            port,
            channel: Mutex::new(Some(channel)),
            process: tokio::sync::Mutex::new(process),
            closed: AtomicBool::new(false),
            #[cfg(test)]
            fail_close: AtomicBool::new(false),
        }
    }

    /// Config of the engine this connection belongs to.
    #[must_use]
    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Port the channel's authority points at.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Whether `close` has completed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// A fresh RPC stub over this connection's channel.
    ///
    /// Stubs are cheap clones of the underlying channel; every request
    /// obtains its own.
    pub fn client(&self) -> EngineResult<VerificationEngineClient<Channel>> {
        self.channel
            .lock()
            .expect("channel lock poisoned")
            .as_ref()
            .map(|channel| VerificationEngineClient::new(channel.clone()))
            .ok_or(EngineError::ConnectionClosed)
    }

    /// Releases the channel and, for local engines, terminates the owned
    /// process. Idempotent: the second call is a no-op.
    pub async fn close(&self) -> EngineResult<()> {
        #[cfg(test)]
        if self.fail_close.load(Ordering::Acquire) {
            return Err(EngineError::Protocol {
                message: "injected close failure".to_string(),
            });
        }

        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.channel.lock().expect("channel lock poisoned").take();

        let process = self.process.lock().await.take();
        if let Some(child) = process {
            self.terminate(child).await?;
        }

        debug!(engine = %self.config.name, port = self.port, "engine connection closed");
        Ok(())
    }

    async fn terminate(&self, mut child: Child) -> EngineResult<()> {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // Ask politely first; the grace period below bounds the wait.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(engine = %self.config.name, %status, "engine process exited");
                Ok(())
            }
            Ok(Err(cause)) => Err(EngineError::Protocol {
                message: format!("failed to reap engine process: {cause}"),
            }),
            Err(_) => {
                warn!(engine = %self.config.name, port = self.port, "engine process ignored shutdown, killing");
                child.start_kill().map_err(|cause| EngineError::Protocol {
                    message: format!("failed to kill engine process: {cause}"),
                })?;
                child.wait().await.map_err(|cause| EngineError::Protocol {
                    message: format!("failed to reap engine process: {cause}"),
                })?;
                Ok(())
            }
        }
    }
}
