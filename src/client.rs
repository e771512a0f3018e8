//! Client: owns the switcher and the exchanger, enforces bring-up and
//! teardown ordering, and drives the 1 Hz maintenance tick.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::error::Result;
use crate::exchanger::{Exchanger, NetworkState};
use crate::platform::PlatformRouting;
use crate::protocol::LinkMessage;
use crate::switcher::NetworkSwitcher;
use crate::tap::TapDevice;
use crate::transmission::TransmissionConnector;

/// Owns one switcher/exchanger pair over the lifetime of a session.
///
/// All cross-calls between the two halves flow through `&mut` arguments
/// here, so neither stores a reference to the other and teardown order
/// is a plain sequence of calls.
pub struct Client {
    switcher: NetworkSwitcher,
    exchanger: Exchanger,
    running: Arc<AtomicBool>,
    epoch: Instant,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        tap: Arc<dyn TapDevice>,
        routing: Arc<dyn PlatformRouting>,
        connector: Arc<dyn TransmissionConnector>,
        underlying_gateway: Ipv4Addr,
    ) -> Self {
        let mut switcher =
            NetworkSwitcher::new(tap, routing, underlying_gateway, config.block_quic);
        for path in &config.iplist_files {
            switcher.add_iplist_file(path.as_str());
        }
        let exchanger = Exchanger::new(config, connector);
        Self {
            switcher,
            exchanger,
            running: Arc::new(AtomicBool::new(false)),
            epoch: Instant::now(),
        }
    }

    /// Milliseconds since the client was created; the tick clock every
    /// deadline in the engine compares against.
    pub fn now(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn state(&self) -> NetworkState {
        self.exchanger.state()
    }

    pub fn switcher(&self) -> &NetworkSwitcher {
        &self.switcher
    }

    pub fn exchanger(&self) -> &Exchanger {
        &self.exchanger
    }

    /// Flag other tasks may clear to stop [`run`](Self::run).
    pub fn running_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Bring the session up: exchanger first (transmission + handshake +
    /// mapping registration), then the switcher (routes and DNS install
    /// strictly follow a successful exchanger start).
    pub async fn open(&mut self) -> Result<()> {
        let now = self.now();
        self.exchanger.open(now).await?;
        if let Err(e) = self.switcher.open(&self.exchanger) {
            self.exchanger.dispose();
            return Err(e);
        }
        self.running.store(true, Ordering::SeqCst);
        if let Some(uri) = self.exchanger.remote_uri() {
            info!(remote = %uri, "Session open");
        }
        Ok(())
    }

    /// Frame read off the virtual interface.
    pub fn on_packet_input(&mut self, data: &[u8]) -> bool {
        let now = self.now();
        self.switcher.on_packet_input(data, &mut self.exchanger, now)
    }

    /// Message decoded off the transmission channel.
    pub fn on_message(&mut self, message: LinkMessage) -> bool {
        let now = self.now();
        self.exchanger.on_message(message, &mut self.switcher, now)
    }

    /// Drive maintenance at 1 Hz until the running flag is cleared, then
    /// shut down.
    pub async fn run(&mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            let now = self.now();
            if !self.switcher.tick(now, &mut self.exchanger) {
                warn!("Tick on a disposed switcher, stopping");
                break;
            }
        }
        self.shutdown();
        Ok(())
    }

    /// Run until the process receives an interrupt signal.
    pub async fn run_until_interrupted(&mut self) -> Result<()> {
        let running = self.running_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
                running.store(false, Ordering::SeqCst);
            }
        });
        self.run().await
    }

    /// Tear the session down: switcher disposes the exchanger, then
    /// reverts routes and DNS. Idempotent.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.switcher.dispose(&mut self.exchanger);
    }
}
