//! EPG scan orchestrator: startup/periodic cadence, the all-or-nothing tuner guard, and the
//! per-frequency capture-then-parse loop.
//!
//! A `tokio::spawn`'d background loop driven by a `tokio::time::interval`, with each unit of work
//! wrapped in `tokio::time::timeout` and failures logged and skipped rather than aborting the
//! loop. Scanning is strictly sequential across frequencies since it competes with live sessions
//! for the same pool of physical tuners via the arbiter's `Epg` lease kind.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::channel::ChannelRegistry;
use crate::epg::parser::EpgParser;
use crate::epg::store::EpgStore;
use crate::error::{GatewayError, Result};
use crate::tuner::arbiter::{LeaseKind, TunerArbiter};
use crate::tuner::supervisor;

const STARTUP_CAPTURE_SECS: u64 = 30;
const PERIODIC_CAPTURE_SECS: u64 = 15;
/// Slack added on top of the demodulator's own `-t` deadline, in case it ignores it.
const CAPTURE_GRACE: Duration = Duration::from_secs(5);
const PERIODIC_SCAN_INTERVAL: Duration = Duration::from_secs(15 * 60);
const INTER_FREQUENCY_DELAY: Duration = Duration::from_secs(2);
const MAX_CAPTURE_BYTES: usize = 50 * 1024 * 1024;
const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct EpgOrchestrator {
    channels: Arc<ChannelRegistry>,
    arbiter: Arc<TunerArbiter>,
    store: Arc<EpgStore>,
    demod_bin: String,
    channels_conf: PathBuf,
    store_existed_at_boot: bool,
    ready: Arc<AtomicBool>,
}

impl EpgOrchestrator {
    pub fn new(
        channels: Arc<ChannelRegistry>,
        arbiter: Arc<TunerArbiter>,
        store: Arc<EpgStore>,
        demod_bin: String,
        channels_conf: PathBuf,
        store_existed_at_boot: bool,
    ) -> Self {
        Self {
            channels,
            arbiter,
            store,
            demod_bin,
            channels_conf,
            store_existed_at_boot,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether the startup deep scan has completed (or was skipped). Stream requests that
    /// arrive before this is set must wait, per the startup-scan gating contract.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Block the caller until `is_ready()`, polling at the same cadence the gate is documented
    /// to use. Cheap: most callers observe it already true and return immediately.
    pub async fn wait_until_ready(&self) {
        while !self.is_ready() {
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Used when EPG scanning is disabled entirely: skip the startup gate without ever
    /// touching a tuner, so stream requests proceed immediately.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    async fn run(&self) {
        if self.store_existed_at_boot {
            info!("epg store already present at boot, skipping startup deep scan");
        } else {
            info!("starting epg deep scan before first stream request is admitted");
            self.run_scan_cycle(STARTUP_CAPTURE_SECS).await;
        }
        self.ready.store(true, Ordering::Release);

        let mut ticker = tokio::time::interval(PERIODIC_SCAN_INTERVAL);
        ticker.tick().await; // first tick fires immediately; discard it
        loop {
            ticker.tick().await;
            self.run_scan_cycle(PERIODIC_CAPTURE_SECS).await;
        }
    }

    /// Scan every distinct frequency in sequence, skipping the whole cycle if any tuner is
    /// currently leased (the all-or-nothing guard: EPG scanning never preempts a live session).
    async fn run_scan_cycle(&self, capture_secs: u64) {
        if !self.arbiter.all_idle().await {
            warn!("skipping epg scan cycle: a tuner is in use");
            return;
        }

        for frequency in self.channels.distinct_frequencies() {
            match self.scan_frequency(&frequency, capture_secs).await {
                Ok(applied) => info!(frequency, applied, "epg scan applied program rows"),
                Err(e) => {
                    warn!(frequency, error = %e, "epg scan failed, continuing to next frequency")
                }
            }
            tokio::time::sleep(INTER_FREQUENCY_DELAY).await;
        }
    }

    async fn scan_frequency(&self, frequency: &str, capture_secs: u64) -> Result<usize> {
        let lease = self
            .arbiter
            .acquire(LeaseKind::Epg)
            .await
            .ok_or(GatewayError::NoTunerAvailable)?;
        let tuner_id = lease.tuner_id as u32;
        let captured = self.capture(frequency, tuner_id, capture_secs).await;
        self.arbiter.release(lease).await;
        let buffer = captured?;

        let mut parser = EpgParser::new(&self.channels, frequency);
        parser.feed(&buffer);
        debug!(
            frequency,
            pid_counts = ?parser.pid_counts(),
            diagnostic_table_counts = ?parser.diagnostic_table_counts(),
            "epg capture packet counts"
        );
        let output = parser.finish();
        // Upserts land before description updates so an ETT arriving earlier in the captured
        // buffer than its EIT never races a still-missing row (see the store's upsert contract).
        for row in &output.upserts {
            self.store.upsert_program(row).await?;
        }
        for update in &output.description_updates {
            self.store
                .update_description(
                    frequency,
                    &update.channel_service_id,
                    update.event_id,
                    &update.description,
                )
                .await?;
        }
        Ok(output.upserts.len() + output.description_updates.len())
    }

    /// Tune a representative channel on `frequency` for `capture_secs`, capturing raw MPEG-TS
    /// into memory, capped at `MAX_CAPTURE_BYTES` with a kill if exceeded.
    async fn capture(&self, frequency: &str, tuner_id: u32, capture_secs: u64) -> Result<Vec<u8>> {
        let channel = self
            .channels
            .all()
            .iter()
            .find(|c| c.frequency == frequency)
            .ok_or_else(|| {
                GatewayError::ScanError(format!("no channel configured for frequency {frequency}"))
            })?;

        let mut cmd = supervisor::demod_command(
            &self.demod_bin,
            &self.channels_conf,
            tuner_id,
            &channel.number,
            Some(capture_secs),
        );
        let mut child = cmd.spawn().map_err(GatewayError::Io)?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::ScanError("demodulator has no stdout".into()))?;

        let overall_timeout = Duration::from_secs(capture_secs) + CAPTURE_GRACE;
        let read_result = tokio::time::timeout(overall_timeout, async {
            let mut buffer = Vec::new();
            let mut chunk = [0u8; 64 * 1024];
            loop {
                let n = stdout.read(&mut chunk).await.map_err(GatewayError::Io)?;
                if n == 0 {
                    break;
                }
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() >= MAX_CAPTURE_BYTES {
                    warn!(
                        frequency,
                        "epg capture buffer cap reached, killing demodulator"
                    );
                    let _ = child.start_kill();
                    break;
                }
            }
            Ok::<Vec<u8>, GatewayError>(buffer)
        })
        .await;

        let _ = child.start_kill();
        let _ = child.wait().await;

        match read_result {
            Ok(inner) => inner,
            Err(_) => Err(GatewayError::ScanError(format!(
                "epg capture on {frequency} exceeded {overall_timeout:?}"
            ))),
        }
    }
}
