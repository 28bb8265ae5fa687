//! Live-stream session: resolves a channel, acquires a lease, spawns the child-process pair,
//! and runs the stall watchdog until teardown.
//!
//! A `SessionState` enum tracks lifecycle, and `run_until_closed` drives a `tokio::select!` loop
//! racing lease preemption, child-process exit, the watchdog tick, and a process-wide shutdown
//! signal, with a single teardown path regardless of which arm fires first.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::ChildStdout;
use tokio::sync::{broadcast, oneshot};
use tracing::{info, warn};

use crate::channel::Channel;
use crate::error::{GatewayError, Result};
use crate::tuner::arbiter::{Lease, LeaseKind, TunerArbiter};
use crate::tuner::supervisor::{self, ChildPipeline, Container, TranscodeCodec, TranscodeMode};

/// Time to wait after acquiring a lease before spawning the demodulator, so a retuned
/// receiver on a shared USB hub doesn't destabilise its sibling.
const SETTLE_DELAY: Duration = Duration::from_secs(1);
const WATCHDOG_TICK: Duration = Duration::from_secs(5);
const STALL_THRESHOLD_MILLIS: i64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Streaming,
    Draining,
    Released,
}

/// The container/codec/engine selectors resolved for one stream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSelectors {
    pub container: Container,
    pub codec: TranscodeCodec,
    pub mode: TranscodeMode,
}

/// Resolve request-supplied selectors against config defaults, applying the aliasing and
/// defaulting rules: `264`/`265`/`hevc` aliases, `av1` defaults to `mkv`, and a non-`copy`
/// codec with engine `none` is upgraded to `soft`.
pub fn resolve_selectors(
    container: Option<&str>,
    codec: Option<&str>,
    engine: Option<&str>,
    default_mode: TranscodeMode,
    default_codec: TranscodeCodec,
) -> StreamSelectors {
    let codec = codec
        .and_then(parse_codec_selector)
        .unwrap_or(default_codec);

    let container = container
        .and_then(parse_container_selector)
        .unwrap_or_else(|| {
            if codec == TranscodeCodec::Av1 {
                Container::Mkv
            } else {
                Container::Ts
            }
        });

    let mut mode = engine.and_then(parse_mode_selector).unwrap_or(default_mode);
    if codec != TranscodeCodec::Copy && mode == TranscodeMode::None {
        mode = TranscodeMode::Soft;
    }

    StreamSelectors {
        container,
        codec,
        mode,
    }
}

fn parse_codec_selector(s: &str) -> Option<TranscodeCodec> {
    match s.to_ascii_lowercase().as_str() {
        "copy" => Some(TranscodeCodec::Copy),
        "h264" | "264" => Some(TranscodeCodec::H264),
        "h265" | "265" | "hevc" => Some(TranscodeCodec::H265),
        "av1" => Some(TranscodeCodec::Av1),
        _ => None,
    }
}

fn parse_container_selector(s: &str) -> Option<Container> {
    match s.to_ascii_lowercase().as_str() {
        "ts" => Some(Container::Ts),
        "mkv" => Some(Container::Mkv),
        "mp4" => Some(Container::Mp4),
        _ => None,
    }
}

fn parse_mode_selector(s: &str) -> Option<TranscodeMode> {
    match s.to_ascii_lowercase().as_str() {
        "none" => Some(TranscodeMode::None),
        "soft" => Some(TranscodeMode::Soft),
        "qsv" => Some(TranscodeMode::Qsv),
        "nvenc" => Some(TranscodeMode::Nvenc),
        "vaapi" => Some(TranscodeMode::Vaapi),
        _ => None,
    }
}

/// Configuration needed to spawn a session's child processes, threaded through from `Config`.
/// The adapter id tuned is not configured here: it is the leased tuner's own id, so a session
/// always drives the physical device the arbiter actually granted it.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub demod_bin: String,
    pub transcoder_bin: String,
    pub channels_conf: PathBuf,
}

/// Wraps a transcoder's stdout, bumping a shared activity timestamp on every successful read.
/// This is how the watchdog observes "bytes crossed the output boundary" without the HTTP
/// streaming layer needing to know anything about sessions.
pub struct OutputTap {
    inner: ChildStdout,
    last_output_at: Arc<AtomicI64>,
}

impl OutputTap {
    fn new(inner: ChildStdout, last_output_at: Arc<AtomicI64>) -> Self {
        Self {
            inner,
            last_output_at,
        }
    }
}

impl AsyncRead for OutputTap {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            if buf.filled().len() > before {
                self.last_output_at.store(now_millis(), Ordering::Relaxed);
            }
        }
        result
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A live-stream session: owns the lease and child-process pair for one client request.
pub struct Session {
    id: u64,
    state: SessionState,
    lease: Option<Lease>,
    pipeline: ChildPipeline,
    cancel_rx: oneshot::Receiver<()>,
    last_output_at: Arc<AtomicI64>,
}

impl Session {
    /// Resolve the channel, acquire a lease, settle, and spawn the child-process pair.
    /// Returns before any bytes have been read, so callers may still answer a 5xx on failure.
    pub async fn start(
        id: u64,
        channel: &Channel,
        selectors: StreamSelectors,
        arbiter: Arc<TunerArbiter>,
        spawn_config: &SpawnConfig,
    ) -> Result<Self> {
        let lease = arbiter
            .acquire(LeaseKind::Live)
            .await
            .ok_or(GatewayError::NoTunerAvailable)?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        arbiter.set_cancel_trigger(lease.tuner_id, cancel_tx).await;

        tokio::time::sleep(SETTLE_DELAY).await;

        let demod_cmd = supervisor::demod_command(
            &spawn_config.demod_bin,
            &spawn_config.channels_conf,
            lease.tuner_id as u32,
            &channel.number,
            None,
        );
        let transcoder_cmd = supervisor::transcoder_command(
            &spawn_config.transcoder_bin,
            selectors.container,
            selectors.codec,
            selectors.mode,
        );

        let pipeline = match ChildPipeline::spawn(demod_cmd, transcoder_cmd) {
            Ok(p) => p,
            Err(e) => {
                arbiter.release(lease).await;
                return Err(GatewayError::TunerError(e.to_string()));
            }
        };

        info!(session_id = id, channel = %channel.number, tuner_id = lease.tuner_id, "session started");

        Ok(Self {
            id,
            state: SessionState::Starting,
            lease: Some(lease),
            pipeline,
            cancel_rx,
            last_output_at: Arc::new(AtomicI64::new(now_millis())),
        })
    }

    /// Take the transcoder's output stream, wrapped to feed the watchdog's activity clock.
    /// Returns `None` if already taken.
    pub fn take_output(&mut self) -> Option<OutputTap> {
        self.pipeline
            .take_output()
            .map(|stdout| OutputTap::new(stdout, self.last_output_at.clone()))
    }

    /// Drive the session to completion: races preemption, child-process exit, the stall
    /// watchdog, and process-wide shutdown, then tears down and releases the lease exactly
    /// once regardless of which arm fired.
    pub async fn run_until_closed(
        mut self,
        arbiter: Arc<TunerArbiter>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        self.state = SessionState::Streaming;
        let mut watchdog = tokio::time::interval(WATCHDOG_TICK);
        watchdog.tick().await; // first tick fires immediately; discard it

        let reason = loop {
            tokio::select! {
                biased;

                _ = &mut self.cancel_rx => break "preempted",

                _ = shutdown_rx.recv() => break "shutdown",

                exited = self.pipeline.wait_any_exit() => break exited,

                _ = watchdog.tick() => {
                    let idle_for = now_millis() - self.last_output_at.load(Ordering::Relaxed);
                    if idle_for >= STALL_THRESHOLD_MILLIS {
                        break "stalled";
                    }
                }
            }
        };

        self.state = SessionState::Draining;
        if reason != "preempted" {
            // A preempting acquire already triggered this tuner's cancel; the victim's own
            // teardown still runs below so its lease is only released once its demod exits.
        }
        warn!(session_id = self.id, reason, "session tearing down");
        self.pipeline.teardown().await;

        if let Some(lease) = self.lease.take() {
            arbiter.release(lease).await;
        }
        self.state = SessionState::Released;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_codec_with_unspecified_container_defaults_ts() {
        let s = resolve_selectors(
            None,
            Some("copy"),
            None,
            TranscodeMode::None,
            TranscodeCodec::Copy,
        );
        assert_eq!(s.container, Container::Ts);
        assert_eq!(s.mode, TranscodeMode::None);
    }

    #[test]
    fn av1_with_unspecified_container_defaults_mkv() {
        let s = resolve_selectors(
            None,
            Some("av1"),
            None,
            TranscodeMode::None,
            TranscodeCodec::Copy,
        );
        assert_eq!(s.container, Container::Mkv);
    }

    #[test]
    fn non_copy_codec_upgrades_none_engine_to_soft() {
        let s = resolve_selectors(
            None,
            Some("h264"),
            None,
            TranscodeMode::None,
            TranscodeCodec::Copy,
        );
        assert_eq!(s.mode, TranscodeMode::Soft);
    }

    #[test]
    fn codec_aliases_normalise() {
        assert_eq!(parse_codec_selector("264"), Some(TranscodeCodec::H264));
        assert_eq!(parse_codec_selector("265"), Some(TranscodeCodec::H265));
        assert_eq!(parse_codec_selector("hevc"), Some(TranscodeCodec::H265));
    }

    #[test]
    fn explicit_engine_is_not_overridden() {
        let s = resolve_selectors(
            None,
            Some("h264"),
            Some("nvenc"),
            TranscodeMode::None,
            TranscodeCodec::Copy,
        );
        assert_eq!(s.mode, TranscodeMode::Nvenc);
    }
}
