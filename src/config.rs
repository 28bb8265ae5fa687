//! Layered configuration: CLI flags > config file > environment variables > defaults.
//!
//! Each setting resolves via `args.x.or(file.x).or(env.x).unwrap_or(default)`, so a flag always
//! wins over the config file, which always wins over the environment.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::tuner::supervisor::{TranscodeCodec, TranscodeMode};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "HTTP gateway exposing tuners as streamable channels with an EPG"
)]
struct Args {
    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Path to the channels-config file
    #[arg(long)]
    channels_conf: Option<PathBuf>,

    /// Path to a TOML config file (defaults to ./channelgate.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Allow a `live` request to preempt another `live` session
    #[arg(long, default_value_t = false)]
    enable_preemption: bool,

    /// Disable the EPG scan orchestrator
    #[arg(long, default_value_t = false)]
    disable_epg: bool,

    /// Transcode engine
    #[arg(long)]
    transcode_mode: Option<TranscodeMode>,

    /// Transcode codec
    #[arg(long)]
    transcode_codec: Option<TranscodeCodec>,

    /// Enable debug-level logging
    #[arg(long, default_value_t = false)]
    verbose: bool,

    /// Directory for log files
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value_t = 7)]
    log_retention_days: u64,

    /// Path to the EPG SQLite store
    #[arg(long, default_value = "channelgate.db")]
    store: PathBuf,

    /// Number of physical tuners available
    #[arg(long, default_value_t = 2)]
    tuner_count: usize,

    /// Demodulator binary (tunes a channel, writes raw MPEG-TS to stdout)
    #[arg(long, default_value = "recisdb")]
    demod_bin: String,

    /// Transcoder binary
    #[arg(long, default_value = "ffmpeg")]
    transcoder_bin: String,
}

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,
}

#[derive(Debug, Deserialize, Default)]
struct ServerSection {
    port: Option<u16>,
    channels_conf: Option<String>,
    enable_preemption: Option<bool>,
    enable_epg: Option<bool>,
    transcode_mode: Option<String>,
    transcode_codec: Option<String>,
}

/// Fully resolved configuration used to construct the gateway's components.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub channels_conf: PathBuf,
    pub enable_preemption: bool,
    pub enable_epg: bool,
    pub transcode_mode: TranscodeMode,
    pub transcode_codec: TranscodeCodec,
    pub verbose: bool,
    pub log_dir: PathBuf,
    pub log_retention_days: u64,
    pub store_path: PathBuf,
    pub tuner_count: usize,
    pub demod_bin: String,
    pub transcoder_bin: String,
}

impl Config {
    /// Parse CLI args and merge with config file and environment, CLI taking precedence.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let args = Args::parse();

        let config_path = args.config.clone().or_else(|| {
            let default = PathBuf::from("channelgate.toml");
            default.exists().then_some(default)
        });
        let file = match &config_path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)?;
                toml::from_str(&contents)?
            }
            None => ConfigFile::default(),
        };

        let port = args
            .port
            .or(file.server.port)
            .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(3000);

        let channels_conf = args
            .channels_conf
            .or_else(|| file.server.channels_conf.map(PathBuf::from))
            .or_else(|| std::env::var("CHANNELS_CONF").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("channels.conf"));

        let enable_preemption = args.enable_preemption
            || file.server.enable_preemption.unwrap_or(false)
            || env_bool("ENABLE_PREEMPTION");

        let enable_epg = if args.disable_epg {
            false
        } else {
            file.server
                .enable_epg
                .or_else(|| std::env::var("ENABLE_EPG").ok().map(|v| parse_bool(&v)))
                .unwrap_or(true)
        };

        let transcode_mode = args
            .transcode_mode
            .or_else(|| file.server.transcode_mode.as_deref().and_then(parse_mode))
            .or_else(|| {
                std::env::var("TRANSCODE_MODE")
                    .ok()
                    .as_deref()
                    .and_then(parse_mode)
            })
            .unwrap_or(TranscodeMode::None);

        let transcode_codec = args
            .transcode_codec
            .or_else(|| file.server.transcode_codec.as_deref().and_then(parse_codec))
            .or_else(|| {
                std::env::var("TRANSCODE_CODEC")
                    .ok()
                    .as_deref()
                    .and_then(parse_codec)
            })
            .unwrap_or(TranscodeCodec::Copy);

        let verbose = args.verbose || env_bool("VERBOSE_LOGGING");

        Ok(Config {
            port,
            channels_conf,
            enable_preemption,
            enable_epg,
            transcode_mode,
            transcode_codec,
            verbose,
            log_dir: args.log_dir,
            log_retention_days: args.log_retention_days,
            store_path: args.store,
            tuner_count: args.tuner_count,
            demod_bin: args.demod_bin,
            transcoder_bin: args.transcoder_bin,
        })
    }
}

fn env_bool(name: &str) -> bool {
    std::env::var(name).map(|v| parse_bool(&v)).unwrap_or(false)
}

fn parse_bool(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_mode(v: &str) -> Option<TranscodeMode> {
    match v.to_ascii_lowercase().as_str() {
        "none" => Some(TranscodeMode::None),
        "soft" => Some(TranscodeMode::Soft),
        "qsv" => Some(TranscodeMode::Qsv),
        "nvenc" => Some(TranscodeMode::Nvenc),
        "vaapi" => Some(TranscodeMode::Vaapi),
        _ => None,
    }
}

fn parse_codec(v: &str) -> Option<TranscodeCodec> {
    match v.to_ascii_lowercase().as_str() {
        "copy" => Some(TranscodeCodec::Copy),
        "h264" | "264" => Some(TranscodeCodec::H264),
        "h265" | "265" | "hevc" => Some(TranscodeCodec::H265),
        "av1" => Some(TranscodeCodec::Av1),
        _ => None,
    }
}
