//! Child-process supervisor — spawns a demodulator + transcoder pair, wires their pipes, and
//! enforces graceful-then-forceful teardown.
//!
//! Demodulator stdout is forwarded to transcoder stdin by a background task reading into a
//! bounded buffer, draining the byte stream without ever blocking teardown on a stalled read.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Transcode engine selector (`§4.3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TranscodeMode {
    None,
    Soft,
    Qsv,
    Nvenc,
    Vaapi,
}

/// Output codec selector (`§4.3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TranscodeCodec {
    Copy,
    H264,
    H265,
    Av1,
}

/// Output container selector (`§4.3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Ts,
    Mkv,
    Mp4,
}

impl Container {
    pub fn content_type(self) -> &'static str {
        match self {
            Container::Ts => "video/mp2t",
            Container::Mkv => "video/x-matroska",
            Container::Mp4 => "video/mp4",
        }
    }
}

/// Build the demodulator's argv. Flags per the external-interfaces contract:
/// `-c <conf> -r -a <adapterId> -o - <channelNumber>`, plus `-t <seconds>` for bounded captures.
pub fn demod_command(
    bin: &str,
    conf: &Path,
    adapter_id: u32,
    channel_number: &str,
    capture_seconds: Option<u64>,
) -> Command {
    let mut cmd = Command::new(bin);
    cmd.arg("-c")
        .arg(conf)
        .arg("-r")
        .arg("-a")
        .arg(adapter_id.to_string())
        .arg("-o")
        .arg("-");
    if let Some(secs) = capture_seconds {
        cmd.arg("-t").arg(secs.to_string());
    }
    cmd.arg(channel_number);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

/// Build the transcoder's argv for the given container/codec/engine combination.
pub fn transcoder_command(
    bin: &str,
    container: Container,
    codec: TranscodeCodec,
    mode: TranscodeMode,
) -> Command {
    let mut cmd = Command::new(bin);
    cmd.arg("-hide_banner").arg("-loglevel").arg("warning");

    match mode {
        TranscodeMode::Qsv => {
            cmd.arg("-init_hw_device")
                .arg("qsv=hw")
                .arg("-filter_hw_device")
                .arg("hw");
        }
        TranscodeMode::Nvenc => {
            cmd.arg("-hwaccel")
                .arg("cuda")
                .arg("-hwaccel_output_format")
                .arg("cuda");
        }
        TranscodeMode::Vaapi => {
            cmd.arg("-vaapi_device").arg("/dev/dri/renderD128");
        }
        TranscodeMode::Soft | TranscodeMode::None => {}
    }

    cmd.arg("-i").arg("pipe:0");

    match codec {
        TranscodeCodec::Copy => {
            cmd.arg("-c").arg("copy");
        }
        _ => {
            let video_codec = match (codec, mode) {
                (TranscodeCodec::H264, TranscodeMode::Nvenc) => "h264_nvenc",
                (TranscodeCodec::H264, TranscodeMode::Qsv) => "h264_qsv",
                (TranscodeCodec::H264, TranscodeMode::Vaapi) => "h264_vaapi",
                (TranscodeCodec::H264, _) => "libx264",
                (TranscodeCodec::H265, TranscodeMode::Nvenc) => "hevc_nvenc",
                (TranscodeCodec::H265, TranscodeMode::Qsv) => "hevc_qsv",
                (TranscodeCodec::H265, TranscodeMode::Vaapi) => "hevc_vaapi",
                (TranscodeCodec::H265, _) => "libx265",
                (TranscodeCodec::Av1, _) => "libsvtav1",
                (TranscodeCodec::Copy, _) => unreachable!("copy handled above"),
            };
            cmd.arg("-c:v").arg(video_codec);
            if matches!(mode, TranscodeMode::Soft | TranscodeMode::None) {
                cmd.arg("-preset")
                    .arg("ultrafast")
                    .arg("-tune")
                    .arg("zerolatency");
            }
            cmd.arg("-c:a")
                .arg("aac")
                .arg("-b:a")
                .arg("128k")
                .arg("-ac")
                .arg("2");
        }
    }

    if container == Container::Mp4 {
        cmd.arg("-movflags")
            .arg("frag_keyframe+empty_moov+default_base_moof");
    }

    let format = match container {
        Container::Ts => "mpegts",
        Container::Mkv => "matroska",
        Container::Mp4 => "mp4",
    };
    cmd.arg("-f").arg(format).arg("pipe:1");

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

/// A live demodulator + transcoder pair, piped together, with idempotent teardown.
pub struct ChildPipeline {
    demod: Child,
    transcoder: Child,
    transcoder_stdout: Option<tokio::process::ChildStdout>,
    torn_down: Arc<AtomicBool>,
}

const GRACE_PERIOD: Duration = Duration::from_secs(2);
const SAFETY_TIMER: Duration = Duration::from_secs(2);
const SCROLLBACK_LINES: usize = 10;

impl ChildPipeline {
    /// Spawn the pair and wire demodulator stdout into transcoder stdin.
    pub fn spawn(mut demod_cmd: Command, mut transcoder_cmd: Command) -> std::io::Result<Self> {
        let mut demod = demod_cmd.spawn()?;
        let mut transcoder = match transcoder_cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = demod.start_kill();
                return Err(e);
            }
        };

        let demod_stdout = demod
            .stdout
            .take()
            .expect("demod spawned with piped stdout");
        let mut transcoder_stdin = transcoder
            .stdin
            .take()
            .expect("transcoder spawned with piped stdin");
        let transcoder_stdout = transcoder.stdout.take();
        let transcoder_stderr = transcoder.stderr.take();

        // Last 10 lines of transcoder diagnostic output, for non-client-initiated pipe errors.
        // Owned by the two background tasks below, not the pipeline itself.
        let scrollback = Arc::new(Mutex::new(VecDeque::with_capacity(SCROLLBACK_LINES)));

        // demodulator stdout -> transcoder stdin.
        {
            let scrollback = scrollback.clone();
            tokio::spawn(async move {
                let mut reader = demod_stdout;
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    let n = match reader.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            log_pipe_error("demodulator stdout read", &e, &scrollback);
                            break;
                        }
                    };
                    if let Err(e) = transcoder_stdin.write_all(&buf[..n]).await {
                        if is_client_gone(&e) {
                            debug!("transcoder stdin closed, ending session normally");
                        } else {
                            log_pipe_error("transcoder stdin write", &e, &scrollback);
                        }
                        break;
                    }
                }
            });
        }

        // transcoder stderr -> scrollback ring buffer.
        if let Some(stderr) = transcoder_stderr {
            let scrollback = scrollback.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut buf = scrollback.lock().unwrap();
                    if buf.len() >= SCROLLBACK_LINES {
                        buf.pop_front();
                    }
                    buf.push_back(line);
                }
            });
        }

        Ok(Self {
            demod,
            transcoder,
            transcoder_stdout,
            torn_down: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Take the transcoder's stdout for forwarding to the client. Only ever returns `Some` once.
    pub fn take_output(&mut self) -> Option<tokio::process::ChildStdout> {
        self.transcoder_stdout.take()
    }

    /// Resolve as soon as either child exits on its own, naming which one. Safe to call
    /// repeatedly (and to race against other futures) since `Child::wait` is idempotent once
    /// an exit status has been observed.
    pub async fn wait_any_exit(&mut self) -> &'static str {
        tokio::select! {
            _ = self.demod.wait() => "demodulator exited",
            _ = self.transcoder.wait() => "transcoder exited",
        }
    }

    /// Graceful-then-forceful teardown. Idempotent: a second call is a no-op.
    pub async fn teardown(&mut self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        send_signal(&self.transcoder, Signal::SIGTERM);
        send_signal(&self.demod, Signal::SIGTERM);

        let (transcoder_exited, demod_exited) = tokio::join!(
            wait_with_timeout(&mut self.transcoder, GRACE_PERIOD),
            wait_with_timeout(&mut self.demod, GRACE_PERIOD),
        );

        if !transcoder_exited {
            let _ = self.transcoder.start_kill();
        }
        if !demod_exited {
            let _ = self.demod.start_kill();
        }

        // Demodulator holds the kernel hardware lock; wait (bounded) for its exit before the
        // caller treats the lease as releasable. If this safety timer elapses, proceed anyway.
        if !wait_with_timeout(&mut self.demod, SAFETY_TIMER).await {
            warn!("demodulator exit not observed within safety timer; releasing lease anyway");
        }
    }
}

fn is_client_gone(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
    )
}

fn log_pipe_error(context: &str, e: &std::io::Error, scrollback: &Arc<Mutex<VecDeque<String>>>) {
    if is_client_gone(e) {
        debug!(context, "pipe closed (client-initiated end of session)");
        return;
    }
    let lines = scrollback.lock().unwrap();
    warn!(context, error = %e, scrollback = ?lines, "pipe error");
}

fn send_signal(child: &Child, signal: Signal) {
    if let Some(pid) = child.id() {
        let _ = signal::kill(Pid::from_raw(pid as i32), signal);
        info!(pid, ?signal, "sent signal to child process");
    }
}

async fn wait_with_timeout(child: &mut Child, dur: Duration) -> bool {
    tokio::time::timeout(dur, child.wait()).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_codec_skips_encoder_args() {
        let cmd = transcoder_command(
            "ffmpeg",
            Container::Ts,
            TranscodeCodec::Copy,
            TranscodeMode::None,
        );
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert!(args.contains(&"copy".to_string()));
        assert!(!args.iter().any(|a| a == "libx264"));
    }

    #[test]
    fn mp4_container_adds_fragmenting_flags() {
        let cmd = transcoder_command(
            "ffmpeg",
            Container::Mp4,
            TranscodeCodec::H264,
            TranscodeMode::Soft,
        );
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert!(args.iter().any(|a| a.contains("frag_keyframe")));
    }

    #[test]
    fn soft_mode_uses_libx264_with_zerolatency_preset() {
        let cmd = transcoder_command(
            "ffmpeg",
            Container::Ts,
            TranscodeCodec::H264,
            TranscodeMode::Soft,
        );
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert!(args.contains(&"libx264".to_string()));
        assert!(args.contains(&"zerolatency".to_string()));
    }

    #[test]
    fn hardware_modes_pick_accelerated_encoders() {
        let cmd = transcoder_command(
            "ffmpeg",
            Container::Ts,
            TranscodeCodec::H265,
            TranscodeMode::Nvenc,
        );
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert!(args.contains(&"hevc_nvenc".to_string()));
    }

    #[test]
    fn demod_command_includes_capture_deadline_for_epg_scans() {
        let cmd = demod_command(
            "demodulator",
            Path::new("channels.conf"),
            0,
            "15.1",
            Some(15),
        );
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert!(args.contains(&"-t".to_string()));
        assert!(args.contains(&"15".to_string()));
        assert!(args.contains(&"15.1".to_string()));
    }
}
