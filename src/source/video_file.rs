use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use tracing::{error, info, warn};

use crate::frame::Frame;
use crate::source::{FrameSource, SourceError};

const PAUSE_POLL: Duration = Duration::from_millis(50);
const DECODE_RETRY_BACKOFF: Duration = Duration::from_millis(500);
const DEFAULT_FPS: f64 = 25.0;

/// Frame source decoding a video feed through an ffmpeg rawvideo pipe.
/// Works for local files and for network locators ffmpeg understands.
pub struct VideoFileSource {
    locator: String,
    loop_playback: bool,
    inner: Arc<Inner>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

struct Inner {
    last_frame: Mutex<Option<Frame>>,
    paused: AtomicBool,
    running: AtomicBool,
    decoder: Mutex<Option<Child>>,
}

impl VideoFileSource {
    pub fn new(locator: impl Into<String>, loop_playback: bool, start_paused: bool) -> Self {
        Self {
            locator: locator.into(),
            loop_playback,
            inner: Arc::new(Inner {
                last_frame: Mutex::new(None),
                paused: AtomicBool::new(start_paused),
                running: AtomicBool::new(false),
                decoder: Mutex::new(None),
            }),
            handle: Mutex::new(None),
        }
    }
}

impl FrameSource for VideoFileSource {
    fn start(&self) -> Result<(), SourceError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let probe = match probe_feed(&self.locator) {
            Ok(probe) => probe,
            Err(err) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        info!(
            locator = %self.locator,
            width = probe.width,
            height = probe.height,
            fps = probe.fps,
            "video source opened"
        );

        let inner = Arc::clone(&self.inner);
        let locator = self.locator.clone();
        let loop_playback = self.loop_playback;
        let handle = match thread::Builder::new()
            .name(format!("decode-{}", self.locator))
            .spawn(move || read_loop(inner, locator, loop_playback, probe))
        {
            Ok(handle) => handle,
            Err(err) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(err.into());
            }
        };

        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(handle);
        }
        Ok(())
    }

    fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);

        // Kill any live decoder so a blocked pipe read unblocks promptly.
        if let Ok(mut decoder) = self.inner.decoder.lock() {
            if let Some(mut child) = decoder.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }

        let handle = self.handle.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(locator = %self.locator, "decode thread panicked during shutdown");
            }
        }
    }

    fn play(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    fn snapshot(&self) -> Option<Frame> {
        self.inner.last_frame.lock().ok().and_then(|guard| guard.clone())
    }
}

fn read_loop(inner: Arc<Inner>, locator: String, loop_playback: bool, probe: ProbeInfo) {
    let frame_len = Frame::expected_len(probe.width, probe.height);
    let delay = Duration::from_secs_f64(1.0 / probe.fps.max(1.0));

    while inner.running.load(Ordering::SeqCst) {
        if inner.paused.load(Ordering::SeqCst) {
            thread::sleep(PAUSE_POLL);
            continue;
        }

        let mut child = match spawn_decoder(&locator) {
            Ok(child) => child,
            Err(err) => {
                warn!(locator = %locator, error = %err, "failed to spawn decoder, retrying");
                thread::sleep(DECODE_RETRY_BACKOFF);
                continue;
            }
        };

        let Some(mut stdout) = child.stdout.take() else {
            warn!(locator = %locator, "decoder has no stdout, retrying");
            let _ = child.kill();
            let _ = child.wait();
            thread::sleep(DECODE_RETRY_BACKOFF);
            continue;
        };

        if let Ok(mut decoder) = inner.decoder.lock() {
            *decoder = Some(child);
        }

        let mut buffer = vec![0u8; frame_len];
        loop {
            if !inner.running.load(Ordering::SeqCst) {
                break;
            }
            if inner.paused.load(Ordering::SeqCst) {
                // Backpressure on the pipe keeps the decoder from running
                // ahead while paused.
                thread::sleep(PAUSE_POLL);
                continue;
            }

            match stdout.read_exact(&mut buffer) {
                Ok(()) => {
                    if let Ok(mut cell) = inner.last_frame.lock() {
                        *cell = Some(Frame {
                            rgb: buffer.clone(),
                            width: probe.width,
                            height: probe.height,
                        });
                    }
                    thread::sleep(delay);
                }
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    if loop_playback {
                        info!(locator = %locator, "end of stream, rewinding");
                    } else {
                        info!(locator = %locator, "end of stream, pausing");
                        inner.paused.store(true, Ordering::SeqCst);
                    }
                    break;
                }
                Err(err) => {
                    if inner.running.load(Ordering::SeqCst) {
                        warn!(locator = %locator, error = %err, "decode read failed, retrying");
                        thread::sleep(DECODE_RETRY_BACKOFF);
                    }
                    break;
                }
            }
        }

        if let Ok(mut decoder) = inner.decoder.lock() {
            if let Some(mut child) = decoder.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }

    info!(locator = %locator, "decode loop stopped");
}

fn spawn_decoder(locator: &str) -> std::io::Result<Child> {
    Command::new("ffmpeg")
        .args(decoder_args(locator))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
}

fn decoder_args(locator: &str) -> Vec<String> {
    vec![
        "-v".into(),
        "error".into(),
        "-i".into(),
        locator.into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgb24".into(),
        "pipe:1".into(),
    ]
}

#[derive(Debug, Clone, Copy)]
struct ProbeInfo {
    width: u32,
    height: u32,
    fps: f64,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: u32,
    height: u32,
    #[serde(default)]
    avg_frame_rate: String,
}

fn probe_feed(locator: &str) -> Result<ProbeInfo, SourceError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,avg_frame_rate",
            "-of",
            "json",
            locator,
        ])
        .output()
        .map_err(|err| SourceError::OpenFailed {
            locator: locator.to_string(),
            detail: format!("ffprobe unavailable: {err}"),
        })?;

    if !output.status.success() {
        return Err(SourceError::OpenFailed {
            locator: locator.to_string(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    parse_probe_output(&output.stdout).ok_or_else(|| SourceError::OpenFailed {
        locator: locator.to_string(),
        detail: "no video stream found".to_string(),
    })
}

fn parse_probe_output(raw: &[u8]) -> Option<ProbeInfo> {
    let parsed: ProbeOutput = serde_json::from_slice(raw).ok()?;
    let stream = parsed.streams.into_iter().next()?;
    if stream.width == 0 || stream.height == 0 {
        return None;
    }
    Some(ProbeInfo {
        width: stream.width,
        height: stream.height,
        fps: parse_frame_rate(&stream.avg_frame_rate),
    })
}

fn parse_frame_rate(raw: &str) -> f64 {
    let mut parts = raw.splitn(2, '/');
    let numerator: f64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0.0);
    let denominator: f64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(1.0);
    if numerator > 0.0 && denominator > 0.0 {
        numerator / denominator
    } else {
        DEFAULT_FPS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fractional_frame_rate() {
        assert!((parse_frame_rate("30000/1001") - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("25/1"), 25.0);
    }

    #[test]
    fn zero_or_garbage_frame_rate_falls_back() {
        assert_eq!(parse_frame_rate("0/0"), DEFAULT_FPS);
        assert_eq!(parse_frame_rate(""), DEFAULT_FPS);
        assert_eq!(parse_frame_rate("n/a"), DEFAULT_FPS);
    }

    #[test]
    fn parses_probe_json() {
        let raw = br#"{"streams":[{"width":1280,"height":720,"avg_frame_rate":"30/1"}]}"#;
        let probe = parse_probe_output(raw).expect("probe");
        assert_eq!((probe.width, probe.height), (1280, 720));
        assert_eq!(probe.fps, 30.0);
    }

    #[test]
    fn probe_without_video_stream_is_none() {
        assert!(parse_probe_output(br#"{"streams":[]}"#).is_none());
        assert!(parse_probe_output(b"not json").is_none());
    }

    #[test]
    fn decoder_args_request_raw_rgb() {
        let args = decoder_args("/data/cam.mp4");
        assert!(args.iter().any(|a| a == "rawvideo"));
        assert!(args.iter().any(|a| a == "rgb24"));
        assert!(args.iter().any(|a| a == "/data/cam.mp4"));
    }
}
