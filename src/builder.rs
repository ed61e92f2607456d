use crate::config::AppConfig;
use crate::error::ValidationError;
use crate::job::StreamRequest;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const ALLOWED_SCHEMES: &[&str] = &["http", "https", "rtmp", "rtmps", "rtsp", "srt", "udp", "tcp"];
const FORMATS: &[&str] = &["flv", "mpegts", "mp4", "matroska", "webm", "hls"];
const VIDEO_CODECS: &[&str] = &["libx264", "libx265", "copy"];
const AUDIO_CODECS: &[&str] = &["aac", "libopus", "copy"];
const PRESETS: &[&str] = &[
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
];
const RESOLUTIONS: &[(u32, u32)] = &[
    (426, 240),
    (640, 360),
    (854, 480),
    (1280, 720),
    (1920, 1080),
    (2560, 1440),
    (3840, 2160),
];

const MAX_VIDEO_KBPS: u32 = 100_000;
const MAX_AUDIO_KBPS: u32 = 1_024;

// Relay profile of the original deployment.
const DEFAULT_VIDEO_CODEC: &str = "libx264";
const DEFAULT_AUDIO_CODEC: &str = "aac";
const DEFAULT_PRESET: &str = "veryfast";
const DEFAULT_VIDEO_KBPS: u32 = 2000;
const DEFAULT_AUDIO_KBPS: u32 = 128;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub max_run_time: Duration,
    pub max_output_size: Option<u64>,
}

/// A fully validated FFmpeg invocation. Arguments are passed to the process
/// one by one and never through a shell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub limits: ResourceLimits,
}

impl CommandSpec {
    /// Human readable form for logs only.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            if arg.contains(char::is_whitespace) {
                out.push_str(&format!("{:?}", arg));
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Endpoint {
    Url(Url),
    File(PathBuf),
}

impl Endpoint {
    fn as_arg(&self) -> String {
        match self {
            Endpoint::Url(url) => url.to_string(),
            Endpoint::File(path) => path.to_string_lossy().into_owned(),
        }
    }

    fn is_network(&self) -> bool {
        matches!(self, Endpoint::Url(_))
    }
}

#[derive(Debug, Default)]
struct ParsedOptions {
    format: Option<String>,
    video_codec: Option<String>,
    audio_codec: Option<String>,
    video_kbps: Option<u32>,
    audio_kbps: Option<u32>,
    resolution: Option<(u32, u32)>,
    preset: Option<String>,
}

/// Translates stream requests into FFmpeg argument vectors.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    ffmpeg_binary: String,
    limits: ResourceLimits,
}

impl CommandBuilder {
    pub fn new(ffmpeg_binary: impl Into<String>, limits: ResourceLimits) -> Self {
        Self {
            ffmpeg_binary: ffmpeg_binary.into(),
            limits,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.server.ffmpeg_binary.clone(),
            ResourceLimits {
                max_run_time: config.supervisor.job_timeout(),
                max_output_size: config
                    .supervisor
                    .max_output_size_mb
                    .map(|mb| mb.saturating_mul(1024 * 1024)),
            },
        )
    }

    /// Validates the request and builds the command. Pure apart from
    /// checking that a local source file exists.
    pub fn build(&self, request: &StreamRequest) -> Result<CommandSpec, ValidationError> {
        let source = parse_source(&request.source)?;
        let destination = parse_destination(&request.destination)?;
        let opts = parse_options(request)?;

        // stdin stays open for `q`, so an overwrite prompt would block forever
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "warning".into(),
            "-y".into(),
        ];

        // Files are read at native rate when relayed to a live target.
        if !source.is_network() && destination.is_network() {
            args.push("-re".into());
        }
        args.push("-i".into());
        args.push(source.as_arg());

        // 1. Video
        let video_codec = opts.video_codec.as_deref().unwrap_or(DEFAULT_VIDEO_CODEC);
        args.extend(["-c:v".into(), video_codec.to_string()]);
        if video_codec != "copy" {
            let preset = opts.preset.as_deref().unwrap_or(DEFAULT_PRESET);
            let kbps = opts.video_kbps.unwrap_or(DEFAULT_VIDEO_KBPS);
            args.extend([
                "-preset".into(),
                preset.to_string(),
                "-b:v".into(),
                format!("{}k", kbps),
                "-maxrate".into(),
                format!("{}k", kbps.saturating_mul(5) / 4),
                "-bufsize".into(),
                format!("{}k", kbps.saturating_mul(3) / 2),
            ]);
            if let Some((w, h)) = opts.resolution {
                args.extend(["-s".into(), format!("{}x{}", w, h)]);
            }
        }

        // 2. Audio
        let audio_codec = opts.audio_codec.as_deref().unwrap_or(DEFAULT_AUDIO_CODEC);
        args.extend(["-c:a".into(), audio_codec.to_string()]);
        if audio_codec != "copy" {
            let kbps = opts.audio_kbps.unwrap_or(DEFAULT_AUDIO_KBPS);
            args.extend([
                "-b:a".into(),
                format!("{}k", kbps),
                "-ar".into(),
                "48000".into(),
                "-ac".into(),
                "2".into(),
            ]);
        }

        // 3. Container and output
        if let Some(format) = opts.format.or_else(|| default_format(&destination)) {
            args.extend(["-f".into(), format]);
        }
        if let (Endpoint::File(_), Some(bytes)) = (&destination, self.limits.max_output_size) {
            args.extend(["-fs".into(), bytes.to_string()]);
        }
        args.push(destination.as_arg());

        Ok(CommandSpec {
            program: self.ffmpeg_binary.clone(),
            args,
            limits: self.limits.clone(),
        })
    }
}

fn default_format(destination: &Endpoint) -> Option<String> {
    match destination {
        Endpoint::Url(url) => match url.scheme() {
            "srt" | "udp" | "tcp" => Some("mpegts".into()),
            "rtsp" => Some("rtsp".into()),
            _ => Some("flv".into()),
        },
        // FFmpeg infers the muxer from the file extension.
        Endpoint::File(_) => None,
    }
}

fn check_argument(field: &str, raw: &str) -> Result<(), ValidationError> {
    if raw.is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    if raw.starts_with('-') {
        return Err(ValidationError::new(field, "must not start with '-'"));
    }
    if raw.chars().any(char::is_control) {
        return Err(ValidationError::new(field, "contains control characters"));
    }
    Ok(())
}

fn parse_url(field: &str, raw: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(raw).map_err(|e| ValidationError::new(field, format!("malformed URL: {}", e)))?;
    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        return Err(ValidationError::new(
            field,
            format!("scheme '{}' is not allowed", url.scheme()),
        ));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ValidationError::new(field, "URL has no host"));
    }
    Ok(url)
}

fn parse_source(raw: &str) -> Result<Endpoint, ValidationError> {
    let raw = raw.trim();
    check_argument("source", raw)?;
    if raw.contains("://") {
        return parse_url("source", raw).map(Endpoint::Url);
    }
    let path = Path::new(raw);
    if !path.is_file() {
        return Err(ValidationError::new("source", "file does not exist"));
    }
    File::open(path).map_err(|e| ValidationError::new("source", format!("file is not readable: {}", e)))?;
    Ok(Endpoint::File(path.to_path_buf()))
}

fn parse_destination(raw: &str) -> Result<Endpoint, ValidationError> {
    let raw = raw.trim();
    check_argument("destination", raw)?;
    if raw.contains("://") {
        return parse_url("destination", raw).map(Endpoint::Url);
    }
    let path = Path::new(raw);
    if path.file_name().is_none() {
        return Err(ValidationError::new("destination", "path has no file name"));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            return Err(ValidationError::new("destination", "parent directory does not exist"));
        }
    }
    Ok(Endpoint::File(path.to_path_buf()))
}

fn parse_options(request: &StreamRequest) -> Result<ParsedOptions, ValidationError> {
    let mut opts = ParsedOptions::default();
    for (key, value) in &request.options {
        let value = value.to_string();
        let value = value.trim();
        match key.as_str() {
            "format" => opts.format = Some(one_of(key, value, FORMATS)?),
            "videoCodec" => opts.video_codec = Some(one_of(key, value, VIDEO_CODECS)?),
            "audioCodec" => opts.audio_codec = Some(one_of(key, value, AUDIO_CODECS)?),
            "preset" => opts.preset = Some(one_of(key, value, PRESETS)?),
            "videoBitrate" => opts.video_kbps = Some(parse_bitrate(key, value, MAX_VIDEO_KBPS)?),
            "audioBitrate" => opts.audio_kbps = Some(parse_bitrate(key, value, MAX_AUDIO_KBPS)?),
            "resolution" => opts.resolution = Some(parse_resolution(key, value)?),
            _ => return Err(ValidationError::new(key.as_str(), "unrecognized option")),
        }
    }

    if opts.video_codec.as_deref() == Some("copy") {
        for (set, field) in [
            (opts.resolution.is_some(), "resolution"),
            (opts.video_kbps.is_some(), "videoBitrate"),
            (opts.preset.is_some(), "preset"),
        ] {
            if set {
                return Err(ValidationError::new(field, "not applicable when videoCodec is copy"));
            }
        }
    }
    if opts.audio_codec.as_deref() == Some("copy") && opts.audio_kbps.is_some() {
        return Err(ValidationError::new(
            "audioBitrate",
            "not applicable when audioCodec is copy",
        ));
    }
    Ok(opts)
}

fn one_of(field: &str, value: &str, allowed: &[&str]) -> Result<String, ValidationError> {
    let lower = value.to_ascii_lowercase();
    if allowed.contains(&lower.as_str()) {
        Ok(lower)
    } else {
        Err(ValidationError::new(
            field,
            format!("'{}' is not one of {}", value, allowed.join(", ")),
        ))
    }
}

/// Accepts `2000`, `2000k`, `2.5M`; plain numbers are kbit/s.
fn parse_bitrate(field: &str, value: &str, max_kbps: u32) -> Result<u32, ValidationError> {
    let (number, multiplier) = match value.chars().last() {
        Some('k' | 'K') => (&value[..value.len() - 1], 1.0),
        Some('m' | 'M') => (&value[..value.len() - 1], 1000.0),
        _ => (value, 1.0),
    };
    let parsed: f64 = number
        .trim()
        .parse()
        .map_err(|_| ValidationError::new(field, format!("'{}' is not a bitrate", value)))?;
    let kbps = parsed * multiplier;
    if !kbps.is_finite() || kbps < 1.0 {
        return Err(ValidationError::new(field, "must be greater than zero"));
    }
    if kbps > f64::from(max_kbps) {
        return Err(ValidationError::new(
            field,
            format!("must not exceed {}k", max_kbps),
        ));
    }
    Ok(kbps.round() as u32)
}

fn parse_resolution(field: &str, value: &str) -> Result<(u32, u32), ValidationError> {
    let lower = value.to_ascii_lowercase();
    let found = if let Some(height) = lower.strip_suffix('p') {
        height
            .parse::<u32>()
            .ok()
            .and_then(|h| RESOLUTIONS.iter().find(|(_, rh)| *rh == h))
    } else {
        lower.split_once('x').and_then(|(w, h)| {
            let (w, h) = (w.parse::<u32>().ok()?, h.parse::<u32>().ok()?);
            RESOLUTIONS.iter().find(|r| **r == (w, h))
        })
    };
    found.copied().ok_or_else(|| {
        let allowed: Vec<String> = RESOLUTIONS.iter().map(|(w, h)| format!("{}x{}", w, h)).collect();
        ValidationError::new(
            field,
            format!("'{}' is not one of {}", value, allowed.join(", ")),
        )
    })
}
