//! Builds the `ffmpeg` invocation that burns the viewer overlay into a video.
//!
//! The result is an argument vector handed straight to the OS; no shell ever
//! sees the overlay text. The text still has to survive ffmpeg's own
//! filtergraph parser, so it goes through the two escaping levels described in
//! the ffmpeg-filters manual ("Notes on filtergraph escaping").

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::roster::StudentData;

/// Longest overlay text passed to ffmpeg, in characters.
pub const MAX_OVERLAY_CHARS: usize = 200;

/// Distance in pixels between the overlay and the frame edge.
const EDGE_MARGIN: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WatermarkPosition {
    #[default]
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
    Center,
}

impl WatermarkPosition {
    /// `x`/`y` drawtext expressions for this corner.
    fn coordinates(self) -> (String, String) {
        let m = EDGE_MARGIN;
        match self {
            Self::TopLeft => (m.to_string(), m.to_string()),
            Self::TopRight => (format!("w-text_w-{m}"), m.to_string()),
            Self::BottomLeft => (m.to_string(), format!("h-text_h-{m}")),
            Self::BottomRight => (format!("w-text_w-{m}"), format!("h-text_h-{m}")),
            Self::Center => ("(w-text_w)/2".to_string(), "(h-text_h)/2".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WatermarkSize {
    Small,
    #[default]
    Medium,
    Large,
}

impl WatermarkSize {
    pub fn font_size(self) -> u32 {
        match self {
            Self::Small => 16,
            Self::Medium => 24,
            Self::Large => 36,
        }
    }
}

/// Per-video overlay settings chosen by the teacher at upload time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatermarkOptions {
    pub enabled: bool,
    pub text: Option<String>,
    pub position: WatermarkPosition,
    pub opacity: f32,
    pub size: WatermarkSize,
    pub include_user_info: bool,
}

impl Default for WatermarkOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            text: None,
            position: WatermarkPosition::TopLeft,
            opacity: 0.8,
            size: WatermarkSize::Medium,
            include_user_info: true,
        }
    }
}

/// A fully formed transcoder invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

/// Compose the overlay text from the viewer identity and the teacher's options.
pub fn overlay_text(student: &StudentData, options: &WatermarkOptions) -> String {
    let mut parts = Vec::new();
    if options.include_user_info {
        let identity = if student.phone.trim().is_empty() {
            student.name.clone()
        } else {
            format!("{} - {}", student.name, student.phone)
        };
        parts.push(identity);
    }
    if let Some(text) = options.text.as_deref().filter(|t| !t.trim().is_empty()) {
        parts.push(text.to_string());
    }
    if parts.is_empty() {
        parts.push(student.name.clone());
    }
    sanitize_overlay(&parts.join(" | "))
}

/// Reduce arbitrary user text to a single printable line.
///
/// Control characters are dropped, whitespace runs collapse to one space and
/// the result is capped at [`MAX_OVERLAY_CHARS`].
pub fn sanitize_overlay(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(MAX_OVERLAY_CHARS));
    let mut pending_space = false;
    let mut count = 0;

    for ch in raw.chars() {
        if ch.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if ch.is_control() {
            continue;
        }
        if pending_space {
            if count + 1 >= MAX_OVERLAY_CHARS {
                break;
            }
            out.push(' ');
            count += 1;
            pending_space = false;
        }
        if count >= MAX_OVERLAY_CHARS {
            break;
        }
        out.push(ch);
        count += 1;
    }
    out
}

/// First level: a value inside a filter's `key=value:key=value` option list.
fn escape_option_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 8);
    for ch in value.chars() {
        if matches!(ch, '\\' | '\'' | ':') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Second level: the filter description inside the filtergraph.
fn escape_filtergraph(desc: &str) -> String {
    let mut out = String::with_capacity(desc.len() + 8);
    for ch in desc.chars() {
        if matches!(ch, '\\' | '\'' | '[' | ']' | ',' | ';') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// The `drawtext` filter description for `text` with `options` applied.
pub fn drawtext_filter(text: &str, options: &WatermarkOptions) -> String {
    let (x, y) = options.position.coordinates();
    let opacity = options.opacity.clamp(0.0, 1.0);
    let desc = format!(
        "drawtext=expansion=none:text={}:fontcolor=white@{:.2}:fontsize={}:x={}:y={}",
        escape_option_value(text),
        opacity,
        options.size.font_size(),
        x,
        y,
    );
    escape_filtergraph(&desc)
}

/// Build the ffmpeg argument vector that reads `input`, draws `text` and
/// writes `output`, leaving the audio stream untouched.
///
/// When `options.enabled` is false the video is re-muxed without an overlay.
pub fn build_watermark_command(
    ffmpeg: &Path,
    input: &Path,
    output: &Path,
    text: &str,
    options: &WatermarkOptions,
) -> WatermarkCommand {
    let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-loglevel", "error", "-y", "-i"]
        .into_iter()
        .map(OsString::from)
        .collect();
    args.push(input.as_os_str().to_owned());

    if options.enabled {
        args.push("-vf".into());
        args.push(drawtext_filter(&sanitize_overlay(text), options).into());
    } else {
        args.push("-codec:v".into());
        args.push("copy".into());
    }

    args.push("-codec:a".into());
    args.push("copy".into());
    args.push(output.as_os_str().to_owned());

    WatermarkCommand {
        program: ffmpeg.to_path_buf(),
        args,
    }
}
