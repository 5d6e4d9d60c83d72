//! File naming for artifacts.
//!
//! Derives a safe file name from HTTP metadata and applies the audio-only
//! extension rewrite.

use std::path::Path;

use percent_encoding::percent_decode_str;
use reqwest::Url;

use crate::model::OutputKind;

pub const FALLBACK_FILENAME: &str = "download.bin";

/// Pick a file name: Content-Disposition, then the URL's last segment, then
/// a fallback. The result is always sanitized.
pub fn resolve_filename(url: &str, content_disposition: Option<&str>) -> String {
    let name = filename_from_content_disposition(content_disposition)
        .or_else(|| filename_from_url(url))
        .unwrap_or_else(|| FALLBACK_FILENAME.to_string());
    usable_filename(&name)
}

/// Sanitize `name`, falling back when nothing usable is left.
///
/// Names made only of dots and underscores (`.`, `..`) would point at a
/// directory, so they fall back too.
pub fn usable_filename(name: &str) -> String {
    let name = sanitize_filename(name);
    if name.is_empty() || name.chars().all(|c| c == '.' || c == '_') {
        FALLBACK_FILENAME.to_string()
    } else {
        name
    }
}

/// Name of the final artifact for the requested output kind.
///
/// Audio-only swaps (or appends) the extension; the bytes are untouched.
pub fn final_filename(default_filename: &str, output: OutputKind, audio_extension: &str) -> String {
    match output {
        OutputKind::Binary => default_filename.to_string(),
        OutputKind::AudioOnly => {
            let stem = Path::new(default_filename)
                .file_stem()
                .and_then(|s| s.to_str())
                .filter(|s| !s.is_empty())
                .unwrap_or(default_filename);
            format!("{}.{}", stem, audio_extension)
        }
    }
}

pub fn filename_from_content_disposition(value: Option<&str>) -> Option<String> {
    let value = value?;
    let mut filename_star = None;
    let mut filename = None;

    for part in value.split(';') {
        let part = part.trim();
        let Some((key, raw)) = part.split_once('=') else {
            continue;
        };
        let raw = raw.trim().trim_matches('"');
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                // RFC 5987: charset'lang'percent-encoded
                let encoded = raw.find("''").map(|idx| &raw[idx + 2..]).unwrap_or(raw);
                let decoded = percent_decode_str(encoded).decode_utf8_lossy().into_owned();
                if !decoded.is_empty() {
                    filename_star = Some(decoded);
                }
            }
            "filename" if !raw.is_empty() => filename = Some(raw.to_string()),
            _ => {}
        }
    }

    filename_star.or(filename)
}

pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let name = parsed.path_segments()?.last()?;
    if name.is_empty() {
        None
    } else {
        Some(percent_decode_str(name).decode_utf8_lossy().into_owned())
    }
}

/// Keep a conservative character set and collapse runs of separators.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = false;
    for ch in name.trim().chars() {
        let allowed = ch.is_alphanumeric() || matches!(ch, '.' | '-' | '(' | ')' | '[' | ']');
        let mapped = if allowed {
            ch
        } else if ch == ' ' {
            ' '
        } else {
            '_'
        };
        let is_sep = mapped == '_' || mapped == ' ';
        if is_sep && last_was_sep {
            continue;
        }
        last_was_sep = is_sep;
        out.push(mapped);
    }
    out.trim_matches(|c| c == ' ' || c == '_').to_string()
}
