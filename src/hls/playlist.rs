//! M3U8 playlist parsing: just enough of RFC 8216 to follow a stream.

use std::time::Duration;

use super::HlsError;

/// A variant stream advertised by a master playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub uri: String,
    pub bandwidth: Option<u64>,
    pub codecs: Vec<String>,
}

/// One media segment of a media playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub uri: String,
    pub duration: Duration,
    /// Media sequence number.
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub target_duration: Duration,
    pub media_sequence: u64,
    pub segments: Vec<Segment>,
    /// `#EXT-X-ENDLIST` seen: no segments will be added.
    pub ended: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Playlist {
    Master(Vec<Variant>),
    Media(MediaPlaylist),
}

pub fn parse(text: &str) -> Result<Playlist, HlsError> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

    match lines.next() {
        Some("#EXTM3U") => {}
        _ => return Err(HlsError::Playlist("missing #EXTM3U header".into())),
    }

    let mut variants = Vec::new();
    let mut pending_variant: Option<Variant> = None;
    let mut pending_duration: Option<Duration> = None;

    let mut target_duration = None;
    let mut media_sequence = 0u64;
    let mut segments = Vec::new();
    let mut ended = false;

    for line in lines {
        if let Some(attrs) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            let attrs = parse_attributes(attrs);
            pending_variant = Some(Variant {
                uri: String::new(),
                bandwidth: attr(&attrs, "BANDWIDTH").and_then(|v| v.parse().ok()),
                codecs: attr(&attrs, "CODECS")
                    .map(|c| c.split(',').map(|s| s.trim().to_string()).collect())
                    .unwrap_or_default(),
            });
        } else if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            let secs: u64 = value
                .trim()
                .parse()
                .map_err(|_| HlsError::Playlist(format!("bad target duration: {value}")))?;
            target_duration = Some(Duration::from_secs(secs));
        } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            media_sequence = value
                .trim()
                .parse()
                .map_err(|_| HlsError::Playlist(format!("bad media sequence: {value}")))?;
        } else if let Some(value) = line.strip_prefix("#EXTINF:") {
            let secs = value.split(',').next().unwrap_or_default().trim();
            let secs: f64 = secs
                .parse()
                .map_err(|_| HlsError::Playlist(format!("bad segment duration: {secs}")))?;
            if !secs.is_finite() || secs < 0.0 {
                return Err(HlsError::Playlist(format!("bad segment duration: {secs}")));
            }
            pending_duration = Some(Duration::from_secs_f64(secs));
        } else if line == "#EXT-X-ENDLIST" {
            ended = true;
        } else if line.starts_with('#') {
            // Tags we do not act on.
        } else if let Some(mut variant) = pending_variant.take() {
            variant.uri = line.to_string();
            variants.push(variant);
        } else if let Some(duration) = pending_duration.take() {
            let sequence = media_sequence
                .checked_add(segments.len() as u64)
                .ok_or_else(|| HlsError::Playlist("media sequence overflows".into()))?;
            segments.push(Segment {
                uri: line.to_string(),
                duration,
                sequence,
            });
        } else {
            return Err(HlsError::Playlist(format!("URI without a preceding tag: {line}")));
        }
    }

    if !variants.is_empty() {
        return Ok(Playlist::Master(variants));
    }

    let target_duration = target_duration
        .ok_or_else(|| HlsError::Playlist("missing #EXT-X-TARGETDURATION".into()))?;
    Ok(Playlist::Media(MediaPlaylist {
        target_duration,
        media_sequence,
        segments,
        ended,
    }))
}

/// Split an attribute list, honouring quoted values that contain commas.
fn parse_attributes(list: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = list.trim();

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted.find('"').unwrap_or(quoted.len());
            let value = quoted[..end].to_string();
            rest = quoted.get(end + 1..).unwrap_or("");
            value
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].trim().to_string();
            rest = &rest[end..];
            value
        };

        out.push((key, value));
        rest = rest.trim_start_matches(',').trim_start();
    }
    out
}

fn attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}
