//! Manifest parsing.
//!
//! A manifest is a tree of adaptation groups (`video_tracks`, `audio_tracks`,
//! or generic `adaptationSets`) whose entries are representations. Text tracks
//! (`timedtexttracks`, or text adaptation sets) and the title are collected
//! alongside. Field names
//! vary between service versions, so every attribute is read through a short
//! alias list. Entries that cannot be interpreted are skipped with a warning;
//! a body without any recognizable group is reported but never panics.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestParseError {
    #[error("manifest body is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("manifest body is not a JSON object")]
    NotAnObject,
    #[error("no adaptation groups found in manifest")]
    Unrecognized,
    #[error("skipped {group}[{index}]: {reason}")]
    Entry {
        group: String,
        index: usize,
        reason: String,
    },
}

/// Channel layout as main channels plus LFE channels (5.1 is `5`, `1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLayout {
    pub main: u8,
    pub lfe: u8,
}

impl ChannelLayout {
    pub const STEREO: ChannelLayout = ChannelLayout { main: 2, lfe: 0 };
    pub const SURROUND_5_1: ChannelLayout = ChannelLayout { main: 5, lfe: 1 };

    /// Parse `"5.1"`, `"2.0"`, `"6ch"` or a plain channel count.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim().to_ascii_lowercase();
        let text = text.strip_suffix("ch").unwrap_or(&text);
        if let Some((main, lfe)) = text.split_once('.') {
            return Some(Self {
                main: main.parse().ok()?,
                lfe: lfe.parse().ok()?,
            });
        }
        text.parse::<u8>().ok().and_then(Self::from_count)
    }

    /// Layout for a total channel count. Six and eight channels carry LFE.
    pub fn from_count(count: u8) -> Option<Self> {
        match count {
            0 => None,
            6 | 8 => Some(Self { main: count - 1, lfe: 1 }),
            n => Some(Self { main: n, lfe: 0 }),
        }
    }

    /// Find a layout embedded in a profile token such as `ddplus-5.1hq-dash`.
    pub fn from_token(token: &str) -> Option<Self> {
        token.split(['-', '_']).find_map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();
            if digits.len() >= 3 && digits.contains('.') {
                Self::parse(&digits)
            } else {
                None
            }
        })
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Self::parse(s),
            Value::Number(n) => n.as_u64().and_then(|n| u8::try_from(n).ok()).and_then(Self::from_count),
            _ => None,
        }
    }

    /// At least 5.1: five main channels and an LFE channel.
    pub fn is_surround(&self) -> bool {
        self.main >= 5 && self.lfe >= 1
    }
}

impl fmt::Display for ChannelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.main, self.lfe)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRepresentation {
    pub codec: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bitrate: Option<u64>,
    pub transfer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioRepresentation {
    pub codec: String,
    pub bitrate: Option<u64>,
    pub channels: Option<ChannelLayout>,
    pub object_audio: bool,
    pub language: Option<String>,
}

/// One encoded variant of the title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Representation {
    Video(VideoRepresentation),
    Audio(AudioRepresentation),
}

impl Representation {
    pub fn codec(&self) -> &str {
        match self {
            Representation::Video(v) => &v.codec,
            Representation::Audio(a) => &a.codec,
        }
    }
}

/// A subtitle track offered with the title.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextTrack {
    pub id: Option<String>,
    pub language: Option<String>,
    pub track_type: Option<String>,
    /// Forced narrative: shown only for foreign-language dialogue.
    pub forced: bool,
    /// Subtitles for the deaf and hard of hearing.
    pub sdh: bool,
}

/// Result of parsing a manifest body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedManifest {
    pub title: Option<String>,
    pub representations: Vec<Representation>,
    pub text_tracks: Vec<TextTrack>,
    /// Entries that were skipped.
    pub warnings: Vec<ManifestParseError>,
    /// Set when the body as a whole could not be interpreted.
    pub error: Option<ManifestParseError>,
}

impl ParsedManifest {
    fn failed(error: ManifestParseError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackKind {
    Video,
    Audio,
    Text,
}

const CODEC: &[&str] = &["codecs", "codec", "content_profile", "contentProfile"];
const WIDTH: &[&str] = &["res_w", "width", "frameWidth"];
const HEIGHT: &[&str] = &["res_h", "height", "frameHeight"];
const BITRATE: &[&str] = &["bitrate", "bandwidth"];
const TRANSFER: &[&str] = &["transferCharacteristics", "transfer", "hdrFormat", "hdr_format"];
const CHANNELS: &[&str] = &["channels", "channelsCount", "channel_count", "audioChannels"];
const OBJECT_AUDIO: &[&str] = &["isAtmos", "atmos", "objectAudio"];
const SURROUND_LABEL: &[&str] = &["surroundFormatLabel"];
const LANGUAGE: &[&str] = &["language", "lang"];
const STREAMS: &[&str] = &["streams", "representations"];
const TEXT_GROUPS: &[&str] = &["timedtexttracks", "timedTextTracks"];
const TRACK_ID: &[&str] = &["trackId", "new_track_id", "id"];
const TEXT_LANGUAGE: &[&str] = &["language", "lang", "languageDescription"];
const TRACK_TYPE: &[&str] = &["trackType", "rawTrackType"];
const FORCED: &[&str] = &["isForcedNarrative", "isForced", "forced"];
const NONE_TRACK: &[&str] = &["isNoneTrack"];
const TITLE: &[&str] = &["title", "movieTitle"];

/// Stateless manifest parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestParser;

impl ManifestParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse raw JSON bytes.
    pub fn parse_slice(&self, body: &[u8]) -> ParsedManifest {
        match serde_json::from_slice::<Value>(body) {
            Ok(value) => self.parse(&value),
            Err(e) => ParsedManifest::failed(ManifestParseError::InvalidJson(e.to_string())),
        }
    }

    /// Extract every interpretable representation from `body`.
    ///
    /// A top-level `result` object, as returned by the service, is unwrapped.
    pub fn parse(&self, body: &Value) -> ParsedManifest {
        let root = body.get("result").filter(|v| v.is_object()).unwrap_or(body);
        let Some(root) = root.as_object() else {
            return ParsedManifest::failed(ManifestParseError::NotAnObject);
        };

        let mut parsed = ParsedManifest::default();
        let mut recognized = false;

        for (name, kind) in [("video_tracks", TrackKind::Video), ("audio_tracks", TrackKind::Audio)] {
            if let Some(groups) = root.get(name) {
                recognized |= self.parse_groups(name, groups, Some(kind), &mut parsed);
            }
        }
        for name in ["adaptationSets", "adaptation_sets"] {
            if let Some(groups) = root.get(name) {
                recognized |= self.parse_groups(name, groups, None, &mut parsed);
            }
        }
        if let Some((name, tracks)) = TEXT_GROUPS.iter().find_map(|n| root.get(*n).map(|v| (*n, v))) {
            self.parse_text_tracks(name, tracks, &mut parsed);
        }
        parsed.title = title(root);

        if !recognized {
            parsed.error = Some(ManifestParseError::Unrecognized);
        }
        parsed
    }

    fn parse_groups(&self, name: &str, groups: &Value, kind: Option<TrackKind>, out: &mut ParsedManifest) -> bool {
        let Some(groups) = groups.as_array() else {
            out.warnings.push(entry_error(name, 0, "group list is not an array"));
            return false;
        };
        for (index, group) in groups.iter().enumerate() {
            let Some(group) = group.as_object() else {
                out.warnings.push(entry_error(name, index, "group is not an object"));
                continue;
            };
            let kind = match kind.or_else(|| group_kind(group)) {
                Some(TrackKind::Text) => {
                    out.text_tracks.push(text_track(group));
                    continue;
                }
                Some(kind) => kind,
                None => {
                    // Image groups are expected here; not worth a warning.
                    trace!("Ignoring {}[{}] with no audio, video or text content type", name, index);
                    continue;
                }
            };
            match first(group, STREAMS).and_then(Value::as_array) {
                Some(streams) => {
                    let path = format!("{}[{}].streams", name, index);
                    for (i, stream) in streams.iter().enumerate() {
                        match stream.as_object() {
                            Some(entry) => match parse_entry(kind, entry, Some(group)) {
                                Ok(rep) => out.representations.push(rep),
                                Err(reason) => out.warnings.push(entry_error(&path, i, &reason)),
                            },
                            None => out.warnings.push(entry_error(&path, i, "entry is not an object")),
                        }
                    }
                }
                None => match parse_entry(kind, group, None) {
                    Ok(rep) => out.representations.push(rep),
                    Err(reason) => out.warnings.push(entry_error(name, index, &reason)),
                },
            }
        }
        true
    }

    fn parse_text_tracks(&self, name: &str, tracks: &Value, out: &mut ParsedManifest) {
        let Some(tracks) = tracks.as_array() else {
            out.warnings.push(entry_error(name, 0, "track list is not an array"));
            return;
        };
        for (index, track) in tracks.iter().enumerate() {
            match track.as_object() {
                // The "Off" entry carries no subtitles.
                Some(track) if as_bool(first(track, NONE_TRACK)) => {}
                Some(track) => out.text_tracks.push(text_track(track)),
                None => out.warnings.push(entry_error(name, index, "entry is not an object")),
            }
        }
    }
}

fn text_track(track: &Map<String, Value>) -> TextTrack {
    let track_type = as_string(first(track, TRACK_TYPE));
    let sdh = track_type.as_deref().is_some_and(|t| {
        let t = t.to_ascii_lowercase();
        t.contains("sdh") || t == "assistive"
    });
    TextTrack {
        id: as_string(first(track, TRACK_ID)),
        language: as_string(first(track, TEXT_LANGUAGE)),
        forced: as_bool(first(track, FORCED)),
        track_type,
        sdh,
    }
}

/// Title from the manifest root, or the first video group that names one.
fn title(root: &Map<String, Value>) -> Option<String> {
    as_string(first(root, TITLE)).or_else(|| {
        root.get("video_tracks")?
            .as_array()?
            .iter()
            .filter_map(Value::as_object)
            .find_map(|group| as_string(first(group, TITLE)))
    })
}

fn entry_error(group: &str, index: usize, reason: &str) -> ManifestParseError {
    ManifestParseError::Entry {
        group: group.to_string(),
        index,
        reason: reason.to_string(),
    }
}

fn group_kind(group: &Map<String, Value>) -> Option<TrackKind> {
    let content = ["contentType", "content_type", "type", "mimeType"]
        .iter()
        .find_map(|k| group.get(*k).and_then(Value::as_str))?
        .to_ascii_lowercase();
    if content.starts_with("video") {
        Some(TrackKind::Video)
    } else if content.starts_with("audio") {
        Some(TrackKind::Audio)
    } else if content.starts_with("text") || content.contains("subtitle") {
        Some(TrackKind::Text)
    } else {
        None
    }
}

fn first<'a>(entry: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|n| entry.get(*n)).filter(|v| !v.is_null())
}

/// Entry field, falling back to the enclosing group.
fn field<'a>(entry: &'a Map<String, Value>, parent: Option<&'a Map<String, Value>>, names: &[&str]) -> Option<&'a Value> {
    first(entry, names).or_else(|| parent.and_then(|p| first(p, names)))
}

fn as_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_u64(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn parse_entry(
    kind: TrackKind,
    entry: &Map<String, Value>,
    parent: Option<&Map<String, Value>>,
) -> std::result::Result<Representation, String> {
    // Codec must come from the entry itself; a group-level codec would
    // attribute one stream's format to all of them.
    let codec = as_string(first(entry, CODEC)).ok_or("missing codec identifier")?;
    let bitrate = as_u64(first(entry, BITRATE));

    Ok(match kind {
        TrackKind::Video => Representation::Video(VideoRepresentation {
            width: as_u64(field(entry, parent, WIDTH)).and_then(|w| u32::try_from(w).ok()),
            height: as_u64(field(entry, parent, HEIGHT)).and_then(|h| u32::try_from(h).ok()),
            transfer: as_string(field(entry, parent, TRANSFER)),
            codec,
            bitrate,
        }),
        TrackKind::Audio => {
            let lowered = codec.to_ascii_lowercase();
            let object_audio = as_bool(field(entry, parent, OBJECT_AUDIO))
                || as_string(field(entry, parent, SURROUND_LABEL)).is_some_and(|l| l.eq_ignore_ascii_case("atmos"))
                || lowered.contains("atmos")
                || lowered.contains("joc");
            let channels = field(entry, parent, CHANNELS)
                .and_then(ChannelLayout::from_value)
                .or_else(|| ChannelLayout::from_token(&codec));
            Representation::Audio(AudioRepresentation {
                language: as_string(field(entry, parent, LANGUAGE)),
                codec,
                bitrate,
                channels,
                object_audio,
            })
        }
        TrackKind::Text => return Err("text tracks carry no representation".to_string()),
    })
}
