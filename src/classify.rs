//! Format classification.
//!
//! Maps parsed representations to a [`CapabilitySet`] using ordered rule
//! tables. Video codecs are matched Dolby Vision first, then HDR10, then SDR;
//! the first matching family wins for that representation. Findings from
//! different representations are accumulated, so a manifest offering both a
//! Dolby Vision and an HDR10 track reports both.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::manifest::{AudioRepresentation, Representation, VideoRepresentation};

/// Resolution class derived from the tallest video representation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionTier {
    #[default]
    Unknown,
    Sd,
    Hd,
    Fhd,
    Qhd,
    Uhd,
}

impl ResolutionTier {
    /// Tier for a frame height, using the closed lower bound of each tier.
    pub fn from_height(height: u32) -> Self {
        match height {
            2160.. => ResolutionTier::Uhd,
            1440.. => ResolutionTier::Qhd,
            1080.. => ResolutionTier::Fhd,
            720.. => ResolutionTier::Hd,
            1.. => ResolutionTier::Sd,
            0 => ResolutionTier::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ResolutionTier::Uhd => "UHD (4K)",
            ResolutionTier::Qhd => "QHD (1440p)",
            ResolutionTier::Fhd => "Full HD (1080p)",
            ResolutionTier::Hd => "HD (720p)",
            ResolutionTier::Sd => "SD",
            ResolutionTier::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ResolutionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Formats a title is available in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub resolution: ResolutionTier,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub max_video_bitrate: Option<u64>,
    pub hdr10: bool,
    pub dolby_vision: bool,
    /// Highest supported Dolby Vision profile seen.
    pub dolby_vision_profile: Option<u8>,
    pub dolby_atmos: bool,
    pub dolby_digital: bool,
    /// True unless an HDR format was found.
    pub sdr: bool,
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self {
            resolution: ResolutionTier::Unknown,
            max_width: None,
            max_height: None,
            max_video_bitrate: None,
            hdr10: false,
            dolby_vision: false,
            dolby_vision_profile: None,
            dolby_atmos: false,
            dolby_digital: false,
            sdr: true,
        }
    }
}

impl CapabilitySet {
    /// Human-readable list of the formats found.
    pub fn badges(&self) -> Vec<String> {
        let mut badges = vec![self.resolution.label().to_string()];
        if self.dolby_vision {
            badges.push(match self.dolby_vision_profile {
                Some(p) => format!("Dolby Vision (profile {})", p),
                None => "Dolby Vision".to_string(),
            });
        }
        if self.hdr10 {
            badges.push("HDR10".to_string());
        }
        if self.sdr {
            badges.push("SDR".to_string());
        }
        if self.dolby_atmos {
            badges.push("Dolby Atmos".to_string());
        }
        if self.dolby_digital {
            badges.push("Dolby Digital 5.1".to_string());
        }
        badges
    }
}

/// Dynamic range family of one video representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DynamicRange {
    DolbyVision { profile: Option<u8> },
    /// Dolby Vision with a profile outside the supported set.
    UnsupportedDolbyVision { profile: u8 },
    Hdr10,
    Sdr,
    Unrecognized,
}

/// Rule tables driving classification. Prefixes are matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierRules {
    pub dolby_vision_prefixes: Vec<String>,
    pub dolby_vision_profiles: Vec<u8>,
    pub hdr10_prefixes: Vec<String>,
    /// Transfer characteristic values that signal PQ (HDR10) content.
    pub hdr_transfer_values: Vec<String>,
    pub sdr_prefixes: Vec<String>,
    /// Codec family that carries object audio (E-AC-3).
    pub enhanced_multichannel_prefixes: Vec<String>,
    /// Baseline multichannel codec family (AC-3).
    pub baseline_multichannel_prefixes: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for ClassifierRules {
    fn default() -> Self {
        Self {
            dolby_vision_prefixes: strings(&["hevc-dv", "dvhe.", "dvh1.", "dvav.", "dva1.", "dav1."]),
            dolby_vision_profiles: vec![4, 5, 7, 8],
            hdr10_prefixes: strings(&["hevc-hdr", "hdr10", "vp9-profile2-hdr"]),
            hdr_transfer_values: strings(&["pq", "smpte2084", "16", "hdr10"]),
            sdr_prefixes: strings(&[
                "playready-h264",
                "h264",
                "hevc-main",
                "avc1",
                "avc3",
                "hvc1",
                "hev1",
                "vp9",
                "vp09",
                "av1",
                "av01",
            ]),
            enhanced_multichannel_prefixes: strings(&["ddplus", "ec-3", "ec3", "eac3", "ec+3"]),
            baseline_multichannel_prefixes: strings(&["dd-", "ac-3", "ac3"]),
        }
    }
}

fn match_prefix<'a>(codec: &'a str, prefixes: &[String]) -> Option<&'a str> {
    prefixes
        .iter()
        .find(|p| codec.starts_with(&p.to_ascii_lowercase()))
        .map(|p| &codec[p.len()..])
}

/// Outcome of classifying one manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub capabilities: CapabilitySet,
    pub warnings: Vec<String>,
}

/// Applies [`ClassifierRules`] to representations.
#[derive(Debug, Clone, Default)]
pub struct FormatClassifier {
    rules: ClassifierRules,
}

impl FormatClassifier {
    pub fn new(rules: ClassifierRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &ClassifierRules {
        &self.rules
    }

    /// Dynamic range family of a single video representation.
    pub fn dynamic_range(&self, video: &VideoRepresentation) -> DynamicRange {
        let codec = video.codec.to_ascii_lowercase();

        if let Some(rest) = match_prefix(&codec, &self.rules.dolby_vision_prefixes) {
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            return match digits.parse::<u8>().ok() {
                None => DynamicRange::DolbyVision { profile: None },
                Some(p) if self.rules.dolby_vision_profiles.contains(&p) => {
                    DynamicRange::DolbyVision { profile: Some(p) }
                }
                Some(p) => DynamicRange::UnsupportedDolbyVision { profile: p },
            };
        }
        if match_prefix(&codec, &self.rules.hdr10_prefixes).is_some() {
            return DynamicRange::Hdr10;
        }
        if match_prefix(&codec, &self.rules.sdr_prefixes).is_some() {
            let pq = video.transfer.as_deref().is_some_and(|t| {
                self.rules
                    .hdr_transfer_values
                    .iter()
                    .any(|v| v.eq_ignore_ascii_case(t.trim()))
            });
            return if pq { DynamicRange::Hdr10 } else { DynamicRange::Sdr };
        }
        DynamicRange::Unrecognized
    }

    /// Classify a full set of representations. Never fails; an empty input
    /// yields the default capability set.
    pub fn classify(&self, representations: &[Representation]) -> Classification {
        let mut caps = CapabilitySet::default();
        let mut warnings = Vec::new();

        for rep in representations {
            match rep {
                Representation::Video(video) => self.classify_video(video, &mut caps, &mut warnings),
                Representation::Audio(audio) => self.classify_audio(audio, &mut caps),
            }
        }

        caps.resolution = caps.max_height.map_or(ResolutionTier::Unknown, ResolutionTier::from_height);
        caps.sdr = !(caps.hdr10 || caps.dolby_vision);

        if representations.is_empty() {
            warnings.push("Manifest contained no representations".to_string());
        } else if !representations.iter().any(|r| matches!(r, Representation::Video(_))) {
            warnings.push("Manifest contained no video representations".to_string());
        }

        debug!("Classified {} representations: {:?}", representations.len(), caps);
        Classification {
            capabilities: caps,
            warnings,
        }
    }

    fn classify_video(&self, video: &VideoRepresentation, caps: &mut CapabilitySet, warnings: &mut Vec<String>) {
        // Both dimensions come from one stream: the tallest, then the widest.
        if video.height.is_some() || video.width.is_some() {
            let size = |h: Option<u32>, w: Option<u32>| (h.unwrap_or(0), w.unwrap_or(0));
            if size(video.height, video.width) > size(caps.max_height, caps.max_width) {
                caps.max_height = video.height;
                caps.max_width = video.width;
            }
        }
        if let Some(b) = video.bitrate {
            caps.max_video_bitrate = caps.max_video_bitrate.max(Some(b));
        }

        match self.dynamic_range(video) {
            DynamicRange::DolbyVision { profile } => {
                caps.dolby_vision = true;
                caps.dolby_vision_profile = caps.dolby_vision_profile.max(profile);
            }
            DynamicRange::UnsupportedDolbyVision { profile } => {
                warnings.push(format!(
                    "Ignoring Dolby Vision profile {} in {}",
                    profile, video.codec
                ));
            }
            DynamicRange::Hdr10 => caps.hdr10 = true,
            DynamicRange::Sdr => {}
            DynamicRange::Unrecognized => {
                warnings.push(format!("Unrecognized video codec {}", video.codec));
            }
        }
    }

    fn classify_audio(&self, audio: &AudioRepresentation, caps: &mut CapabilitySet) {
        let codec = audio.codec.to_ascii_lowercase();
        let enhanced = match_prefix(&codec, &self.rules.enhanced_multichannel_prefixes).is_some();
        let baseline = match_prefix(&codec, &self.rules.baseline_multichannel_prefixes).is_some();

        if enhanced && audio.object_audio {
            caps.dolby_atmos = true;
        } else if (enhanced || baseline) && audio.channels.is_some_and(|c| c.is_surround()) {
            caps.dolby_digital = true;
        }
    }
}
