//! Manifest request construction.
//!
//! Profile tokens are opaque identifiers agreed with the service. The builder
//! only classifies them by prefix to check that every category the caller
//! wants evaluated is represented; without at least one token per category the
//! service silently omits that category from the manifest.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};

/// Client version string reported to the service.
pub const CLIENT_VERSION: &str = "6.0033.511.011";
/// UI version string reported to the service.
pub const UI_VERSION: &str = "shakti-v4bf615c3";

/// Profile tokens requested when the caller does not supply any.
pub const DEFAULT_PROFILES: &[&str] = &[
    // H.264
    "playready-h264mpl30-dash",
    "playready-h264mpl31-dash",
    "playready-h264hpl30-dash",
    "playready-h264hpl31-dash",
    // HEVC SDR
    "hevc-main-L30-dash-cenc",
    "hevc-main-L31-dash-cenc",
    "hevc-main10-L30-dash-cenc",
    "hevc-main10-L31-dash-cenc",
    "hevc-main10-L40-dash-cenc",
    "hevc-main10-L41-dash-cenc",
    "hevc-main10-L50-dash-cenc",
    "hevc-main10-L51-dash-cenc",
    // HEVC HDR10
    "hevc-hdr-main10-L30-dash-cenc",
    "hevc-hdr-main10-L31-dash-cenc",
    "hevc-hdr-main10-L40-dash-cenc",
    "hevc-hdr-main10-L41-dash-cenc",
    "hevc-hdr-main10-L50-dash-cenc",
    "hevc-hdr-main10-L51-dash-cenc",
    // Dolby Vision
    "hevc-dv-main10-L30-dash-cenc",
    "hevc-dv-main10-L31-dash-cenc",
    "hevc-dv-main10-L40-dash-cenc",
    "hevc-dv-main10-L41-dash-cenc",
    "hevc-dv-main10-L50-dash-cenc",
    "hevc-dv-main10-L51-dash-cenc",
    "hevc-dv5-main10-L30-dash-cenc",
    "hevc-dv5-main10-L31-dash-cenc",
    "hevc-dv5-main10-L40-dash-cenc",
    "hevc-dv5-main10-L41-dash-cenc",
    "hevc-dv5-main10-L50-dash-cenc",
    "hevc-dv5-main10-L51-dash-cenc",
    // Audio
    "heaac-2-dash",
    "heaac-2hq-dash",
    "ddplus-2.0-dash",
    "ddplus-5.1-dash",
    "ddplus-5.1hq-dash",
    "dd-5.1-dash",
    "ddplus-atmos-dash",
    // Subtitles
    "webvtt-lssdh-ios8",
    "dfxp-ls-sdh",
];

/// Owned copy of [`DEFAULT_PROFILES`].
pub fn default_profiles() -> Vec<String> {
    DEFAULT_PROFILES.iter().map(|s| s.to_string()).collect()
}

/// Track category a profile token asks the service to consider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileCategory {
    Video,
    Audio,
    Subtitle,
}

const CATEGORY_PREFIXES: &[(&str, ProfileCategory)] = &[
    ("playready-h264", ProfileCategory::Video),
    ("h264", ProfileCategory::Video),
    ("hevc-", ProfileCategory::Video),
    ("vp9-", ProfileCategory::Video),
    ("av1-", ProfileCategory::Video),
    ("playready-heaac", ProfileCategory::Audio),
    ("heaac-", ProfileCategory::Audio),
    ("xheaac-", ProfileCategory::Audio),
    ("ddplus-", ProfileCategory::Audio),
    ("dd-", ProfileCategory::Audio),
    ("webvtt-", ProfileCategory::Subtitle),
    ("dfxp-", ProfileCategory::Subtitle),
    ("simplesdh", ProfileCategory::Subtitle),
    ("imsc1.1", ProfileCategory::Subtitle),
    ("nflx-cmisc", ProfileCategory::Subtitle),
];

impl ProfileCategory {
    /// Category of a token, if its prefix is known.
    pub fn of(token: &str) -> Option<Self> {
        let token = token.to_ascii_lowercase();
        CATEGORY_PREFIXES
            .iter()
            .find(|(prefix, _)| token.starts_with(prefix))
            .map(|(_, category)| *category)
    }
}

/// Output-path constraints reported with the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConstraints {
    pub output_type: String,
    pub hdcp_versions: Vec<String>,
    pub hdcp_engaged: bool,
}

impl Default for OutputConstraints {
    fn default() -> Self {
        Self {
            output_type: "unknown".to_string(),
            hdcp_versions: vec!["2.2".to_string()],
            hdcp_engaged: true,
        }
    }
}

/// A validated manifest request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRequest {
    pub asset_id: String,
    pub esn: String,
    pub profiles: Vec<String>,
    pub output: OutputConstraints,
    pub languages: Vec<String>,
    pub client_version: String,
    pub ui_version: String,
}

impl ManifestRequest {
    /// Application data sent inside the encrypted payload.
    #[must_use]
    pub fn to_payload(&self, request_id: u64) -> Value {
        json!({
            "version": 2,
            "url": "/manifest",
            "id": request_id,
            "esn": self.esn,
            "languages": self.languages,
            "uiVersion": self.ui_version,
            "clientVersion": self.client_version,
            "params": {
                "type": "standard",
                "viewableId": self.asset_id,
                "profiles": self.profiles,
                "flavor": "STANDARD",
                "drmType": "widevine",
                "drmVersion": 25,
                "usePsshBox": true,
                "isBranching": false,
                "useHttpsStreams": true,
                "imageSubtitleHeight": 1080,
                "uiVersion": self.ui_version,
                "clientVersion": self.client_version,
                "supportsPreReleasePin": true,
                "supportsWatermark": true,
                "showAllSubDubTracks": false,
                "videoOutputInfo": [{
                    "type": "DigitalVideoOutputDescriptor",
                    "outputType": self.output.output_type,
                    "supportedHdcpVersions": self.output.hdcp_versions,
                    "isHdcpEngaged": self.output.hdcp_engaged,
                }],
                "preferAssistiveAudio": false,
                "isNonMember": false,
            }
        })
    }

    /// Tokens grouped by category; unknown tokens are not listed.
    pub fn categories(&self) -> BTreeSet<ProfileCategory> {
        self.profiles
            .iter()
            .filter_map(|p| ProfileCategory::of(p))
            .collect()
    }
}

/// Builder for [`ManifestRequest`].
#[derive(Debug, Clone)]
pub struct ManifestRequestBuilder {
    asset_id: String,
    profiles: Option<Vec<String>>,
    required: BTreeSet<ProfileCategory>,
    output: OutputConstraints,
    languages: Vec<String>,
    client_version: String,
    ui_version: String,
}

impl ManifestRequestBuilder {
    /// Start a request for `asset_id`; video and audio are required by default.
    pub fn new(asset_id: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            profiles: None,
            required: [ProfileCategory::Video, ProfileCategory::Audio].into_iter().collect(),
            output: OutputConstraints::default(),
            languages: vec!["en-US".to_string()],
            client_version: CLIENT_VERSION.to_string(),
            ui_version: UI_VERSION.to_string(),
        }
    }

    /// Explicit profile tokens, replacing the defaults.
    pub fn profiles<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.profiles = Some(tokens.into_iter().map(Into::into).collect());
        self
    }

    /// Also require at least one token of `category`.
    pub fn require(mut self, category: ProfileCategory) -> Self {
        self.required.insert(category);
        self
    }

    /// Replace the set of required categories.
    pub fn require_only<I: IntoIterator<Item = ProfileCategory>>(mut self, categories: I) -> Self {
        self.required = categories.into_iter().collect();
        self
    }

    pub fn output_constraints(mut self, output: OutputConstraints) -> Self {
        self.output = output;
        self
    }

    pub fn languages(mut self, languages: Vec<String>) -> Self {
        self.languages = languages;
        self
    }

    pub fn client_version(mut self, client: impl Into<String>, ui: impl Into<String>) -> Self {
        self.client_version = client.into();
        self.ui_version = ui.into();
        self
    }

    /// Validate and assemble the request for device `esn`.
    pub fn build(self, esn: &str) -> Result<ManifestRequest> {
        let asset_id = self.asset_id.trim().to_string();
        if asset_id.is_empty() || asset_id.chars().any(char::is_whitespace) {
            return Err(Error::InvalidRequest(format!(
                "Invalid asset identifier {:?}",
                self.asset_id
            )));
        }

        let mut seen = BTreeSet::new();
        let profiles: Vec<String> = self
            .profiles
            .unwrap_or_else(default_profiles)
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty() && seen.insert(p.clone()))
            .collect();

        let present: BTreeSet<_> = profiles.iter().filter_map(|p| ProfileCategory::of(p)).collect();
        let missing: Vec<_> = self.required.difference(&present).collect();
        if !missing.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "No profile tokens for {:?}",
                missing
            )));
        }

        if self.languages.is_empty() {
            return Err(Error::InvalidRequest("At least one language is required".to_string()));
        }

        Ok(ManifestRequest {
            asset_id,
            esn: esn.to_string(),
            profiles,
            output: self.output,
            languages: self.languages,
            client_version: self.client_version,
            ui_version: self.ui_version,
        })
    }
}
