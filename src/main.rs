#![cfg(feature = "cli")]
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};

use rsmsl::auth::CookieSet;
use rsmsl::classify::{CapabilitySet, FormatClassifier};
use rsmsl::client::{Lookup, ManifestClient};
use rsmsl::config::ClientConfig;
use rsmsl::device::{DeviceIdentity, DEFAULT_KEY_BITS};
use rsmsl::keystore::SessionKeyStore;
use rsmsl::manifest::ManifestParser;
use rsmsl::session::SessionKeys;
use rsmsl::utils::unix_now;

use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "rsmsl", version, disable_version_flag = true, about = "rsmsl CLI")]
struct Cli {
    #[arg(short = 'v', long = "version", action = ArgAction::SetTrue)]
    version: bool,

    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Fetch and classify the manifest for an asset.
    ///
    /// Cookies are given as NAME=VALUE pairs, e.g. `--cookie NetflixId=...
    /// --cookie SecureNetflixId=...`.
    Lookup {
        config_path: PathBuf,
        asset_id: String,
        #[arg(short = 'c', long = "cookie", required = true)]
        cookies: Vec<String>,
        /// Profile token to request; repeat to replace the configured list.
        #[arg(short = 'p', long = "profile")]
        profiles: Vec<String>,
        #[arg(short = 'j', long = "json", action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Classify a manifest JSON file without contacting the service.
    Classify {
        manifest_path: PathBuf,
        #[arg(short = 'j', long = "json", action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Inspect or clear the session key cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Generate a device RSA key (PKCS#8 PEM).
    GenKey {
        out_path: PathBuf,
        #[arg(short = 'b', long = "bits", default_value_t = DEFAULT_KEY_BITS)]
        bits: usize,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List cached sessions.
    List { config_path: PathBuf },
    /// Remove every cached session.
    Clear { config_path: PathBuf },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    info!("rsmsl version {}", env!("CARGO_PKG_VERSION"));

    if cli.version {
        return Ok(());
    }

    match cli.command {
        Some(Commands::Lookup {
            config_path,
            asset_id,
            cookies,
            profiles,
            json,
        }) => run_lookup(&config_path, &asset_id, &cookies, &profiles, json),
        Some(Commands::Classify { manifest_path, json }) => run_classify(&manifest_path, json),
        Some(Commands::Cache { action }) => match action {
            CacheAction::List { config_path } => run_cache_list(&config_path),
            CacheAction::Clear { config_path } => run_cache_clear(&config_path),
        },
        Some(Commands::GenKey { out_path, bits }) => run_gen_key(&out_path, bits),
        None => Ok(()),
    }
}

fn run_lookup(
    config_path: &Path,
    asset_id: &str,
    cookie_pairs: &[String],
    profiles: &[String],
    json: bool,
) -> anyhow::Result<()> {
    let config = ClientConfig::from_path(config_path).context("Failed to load config")?;
    let cookies = cookie_pairs
        .iter()
        .map(|pair| CookieSet::parse_pair(pair))
        .collect::<Result<CookieSet, _>>()?;
    info!("[+] Loaded {} cookies", cookies.len());

    let client = ManifestClient::from_config(config).context("Failed to set up client")?;
    info!("[+] Device {}", client.config().esn);

    let profiles = (!profiles.is_empty()).then_some(profiles);
    let lookup = match client.lookup(asset_id, &cookies, profiles) {
        Ok(lookup) => lookup,
        Err(e) => {
            error!("[-] {}", e);
            anyhow::bail!(e.user_message());
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&lookup)?);
    } else {
        print_lookup(&lookup);
    }
    Ok(())
}

fn run_classify(manifest_path: &Path, json: bool) -> anyhow::Result<()> {
    let body = std::fs::read(manifest_path)
        .with_context(|| format!("Failed to read {}", manifest_path.display()))?;
    let parsed = ManifestParser::new().parse_slice(&body);
    let lookup = Lookup::from_parsed(
        &manifest_path.display().to_string(),
        parsed,
        &FormatClassifier::default(),
    );
    if json {
        println!("{}", serde_json::to_string_pretty(&lookup)?);
    } else {
        print_lookup(&lookup);
    }
    Ok(())
}

fn open_store(config_path: &Path) -> anyhow::Result<SessionKeyStore> {
    let config = ClientConfig::from_path(config_path).context("Failed to load config")?;
    let path = config
        .cache_path
        .context("Config has no cache_path; sessions are kept in memory only")?;
    Ok(SessionKeyStore::open(path))
}

fn run_cache_list(config_path: &Path) -> anyhow::Result<()> {
    let store = open_store(config_path)?;
    let now = unix_now();
    let entries = store.entries();
    if entries.is_empty() {
        info!("[*] No cached sessions");
    }
    for keys in entries {
        let state = if keys.is_expired_at(now) { "expired" } else { "valid" };
        println!(
            "{}  seq={}  {}  until {}",
            &keys.fingerprint[..keys.fingerprint.len().min(16)],
            keys.sequence_number,
            state,
            format_time(&keys)
        );
    }
    Ok(())
}

fn run_cache_clear(config_path: &Path) -> anyhow::Result<()> {
    let store = open_store(config_path)?;
    let count = store.entries().len();
    store.clear().context("Failed to clear key cache")?;
    info!("[+] Removed {} cached sessions", count);
    Ok(())
}

fn run_gen_key(out_path: &Path, bits: usize) -> anyhow::Result<()> {
    if out_path.exists() {
        anyhow::bail!("A file already exists at the path '{}'", out_path.display());
    }
    // The ESN is not stored with the key; any valid placeholder works here.
    let device = DeviceIdentity::generate("rsmsl-keygen", bits)?;
    device.save_pem(out_path)?;
    info!("[+] Wrote {}-bit device key to {}", bits, out_path.display());
    Ok(())
}

fn print_lookup(lookup: &Lookup) {
    let caps: &CapabilitySet = &lookup.capabilities;
    match &lookup.title {
        Some(title) => println!("{} ({})", title, lookup.asset_id),
        None => println!("{}", lookup.asset_id),
    }
    println!("  formats: {}", caps.badges().join(", "));
    if let (Some(w), Some(h)) = (caps.max_width, caps.max_height) {
        println!("  max resolution: {}x{}", w, h);
    }
    if let Some(bitrate) = caps.max_video_bitrate {
        println!("  max video bitrate: {}", bitrate);
    }
    println!("  representations: {}", lookup.representations.len());
    if !lookup.text_tracks.is_empty() {
        let languages: Vec<String> = lookup
            .text_tracks
            .iter()
            .map(|t| {
                let mut label = t.language.clone().unwrap_or_else(|| "?".to_string());
                if t.sdh {
                    label.push_str(" [SDH]");
                }
                if t.forced {
                    label.push_str(" [forced]");
                }
                label
            })
            .collect();
        println!("  subtitles: {}", languages.join(", "));
    }
    for warning in &lookup.warnings {
        warn!("[!] {}", warning);
    }
}

fn format_time(keys: &SessionKeys) -> String {
    #[cfg(feature = "chrono")]
    {
        chrono::DateTime::from_timestamp(keys.expires_at() as i64, 0)
            .map(|t| t.with_timezone(&chrono::Local).to_rfc3339())
            .unwrap_or_else(|| keys.expires_at().to_string())
    }
    #[cfg(not(feature = "chrono"))]
    {
        keys.expires_at().to_string()
    }
}
