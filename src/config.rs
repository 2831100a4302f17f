//! Run configuration: the JSON settings file merged with command-line flags.

use crate::credential::{default_auth_file, DEFAULT_TOKEN_TTL_SECS};
use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SETTINGS_FILE: &str = "./settings.json";

/// Command-line flags.
#[derive(Debug, Parser)]
#[command(author, version, about = "Upload large files to Anaplan in compressed chunks")]
pub struct Cli {
    /// OAuth device registration
    #[arg(short, long)]
    pub register: bool,

    /// OAuth Client ID
    #[arg(short, long = "client-id", alias = "client_id")]
    pub client_id: Option<String>,

    /// Access token lifetime in seconds; renewal starts ahead of it
    #[arg(short = 't', long = "token-ttl", default_value_t = DEFAULT_TOKEN_TTL_SECS)]
    pub token_ttl: u64,

    /// File to upload to Anaplan
    #[arg(short, long = "file-to-upload", alias = "file_to_upload")]
    pub file_to_upload: Option<PathBuf>,

    /// Import data source name. Defaults to the file's base name
    #[arg(short, long = "import-data-source", alias = "import_data_source")]
    pub import_data_source: Option<String>,

    /// Chunk size in MB, overrides the settings file
    #[arg(short = 's', long = "chunk-size")]
    pub chunk_size: Option<u64>,

    /// Gzip chunks before upload
    #[arg(long, overrides_with = "no_compress")]
    pub compress: bool,

    /// Send chunks uncompressed
    #[arg(long = "no-compress", overrides_with = "compress")]
    pub no_compress: bool,

    /// Path of the settings file
    #[arg(long, default_value = DEFAULT_SETTINGS_FILE)]
    pub settings: PathBuf,
}

impl Cli {
    fn compress_override(&self) -> Option<bool> {
        match (self.compress, self.no_compress) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

/// Authentication scheme selected in the settings file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AuthMode {
    #[serde(rename = "OAuth", alias = "oauth")]
    OAuth,
    #[serde(rename = "basic", alias = "Basic")]
    Basic,
    #[serde(rename = "cert", alias = "Cert", alias = "certificate")]
    Certificate,
}

/// Contents of `settings.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub get_device_id_uri: String,
    pub get_tokens_uri: String,

    #[serde(default = "default_base_uri")]
    pub base_uri: String,

    #[serde(default)]
    pub workspace_id: Option<String>,

    #[serde(default)]
    pub model_id: Option<String>,

    /// Number of concurrent chunk uploads.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default = "default_true")]
    pub compress_upload: bool,

    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,

    /// Remove chunk files after the upload, whatever its outcome.
    #[serde(default = "default_true")]
    pub delete_upload_chunks: bool,

    #[serde(default = "default_auth_mode")]
    pub auth_mode: AuthMode,

    #[serde(default)]
    pub auth_file: Option<PathBuf>,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
}

fn default_base_uri() -> String {
    "https://api.anaplan.com/2/0".into()
}

fn default_max_workers() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_chunk_size_mb() -> u64 {
    50
}

fn default_auth_mode() -> AuthMode {
    AuthMode::OAuth
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).with_context(|| {
            format!(
                "Unable to open the settings file {}. Please ensure the file exists",
                path.display()
            )
        })?;
        let settings: Settings = serde_json::from_str(&data)
            .with_context(|| format!("Invalid settings file {}", path.display()))?;
        Ok(settings)
    }
}

/// Where and how to upload.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub file: PathBuf,
    pub import_data_source: Option<String>,
    pub base_uri: String,
    pub workspace_id: String,
    pub model_id: String,
    pub max_workers: usize,
    pub chunk_size_mb: u64,
    pub compress: bool,
    pub delete_chunks: bool,
}

/// Validated settings and flags for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub register: bool,
    pub client_id: Option<String>,
    pub token_ttl: u64,
    pub device_code_uri: String,
    pub token_uri: String,
    pub auth_file: PathBuf,
    pub log_dir: PathBuf,
    pub http_timeout: Option<Duration>,
    pub upload: Option<UploadConfig>,
}

impl RunConfig {
    pub fn from_parts(cli: Cli, settings: Settings) -> Result<Self> {
        if settings.auth_mode != AuthMode::OAuth {
            bail!(
                "auth_mode {:?} is not supported; set \"auth_mode\": \"OAuth\" in the settings file",
                settings.auth_mode
            );
        }
        if cli.register && cli.client_id.as_deref().map_or(true, str::is_empty) {
            bail!("--client-id is required with --register");
        }
        if cli.token_ttl == 0 {
            bail!("--token-ttl must be greater than zero");
        }

        let compress_override = cli.compress_override();
        let upload = match cli.file_to_upload {
            None => None,
            Some(file) => {
                let chunk_size_mb = cli.chunk_size.unwrap_or(settings.chunk_size_mb);
                if chunk_size_mb == 0 {
                    bail!("chunk size must be greater than zero");
                }
                let workspace_id = required(settings.workspace_id.clone(), "workspace_id")?;
                let model_id = required(settings.model_id.clone(), "model_id")?;
                Some(UploadConfig {
                    file,
                    import_data_source: cli.import_data_source,
                    base_uri: settings.base_uri.clone(),
                    workspace_id,
                    model_id,
                    max_workers: settings.max_workers.max(1),
                    chunk_size_mb,
                    compress: compress_override.unwrap_or(settings.compress_upload),
                    delete_chunks: settings.delete_upload_chunks,
                })
            }
        };

        Ok(RunConfig {
            register: cli.register,
            client_id: cli.client_id,
            token_ttl: cli.token_ttl,
            device_code_uri: settings.get_device_id_uri,
            token_uri: settings.get_tokens_uri,
            auth_file: settings.auth_file.unwrap_or_else(default_auth_file),
            log_dir: settings.log_dir,
            http_timeout: settings.http_timeout_secs.map(Duration::from_secs),
            upload,
        })
    }
}

fn required(value: Option<String>, key: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => bail!("settings key `{key}` is required to upload a file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "get_device_id_uri": "https://us1a.app.anaplan.com/oauth/device/code",
        "get_tokens_uri": "https://us1a.app.anaplan.com/oauth/token"
    }"#;

    const FULL: &str = r#"{
        "get_device_id_uri": "https://us1a.app.anaplan.com/oauth/device/code",
        "get_tokens_uri": "https://us1a.app.anaplan.com/oauth/token",
        "base_uri": "https://api.anaplan.com/2/0",
        "workspace_id": "8a868cd985f53e7701860542f59e276e",
        "model_id": "BAA9A9B1AEE24A3FBD8E2D3B0A7F9A1E",
        "max_workers": 8,
        "compress_upload": false,
        "chunk_size_mb": 10,
        "delete_upload_chunks": false,
        "auth_mode": "OAuth",
        "auth_file": "auth.json",
        "http_timeout_secs": 600
    }"#;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["anaplan-uploader"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn minimal_settings_take_defaults() {
        let s: Settings = serde_json::from_str(MINIMAL).unwrap();
        assert_eq!(s.base_uri, "https://api.anaplan.com/2/0");
        assert_eq!(s.max_workers, 4);
        assert!(s.compress_upload);
        assert_eq!(s.chunk_size_mb, 50);
        assert!(s.delete_upload_chunks);
        assert_eq!(s.auth_mode, AuthMode::OAuth);
        assert_eq!(s.http_timeout_secs, None);
    }

    #[test]
    fn flags_override_settings() {
        let s: Settings = serde_json::from_str(FULL).unwrap();
        let run = RunConfig::from_parts(
            cli(&["-f", "leads.csv", "-i", "Leads", "--chunk-size", "5", "--compress"]),
            s,
        )
        .unwrap();
        let up = run.upload.unwrap();
        assert_eq!(up.chunk_size_mb, 5);
        assert!(up.compress);
        assert_eq!(up.max_workers, 8);
        assert!(!up.delete_chunks);
        assert_eq!(up.import_data_source.as_deref(), Some("Leads"));
        assert_eq!(run.auth_file, PathBuf::from("auth.json"));
        assert_eq!(run.http_timeout, Some(Duration::from_secs(600)));
        assert_eq!(run.token_ttl, 2000);
    }

    #[test]
    fn no_compress_flag_wins_over_settings() {
        let s: Settings = serde_json::from_str(MINIMAL).unwrap();
        let mut s = s;
        s.workspace_id = Some("ws".into());
        s.model_id = Some("m".into());
        let run = RunConfig::from_parts(cli(&["-f", "a.csv", "--no-compress"]), s).unwrap();
        assert!(!run.upload.unwrap().compress);
    }

    #[test]
    fn upload_requires_workspace_and_model() {
        let s: Settings = serde_json::from_str(MINIMAL).unwrap();
        let err = RunConfig::from_parts(cli(&["-f", "a.csv"]), s).unwrap_err();
        assert!(err.to_string().contains("workspace_id"));
    }

    #[test]
    fn refresh_only_run_needs_no_upload_settings() {
        let s: Settings = serde_json::from_str(MINIMAL).unwrap();
        let run = RunConfig::from_parts(cli(&["-c", "cid"]), s).unwrap();
        assert!(run.upload.is_none());
        assert!(!run.register);
    }

    #[test]
    fn register_needs_client_id() {
        let s: Settings = serde_json::from_str(MINIMAL).unwrap();
        assert!(RunConfig::from_parts(cli(&["-r"]), s.clone()).is_err());
        assert!(RunConfig::from_parts(cli(&["-r", "-c", "abc"]), s).is_ok());
    }

    #[test]
    fn non_oauth_modes_are_rejected() {
        let json = MINIMAL.replace('}', r#", "auth_mode": "basic"}"#);
        let s: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(s.auth_mode, AuthMode::Basic);
        let err = RunConfig::from_parts(cli(&["-c", "cid"]), s).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let s: Settings = serde_json::from_str(FULL).unwrap();
        assert!(RunConfig::from_parts(cli(&["-f", "a.csv", "-s", "0"]), s).is_err());
    }

    #[test]
    fn missing_settings_file_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Settings::load(&tmp.path().join("settings.json")).unwrap_err();
        assert!(err.to_string().contains("Unable to open the settings file"));
    }
}
