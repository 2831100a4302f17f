// Entrypoint for the upload CLI.
// - Any error bubbling up to `main` is logged and turns into exit code 1.
// - The token refresher runs for the whole upload and is stopped on exit.

use anaplan_uploader::api::{ApiClient, ModelFiles};
use anaplan_uploader::chunker::Chunker;
use anaplan_uploader::cleanup::delete_files;
use anaplan_uploader::config::{Cli, RunConfig, Settings, UploadConfig};
use anaplan_uploader::credential::{load_credential, persist_credential, Credential, TokenStore};
use anaplan_uploader::oauth::OAuthClient;
use anaplan_uploader::refresh::{refresh_interval, TokenRefresher};
use anaplan_uploader::upload::UploadCoordinator;
use anaplan_uploader::{logging, ui};
use anyhow::{anyhow, bail, Context, Result};
use clap::{CommandFactory, Parser};
use std::process::ExitCode;
use std::time::Duration;

fn main() -> ExitCode {
    // No arguments at all: show usage and fail like any other bad invocation.
    if std::env::args_os().len() == 1 {
        eprintln!("{}", Cli::command().render_help());
        return ExitCode::FAILURE;
    }
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help and --version also land here
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    ui::clear_console();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("ERROR - {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(&cli.settings)?;
    let config = RunConfig::from_parts(cli, settings)?;
    let log_file = logging::init(&config.log_dir)?;
    tracing::info!(log = %log_file.display(), "configuration read in successfully");

    let oauth = OAuthClient::new(&config.device_code_uri, &config.token_uri)?;
    let tokens = if config.register {
        register(&oauth, &config)?
    } else {
        println!("Skipping device registration and refreshing the access token");
        tracing::info!("skipping device registration and refreshing the access token");
        let mut credential = load_credential(&config.auth_file, config.token_ttl)?;
        if let Some(client_id) = &config.client_id {
            credential.client_id = client_id.clone();
        }
        let tokens = TokenStore::new(credential);
        TokenRefresher::new(oauth.clone(), tokens.clone(), &config.auth_file)
            .refresh_once()
            .context("Startup token refresh failed; re-register the device with --register")?;
        tokens
    };

    let Some(upload) = &config.upload else {
        println!("Tokens are current; no file to upload");
        return Ok(());
    };

    let refresher = TokenRefresher::new(oauth, tokens.clone(), &config.auth_file)
        .spawn(refresh_interval(Duration::from_secs(config.token_ttl)))
        .context("Failed to start token refresher")?;

    let api = ApiClient::new(tokens, config.http_timeout)?;
    let outcome = upload_file(&api, upload);

    if refresher.last_refresh_failed() {
        tracing::warn!("token refresh failed during the upload");
    }
    refresher.stop();
    outcome
}

fn register(oauth: &OAuthClient, config: &RunConfig) -> Result<TokenStore> {
    let client_id = config
        .client_id
        .as_deref()
        .ok_or_else(|| anyhow!("--client-id is required with --register"))?;
    tracing::info!(client_id, "registering the device");

    let device = oauth.request_device_code(client_id)?;
    ui::wait_for_device_approval(&device.verification_uri_complete)?;
    let pair = oauth.exchange_device_code(client_id, &device.device_code)?;

    let mut credential = Credential::unissued(client_id, config.token_ttl);
    credential.device_code = Some(device.device_code);
    credential = credential.renewed(pair.access_token, pair.refresh_token);
    persist_credential(&config.auth_file, &credential)?;
    tracing::info!(path = %config.auth_file.display(), "access token and refresh token written to file system");
    Ok(TokenStore::new(credential))
}

fn upload_file(api: &ApiClient, upload: &UploadConfig) -> Result<()> {
    let spinner = ui::spinner(&format!("Chunking {}", upload.file.display()));
    let chunks = Chunker::new(upload.chunk_size_mb, upload.compress).split(&upload.file);
    spinner.finish_and_clear();
    let chunks = chunks.context("Chunking failed")?;
    println!("{} chunk(s) written", chunks.len());

    let files = ModelFiles::new(
        api.clone(),
        &upload.base_uri,
        &upload.workspace_id,
        &upload.model_id,
    );
    let progress = ui::upload_progress(chunks.len());
    let result = UploadCoordinator::new(&files, upload.max_workers)
        .with_progress(progress.clone())
        .upload(&upload.file, upload.import_data_source.as_deref(), &chunks);
    progress.finish_and_clear();

    if upload.delete_chunks {
        let paths: Vec<_> = chunks.iter().map(|c| c.local_path.as_path()).collect();
        let deleted = delete_files(&paths);
        tracing::info!(deleted, "local chunk files removed");
    }

    let report = result?;
    ui::print_upload_report(&report);
    if !report.is_success() {
        bail!("{} of {} chunk(s) failed to upload", report.failures().count(), report.results.len());
    }
    Ok(())
}
