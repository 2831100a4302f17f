//! OAuth device-grant client.
//!
//! Registration is a one-shot, two-step exchange: request a device code,
//! let the user approve it in a browser, then trade the device code for an
//! access/refresh token pair. Renewals go through [`TokenEndpoint`].

use crate::api::{decode, send, JSON};
use crate::error::ApiError;
use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

pub const DEVICE_SCOPE: &str = "openid profile email offline_access";
pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
pub const REFRESH_GRANT: &str = "refresh_token";

/// Answer of the device-code endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub verification_uri_complete: String,
}

/// Token pair returned by both grants.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Serialize)]
struct DeviceCodeRequest<'a> {
    client_id: &'a str,
    scope: &'a str,
}

#[derive(Serialize)]
struct DeviceTokenRequest<'a> {
    client_id: &'a str,
    device_code: &'a str,
    grant_type: &'a str,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    client_id: &'a str,
    refresh_token: &'a str,
    grant_type: &'a str,
}

/// Anything that can renew a token pair.
pub trait TokenEndpoint: Send {
    /// URI used in log lines.
    fn uri(&self) -> &str;
    fn refresh(&self, client_id: &str, refresh_token: &str) -> Result<TokenPair, ApiError>;
}

/// Blocking client for the OAuth service.
#[derive(Clone)]
pub struct OAuthClient {
    client: Client,
    device_code_uri: String,
    token_uri: String,
}

impl OAuthClient {
    pub fn new(device_code_uri: &str, token_uri: &str) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to build OAuth HTTP client")?;
        Ok(Self {
            client,
            device_code_uri: device_code_uri.to_string(),
            token_uri: token_uri.to_string(),
        })
    }

    fn post<T: Serialize>(&self, operation: &str, uri: &str, body: &T) -> Result<reqwest::blocking::Response, ApiError> {
        let builder = self
            .client
            .post(uri)
            .header(CONTENT_TYPE, JSON)
            .header(ACCEPT, "*/*")
            .json(body);
        send(operation, builder)
    }

    /// Step 1: obtain a device code and the URL the user has to open.
    pub fn request_device_code(&self, client_id: &str) -> Result<DeviceAuthorization, ApiError> {
        tracing::info!(client_id, "requesting device code and verification URL");
        let res = self.post(
            "request_device_code",
            &self.device_code_uri,
            &DeviceCodeRequest {
                client_id,
                scope: DEVICE_SCOPE,
            },
        )?;
        let auth: DeviceAuthorization = decode("request_device_code", res)?;
        tracing::info!("device code received");
        Ok(auth)
    }

    /// Step 2: trade the approved device code for tokens.
    pub fn exchange_device_code(&self, client_id: &str, device_code: &str) -> Result<TokenPair, ApiError> {
        tracing::info!("requesting access token and refresh token");
        let res = self.post(
            "exchange_device_code",
            &self.token_uri,
            &DeviceTokenRequest {
                client_id,
                device_code,
                grant_type: DEVICE_CODE_GRANT,
            },
        )?;
        let pair: TokenPair = decode("exchange_device_code", res)?;
        tracing::info!("access token and refresh token received");
        Ok(pair)
    }
}

impl TokenEndpoint for OAuthClient {
    fn uri(&self) -> &str {
        &self.token_uri
    }

    fn refresh(&self, client_id: &str, refresh_token: &str) -> Result<TokenPair, ApiError> {
        let res = self.post(
            "refresh_tokens",
            &self.token_uri,
            &RefreshRequest {
                client_id,
                refresh_token,
                grant_type: REFRESH_GRANT,
            },
        )?;
        decode("refresh_tokens", res)
    }
}
