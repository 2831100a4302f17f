// API client module: a small blocking HTTP client for the planning
// platform's bulk file endpoints. Every call carries the bearer token taken
// from the shared `TokenStore` at send time, so a refresh that lands between
// two chunks is picked up by the next one.

use crate::credential::TokenStore;
use crate::error::{ApiError, ErrorKind};
use crate::upload::{FileApi, RemoteFile};
use anyhow::{Context, Result};
use chrono::Utc;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

pub const JSON: &str = "application/json";
pub const GZIP: &str = "application/x-gzip";
pub const OCTET_STREAM: &str = "application/octet-stream";

/// HTTP verbs the platform API is called with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Delete => "DELETE",
            Verb::Patch => "PATCH",
        };
        f.write_str(s)
    }
}

/// Request body.
#[derive(Debug, Clone)]
pub enum Payload {
    None,
    Json(serde_json::Value),
    /// Raw chunk bytes; `compressed` selects the gzip content type.
    Raw { data: Vec<u8>, compressed: bool },
}

impl Payload {
    pub fn content_type(&self) -> &'static str {
        match self {
            Payload::Raw { compressed: true, .. } => GZIP,
            Payload::Raw { compressed: false, .. } => OCTET_STREAM,
            Payload::None | Payload::Json(_) => JSON,
        }
    }
}

/// Blocking client bound to a token store. Cheap to clone and safe to
/// share across upload workers.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    tokens: TokenStore,
}

impl ApiClient {
    /// Build a client. `timeout == None` disables the request timeout, which
    /// large chunk uploads on slow links need.
    pub fn new(tokens: TokenStore, timeout: Option<Duration>) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(ApiClient { client, tokens })
    }

    /// Headers for one authenticated request, built from a fresh snapshot of
    /// the credential.
    fn auth_headers(&self, operation: &str, payload: &Payload) -> Result<HeaderMap, ApiError> {
        let credential = self.tokens.get();
        if credential.access_token.is_empty() {
            return Err(ApiError::new(
                operation,
                ErrorKind::Unauthorized,
                None,
                "no access token available; register or refresh first",
            ));
        }
        if self.tokens.is_stale() && credential.is_expired_at(Utc::now()) {
            return Err(ApiError::new(
                operation,
                ErrorKind::Unauthorized,
                None,
                "access token expired and the last refresh failed",
            ));
        }

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.access_token))
            .map_err(|e| ApiError::new(operation, ErrorKind::Unknown, None, format!("invalid access token: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(ACCEPT, HeaderValue::from_static(JSON));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(payload.content_type()));
        Ok(headers)
    }

    /// Issue one authenticated request. Any non-2xx answer becomes an
    /// [`ApiError`] tagged with `operation`.
    pub fn request(
        &self,
        operation: &str,
        uri: &str,
        verb: Verb,
        payload: Payload,
    ) -> Result<Response, ApiError> {
        let headers = self.auth_headers(operation, &payload)?;
        let builder = match verb {
            Verb::Get => self.client.get(uri),
            Verb::Post => self.client.post(uri),
            Verb::Put => self.client.put(uri),
            Verb::Delete => self.client.delete(uri),
            Verb::Patch => self.client.patch(uri),
        };
        tracing::debug!(%verb, uri, operation, "sending request");
        send(operation, with_payload(builder.headers(headers), payload))
    }
}

fn with_payload(builder: RequestBuilder, payload: Payload) -> RequestBuilder {
    match payload {
        Payload::None => builder,
        Payload::Json(value) => builder.body(value.to_string()),
        Payload::Raw { data, .. } => builder.body(data),
    }
}

/// Send a prepared request and classify the outcome.
pub(crate) fn send(operation: &str, builder: RequestBuilder) -> Result<Response, ApiError> {
    let res = builder.send().map_err(|e| {
        tracing::error!(operation, error = %e, "request failed");
        ApiError::transport(operation, e)
    })?;
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().unwrap_or_default();
    let err = ApiError::from_response(operation, status.as_u16(), &body);
    tracing::error!(operation, status = status.as_u16(), detail = %err.detail, "request rejected");
    Err(err)
}

/// Decode a JSON response body.
pub(crate) fn decode<T: serde::de::DeserializeOwned>(operation: &str, res: Response) -> Result<T, ApiError> {
    res.json::<T>().map_err(|e| ApiError::decode(operation, e))
}

#[derive(Debug, Deserialize)]
struct FilesResponse {
    #[serde(default)]
    files: Vec<RemoteFile>,
}

#[derive(Debug, Deserialize)]
struct CreateFileResponse {
    file: CreatedFile,
}

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: String,
}

/// The import files of one model: `{base}/workspaces/{ws}/models/{model}/files`.
#[derive(Clone)]
pub struct ModelFiles {
    api: ApiClient,
    files_uri: String,
}

impl ModelFiles {
    pub fn new(api: ApiClient, base_uri: &str, workspace_id: &str, model_id: &str) -> Self {
        let files_uri = format!(
            "{}/workspaces/{}/models/{}/files",
            base_uri.trim_end_matches('/'),
            workspace_id,
            model_id
        );
        Self { api, files_uri }
    }

    pub fn files_uri(&self) -> &str {
        &self.files_uri
    }

    /// `file` is a single path segment: names like `q1?.csv` or `a/b.csv`
    /// are escaped, not interpreted.
    fn file_uri(&self, file: &str) -> String {
        format!("{}/{}", self.files_uri, utf8_percent_encode(file, NON_ALPHANUMERIC))
    }

    fn chunk_uri(&self, file_id: &str, index: usize) -> String {
        format!("{}/chunks/{}", self.file_uri(file_id), index)
    }
}

impl FileApi for ModelFiles {
    fn list_files(&self) -> Result<Vec<RemoteFile>, ApiError> {
        let res = self
            .api
            .request("list_files", &self.files_uri, Verb::Get, Payload::None)?;
        Ok(decode::<FilesResponse>("list_files", res)?.files)
    }

    fn create_file(&self, name: &str) -> Result<String, ApiError> {
        let res = self.api.request(
            "create_file",
            &self.file_uri(name),
            Verb::Post,
            Payload::Json(serde_json::json!({ "chunkCount": 0 })),
        )?;
        Ok(decode::<CreateFileResponse>("create_file", res)?.file.id)
    }

    fn set_chunk_count(&self, file_id: &str, chunk_count: usize) -> Result<(), ApiError> {
        self.api.request(
            "set_chunk_count",
            &self.file_uri(file_id),
            Verb::Post,
            Payload::Json(serde_json::json!({ "chunkCount": chunk_count })),
        )?;
        Ok(())
    }

    fn put_chunk(&self, file_id: &str, index: usize, data: Vec<u8>, compressed: bool) -> Result<(), ApiError> {
        self.api.request(
            "put_chunk",
            &self.chunk_uri(file_id, index),
            Verb::Put,
            Payload::Raw { data, compressed },
        )?;
        Ok(())
    }
}
