// Library root
// -----------
// Chunked, concurrent upload of large files to Anaplan with OAuth device
// authentication. The binary (`main.rs`) wires these modules together.
//
// Module responsibilities:
// - `credential`: the shared `TokenStore` and the credential file.
// - `oauth` / `refresh`: device-grant registration and background renewal.
// - `chunker`: line-preserving split into (gzip) chunk files.
// - `api`: authenticated HTTP client and the model files endpoints.
// - `upload`: remote file resolution and bounded concurrent chunk upload.
// - `cleanup`: best-effort removal of local chunk files.
// - `config`, `logging`, `ui`: settings/flags, run log, console output.
pub mod api;
pub mod chunker;
pub mod cleanup;
pub mod config;
pub mod credential;
pub mod error;
pub mod logging;
pub mod oauth;
pub mod refresh;
pub mod ui;
pub mod upload;
