//! # Id Allocation
//!
//! One-shot HTTP endpoint on the signaling server that assigns a fresh peer
//! id when the caller did not bring their own.

use crate::config::MeshOptions;
use crate::error::{Error, Result};
use crate::time;
use crate::PeerId;

/// Build the id-retrieval URL. The `ts` query parameter is a cache-buster;
/// the server ignores its value.
pub(crate) fn id_url(options: &MeshOptions, ts: &str) -> String {
    let (http_scheme, _) = options.schemes();
    format!(
        "{http_scheme}://{host}:{port}{path}{key}/id?ts={ts}&version={version}",
        host = options.host,
        port = options.port,
        path = options.normalized_path(),
        key = options.key,
        version = env!("CARGO_PKG_VERSION"),
    )
}

/// Ask the signaling server for a fresh peer id.
pub async fn retrieve_id(options: &MeshOptions) -> Result<PeerId> {
    let ts = format!(
        "{}{}",
        time::unix_millis(),
        options.token_generator.token()
    );
    let url = id_url(options, &ts);
    tracing::debug!("Retrieving id from {}", url);

    let response = reqwest::get(url.as_str()).await?;
    if !response.status().is_success() {
        return Err(Error::ServerError(format!(
            "id retrieval failed with status {}",
            response.status()
        )));
    }

    let id = response.text().await?.trim().to_string();
    if id.is_empty() {
        return Err(Error::ServerError("id retrieval returned an empty id".into()));
    }
    tracing::info!("Server assigned id: {}", id);
    Ok(id)
}
