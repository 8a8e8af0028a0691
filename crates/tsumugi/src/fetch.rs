use std::time::Duration;

use bytes::Bytes;
use url::Url;

use crate::{
    error::{TsumugiError, TsumugiResult},
    util::http::HttpClient,
};

/// Download the full body of one segment.
///
/// Nothing is written to disk here, so a failed attempt can be retried without cleanup.
pub async fn fetch_segment(client: &HttpClient, url: &Url, timeout: Duration) -> TsumugiResult<Bytes> {
    let response = client
        .get(url.clone())
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| TsumugiError::fetch(url, describe(&e)))?;

    if !response.status().is_success() {
        let status = response.status();
        if let Ok(body) = response.text().await {
            tracing::debug!("Error body: {body}");
        }
        return Err(TsumugiError::fetch(url, format!("HTTP error: {status}")));
    }

    response
        .bytes()
        .await
        .map_err(|e| TsumugiError::fetch(url, describe(&e)))
}

fn describe(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "timed out".to_string()
    } else if error.is_connect() {
        format!("connection failed: {error}")
    } else {
        error.to_string()
    }
}
