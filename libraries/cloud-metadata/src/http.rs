use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::LookupError;

/// Link local metadata endpoints answer fast or not at all.
pub(crate) const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const CONTROL_PLANE_TIMEOUT: Duration = Duration::from_secs(20);

pub(crate) fn client() -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .use_rustls_tls()
        .connect_timeout(METADATA_TIMEOUT)
        .build()?)
}

pub(crate) fn from_reqwest(what: &str, err: reqwest::Error) -> LookupError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        LookupError::transient(what, err)
    } else {
        LookupError::permanent(what, err)
    }
}

pub(crate) fn from_status(what: &str, status: StatusCode, body: &str) -> LookupError {
    match status {
        StatusCode::NOT_FOUND => LookupError::NotFound(what.to_string()),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            LookupError::transient(what, format!("{status}: {body}"))
        }
        status if status.is_server_error() => {
            LookupError::transient(what, format!("{status}: {body}"))
        }
        status => LookupError::permanent(what, format!("{status}: {body}")),
    }
}

pub(crate) async fn send(request: RequestBuilder, what: &str) -> Result<Response, LookupError> {
    let response = request
        .send()
        .await
        .map_err(|err| from_reqwest(what, err))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error body".to_string());
    Err(from_status(what, status, &body))
}

pub(crate) async fn text(request: RequestBuilder, what: &str) -> Result<String, LookupError> {
    send(request, what)
        .await?
        .text()
        .await
        .map_err(|err| from_reqwest(what, err))
}

pub(crate) async fn json<T: DeserializeOwned>(
    request: RequestBuilder,
    what: &str,
) -> Result<T, LookupError> {
    let body = text(request, what).await?;
    serde_json::from_str(&body).map_err(|err| LookupError::permanent(what, err))
}

/// Text of a metadata value that must be present and non empty.
pub(crate) async fn required(request: RequestBuilder, what: &str) -> Result<String, LookupError> {
    match text(request, what).await {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        Ok(_) | Err(LookupError::NotFound(_)) => Err(LookupError::MissingMetadata(what.to_string())),
        Err(err) => Err(err),
    }
}
