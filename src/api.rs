//! HTTP collaborators
//!
//! Two external services are reached over plain HTTP: the relay (pairing
//! token and guest-session minting) and the host's PIN-policy service
//! (guest access gating). Both are thin typed wrappers over a shared
//! reqwest client.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Request timeout applied to all collaborator calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from HTTP collaborators
#[derive(Error, Debug)]
pub enum ApiError {
    /// The request could not be sent or timed out
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// The collaborator answered with a non-success status
    #[error("Unexpected status {0}")]
    BadStatus(u16),

    /// The response body could not be parsed
    #[error("Invalid response: {0}")]
    BadResponse(String),
}

/// Result type for collaborator calls
pub type ApiResult<T> = Result<T, ApiError>;

fn build_client() -> Client {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .expect("HTTP client construction cannot fail with static config")
}

#[derive(Debug, Deserialize)]
struct PairingTokenResponse {
    token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GuestSessionRequest<'a> {
    desktop_device_id: &'a str,
}

/// A guest session minted by the relay
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestSessionInfo {
    /// Ephemeral session identifier the guest registers under
    pub session_id: String,
    /// URL handed to the guest's browser
    pub guest_url: String,
}

/// Client for the relay's HTTP endpoints
pub struct RelayApi {
    http: Client,
    base_url: String,
}

impl RelayApi {
    /// Client against the given relay base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        RelayApi {
            http: build_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Mint a short-lived pairing token (desktop role only)
    pub async fn generate_pairing_token(&self) -> ApiResult<String> {
        let url = format!("{}/pairing/generate", self.base_url);
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|e| ApiError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ApiError::BadStatus(response.status().as_u16()));
        }

        let body: PairingTokenResponse = response
            .json()
            .await
            .map_err(|e| ApiError::BadResponse(e.to_string()))?;
        Ok(body.token)
    }

    /// Mint an ephemeral guest session bound to a desktop device
    pub async fn generate_guest_session(
        &self,
        desktop_device_id: &str,
    ) -> ApiResult<GuestSessionInfo> {
        let url = format!("{}/guest/generate", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&GuestSessionRequest { desktop_device_id })
            .send()
            .await
            .map_err(|e| ApiError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ApiError::BadStatus(response.status().as_u16()));
        }

        response
            .json()
            .await
            .map_err(|e| ApiError::BadResponse(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteAccessInfo {
    pin_required: bool,
    #[allow(dead_code)]
    ip: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyPinRequest<'a> {
    pin: &'a str,
    session_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifyPinResponse {
    valid: bool,
}

/// Client for the PIN-policy service gating guest access
///
/// The failure posture is asymmetric on purpose: an unreachable policy
/// service means "no PIN required" (fail-open), while an unreachable
/// verification endpoint means "invalid PIN" (fail-closed).
pub struct PinPolicy {
    http: Client,
    base_url: String,
}

impl PinPolicy {
    /// Client against the given policy service base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        PinPolicy {
            http: build_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Whether guests must present a PIN; fail-open on any error
    pub async fn pin_required(&self) -> bool {
        let url = format!("{}/remote-access/info", self.base_url);
        let result: ApiResult<RemoteAccessInfo> = async {
            let response = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| ApiError::RequestFailed(e.to_string()))?;
            if !response.status().is_success() {
                return Err(ApiError::BadStatus(response.status().as_u16()));
            }
            response
                .json()
                .await
                .map_err(|e| ApiError::BadResponse(e.to_string()))
        }
        .await;

        match result {
            Ok(info) => info.pin_required,
            Err(e) => {
                warn!("PIN policy query failed, treating as no PIN required: {e}");
                false
            }
        }
    }

    /// Verify a guest-supplied PIN; fail-closed on any error
    pub async fn verify_pin(&self, pin: &str, session_id: &str) -> bool {
        let url = format!("{}/remote-access/verify-pin", self.base_url);
        let result: ApiResult<VerifyPinResponse> = async {
            let response = self
                .http
                .post(&url)
                .json(&VerifyPinRequest { pin, session_id })
                .send()
                .await
                .map_err(|e| ApiError::RequestFailed(e.to_string()))?;
            if !response.status().is_success() {
                return Err(ApiError::BadStatus(response.status().as_u16()));
            }
            response
                .json()
                .await
                .map_err(|e| ApiError::BadResponse(e.to_string()))
        }
        .await;

        match result {
            Ok(body) => body.valid,
            Err(e) => {
                warn!("PIN verification failed, treating as invalid: {e}");
                false
            }
        }
    }
}
