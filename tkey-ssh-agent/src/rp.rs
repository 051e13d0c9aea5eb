//! Relying-party HTTP client.
//!
//! Every request is a `GET` under the identity's relying-party URL carrying
//! `Authorization: Bearer <token>`, where the token's audience is the exact
//! request URL (query string included).

use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tkey_core::RemoteIdentity;
use tkey_core::token;
use tracing::debug;
use url::Url;

use crate::error::RemoteError;

/// Phase 1: open a login request for a challenge digest.
pub const LOGIN_PATH: &str = "/sshlogin";

/// Phase 2: long-poll until the user confirms that login request.
pub const CONFIRM_PATH: &str = "/sshloginPart2";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginStarted {
    pub callback_url: Option<String>,
    pub login_request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginConfirmed {
    pub signature: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RpClient {
    http: reqwest::Client,
}

impl RpClient {
    /// The phase-2 call is a server-side long-poll, so only connecting is
    /// bounded here.
    pub fn new() -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .user_agent(format!("tkey/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Phase 1 request.  `nonce` is the base64 SHA-256 of the data to sign.
    pub async fn start_login(
        &self,
        identity: &RemoteIdentity,
        nonce: &str,
    ) -> Result<LoginStarted, RemoteError> {
        self.get(
            identity,
            LOGIN_PATH,
            &[("nonce", nonce), ("subjectaddress", identity.address())],
        )
        .await
    }

    /// One phase-2 poll.  A `408` surfaces as a [`RemoteError::Status`] for
    /// which [`RemoteError::is_request_timeout`] holds.
    pub async fn poll_confirmation(
        &self,
        identity: &RemoteIdentity,
        login_request_id: &str,
    ) -> Result<LoginConfirmed, RemoteError> {
        self.get(
            identity,
            CONFIRM_PATH,
            &[("loginRequestId", login_request_id)],
        )
        .await
    }

    /// `params` must be given in lexical key order.
    async fn get<T: DeserializeOwned>(
        &self,
        identity: &RemoteIdentity,
        endpoint: &'static str,
        params: &[(&str, &str)],
    ) -> Result<T, RemoteError> {
        let url = request_url(identity.rp_url(), endpoint, params)?;
        let bearer =
            token::bearer_token(url.as_str(), identity.client_id(), identity.client_secret())?;

        debug!(endpoint, address = %identity.address(), "relying party request");

        let resp = self.http.get(url).bearer_auth(bearer).send().await?;

        let status = resp.status();
        if !status.is_success() {
            debug!(endpoint, %status, "relying party returned error status");
            return Err(RemoteError::Status { endpoint, status });
        }

        Ok(resp.json().await?)
    }
}

/// `base` + `endpoint` with a form-encoded query string.
pub fn request_url(
    base: &str,
    endpoint: &str,
    params: &[(&str, &str)],
) -> Result<Url, RemoteError> {
    Ok(Url::parse_with_params(&format!("{base}{endpoint}"), params)?)
}
