// src/core/bootstrap.rs

//! The one-shot bootstrap exchange against the directory service.
//!
//! A single HTTP call resolves an application key into the session
//! credential, the endpoint list, and optional session metadata. The rest of
//! the client treats this module as an opaque supplier of that triple.

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

use crate::core::KeySyncError;
use crate::core::transport::Endpoint;

/// Raw body of the directory service's `auth/init` response.
#[derive(Debug, Clone, Deserialize)]
pub struct InitPayload {
    pub key: Option<String>,
    #[serde(rename = "socketUrls", default)]
    pub socket_urls: Vec<Url>,
    pub rs: Option<String>,
    #[serde(rename = "apiUrl")]
    pub api_url: Option<Url>,
}

/// A resolved session: everything needed to build a [`SessionGroup`].
///
/// [`SessionGroup`]: crate::core::session::SessionGroup
#[derive(Debug, Clone)]
pub struct Bootstrap {
    pub session_key: String,
    pub endpoints: Vec<Endpoint>,
    /// Opaque session metadata forwarded on every handshake.
    pub session_tag: Option<String>,
    /// Tenant-scoped API base for follow-up directory calls, when supplied.
    pub api_url: Option<Url>,
}

impl TryFrom<InitPayload> for Bootstrap {
    type Error = KeySyncError;

    fn try_from(payload: InitPayload) -> Result<Self, KeySyncError> {
        let session_key = payload
            .key
            .ok_or_else(|| KeySyncError::Bootstrap("response carries no session key".into()))?;
        if payload.socket_urls.is_empty() {
            return Err(KeySyncError::Bootstrap("response carries no endpoints".into()));
        }

        Ok(Self {
            session_key,
            endpoints: payload.socket_urls.into_iter().map(Endpoint::new).collect(),
            session_tag: payload.rs,
            api_url: payload.api_url,
        })
    }
}

/// HTTP client for the directory service.
pub struct DirectoryClient {
    http: reqwest::Client,
    base_url: Url,
}

impl DirectoryClient {
    pub fn new(base_url: Url) -> Result<Self, KeySyncError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http, base_url })
    }

    /// Resolves an application key into a session.
    pub async fn init(&self, app_key: &str) -> Result<Bootstrap, KeySyncError> {
        let path = format!("auth/init/{}", urlencoding::encode(app_key));
        let url = self
            .base_url
            .join(&path)
            .map_err(|e| KeySyncError::Bootstrap(format!("invalid bootstrap URL: {e}")))?;

        debug!(%url, "bootstrap init");

        let response = self.http.post(url).json(&json!({})).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(%status, "bootstrap init rejected");
            return Err(KeySyncError::Bootstrap(format!(
                "directory service answered {status}"
            )));
        }

        let payload: InitPayload = response.json().await?;
        payload.try_into()
    }
}
