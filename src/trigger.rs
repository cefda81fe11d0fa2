//! Remote post-processing trigger
//!
//! After a successful upload the remote service is told to start its own
//! processing of the artifact. The call is fire-and-acknowledge: a 2xx
//! response completes the stage, anything else is an error for the retry
//! layer to classify.

use crate::error::{AuthError, Result, TriggerError};
use crate::types::ItemId;
use async_trait::async_trait;

/// Requests remote post-processing of an uploaded artifact
#[async_trait]
pub trait RemoteTrigger: Send + Sync {
    /// Ask the remote service to process the item.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NoUserSignedIn`] without a network call when no
    /// credentials are available, [`TriggerError::BadStatus`] on a non-2xx
    /// response, or [`TriggerError::RequestFailed`] when the request itself
    /// fails.
    async fn trigger(&self, item: &ItemId) -> Result<()>;
}

/// HTTP trigger posting to the remote processing endpoint
pub struct HttpRemoteTrigger {
    client: reqwest::Client,
    base_url: url::Url,
    token: Option<String>,
}

impl HttpRemoteTrigger {
    /// Create a trigger for the given service base URL.
    ///
    /// `token` is the bearer token of the signed-in user; `None` means no
    /// user session, which fails every trigger call up front.
    pub fn new(client: reqwest::Client, base_url: url::Url, token: Option<String>) -> Self {
        Self {
            client,
            base_url,
            token,
        }
    }
}

#[async_trait]
impl RemoteTrigger for HttpRemoteTrigger {
    async fn trigger(&self, item: &ItemId) -> Result<()> {
        let Some(token) = &self.token else {
            return Err(AuthError::NoUserSignedIn.into());
        };

        let url = self
            .base_url
            .join(&format!("items/{item}/process"))
            .map_err(|e| TriggerError::RequestFailed(e.to_string()))?;

        tracing::info!(item_id = %item, url = %url, "Triggering remote processing");
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| TriggerError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(item_id = %item, status = %status, "Remote trigger rejected");
            return Err(TriggerError::BadStatus(status.as_u16()).into());
        }

        tracing::info!(item_id = %item, "Remote processing triggered");
        Ok(())
    }
}
