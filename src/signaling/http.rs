use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use super::{IceServers, SignalEnvelope, SignalKind, SignalingApi, SignalingError};

/// `reqwest`-backed client for the relay's REST interface.
pub struct HttpSignaling {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpSignaling {
    pub fn new(relay_url: &str) -> Result<Self, SignalingError> {
        let mut raw = relay_url.trim().to_string();
        if raw.is_empty() {
            return Err(SignalingError::InvalidConfig(
                "relay url cannot be empty".into(),
            ));
        }
        if !raw.contains("://") {
            raw = format!("http://{raw}");
        }
        let mut base_url = Url::parse(&raw)
            .map_err(|err| SignalingError::InvalidConfig(format!("invalid relay url: {err}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { base_url, client })
    }

    fn endpoint(&self, suffix: &str) -> Result<Url, SignalingError> {
        self.base_url.join(suffix).map_err(|err| {
            SignalingError::InvalidConfig(format!("invalid endpoint {suffix}: {err}"))
        })
    }
}

#[derive(Serialize)]
struct SendRequest<'a> {
    to_user: &'a str,
    #[serde(rename = "type")]
    kind: SignalKind,
    encrypted_payload: &'a str,
}

#[derive(Deserialize)]
struct PollResponse {
    #[serde(default)]
    messages: Vec<SignalEnvelope>,
}

#[derive(Deserialize)]
struct ClearResponse {
    #[serde(default)]
    deleted: u64,
}

#[async_trait]
impl SignalingApi for HttpSignaling {
    async fn send(
        &self,
        to_user: &str,
        kind: SignalKind,
        encrypted_payload: String,
    ) -> Result<(), SignalingError> {
        let request = SendRequest {
            to_user,
            kind,
            encrypted_payload: &encrypted_payload,
        };
        let response = self
            .client
            .post(self.endpoint("signaling/send")?)
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SignalingError::HttpStatus(response.status()));
        }
        Ok(())
    }

    async fn poll_once(&self) -> Result<Vec<SignalEnvelope>, SignalingError> {
        let response = self
            .client
            .get(self.endpoint("signaling/poll")?)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SignalingError::HttpStatus(response.status()));
        }
        let body = response
            .json::<PollResponse>()
            .await
            .map_err(|err| SignalingError::Decode(err.to_string()))?;
        Ok(body.messages)
    }

    async fn clear(&self) -> Result<u64, SignalingError> {
        let response = self
            .client
            .delete(self.endpoint("signaling/clear")?)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SignalingError::HttpStatus(response.status()));
        }
        let body = response
            .json::<ClearResponse>()
            .await
            .map_err(|err| SignalingError::Decode(err.to_string()))?;
        Ok(body.deleted)
    }

    async fn ice_servers(&self) -> Result<IceServers, SignalingError> {
        let response = self
            .client
            .get(self.endpoint("signaling/ice-servers")?)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SignalingError::HttpStatus(response.status()));
        }
        response
            .json::<IceServers>()
            .await
            .map_err(|err| SignalingError::Decode(err.to_string()))
    }
}
