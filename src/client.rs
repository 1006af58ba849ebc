//! Client for the controller's cluster API

use crate::common::ErrorKind;
use crate::controller::http::Envelope;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_URL: &str = "http://127.0.0.1:3374";

#[derive(Debug, Error)]
pub enum ClientError {
    /// The controller could not be reached or did not answer in time
    #[error("cannot reach controller at {url}: {message}")]
    Connect { url: String, message: String },

    /// The controller answered with a failure envelope
    #[error("{}", .0.message)]
    Remote(Envelope),

    #[error("unexpected reply: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Remote(env) => env.kind,
            _ => None,
        }
    }

    /// 1 for rejected input, 2 for remote failures, 3 for connectivity
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::Connect { .. } => 3,
            ClientError::Remote(env) if env.kind == Some(ErrorKind::InvalidArgument) => 1,
            ClientError::Remote(_) | ClientError::Decode(_) => 2,
        }
    }
}

#[derive(Clone)]
pub struct ControllerClient {
    base: String,
    client: reqwest::Client,
}

impl ControllerClient {
    /// `timeout` bounds whole calls; workflows such as create can take minutes.
    pub fn new(base: &str, timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Connect {
                url: base.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Invoke `group/method` and return the reply payload.
    pub async fn call<B: Serialize + ?Sized>(
        &self,
        group: &str,
        method: &str,
        body: &B,
    ) -> Result<Option<Value>, ClientError> {
        let url = format!("{}/v1/{}/{}", self.base, group, method);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::Connect {
                url: url.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| ClientError::Decode(format!("HTTP {} from {}: {}", status, url, e)))?;
        if envelope.success {
            Ok(envelope.payload)
        } else {
            Err(ClientError::Remote(envelope))
        }
    }

    pub async fn call_as<B, T>(&self, group: &str, method: &str, body: &B) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let payload = self.call(group, method, body).await?.unwrap_or(Value::Null);
        serde_json::from_value(payload).map_err(|e| ClientError::Decode(e.to_string()))
    }

    pub async fn health(&self) -> Result<Value, ClientError> {
        let url = format!("{}/health", self.base);
        let response = self.client.get(&url).send().await.map_err(|e| ClientError::Connect {
            url: url.clone(),
            message: e.to_string(),
        })?;
        response
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }
}
