use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SignalingError;

/// Body returned by the endpoint lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointResponse {
    pub url: String,
}

impl EndpointResponse {
    pub fn from_json(body: &str) -> Result<Self, SignalingError> {
        let response: EndpointResponse = serde_json::from_str(body)?;
        if response.url.is_empty() {
            return Err(SignalingError::Lookup("empty endpoint url".to_string()));
        }
        Ok(response)
    }
}

#[async_trait]
pub trait EndpointResolver: Send + Sync {
    /// Transport URL of the signaling channel for `room_id`.
    async fn signaling_endpoint(&self, room_id: &str) -> Result<String, SignalingError>;
}

/// Resolver that always answers with the same URL.
#[derive(Debug, Clone)]
pub struct StaticEndpoint(pub String);

impl StaticEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }
}

#[async_trait]
impl EndpointResolver for StaticEndpoint {
    async fn signaling_endpoint(&self, _room_id: &str) -> Result<String, SignalingError> {
        Ok(self.0.clone())
    }
}
