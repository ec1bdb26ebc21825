use std::{collections::HashMap, time::Duration};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::state::StateValue;

/// An HTTP request issued by a `ServiceCall` node.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceResponse {
    pub status: u16,
    pub body: String,
}

impl ServiceResponse {
    /// The body as a variable value.
    ///
    /// JSON scalars keep their type, anything else is stored as the raw text.
    pub fn capture(&self) -> StateValue {
        let body = self.body.trim();
        if body.is_empty() {
            return StateValue::Null;
        }
        match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(_) | Value::Array(_)) | Err(_) => StateValue::String(self.body.clone()),
            Ok(scalar) => StateValue::from_json(scalar),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("service call failed: {0}")]
    Transport(String),
    #[error("unsupported HTTP method `{0}`")]
    InvalidMethod(String),
}

#[async_trait]
pub trait ServiceClient: Send + Sync {
    async fn call(&self, request: ServiceRequest) -> Result<ServiceResponse, ServiceError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestServiceClient {
    client: Client,
}

impl ReqwestServiceClient {
    pub fn new(timeout: Duration) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceClient for ReqwestServiceClient {
    async fn call(&self, request: ServiceRequest) -> Result<ServiceResponse, ServiceError> {
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ServiceError::InvalidMethod(request.method.clone()))?;

        let mut builder = self.client.request(method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            if method != Method::GET && method != Method::HEAD {
                builder = builder.json(body);
            }
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        debug!(url = %request.url, status = status.as_u16(), "service answered");

        if status.is_success() {
            Ok(ServiceResponse {
                status: status.as_u16(),
                body,
            })
        } else {
            Err(ServiceError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}
