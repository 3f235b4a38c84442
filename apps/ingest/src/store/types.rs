use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One issued probe injection. Written by the operator side; read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionRequest {
    pub id: Uuid,
    pub request: String,
    pub injection_key: String,
    pub created_at: DateTime<Utc>,
}

impl InjectionRequest {
    pub fn new(request: impl Into<String>, injection_key: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            request: request.into(),
            injection_key: injection_key.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedPage {
    pub id: Uuid,
    pub uri: String,
    pub html: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Evidence recorded for one probe execution. Write-once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadFireResult {
    pub id: Uuid,
    pub url: String,
    pub ip_address: String,
    pub referer: String,
    pub user_agent: String,
    pub cookies: String,
    pub title: String,
    pub dom: String,
    pub text: String,
    pub origin: String,
    /// UUID of the compressed screenshot artifact, without extension.
    pub screenshot_id: Option<String>,
    pub was_iframe: bool,
    pub browser_timestamp: i64,
    pub correlated_request: String,
    pub created_at: DateTime<Utc>,
}
