use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

/// Per-request metadata handed to every flow explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub client_ip: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub request_id: String,
}

impl RequestContext {
    pub fn new(client_ip: Option<IpAddr>, user_agent: Option<String>) -> Self {
        Self {
            client_ip,
            user_agent,
            request_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(None, None)
    }
}
