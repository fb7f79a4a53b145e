//! Webhook (HTTP) execution mode (spec.md §4.6, §6 "Agent service API").
//!
//! The orchestrator is the client: it POSTs to the external agent service.
//! [`CallbackRouter`] is the server side the embedding application mounts to
//! receive asynchronous Monitor-agent callbacks (spec.md §4.6 "Callback
//! security").

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use mywant_core::{AgentError, ParamValue, WantId};

/// `POST /agents/execute` request body (spec.md §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub want_id: WantId,
    pub agent_name: String,
    pub want_state: BTreeMap<String, ParamValue>,
    pub callback_url: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub status: String,
    #[serde(default)]
    pub state_updates: BTreeMap<String, ParamValue>,
    pub execution_time_ms: u64,
    pub error: Option<String>,
}

/// `POST /agents/monitor/execute` request body.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorRequest {
    pub want_id: WantId,
    pub agent_name: String,
    pub want_state: BTreeMap<String, ParamValue>,
    pub callback_url: String,
}

/// `POST /agents/callback` request body: asynchronous state delta delivery.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookCallback {
    pub want_id: WantId,
    pub agent_name: String,
    pub status: String,
    #[serde(default)]
    pub state_updates: BTreeMap<String, ParamValue>,
}

/// Client side: the orchestrator's HTTP transport to an external agent
/// service (spec.md §4.6 "Webhook (HTTP)").
pub struct WebhookTransport {
    client: reqwest::Client,
}

impl WebhookTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn authorize(request: reqwest::RequestBuilder, auth_token: &Option<String>) -> reqwest::RequestBuilder {
        match auth_token {
            Some(token) if !token.is_empty() => request.bearer_auth(token),
            _ => request,
        }
    }

    /// Do-mode: POST `/agents/execute`, response carries `stateUpdates`
    /// applied inline (spec.md §4.6).
    pub async fn execute_do(
        &self,
        endpoint: &str,
        auth_token: &Option<String>,
        request: &ExecuteRequest,
        timeout: Duration,
    ) -> Result<BTreeMap<String, ParamValue>, AgentError> {
        let url = format!("{}/agents/execute", endpoint.trim_end_matches('/'));
        let req = Self::authorize(self.client.post(&url).json(request).timeout(timeout), auth_token);
        let response = req.send().await.map_err(|e| AgentError::Transport {
            want_id: request.want_id.clone(),
            agent_name: request.agent_name.clone(),
            reason: e.to_string(),
        })?;
        let body: ExecuteResponse = response.json().await.map_err(|e| AgentError::Transport {
            want_id: request.want_id.clone(),
            agent_name: request.agent_name.clone(),
            reason: format!("malformed response: {e}"),
        })?;
        if body.status == "failed" {
            return Err(AgentError::AgentReported {
                want_id: request.want_id.clone(),
                agent_name: request.agent_name.clone(),
                reason: body.error.unwrap_or_else(|| "agent reported failure".to_string()),
            });
        }
        Ok(body.state_updates)
    }

    /// Monitor-mode: GET the latest want state (the caller supplies it,
    /// since the transport has no registry access), then POST
    /// `/agents/monitor/execute`; the service delivers deltas later via
    /// `/agents/callback` rather than in this response.
    pub async fn start_monitor(
        &self,
        endpoint: &str,
        auth_token: &Option<String>,
        request: &MonitorRequest,
    ) -> Result<(), AgentError> {
        let url = format!("{}/agents/monitor/execute", endpoint.trim_end_matches('/'));
        let req = Self::authorize(self.client.post(&url).json(request), auth_token);
        req.send().await.map_err(|e| AgentError::Transport {
            want_id: request.want_id.clone(),
            agent_name: request.agent_name.clone(),
            reason: e.to_string(),
        })?;
        Ok(())
    }
}

impl Default for WebhookTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies an agent callback should be accepted for: the (wantId,
/// agentName) pair must be live and non-terminal (spec.md §4.6 "Callback
/// security").
pub type CallbackSink = mpsc::Sender<WebhookCallback>;

#[derive(Clone)]
struct RouterState {
    auth_token: Option<String>,
    sink: CallbackSink,
}

/// Builds the `/agents/callback` endpoint (spec.md §6). Incoming callbacks
/// are authenticated here and forwarded to `sink`; whether the target want
/// is still alive and non-terminal is the orchestrator's job once it
/// receives the message, not the router's (spec.md: "applied only if the
/// want is still alive and not terminal").
pub fn callback_router(auth_token: Option<String>, sink: CallbackSink) -> Router {
    let state = RouterState { auth_token, sink };
    Router::new()
        .route("/agents/callback", post(handle_callback))
        .with_state(Arc::new(state))
}

async fn handle_callback(
    State(state): State<Arc<RouterState>>,
    headers: HeaderMap,
    Json(payload): Json<WebhookCallback>,
) -> StatusCode {
    if let Some(expected) = &state.auth_token {
        if expected.is_empty() {
            // Empty token disables auth (spec.md §4.6: "development only").
        } else {
            let provided = headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "));
            if provided != Some(expected.as_str()) {
                return StatusCode::UNAUTHORIZED;
            }
        }
    }
    match state.sink.send(payload).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn callback_without_token_when_none_required_is_accepted() {
        let (tx, mut rx) = mpsc::channel(1);
        let router = callback_router(None, tx);
        let payload = WebhookCallback {
            want_id: "w1".into(),
            agent_name: "a".into(),
            status: "in_progress".into(),
            state_updates: BTreeMap::new(),
        };
        let body = serde_json::to_vec(&payload).unwrap();
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/agents/callback")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body))
            .unwrap();
        use tower::ServiceExt;
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn callback_with_wrong_token_is_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        let router = callback_router(Some("secret".to_string()), tx);
        let payload = WebhookCallback {
            want_id: "w1".into(),
            agent_name: "a".into(),
            status: "in_progress".into(),
            state_updates: BTreeMap::new(),
        };
        let body = serde_json::to_vec(&payload).unwrap();
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/agents/callback")
            .header("content-type", "application/json")
            .header("authorization", "Bearer wrong")
            .body(axum::body::Body::from(body))
            .unwrap();
        use tower::ServiceExt;
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
