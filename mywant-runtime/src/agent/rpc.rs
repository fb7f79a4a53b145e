//! RPC execution mode (spec.md §4.6: "gRPC/JSON-RPC transport, semantically
//! equivalent to Webhook"). No `.proto`/codegen step: the wire messages are
//! hand-written `prost::Message` types carried over `tonic`'s generic unary
//! client, the same escape hatch `tonic` itself documents for callers
//! without generated stubs.

use std::collections::BTreeMap;
use std::time::Duration;

use prost::Message;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;

use mywant_core::{AgentError, ParamValue, WantId};

/// Wire-compatible mirror of [`crate::agent::webhook::ExecuteRequest`], with
/// `want_state` flattened to a JSON blob since `prost::Message` has no
/// built-in map-of-dynamically-typed-values encoding.
#[derive(Clone, PartialEq, Message)]
pub struct RpcExecuteRequest {
    #[prost(string, tag = "1")]
    pub want_id: String,
    #[prost(string, tag = "2")]
    pub agent_name: String,
    #[prost(string, tag = "3")]
    pub want_state_json: String,
    #[prost(uint64, tag = "4")]
    pub timeout_ms: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct RpcExecuteResponse {
    #[prost(string, tag = "1")]
    pub status: String,
    #[prost(string, tag = "2")]
    pub state_updates_json: String,
    #[prost(uint64, tag = "3")]
    pub execution_time_ms: u64,
    #[prost(string, optional, tag = "4")]
    pub error: Option<String>,
}

const EXECUTE_PATH: &str = "/mywant.agent.v1.AgentService/Execute";

/// Client side of the RPC execution mode.
pub struct RpcTransport {
    auth_token: Option<String>,
}

impl RpcTransport {
    pub fn new(auth_token: Option<String>) -> Self {
        Self { auth_token }
    }

    async fn connect(&self, endpoint: &str, want_id: &WantId, agent_name: &str) -> Result<Channel, AgentError> {
        let endpoint = Endpoint::from_shared(endpoint.to_string()).map_err(|e| AgentError::Transport {
            want_id: want_id.clone(),
            agent_name: agent_name.to_string(),
            reason: format!("invalid rpc endpoint: {e}"),
        })?;
        endpoint.connect().await.map_err(|e| AgentError::Transport {
            want_id: want_id.clone(),
            agent_name: agent_name.to_string(),
            reason: format!("rpc connect failed: {e}"),
        })
    }

    pub async fn execute_do(
        &self,
        endpoint: &str,
        want_id: &WantId,
        agent_name: &str,
        want_state: &BTreeMap<String, ParamValue>,
        timeout: Duration,
    ) -> Result<BTreeMap<String, ParamValue>, AgentError> {
        let channel = self.connect(endpoint, want_id, agent_name).await?;
        let mut request = Request::new(RpcExecuteRequest {
            want_id: want_id.clone(),
            agent_name: agent_name.to_string(),
            want_state_json: serde_json::to_string(want_state).unwrap_or_default(),
            timeout_ms: timeout.as_millis() as u64,
        });
        if let Some(token) = &self.auth_token {
            if !token.is_empty() {
                let value = format!("Bearer {token}").parse().map_err(|_| AgentError::Transport {
                    want_id: want_id.clone(),
                    agent_name: agent_name.to_string(),
                    reason: "invalid auth token".to_string(),
                })?;
                request.metadata_mut().insert("authorization", value);
            }
        }

        let mut client = Grpc::new(channel);
        client.ready().await.map_err(|e| AgentError::Transport {
            want_id: want_id.clone(),
            agent_name: agent_name.to_string(),
            reason: format!("rpc channel not ready: {e}"),
        })?;
        let path = tonic::codegen::http::uri::PathAndQuery::from_static(EXECUTE_PATH);
        let response = client
            .unary(request, path, ProstCodec::default())
            .await
            .map_err(|status| AgentError::Transport {
                want_id: want_id.clone(),
                agent_name: agent_name.to_string(),
                reason: status.to_string(),
            })?
            .into_inner();

        if response.status == "failed" {
            return Err(AgentError::AgentReported {
                want_id: want_id.clone(),
                agent_name: agent_name.to_string(),
                reason: response.error.unwrap_or_else(|| "agent reported failure".to_string()),
            });
        }
        serde_json::from_str(&response.state_updates_json).map_err(|e| AgentError::Transport {
            want_id: want_id.clone(),
            agent_name: agent_name.to_string(),
            reason: format!("malformed state_updates payload: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_prost_encoding() {
        let req = RpcExecuteRequest {
            want_id: "w1".into(),
            agent_name: "a".into(),
            want_state_json: "{}".into(),
            timeout_ms: 5000,
        };
        let mut buf = Vec::new();
        req.encode(&mut buf).unwrap();
        let decoded = RpcExecuteRequest::decode(buf.as_slice()).unwrap();
        assert_eq!(decoded, req);
    }
}
