//! RPC method dispatch onto the application context.
//!
//! Params are positional (a JSON array); a single non-array value is treated
//! as a one-element list.

use super::server::{RpcError, RpcRequest, RpcResponse};
use crate::app_context::AppContext;
use crate::error::{AppError, PipelineError};
use crate::types::{GeoCoordinate, NodeKind, NodeRecord, Partition};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct RpcHandler {
    context: Arc<AppContext>,
    start_time: Instant,
    shutdown: Option<CancellationToken>,
}

impl From<PipelineError> for RpcError {
    fn from(e: PipelineError) -> Self {
        RpcError {
            code: e.code(),
            message: e.to_string(),
            data: Some(json!({
                "kind": e.kind(),
                "retryable": e.is_retryable(),
            })),
        }
    }
}

impl RpcHandler {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self {
            context,
            start_time: Instant::now(),
            shutdown: None,
        }
    }

    /// Allow the `stop` method to cancel `token`.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub async fn handle_request(&self, request: RpcRequest) -> RpcResponse {
        let params_array = match &request.params {
            Value::Array(arr) => arr.clone(),
            Value::Null => vec![],
            other => vec![other.clone()],
        };

        let result = match request.method.as_str() {
            "submittransaction" => self.submit_transaction(&params_array).await,
            "dispatch" => self.dispatch(&params_array).await,
            "getnodehealth" => self.get_node_health(),
            "getroutingsnapshot" => self.get_routing_snapshot(),
            "registernode" => self.register_node(&params_array),
            "heartbeat" => self.heartbeat(&params_array),
            "getmetrics" => self.get_metrics(),
            "getnodeinfo" => self.get_node_info(),
            "uptime" => Ok(json!(self.start_time.elapsed().as_secs())),
            "stop" => self.stop(),
            _ => Err(RpcError::method_not_found(&request.method)),
        };

        match result {
            Ok(value) => RpcResponse {
                jsonrpc: "2.0".to_string(),
                id: request.id,
                result: Some(value),
                error: None,
            },
            Err(error) => RpcResponse::error(request.id, error),
        }
    }

    /// `[payload, coordinate?, affinity?]`
    async fn submit_transaction(&self, params: &[Value]) -> Result<Value, RpcError> {
        let payload = payload_param(params, 0)?;
        let requester = coordinate_param(params, 1)?;
        let affinity = partition_param(params, 2)?;

        let result = self
            .context
            .submit_transaction(payload, requester, affinity)
            .await?;
        to_json(&result)
    }

    /// `[payload, coordinate?, affinity?, targets?]`
    async fn dispatch(&self, params: &[Value]) -> Result<Value, RpcError> {
        let payload = payload_param(params, 0)?;
        let requester = coordinate_param(params, 1)?;
        let affinity = partition_param(params, 2)?;
        let targets = match params.get(3) {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                serde_json::from_value::<Vec<String>>(value.clone())
                    .map_err(|e| RpcError::invalid_params(format!("targets: {}", e)))?,
            ),
        };

        match self
            .context
            .dispatch(payload, requester, affinity, targets)
            .await
        {
            Ok(report) => to_json(&report),
            Err(AppError::Unsupported(msg)) => Err(RpcError::new(-32601, msg)),
            Err(e) => Err(RpcError::internal(e.to_string())),
        }
    }

    fn get_node_health(&self) -> Result<Value, RpcError> {
        to_json(&self.context.get_node_health())
    }

    fn get_routing_snapshot(&self) -> Result<Value, RpcError> {
        to_json(&self.context.get_routing_snapshot())
    }

    /// `[node_id, kind, address, partition, latency_ms?, coordinate?]`
    fn register_node(&self, params: &[Value]) -> Result<Value, RpcError> {
        let node_id = str_param(params, 0, "node_id")?;
        let kind: NodeKind = str_param(params, 1, "kind")?
            .parse()
            .map_err(RpcError::invalid_params)?;
        let address = str_param(params, 2, "address")?;
        let partition = partition_param(params, 3)?
            .ok_or_else(|| RpcError::invalid_params("partition is required"))?;
        let latency_ms = params.get(4).and_then(|v| v.as_u64()).unwrap_or(0);

        let mut record = NodeRecord::new(node_id, kind, address, partition).with_latency(latency_ms);
        record.coordinate = coordinate_param(params, 5)?;

        let registered = self
            .context
            .register_node(record)
            .map_err(|e| RpcError::invalid_params(e.to_string()))?;
        to_json(&registered)
    }

    /// `[node_id, latency_ms, coordinate?]`
    fn heartbeat(&self, params: &[Value]) -> Result<Value, RpcError> {
        let node_id = str_param(params, 0, "node_id")?;
        let latency_ms = params
            .get(1)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| RpcError::invalid_params("latency_ms must be a non-negative integer"))?;
        let coordinate = coordinate_param(params, 2)?;

        let record = self
            .context
            .heartbeat(&node_id, latency_ms, coordinate)
            .map_err(|e| RpcError::new(-32010, e.to_string()))?;
        to_json(&record)
    }

    fn get_metrics(&self) -> Result<Value, RpcError> {
        let mut value = to_json(&self.context.metrics())?;
        if let Some(core) = &self.context.core {
            value["core"] = to_json(&core.stats())?;
        }
        Ok(value)
    }

    fn get_node_info(&self) -> Result<Value, RpcError> {
        let node = &self.context.config.node;
        Ok(json!({
            "node_id": node.node_id,
            "role": node.role,
            "partition": node.partition,
            "coordinate": node.coordinate,
            "version": env!("CARGO_PKG_VERSION"),
            "consensus_deadline_ms": self.context.config.consensus.deadline_ms,
            "known_nodes": self.context.registry.len(),
        }))
    }

    fn stop(&self) -> Result<Value, RpcError> {
        match &self.shutdown {
            Some(token) => {
                tracing::info!("🛑 Shutdown requested via RPC");
                token.cancel();
                Ok(json!("relayd stopping"))
            }
            None => Err(RpcError::new(-32601, "stop is not enabled on this server")),
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::internal(e.to_string()))
}

fn str_param(params: &[Value], index: usize, name: &str) -> Result<String, RpcError> {
    params
        .get(index)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| RpcError::invalid_params(format!("{} must be a string", name)))
}

/// Payloads are UTF-8 text, or hex when prefixed with `0x`.
fn payload_param(params: &[Value], index: usize) -> Result<Vec<u8>, RpcError> {
    let raw = str_param(params, index, "payload")?;
    match raw.strip_prefix("0x") {
        Some(hex_part) => hex::decode(hex_part)
            .map_err(|e| RpcError::invalid_params(format!("payload hex: {}", e))),
        None => Ok(raw.into_bytes()),
    }
}

fn coordinate_param(params: &[Value], index: usize) -> Result<Option<GeoCoordinate>, RpcError> {
    match params.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => {
            let coord: GeoCoordinate = serde_json::from_value(value.clone())
                .map_err(|e| RpcError::invalid_params(format!("coordinate: {}", e)))?;
            if !coord.is_valid() {
                return Err(RpcError::invalid_params("coordinate out of range"));
            }
            Ok(Some(coord))
        }
    }
}

fn partition_param(params: &[Value], index: usize) -> Result<Option<Partition>, RpcError> {
    match params.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => s.parse().map(Some).map_err(RpcError::invalid_params),
        Some(_) => Err(RpcError::invalid_params("affinity must be a partition name")),
    }
}
