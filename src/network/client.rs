//! TCP client side of the relay ↔ core wire protocol.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::error::{PipelineError, WireError};
use crate::network::message::WireMessage;
use crate::network::transport::{remaining_budget, CoreTransport, ProbeReply};
use crate::network::wire::{read_reply, write_message};
use crate::types::{unix_millis, CommitResult, NodeRecord, Transaction};

/// One short-lived connection per forward or probe.
pub struct TcpTransport {
    connect_timeout: Duration,
    forward_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, forward_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            forward_timeout,
        }
    }

    async fn connect(&self, address: &str, budget: Duration) -> Result<TcpStream, WireError> {
        let limit = self.connect_timeout.min(budget);
        match tokio::time::timeout(limit, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(WireError::Io(e)),
            Err(_) => Err(WireError::Timeout(limit.as_millis() as u64)),
        }
    }

    /// Send `request` and wait for one reply frame, all within `budget`.
    async fn exchange(
        &self,
        address: &str,
        request: &WireMessage,
        budget: Duration,
    ) -> Result<WireMessage, WireError> {
        let started = Instant::now();
        let mut stream = self.connect(address, budget).await?;
        let left = budget.saturating_sub(started.elapsed());

        let round_trip = async {
            write_message(&mut stream, request).await?;
            read_reply(&mut stream).await
        };
        match tokio::time::timeout(left, round_trip).await {
            Ok(reply) => reply,
            Err(_) => Err(WireError::Timeout(budget.as_millis() as u64)),
        }
    }
}

#[async_trait]
impl CoreTransport for TcpTransport {
    async fn forward(
        &self,
        target: &NodeRecord,
        tx: &Transaction,
        deadline: Option<Instant>,
    ) -> Result<CommitResult, PipelineError> {
        let budget = remaining_budget(self.forward_timeout, deadline);
        let request = WireMessage::Submit {
            transaction: tx.clone(),
            budget_ms: deadline.map(|_| budget.as_millis() as u64),
        };

        match self.exchange(&target.address, &request, budget).await {
            Ok(WireMessage::SubmitOk(commit)) => Ok(commit),
            Ok(WireMessage::SubmitErr(err)) => Err(err),
            Ok(other) => Err(PipelineError::upstream(
                &target.node_id,
                WireError::UnexpectedReply(other.message_type().to_string()).to_string(),
            )),
            Err(e) => {
                tracing::debug!(node_id = %target.node_id, address = %target.address, "forward failed: {}", e);
                Err(PipelineError::upstream(&target.node_id, e.to_string()))
            }
        }
    }

    async fn probe(&self, address: &str) -> Result<ProbeReply, WireError> {
        let nonce: u64 = rand::random();
        let started = Instant::now();
        let ping = WireMessage::Ping {
            nonce,
            sent_at_ms: unix_millis(),
        };

        match self.exchange(address, &ping, self.forward_timeout).await? {
            WireMessage::Pong {
                nonce: echoed,
                node_id,
                partition,
                coordinate,
            } if echoed == nonce => Ok(ProbeReply {
                node_id,
                partition,
                coordinate,
                round_trip: started.elapsed(),
            }),
            other => Err(WireError::UnexpectedReply(other.message_type().to_string())),
        }
    }
}
