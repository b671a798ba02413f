use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::types::{CommitResult, GeoCoordinate, Partition, Transaction};

/// Frames exchanged between a relay and a core node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum WireMessage {
    Ping {
        nonce: u64,
        sent_at_ms: u64,
    },
    Pong {
        nonce: u64,
        node_id: String,
        partition: Partition,
        coordinate: Option<GeoCoordinate>,
    },
    Submit {
        transaction: Transaction,
        /// Remaining caller budget; the core uses it to bound consensus
        budget_ms: Option<u64>,
    },
    SubmitOk(CommitResult),
    SubmitErr(PipelineError),
}

impl WireMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            WireMessage::Ping { .. } => "Ping",
            WireMessage::Pong { .. } => "Pong",
            WireMessage::Submit { .. } => "Submit",
            WireMessage::SubmitOk(_) => "SubmitOk",
            WireMessage::SubmitErr(_) => "SubmitErr",
        }
    }
}
