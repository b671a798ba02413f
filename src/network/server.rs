//! TCP listener a core node runs to accept forwarded transactions and probes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core_node::CoreNodeService;
use crate::error::WireError;
use crate::network::message::WireMessage;
use crate::network::wire::{read_message, write_message};

pub struct CoreNodeServer {
    listener: TcpListener,
    service: Arc<CoreNodeService>,
}

impl CoreNodeServer {
    pub async fn bind(bind_addr: &str, service: Arc<CoreNodeService>) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self { listener, service })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), std::io::Error> {
        tracing::info!(
            "🔗 Core node {} accepting relays on {}",
            self.service.node_id(),
            self.listener.local_addr()?
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("core listener stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!("accept failed: {}", e);
                            continue;
                        }
                    };
                    let service = self.service.clone();
                    let token = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_relay(stream, service, token).await {
                            tracing::debug!("🔌 Relay {} connection ended: {}", addr, e);
                        }
                    });
                }
            }
        }
    }
}

async fn handle_relay(
    stream: TcpStream,
    service: Arc<CoreNodeService>,
    shutdown: CancellationToken,
) -> Result<(), WireError> {
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            read = read_message(&mut reader) => match read? {
                Some(message) => message,
                None => return Ok(()),
            },
        };

        let reply = match message {
            WireMessage::Ping { nonce, .. } => WireMessage::Pong {
                nonce,
                node_id: service.node_id().to_string(),
                partition: service.partition(),
                coordinate: service.coordinate(),
            },
            WireMessage::Submit {
                transaction,
                budget_ms,
            } => {
                let deadline = budget_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
                match service.submit(&transaction, deadline).await {
                    Ok(commit) => WireMessage::SubmitOk(commit),
                    Err(err) => WireMessage::SubmitErr(err),
                }
            }
            other => {
                return Err(WireError::UnexpectedReply(other.message_type().to_string()));
            }
        };

        write_message(&mut writer, &reply).await?;
    }
}
