//! JSON-RPC 2.0 over a minimal HTTP/1.1 POST listener on raw TCP.

use super::handler::RpcHandler;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Largest request (headers + body) accepted
const MAX_REQUEST_BYTES: usize = 2 * 1024 * 1024;

#[derive(Serialize, Deserialize, Debug)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(-32700, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(-32602, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(-32601, format!("Method not found: {}", method))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(-32603, message)
    }
}

impl RpcResponse {
    pub fn error(id: String, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

pub struct RpcServer {
    listener: TcpListener,
    handler: Arc<RpcHandler>,
}

impl RpcServer {
    pub async fn bind(addr: &str, handler: Arc<RpcHandler>) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, handler })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), std::io::Error> {
        tracing::info!("✅ RPC server listening on {}", self.listener.local_addr()?);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("RPC server stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (socket, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!("RPC accept failed: {}", e);
                            continue;
                        }
                    };
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(socket, handler).await {
                            tracing::debug!("RPC connection from {} failed: {}", addr, e);
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(
        mut socket: TcpStream,
        handler: Arc<RpcHandler>,
    ) -> Result<(), std::io::Error> {
        let body = match read_http_body(&mut socket).await? {
            Some(body) => body,
            None => return Ok(()),
        };

        let response = if body.trim().is_empty() {
            RpcResponse::error("unknown".to_string(), RpcError::parse("No request body"))
        } else {
            match serde_json::from_str::<RpcRequest>(body.trim_end_matches('\0')) {
                Ok(request) => handler.handle_request(request).await,
                Err(e) => RpcResponse::error(
                    "unknown".to_string(),
                    RpcError::parse(format!("Parse error: {}", e)),
                ),
            }
        };

        let response_json = serde_json::to_string(&response)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        let http_response = format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {}",
            response_json.len(),
            response_json
        );

        socket.write_all(http_response.as_bytes()).await?;
        socket.flush().await?;
        Ok(())
    }
}

/// Read one HTTP request and return its body. `None` if the peer sent nothing.
async fn read_http_body(socket: &mut TcpStream) -> Result<Option<String>, std::io::Error> {
    let mut buffer = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.len() > MAX_REQUEST_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request too large",
            ));
        }
        if let Some((header_end, content_length)) = parse_head(&buffer) {
            if buffer.len() >= header_end + content_length {
                break;
            }
        }
    }

    if buffer.is_empty() {
        return Ok(None);
    }

    let text = String::from_utf8_lossy(&buffer);
    let body = if let Some(start) = text.find("\r\n\r\n") {
        &text[start + 4..]
    } else if let Some(start) = text.find("\n\n") {
        &text[start + 2..]
    } else {
        ""
    };
    Ok(Some(body.to_string()))
}

/// Offset of the body and the declared Content-Length (0 when absent).
fn parse_head(buffer: &[u8]) -> Option<(usize, usize)> {
    let header_end = buffer.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let head = String::from_utf8_lossy(&buffer[..header_end]);
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0);
    Some((header_end, content_length))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_head_reads_content_length() {
        let raw = b"POST / HTTP/1.1\r\nHost: x\r\ncontent-length: 12\r\n\r\n{\"a\":1}";
        let (end, len) = parse_head(raw).unwrap();
        assert_eq!(len, 12);
        assert_eq!(&raw[end..], b"{\"a\":1}");
        assert!(parse_head(b"POST / HTTP/1.1\r\nHost").is_none());
    }

    #[test]
    fn test_error_response_omits_result() {
        let response = RpcResponse::error("7".into(), RpcError::method_not_found("nope"));
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("result").is_none());
        assert_eq!(json["error"]["code"], -32601);
        assert!(json["error"].get("data").is_none());
    }
}
