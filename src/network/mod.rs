pub mod client;
pub mod message;
pub mod server;
pub mod transport;
pub mod wire;

pub use client::TcpTransport;
pub use message::WireMessage;
pub use server::CoreNodeServer;
pub use transport::{CoreTransport, LocalTransport, ProbeReply};
