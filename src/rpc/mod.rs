pub mod handler;
pub mod server;

pub use handler::RpcHandler;
pub use server::{RpcError, RpcRequest, RpcResponse, RpcServer};
