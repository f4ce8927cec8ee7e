pub mod admin;
pub mod server;

pub use server::{build_app, GatewayServer, GatewayState};
