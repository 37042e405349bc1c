mod config;
mod server;
mod telemetry;

pub use config::Settings;
pub use server::RpcServer;
pub use telemetry::init_tracing;
