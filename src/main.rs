//! Broker-to-SSE bridge.
//!
//! Streams Redis pub/sub channels and Redis streams to browsers as
//! Server-Sent Events and accepts HTTP POSTs that publish or append to them.
use log::*;
use service::{config::Config, logging::Logger, AppState};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::new();
    Logger::init_logger(&config);

    info!("Starting up sse_bridge: {config}");

    let broker = match service::init_broker(&config).await {
        Ok(broker) => broker,
        Err(e) => {
            error!("Unable to connect to broker at startup: {e}");
            return ExitCode::FAILURE;
        }
    };

    let app_state = AppState::new(config, &broker);

    if let Err(e) = web::init_server(app_state).await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Server stopped");
    ExitCode::SUCCESS
}
