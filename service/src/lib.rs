use broker::{Broker, MemoryBroker, RedisBroker};
use config::Config;
use log::info;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod logging;

/// Builds the broker named by the configuration: the in-process broker for
/// `memory://`, otherwise a pooled Redis client.
pub async fn init_broker(config: &Config) -> Result<Arc<dyn Broker>, broker::Error> {
    if config.uses_memory_broker() {
        info!("Using in-process memory broker");
        return Ok(Arc::new(MemoryBroker::new()));
    }

    info!(
        "Broker pool config: max_connections={}",
        config.broker_max_connections
    );

    let redis = RedisBroker::connect(
        config.broker_url(),
        config.broker_password(),
        config.broker_db,
        config.broker_max_connections,
    )
    .await?;

    Ok(Arc::new(redis))
}

// Service-level state containing only infrastructure concerns
// Needs to implement Clone to be able to be passed into Router as State
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<dyn Broker>,
    pub config: Config,
    /// Cancelled once the server starts shutting down; every open stream
    /// watches it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(app_config: Config, broker: &Arc<dyn Broker>) -> Self {
        Self {
            broker: Arc::clone(broker),
            config: app_config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[tokio::test]
    async fn memory_url_builds_a_working_broker() {
        let config = Config::parse_from(["sse_bridge", "--pubsub-prefix", "/p", "--broker-url", "memory://"]);
        let broker = init_broker(&config).await.unwrap();

        assert_eq!(broker.publish("nobody", b"hi").await.unwrap(), 0);
    }

    #[test]
    fn app_state_clones_share_the_shutdown_token() {
        let config = Config::parse_from(["sse_bridge", "--pubsub-prefix", "/p"]);
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let state = AppState::new(config, &broker);
        let clone = state.clone();

        state.shutdown.cancel();
        assert!(clone.shutdown.is_cancelled());
    }
}
