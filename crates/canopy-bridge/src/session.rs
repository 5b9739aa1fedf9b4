//! Opens a zenoh session from a [`BrokerConfig`].

use tracing::info;
use zenoh::Session;

use crate::config::BrokerConfig;
use crate::error::{BridgeError, BridgeResult};

/// Opens a session in the configured mode against the configured endpoints.
///
/// In client mode this fails when no router is reachable, which the
/// transport treats as a retryable connect failure.
pub async fn open(config: &BrokerConfig) -> BridgeResult<Session> {
    let mut zenoh_config = zenoh::Config::default();

    zenoh_config
        .insert_json5("mode", &format!("\"{}\"", config.mode))
        .map_err(|e| BridgeError::InvalidConfig(format!("Failed to set mode: {e}")))?;

    if !config.connect.is_empty() {
        let endpoints = serde_json::to_string(&config.connect)?;
        zenoh_config
            .insert_json5("connect/endpoints", &endpoints)
            .map_err(|e| BridgeError::InvalidConfig(format!("Failed to set connect endpoints: {e}")))?;
    }

    info!(
        mode = %config.mode,
        connect = ?config.connect,
        "Opening broker session"
    );

    let session = zenoh::open(zenoh_config).await?;

    info!(zid = %session.zid(), "Broker session open");

    Ok(session)
}
