//! Publishes the viewer's listen port through the discovery service.

use lanscope_relay::{DiscoveryConfig, DiscoveryError, DiscoveryService, ServiceIdentity};

use crate::domain::ViewerConfig;

/// Discovery settings for the advertising side.  The peer TTL is only used
/// by browsers, so the default is kept.
pub fn discovery_config(config: &ViewerConfig) -> DiscoveryConfig {
    DiscoveryConfig {
        discovery_port: config.discovery_port,
        broadcast_addr: config.broadcast_addr,
        announce_interval: config.announce_interval,
        ..Default::default()
    }
}

/// Starts announcing `port` under the configured name, type and domain.
///
/// The returned service keeps announcing until it is stopped or dropped; a
/// goodbye is sent on the way out.
///
/// # Errors
///
/// [`DiscoveryError::BindFailed`] if the announcement socket cannot be bound.
pub async fn start_advertiser(
    config: &ViewerConfig,
    port: u16,
) -> Result<DiscoveryService, DiscoveryError> {
    let service = DiscoveryService::new(discovery_config(config));
    service
        .start_advertising(
            ServiceIdentity {
                name: config.service_name.clone(),
                service_type: config.service_type.clone(),
                domain: config.domain.clone(),
            },
            port,
        )
        .await?;
    Ok(service)
}
