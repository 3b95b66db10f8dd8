//! Radio id to packet service table

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::handler::{PacketService, ServicePorts};
use crate::buffer::{BufferControl, PoolRegistry, TxBuffer};
use crate::config::Config;
use crate::error::{AcquireError, ServiceError};
use crate::hal::RadioId;

/// Fixed table of packet services, one per configured radio
pub struct ServiceRegistry {
    services: Vec<Arc<PacketService>>,
    pools: Arc<PoolRegistry>,
    control: Arc<BufferControl>,
}

impl ServiceRegistry {
    /// Register radios `1..=config.radios`
    pub fn new(config: &Config, ports: ServicePorts) -> Self {
        let pools = Arc::new(PoolRegistry::new());
        let services = (1..=config.radios)
            .map(|id| {
                Arc::new(PacketService::new(
                    RadioId(id),
                    config.clone(),
                    pools.clone(),
                    ports.clone(),
                ))
            })
            .collect::<Vec<_>>();
        info!("Registered {} packet service(s)", services.len());

        Self {
            services,
            pools,
            control: Arc::new(BufferControl::new(config.common_buffers, config.frame_len)),
        }
    }

    pub fn service(&self, radio: RadioId) -> Result<Arc<PacketService>, ServiceError> {
        self.services
            .iter()
            .find(|service| service.radio() == radio)
            .cloned()
            .ok_or(ServiceError::NoSuchRadio(radio))
    }

    pub fn services(&self) -> impl Iterator<Item = &Arc<PacketService>> {
        self.services.iter()
    }

    pub fn pools(&self) -> &Arc<PoolRegistry> {
        &self.pools
    }

    pub fn buffer_control(&self) -> &Arc<BufferControl> {
        &self.control
    }

    /// Allocate a transmit buffer against the common resource
    pub async fn allocate_tx_buffer(&self, timeout: Option<Duration>) -> Result<TxBuffer, AcquireError> {
        self.control.allocate(timeout).await
    }

    /// Drain the common resource and reset it
    pub async fn shutdown(&self) {
        self.control.shutdown().await;
    }
}
