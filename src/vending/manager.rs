use crate::config::ControllerConfig;
use crate::dispatch::{DispatchBuilder, DispatchHandle, MetricsSnapshot};
use crate::serial::{FrameCodec, PortConnector, SerialInterface};

use super::models::HealthReport;
use super::orchestrator::DispenseOrchestrator;

/// Owns the running pipeline: transport, dispatch worker and orchestrator.
pub struct VendingController {
    dispatch: DispatchHandle,
    orchestrator: DispenseOrchestrator,
}

impl VendingController {
    /// Start against the serial port named in `config`.
    pub fn start(config: &ControllerConfig) -> Self {
        Self::start_with(config.serial_settings(), config)
    }

    /// Start against any device, e.g. a simulated VMC.
    pub fn start_with(connector: impl PortConnector + 'static, config: &ControllerConfig) -> Self {
        let interface = SerialInterface::new(connector);
        let dispatch = DispatchBuilder::new(interface)
            .codec(FrameCodec::new(config.codec.clone()))
            .policy(config.session_policy())
            .reopen(config.reopen_policy())
            .queue_depth(config.dispatch.queue_depth)
            .submit_timeout(config.submit_timeout())
            .sync_with_vmc(config.protocol.sync_with_vmc)
            .build();
        let orchestrator = DispenseOrchestrator::new(dispatch.clone(), config.aisles);

        log::info!(
            "Vending controller started (aisles {}..={})",
            config.aisles.min,
            config.aisles.max
        );
        Self { dispatch, orchestrator }
    }

    pub fn orchestrator(&self) -> &DispenseOrchestrator {
        &self.orchestrator
    }

    /// Last known transport state. Reads the worker's snapshot; never touches the wire.
    pub fn health_report(&self) -> HealthReport {
        let health = self.dispatch.health();
        HealthReport {
            transport_open: health.transport_open,
            last_error: health.last_error,
            port: health.port,
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.dispatch.metrics()
    }

    pub async fn shutdown(&self) {
        log::info!("Shutting down vending controller");
        self.dispatch.shutdown().await;
    }
}
