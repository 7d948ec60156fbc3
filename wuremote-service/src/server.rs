//! Service setup and lifecycle.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use wuremote_agent::{MockAgent, MockMode, UpdateAgent};

use crate::config::{AgentBackend, Config};
use crate::http_server;
use crate::service::{ServiceOptions, WuRemoteService};

/// Build the configured agent backend.
pub fn create_agent(config: &Config) -> Arc<dyn UpdateAgent> {
    match config.agent.backend {
        AgentBackend::Mock => {
            let mock = &config.agent.mock;
            info!(
                step_delay_ms = mock.step_delay_ms,
                steps = mock.steps,
                catalog_size = mock.catalog_size,
                "Using mock update agent"
            );
            let agent = MockAgent::new(
                MockMode::Auto {
                    step_delay: Duration::from_millis(mock.step_delay_ms),
                    steps: mock.steps,
                },
                MockAgent::sample_catalog(mock.catalog_size),
            );
            agent.set_install_requires_reboot(mock.install_requires_reboot);
            Arc::new(agent)
        }
    }
}

/// Run the service until Ctrl-C.
pub async fn run(config: Config) -> Result<()> {
    let agent = create_agent(&config);

    // Check agent health
    match agent.health_check().await {
        Ok(true) => {
            if let Ok(info) = agent.info().await {
                info!(name = %info.name, version = %info.version, "Update agent ready");
            }
        }
        Ok(false) => warn!("Update agent reports unhealthy"),
        Err(e) => warn!(error = %e, "Update agent health check failed"),
    }

    let service = Arc::new(WuRemoteService::new(agent, ServiceOptions::from(&config)));
    info!(
        fqdn = %service.get_fqdn(),
        version = service.get_service_version(),
        "Service initialized"
    );

    let shutdown_service = service.clone();
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown requested");
        shutdown_service.send_shutdown_signal();
        // Give observer deliveries a moment to flush before sockets close.
        tokio::time::sleep(Duration::from_millis(250)).await;
    };

    if config.server.enable_http {
        let addr: SocketAddr = config
            .server
            .listen_address
            .parse()
            .with_context(|| format!("Invalid listen address: {}", config.server.listen_address))?;

        if let Err(e) = http_server::run_http_server(addr, service.clone(), shutdown).await {
            error!(error = %e, "HTTP server failed");
            service.shutdown().await;
            return Err(e);
        }
    } else {
        info!("HTTP host disabled, waiting for shutdown signal");
        shutdown.await;
    }

    let state = service.shutdown().await;
    info!(state = %state, "Service stopped");
    Ok(())
}
