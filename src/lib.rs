pub mod config;
pub mod constants;
pub mod error;
pub mod logger;
pub mod proxy;

use tracing::{error, info, warn};

async fn start_runtime() -> Result<(), String> {
    let mut app_config = config::load_app_config()?;
    config::apply_env_overrides(&mut app_config);
    config::validate_app_config(&app_config).map_err(|errors| {
        format!(
            "configuration_validation_failed:\n{}",
            errors.join("\n")
        )
    })?;

    if app_config.server.allow_lan_access {
        warn!("[W-LAN-ACCESS-ENABLED] lan_access_enabled_bind_address_0_0_0_0");
    } else {
        info!("LAN access is disabled (bind address will be 127.0.0.1)");
    }
    if app_config.upstream.api_key.is_empty() {
        info!("No upstream API key configured; inbound bearer tokens pass through");
    }

    let state = proxy::AppState::new(app_config);
    let (_addr, _handle) = proxy::server::start_server(state).await?;

    info!("Service is running. Press Ctrl+C to exit.");
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutting down");
    Ok(())
}

pub fn run() {
    logger::init_logger();

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    runtime.block_on(async {
        if let Err(e) = start_runtime().await {
            error!("[E-RUNTIME-STARTUP] {}", e);
            std::process::exit(1);
        }
    });
}
