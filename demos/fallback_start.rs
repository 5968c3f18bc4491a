use std::{env, sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use washbridge::{
    BleTransport, BridgeConfig, BtleplugPlatform, ConsumptionOrchestrator, ConsumptionOutcome,
    HttpDeviceApi, LifecycleManager, Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("washbridge=info")),
        )
        .init();

    let mut args = env::args().skip(1);
    let Some(device_no) = args.next() else {
        error!("Usage: fallback_start <device-no> [config.toml]");
        return Ok(());
    };
    let config_path = args.next().unwrap_or_else(|| "washbridge.toml".to_string());

    let config = BridgeConfig::load(&config_path)?;
    info!("Loaded configuration from {}", config_path);

    let platform = Arc::new(BtleplugPlatform::new().await?);
    let transport = Arc::new(BleTransport::new(platform));
    let lifecycle = Arc::new(LifecycleManager::new(transport, config.lifecycle.clone()));

    let mut api = HttpDeviceApi::new(&config.api)?;
    if let Ok(token) = env::var("WASHBRIDGE_TOKEN") {
        api = api.with_token(token);
    }

    let orchestrator = ConsumptionOrchestrator::new(lifecycle, Arc::new(api), config);

    info!("Starting device {}", device_no);
    match orchestrator.start_consumption(&device_no).await {
        Ok(ConsumptionOutcome::Cellular { order_id, state }) => {
            info!("Started over cellular, order {} is {}", order_id, state);
        }
        Ok(ConsumptionOutcome::Ble { response }) => {
            info!("Started over BLE, module answered {}", response);
        }
        Err(e) if e.requires_user_action() => {
            warn!("Action required: {}", e.user_message());
            return Err(e);
        }
        Err(e) => {
            error!("Start failed: {}", e);
            orchestrator.destroy().await;
            return Err(e);
        }
    }

    sleep(Duration::from_secs(10)).await;

    info!("Stopping device {}", device_no);
    match orchestrator.stop_consumption(&device_no).await {
        Ok(outcome) => info!("Stopped: {:?}", outcome),
        Err(e) => error!("Stop failed: {}", e),
    }

    orchestrator.destroy().await;
    Ok(())
}
