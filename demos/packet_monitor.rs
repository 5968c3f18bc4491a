use std::{env, sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info};
use washbridge::{
    BleTransport, BridgeConfig, BtleplugPlatform, ConsumptionOrchestrator, HttpDeviceApi,
    LifecycleManager, Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let Some(mac) = env::args().nth(1) else {
        error!("Usage: packet_monitor <module-mac> [payload]");
        return Ok(());
    };
    let payload = env::args().nth(2);

    let config = BridgeConfig::default();
    let platform = Arc::new(BtleplugPlatform::new().await?);
    let transport = Arc::new(BleTransport::new(platform));
    let lifecycle = Arc::new(LifecycleManager::new(transport, config.lifecycle.clone()));
    let api = Arc::new(HttpDeviceApi::new(&config.api)?);
    let orchestrator = ConsumptionOrchestrator::new(lifecycle, api, config);

    info!("Looking for module {}", mac);
    let module = orchestrator
        .scan_and_connect(&mac, |packet| {
            info!("Packet {} (payload {:02X?})", packet, packet.payload());
        })
        .await?;
    info!(
        "Connected to {} as variant {}",
        module.peripheral.id, module.profile.variant
    );

    if let Some(payload) = payload {
        let writes = orchestrator.write_payload(&module.profile, &payload).await?;
        info!("Sent payload in {} write(s)", writes);
    }

    for _ in 0..60 {
        if !orchestrator.transport().is_device_connected().await {
            error!("Module disconnected");
            break;
        }
        sleep(Duration::from_secs(1)).await;
    }

    orchestrator.destroy().await;
    Ok(())
}
