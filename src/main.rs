use anyhow::Context;
use chrono::Utc;
use linky_sensor_bridge::{
    list_meters, select_meter, ConsoApi, SensorProjection, Settings, UpdateCoordinator,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Linky sensor bridge");
    let settings = Settings::from_env()?;

    let meters = list_meters(&settings.token).context("Could not read the token")?;
    let meter = select_meter(&meters, settings.meter.as_deref())?;
    let api = ConsoApi::new(&settings.api_url, settings.request_timeout, settings.timezone)?;

    let entry = settings.entry(meter.clone());
    let coordinator = match UpdateCoordinator::setup(api, entry, settings.coordinator_settings()).await {
        Ok(coordinator) => coordinator,
        Err(e) => {
            error!(%meter, "Setup failed: {e}");
            anyhow::bail!(e.user_message());
        }
    };

    let sensors = SensorProjection::for_entry(&meter, settings.production_enabled);
    let mut updates = coordinator.subscribe();
    let handle = coordinator.spawn();

    loop {
        // The first round shows what setup already fetched
        let state = updates.borrow_and_update().clone();
        for sensor in &sensors {
            let reading = sensor.read(&state, Utc::now());
            match serde_json::to_string(&reading) {
                Ok(json) => info!(sensor = %reading.unique_id, "{json}"),
                Err(e) => error!(sensor = %reading.unique_id, "Could not serialize reading: {e}"),
            }
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    handle.stop().await;
    info!("Linky sensor bridge stopped");
    Ok(())
}
