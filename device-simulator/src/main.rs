use anyhow::Result;
use device_simulator::{BeaconAnnouncer, SensorHost, SimulatorConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志 - 使用环境变量 RUST_LOG 控制级别
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("🎥 Device simulator starting...");

    // 加载配置：第一个参数为TOML文件路径，缺省使用默认配置
    let config = match std::env::args().nth(1) {
        Some(path) => SimulatorConfig::load(path)?,
        None => SimulatorConfig::default(),
    };
    info!("✓ Configuration loaded");
    info!("  Host ID: {}", config.host_id);
    for sensor in &config.sensors {
        info!(
            "  Sensor {} ({}): {}x{} @ {}fps",
            sensor.id, sensor.name, sensor.width, sensor.height, sensor.fps
        );
    }

    let host = Arc::new(SensorHost::bind(&config)?);
    let port = host.local_addr()?.port();
    let announcer = BeaconAnnouncer::bind(&config, port).await?;

    let cancel = CancellationToken::new();
    let beacons = tokio::spawn(announcer.run(cancel.clone()));
    let server = {
        let host = host.clone();
        tokio::spawn(async move { host.run().await })
    };

    info!("✅ Device simulator ready!");
    info!("   Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    cancel.cancel();
    host.shutdown();
    if let Ok(Err(e)) = beacons.await {
        error!("Beacon announcer failed: {}", e);
    }
    if let Ok(Err(e)) = server.await {
        error!("Sensor host failed: {}", e);
    }

    Ok(())
}
