use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 模拟主机配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// 主机实例ID（信标中携带）
    pub host_id: String,

    /// QUIC监听地址
    pub listen_address: String,

    /// 信标发送目标（广播地址或指定控制器）
    pub beacon_target: String,

    pub beacon_interval_ms: u64,

    /// 只读温度参数的推送周期
    pub telemetry_interval_ms: u64,

    pub sensors: Vec<SensorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub id: String,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,

    /// 关键帧间隔（帧）
    pub gop: u32,

    /// 每帧条带填充字节数
    pub frame_bytes: usize,

    /// 握手时是否已在推流
    pub autostart: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            host_id: uuid::Uuid::new_v4().to_string(),
            listen_address: "0.0.0.0:8443".to_string(),
            beacon_target: format!("255.255.255.255:{}", common::DEFAULT_BEACON_PORT),
            beacon_interval_ms: 1000,
            telemetry_interval_ms: 1000,
            sensors: vec![SensorConfig::default()],
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            id: "world".to_string(),
            name: "模拟摄像头-01".to_string(),
            width: 320,
            height: 240,
            fps: 30,
            gop: 30,
            frame_bytes: 512,
            autostart: false,
        }
    }
}

impl SimulatorConfig {
    /// 从TOML文件加载，缺省字段取默认值
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("Failed to parse simulator config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sensors.is_empty() {
            anyhow::bail!("at least one sensor must be configured");
        }
        for sensor in &self.sensors {
            if sensor.width == 0 || sensor.height == 0 || sensor.width % 2 != 0 || sensor.height % 2 != 0 {
                anyhow::bail!("sensor {}: resolution must be even and non-zero", sensor.id);
            }
            if sensor.fps == 0 || sensor.gop == 0 {
                anyhow::bail!("sensor {}: fps and gop must be positive", sensor.id);
            }
        }
        Ok(())
    }

    pub fn beacon_interval(&self) -> Duration {
        Duration::from_millis(self.beacon_interval_ms.max(10))
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms.max(10))
    }

    pub fn sensor(&self, id: &str) -> Option<&SensorConfig> {
        self.sensors.iter().find(|s| s.id == id)
    }
}

impl SensorConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps as f64)
    }
}
