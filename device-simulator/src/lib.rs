//! 模拟NDSI传感器主机：QUIC控制/数据端点、合成H.264码流、UDP发现信标

pub mod beacon;
pub mod config;
pub mod generator;
pub mod host;
pub mod parameters;

pub use beacon::BeaconAnnouncer;
pub use config::{SensorConfig, SimulatorConfig};
pub use generator::{EncodedUnit, SyntheticStream};
pub use host::SensorHost;
pub use parameters::ParameterStore;
