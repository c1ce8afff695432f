// 真实QUIC链路：ndsi控制器 <-> 模拟主机
use device_simulator::{BeaconAnnouncer, SensorConfig, SensorHost, SimulatorConfig};
use futures::StreamExt;
use ndsi::config::DiscoveryConfig;
use ndsi::{
    BeaconDiscovery, Capability, Discovery, DiscoveryEvent, Error, NdsiConfig, Network, ParameterError,
    ParameterValue, QuicConnector, RecordingReader, SensorIdentity, SessionEvent, SessionState, StaticDiscovery,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn simulator_config() -> SimulatorConfig {
    SimulatorConfig {
        host_id: "test-host".to_string(),
        listen_address: "127.0.0.1:0".to_string(),
        beacon_target: "127.0.0.1:9".to_string(),
        beacon_interval_ms: 50,
        telemetry_interval_ms: 100,
        sensors: vec![SensorConfig {
            id: "world".to_string(),
            fps: 60,
            gop: 10,
            frame_bytes: 64,
            ..SensorConfig::default()
        }],
    }
}

fn start_host() -> (Arc<SensorHost>, JoinHandle<anyhow::Result<()>>) {
    let host = Arc::new(SensorHost::bind(&simulator_config()).unwrap());
    let server = {
        let host = host.clone();
        tokio::spawn(async move { host.run().await })
    };
    (host, server)
}

fn network_for(identity: &SensorIdentity) -> Network {
    let config = NdsiConfig::default();
    let connector = QuicConnector::new(&config.transport).unwrap();
    let discovery = StaticDiscovery::with_sensors([identity.clone()]);
    Network::new(Arc::new(discovery), Arc::new(connector), config)
}

#[tokio::test]
async fn test_attach_stream_and_control() {
    let (host, server) = start_host();
    let identity = SensorIdentity::new(host.local_addr().unwrap(), "world", "World", vec![Capability::Video]);
    let network = network_for(&identity);

    let session = network.attach(&identity).await.unwrap();
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.device_name(), "模拟摄像头-01");
    let mut frames = session.frames();
    let mut events = session.events();

    let first = tokio::time::timeout(WAIT, frames.next()).await.unwrap().unwrap();
    assert!(first.keyframe);
    assert_eq!((first.width, first.height), (320, 240));
    let second = tokio::time::timeout(WAIT, frames.next()).await.unwrap().unwrap();
    assert_eq!(second.index, first.index + 1);
    assert!(second.timestamp > first.timestamp);

    // 只读参数在本地拒绝
    assert!(matches!(
        session.set_parameter("sensor_temperature", ParameterValue::Number(20.0)),
        Err(Error::Parameter(ParameterError::ReadOnly(_)))
    ));

    session.set_parameter("gain", ParameterValue::Number(42.0)).unwrap();
    let confirmed = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(SessionEvent::ParameterConfirmed { name, value }) = events.recv().await {
                if name == "gain" {
                    return value;
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(confirmed, ParameterValue::Number(42.0));
    assert_eq!(
        session.get_parameters().unwrap().confirmed("gain"),
        Some(&ParameterValue::Number(42.0))
    );

    session.stop().await.unwrap();
    assert_eq!(session.state(), SessionState::Suspended);
    session.start().await.unwrap();
    let resumed = tokio::time::timeout(WAIT, frames.next()).await.unwrap().unwrap();
    assert!(resumed.index > second.index);

    network.shutdown().await;
    assert_eq!(session.state(), SessionState::Closed);

    host.shutdown();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_recording_over_quic() {
    let (host, server) = start_host();
    let identity = SensorIdentity::new(host.local_addr().unwrap(), "world", "World", vec![Capability::Video]);
    let network = network_for(&identity);
    let dir = tempfile::tempdir().unwrap();

    let session = network.attach(&identity).await.unwrap();
    let mut frames = session.frames();
    let path = session.start_recording_in(dir.path()).await.unwrap();

    for _ in 0..20 {
        tokio::time::timeout(WAIT, frames.next()).await.unwrap().unwrap();
    }
    let summary = session.stop_recording().await.unwrap();
    assert!(summary.access_units > 0);
    assert!(summary.keyframes > 0);

    let recording = RecordingReader::open(&path).unwrap();
    assert!(recording.is_finalized());
    assert_eq!(recording.len() as u64, summary.access_units as u64);
    assert_eq!(recording.resolution(), (320, 240));
    assert!(recording.units()[0].keyframe);

    network.shutdown().await;
    host.shutdown();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unknown_sensor_is_refused() {
    let (host, server) = start_host();
    let identity = SensorIdentity::new(host.local_addr().unwrap(), "eye0", "Eye", vec![Capability::Video]);
    let network = network_for(&identity);

    let result = network.attach(&identity).await;
    assert!(matches!(result, Err(Error::Connection(ndsi::ConnectionError::Refused(_)))));
    assert!(network.session("eye0").is_none());

    host.shutdown();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_beacons_are_discovered() {
    let discovery = BeaconDiscovery::bind(&DiscoveryConfig {
        bind_address: "127.0.0.1".to_string(),
        beacon_port: 0,
        ..DiscoveryConfig::default()
    })
    .await
    .unwrap();
    let mut events = discovery.subscribe();

    let mut config = simulator_config();
    config.beacon_target = discovery.local_addr().to_string();
    let announcer = BeaconAnnouncer::bind(&config, 7443).await.unwrap();
    let cancel = CancellationToken::new();
    let announcing = tokio::spawn(announcer.run(cancel.clone()));

    match tokio::time::timeout(WAIT, events.next()).await.unwrap().unwrap() {
        DiscoveryEvent::Appeared(identity) => {
            assert_eq!(identity.sensor_id, "world");
            assert_eq!(identity.address, "127.0.0.1:7443".parse().unwrap());
        }
        other => panic!("unexpected event {:?}", other),
    }

    cancel.cancel();
    announcing.await.unwrap().unwrap();
    let event = tokio::time::timeout(WAIT, events.next()).await.unwrap().unwrap();
    assert_eq!(event, DiscoveryEvent::Disappeared { sensor_id: "world".to_string() });

    discovery.shutdown().await;
}
