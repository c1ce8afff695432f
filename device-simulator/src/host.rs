// QUIC传感器主机：每个控制器连接打开一条控制流和一条数据流，
// 各流的第一条消息（Hello）声明其用途。

use crate::config::{SensorConfig, SimulatorConfig};
use crate::generator::SyntheticStream;
use crate::parameters::{ParameterStore, SetError};
use anyhow::{anyhow, Context, Result};
use common::{
    decode_message, encode_message, ChannelKind, ChunkCodec, ChunkFlags, ClientMessage, ControlAction,
    ControlReply, ControlRequest, DataChunk, DeviceMessage, ParameterValue,
};
use futures::{SinkExt, StreamExt};
use quinn::{Connection, Endpoint, RecvStream, SendStream, ServerConfig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type ControlRead = FramedRead<RecvStream, LengthDelimitedCodec>;
type ControlWrite = FramedWrite<SendStream, LengthDelimitedCodec>;

/// 一个模拟传感器（跨连接共享参数）
struct SimulatedSensor {
    config: SensorConfig,
    parameters: Mutex<ParameterStore>,
}

/// 同一连接上控制流与数据流共享的状态
struct LinkState {
    streaming: watch::Sender<bool>,
    keyframe: AtomicBool,
}

pub struct SensorHost {
    endpoint: Endpoint,
    sensors: Arc<HashMap<String, Arc<SimulatedSensor>>>,
    telemetry_interval: Duration,
    cancel: CancellationToken,
}

impl SensorHost {
    pub fn bind(config: &SimulatorConfig) -> Result<Self> {
        config.validate()?;
        let addr: SocketAddr = config
            .listen_address
            .parse()
            .with_context(|| format!("invalid listen address {}", config.listen_address))?;

        // 创建自签名证书
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
        let cert_der = cert.serialize_der()?;
        let key_der = cert.serialize_private_key_der();

        let cert_chain = vec![rustls::Certificate(cert_der)];
        let key = rustls::PrivateKey(key_der);
        let mut server_config = ServerConfig::with_single_cert(cert_chain, key)?;

        // 配置传输参数
        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_concurrent_bidi_streams(8_u32.into());
        transport_config.max_idle_timeout(Some(Duration::from_secs(30).try_into()?));
        transport_config.keep_alive_interval(Some(Duration::from_secs(5)));
        server_config.transport_config(Arc::new(transport_config));

        let endpoint = Endpoint::server(server_config, addr)?;

        let sensors = config
            .sensors
            .iter()
            .map(|sensor| {
                (
                    sensor.id.clone(),
                    Arc::new(SimulatedSensor {
                        config: sensor.clone(),
                        parameters: Mutex::new(ParameterStore::camera()),
                    }),
                )
            })
            .collect();

        Ok(Self {
            endpoint,
            sensors: Arc::new(sensors),
            telemetry_interval: config.telemetry_interval(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// 接受连接直到 `shutdown`
    pub async fn run(&self) -> Result<()> {
        info!("🎥 Sensor host listening on {}", self.local_addr()?);

        loop {
            let connecting = tokio::select! {
                _ = self.cancel.cancelled() => break,
                connecting = self.endpoint.accept() => match connecting {
                    Some(connecting) => connecting,
                    None => break,
                },
            };

            let sensors = self.sensors.clone();
            let telemetry_interval = self.telemetry_interval;
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                match connecting.await {
                    Ok(connection) => {
                        info!("New controller connection from: {}", connection.remote_address());
                        if let Err(e) = handle_connection(connection, sensors, telemetry_interval, cancel).await {
                            error!("Connection error: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("Connection failed: {}", e);
                    }
                }
            });
        }

        info!("Sensor host stopped");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.endpoint.close(0u32.into(), b"host shutting down");
    }
}

async fn handle_connection(
    connection: Connection,
    sensors: Arc<HashMap<String, Arc<SimulatedSensor>>>,
    telemetry_interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let link = Arc::new(LinkState {
        streaming: watch::Sender::new(false),
        keyframe: AtomicBool::new(false),
    });

    loop {
        let (send, recv) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            stream = connection.accept_bi() => match stream {
                Ok(stream) => stream,
                Err(quinn::ConnectionError::ApplicationClosed(_)) => {
                    info!("Controller {} disconnected", connection.remote_address());
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            },
        };

        // 流的用途要等Hello到达才知道，每条流独立分类
        tokio::spawn(serve_stream(
            send,
            recv,
            sensors.clone(),
            link.clone(),
            telemetry_interval,
            cancel.clone(),
        ));
    }
}

async fn serve_stream(
    send: SendStream,
    recv: RecvStream,
    sensors: Arc<HashMap<String, Arc<SimulatedSensor>>>,
    link: Arc<LinkState>,
    telemetry_interval: Duration,
    cancel: CancellationToken,
) {
    let mut reader = FramedRead::new(recv, LengthDelimitedCodec::new());
    let hello = match reader.next().await {
        Some(Ok(frame)) => decode_message::<ClientMessage>(&frame),
        Some(Err(e)) => {
            warn!("Stream failed before hello: {}", e);
            return;
        }
        None => return,
    };
    let (sensor_id, channel) = match hello {
        Ok(ClientMessage::Hello { sensor_id, channel }) => (sensor_id, channel),
        Ok(other) => {
            warn!("Stream opened without hello: {:?}", other);
            return;
        }
        Err(e) => {
            warn!("Malformed hello: {}", e);
            return;
        }
    };

    let sensor = sensors.get(&sensor_id).cloned();
    match channel {
        ChannelKind::Control => {
            let writer = FramedWrite::new(send, LengthDelimitedCodec::new());
            if let Err(e) = serve_control(sensor_id, sensor, reader, writer, link, telemetry_interval, cancel).await {
                warn!("Control stream ended: {}", e);
            }
        }
        ChannelKind::Data => {
            let Some(sensor) = sensor else {
                warn!("Data stream for unknown sensor {}", sensor_id);
                return;
            };
            if let Err(e) = serve_data(sensor, send, link, cancel).await {
                debug!("Data stream ended: {}", e);
            }
        }
    }
}

async fn serve_control(
    sensor_id: String,
    sensor: Option<Arc<SimulatedSensor>>,
    mut reader: ControlRead,
    mut writer: ControlWrite,
    link: Arc<LinkState>,
    telemetry_interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let Some(sensor) = sensor else {
        warn!("Refusing unknown sensor {}", sensor_id);
        let refused = DeviceMessage::Refused {
            reason: format!("no sensor named {}", sensor_id),
        };
        send(&mut writer, &refused).await?;
        return Ok(());
    };

    if sensor.config.autostart {
        link.streaming.send_replace(true);
    }
    let parameters = sensor.parameters.lock().await.updates();
    let streaming = *link.streaming.borrow();
    let welcome = DeviceMessage::Welcome {
        sensor_id: sensor_id.clone(),
        name: sensor.config.name.clone(),
        streaming,
        parameters,
    };
    send(&mut writer, &welcome).await?;
    info!("✓ Controller attached to sensor {}", sensor_id);

    let mut telemetry = tokio::time::interval(telemetry_interval);
    telemetry.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = reader.next() => match frame {
                Some(Ok(frame)) => match decode_message::<ClientMessage>(&frame) {
                    Ok(ClientMessage::Request(request)) => {
                        handle_request(&sensor, request, &mut writer, &link).await?;
                    }
                    Ok(ClientMessage::Hello { .. }) => warn!("Duplicate hello on control stream"),
                    Err(e) => warn!("Malformed control request: {}", e),
                },
                Some(Err(e)) => return Err(e.into()),
                None => break,
            },
            _ = telemetry.tick() => {
                let update = {
                    let mut store = sensor.parameters.lock().await;
                    let current = store.get("sensor_temperature").and_then(|v| v.as_f64()).unwrap_or(36.0);
                    // 在36~40度之间缓慢变化
                    let next = if current >= 40.0 { 36.0 } else { current + 0.5 };
                    store.report("sensor_temperature", ParameterValue::Number(next));
                    store.update("sensor_temperature")
                };
                if let Some(update) = update {
                    send(&mut writer, &DeviceMessage::Push(update)).await?;
                }
            }
        }
    }

    link.streaming.send_replace(false);
    info!("Controller detached from sensor {}", sensor_id);
    Ok(())
}

async fn handle_request(
    sensor: &SimulatedSensor,
    request: ControlRequest,
    writer: &mut ControlWrite,
    link: &LinkState,
) -> Result<()> {
    let ControlRequest { request_id, action } = request;
    debug!("⬅️ Request #{}: {:?}", request_id, action);

    match action {
        ControlAction::Get { name } => {
            let value = sensor.parameters.lock().await.get(&name).cloned();
            let reply = match value {
                Some(value) => ControlReply::ok(request_id, Some(name), Some(value)),
                None => ControlReply::unknown(request_id, name),
            };
            send(writer, &DeviceMessage::Reply(reply)).await
        }
        ControlAction::Set { name, value } => {
            let result = sensor.parameters.lock().await.set(&name, value);
            let reply = match result {
                Ok(applied) => {
                    info!("Parameter {} set to {}", name, applied);
                    ControlReply::ok(request_id, Some(name), Some(applied))
                }
                Err(SetError::Unknown) => ControlReply::unknown(request_id, name),
                Err(SetError::Rejected(reason)) => ControlReply::rejected(request_id, Some(name), reason),
            };
            send(writer, &DeviceMessage::Reply(reply)).await
        }
        ControlAction::GetAll => {
            let updates = sensor.parameters.lock().await.updates();
            for update in updates {
                send(writer, &DeviceMessage::Push(update)).await?;
            }
            send(writer, &DeviceMessage::Reply(ControlReply::ok(request_id, None, None))).await
        }
        ControlAction::ResetAll => {
            let updates = {
                let mut store = sensor.parameters.lock().await;
                store.reset();
                store.updates()
            };
            for update in updates {
                send(writer, &DeviceMessage::Push(update)).await?;
            }
            send(writer, &DeviceMessage::Reply(ControlReply::ok(request_id, None, None))).await
        }
        ControlAction::StartStream => {
            link.keyframe.store(true, Ordering::SeqCst);
            let changed = !link.streaming.send_replace(true);
            send(writer, &DeviceMessage::Reply(ControlReply::ok(request_id, None, None))).await?;
            if changed {
                info!("▶️ Streaming {}", sensor.config.id);
                send(writer, &DeviceMessage::StreamStarted).await?;
            }
            Ok(())
        }
        ControlAction::StopStream => {
            let changed = link.streaming.send_replace(false);
            send(writer, &DeviceMessage::Reply(ControlReply::ok(request_id, None, None))).await?;
            if changed {
                info!("⏸️ Stopped {}", sensor.config.id);
                send(writer, &DeviceMessage::StreamStopped).await?;
            }
            Ok(())
        }
        ControlAction::RequestKeyframe => {
            link.keyframe.store(true, Ordering::SeqCst);
            send(writer, &DeviceMessage::Reply(ControlReply::ok(request_id, None, None))).await
        }
    }
}

async fn serve_data(
    sensor: Arc<SimulatedSensor>,
    send: SendStream,
    link: Arc<LinkState>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut writer = FramedWrite::new(send, ChunkCodec::new());
    let mut generator = SyntheticStream::new(&sensor.config);
    let mut streaming = link.streaming.subscribe();
    let mut ticker = tokio::time::interval(sensor.config.frame_interval());
    let mut sequence = 0u32;

    info!(
        "📤 Data stream ready for {} ({}x{} @ {}fps)",
        sensor.config.id, sensor.config.width, sensor.config.height, sensor.config.fps
    );

    loop {
        let active = *streaming.borrow_and_update();
        if !active {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = streaming.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if link.keyframe.swap(false, Ordering::SeqCst) {
            generator.request_keyframe();
        }
        let unit = generator.next_unit();
        let mut flags = ChunkFlags::ACCESS_UNIT_END;
        if unit.keyframe {
            flags |= ChunkFlags::KEYFRAME;
        }

        writer
            .send(DataChunk::h264(sequence, unit.timestamp, unit.data, flags))
            .await
            .map_err(|e| anyhow!("data stream closed: {}", e))?;
        sequence = sequence.wrapping_add(1);
    }

    debug!("Data stream for {} finished after {} frames", sensor.config.id, generator.frames_generated());
    Ok(())
}

async fn send(writer: &mut ControlWrite, message: &DeviceMessage) -> Result<()> {
    writer.send(encode_message(message)?).await?;
    Ok(())
}
