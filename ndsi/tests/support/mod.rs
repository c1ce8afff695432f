// 集成测试共用：内存中的假设备与码流构造
#![allow(dead_code)]

use bytes::Bytes;
use common::{
    decode_message, encode_message, ChannelKind, ChunkCodec, ChunkFlags, ClientMessage, ControlAction,
    ControlRequest, DataChunk, DeviceMessage, ParameterDescriptor, ParameterKind, ParameterUpdate,
    ParameterValue, SensorIdentity,
};
use futures::{SinkExt, StreamExt};
use ndsi::{NdsiConfig, SensorSession, SessionChannels, SessionEvent};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, FramedWrite, LengthDelimitedCodec};

pub const SPS: [u8; 8] = [0x67, 0x42, 0xC0, 0x1E, 0xF4, 0x0A, 0x0F, 0xC8];
pub const PPS: [u8; 4] = [0x68, 0xCE, 0x38, 0x80];
pub const IDR: [u8; 5] = [0x65, 0x88, 0x84, 0x21, 0xA0];
pub const P: [u8; 4] = [0x41, 0x9A, 0x21, 0x40];

pub const WAIT: Duration = Duration::from_secs(3);

pub fn annex_b(nals: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for nal in nals {
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(nal);
    }
    out
}

/// 关键帧 + 两个P帧
pub fn three_unit_stream() -> Vec<u8> {
    annex_b(&[&SPS, &PPS, &IDR, &P, &P])
}

/// 参数集单元 + 两个关键帧单元
pub fn parameter_sets_and_two_keyframes() -> Vec<u8> {
    annex_b(&[&SPS, &PPS, &IDR, &IDR])
}

pub fn identity(sensor_id: &str) -> SensorIdentity {
    SensorIdentity::new(
        "127.0.0.1:7000".parse().unwrap(),
        sensor_id,
        format!("Test {}", sensor_id),
        vec![common::Capability::Video],
    )
}

pub fn exposure(value: f64) -> ParameterUpdate {
    let mut descriptor = ParameterDescriptor::new("Exposure", ParameterKind::Number);
    descriptor.min = Some(1.0);
    descriptor.max = Some(100.0);
    ParameterUpdate {
        name: "exposure".to_string(),
        value: ParameterValue::Number(value),
        descriptor: Some(descriptor),
    }
}

pub fn fast_config() -> NdsiConfig {
    let mut config = NdsiConfig::default();
    config.session.handshake_timeout = Duration::from_secs(2);
    config.session.shutdown_timeout = Duration::from_secs(1);
    config
}

/// 设备一端：控制流按长度分帧，数据流按分片头分帧
pub struct FakeDevice {
    pub control: Framed<DuplexStream, LengthDelimitedCodec>,
    pub data: FramedWrite<DuplexStream, ChunkCodec>,
    sequence: u32,
}

impl FakeDevice {
    /// 返回会话侧通道与设备侧端点
    pub fn pair() -> (SessionChannels, FakeDevice) {
        let (client_control, device_control) = tokio::io::duplex(64 * 1024);
        let (client_data, device_data) = tokio::io::duplex(256 * 1024);
        let (control_rx, control_tx) = tokio::io::split(client_control);

        let channels = SessionChannels::new(control_rx, control_tx, client_data);
        let device = FakeDevice {
            control: Framed::new(device_control, LengthDelimitedCodec::new()),
            data: FramedWrite::new(device_data, ChunkCodec::new()),
            sequence: 0,
        };
        (channels, device)
    }

    pub async fn recv(&mut self) -> Option<ClientMessage> {
        let frame = tokio::time::timeout(WAIT, self.control.next())
            .await
            .expect("timed out waiting for controller")?
            .expect("control stream error");
        Some(decode_message(&frame).expect("controller sent malformed message"))
    }

    /// 读取Hello并返回其中的传感器ID
    pub async fn expect_hello(&mut self) -> String {
        match self.recv().await {
            Some(ClientMessage::Hello {
                sensor_id,
                channel: ChannelKind::Control,
            }) => sensor_id,
            other => panic!("expected control hello, got {:?}", other),
        }
    }

    pub async fn welcome(&mut self, sensor_id: &str, streaming: bool, parameters: Vec<ParameterUpdate>) {
        self.send(&DeviceMessage::Welcome {
            sensor_id: sensor_id.to_string(),
            name: "Fake Camera".to_string(),
            streaming,
            parameters,
        })
        .await;
    }

    pub async fn next_request(&mut self) -> ControlRequest {
        match self.recv().await {
            Some(ClientMessage::Request(request)) => request,
            other => panic!("expected request, got {:?}", other),
        }
    }

    /// 跳过不关心的请求
    pub async fn next_request_where(&mut self, pred: impl Fn(&ControlAction) -> bool) -> ControlRequest {
        loop {
            let request = self.next_request().await;
            if pred(&request.action) {
                return request;
            }
        }
    }

    pub async fn send(&mut self, message: &DeviceMessage) {
        let frame = encode_message(message).unwrap();
        self.control.send(frame).await.unwrap();
    }

    pub async fn send_raw(&mut self, frame: &[u8]) {
        self.control.send(Bytes::copy_from_slice(frame)).await.unwrap();
    }

    /// 一个访问单元作为一个分片发送
    /// 不带访问单元结束标记的分片
    pub async fn send_fragment(&mut self, timestamp: f64, bytes: &[u8]) {
        let chunk = DataChunk::h264(self.sequence, timestamp, bytes.to_vec(), 0);
        self.sequence = self.sequence.wrapping_add(1);
        self.data.send(chunk).await.unwrap();
    }

    pub async fn send_access_unit(&mut self, timestamp: f64, nals: &[&[u8]]) {
        let chunk = DataChunk::h264(self.sequence, timestamp, annex_b(nals), ChunkFlags::ACCESS_UNIT_END);
        self.sequence = self.sequence.wrapping_add(1);
        self.data.send(chunk).await.unwrap();
    }

    /// 应答握手后持续读取控制流直到会话关闭
    pub async fn serve(mut self) {
        let sensor_id = self.expect_hello().await;
        self.welcome(&sensor_id, true, vec![exposure(10.0)]).await;
        while let Some(Ok(_)) = self.control.next().await {}
    }
}

/// 建立一个已完成握手的会话
pub async fn attached(config: NdsiConfig, parameters: Vec<ParameterUpdate>) -> (SensorSession, FakeDevice) {
    let (channels, mut device) = FakeDevice::pair();
    let (session, ()) = tokio::join!(SensorSession::connect(identity("cam-1"), channels, config), async {
        let sensor_id = device.expect_hello().await;
        device.welcome(&sensor_id, true, parameters).await;
    });
    (session.expect("session should attach"), device)
}

pub async fn next_event_where(
    events: &mut broadcast::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
