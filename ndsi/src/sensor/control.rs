// 控制通道：握手、请求发送、回复/推送处理、待确认参数过期

use super::parameters::ReplyOutcome;
use super::{SessionEvent, SessionState, Shared};
use crate::error::{ConnectionError, Error, Result};
use bytes::Bytes;
use common::{
    decode_message, encode_message, ChannelKind, ClientMessage, ControlAction, ControlRequest, DeviceMessage,
    ParameterUpdate,
};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

pub(crate) type ControlReader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, LengthDelimitedCodec>;
pub(crate) type ControlWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LengthDelimitedCodec>;

/// 请求发送端（可在任意线程使用，包括解码工作线程）
#[derive(Clone)]
pub(crate) struct ControlHandle {
    tx: mpsc::UnboundedSender<ControlRequest>,
    next_id: Arc<AtomicU64>,
}

impl ControlHandle {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<ControlRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (handle, rx)
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn send(&self, request_id: u64, action: ControlAction) -> Result<()> {
        self.tx
            .send(ControlRequest { request_id, action })
            .map_err(|_| Error::SessionClosed)
    }

    pub(crate) fn request(&self, action: ControlAction) -> Result<u64> {
        let request_id = self.next_request_id();
        self.send(request_id, action)?;
        Ok(request_id)
    }
}

/// 握手得到的设备信息
pub(crate) struct Welcome {
    pub name: String,
    pub streaming: bool,
    pub parameters: Vec<ParameterUpdate>,
}

/// Hello -> Welcome
pub(crate) async fn handshake(
    reader: &mut ControlReader,
    writer: &mut ControlWriter,
    sensor_id: &str,
) -> std::result::Result<Welcome, ConnectionError> {
    let hello = encode_message(&ClientMessage::Hello {
        sensor_id: sensor_id.to_string(),
        channel: ChannelKind::Control,
    })
    .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
    writer
        .send(hello)
        .await
        .map_err(|e| ConnectionError::Lost(e.to_string()))?;

    let frame = match reader.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => return Err(ConnectionError::Lost(e.to_string())),
        None => {
            return Err(ConnectionError::Handshake(
                "control channel closed before welcome".to_string(),
            ))
        }
    };

    match decode_message::<DeviceMessage>(&frame) {
        Ok(DeviceMessage::Welcome {
            sensor_id: answered,
            name,
            streaming,
            parameters,
        }) => {
            if answered != sensor_id {
                return Err(ConnectionError::Handshake(format!(
                    "device answered for sensor {}",
                    answered
                )));
            }
            debug!("Welcome from {} with {} parameters", name, parameters.len());
            Ok(Welcome {
                name,
                streaming,
                parameters,
            })
        }
        Ok(DeviceMessage::Refused { reason }) => Err(ConnectionError::Refused(reason)),
        Ok(other) => Err(ConnectionError::Handshake(format!("expected welcome, got {:?}", other))),
        Err(e) => Err(ConnectionError::Handshake(e.to_string())),
    }
}

/// 控制任务主循环
pub(crate) async fn run_control(
    shared: Arc<Shared>,
    mut reader: ControlReader,
    mut writer: ControlWriter,
    mut requests: mpsc::UnboundedReceiver<ControlRequest>,
) {
    let max_errors = shared.config.session.max_protocol_errors;
    let pending_timeout = shared.config.session.pending_timeout;
    let mut expiry = tokio::time::interval((pending_timeout / 4).max(Duration::from_millis(10)));
    expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut violations = 0u32;

    let outcome: std::result::Result<(), ConnectionError> = loop {
        tokio::select! {
            biased;

            _ = shared.cancel.cancelled() => break Ok(()),

            request = requests.recv() => {
                let Some(request) = request else { break Ok(()) };
                debug!("➡️ Control request #{}: {:?}", request.request_id, request.action);
                match encode_message(&ClientMessage::Request(request)) {
                    Ok(frame) => {
                        if let Err(e) = writer.send(frame).await {
                            break Err(ConnectionError::Lost(e.to_string()));
                        }
                    }
                    Err(e) => warn!("Failed to encode control request: {}", e),
                }
            }

            frame = reader.next() => match frame {
                Some(Ok(frame)) => match decode_message::<DeviceMessage>(&frame) {
                    Ok(message) => {
                        violations = 0;
                        handle_message(&shared, message).await;
                    }
                    Err(e) => {
                        violations += 1;
                        warn!(
                            "Malformed control message ({} consecutive, limit {}): {}",
                            violations, max_errors, e
                        );
                        shared.emit(SessionEvent::ProtocolViolation(e.to_string()));
                        if violations > max_errors {
                            break Err(ConnectionError::Desynchronized(violations));
                        }
                    }
                },
                Some(Err(e)) => break Err(ConnectionError::Lost(e.to_string())),
                None => break Err(ConnectionError::Lost("control channel closed by device".to_string())),
            },

            _ = expiry.tick() => expire_pending(&shared, pending_timeout),
        }
    };

    if let Err(e) = outcome {
        error!("❌ Session {} lost: {}", shared.identity.sensor_id, e);
        shared.terminate(&e.to_string());
    }

    let _ = SinkExt::<Bytes>::close(&mut writer).await;
    let _ = shared.finish_recording().await;
    debug!("Control task for {} finished", shared.identity.sensor_id);
}

async fn handle_message(shared: &Shared, message: DeviceMessage) {
    match message {
        DeviceMessage::Reply(reply) => {
            let mut outcome = ReplyOutcome::Ignored;
            shared.parameters.send_if_modified(|parameters| {
                outcome = parameters.apply_reply(&reply);
                outcome != ReplyOutcome::Ignored
            });
            match outcome {
                ReplyOutcome::Confirmed { name, value } => {
                    debug!("Parameter {} confirmed: {}", name, value);
                    shared.emit(SessionEvent::ParameterConfirmed { name, value });
                }
                ReplyOutcome::Failed(e) => {
                    warn!("Parameter request #{} failed: {}", reply.request_id, e);
                    shared.emit(SessionEvent::ParameterFailed(e));
                }
                ReplyOutcome::Ignored => {}
            }
        }
        DeviceMessage::Push(update) => {
            debug!("Parameter push: {} = {}", update.name, update.value);
            shared.parameters.send_modify(|parameters| parameters.apply_update(update));
        }
        DeviceMessage::StreamStarted => {
            if shared.transition(SessionState::Active).is_ok() {
                info!("▶️ Device {} resumed streaming", shared.identity.sensor_id);
            }
        }
        DeviceMessage::StreamStopped => {
            if shared.transition(SessionState::Suspended).is_ok() {
                info!("⏸️ Device {} stopped streaming", shared.identity.sensor_id);
                shared.flush_decoder().await;
            }
        }
        DeviceMessage::Welcome { .. } | DeviceMessage::Refused { .. } => {
            warn!("Unexpected handshake message on an open session");
            shared.emit(SessionEvent::ProtocolViolation(
                "handshake message after welcome".to_string(),
            ));
        }
    }
}

fn expire_pending(shared: &Shared, timeout: Duration) {
    let now = Instant::now();
    let mut expired = Vec::new();
    shared.parameters.send_if_modified(|parameters| {
        expired = parameters.expire(now, timeout);
        !expired.is_empty()
    });
    for error in expired {
        warn!("{}", error);
        shared.emit(SessionEvent::ParameterFailed(error));
    }
}
