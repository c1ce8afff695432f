//! 传感器会话
//!
//! 每个会话对应一个控制通道和一个数据通道：控制任务负责握手、参数与启停，
//! 数据任务把分片按顺序交给解码线程和录像线程。

mod control;
mod data;
mod events;
mod parameters;
mod state;

pub use events::SessionEvent;
pub use parameters::{ParameterEntry, ParameterSet, PendingValue, ReplyOutcome};
pub use state::SessionState;

use crate::config::NdsiConfig;
use crate::decoder::BitstreamDecoder;
use crate::error::{ConnectionError, Error, Result, StorageError};
use crate::frame::FrameBuffer;
use crate::writer::{Recorder, RecordingSummary};
use common::{ControlAction, ParameterValue, SensorIdentity};
use control::ControlHandle;
use futures::Stream;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 会话结束时释放底层连接
pub type Closer = Box<dyn FnOnce() + Send>;

/// 一个会话使用的字节流
pub struct SessionChannels {
    pub control_rx: Box<dyn AsyncRead + Send + Unpin>,
    pub control_tx: Box<dyn AsyncWrite + Send + Unpin>,
    pub data_rx: Box<dyn AsyncRead + Send + Unpin>,
    pub closer: Option<Closer>,
}

impl SessionChannels {
    pub fn new(
        control_rx: impl AsyncRead + Send + Unpin + 'static,
        control_tx: impl AsyncWrite + Send + Unpin + 'static,
        data_rx: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            control_rx: Box::new(control_rx),
            control_tx: Box::new(control_tx),
            data_rx: Box::new(data_rx),
            closer: None,
        }
    }

    pub fn with_closer(mut self, closer: impl FnOnce() + Send + 'static) -> Self {
        self.closer = Some(Box::new(closer));
        self
    }
}

/// 解码帧流，会话关闭后结束
pub struct FrameStream {
    inner: ReceiverStream<FrameBuffer>,
}

impl FrameStream {
    fn new(receiver: mpsc::Receiver<FrameBuffer>) -> Self {
        Self {
            inner: ReceiverStream::new(receiver),
        }
    }
}

impl Stream for FrameStream {
    type Item = FrameBuffer;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<FrameBuffer>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// 会话内部共享状态
pub(crate) struct Shared {
    identity: SensorIdentity,
    device_name: String,
    config: NdsiConfig,
    state: watch::Sender<SessionState>,
    parameters: watch::Sender<ParameterSet>,
    events: broadcast::Sender<SessionEvent>,
    control: ControlHandle,
    /// 保证“标记待确认”与“请求入队”的顺序一致
    submit: std::sync::Mutex<()>,
    /// 经数据任务转发的冲刷请求
    flushes: mpsc::UnboundedSender<oneshot::Sender<()>>,
    frames: std::sync::Mutex<Option<mpsc::Receiver<FrameBuffer>>>,
    recorder: tokio::sync::Mutex<Option<Recorder>>,
    closer: std::sync::Mutex<Option<Closer>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn emit(&self, event: SessionEvent) {
        // 没有订阅者时丢弃
        let _ = self.events.send(event);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state().is_closed() {
            Err(Error::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// 原子地检查并切换状态
    fn transition(&self, to: SessionState) -> Result<SessionState> {
        let mut result = Err(Error::SessionClosed);
        self.state.send_if_modified(|current| {
            if current.can_transition_to(to) {
                result = Ok(*current);
                *current = to;
                true
            } else {
                if !current.is_closed() {
                    result = Err(Error::InvalidTransition { from: *current, to });
                }
                false
            }
        });

        if let Ok(from) = result {
            info!("Session {}: {} -> {}", self.identity.sensor_id, from, to);
            self.emit(SessionEvent::StateChanged { from, to });
        }
        result
    }

    /// 进入 Closed：取消任务、释放连接；只有第一次调用生效
    fn terminate(&self, reason: &str) -> bool {
        if self.transition(SessionState::Closed).is_err() {
            return false;
        }

        self.cancel.cancel();
        let closer = self.closer.lock().ok().and_then(|mut closer| closer.take());
        if let Some(closer) = closer {
            closer();
        }

        self.emit(SessionEvent::Disconnected {
            reason: reason.to_string(),
        });
        true
    }

    /// 等待解码器冲刷完毕；数据任务已退出时立即返回
    async fn flush_decoder(&self) {
        let (ack, done) = oneshot::channel();
        if self.flushes.send(ack).is_ok() {
            let _ = done.await;
        }
    }

    async fn finish_recording(&self) -> std::result::Result<RecordingSummary, StorageError> {
        let recorder = self.recorder.lock().await.take();
        let Some(recorder) = recorder else {
            return Err(StorageError::NotRecording);
        };

        let path = recorder.path().to_path_buf();
        match recorder.close().await {
            Ok(summary) => {
                self.emit(SessionEvent::RecordingFinished(summary.clone()));
                Ok(summary)
            }
            Err(StorageError::WriterFailed) => Err(StorageError::WriterFailed),
            Err(e) => {
                warn!("Closing recording {} failed: {}", path.display(), e);
                self.emit(SessionEvent::StorageFailed {
                    path,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

/// 一个已连接传感器的会话句柄（可克隆，所有克隆共享同一会话）
#[derive(Clone)]
pub struct SensorSession {
    shared: Arc<Shared>,
}

impl SensorSession {
    /// 握手并启动会话任务；成功返回时会话处于 Active
    pub async fn connect(identity: SensorIdentity, channels: SessionChannels, config: NdsiConfig) -> Result<Self> {
        let SessionChannels {
            control_rx,
            control_tx,
            data_rx,
            closer,
        } = channels;

        let decoder = match BitstreamDecoder::new(&config.decoder) {
            Ok(decoder) => decoder,
            Err(e) => {
                release(closer);
                return Err(e);
            }
        };

        let mut reader = FramedRead::new(control_rx, LengthDelimitedCodec::new());
        let mut writer = FramedWrite::new(control_tx, LengthDelimitedCodec::new());

        let handshake_timeout = config.session.handshake_timeout;
        let welcome = match tokio::time::timeout(
            handshake_timeout,
            control::handshake(&mut reader, &mut writer, &identity.sensor_id),
        )
        .await
        {
            Ok(Ok(welcome)) => welcome,
            Ok(Err(e)) => {
                warn!("Handshake with {} failed: {}", identity, e);
                release(closer);
                return Err(e.into());
            }
            Err(_) => {
                warn!("Handshake with {} timed out", identity);
                release(closer);
                return Err(ConnectionError::Timeout(handshake_timeout).into());
            }
        };

        let mut parameters = ParameterSet::new();
        for update in welcome.parameters {
            parameters.apply_update(update);
        }

        let (decoder_tx, decoder_rx) = mpsc::channel(config.session.chunk_queue.max(1));
        let (flushes, flush_requests) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::channel(config.session.frame_queue.max(1));
        let (events, _) = broadcast::channel(config.session.event_capacity.max(1));
        let (control, requests) = ControlHandle::new();

        let shared = Arc::new(Shared {
            identity,
            device_name: welcome.name,
            state: watch::Sender::new(SessionState::Connecting),
            parameters: watch::Sender::new(parameters),
            events,
            control,
            submit: std::sync::Mutex::new(()),
            flushes,
            frames: std::sync::Mutex::new(Some(frames_rx)),
            recorder: tokio::sync::Mutex::new(None),
            closer: std::sync::Mutex::new(closer),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            config,
        });

        shared.transition(SessionState::Active)?;
        if !welcome.streaming {
            shared.control.request(ControlAction::StartStream)?;
        }
        shared.control.request(ControlAction::RequestKeyframe)?;

        let worker = {
            let events = shared.events.clone();
            let control = shared.control.clone();
            tokio::task::spawn_blocking(move || data::run_decoder(decoder, decoder_rx, frames_tx, events, control))
        };
        let control_task = tokio::spawn(control::run_control(shared.clone(), reader, writer, requests));
        let data_task = tokio::spawn(data::run_data(shared.clone(), data_rx, decoder_tx, flush_requests));
        shared.tasks.lock().await.extend([control_task, data_task, worker]);

        info!("✓ Session attached: {}", shared.identity);
        Ok(Self { shared })
    }

    pub fn identity(&self) -> &SensorIdentity {
        &self.shared.identity
    }

    pub fn sensor_id(&self) -> &str {
        &self.shared.identity.sensor_id
    }

    /// 握手时设备报告的名称
    pub fn device_name(&self) -> &str {
        &self.shared.device_name
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// 订阅状态变化
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// 等待进入目标状态；会话先关闭则返回 `SessionClosed`
    pub async fn wait_for_state(&self, target: SessionState) -> Result<()> {
        let mut receiver = self.shared.state.subscribe();
        let reached = receiver
            .wait_for(|state| *state == target || state.is_closed())
            .await
            .map(|state| *state == target)
            .unwrap_or(false);

        if reached {
            Ok(())
        } else {
            Err(Error::SessionClosed)
        }
    }

    /// 参数快照
    pub fn get_parameters(&self) -> Result<ParameterSet> {
        self.shared.ensure_open()?;
        Ok(self.shared.parameters.borrow().clone())
    }

    pub fn watch_parameters(&self) -> watch::Receiver<ParameterSet> {
        self.shared.parameters.subscribe()
    }

    /// 标记为待确认并发送设置请求，不等待设备回复
    pub fn set_parameter(&self, name: &str, value: ParameterValue) -> Result<u64> {
        self.shared.ensure_open()?;
        self.shared.parameters.borrow().validate(name, &value)?;

        let _submit = self.shared.submit.lock().unwrap_or_else(PoisonError::into_inner);
        let request_id = self.shared.control.next_request_id();
        self.shared
            .parameters
            .send_modify(|parameters| parameters.mark_pending(name, value.clone(), request_id, Instant::now()));
        self.shared.control.send(
            request_id,
            ControlAction::Set {
                name: name.to_string(),
                value,
            },
        )?;
        Ok(request_id)
    }

    /// 请求设备重新推送全部参数
    pub fn refresh_parameters(&self) -> Result<()> {
        self.shared.ensure_open()?;
        self.shared.control.request(ControlAction::GetAll)?;
        Ok(())
    }

    /// 请求设备恢复默认参数
    pub fn reset_parameters(&self) -> Result<()> {
        self.shared.ensure_open()?;
        self.shared.control.request(ControlAction::ResetAll)?;
        Ok(())
    }

    pub fn request_keyframe(&self) -> Result<()> {
        self.shared.ensure_open()?;
        self.shared.control.request(ControlAction::RequestKeyframe)?;
        Ok(())
    }

    /// Suspended -> Active
    pub async fn start(&self) -> Result<()> {
        self.shared.transition(SessionState::Active)?;
        self.shared.control.request(ControlAction::StartStream)?;
        self.shared.control.request(ControlAction::RequestKeyframe)?;
        Ok(())
    }

    /// Active -> Suspended：冲刷解码器，关闭进行中的录像
    pub async fn stop(&self) -> Result<()> {
        self.shared.transition(SessionState::Suspended)?;
        self.shared.control.request(ControlAction::StopStream)?;
        self.shared.flush_decoder().await;

        // 录像失败已通过 StorageFailed 事件报告
        let _ = self.shared.finish_recording().await;
        Ok(())
    }

    /// 开始录像（文件立即创建，写入在后台线程进行）
    pub async fn start_recording(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        self.shared.ensure_open()?;
        let path = path.as_ref().to_path_buf();

        let mut slot = self.shared.recorder.lock().await;
        if let Some(active) = slot.as_ref() {
            return Err(StorageError::AlreadyRecording(active.path().display().to_string()).into());
        }

        let events = self.shared.events.clone();
        let recorder = Recorder::start(
            &path,
            &self.shared.config.recorder,
            Box::new(move |path, error| {
                let _ = events.send(SessionEvent::StorageFailed {
                    path: path.to_path_buf(),
                    reason: error.to_string(),
                });
            }),
        )?;
        *slot = Some(recorder);
        drop(slot);

        // 录像从下一个IDR开始
        self.shared.control.request(ControlAction::RequestKeyframe)?;
        self.shared.emit(SessionEvent::RecordingStarted { path: path.clone() });
        Ok(path)
    }

    /// 在目录下以传感器ID和当前时间命名录像文件
    pub async fn start_recording_in(&self, directory: impl AsRef<Path>) -> Result<PathBuf> {
        let file_name = crate::writer::default_file_name(&self.shared.identity.sensor_id);
        self.start_recording(directory.as_ref().join(file_name)).await
    }

    /// 写完尾部索引后返回统计
    pub async fn stop_recording(&self) -> Result<RecordingSummary> {
        self.shared.ensure_open()?;
        Ok(self.shared.finish_recording().await?)
    }

    pub async fn is_recording(&self) -> bool {
        self.shared.recorder.lock().await.is_some()
    }

    /// 解码帧流；只有第一次调用得到实时流，之后的调用得到已结束的流
    pub fn frames(&self) -> FrameStream {
        let receiver = self.shared.frames.lock().ok().and_then(|mut frames| frames.take());
        match receiver {
            Some(receiver) => FrameStream::new(receiver),
            None => {
                warn!("Frame stream of {} was already taken", self.shared.identity.sensor_id);
                let (_, receiver) = mpsc::channel(1);
                FrameStream::new(receiver)
            }
        }
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// 关闭会话并等待后台任务退出（最多 `shutdown_timeout`）；可重复调用
    pub async fn close(&self) -> Result<()> {
        if self.shared.terminate("closed by controller") {
            info!("Closing session {}", self.shared.identity.sensor_id);
        }

        let tasks = std::mem::take(&mut *self.shared.tasks.lock().await);
        let limit = self.shared.config.session.shutdown_timeout;
        if tokio::time::timeout(limit, futures::future::join_all(tasks)).await.is_err() {
            warn!(
                "Session {} workers did not stop within {:?}",
                self.shared.identity.sensor_id, limit
            );
        }

        // 控制任务超时未退出时由此封口录像
        let _ = self.shared.finish_recording().await;
        Ok(())
    }
}

impl std::fmt::Debug for SensorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorSession")
            .field("sensor", &self.shared.identity.sensor_id)
            .field("state", &self.state())
            .finish()
    }
}

fn release(closer: Option<Closer>) {
    if let Some(closer) = closer {
        closer();
    }
}
