// 数据通道任务与解码工作线程

use super::control::ControlHandle;
use super::{SessionEvent, SessionState, Shared};
use crate::decoder::{BitstreamDecoder, DecodeOutput};
use crate::frame::{CompressedChunk, FrameBuffer};
use common::{ChunkCodec, ControlAction};
use futures::StreamExt;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

/// 解码线程输入（与分片同一FIFO，保证冲刷发生在之前的分片之后）
pub(crate) enum DecoderCommand {
    Chunk(CompressedChunk),
    /// 冲刷完成且帧已交付后应答
    Flush(oneshot::Sender<()>),
}

/// 读取数据通道，按状态分发到解码器和录像器
pub(crate) async fn run_data(
    shared: Arc<Shared>,
    data_rx: Box<dyn AsyncRead + Send + Unpin>,
    decoder: mpsc::Sender<DecoderCommand>,
    mut flushes: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
) {
    let codec = ChunkCodec::with_max_chunk_size(shared.config.transport.max_chunk_size);
    let mut reader = FramedRead::new(data_rx, codec);

    loop {
        let next = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            Some(ack) = flushes.recv() => {
                // 冲刷只从这里发出：已转发的分片都排在它之前，之后的分片都会看到新状态
                if decoder.send(DecoderCommand::Flush(ack)).await.is_err() {
                    break;
                }
                continue;
            }
            next = reader.next() => next,
        };

        let wire = match next {
            Some(Ok(wire)) => wire,
            Some(Err(e)) => {
                // 分片边界已无法恢复
                shared.terminate(&format!("data channel: {}", e));
                break;
            }
            None => {
                shared.terminate("data channel closed by device");
                break;
            }
        };

        let chunk = match CompressedChunk::from_wire(wire) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Discarding chunk: {}", e);
                shared.emit(SessionEvent::ProtocolViolation(e.to_string()));
                continue;
            }
        };

        if shared.state() != SessionState::Active {
            debug!("Session not active, discarding chunk {}", chunk.sequence);
            continue;
        }

        if let Some(recorder) = shared.recorder.lock().await.as_mut() {
            recorder.write(chunk.clone());
        }

        if let Err(mpsc::error::TrySendError::Full(DecoderCommand::Chunk(dropped))) =
            decoder.try_send(DecoderCommand::Chunk(chunk))
        {
            // 序号缺口会让解码器走重同步路径
            warn!("Decoder queue full, dropping chunk {}", dropped.sequence);
        }
    }

    debug!("Data task for {} finished", shared.identity.sensor_id);
}

/// 解码工作线程（阻塞线程，独占重组状态）
pub(crate) fn run_decoder(
    mut decoder: BitstreamDecoder,
    mut commands: mpsc::Receiver<DecoderCommand>,
    frames: mpsc::Sender<FrameBuffer>,
    events: broadcast::Sender<SessionEvent>,
    control: ControlHandle,
) {
    info!("🎞️ Decoder worker started ({} codec)", decoder.codec_name());

    while let Some(command) = commands.blocking_recv() {
        match command {
            DecoderCommand::Chunk(chunk) => deliver(decoder.feed(&chunk), &frames, &events, &control),
            DecoderCommand::Flush(ack) => {
                deliver(decoder.flush(), &frames, &events, &control);
                let _ = ack.send(());
            }
        }
    }

    info!("Decoder worker stopped after {} frames", decoder.frames_emitted());
}

fn deliver(
    output: DecodeOutput,
    frames: &mpsc::Sender<FrameBuffer>,
    events: &broadcast::Sender<SessionEvent>,
    control: &ControlHandle,
) {
    for warning in output.warnings {
        let _ = events.send(SessionEvent::DecodeWarning(warning));
    }

    if output.keyframe_requested {
        if control.request(ControlAction::RequestKeyframe).is_ok() {
            let _ = events.send(SessionEvent::KeyframeRequested);
        }
    }

    for frame in output.frames {
        match frames.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                debug!("Frame queue full, dropping frame {}", frame.index);
                let _ = events.send(SessionEvent::FrameDropped { index: frame.index });
            }
            // 无人消费帧流
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}
