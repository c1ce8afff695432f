use super::{RecordingSummary, StreamWriter};
use crate::config::RecorderConfig;
use crate::error::StorageError;
use crate::frame::CompressedChunk;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// 写入失败回调（每次录像最多调用一次）
pub type FailureHandler = Box<dyn Fn(&Path, &StorageError) + Send + 'static>;

/// 后台录像器
///
/// 文件I/O在阻塞线程中进行，接收路径只做非阻塞入队。队列满时丢弃分片，
/// 写入器随后会看到序号缺口，从下一个IDR继续写入。
pub struct Recorder {
    path: PathBuf,
    tx: mpsc::Sender<CompressedChunk>,
    worker: JoinHandle<Result<RecordingSummary, StorageError>>,
    dropped: u64,
}

impl Recorder {
    /// 同步创建文件（路径错误立即返回），然后启动写入线程
    pub fn start(
        path: impl AsRef<Path>,
        config: &RecorderConfig,
        on_failure: FailureHandler,
    ) -> Result<Self, StorageError> {
        let writer = StreamWriter::open(path.as_ref(), config)?;
        Ok(Self::with_writer(writer, config.queue_capacity, on_failure))
    }

    pub fn with_writer(writer: StreamWriter, queue_capacity: usize, on_failure: FailureHandler) -> Self {
        let path = writer.path().to_path_buf();
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let worker = tokio::task::spawn_blocking(move || run_writer(writer, rx, on_failure));

        Self {
            path,
            tx,
            worker,
            dropped: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// 非阻塞入队；返回 false 表示分片被丢弃
    pub fn write(&mut self, chunk: CompressedChunk) -> bool {
        match self.tx.try_send(chunk) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(chunk)) => {
                self.dropped += 1;
                warn!(
                    "Recorder queue full, dropping chunk {} for {}",
                    chunk.sequence,
                    self.path.display()
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// 写完队列中的分片并封口文件
    pub async fn close(self) -> Result<RecordingSummary, StorageError> {
        drop(self.tx);
        match self.worker.await {
            Ok(result) => result,
            Err(e) => {
                error!("Recorder worker for {} died: {}", self.path.display(), e);
                Err(StorageError::WorkerGone)
            }
        }
    }
}

fn run_writer(
    mut writer: StreamWriter,
    mut rx: mpsc::Receiver<CompressedChunk>,
    on_failure: FailureHandler,
) -> Result<RecordingSummary, StorageError> {
    let mut failed = false;

    while let Some(chunk) = rx.blocking_recv() {
        if failed {
            continue;
        }
        if let Err(e) = writer.write(&chunk) {
            error!("❌ Recording to {} failed: {}", writer.path().display(), e);
            on_failure(writer.path(), &e);
            failed = true;
        }
    }

    debug!("Recorder queue closed for {}", writer.path().display());
    writer.close()
}
