//! 日志系统初始化模块
//!
//! 控制台输出人类可读格式，文件输出 JSON 行并按大小滚动，
//! 文件写入通过 tracing_appender 的后台线程完成，不阻塞采集任务

use crate::klcommon::{AppError, FetcherConfig, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// 日志文件名
pub const LOG_FILE_NAME: &str = "fetcher.log";

/// 保留的历史日志文件数（fetcher.log.1 .. fetcher.log.5）
pub const LOG_BACKUP_COUNT: usize = 5;

/// 按大小滚动的日志文件
///
/// 当前文件写满 `max_bytes` 后依次重命名为 `.1`、`.2`...，最旧的被删除
pub struct RotatingFileWriter {
    path: PathBuf,
    max_bytes: u64,
    max_backups: usize,
    file: Option<File>,
    written: u64,
}

impl RotatingFileWriter {
    pub fn new<P: AsRef<Path>>(path: P, max_bytes: u64, max_backups: usize) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = Self::open(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            path,
            max_bytes: max_bytes.max(1),
            max_backups,
            file: Some(file),
            written,
        })
    }

    fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }

        if self.max_backups == 0 {
            std::fs::remove_file(&self.path).ok();
        } else {
            let oldest = self.backup_path(self.max_backups);
            if oldest.exists() {
                std::fs::remove_file(&oldest)?;
            }
            for index in (1..self.max_backups).rev() {
                let from = self.backup_path(index);
                if from.exists() {
                    std::fs::rename(&from, self.backup_path(index + 1))?;
                }
            }
            std::fs::rename(&self.path, self.backup_path(1))?;
        }

        self.file = Some(Self::open(&self.path)?);
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 单条记录不拆分，超过阈值就先滚动再写
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            if let Err(e) = self.rotate() {
                eprintln!("[日志] 滚动日志文件失败: {}", e);
            }
        }

        // 上次滚动失败时重新打开
        if self.file.is_none() {
            self.file = Some(Self::open(&self.path)?);
            self.written = 0;
        }
        let file = self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "日志文件未打开"))?;

        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// 构造过滤规则，第三方库的噪音压到 warn
fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::new(format!("{},hyper=warn,reqwest=warn,rusqlite=warn,r2d2=warn", level))
}

/// 初始化日志系统
///
/// `level` 优先，其次 `RUST_LOG`，默认 `info`。返回的 guard 必须在 main 中持有到进程结束，
/// 否则缓冲中的日志会丢失
pub fn init_logging(config: &FetcherConfig, level: Option<&str>) -> Result<WorkerGuard> {
    let log_level = level
        .map(str::to_string)
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());

    let writer = RotatingFileWriter::new(
        config.log_dir.join(LOG_FILE_NAME),
        config.log_max_size_bytes(),
        LOG_BACKUP_COUNT,
    )?;
    let (file_writer, guard) = tracing_appender::non_blocking(writer);

    let console_layer = fmt::layer()
        .with_target(true)
        .with_filter(build_filter(&log_level));

    let file_layer = fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_current_span(false)
        .with_filter(build_filter(&log_level));

    Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("日志系统初始化失败: {}", e)))?;

    tracing::info!(
        target: "fetcher",
        log_level = %log_level,
        log_file = %config.log_dir.join(LOG_FILE_NAME).display(),
        "日志系统初始化完成"
    );

    Ok(guard)
}
