//! 日志模块 - 提供文件日志和大小管理功能

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// 日志配置（全局配置中的 `log` 段）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否写入日志文件
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_level() -> String {
    "warn".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 从全局配置文件加载日志配置，缺失或无效时使用默认值
    pub fn load(global_config: &Path) -> Self {
        fs::read_to_string(global_config)
            .ok()
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .and_then(|config| config.get("log").cloned())
            .and_then(|log| serde_json::from_value::<LogConfig>(log).ok())
            .unwrap_or_default()
    }

    /// 将配置的日志级别转换为 tracing Level，verbose 时至少为 DEBUG
    pub fn tracing_level(&self, verbose: bool) -> tracing::Level {
        let level = match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "info" => tracing::Level::INFO,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::WARN,
        };

        // tracing::Level 越详细越"大"
        if verbose && level < tracing::Level::DEBUG {
            tracing::Level::DEBUG
        } else {
            level
        }
    }
}

/// 带大小限制的日志写入器
///
/// 超过上限时把 `app.log` 重命名为 `app.log.old` 并重新打开。
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    written: u64,
    writer: Option<BufWriter<File>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        Self::with_limit(log_dir, (max_size_mb as u64) * 1024 * 1024)
    }

    pub fn with_limit(log_dir: &Path, max_size: u64) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join("app.log");
        let (writer, written) = Self::open_file(&file_path, max_size)?;

        Ok(Self {
            file_path,
            max_size,
            written,
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    fn open_file(file_path: &Path, max_size: u64) -> io::Result<(BufWriter<File>, u64)> {
        // 检查现有文件大小，如果超过限制则轮转
        let mut existing = fs::metadata(file_path).map(|m| m.len()).unwrap_or(0);
        if existing > max_size {
            Self::rotate_log(file_path)?;
            existing = 0;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        Ok((BufWriter::new(file), existing))
    }

    /// 轮转日志文件
    fn rotate_log(file_path: &Path) -> io::Result<()> {
        let backup_path = file_path.with_extension("log.old");

        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }

        fs::rename(file_path, &backup_path)
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut w) = self.writer.take() {
            let _ = w.flush();
        }

        Self::rotate_log(&self.file_path)?;

        let (writer, written) = Self::open_file(&self.file_path, self.max_size)?;
        self.writer = Some(writer);
        self.written = written;
        Ok(())
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "Writer not available"))?;

        let n = writer.write(buf)?;
        writer.flush()?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_log_section() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".dcync");

        assert_eq!(LogConfig::load(&path).level, "warn");

        fs::write(&path, r#"{"projects": [], "log": {"level": "info", "maxSizeMb": 1}}"#).unwrap();
        let config = LogConfig::load(&path);
        assert_eq!(config.level, "info");
        assert_eq!(config.max_size_mb, 1);
        assert!(config.enabled);
    }

    #[test]
    fn test_verbose_raises_level() {
        let config = LogConfig::default();
        assert_eq!(config.tracing_level(false), tracing::Level::WARN);
        assert_eq!(config.tracing_level(true), tracing::Level::DEBUG);

        let trace = LogConfig {
            level: "trace".to_string(),
            ..Default::default()
        };
        assert_eq!(trace.tracing_level(true), tracing::Level::TRACE);
    }

    #[test]
    fn test_rotates_when_limit_exceeded() {
        let dir = TempDir::new().unwrap();
        let mut writer = SizeRotatingWriter::with_limit(dir.path(), 16).unwrap();

        writer.write_all(b"0123456789").unwrap();
        writer.write_all(b"0123456789").unwrap();

        assert!(dir.path().join("app.log.old").exists());
        assert_eq!(fs::read(dir.path().join("app.log.old")).unwrap(), b"0123456789");
        assert_eq!(fs::read(writer.path()).unwrap(), b"0123456789");
    }
}
