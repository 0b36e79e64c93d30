//! 错误类型

use std::path::PathBuf;
use thiserror::Error;

use crate::core::Endpoint;

/// 配置读取错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 配置文件不存在或不可读
    #[error("配置文件不存在: {}", .0.display())]
    Missing(PathBuf),
    /// 配置文件内容无法解析
    #[error("配置文件无效: {}: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },
    /// 读写配置文件时的 IO 错误
    #[error("配置文件读写失败: {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// 同步循环中的错误分类，均不会终止循环
#[derive(Debug, Error)]
pub enum SyncError {
    /// 项目根目录不可读，本轮跳过该项目
    #[error("扫描失败 {}: {source}", root.display())]
    Scan {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 项目配置缺失或无效，本轮跳过该项目
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 建立连接或认证失败，本轮跳过该端点的所有任务
    #[error("连接 {endpoint} 失败: {message}")]
    Connection { endpoint: Endpoint, message: String },

    /// 单个远程操作失败，端点在下一轮需要健康检查
    #[error("{op} {} 失败: {message}", path.display())]
    Transfer {
        op: char,
        path: PathBuf,
        message: String,
    },
}

impl SyncError {
    /// 从 anyhow 错误构造连接错误
    pub fn connection(endpoint: &Endpoint, err: &anyhow::Error) -> Self {
        SyncError::Connection {
            endpoint: endpoint.clone(),
            message: format!("{:#}", err),
        }
    }
}
