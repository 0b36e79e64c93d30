pub mod local;
pub mod ssh;

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::core::Endpoint;

pub use local::{LocalSession, LocalTransport};
pub use ssh::{SshSession, SshTransport};

/// 已建立的远程会话
///
/// 只由连接池持有，任务执行时通过共享引用调用。
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// 上传整个文件
    async fn send_file(&self, local: &Path, remote: &str) -> Result<()>;

    /// 创建远程目录（不递归）
    async fn make_dir(&self, remote: &str) -> Result<()>;

    /// 删除远程文件
    async fn remove_file(&self, remote: &str) -> Result<()>;

    /// 删除远程空目录
    async fn remove_dir(&self, remote: &str) -> Result<()>;

    /// 存活检查（一次最简单的远程往返）
    async fn ping(&self) -> Result<()>;

    /// 会话描述（用于日志）
    fn name(&self) -> &str;
}

/// 远程传输能力
#[async_trait]
pub trait Transport: Send + Sync {
    /// 建立到端点的会话，认证或网络失败时返回错误
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn RemoteSession>>;

    /// 传输名称（用于日志）
    fn name(&self) -> &str;
}
