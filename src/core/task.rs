use std::path::{Path, PathBuf};

use tracing::warn;

use super::differ::SnapshotDiff;
use super::project::{Endpoint, Project};
use super::scanner::EntryKind;

/// 上传的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOrigin {
    Added,
    Modified,
}

/// 一个远程操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOp {
    SendFile {
        local: PathBuf,
        remote: String,
        origin: SendOrigin,
    },
    MakeDir {
        local: PathBuf,
        remote: String,
    },
    RemoveFile {
        local: PathBuf,
        remote: String,
    },
    RemoveDir {
        local: PathBuf,
        remote: String,
    },
}

impl RemoteOp {
    /// 日志中的标记：`+` 新增，`-` 删除，`*` 修改
    pub fn symbol(&self) -> char {
        match self {
            RemoteOp::SendFile {
                origin: SendOrigin::Modified,
                ..
            } => '*',
            RemoteOp::SendFile { .. } | RemoteOp::MakeDir { .. } => '+',
            RemoteOp::RemoveFile { .. } | RemoteOp::RemoveDir { .. } => '-',
        }
    }

    pub fn local(&self) -> &Path {
        match self {
            RemoteOp::SendFile { local, .. }
            | RemoteOp::MakeDir { local, .. }
            | RemoteOp::RemoveFile { local, .. }
            | RemoteOp::RemoveDir { local, .. } => local,
        }
    }

    pub fn remote(&self) -> &str {
        match self {
            RemoteOp::SendFile { remote, .. }
            | RemoteOp::MakeDir { remote, .. }
            | RemoteOp::RemoveFile { remote, .. }
            | RemoteOp::RemoveDir { remote, .. } => remote,
        }
    }

    /// 是否需要经过去重检查（删除可以安全重试，不去重）
    pub fn is_deduplicated(&self) -> bool {
        matches!(self, RemoteOp::SendFile { .. } | RemoteOp::MakeDir { .. })
    }
}

/// 一个项目在一轮中的操作列表
#[derive(Debug, Clone)]
pub struct SyncTask {
    pub project: PathBuf,
    pub endpoint: Endpoint,
    pub ops: Vec<RemoteOp>,
}

/// 任务构建器
pub struct TaskBuilder;

impl TaskBuilder {
    /// 按 新增 -> 删除 -> 修改 的顺序生成操作
    ///
    /// 差异为空或项目没有有效配置时返回 None。
    pub fn build(project: &Project, diff: &SnapshotDiff) -> Option<SyncTask> {
        if diff.is_empty() {
            return None;
        }

        let endpoint = project.endpoint()?;
        let mapping = project.mapping()?;
        let mut ops = Vec::with_capacity(diff.len());

        let resolve = |local: &Path| {
            let remote = mapping.remote_path(local);
            if remote.is_none() {
                warn!("路径不在项目目录下，已忽略: {}", local.display());
            }
            remote
        };

        for (local, kind) in &diff.added {
            let Some(remote) = resolve(local) else { continue };
            ops.push(match kind {
                EntryKind::File => RemoteOp::SendFile {
                    local: local.clone(),
                    remote,
                    origin: SendOrigin::Added,
                },
                EntryKind::Directory => RemoteOp::MakeDir {
                    local: local.clone(),
                    remote,
                },
            });
        }

        for (local, kind) in &diff.removed {
            let Some(remote) = resolve(local) else { continue };
            ops.push(match kind {
                EntryKind::File => RemoteOp::RemoveFile {
                    local: local.clone(),
                    remote,
                },
                EntryKind::Directory => RemoteOp::RemoveDir {
                    local: local.clone(),
                    remote,
                },
            });
        }

        for local in &diff.modified {
            let Some(remote) = resolve(local) else { continue };
            ops.push(RemoteOp::SendFile {
                local: local.clone(),
                remote,
                origin: SendOrigin::Modified,
            });
        }

        if ops.is_empty() {
            return None;
        }

        Some(SyncTask {
            project: project.path.clone(),
            endpoint,
            ops,
        })
    }
}
