use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::exclude::ExcludeSet;
use crate::error::SyncError;

/// 条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntryKind {
    File = 1,
    Directory = 2,
}

/// 扫描到的条目
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannedEntry {
    pub kind: EntryKind,
    /// 修改时间（Unix 秒）
    pub modified: i64,
}

/// 上一次完整扫描的结果：绝对路径 -> 类型
pub type FileIndex = HashMap<PathBuf, EntryKind>;

/// 一次扫描得到的目录树
#[derive(Debug, Clone, Default)]
pub struct TreeSnapshot {
    pub entries: HashMap<PathBuf, ScannedEntry>,
}

impl TreeSnapshot {
    /// 只保留类型，作为项目的文件索引保存
    pub fn index(&self) -> FileIndex {
        self.entries
            .iter()
            .map(|(path, entry)| (path.clone(), entry.kind))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 目录树扫描器
pub struct TreeScanner;

impl TreeScanner {
    /// 递归扫描项目目录
    ///
    /// 跳过符号链接、被排除的名字以及扫描过程中消失的条目。
    /// 根目录不可读时返回 [`SyncError::Scan`]。
    pub fn scan(root: &Path, excludes: &ExcludeSet) -> Result<TreeSnapshot, SyncError> {
        let scan_error = |source: io::Error| SyncError::Scan {
            root: root.to_path_buf(),
            source,
        };

        let root_meta = std::fs::metadata(root).map_err(scan_error)?;
        if !root_meta.is_dir() {
            return Err(scan_error(io::Error::new(
                io::ErrorKind::Other,
                "项目根路径不是目录",
            )));
        }

        let mut snapshot = TreeSnapshot::default();
        let mut skipped = 0usize;

        let walker = WalkDir::new(root)
            .follow_links(false)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| {
                let relative = e.path().strip_prefix(root).unwrap_or(e.path());
                !excludes.is_excluded(relative, e.file_name())
            });

        for item in walker {
            let entry = match item {
                Ok(entry) => entry,
                Err(err) if err.depth() == 0 => {
                    let source = err
                        .into_io_error()
                        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "无法读取目录"));
                    return Err(scan_error(source));
                }
                Err(err) => {
                    let vanished = err
                        .io_error()
                        .map(|e| e.kind() == io::ErrorKind::NotFound)
                        .unwrap_or(false);
                    if vanished {
                        debug!("扫描过程中条目已消失: {:?}", err.path());
                    } else {
                        warn!("跳过无法读取的条目: {}", err);
                    }
                    skipped += 1;
                    continue;
                }
            };

            let file_type = entry.file_type();

            // 不支持符号链接
            if file_type.is_symlink() {
                skipped += 1;
                continue;
            }

            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                // socket / fifo / 设备文件
                skipped += 1;
                continue;
            };

            // 列出目录后被删除的条目直接跳过
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(_) => {
                    skipped += 1;
                    continue;
                }
            };

            let modified = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);

            snapshot
                .entries
                .insert(entry.into_path(), ScannedEntry { kind, modified });
        }

        debug!(
            "扫描完成: {} 共 {} 个条目, 跳过 {} 个",
            root.display(),
            snapshot.len(),
            skipped
        );

        Ok(snapshot)
    }

    /// 在阻塞线程池中扫描，避免阻塞 async runtime
    pub async fn scan_blocking(
        root: PathBuf,
        excludes: ExcludeSet,
    ) -> Result<TreeSnapshot, SyncError> {
        let join_root = root.clone();
        tokio::task::spawn_blocking(move || Self::scan(&root, &excludes))
            .await
            .unwrap_or_else(|e| {
                Err(SyncError::Scan {
                    root: join_root,
                    source: io::Error::new(io::ErrorKind::Other, e.to_string()),
                })
            })
    }
}
