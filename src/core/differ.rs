use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use super::scanner::{EntryKind, FileIndex, TreeSnapshot};

/// 两次扫描之间的差异
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    /// 新出现的条目，按路径升序（父目录在子条目之前）
    pub added: BTreeMap<PathBuf, EntryKind>,
    /// 消失的条目，按路径字节序降序（子条目在父目录之前）
    pub removed: Vec<(PathBuf, EntryKind)>,
    /// 修改时间不早于上一轮边界的文件（不含 added 中的路径）
    pub modified: Vec<PathBuf>,
}

impl SnapshotDiff {
    /// 计算差异
    ///
    /// `previous` 为空表示首次扫描，只建立基线，不产生 added/removed。
    /// `time_from` 为上一轮结束时记录的时间边界。
    pub fn compute(
        previous: Option<&FileIndex>,
        current: &TreeSnapshot,
        time_from: i64,
    ) -> Self {
        let mut diff = SnapshotDiff::default();

        if let Some(previous) = previous {
            for (path, entry) in &current.entries {
                if !previous.contains_key(path) {
                    diff.added.insert(path.clone(), entry.kind);
                }
            }

            diff.removed = previous
                .iter()
                .filter(|(path, _)| !current.entries.contains_key(*path))
                .map(|(path, kind)| (path.clone(), *kind))
                .collect();
            diff.removed.sort_by(|(a, _), (b, _)| b.as_os_str().cmp(a.as_os_str()));
        }

        let mut modified: Vec<PathBuf> = current
            .entries
            .iter()
            .filter(|(path, entry)| {
                entry.kind == EntryKind::File
                    && entry.modified >= time_from
                    && !diff.added.contains_key(*path)
            })
            .map(|(path, _)| path.clone())
            .collect();
        modified.sort();
        diff.modified = modified;

        diff
    }

    /// 合并上一轮未能执行的修改（仍然存在且仍是文件的路径）
    pub fn carry_modified(&mut self, pending: BTreeSet<PathBuf>, current: &TreeSnapshot) {
        if pending.is_empty() {
            return;
        }

        let mut merged: BTreeSet<PathBuf> = self.modified.drain(..).collect();
        for path in pending {
            let still_file = current
                .entries
                .get(&path)
                .map(|e| e.kind == EntryKind::File)
                .unwrap_or(false);
            if still_file && !self.added.contains_key(&path) {
                merged.insert(path);
            }
        }
        self.modified = merged.into_iter().collect();
    }

    /// 检查是否有任何变化
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    /// 变化总数
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }
}
