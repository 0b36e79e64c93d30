//! 排除规则

use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use crate::config::CONFIG_FILE;

/// 扫描时的排除集合
///
/// 普通条目按文件名匹配，在任意层级生效；含 `/` 的条目视为
/// 相对项目根目录的路径，只匹配该位置。项目配置文件名总是被排除。
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    names: HashSet<OsString>,
    scoped: HashSet<PathBuf>,
}

impl ExcludeSet {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        set.names.insert(OsString::from(CONFIG_FILE));

        for entry in entries {
            let entry = entry.as_ref().trim();
            let trimmed = entry.trim_matches('/');
            if trimmed.is_empty() {
                continue;
            }

            if trimmed.contains('/') {
                set.scoped.insert(PathBuf::from(trimmed));
            } else {
                set.names.insert(OsString::from(trimmed));
            }
        }

        set
    }

    /// 检查条目是否应被跳过
    ///
    /// `relative` 为相对项目根目录的路径，`name` 为其最后一段。
    pub fn is_excluded(&self, relative: &Path, name: &OsStr) -> bool {
        self.names.contains(name) || (!self.scoped.is_empty() && self.scoped.contains(relative))
    }

    pub fn len(&self) -> usize {
        self.names.len() + self.scoped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn excluded(set: &ExcludeSet, relative: &str) -> bool {
        let path = Path::new(relative);
        set.is_excluded(path, path.file_name().unwrap())
    }

    #[test]
    fn test_config_file_always_excluded() {
        let set = ExcludeSet::new(Vec::<String>::new());
        assert!(excluded(&set, ".dcync"));
        assert!(excluded(&set, "sub/.dcync"));
        assert!(!excluded(&set, "main.rs"));
    }

    #[test]
    fn test_names_match_at_every_depth() {
        let set = ExcludeSet::new(["node_modules", ".git"]);
        assert!(excluded(&set, "node_modules"));
        assert!(excluded(&set, "web/node_modules"));
        assert!(excluded(&set, ".git"));
        assert!(!excluded(&set, "node_modules_backup"));
    }

    #[test]
    fn test_scoped_paths_match_only_there() {
        let set = ExcludeSet::new(["build/cache", "/tmp/"]);
        assert!(excluded(&set, "build/cache"));
        assert!(!excluded(&set, "other/build/cache"));
        assert!(!excluded(&set, "cache"));
        // 首尾的 / 被去掉后只剩一段，按文件名处理
        assert!(excluded(&set, "a/tmp"));
    }

    #[test]
    fn test_blank_entries_ignored() {
        let set = ExcludeSet::new(["", "  ", "/"]);
        assert_eq!(set.len(), 1);
    }
}
