//! 项目与远端端点

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use super::exclude::ExcludeSet;
use super::scanner::FileIndex;
use crate::config::ProjectConfig;

/// 远端端点：`(user, host)`，多个项目可以共用
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Endpoint {
    pub user: String,
    pub host: String,
}

impl Endpoint {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// 本地根目录到远端根目录的前缀映射
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapping {
    pub local_root: PathBuf,
    pub remote_root: String,
}

impl PathMapping {
    pub fn new(local_root: impl Into<PathBuf>, remote_root: impl Into<String>) -> Self {
        Self {
            local_root: local_root.into(),
            remote_root: remote_root.into(),
        }
    }

    /// 把本地路径换成远端路径：`remote_root + local[len(local_root)..]`
    ///
    /// 路径不在本地根目录下时返回 None。
    pub fn remote_path(&self, local: &Path) -> Option<String> {
        let relative = local.strip_prefix(&self.local_root).ok()?;

        let mut remote = self.remote_root.trim_end_matches('/').to_string();
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    remote.push('/');
                    remote.push_str(&part.to_string_lossy());
                }
                Component::CurDir => {}
                _ => return None,
            }
        }

        if remote.is_empty() {
            remote.push('/');
        }
        Some(remote)
    }
}

/// 一个同步中的项目
///
/// 由同步循环独占；配置每轮重新读取，索引在每次成功扫描后替换。
#[derive(Debug, Clone)]
pub struct Project {
    pub path: PathBuf,
    pub config: Option<ProjectConfig>,
    /// 配置文件内容摘要
    pub config_digest: Option<String>,
    /// 上一次完整扫描的索引，首次扫描前为空
    pub index: Option<FileIndex>,
    /// 因端点不可用而推迟到下一轮的修改
    pub deferred_modified: BTreeSet<PathBuf>,
    last_error: Option<String>,
}

impl Project {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            config: None,
            config_digest: None,
            index: None,
            deferred_modified: BTreeSet::new(),
            last_error: None,
        }
    }

    /// 记录错误，与上一次不同时返回 true（用于避免每轮重复告警）
    pub fn note_error(&mut self, message: &str) -> bool {
        if self.last_error.as_deref() == Some(message) {
            return false;
        }
        self.last_error = Some(message.to_string());
        true
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// 应用新读取的配置，返回内容是否与上一次不同（首次加载返回 false）
    pub fn apply_config(&mut self, config: ProjectConfig, digest: String) -> bool {
        let changed = self
            .config_digest
            .as_ref()
            .map(|old| old != &digest)
            .unwrap_or(false);
        self.config = Some(config);
        self.config_digest = Some(digest);
        changed
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.config
            .as_ref()
            .map(|c| Endpoint::new(&c.remote.user, &c.remote.host))
    }

    pub fn mapping(&self) -> Option<PathMapping> {
        self.config
            .as_ref()
            .map(|c| PathMapping::new(&self.path, &c.remote.path))
    }

    pub fn exclude_set(&self) -> ExcludeSet {
        match &self.config {
            Some(c) => ExcludeSet::new(&c.exclude),
            None => ExcludeSet::new(Vec::<String>::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(remote: &str, exclude: &[&str]) -> ProjectConfig {
        serde_json::from_value(serde_json::json!({
            "remote": remote,
            "exclude": exclude,
        }))
        .unwrap()
    }

    #[test]
    fn test_remote_path_substitutes_prefix() {
        let mapping = PathMapping::new("/home/me/site", "/srv/site");
        assert_eq!(
            mapping.remote_path(Path::new("/home/me/site/css/a.css")),
            Some("/srv/site/css/a.css".to_string())
        );
        assert_eq!(
            mapping.remote_path(Path::new("/home/me/site")),
            Some("/srv/site".to_string())
        );
        assert_eq!(mapping.remote_path(Path::new("/home/me/other/a")), None);
        // 前缀必须按路径段匹配
        assert_eq!(mapping.remote_path(Path::new("/home/me/site2/a")), None);
    }

    #[test]
    fn test_remote_path_under_filesystem_root() {
        let mapping = PathMapping::new("/p", "/");
        assert_eq!(
            mapping.remote_path(Path::new("/p/a.txt")),
            Some("/a.txt".to_string())
        );
        assert_eq!(mapping.remote_path(Path::new("/p")), Some("/".to_string()));
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("deploy", "web1").to_string(), "deploy@web1");
    }

    #[test]
    fn test_project_accessors_follow_config() {
        let mut project = Project::new("/p");
        assert!(project.endpoint().is_none());
        assert!(project.mapping().is_none());
        assert_eq!(project.exclude_set().len(), 1);

        assert!(!project.apply_config(config("u@h:/r", &[".git"]), "d1".into()));
        assert_eq!(project.endpoint(), Some(Endpoint::new("u", "h")));
        assert_eq!(project.mapping(), Some(PathMapping::new("/p", "/r")));
        assert_eq!(project.exclude_set().len(), 2);

        assert!(!project.apply_config(config("u@h:/r", &[".git"]), "d1".into()));
        assert!(project.apply_config(config("u@h2:/r", &[]), "d2".into()));
        assert_eq!(project.endpoint(), Some(Endpoint::new("u", "h2")));
    }

    #[test]
    fn test_note_error_reports_changes_only() {
        let mut project = Project::new("/p");
        assert!(project.note_error("boom"));
        assert!(!project.note_error("boom"));
        assert!(project.note_error("other"));
        project.clear_error();
        assert!(project.note_error("other"));
    }
}
