//! 配置模块
//!
//! 全局配置 `~/.dcync` 记录活跃项目列表以及运行参数，
//! 每个项目根目录下的 `.dcync` 记录远端目标和排除列表。
//! 两者都是 JSON 文件，同步循环每一轮都会重新读取。

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::ConfigError;

/// 项目配置文件名（同时也是全局配置文件名）
pub const CONFIG_FILE: &str = ".dcync";

/// 远端目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RemoteSpec")]
pub struct RemoteTarget {
    pub user: String,
    pub host: String,
    pub path: String,
}

/// 远端目标的两种写法：对象或 `user@host:/path`
#[derive(Deserialize)]
#[serde(untagged)]
enum RemoteSpec {
    Full {
        user: String,
        host: String,
        path: String,
    },
    Short(String),
}

impl TryFrom<RemoteSpec> for RemoteTarget {
    type Error = String;

    fn try_from(spec: RemoteSpec) -> Result<Self, Self::Error> {
        let target = match spec {
            RemoteSpec::Full { user, host, path } => RemoteTarget { user, host, path },
            RemoteSpec::Short(s) => RemoteTarget::parse(&s)
                .ok_or_else(|| format!("无效的远端目录: {}", s))?,
        };

        if target.user.is_empty() || target.host.is_empty() || target.path.is_empty() {
            return Err("远端目标的 user/host/path 不能为空".to_string());
        }

        Ok(RemoteTarget {
            path: normalize_remote_root(&target.path),
            ..target
        })
    }
}

impl RemoteTarget {
    /// 解析 `user@host:/path` 形式的远端目录
    pub fn parse(s: &str) -> Option<Self> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let re = PATTERN.get_or_init(|| {
            Regex::new(r"^(?P<user>.+?)@(?P<host>.+?):(?P<path>.+?)$").expect("valid regex")
        });

        let caps = re.captures(s.trim())?;
        Some(RemoteTarget {
            user: caps["user"].to_string(),
            host: caps["host"].to_string(),
            path: normalize_remote_root(&caps["path"]),
        })
    }
}

/// 去掉远端根目录末尾的 `/`（根目录本身除外）
fn normalize_remote_root(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// 项目配置（`<project>/.dcync`）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    pub remote: RemoteTarget,
    /// 排除的文件/目录名，含 `/` 的条目按项目根目录相对路径匹配
    #[serde(default)]
    pub exclude: Vec<String>,
    /// push/pull 模板，原样保留
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub templates: serde_json::Value,
}

/// SSH 参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// 私钥文件，未配置时自动查找 ~/.ssh 下的默认私钥
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: default_ssh_port(),
            identity_file: None,
        }
    }
}

/// 运行参数（全局配置中的 `run` 段）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    /// 轮询间隔（毫秒）
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// 去重记录保留时间（秒）
    #[serde(default = "default_retention_secs")]
    pub retention_secs: i64,
    /// 垃圾回收的期望周期（秒）
    #[serde(default = "default_gc_period_secs")]
    pub gc_period_secs: u64,
    /// 建立连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 单个远程操作超时（秒）
    #[serde(default = "default_op_timeout_secs")]
    pub op_timeout_secs: u64,
    /// 同时处理的端点数
    #[serde(default = "default_max_concurrent_endpoints")]
    pub max_concurrent_endpoints: usize,
    #[serde(default)]
    pub ssh: SshConfig,
}

fn default_interval_ms() -> u64 {
    100
}

fn default_retention_secs() -> i64 {
    60
}

fn default_gc_period_secs() -> u64 {
    1200 // 20 分钟
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_op_timeout_secs() -> u64 {
    60
}

fn default_max_concurrent_endpoints() -> usize {
    4
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            retention_secs: default_retention_secs(),
            gc_period_secs: default_gc_period_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            op_timeout_secs: default_op_timeout_secs(),
            max_concurrent_endpoints: default_max_concurrent_endpoints(),
            ssh: SshConfig::default(),
        }
    }
}

/// 全局配置（`~/.dcync`）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    #[serde(default)]
    pub projects: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub templates: serde_json::Value,
    #[serde(default)]
    pub run: RunConfig,
    /// 其他段（如 `log`）原样保留
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl GlobalConfig {
    /// 添加项目（去重，保持顺序）
    pub fn register(&mut self, path: PathBuf) {
        if !self.projects.contains(&path) {
            self.projects.push(path);
        }
    }

    /// 移除项目，返回是否存在
    pub fn unregister(&mut self, path: &Path) -> bool {
        let before = self.projects.len();
        self.projects.retain(|p| p != path);
        before != self.projects.len()
    }
}

/// 活跃项目注册表
pub trait ProjectRegistry: Send + Sync {
    /// 列出当前活跃的项目根目录（有序）
    fn list_active_projects(&self) -> Result<Vec<PathBuf>, ConfigError>;
}

/// 项目配置存储
pub trait ConfigStore: Send + Sync {
    /// 读取项目配置，同时返回原始内容的摘要（用于判断配置是否变化）
    fn load_project(&self, root: &Path) -> Result<(ProjectConfig, String), ConfigError>;
}

/// 基于 JSON 文件的配置存储
#[derive(Debug, Clone)]
pub struct JsonConfigStore {
    global_path: PathBuf,
}

impl JsonConfigStore {
    pub fn new(global_path: PathBuf) -> Self {
        Self { global_path }
    }

    /// 使用 `$HOME/.dcync` 作为全局配置
    pub fn from_home() -> anyhow::Result<Self> {
        let home = crate::dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("无法确定用户主目录 (HOME 未设置)"))?;
        Ok(Self::new(home.join(CONFIG_FILE)))
    }

    pub fn global_path(&self) -> &Path {
        &self.global_path
    }

    /// 读取全局配置，文件不存在时返回默认配置
    pub fn load_global(&self) -> Result<GlobalConfig, ConfigError> {
        match read_json::<GlobalConfig>(&self.global_path) {
            Ok((config, _)) => Ok(config),
            Err(ConfigError::Missing(_)) => Ok(GlobalConfig::default()),
            Err(e) => Err(e),
        }
    }

    pub fn save_global(&self, config: &GlobalConfig) -> Result<(), ConfigError> {
        write_json(&self.global_path, config)
    }

    pub fn save_project(&self, root: &Path, config: &ProjectConfig) -> Result<(), ConfigError> {
        write_json(&root.join(CONFIG_FILE), config)
    }
}

impl ProjectRegistry for JsonConfigStore {
    fn list_active_projects(&self) -> Result<Vec<PathBuf>, ConfigError> {
        Ok(self.load_global()?.projects)
    }
}

impl ConfigStore for JsonConfigStore {
    fn load_project(&self, root: &Path) -> Result<(ProjectConfig, String), ConfigError> {
        read_json(&root.join(CONFIG_FILE))
    }
}

/// 读取并解析 JSON 文件，返回内容摘要
fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<(T, String), ConfigError> {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ConfigError::Missing(path.to_path_buf()))
        }
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let value = serde_json::from_slice(&data).map_err(|e| ConfigError::Invalid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let digest = blake3::hash(&data).to_hex()[..16].to_string();
    Ok((value, digest))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    let content = serde_json::to_string_pretty(value).map_err(|e| ConfigError::Invalid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    fs::write(path, content).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}
