//! 基于系统 ssh 命令的传输实现
//!
//! 每个端点启动一个 ControlMaster 主连接，之后的上传、建目录、删除和
//! 存活检查都复用这条连接，不再重复握手和认证。

use super::{RemoteSession, Transport};
use crate::config::SshConfig;
use crate::core::Endpoint;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// 默认查找的私钥文件
const DEFAULT_IDENTITIES: [&str; 3] = ["id_ed25519", "id_ecdsa", "id_rsa"];

/// SSH 传输
pub struct SshTransport {
    port: u16,
    identity: PathBuf,
    connect_timeout: Duration,
    op_timeout: Duration,
    control_dir: PathBuf,
    name: String,
}

impl SshTransport {
    /// 创建传输，启动时解析一次私钥
    ///
    /// 找不到私钥时返回错误，调用方应当终止启动。
    pub fn new(ssh: &SshConfig, connect_timeout: Duration, op_timeout: Duration) -> Result<Self> {
        let identity = resolve_identity(ssh.identity_file.as_deref(), crate::dirs::home_dir())?;
        info!("使用 SSH 私钥: {}", identity.display());

        let control_dir = std::env::temp_dir().join(format!("dcync-{}", std::process::id()));
        std::fs::create_dir_all(&control_dir)
            .with_context(|| format!("无法创建控制目录 {}", control_dir.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&control_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(Self {
            port: ssh.port,
            identity,
            connect_timeout,
            op_timeout,
            control_dir,
            name: format!("ssh:{}", ssh.port),
        })
    }

    /// 主连接和每次操作共用的参数
    ///
    /// 控制套接字失效时 ssh 会直接建立新连接，这些参数保证它仍使用
    /// 正确的端口、私钥和超时。
    fn common_args(&self) -> Vec<String> {
        vec![
            "-p".to_string(),
            self.port.to_string(),
            "-i".to_string(),
            self.identity.display().to_string(),
            "-o".to_string(),
            "IdentitiesOnly=yes".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ]
    }

    /// 主连接参数
    fn master_args(&self, control_path: &Path, dest: &str) -> Vec<String> {
        let mut args = self.common_args();
        args.extend(
            [
                "-o",
                "ServerAliveInterval=15",
                "-o",
                "ServerAliveCountMax=3",
                "-o",
                "ControlMaster=yes",
                "-o",
                "ControlPersist=no",
                "-S",
            ]
            .map(String::from),
        );
        args.push(control_path.display().to_string());
        args.extend(["-M", "-N"].map(String::from));
        args.push(dest.to_string());
        args
    }
}

/// 通过主连接执行远程命令的参数
fn session_args(common: &[String], control_path: &Path, dest: &str, command: &str) -> Vec<String> {
    let mut args = common.to_vec();
    args.extend(["-o", "ControlMaster=no", "-S"].map(String::from));
    args.push(control_path.display().to_string());
    args.push(dest.to_string());
    args.push("--".to_string());
    args.push(command.to_string());
    args
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn RemoteSession>> {
        let dest = endpoint.to_string();
        let id = uuid::Uuid::new_v4().simple().to_string();
        let control_path = self.control_dir.join(format!("{}.sock", &id[..12]));

        debug!("启动 ssh 主连接: {} ({})", dest, control_path.display());

        // 连接失败时清理控制套接字
        let cleanup = scopeguard::guard(control_path.clone(), |p| {
            let _ = std::fs::remove_file(p);
        });

        let mut master = Command::new("ssh")
            .args(self.master_args(&control_path, &dest))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("无法启动 ssh")?;

        let started = Instant::now();
        let deadline = self.connect_timeout + Duration::from_secs(2);

        loop {
            if let Some(status) = master.try_wait()? {
                let mut stderr = String::new();
                if let Some(mut pipe) = master.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                bail!("ssh 主连接退出 ({}): {}", status, stderr.trim());
            }

            if control_check(&control_path, &dest).await {
                break;
            }

            if started.elapsed() > deadline {
                bail!("连接超时 ({}s)", deadline.as_secs());
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let control_path = scopeguard::ScopeGuard::into_inner(cleanup);

        Ok(Arc::new(SshSession {
            dest,
            control_path,
            common_args: self.common_args(),
            op_timeout: self.op_timeout,
            master: Mutex::new(master),
        }))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 通过控制套接字检查主连接是否就绪
async fn control_check(control_path: &Path, dest: &str) -> bool {
    Command::new("ssh")
        .arg("-S")
        .arg(control_path)
        .args(["-O", "check", dest])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// 复用主连接的 SSH 会话
pub struct SshSession {
    dest: String,
    control_path: PathBuf,
    common_args: Vec<String>,
    op_timeout: Duration,
    master: Mutex<Child>,
}

impl SshSession {
    /// 通过主连接执行远程命令，返回 stdout
    async fn execute(&self, command: &str, stdin: Option<std::fs::File>) -> Result<String> {
        let mut cmd = Command::new("ssh");
        cmd.args(session_args(
            &self.common_args,
            &self.control_path,
            &self.dest,
            command,
        ))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        match stdin {
            Some(file) => cmd.stdin(Stdio::from(file)),
            None => cmd.stdin(Stdio::null()),
        };

        let child = cmd.spawn().context("无法启动 ssh")?;
        let output = tokio::time::timeout(self.op_timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("操作超时 ({}s)", self.op_timeout.as_secs()))??;

        if !output.status.success() {
            bail!(
                "远程命令失败 ({}): {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn send_file(&self, local: &Path, remote: &str) -> Result<()> {
        let file = tokio::fs::File::open(local)
            .await
            .with_context(|| format!("无法打开 {}", local.display()))?
            .into_std()
            .await;

        // 先写临时文件，再原子重命名
        let temp = temp_remote_path(remote);
        let command = format!(
            "cat > {tmp} && mv -f -- {tmp} {dst}",
            tmp = shell_quote(&temp),
            dst = shell_quote(remote)
        );
        self.execute(&command, Some(file)).await?;
        Ok(())
    }

    async fn make_dir(&self, remote: &str) -> Result<()> {
        let q = shell_quote(remote);
        self.execute(&format!("[ -d {q} ] || mkdir -- {q}"), None).await?;
        Ok(())
    }

    async fn remove_file(&self, remote: &str) -> Result<()> {
        self.execute(&format!("rm -f -- {}", shell_quote(remote)), None).await?;
        Ok(())
    }

    async fn remove_dir(&self, remote: &str) -> Result<()> {
        let q = shell_quote(remote);
        self.execute(&format!("[ ! -e {q} ] || rmdir -- {q}"), None).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if let Some(status) = self.master.lock().await.try_wait()? {
            bail!("主连接已断开 ({})", status);
        }

        let out = self.execute("echo 1", None).await?;
        if out.trim() != "1" {
            bail!("存活检查返回异常: {:?}", out.trim());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.dest
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        // 主进程由 kill_on_drop 结束
        let _ = std::fs::remove_file(&self.control_path);
    }
}

/// 查找私钥：优先使用配置的文件，否则依次尝试 ~/.ssh 下的默认私钥
pub fn resolve_identity(configured: Option<&Path>, home: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        bail!("配置的 SSH 私钥不存在: {}", path.display());
    }

    let ssh_dir = home
        .ok_or_else(|| anyhow!("无法确定用户主目录"))?
        .join(".ssh");

    DEFAULT_IDENTITIES
        .iter()
        .map(|name| ssh_dir.join(name))
        .find(|p| p.is_file())
        .ok_or_else(|| anyhow!("未找到 SSH 私钥 (已查找 {})", ssh_dir.display()))
}

/// 用单引号转义，供远程 shell 使用
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// 同目录下的隐藏临时文件名
fn temp_remote_path(remote: &str) -> String {
    match remote.rsplit_once('/') {
        Some((dir, name)) => format!("{}/.{}.dcync-tmp", dir, name),
        None => format!(".{}.dcync-tmp", remote),
    }
}
