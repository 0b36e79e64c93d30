use super::{RemoteSession, Transport};
use crate::core::Endpoint;
use anyhow::Result;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

/// 本地镜像传输：把 `host:/path` 映射到 `<base>/<host>/path`
pub struct LocalTransport {
    base_path: PathBuf,
    name: String,
}

impl LocalTransport {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = path.into();
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        let name = format!("local:{}", base_path.display());
        Ok(Self { base_path, name })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn RemoteSession>> {
        let root = self.base_path.join(&endpoint.host);
        fs::create_dir_all(&root).await?;
        Ok(Arc::new(LocalSession {
            root,
            name: format!("local:{}", endpoint),
        }))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 本地镜像会话
pub struct LocalSession {
    root: PathBuf,
    name: String,
}

impl LocalSession {
    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }
}

#[async_trait]
impl RemoteSession for LocalSession {
    async fn send_file(&self, local: &Path, remote: &str) -> Result<()> {
        let full_path = self.resolve_path(remote);

        // 使用临时文件写入，然后原子重命名
        let file_name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let temp_path = full_path.with_file_name(format!(".{}.dcync-tmp", file_name));
        fs::copy(local, &temp_path).await?;
        fs::rename(&temp_path, &full_path).await?;

        Ok(())
    }

    async fn make_dir(&self, remote: &str) -> Result<()> {
        let full_path = self.resolve_path(remote);
        match fs::create_dir(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists && full_path.is_dir() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_file(&self, remote: &str) -> Result<()> {
        match fs::remove_file(self.resolve_path(remote)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_dir(&self, remote: &str) -> Result<()> {
        match fs::remove_dir(self.resolve_path(remote)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ping(&self) -> Result<()> {
        let meta = fs::metadata(&self.root).await?;
        if !meta.is_dir() {
            anyhow::bail!("镜像目录不可用: {}", self.root.display());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn endpoint() -> Endpoint {
        Endpoint::new("deploy", "web1")
    }

    #[tokio::test]
    async fn test_operations_map_under_host_dir() {
        let mirror = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a.txt"), "hello").await.unwrap();

        let transport = LocalTransport::new(mirror.path()).unwrap();
        let session = transport.connect(&endpoint()).await.unwrap();

        session.make_dir("/srv").await.unwrap();
        session.make_dir("/srv").await.unwrap();
        session.make_dir("/srv/app").await.unwrap();
        session
            .send_file(&src.path().join("a.txt"), "/srv/app/a.txt")
            .await
            .unwrap();

        let mirrored = mirror.path().join("web1/srv/app/a.txt");
        assert_eq!(fs::read_to_string(&mirrored).await.unwrap(), "hello");

        session.remove_file("/srv/app/a.txt").await.unwrap();
        session.remove_file("/srv/app/a.txt").await.unwrap();
        session.remove_dir("/srv/app").await.unwrap();
        assert!(!mirror.path().join("web1/srv/app").exists());
        session.ping().await.unwrap();
    }

    #[test]
    fn test_new_creates_base_dir() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("mirror/nested");
        let transport = LocalTransport::new(&base).unwrap();
        assert_eq!(transport.base_path(), base.as_path());
        assert!(base.is_dir());
        assert!(transport.name().ends_with("mirror/nested"));
    }

    #[tokio::test]
    async fn test_send_without_parent_fails() {
        let mirror = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a.txt"), "x").await.unwrap();

        let transport = LocalTransport::new(mirror.path()).unwrap();
        let session = transport.connect(&endpoint()).await.unwrap();

        assert!(session
            .send_file(&src.path().join("a.txt"), "/missing/a.txt")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_remove_non_empty_dir_fails() {
        let mirror = TempDir::new().unwrap();
        let transport = LocalTransport::new(mirror.path()).unwrap();
        let session = transport.connect(&endpoint()).await.unwrap();

        session.make_dir("/d").await.unwrap();
        session.make_dir("/d/e").await.unwrap();
        assert!(session.remove_dir("/d").await.is_err());
    }
}
