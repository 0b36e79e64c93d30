//! 连接池
//!
//! 每个端点最多一个会话，首次使用时建立。传输失败后端点被标记为
//! 需要健康检查，下一次取用时先 ping，失败则丢弃旧会话重新连接。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::project::Endpoint;
use crate::error::SyncError;
use crate::transport::{RemoteSession, Transport};

pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    sessions: HashMap<Endpoint, Arc<dyn RemoteSession>>,
    needs_ping: HashSet<Endpoint>,
}

impl ConnectionPool {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            sessions: HashMap::new(),
            needs_ping: HashSet::new(),
        }
    }

    /// 取得端点的会话，必要时建立或重建连接
    pub async fn acquire(
        &mut self,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn RemoteSession>, SyncError> {
        let flagged = self.needs_ping.remove(endpoint);
        let mut reconnect = false;

        if let Some(session) = self.sessions.get(endpoint) {
            if !flagged {
                return Ok(session.clone());
            }

            match session.ping().await {
                Ok(()) => {
                    debug!("连接 {} 健康检查通过", endpoint);
                    return Ok(session.clone());
                }
                Err(e) => {
                    warn!("连接 {} 健康检查失败: {:#}", endpoint, e);
                    self.sessions.remove(endpoint);
                    reconnect = true;
                }
            }
        }

        let session = self
            .transport
            .connect(endpoint)
            .await
            .map_err(|e| SyncError::connection(endpoint, &e))?;

        if reconnect {
            info!("重新连接: {} ({})", endpoint, self.transport.name());
        } else {
            info!("建立连接: {} ({})", endpoint, self.transport.name());
        }

        self.sessions.insert(endpoint.clone(), session.clone());
        Ok(session)
    }

    /// 标记端点在下次取用前需要健康检查
    pub fn mark_needs_ping(&mut self, endpoint: &Endpoint) {
        if self.sessions.contains_key(endpoint) {
            self.needs_ping.insert(endpoint.clone());
        }
    }

    pub fn needs_ping(&self, endpoint: &Endpoint) -> bool {
        self.needs_ping.contains(endpoint)
    }

    /// 关闭不在 `keep` 中的端点的会话
    pub fn retain(&mut self, keep: &HashSet<Endpoint>) {
        self.sessions.retain(|endpoint, _| {
            let kept = keep.contains(endpoint);
            if !kept {
                info!("关闭连接: {}", endpoint);
            }
            kept
        });
        self.needs_ping.retain(|endpoint| keep.contains(endpoint));
    }

    pub fn is_connected(&self, endpoint: &Endpoint) -> bool {
        self.sessions.contains_key(endpoint)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        connects: AtomicUsize,
        pings: AtomicUsize,
        refuse: AtomicBool,
        dead: AtomicBool,
    }

    struct FakeTransport(Arc<Counters>);

    struct FakeSession(Arc<Counters>);

    #[async_trait]
    impl RemoteSession for FakeSession {
        async fn send_file(&self, _: &Path, _: &str) -> Result<()> {
            Ok(())
        }
        async fn make_dir(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn remove_file(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn remove_dir(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn ping(&self) -> Result<()> {
            self.0.pings.fetch_add(1, Ordering::SeqCst);
            if self.0.dead.load(Ordering::SeqCst) {
                bail!("broken pipe");
            }
            Ok(())
        }
        fn name(&self) -> &str {
            "fake"
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(&self, _: &Endpoint) -> Result<Arc<dyn RemoteSession>> {
            if self.0.refuse.load(Ordering::SeqCst) {
                bail!("connection refused");
            }
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            self.0.dead.store(false, Ordering::SeqCst);
            Ok(Arc::new(FakeSession(self.0.clone())))
        }
        fn name(&self) -> &str {
            "fake"
        }
    }

    fn pool() -> (ConnectionPool, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let pool = ConnectionPool::new(Arc::new(FakeTransport(counters.clone())));
        (pool, counters)
    }

    #[tokio::test]
    async fn test_connects_lazily_and_reuses() {
        let (mut pool, counters) = pool();
        let ep = Endpoint::new("u", "h");
        assert!(pool.is_empty());

        pool.acquire(&ep).await.unwrap();
        pool.acquire(&ep).await.unwrap();
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
        assert_eq!(counters.pings.load(Ordering::SeqCst), 0);
        assert!(pool.is_connected(&ep));
    }

    #[tokio::test]
    async fn test_ping_only_after_failure_mark() {
        let (mut pool, counters) = pool();
        let ep = Endpoint::new("u", "h");
        pool.acquire(&ep).await.unwrap();

        pool.mark_needs_ping(&ep);
        assert!(pool.needs_ping(&ep));
        pool.acquire(&ep).await.unwrap();
        assert_eq!(counters.pings.load(Ordering::SeqCst), 1);
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);

        // 标记在检查后清除
        assert!(!pool.needs_ping(&ep));
        pool.acquire(&ep).await.unwrap();
        assert_eq!(counters.pings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_ping_reconnects() {
        let (mut pool, counters) = pool();
        let ep = Endpoint::new("u", "h");
        pool.acquire(&ep).await.unwrap();

        counters.dead.store(true, Ordering::SeqCst);
        pool.mark_needs_ping(&ep);
        pool.acquire(&ep).await.unwrap();
        assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_needs_ping_is_per_endpoint() {
        let (mut pool, counters) = pool();
        let a = Endpoint::new("u", "a");
        let b = Endpoint::new("u", "b");
        pool.acquire(&a).await.unwrap();
        pool.acquire(&b).await.unwrap();

        pool.mark_needs_ping(&a);
        pool.acquire(&b).await.unwrap();
        assert_eq!(counters.pings.load(Ordering::SeqCst), 0);
        assert!(pool.needs_ping(&a));
    }

    #[tokio::test]
    async fn test_connect_failure_is_connection_error() {
        let (mut pool, counters) = pool();
        let ep = Endpoint::new("u", "h");
        counters.refuse.store(true, Ordering::SeqCst);

        let err = pool.acquire(&ep).await.err().unwrap();
        assert!(matches!(err, SyncError::Connection { ref endpoint, .. } if endpoint == &ep));
        assert!(!pool.is_connected(&ep));

        counters.refuse.store(false, Ordering::SeqCst);
        pool.acquire(&ep).await.unwrap();
        assert!(pool.is_connected(&ep));
    }

    #[tokio::test]
    async fn test_retain_drops_unreferenced_endpoints() {
        let (mut pool, _) = pool();
        let a = Endpoint::new("u", "a");
        let b = Endpoint::new("u", "b");
        pool.acquire(&a).await.unwrap();
        pool.acquire(&b).await.unwrap();
        pool.mark_needs_ping(&b);

        pool.retain(&HashSet::from([a.clone()]));
        assert_eq!(pool.len(), 1);
        assert!(pool.is_connected(&a));
        assert!(!pool.needs_ping(&b));
    }
}
