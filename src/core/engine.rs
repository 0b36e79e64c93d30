use crate::config::{ConfigStore, ProjectRegistry, RunConfig};
use crate::core::dedup::{ChangeGuard, GcTrigger};
use crate::core::differ::SnapshotDiff;
use crate::core::pool::ConnectionPool;
use crate::core::project::{Endpoint, Project};
use crate::core::scanner::{FileIndex, TreeScanner};
use crate::core::task::{RemoteOp, SyncTask, TaskBuilder};
use crate::error::SyncError;
use crate::transport::{RemoteSession, Transport};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 同步配置
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 轮询间隔
    pub interval: Duration,
    /// 去重记录保留时间（秒）
    pub retention_secs: i64,
    /// 垃圾回收的期望周期（秒）
    pub gc_period_secs: u64,
    /// 同时处理的端点数
    pub max_concurrent_endpoints: usize,
    /// 逐个文件输出同步结果
    pub verbose: bool,
}

impl EngineConfig {
    pub fn from_run(run: &RunConfig, verbose: bool) -> Self {
        Self {
            interval: Duration::from_millis(run.interval_ms),
            retention_secs: run.retention_secs,
            gc_period_secs: run.gc_period_secs,
            max_concurrent_endpoints: run.max_concurrent_endpoints.max(1),
            verbose,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_run(&RunConfig::default(), false)
    }
}

/// 一轮同步的结果
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub projects: usize,
    pub tasks: usize,
    pub files_sent: usize,
    pub dirs_created: usize,
    pub entries_removed: usize,
    /// 被去重记录跳过的操作
    pub skipped: usize,
    pub failures: usize,
    pub errors: Vec<String>,
}

impl TickReport {
    /// 本轮没有任何任务和错误
    pub fn is_idle(&self) -> bool {
        self.tasks == 0 && self.errors.is_empty()
    }
}

/// 等待执行的任务，以及端点不可用时恢复项目状态所需的数据
struct PendingTask {
    task: SyncTask,
    previous: Option<FileIndex>,
    modified: Vec<PathBuf>,
}

/// 一个端点本轮要执行的操作
struct EndpointBatch {
    endpoint: Endpoint,
    session: Arc<dyn RemoteSession>,
    ops: Vec<RemoteOp>,
}

struct BatchOutcome {
    endpoint: Endpoint,
    files_sent: usize,
    dirs_created: usize,
    entries_removed: usize,
    failures: Vec<SyncError>,
}

/// 同步引擎
pub struct SyncEngine {
    registry: Arc<dyn ProjectRegistry>,
    store: Arc<dyn ConfigStore>,
    pool: ConnectionPool,
    guard: ChangeGuard,
    gc: GcTrigger,
    projects: Vec<Project>,
    /// 上一轮结束时的时间边界
    time_from: i64,
    config: EngineConfig,
    cancelled: Arc<AtomicBool>,
}

impl SyncEngine {
    pub fn new(
        registry: Arc<dyn ProjectRegistry>,
        store: Arc<dyn ConfigStore>,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> Self {
        let gc = GcTrigger::new(config.gc_period_secs, config.interval.as_millis() as u64);
        Self {
            registry,
            store,
            pool: ConnectionPool::new(transport),
            guard: ChangeGuard::new(),
            gc,
            projects: Vec::new(),
            time_from: chrono::Utc::now().timestamp(),
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 指定初始时间边界
    pub fn with_time_from(mut self, time_from: i64) -> Self {
        self.time_from = time_from;
        self
    }

    pub fn time_from(&self) -> i64 {
        self.time_from
    }

    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn guard(&self) -> &ChangeGuard {
        &self.guard
    }

    /// 取消句柄，置位后循环在下一轮开始前退出
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// 取消同步
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// 检查是否已取消
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 持续同步，直到被取消
    pub async fn run(&mut self) {
        info!(
            "开始持续同步: 间隔 {}ms, 约每 {} 轮回收一次去重记录",
            self.config.interval.as_millis(),
            self.gc.expected_ticks()
        );

        loop {
            if self.is_cancelled() {
                info!("同步已停止");
                break;
            }

            let now = chrono::Utc::now().timestamp();
            let report = self.tick(now).await;
            if !report.is_idle() {
                debug!(
                    "本轮结果: {}",
                    serde_json::to_string(&report).unwrap_or_default()
                );
            }

            tokio::time::sleep(self.config.interval + Duration::from_millis(1)).await;

            let collect = self.gc.should_collect(&mut rand::thread_rng());
            if collect {
                self.collect_garbage(chrono::Utc::now().timestamp());
            }
        }
    }

    /// 清除过期的去重记录
    pub fn collect_garbage(&mut self, now: i64) -> usize {
        let collected = self.guard.collect_garbage(now, self.config.retention_secs);
        info!("垃圾回收: 清除 {} 条去重记录", collected);
        collected
    }

    /// 执行一轮同步，`now` 为本轮时间（Unix 秒）
    pub async fn tick(&mut self, now: i64) -> TickReport {
        let mut report = TickReport::default();

        self.refresh_projects(&mut report);
        self.reload_configs(&mut report);
        report.projects = self.projects.len();

        let pending = self.scan_projects(&mut report).await;
        report.tasks = pending.len();

        let batches = self.prepare_batches(pending, now, &mut report).await;
        self.execute(batches, &mut report).await;

        self.time_from = now;
        report
    }

    /// 按注册表更新项目集合
    fn refresh_projects(&mut self, report: &mut TickReport) {
        let paths = match self.registry.list_active_projects() {
            Ok(paths) => paths,
            Err(e) => {
                warn!("读取项目列表失败，保持当前项目: {}", e);
                report.errors.push(e.to_string());
                return;
            }
        };

        let mut current: HashMap<PathBuf, Project> = self
            .projects
            .drain(..)
            .map(|p| (p.path.clone(), p))
            .collect();

        let mut projects: Vec<Project> = Vec::with_capacity(paths.len());
        for path in paths {
            if projects.iter().any(|p| p.path == path) {
                continue;
            }
            match current.remove(&path) {
                Some(project) => projects.push(project),
                None => {
                    info!("添加项目: {}", path.display());
                    projects.push(Project::new(path));
                }
            }
        }

        for path in current.keys() {
            info!("移除项目: {}", path.display());
        }

        self.projects = projects;
    }

    /// 重新读取每个项目的配置，并关闭不再使用的连接
    fn reload_configs(&mut self, report: &mut TickReport) {
        for project in &mut self.projects {
            match self.store.load_project(&project.path) {
                Ok((config, digest)) => {
                    if project.apply_config(config, digest) {
                        info!("配置已重新加载: {}", project.path.display());
                    }
                }
                Err(e) => {
                    let err = SyncError::from(e);
                    let message = err.to_string();
                    if project.note_error(&message) {
                        warn!("跳过项目 {}: {}", project.path.display(), message);
                    }
                    project.config = None;
                    project.config_digest = None;
                    report.errors.push(message);
                }
            }
        }

        let referenced: HashSet<Endpoint> =
            self.projects.iter().filter_map(|p| p.endpoint()).collect();
        self.pool.retain(&referenced);
    }

    /// 并发扫描所有已配置的项目，计算差异并生成任务
    async fn scan_projects(&mut self, report: &mut TickReport) -> Vec<PendingTask> {
        let scans = self
            .projects
            .iter()
            .enumerate()
            .filter(|(_, p)| p.config.is_some())
            .map(|(i, p)| {
                let root = p.path.clone();
                let excludes = p.exclude_set();
                async move { (i, TreeScanner::scan_blocking(root, excludes).await) }
            });
        let results = futures::future::join_all(scans).await;

        let mut pending = Vec::new();
        for (i, result) in results {
            let project = &mut self.projects[i];

            let snapshot = match result {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    let message = e.to_string();
                    if project.note_error(&message) {
                        error!("{}", message);
                    } else {
                        debug!("{}", message);
                    }
                    report.errors.push(message);
                    continue;
                }
            };
            project.clear_error();

            let previous = project.index.take();
            let mut diff = SnapshotDiff::compute(previous.as_ref(), &snapshot, self.time_from);
            diff.carry_modified(std::mem::take(&mut project.deferred_modified), &snapshot);
            project.index = Some(snapshot.index());

            if previous.is_none() {
                debug!(
                    "建立基线: {} ({} 个条目)",
                    project.path.display(),
                    snapshot.len()
                );
            }

            if let Some(task) = TaskBuilder::build(project, &diff) {
                debug!(
                    "{}: 新增 {}, 删除 {}, 修改 {}",
                    project.path.display(),
                    diff.added.len(),
                    diff.removed.len(),
                    diff.modified.len()
                );
                pending.push(PendingTask {
                    task,
                    previous,
                    modified: diff.modified,
                });
            }
        }

        pending
    }

    /// 按端点分组，取得连接并做去重过滤
    ///
    /// 去重的检查和记录在这里顺序完成，之后各端点才并发执行。
    async fn prepare_batches(
        &mut self,
        pending: Vec<PendingTask>,
        now: i64,
        report: &mut TickReport,
    ) -> Vec<EndpointBatch> {
        let mut groups: BTreeMap<Endpoint, Vec<PendingTask>> = BTreeMap::new();
        for task in pending {
            groups
                .entry(task.task.endpoint.clone())
                .or_default()
                .push(task);
        }

        let mut batches = Vec::with_capacity(groups.len());
        for (endpoint, tasks) in groups {
            let session = match self.pool.acquire(&endpoint).await {
                Ok(session) => session,
                Err(e) => {
                    warn!("{}，本轮跳过 {} 个任务", e, tasks.len());
                    report.errors.push(e.to_string());
                    for task in tasks {
                        self.defer(task);
                    }
                    continue;
                }
            };

            let mut ops = Vec::new();
            for task in tasks {
                for op in task.task.ops {
                    if op.is_deduplicated() {
                        if !self.guard.should_transfer(op.local(), self.time_from) {
                            debug!("跳过重复传输: {}", op.local().display());
                            report.skipped += 1;
                            continue;
                        }
                        self.guard.record(op.local(), now);
                    }
                    ops.push(op);
                }
            }

            if !ops.is_empty() {
                batches.push(EndpointBatch {
                    endpoint,
                    session,
                    ops,
                });
            }
        }

        batches
    }

    /// 端点不可用：恢复项目的上一次索引，修改留到下一轮
    fn defer(&mut self, pending: PendingTask) {
        if let Some(project) = self
            .projects
            .iter_mut()
            .find(|p| p.path == pending.task.project)
        {
            project.index = pending.previous;
            project.deferred_modified.extend(pending.modified);
        }
    }

    /// 执行操作：不同端点并发，同一端点内按顺序
    async fn execute(&mut self, batches: Vec<EndpointBatch>, report: &mut TickReport) {
        if batches.is_empty() {
            return;
        }

        let verbose = self.config.verbose;
        let outcomes: Vec<BatchOutcome> = stream::iter(batches)
            .map(|batch| run_batch(batch, verbose))
            .buffer_unordered(self.config.max_concurrent_endpoints)
            .collect()
            .await;

        for outcome in outcomes {
            report.files_sent += outcome.files_sent;
            report.dirs_created += outcome.dirs_created;
            report.entries_removed += outcome.entries_removed;

            if !outcome.failures.is_empty() {
                self.pool.mark_needs_ping(&outcome.endpoint);
                report.failures += outcome.failures.len();
                report
                    .errors
                    .extend(outcome.failures.iter().map(|e| e.to_string()));
            }
        }
    }
}

/// 顺序执行一个端点的所有操作，单个失败不影响后续操作
async fn run_batch(batch: EndpointBatch, verbose: bool) -> BatchOutcome {
    let mut outcome = BatchOutcome {
        endpoint: batch.endpoint,
        files_sent: 0,
        dirs_created: 0,
        entries_removed: 0,
        failures: Vec::new(),
    };
    let session = batch.session.as_ref();

    for op in &batch.ops {
        let result = match op {
            RemoteOp::SendFile { local, remote, .. } => session.send_file(local, remote).await,
            RemoteOp::MakeDir { remote, .. } => session.make_dir(remote).await,
            RemoteOp::RemoveFile { remote, .. } => session.remove_file(remote).await,
            RemoteOp::RemoveDir { remote, .. } => session.remove_dir(remote).await,
        };

        match result {
            Ok(()) => {
                match op {
                    RemoteOp::SendFile { .. } => outcome.files_sent += 1,
                    RemoteOp::MakeDir { .. } => outcome.dirs_created += 1,
                    RemoteOp::RemoveFile { .. } | RemoteOp::RemoveDir { .. } => {
                        outcome.entries_removed += 1
                    }
                }
                if verbose {
                    info!("{} {}  ok", op.symbol(), op.local().display());
                } else {
                    debug!("{} {}  ok", op.symbol(), op.local().display());
                }
            }
            Err(e) => {
                warn!(
                    "{} {}  FAIL ({}): {:#}",
                    op.symbol(),
                    op.local().display(),
                    session.name(),
                    e
                );
                outcome.failures.push(SyncError::Transfer {
                    op: op.symbol(),
                    path: op.local().to_path_buf(),
                    message: format!("{:#}", e),
                });
            }
        }
    }

    outcome
}
