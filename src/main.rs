use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dcync_lib::config::JsonConfigStore;
use dcync_lib::core::{EngineConfig, SyncEngine};
use dcync_lib::logging::{LogConfig, SizeRotatingWriter};
use dcync_lib::transport::{LocalTransport, SshTransport, Transport};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "dcync", version, about = "持续把本地项目目录同步到远端主机")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 运行同步循环，直到 Ctrl-C
    Run {
        /// 轮询间隔（毫秒），默认使用全局配置
        #[arg(long, value_name = "MS")]
        interval: Option<u64>,

        /// 输出每个文件的同步结果
        #[arg(short, long)]
        verbose: bool,

        /// 同步到本地目录（<DIR>/<host>/<path>）而不是 SSH 远端
        #[arg(long, value_name = "DIR")]
        local_root: Option<PathBuf>,
    },
}

/// 初始化日志系统，返回的 guard 需要保持到进程结束
fn init_logging(global_config: &Path, log_dir: &Path, verbose: bool) -> Option<WorkerGuard> {
    let config = LogConfig::load(global_config);

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(config.tracing_level(verbose).into());

    // 文件日志层，创建失败时只输出到控制台
    let mut file_error = None;
    let (file_layer, guard) = if config.enabled {
        match SizeRotatingWriter::new(log_dir, config.max_size_mb) {
            Ok(file_writer) => {
                let (writer, guard) = tracing_appender::non_blocking(file_writer);
                let layer = tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false);
                (Some(layer), Some(guard))
            }
            Err(e) => {
                file_error = Some(e);
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);

    if let Some(e) = file_error {
        warn!("无法创建日志文件 {}: {}", log_dir.display(), e);
    }

    guard
}

async fn run(interval: Option<u64>, verbose: bool, local_root: Option<PathBuf>) -> Result<()> {
    let store = Arc::new(JsonConfigStore::from_home()?);
    let _guard = init_logging(store.global_path(), &dcync_lib::dirs::log_dir(), verbose);

    let global = store
        .load_global()
        .with_context(|| format!("无法读取全局配置 {}", store.global_path().display()))?;

    let mut run_config = global.run.clone();
    if let Some(ms) = interval {
        run_config.interval_ms = ms;
    }

    let transport: Arc<dyn Transport> = match local_root {
        Some(root) => {
            let local = LocalTransport::new(root)?;
            info!("同步到本地目录: {}", local.base_path().display());
            Arc::new(local)
        }
        None => Arc::new(SshTransport::new(
            &run_config.ssh,
            Duration::from_secs(run_config.connect_timeout_secs),
            Duration::from_secs(run_config.op_timeout_secs),
        )?),
    };
    info!(
        "使用传输: {}, 已注册 {} 个项目",
        transport.name(),
        global.projects.len()
    );

    let mut engine = SyncEngine::new(
        store.clone(),
        store,
        transport,
        EngineConfig::from_run(&run_config, verbose),
    );

    let cancel = engine.cancel_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("收到中断信号，本轮结束后退出");
                cancel.store(true, Ordering::SeqCst);
            }
            Err(e) => error!("无法监听中断信号: {}", e),
        }
    });

    engine.run().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            interval,
            verbose,
            local_root,
        } => run(interval, verbose, local_root).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_logging_file_layer_follows_config() {
        let dir = TempDir::new().unwrap();
        let global = dir.path().join(".dcync");
        let log_dir = dir.path().join("logs");

        std::fs::write(&global, r#"{"log": {"enabled": false}}"#).unwrap();
        assert!(init_logging(&global, &log_dir, false).is_none());
        assert!(!log_dir.join("app.log").exists());

        std::fs::write(&global, r#"{"log": {"enabled": true, "level": "info"}}"#).unwrap();
        let guard = init_logging(&global, &log_dir, true);
        assert!(guard.is_some());
        assert!(log_dir.join("app.log").is_file());
    }

    #[test]
    fn test_cli_parses_run_options() {
        let cli = Cli::parse_from([
            "dcync",
            "run",
            "--interval",
            "250",
            "-v",
            "--local-root",
            "/tmp/m",
        ]);
        match cli.command {
            Command::Run {
                interval,
                verbose,
                local_root,
            } => {
                assert_eq!(interval, Some(250));
                assert!(verbose);
                assert_eq!(local_root, Some(PathBuf::from("/tmp/m")));
            }
        }
    }
}
