// OHLCV 采集服务主程序 - 按成交额选出目标品种，周期性拉取最近的K线并写入 SQLite
use ohlcv_fetcher::klcommon::{logging_setup::init_logging, BybitClient, ExchangeClient, FetcherConfig, OhlcvRepository};
use ohlcv_fetcher::klfetch::Orchestrator;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// 命令行参数
#[derive(Debug, Parser)]
#[command(name = "ohlcv_fetcher", version, about = "Bybit OHLCV 采集服务")]
struct Args {
    /// 配置文件路径（默认读取 CONFIG_PATH，文件不存在时使用环境变量）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 只执行一轮采集后退出
    #[arg(long)]
    once: bool,

    /// 启动时忽略缓存，强制重新选择目标品种
    #[arg(long)]
    refresh_symbols: bool,

    /// 日志过滤规则，例如 "debug" 或 "info,ohlcv_fetcher=debug"
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = FetcherConfig::load(args.config.as_deref()).context("加载配置失败")?;

    // 持有 guard，直到 main 函数结束，确保日志被完整写入文件
    let _log_guard = init_logging(&config, args.log_level.as_deref()).context("初始化日志失败")?;

    info!(
        target: "fetcher",
        timeframes = ?config.timeframes,
        concurrency_limit = config.concurrency_limit,
        fetch_interval_seconds = config.fetch_interval_seconds,
        ohlcv_history_limit = config.ohlcv_history_limit,
        top_symbols_count = config.top_symbols_count,
        db_path = %config.db_path.display(),
        "OHLCV 采集服务启动"
    );

    let repository = OhlcvRepository::new(&config.db_path).context("打开数据库失败")?;
    repository.ensure_tables(&config.timeframes).context("创建数据表失败")?;

    let client: Arc<dyn ExchangeClient> = Arc::new(
        BybitClient::new(&config.base_url, &config.quote_suffix, config.request_timeout())
            .context("创建API客户端失败")?,
    );

    let once = args.once;
    let orchestrator = Orchestrator::new(config, client, repository);

    if args.refresh_symbols {
        if let Err(e) = orchestrator.selector().refresh(chrono::Utc::now()).await {
            warn!(target: "fetcher", "启动时刷新目标品种失败: {}", e);
        }
    }

    if once {
        let report = orchestrator.run_cycle(chrono::Utc::now()).await;
        return match report {
            Ok(report) => {
                info!(
                    target: "fetcher",
                    symbols = report.target_count,
                    fetch_failures = report.fetch_failures(),
                    storage_failures = report.storage_failures(),
                    "单轮采集完成"
                );
                Ok(())
            },
            Err(e) => {
                error!(target: "fetcher", "单轮采集失败: {}", e);
                Err(e.into())
            }
        };
    }

    // Ctrl-C 监听放在独立任务里，采集过程中收到的信号也不会丢失
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!(target: "fetcher", "收到 Ctrl-C");
                let _ = shutdown_tx.send(());
            },
            Err(e) => {
                // 无法监听信号时继续运行，sender 必须保持存活
                error!(target: "fetcher", "监听 Ctrl-C 失败: {}", e);
                let _keep = shutdown_tx;
                std::future::pending::<()>().await;
            }
        }
    });

    orchestrator
        .run_forever(async {
            let _ = shutdown_rx.await;
        })
        .await;

    let stats = orchestrator.stats();
    info!(target: "fetcher", completed = stats.completed, failed = stats.failed, "OHLCV 采集服务已停止");
    Ok(())
}
