use anyhow::Result;

use crate::broker::Service;
use crate::cli::StartArgs;
use crate::core::config::Config;
use crate::core::telemetry;

/// Load the config, apply CLI overrides and run the broker until shutdown.
pub async fn run_start(args: StartArgs) -> Result<()> {
    let mut cfg = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        Config::default()
    };
    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }
    if let Some(cluster_self) = args.cluster_self {
        if let Some(cluster) = cfg.cluster.as_mut() {
            cluster.self_name = cluster_self;
        }
    }
    if let Some(varz) = args.varz {
        cfg.varz_path = varz;
    }

    telemetry::init_tracing(Some(&cfg.logging_level))?;
    tracing::info!(context = "main", "using config from {}", args.config.display());

    let service = Service::new(cfg)?;
    let runner = service.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(context = "main", "shutdown requested");
            runner.close();
        }
    });
    service.listen().await
}
