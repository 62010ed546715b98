use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::lanproxy::{
    config,
    conn::Framing,
    logging,
    pool::{ConnectionPool, RelayPooler},
    supervisor::Supervisor,
    telemetry,
    transport::{self, Dialer, tcp::TcpDialer},
    tunnel::Tunnel,
};

pub async fn run(config_path: Option<PathBuf>, overrides: config::Overrides) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let file = if resolved.path.is_file() {
        Some(resolved.path.as_path())
    } else if resolved.source.is_explicit() {
        anyhow::bail!(
            "config: {} not found (from {})",
            resolved.path.display(),
            resolved.source
        );
    } else {
        None
    };

    let cfg = config::load_config(file, &overrides).with_context(|| match file {
        Some(p) => format!("load config: {}", p.display()),
        None => "load config: command line".to_string(),
    })?;

    let _logrt = logging::init(&cfg.logging)?;

    if let Some(addr) = cfg.metrics_addr {
        telemetry::init_prometheus(addr)?;
    }

    let relay_addr = cfg.relay_addr();
    let tls = cfg.tls_options();
    let relay_dialer = transport::relay_dialer(tls.as_ref(), cfg.timing.dial_timeout)?;
    let backend: Arc<dyn Dialer> = Arc::new(TcpDialer::new(cfg.timing.dial_timeout));
    let tunnel = Arc::new(Tunnel::new(cfg.timing.clone(), backend));
    let pool = ConnectionPool::new(
        cfg.pool.capacity,
        Arc::new(RelayPooler::new(
            relay_addr.clone(),
            relay_dialer.clone(),
            tunnel.clone(),
        )),
    );

    tracing::info!(
        config = %file.map(|p| p.display().to_string()).unwrap_or_else(|| "-".into()),
        relay = %relay_addr,
        transport = %relay_dialer.name(),
        tls_verify = tls.as_ref().map(|t| !t.insecure_skip_verify),
        pool_capacity = pool.capacity(),
        pool_warm = cfg.pool.warm,
        heartbeat = %humantime::format_duration(cfg.timing.heartbeat_interval),
        metrics_addr = ?cfg.metrics_addr,
        "lanproxy: starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    // Pool warm-up and health sweep.
    {
        let pool = pool.clone();
        let warm = cfg.pool.warm;
        let every = cfg.timing.heartbeat_interval;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            maintain_pool(pool, warm, every, shutdown).await;
            Ok(())
        });
    }

    // Primary control connection.
    {
        let sup = Supervisor::new(
            cfg.client_key.clone(),
            relay_addr,
            relay_dialer,
            tunnel.clone(),
            pool.clone(),
        );
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { sup.run(shutdown).await });
    }

    let mut result = Ok(());
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => result = Err(err),
                    Err(join_err) => result = Err(join_err.into()),
                }
            }
        }
    }
    let _ = shutdown_tx.send(true);

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    let registry = tunnel.registry();
    let leftover = registry.len();
    for framing in [Framing::Frames, Framing::Raw] {
        for c in registry.connections(framing) {
            c.close().await;
        }
    }
    tracing::info!(closed = leftover, "lanproxy: stopped");

    result
}

async fn maintain_pool(
    pool: Arc<ConnectionPool>,
    warm: usize,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = pool.init(warm) => {}
        _ = shutdown.changed() => return,
    }

    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await;
    loop {
        tokio::select! {
            r = shutdown.changed() => {
                if r.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = tick.tick() => {
                pool.sweep().await;
                let s = pool.stats();
                tracing::debug!(idle = s.idle, active = s.active, dialing = s.dialing, "pool: stats");
            }
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
