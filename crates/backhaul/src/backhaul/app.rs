use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::backhaul::{
    admin, config, logging, net, telemetry,
    tunnel::{agent, broker},
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    if cfg.broker.is_none() && cfg.agent.is_none() {
        anyhow::bail!("config: nothing to run (add a [broker] and/or [agent] section)");
    }

    tracing::info!(
        config = %resolved.path.display(),
        broker_enabled = cfg.broker.is_some(),
        agent_enabled = cfg.agent.is_some(),
        admin_addr = %cfg.admin_addr,
        "backhaul: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let sessions = Arc::new(telemetry::SessionRegistry::new());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    let mut admin_state = admin::AdminState {
        prom,
        sessions: sessions.clone(),
        pending: None,
        control: None,
    };

    // Broker: bind before spawning so port conflicts fail startup.
    if let Some(bc) = &cfg.broker {
        let b = broker::Broker::bind(
            broker::BrokerOptions {
                control_addr: bc.control_addr.clone(),
                proxy_addr: bc.proxy_addr.clone(),
                transfer_addr: bc.transfer_addr.clone(),
                pending_ttl: bc.pending_ttl,
                reap_interval: bc.reap_interval,
                handshake_timeout: bc.handshake_timeout,
                max_key_bytes: bc.max_key_bytes,
            },
            sessions.clone(),
        )
        .await?;

        admin_state.pending = Some(b.registry());
        admin_state.control = Some(b.control());

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { b.serve(shutdown).await });
    }

    if let Some(ac) = &cfg.agent {
        let a = agent::Agent::new(
            agent::AgentOptions {
                control_addr: ac.control_addr(),
                transfer_addr: ac.transfer_addr(),
                local_addr: ac.local_addr.clone(),
                dial_timeout: ac.dial_timeout,
            },
            sessions.clone(),
        )?;

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { a.run(shutdown).await });
    }

    if !cfg.admin_addr.is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    // Stop on a signal or when any role ends (the agent ends when its control session does).
    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            Ok(())
        }
        res = tasks.join_next() => match res {
            Some(Ok(res)) => res,
            Some(Err(join_err)) => Err(join_err.into()),
            None => Ok(()),
        },
    };
    let _ = shutdown_tx.send(true);

    let drain = async {
        while let Some(res) = tasks.join_next().await {
            if let Ok(Err(err)) = res {
                tracing::debug!(err = %format!("{err:#}"), "shutdown: task ended with error");
            }
        }
    };

    // Hard cap so a stuck pipe cannot hold the process open.
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("shutdown: drain timed out; aborting remaining tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    outcome
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
