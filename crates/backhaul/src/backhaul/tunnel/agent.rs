use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    sync::watch,
};

use crate::backhaul::{
    net, telemetry,
    tunnel::{
        pipe,
        protocol::{self, ControlMessage},
    },
};

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub control_addr: String,
    pub transfer_addr: String,
    pub local_addr: String,
    pub dial_timeout: Duration,
}

/// The NAT-side half of the tunnel: keeps the control connection open and completes one
/// tunnel per notify.
pub struct Agent {
    opts: Arc<AgentOptions>,
    sessions: telemetry::SharedSessions,
    id_seq: AtomicU64,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// A zero `dial_timeout` dials without a bound.
    pub fn new(opts: AgentOptions, sessions: telemetry::SharedSessions) -> anyhow::Result<Self> {
        for (field, v) in [
            ("control_addr", &opts.control_addr),
            ("transfer_addr", &opts.transfer_addr),
            ("local_addr", &opts.local_addr),
        ] {
            if v.trim().is_empty() {
                anyhow::bail!("agent: {field} is required");
            }
        }
        Ok(Self {
            opts: Arc::new(opts),
            sessions,
            id_seq: AtomicU64::new(1),
        })
    }

    /// Connects once and serves notifies until the control session ends.
    ///
    /// A clean close by the broker returns `Ok`; a read failure returns the error. Either
    /// way the caller is expected to exit: there is no reconnect.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let ctl = net::dial_tcp(&self.opts.control_addr, self.opts.dial_timeout)
            .await
            .context("agent: connect control")?;
        tracing::info!(
            control = %self.opts.control_addr,
            transfer = %self.opts.transfer_addr,
            local = %self.opts.local_addr,
            "agent: connected"
        );

        let mut rd = BufReader::new(ctl);
        loop {
            // Only a stop request may cancel the read; a partial line would be lost.
            let msg = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
                msg = protocol::read_control_message(&mut rd) => msg,
            };

            match msg {
                Ok(Some(ControlMessage::NewConnection { key })) => self.spawn_tunnel(key),
                Ok(Some(ControlMessage::KeepAlive)) => {}
                Ok(Some(ControlMessage::Unknown(line))) => {
                    tracing::debug!(line = %line, "agent: ignoring unknown control line");
                }
                Ok(None) => {
                    tracing::info!("agent: control session closed by broker");
                    return Ok(());
                }
                Err(err) => return Err(err).context("agent: control session read failed"),
            }
        }
    }

    fn spawn_tunnel(&self, key: String) {
        let n = self.id_seq.fetch_add(1, Ordering::Relaxed);
        let sid = format!("a-{n}");
        let opts = self.opts.clone();
        let sessions = self.sessions.clone();

        tracing::debug!(sid = %sid, key = %key, "agent: new connection");
        tokio::spawn(async move {
            if let Err(err) = complete_tunnel(&opts, &sessions, &sid, &key).await {
                tracing::warn!(sid = %sid, key = %key, err = %format!("{err:#}"), "agent: tunnel failed");
            }
        });
    }
}

async fn complete_tunnel(
    opts: &AgentOptions,
    sessions: &telemetry::SessionRegistry,
    sid: &str,
    key: &str,
) -> anyhow::Result<()> {
    let mut transfer = net::dial_tcp(&opts.transfer_addr, opts.dial_timeout)
        .await
        .context("connect transfer")?;
    protocol::write_claim(&mut transfer, key)
        .await
        .context("send claim")?;

    let local = match net::dial_tcp(&opts.local_addr, opts.dial_timeout).await {
        Ok(c) => c,
        Err(err) => {
            let _ = transfer.shutdown().await;
            return Err(err.context("connect local service"));
        }
    };

    sessions.add(telemetry::SessionInfo {
        id: sid.to_string(),
        client: key.to_string(),
        upstream: opts.local_addr.clone(),
        started_at_unix_ms: telemetry::now_unix_ms(),
    });
    let stats = {
        let _active = telemetry::ActivePipeGuard::new();
        pipe::pipe(transfer, local).await
    };
    sessions.remove(sid);

    metrics::counter!("backhaul_bytes_ingress_total").increment(stats.a_to_b);
    metrics::counter!("backhaul_bytes_egress_total").increment(stats.b_to_a);
    tracing::debug!(
        sid = %sid,
        key = %key,
        ingress = stats.a_to_b,
        egress = stats.b_to_a,
        "agent: tunnel closed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::AsyncReadExt,
        net::{TcpListener, TcpStream},
    };

    use super::*;
    use crate::backhaul::tunnel::broker::{Broker, BrokerAddrs, BrokerOptions};

    struct Stack {
        addrs: BrokerAddrs,
        agent_sessions: telemetry::SharedSessions,
        shutdown: watch::Sender<bool>,
        agent: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    /// Broker on loopback plus an agent pointed at `local_addr`, with the control session
    /// already established.
    async fn start_stack(local_addr: String) -> Stack {
        let broker = Broker::bind(
            BrokerOptions {
                control_addr: "127.0.0.1:0".into(),
                proxy_addr: "127.0.0.1:0".into(),
                transfer_addr: "127.0.0.1:0".into(),
                ..BrokerOptions::default()
            },
            Arc::new(telemetry::SessionRegistry::new()),
        )
        .await
        .unwrap();
        let addrs = broker.local_addrs();
        let control = broker.control();

        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(broker.serve(rx.clone()));

        let agent_sessions = Arc::new(telemetry::SessionRegistry::new());
        let agent = Agent::new(
            AgentOptions {
                control_addr: addrs.control.to_string(),
                transfer_addr: addrs.transfer.to_string(),
                local_addr,
                dial_timeout: Duration::from_secs(2),
            },
            agent_sessions.clone(),
        )
        .unwrap();
        let agent = tokio::spawn(async move { agent.run(rx).await });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while control.snapshot().await.is_none() {
            assert!(tokio::time::Instant::now() < deadline, "agent never connected");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        Stack {
            addrs,
            agent_sessions,
            shutdown,
            agent,
        }
    }

    async fn echo_service() -> (String, tokio::task::JoinHandle<()>) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            loop {
                let Ok((conn, _)) = ln.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let (mut rd, mut wr) = conn.into_split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        (addr, task)
    }

    #[tokio::test]
    async fn public_bytes_reach_local_service_and_back() {
        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stack = start_stack(local.local_addr().unwrap().to_string()).await;

        let mut consumer = TcpStream::connect(stack.addrs.proxy).await.unwrap();
        consumer.write_all(b"ping").await.unwrap();

        let (mut svc, _) = tokio::time::timeout(Duration::from_secs(2), local.accept())
            .await
            .expect("agent never dialed the local service")
            .unwrap();
        let mut buf = [0u8; 4];
        svc.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        svc.write_all(b"pong").await.unwrap();
        consumer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        assert_eq!(stack.agent_sessions.len(), 1);

        drop(svc);
        let n = tokio::time::timeout(Duration::from_secs(2), consumer.read(&mut buf))
            .await
            .expect("consumer not closed after local service hung up")
            .unwrap_or(0);
        assert_eq!(n, 0);

        let _ = stack.shutdown.send(true);
        tokio::time::timeout(Duration::from_secs(2), stack.agent)
            .await
            .expect("agent did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_tunnels_do_not_mix_bytes() {
        let (local_addr, _svc) = echo_service().await;
        let stack = start_stack(local_addr).await;

        let mut clients = tokio::task::JoinSet::new();
        for tag in [b'a', b'b'] {
            let proxy = stack.addrs.proxy;
            clients.spawn(async move {
                let mut c = TcpStream::connect(proxy).await.unwrap();
                let payload = vec![tag; 200 * 1024];
                let (mut rd, mut wr) = c.split();
                let send = async {
                    wr.write_all(&payload).await.unwrap();
                };
                let recv = async {
                    let mut got = vec![0u8; payload.len()];
                    rd.read_exact(&mut got).await.unwrap();
                    got
                };
                let ((), got) = tokio::join!(send, recv);
                assert!(got.iter().all(|b| *b == tag), "stream {} saw foreign bytes", tag as char);
            });
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(res) = clients.join_next().await {
                res.unwrap();
            }
        })
        .await
        .expect("tunnels stalled");

        let _ = stack.shutdown.send(true);
    }

    #[tokio::test]
    async fn control_eof_ends_the_agent() {
        let ctl = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let agent = Agent::new(
            AgentOptions {
                control_addr: ctl.local_addr().unwrap().to_string(),
                transfer_addr: "127.0.0.1:1".into(),
                local_addr: "127.0.0.1:1".into(),
                dial_timeout: Duration::from_secs(1),
            },
            Arc::new(telemetry::SessionRegistry::new()),
        )
        .unwrap();

        let (_tx, rx) = watch::channel(false);
        let run = tokio::spawn(async move { agent.run(rx).await });

        let (conn, _) = ctl.accept().await.unwrap();
        drop(conn);

        tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("agent kept running without a control session")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn zero_dial_timeout_means_unbounded() {
        let agent = Agent::new(
            AgentOptions {
                control_addr: "127.0.0.1:1".into(),
                transfer_addr: "127.0.0.1:1".into(),
                local_addr: "127.0.0.1:1".into(),
                dial_timeout: Duration::ZERO,
            },
            Arc::new(telemetry::SessionRegistry::new()),
        )
        .unwrap();
        assert_eq!(agent.opts.dial_timeout, Duration::ZERO);
    }

    #[tokio::test]
    async fn shutdown_update_mid_line_keeps_the_notify() {
        let ctl = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let transfer = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let agent = Agent::new(
            AgentOptions {
                control_addr: ctl.local_addr().unwrap().to_string(),
                transfer_addr: transfer.local_addr().unwrap().to_string(),
                local_addr: "127.0.0.1:1".into(),
                dial_timeout: Duration::from_secs(1),
            },
            Arc::new(telemetry::SessionRegistry::new()),
        )
        .unwrap();

        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn(async move { agent.run(rx).await });

        let (mut control, _) = ctl.accept().await.unwrap();
        control.write_all(b"NEW_CONN").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(false).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        control
            .write_all(b"ECTION\n203.0.113.5:41000\n")
            .await
            .unwrap();

        let (mut leg, _) = tokio::time::timeout(Duration::from_secs(2), transfer.accept())
            .await
            .expect("notify split across a shutdown update was lost")
            .unwrap();
        let mut got = String::new();
        tokio::time::timeout(Duration::from_secs(2), leg.read_to_string(&mut got))
            .await
            .expect("transfer leg left open")
            .unwrap();
        assert_eq!(got, "203.0.113.5:41000\n");

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("agent did not stop on shutdown")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn local_dial_failure_closes_only_that_tunnel() {
        let ctl = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let transfer = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_port = {
            let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
            ln.local_addr().unwrap().to_string()
        };

        let agent = Agent::new(
            AgentOptions {
                control_addr: ctl.local_addr().unwrap().to_string(),
                transfer_addr: transfer.local_addr().unwrap().to_string(),
                local_addr: closed_port,
                dial_timeout: Duration::from_secs(1),
            },
            Arc::new(telemetry::SessionRegistry::new()),
        )
        .unwrap();

        let (_tx, rx) = watch::channel(false);
        let run = tokio::spawn(async move { agent.run(rx).await });

        let (mut control, _) = ctl.accept().await.unwrap();
        protocol::write_notify(&mut control, "203.0.113.9:40000")
            .await
            .unwrap();

        let (mut leg, _) = tokio::time::timeout(Duration::from_secs(2), transfer.accept())
            .await
            .expect("agent never opened a transfer connection")
            .unwrap();
        let mut got = String::new();
        tokio::time::timeout(Duration::from_secs(2), leg.read_to_string(&mut got))
            .await
            .expect("transfer leg left open")
            .unwrap();
        assert_eq!(got, "203.0.113.9:40000\n");

        assert!(!run.is_finished(), "agent exited on a per-tunnel failure");
        drop(control);
        tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("agent did not exit")
            .unwrap()
            .unwrap();
    }
}
