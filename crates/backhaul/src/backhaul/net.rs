use std::{borrow::Cow, time::Duration};

use anyhow::Context;
use tokio::net::TcpStream;

/// Normalize a bind/listen address.
///
/// Config files use the shorthand `":PORT"` for "all interfaces"; Tokio's bind APIs
/// want a host, so it becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    match addr.strip_prefix(':') {
        Some(port) => Cow::Owned(format!("0.0.0.0:{port}")),
        None => Cow::Borrowed(addr),
    }
}

/// Joins a host and port into a dialable address, bracketing bare IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Dials `addr`, bounded by `timeout` unless it is zero.
pub async fn dial_tcp(addr: &str, timeout: Duration) -> anyhow::Result<TcpStream> {
    let conn = if timeout > Duration::ZERO {
        tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("dial timeout {addr}"))?
    } else {
        TcpStream::connect(addr).await
    };
    let conn = conn.with_context(|| format!("dial {addr}"))?;
    let _ = conn.set_nodelay(true);
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8082").as_ref(), "0.0.0.0:8082");
        assert_eq!(normalize_bind_addr(" :8083 ").as_ref(), "0.0.0.0:8083");
        assert_eq!(normalize_bind_addr("[::]:8081").as_ref(), "[::]:8081");
    }

    #[test]
    fn join_host_port_brackets_ipv6() {
        assert_eq!(join_host_port("localhost", 8082), "localhost:8082");
        assert_eq!(join_host_port(" 10.1.2.3 ", 9091), "10.1.2.3:9091");
        assert_eq!(join_host_port("::1", 8083), "[::1]:8083");
        assert_eq!(join_host_port("[::1]", 8083), "[::1]:8083");
    }

    #[tokio::test]
    async fn dial_tcp_reports_address_on_failure() {
        // Bind then drop to get a port that is very likely closed.
        let addr = {
            let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            ln.local_addr().unwrap().to_string()
        };
        let err = dial_tcp(&addr, Duration::from_secs(1)).await.unwrap_err();
        assert!(format!("{err:#}").contains(&addr), "{err:#}");
    }
}
