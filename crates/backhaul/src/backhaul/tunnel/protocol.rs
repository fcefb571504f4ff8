use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Control tag announcing a new pending public connection; the key follows on the next line.
pub const NEW_CONNECTION: &str = "NEW_CONNECTION";
/// Reserved keep-alive tag. Never sent; ignored on receipt.
pub const KEEP_ALIVE: &str = "KEEP_LIVE";

pub const DEFAULT_MAX_KEY_BYTES: usize = 256;
pub const MAX_CONTROL_LINE_BYTES: usize = 4 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("empty key")]
    EmptyKey,
    #[error("connection closed before line terminator")]
    UnexpectedEof,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    NewConnection { key: String },
    KeepAlive,
    Unknown(String),
}

/// Writes a notify (`NEW_CONNECTION` + key) as a single buffer so concurrent writers
/// serialized by the caller never interleave half messages.
pub async fn write_notify<W: AsyncWrite + Unpin>(w: &mut W, key: &str) -> Result<(), ProtocolError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(ProtocolError::EmptyKey);
    }
    let msg = format!("{NEW_CONNECTION}\n{key}\n");
    w.write_all(msg.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Reads the next control message. `Ok(None)` means the peer closed the session cleanly.
pub async fn read_control_message<R: AsyncBufRead + Unpin>(
    r: &mut R,
) -> Result<Option<ControlMessage>, ProtocolError> {
    let Some(tag) = read_line(r, MAX_CONTROL_LINE_BYTES).await? else {
        return Ok(None);
    };

    match tag.as_str() {
        NEW_CONNECTION => {
            let key = read_line(r, MAX_CONTROL_LINE_BYTES)
                .await?
                .ok_or(ProtocolError::UnexpectedEof)?;
            if key.is_empty() {
                return Err(ProtocolError::EmptyKey);
            }
            Ok(Some(ControlMessage::NewConnection { key }))
        }
        KEEP_ALIVE => Ok(Some(ControlMessage::KeepAlive)),
        _ => Ok(Some(ControlMessage::Unknown(tag))),
    }
}

pub async fn write_claim<W: AsyncWrite + Unpin>(w: &mut W, key: &str) -> Result<(), ProtocolError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(ProtocolError::EmptyKey);
    }
    let mut line = Vec::with_capacity(key.len() + 1);
    line.extend_from_slice(key.as_bytes());
    line.push(b'\n');
    w.write_all(&line).await?;
    w.flush().await?;
    Ok(())
}

/// Reads the single claim line sent on a fresh transfer connection.
///
/// The reader is consumed one byte at a time so that nothing past the terminator is
/// buffered away from the stream that is about to be piped.
pub async fn read_claim<R: AsyncRead + Unpin>(
    r: &mut R,
    max_bytes: usize,
) -> Result<String, ProtocolError> {
    let mut buf = Vec::with_capacity(64);
    loop {
        let b = match r.read_u8().await {
            Ok(b) => b,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ProtocolError::UnexpectedEof);
            }
            Err(err) => return Err(err.into()),
        };
        if b == b'\n' {
            break;
        }
        if buf.len() >= max_bytes {
            return Err(ProtocolError::LineTooLong(max_bytes));
        }
        buf.push(b);
    }

    let key = trim_terminator(&String::from_utf8_lossy(&buf)).to_string();
    if key.is_empty() {
        return Err(ProtocolError::EmptyKey);
    }
    Ok(key)
}

async fn read_line<R: AsyncBufRead + Unpin>(
    r: &mut R,
    max_bytes: usize,
) -> Result<Option<String>, ProtocolError> {
    let mut buf = Vec::new();
    let n = (&mut *r).take(max_bytes as u64 + 1).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() > max_bytes {
            return Err(ProtocolError::LineTooLong(max_bytes));
        }
        return Err(ProtocolError::UnexpectedEof);
    }
    Ok(Some(trim_terminator(&String::from_utf8_lossy(&buf)).to_string()))
}

fn trim_terminator(s: &str) -> &str {
    let s = s.strip_suffix('\n').unwrap_or(s);
    s.strip_suffix('\r').unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn notify_is_two_lines() {
        let (mut a, mut b) = tokio::io::duplex(128);
        write_notify(&mut a, "203.0.113.7:51000").await.unwrap();
        drop(a);

        let mut got = String::new();
        b.read_to_string(&mut got).await.unwrap();
        assert_eq!(got, "NEW_CONNECTION\n203.0.113.7:51000\n");
    }

    #[tokio::test]
    async fn control_stream_yields_messages_then_eof() {
        let (mut a, b) = tokio::io::duplex(256);
        tokio::spawn(async move {
            a.write_all(b"KEEP_LIVE\nNEW_CONNECTION\n10.0.0.1:4000\r\nHELLO\n")
                .await
                .unwrap();
        });

        let mut r = BufReader::new(b);
        assert_eq!(
            read_control_message(&mut r).await.unwrap(),
            Some(ControlMessage::KeepAlive)
        );
        assert_eq!(
            read_control_message(&mut r).await.unwrap(),
            Some(ControlMessage::NewConnection {
                key: "10.0.0.1:4000".into()
            })
        );
        assert_eq!(
            read_control_message(&mut r).await.unwrap(),
            Some(ControlMessage::Unknown("HELLO".into()))
        );
        assert_eq!(read_control_message(&mut r).await.unwrap(), None);
    }

    #[tokio::test]
    async fn tag_without_key_is_unexpected_eof() {
        let (mut a, b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            a.write_all(b"NEW_CONNECTION\n").await.unwrap();
        });

        let mut r = BufReader::new(b);
        let err = read_control_message(&mut r).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedEof), "{err:?}");
    }

    #[tokio::test]
    async fn claim_leaves_trailing_bytes_on_the_stream() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            a.write_all(b"127.0.0.1:9000\nping").await.unwrap();
        });

        let key = read_claim(&mut b, DEFAULT_MAX_KEY_BYTES).await.unwrap();
        assert_eq!(key, "127.0.0.1:9000");

        let mut rest = [0u8; 4];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"ping");
    }

    #[tokio::test]
    async fn claim_rejects_oversized_and_empty_lines() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            a.write_all(&[b'x'; 64]).await.unwrap();
        });
        let err = read_claim(&mut b, 16).await.unwrap_err();
        assert!(matches!(err, ProtocolError::LineTooLong(16)), "{err:?}");

        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            a.write_all(b"\r\n").await.unwrap();
        });
        let err = read_claim(&mut b, 16).await.unwrap_err();
        assert!(matches!(err, ProtocolError::EmptyKey), "{err:?}");
    }

    #[tokio::test]
    async fn claim_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move { write_claim(&mut a, " 192.0.2.1:1234 ").await });
        let key = read_claim(&mut b, DEFAULT_MAX_KEY_BYTES).await.unwrap();
        assert_eq!(key, "192.0.2.1:1234");
    }
}
