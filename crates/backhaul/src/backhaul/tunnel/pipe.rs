use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::watch,
};

const COPY_BUFFER_BYTES: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

#[derive(Debug, Default)]
struct CopyOutcome {
    bytes: u64,
    error: Option<std::io::Error>,
}

/// Relays bytes between `a` and `b` until either direction finishes.
///
/// Each direction runs as its own task. Whichever finishes first (EOF or I/O error)
/// signals the other to stop; both write sides are shut down and both streams are
/// dropped once the second task has returned, so nothing outlives the pipe.
pub async fn pipe<A, B>(a: A, b: B) -> PipeStats
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_rd, a_wr) = tokio::io::split(a);
    let (b_rd, b_wr) = tokio::io::split(b);
    let (close_tx, close_rx) = watch::channel(false);

    let mut forward = tokio::spawn(copy_until_closed(a_rd, b_wr, close_rx.clone()));
    let mut backward = tokio::spawn(copy_until_closed(b_rd, a_wr, close_rx));

    let (fwd, bwd) = tokio::select! {
        res = &mut forward => {
            let _ = close_tx.send(true);
            (res, backward.await)
        }
        res = &mut backward => {
            let _ = close_tx.send(true);
            (forward.await, res)
        }
    };

    let fwd = fwd.unwrap_or_else(|err| {
        tracing::warn!(err = %err, "pipe: copy task failed");
        CopyOutcome::default()
    });
    let bwd = bwd.unwrap_or_else(|err| {
        tracing::warn!(err = %err, "pipe: copy task failed");
        CopyOutcome::default()
    });

    for (dir, err) in [("a->b", &fwd.error), ("b->a", &bwd.error)] {
        if let Some(err) = err {
            tracing::debug!(direction = dir, err = %err, "pipe: copy ended with error");
        }
    }

    PipeStats {
        a_to_b: fwd.bytes,
        b_to_a: bwd.bytes,
    }
}

async fn copy_until_closed<R, W>(
    mut rd: R,
    mut wr: W,
    mut closed: watch::Receiver<bool>,
) -> CopyOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_BYTES];
    let mut out = CopyOutcome::default();

    loop {
        let read = tokio::select! {
            _ = closed.changed() => break,
            res = rd.read(&mut buf) => res,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                out.error = Some(err);
                break;
            }
        };

        let written = tokio::select! {
            _ = closed.changed() => break,
            res = wr.write_all(&buf[..n]) => res,
        };
        if let Err(err) = written {
            out.error = Some(err);
            break;
        }
        out.bytes += n as u64;
    }

    let _ = wr.shutdown().await;
    out
}
