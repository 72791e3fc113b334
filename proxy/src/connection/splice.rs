//! Bidirectional relay.
//!
//! Two half-duplex copy loops run in parallel. When one direction reads
//! EOF it shuts down its writer, sending FIN to the remote; the opposite
//! direction then drains naturally. Each direction carries its own idle
//! deadline, and the whole splice can be bounded by a max-lifetime
//! deadline.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::metrics;

const COPY_BUF_SIZE: usize = 8 * 1024;

/// How a splice ended.
#[derive(Debug)]
pub struct SpliceSummary {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
    /// First I/O error observed on either direction, if any.
    pub error: Option<std::io::Error>,
    /// The max-lifetime deadline fired before both directions finished.
    pub expired: bool,
}

/// Relay bytes between client and backend until both directions finish.
pub async fn splice(
    client: TcpStream,
    backend: TcpStream,
    idle: Option<Duration>,
    max_lifetime: Option<Duration>,
) -> SpliceSummary {
    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();

    let c2b = copy_half(client_read, backend_write, idle, "client_to_backend");
    let b2c = copy_half(backend_read, client_write, idle, "backend_to_client");
    let both = async { tokio::join!(c2b, b2c) };

    let lifetime = async {
        match max_lifetime {
            Some(deadline) => tokio::time::sleep(deadline).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        (c2b_result, b2c_result) = both => {
            let (client_to_backend, first_error) = split_result(c2b_result);
            let (backend_to_client, second_error) = split_result(b2c_result);
            SpliceSummary {
                client_to_backend,
                backend_to_client,
                error: first_error.or(second_error),
                expired: false,
            }
        }
        _ = lifetime => SpliceSummary {
            client_to_backend: 0,
            backend_to_client: 0,
            error: None,
            expired: true,
        },
    }
}

fn split_result(result: Result<u64, (u64, std::io::Error)>) -> (u64, Option<std::io::Error>) {
    match result {
        Ok(bytes) => (bytes, None),
        Err((bytes, error)) => (bytes, Some(error)),
    }
}

/// Copy one direction until EOF, error, or idle deadline.
async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    idle: Option<Duration>,
    direction: &'static str,
) -> Result<u64, (u64, std::io::Error)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total: u64 = 0;
    loop {
        let read = async { reader.read(&mut buf).await };
        let n = match idle {
            Some(deadline) => match tokio::time::timeout(deadline, read).await {
                Ok(result) => result,
                Err(_) => {
                    trace!(direction, total, "idle deadline reached");
                    let _ = writer.shutdown().await;
                    return Err((
                        total,
                        std::io::Error::new(std::io::ErrorKind::TimedOut, "relay idle deadline"),
                    ));
                }
            },
            None => read.await,
        };

        let n = match n {
            Ok(0) => {
                // EOF: propagate FIN and let the other direction drain.
                let _ = writer.shutdown().await;
                trace!(direction, total, "relay direction finished");
                return Ok(total);
            }
            Ok(n) => n,
            Err(e) => {
                let _ = writer.shutdown().await;
                return Err((total, e));
            }
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            return Err((total, e));
        }
        total += n as u64;
        metrics::RELAY_BYTES_TOTAL
            .with_label_values(&[direction])
            .inc_by(n as u64);
    }
}
