//! Control server and wake-up loop.
//!
//! The control server speaks newline-delimited JSON over TCP: one
//! [`Request`](crate::protocol::Request) per line in, one
//! [`Response`] per line out. Wake-ups fired by the scheduler are fed back
//! into the controller by [`run_wakeups`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::controller::AccessController;
use crate::error::Result;
use crate::gateway::RuleGateway;
use crate::protocol::{self, Response};
use crate::scheduler::Wakeup;
use crate::store::BypassStore;

/// Parse and execute a single request line.
pub async fn handle_line<S, G>(controller: &AccessController<S, G>, line: &str) -> Response
where
    S: BypassStore,
    G: RuleGateway,
{
    match protocol::parse_request(line) {
        Ok(request) => {
            debug!(?request, "handling request");
            protocol::dispatch(controller, request).await
        }
        Err(err) => {
            debug!(error = %err, "malformed request");
            Response::malformed(&err)
        }
    }
}

/// Accept control connections until the listener fails.
///
/// # Errors
///
/// Returns an error if accepting a connection fails.
pub async fn serve<S, G>(
    listener: TcpListener,
    controller: Arc<AccessController<S, G>>,
) -> Result<()>
where
    S: BypassStore,
    G: RuleGateway,
{
    info!(addr = ?listener.local_addr().ok(), "control server listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer, controller).await {
                warn!(peer = %peer, error = %err, "control connection failed");
            }
        });
    }
}

#[instrument(skip(stream, controller))]
async fn handle_connection<S, G>(
    stream: TcpStream,
    peer: SocketAddr,
    controller: Arc<AccessController<S, G>>,
) -> std::io::Result<()>
where
    S: BypassStore,
    G: RuleGateway,
{
    debug!("client connected");
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&controller, &line).await;
        write_response(&mut writer, &response).await?;
    }

    debug!("client disconnected");
    Ok(())
}

async fn write_response<W>(writer: &mut W, response: &Response) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = serde_json::to_vec(response).map_err(std::io::Error::other)?;
    out.push(b'\n');
    writer.write_all(&out).await?;
    writer.flush().await
}

/// Deliver fired wake-ups to the controller until the scheduler goes away.
pub async fn run_wakeups<S, G>(
    mut wakeups: mpsc::UnboundedReceiver<Wakeup>,
    controller: Arc<AccessController<S, G>>,
) where
    S: BypassStore,
    G: RuleGateway,
{
    while let Some(wakeup) = wakeups.recv().await {
        controller.handle_wakeup(wakeup).await;
    }
    debug!("wake-up channel closed");
}
