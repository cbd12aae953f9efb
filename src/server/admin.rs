//! Minimal admin HTTP surface (design §0): `/healthz` and a plain-text
//! stats line, no Prometheus exporter — operability without pulling in a
//! metrics stack the spec never calls for.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::proxy::egress::EgressHandler;

/// Shared counters the admin endpoint reports on; cheap enough to read on
/// every request without a dedicated snapshot step.
pub struct AdminState {
    pub egress: Option<Arc<EgressHandler>>,
}

pub async fn run(listen: &str, state: Arc<AdminState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!(%listen, "admin: listening");
    loop {
        let (socket, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_one(socket, &state).await {
                warn!(%peer, error = %e, "admin: connection error");
            }
        });
    }
}

async fn serve_one(mut socket: TcpStream, state: &AdminState) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 4096];
    let n = socket.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);
    let path = request.lines().next().and_then(|line| line.split_whitespace().nth(1)).unwrap_or("/");

    let body = match path {
        "/healthz" => "ok\n".to_string(),
        "/stats" => render_stats(state),
        _ => {
            socket.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await?;
            return Ok(());
        }
    };

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    socket.write_all(response.as_bytes()).await?;
    Ok(())
}

fn render_stats(state: &AdminState) -> String {
    match &state.egress {
        Some(egress) => format!(
            "egress_hosts_tracked {}\nrequests_forwarded {}\nrequests_rejected {}\n",
            egress.hosts.len(),
            egress.requests_forwarded.load(Ordering::Relaxed),
            egress.requests_rejected.load(Ordering::Relaxed),
        ),
        None => "egress_hosts_tracked 0\nrequests_forwarded 0\nrequests_rejected 0\n".to_string(),
    }
}
