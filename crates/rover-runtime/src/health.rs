//! Liveness endpoint.
//!
//! Plain HTTP/1.1 on a raw [`TcpListener`]: `GET /health` answers
//! `200 {"status":"ok"}`, every other request gets a 404. One request per
//! connection.

use std::net::SocketAddr;

use rover_types::RoverError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const HEALTH_PATH: &str = "/health";

const OK_BODY: &str = r#"{"status":"ok"}"#;
const NOT_FOUND_BODY: &str = r#"{"detail":"Not Found"}"#;

/// Bind the health listener on all interfaces.
///
/// # Errors
///
/// Returns [`RoverError::Transport`] if the port cannot be bound.
pub async fn bind(port: u16) -> Result<TcpListener, RoverError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .map_err(|e| RoverError::Transport(format!("health endpoint bind error on {addr}: {e}")))
}

/// Answer health probes until `shutdown` fires.
pub async fn serve(listener: TcpListener, shutdown: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "health endpoint listening");
    }

    loop {
        let accepted = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tokio::spawn(async move {
                    if let Err(e) = respond(stream).await {
                        debug!(%peer, error = %e, "health request failed");
                    }
                });
            }
            Err(e) => warn!(error = %e, "health accept error"),
        }
    }
    debug!("health endpoint stopped");
}

async fn respond(mut stream: TcpStream) -> std::io::Result<()> {
    let mut buf = [0u8; 1024];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);
    let (status, body) = route(&request);

    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len(),
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

fn route(request: &str) -> (&'static str, &'static str) {
    let mut request_line = request.lines().next().unwrap_or_default().split_whitespace();
    match (request_line.next(), request_line.next()) {
        (Some("GET"), Some(HEALTH_PATH)) => ("200 OK", OK_BODY),
        _ => ("404 Not Found", NOT_FOUND_BODY),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn request(addr: SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[test]
    fn only_get_health_is_routed() {
        assert_eq!(route("GET /health HTTP/1.1\r\n\r\n").0, "200 OK");
        assert_eq!(route("GET / HTTP/1.1\r\n\r\n").0, "404 Not Found");
        assert_eq!(route("POST /health HTTP/1.1\r\n\r\n").0, "404 Not Found");
        assert_eq!(route("").0, "404 Not Found");
    }

    #[tokio::test]
    async fn serves_health_over_tcp_until_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        let server = tokio::spawn(serve(listener, token.clone()));

        let ok = request(addr, "GET /health HTTP/1.1\r\nHost: rover\r\n\r\n").await;
        assert!(ok.starts_with("HTTP/1.1 200 OK"), "{ok}");
        assert!(ok.ends_with(r#"{"status":"ok"}"#), "{ok}");

        let missing = request(addr, "GET /metrics HTTP/1.1\r\n\r\n").await;
        assert!(missing.starts_with("HTTP/1.1 404"), "{missing}");

        token.cancel();
        server.await.unwrap();
    }
}
