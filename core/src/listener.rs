//! Newline-delimited-JSON TCP listener feeding the inbound channel.
//!
//! Each line is one `AlertEvent`; only `ACTIVE` and `CLEARED` are
//! accepted from the wire. Malformed lines are logged and skipped so a
//! misbehaving probe cannot take the listener down.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{AlertEvent, EventType};

/// Accept connections until shutdown. Binding happens before this is
/// called so an unusable address fails startup.
pub async fn serve(
    listener: TcpListener,
    events: mpsc::Sender<AlertEvent>,
    token: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("listening for alert events on {addr}");
    }
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("listener connection from {peer}");
                        let events = events.clone();
                        let token = token.clone();
                        tokio::spawn(handle_connection(stream, events, token));
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
            _ = token.cancelled() => return,
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    events: mpsc::Sender<AlertEvent>,
    token: CancellationToken,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<AlertEvent>(&line) {
                            Ok(event) => {
                                if !matches!(event.event_type, EventType::Active | EventType::Cleared) {
                                    warn!("listener rejecting inbound {} event", event.event_type);
                                    continue;
                                }
                                if events.send(event).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!("discarding malformed alert event: {e}"),
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        debug!("listener connection error: {e}");
                        return;
                    }
                }
            }
            _ = token.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn forwards_valid_events_and_skips_garbage() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        tokio::spawn(serve(listener, tx, token.clone()));

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(
            concat!(
                "this is not json\n",
                r#"{"alert":{"name":"BGP Down","source":"bgpmon","entity":"r1","severity":"INFO"},"type":"ACTIVE"}"#,
                "\n",
                r#"{"alert":{"name":"BGP Down","source":"bgpmon","entity":"r1","severity":"INFO"},"type":"ESCALATED"}"#,
                "\n",
                r#"{"alert":{"name":"BGP Down","source":"bgpmon","entity":"r1","severity":"INFO"},"type":"CLEARED"}"#,
                "\n",
            )
            .as_bytes(),
        )
        .await
        .unwrap();
        conn.shutdown().await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type, EventType::Active);
        assert_eq!(first.alert.severity, Severity::Info);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event_type, EventType::Cleared);
        token.cancel();
    }
}
