use crate::bus::BusEvent;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc::Sender;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Accepts bus connections and turns their newline-delimited JSON into
/// [`BusEvent`]s for the engine.
pub struct EventFeed {
    listener: TcpListener,
    event_sender: Sender<BusEvent>,
}

impl EventFeed {
    pub fn new(listener: TcpListener, event_sender: Sender<BusEvent>) -> Self {
        Self {
            listener,
            event_sender,
        }
    }

    /// Spawns the accept loop in its own task
    pub fn spawn(self) {
        tokio::spawn(async move {
            self.run().await;
        });
    }

    async fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!("Event feed listening on {addr}"),
            Err(e) => warn!("Event feed listening on unknown address: {e}"),
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let sender = self.event_sender.clone();
                    tokio::spawn(async move {
                        forward_events(stream, peer_addr, sender).await;
                    });
                }
                Err(e) => accept_failed(e).await,
            }
            if self.event_sender.is_closed() {
                break;
            }
        }
        info!("Engine gone, event feed exiting");
    }
}

/// Logs a failed accept and waits before the next one.
async fn accept_failed(error: io::Error) {
    warn!("Event feed accept failed: {error}, retrying in {ACCEPT_RETRY_DELAY:?}");
    sleep(ACCEPT_RETRY_DELAY).await;
}

/// Forwards every parseable line of one connection. Bad lines are skipped; the
/// connection ends on EOF, on a read error, or when the engine stops.
pub async fn forward_events<R>(reader: R, origin: SocketAddr, sender: Sender<BusEvent>)
where
    R: AsyncRead + Unpin,
{
    debug!("Event feed connection from {origin}");
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Event feed read error from {origin}: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_event(&line) {
            Ok(event) => {
                if sender.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!("Skipping malformed event from {origin}: {e} ({line})"),
        }
    }
    debug!("Event feed connection from {origin} closed");
}

pub fn parse_event(line: &str) -> Result<BusEvent, serde_json::Error> {
    serde_json::from_str(line.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusValue, PeerId};
    use tokio::sync::mpsc;

    fn origin() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_forwards_valid_lines_and_skips_bad_ones() {
        let input = concat!(
            r#"{"event":"discovered","id":":1.3","service":"com.victronenergy.dcload"}"#,
            "\n",
            "not json at all\n",
            "\n",
            r#"{"event":"exploded","id":":1.3"}"#,
            "\n",
            r#"{"event":"changed","id":":1.3","path":"/Dc/0/Power","value":null}"#,
            "\n",
            r#"{"event":"lost","id":":1.3"}"#,
        );
        let (tx, mut rx) = mpsc::channel(8);

        forward_events(input.as_bytes(), origin(), tx).await;

        assert_eq!(
            rx.recv().await,
            Some(BusEvent::Discovered {
                id: PeerId::new(":1.3"),
                service: "com.victronenergy.dcload".to_string(),
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(BusEvent::Changed {
                id: PeerId::new(":1.3"),
                path: "/Dc/0/Power".to_string(),
                value: BusValue::Invalid,
            })
        );
        assert_eq!(rx.recv().await, Some(BusEvent::Lost { id: ":1.3".into() }));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_stops_when_engine_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let input = r#"{"event":"lost","id":"a"}"#;

        tokio_test::assert_ready!(tokio_test::task::spawn(forward_events(
            input.as_bytes(),
            origin(),
            tx
        ))
        .poll());
    }

    #[tokio::test]
    async fn test_accept_failure_waits_before_retrying() {
        let mut backoff = tokio_test::task::spawn(accept_failed(io::Error::other("EMFILE")));
        tokio_test::assert_pending!(backoff.poll());

        sleep(ACCEPT_RETRY_DELAY + Duration::from_millis(20)).await;
        tokio_test::assert_ready!(backoff.poll());
    }

    #[test]
    fn test_parse_event_trims_whitespace() {
        let event = parse_event("  {\"event\":\"lost\",\"id\":\"x\"}\r").unwrap();
        assert_eq!(event, BusEvent::Lost { id: "x".into() });
    }
}
