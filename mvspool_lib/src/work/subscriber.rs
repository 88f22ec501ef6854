// Copyright (C) 2024, 2025 MVSPool Developers (see AUTHORS)
//
// This file is part of MVSPool
//
// MVSPool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// MVSPool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// MVSPool. If not, see <https://www.gnu.org/licenses/>.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Delay before redialing after any websocket failure.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// The daemon sends this many acknowledgement frames right after the dial,
/// before it will accept a subscribe request.
const HANDSHAKE_ACKS: usize = 2;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle of the push subscription. Transitions happen on I/O
/// results only; every failure funnels through `Backoff`.
enum State {
    Connecting,
    Handshaking(WsStream),
    Subscribed(WsStream),
    Streaming(WsStream),
    Backoff,
}

/// Subscribes to the daemon's `height` channel at `ws://<endpoint>/ws` and
/// emits one unit per new-block notification. Runs until the receiving side
/// of `notify_tx` is dropped.
///
/// The periodic template refresh continues independently, so losing this
/// subscription degrades latency, never progress.
pub async fn subscribe_block_update(endpoint: String, notify_tx: mpsc::Sender<()>) {
    let url = format!("ws://{endpoint}/ws");
    let mut state = State::Connecting;

    loop {
        state = match state {
            State::Connecting => match connect_async(url.as_str()).await {
                Ok((stream, _)) => State::Handshaking(stream),
                Err(e) => {
                    warn!("websocket dial {} failed: {}", url, e);
                    State::Backoff
                }
            },
            State::Handshaking(mut stream) => {
                let mut acked = 0;
                while acked < HANDSHAKE_ACKS {
                    match stream.next().await {
                        Some(Ok(frame)) => {
                            debug!("websocket handshake ack: {:?}", frame);
                            acked += 1;
                        }
                        other => {
                            warn!("websocket handshake failed: {:?}", other);
                            break;
                        }
                    }
                }
                if acked == HANDSHAKE_ACKS {
                    State::Subscribed(stream)
                } else {
                    State::Backoff
                }
            }
            State::Subscribed(mut stream) => {
                let frame = serde_json::json!({"event": "subscribe", "channel": "height"});
                let sent = stream.send(Message::text(frame.to_string())).await;
                match sent {
                    Ok(()) => match stream.next().await {
                        Some(Ok(ack)) => {
                            info!("websocket height subscription confirmed: {:?}", ack);
                            State::Streaming(stream)
                        }
                        other => {
                            warn!("websocket subscribe ack failed: {:?}", other);
                            State::Backoff
                        }
                    },
                    Err(e) => {
                        warn!("websocket subscribe failed: {}", e);
                        State::Backoff
                    }
                }
            }
            State::Streaming(mut stream) => loop {
                match stream.next().await {
                    Some(Ok(Message::Text(_))) | Some(Ok(Message::Binary(_))) => {
                        if notify_tx.send(()).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(_)) => continue,
                    other => {
                        warn!("websocket stream ended: {:?}", other);
                        break State::Backoff;
                    }
                }
            },
            State::Backoff => {
                tokio::time::sleep(RECONNECT_DELAY).await;
                State::Connecting
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::accept_async;

    /// Fake daemon: two handshake acks, expects a subscribe frame, acks it,
    /// then pushes `notifications` height frames.
    async fn run_fake_daemon(listener: tokio::net::TcpListener, notifications: usize) {
        let (socket, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(socket).await.unwrap();

        ws.send(Message::text(r#"{"event":"connected"}"#))
            .await
            .unwrap();
        ws.send(Message::text(r#"{"event":"ready"}"#)).await.unwrap();

        let subscribe = ws.next().await.unwrap().unwrap();
        let subscribe: serde_json::Value =
            serde_json::from_str(subscribe.to_text().unwrap()).unwrap();
        assert_eq!(subscribe["event"], "subscribe");
        assert_eq!(subscribe["channel"], "height");
        ws.send(Message::text(r#"{"event":"subscribed","channel":"height"}"#))
            .await
            .unwrap();

        for height in 0..notifications {
            ws.send(Message::text(format!(r#"{{"height":{height}}}"#)))
                .await
                .unwrap();
        }
        // Hold the connection open so the subscriber stays in Streaming.
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    #[test_log::test(tokio::test)]
    async fn test_subscribe_receives_notifications() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();

        // tungstenite's client requires the /ws path; the fake daemon accepts
        // whatever path it is given.
        let daemon = tokio::spawn(run_fake_daemon(listener, 3));

        let (notify_tx, mut notify_rx) = mpsc::channel(8);
        let subscriber = tokio::spawn(subscribe_block_update(endpoint, notify_tx));

        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(5), notify_rx.recv())
                .await
                .expect("notification should arrive")
                .expect("channel open");
        }

        subscriber.abort();
        daemon.abort();
    }

    #[tokio::test]
    async fn test_subscriber_stops_when_receiver_dropped() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let daemon = tokio::spawn(run_fake_daemon(listener, 1));

        let (notify_tx, notify_rx) = mpsc::channel(1);
        drop(notify_rx);
        let subscriber = tokio::spawn(subscribe_block_update(endpoint, notify_tx));

        tokio::time::timeout(Duration::from_secs(5), subscriber)
            .await
            .expect("subscriber should exit once the receiver is gone")
            .unwrap();
        daemon.abort();
    }
}
