//! Action Cable transport: one WebSocket shared by every channel
//! subscription, with an envelope router between the socket and the
//! per-channel consumers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsFrame;

type RouteMap = HashMap<String, mpsc::UnboundedSender<ChannelSignal>>;
type Routes = Arc<Mutex<RouteMap>>;

/// What a channel subscriber can hear from the transport.
#[derive(Debug, Clone)]
pub enum ChannelSignal {
    /// Server accepted the subscribe command.
    Confirmed,
    /// Server refused the subscribe command.
    Rejected,
    /// A broadcast addressed to this channel.
    Payload(Value),
    /// The socket is gone; no further signals will arrive.
    TransportClosed,
}

/// Identifier for the per-conversation channel, serialized the way the
/// server echoes it back (key order matters for routing equality).
pub fn channel_identifier(chat_id: &str) -> String {
    json!({ "channel": "ChatChannel", "chat_id": chat_id }).to_string()
}

/// Cheaply cloneable handle to one WebSocket connection. Reader and writer
/// run as background tasks; handles share them.
#[derive(Debug, Clone)]
pub struct CableConnection {
    out_tx: mpsc::UnboundedSender<WsFrame>,
    routes: Routes,
    alive: Arc<AtomicBool>,
    tasks: Arc<IoTasks>,
}

#[derive(Debug)]
struct IoTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for IoTasks {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl CableConnection {
    /// Dial the cable endpoint. The bearer token travels as a query
    /// parameter; the server authenticates during the handshake and answers
    /// with a `welcome` frame.
    pub async fn connect(cable_url: &str, token: &str) -> Result<Self> {
        let sep = if cable_url.contains('?') { '&' } else { '?' };
        let url = format!("{cable_url}{sep}token={token}");
        let (ws, _) = connect_async(&url)
            .await
            .with_context(|| format!("websocket handshake with {cable_url} failed"))?;
        log::info!("cable connected to {}", cable_url);

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsFrame>();
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    log::warn!("cable write failed: {}", e);
                    break;
                }
            }
        });

        let reader = tokio::spawn({
            let routes = Arc::clone(&routes);
            let alive = Arc::clone(&alive);
            let pong_tx = out_tx.clone();
            async move {
                while let Some(next) = stream.next().await {
                    match next {
                        Ok(WsFrame::Text(text)) => route_frame(&text, &routes),
                        Ok(WsFrame::Ping(data)) => {
                            // Split sinks do not answer pings on their own.
                            let _ = pong_tx.send(WsFrame::Pong(data));
                        }
                        Ok(WsFrame::Close(reason)) => {
                            log::warn!("cable closed by server: {:?}", reason);
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            log::error!("cable read error: {}", e);
                            break;
                        }
                    }
                }
                alive.store(false, Ordering::SeqCst);
                for (_, tx) in lock_routes(&routes).drain() {
                    let _ = tx.send(ChannelSignal::TransportClosed);
                }
                log::info!("cable reader finished");
            }
        });

        Ok(CableConnection {
            out_tx,
            routes,
            alive,
            tasks: Arc::new(IoTasks { reader, writer }),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Register a consumer for `identifier` and issue the subscribe
    /// command. Signals for the channel arrive on the returned receiver; the
    /// returned sender is the caller's claim on the route, checked by
    /// `unsubscribe`.
    pub fn subscribe(
        &self,
        identifier: &str,
    ) -> Result<(
        mpsc::UnboundedSender<ChannelSignal>,
        mpsc::UnboundedReceiver<ChannelSignal>,
    )> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock_routes(&self.routes).insert(identifier.to_string(), tx.clone());
        self.send_command(json!({ "command": "subscribe", "identifier": identifier }))?;
        Ok((tx, rx))
    }

    /// Drop the consumer and tell the server. A route re-claimed by a newer
    /// subscribe to the same identifier stays untouched, server side
    /// included. Safe to call with no matching subscription.
    pub fn unsubscribe(&self, identifier: &str, claim: &mpsc::UnboundedSender<ChannelSignal>) {
        {
            let mut routes = lock_routes(&self.routes);
            match routes.get(identifier) {
                Some(tx) if !tx.same_channel(claim) => return,
                Some(_) => {
                    routes.remove(identifier);
                }
                None => {}
            }
        }
        let _ = self.send_command(json!({ "command": "unsubscribe", "identifier": identifier }));
    }

    /// Action Cable `message` command; `data` is the channel action payload
    /// and travels double-encoded, as the protocol demands.
    pub fn transmit(&self, identifier: &str, data: Value) -> Result<()> {
        if !self.is_alive() {
            return Err(anyhow!("cable connection is down"));
        }
        self.send_command(json!({
            "command": "message",
            "identifier": identifier,
            "data": data.to_string(),
        }))
    }

    fn send_command(&self, command: Value) -> Result<()> {
        self.out_tx
            .send(WsFrame::Text(command.to_string()))
            .map_err(|_| anyhow!("cable writer is gone"))
    }

    /// Tear the connection down. Used on logout; in-flight subscribers hear
    /// `TransportClosed`.
    pub fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.tasks.reader.abort();
        self.tasks.writer.abort();
        for (_, tx) in lock_routes(&self.routes).drain() {
            let _ = tx.send(ChannelSignal::TransportClosed);
        }
        log::info!("cable connection shut down");
    }

    /// Connection wired to in-process channels instead of a socket.
    #[cfg(test)]
    pub(crate) fn stub() -> (Self, mpsc::UnboundedReceiver<WsFrame>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let conn = CableConnection {
            out_tx,
            routes: Arc::new(Mutex::new(HashMap::new())),
            alive: Arc::new(AtomicBool::new(true)),
            tasks: Arc::new(IoTasks {
                reader: tokio::spawn(async {}),
                writer: tokio::spawn(async {}),
            }),
        };
        (conn, out_rx)
    }

    /// Deliver a signal as if the reader had routed it.
    #[cfg(test)]
    pub(crate) fn inject(&self, identifier: &str, signal: ChannelSignal) {
        if let Some(tx) = lock_routes(&self.routes).get(identifier) {
            let _ = tx.send(signal);
        }
    }

    #[cfg(test)]
    pub(crate) fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }
}

fn lock_routes(routes: &Routes) -> MutexGuard<'_, RouteMap> {
    match routes.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn route_frame(text: &str, routes: &Routes) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            log::debug!("unparseable cable frame dropped: {}", e);
            return;
        }
    };

    match frame.get("type").and_then(Value::as_str) {
        Some("welcome") => {
            log::info!("cable handshake complete");
            return;
        }
        // Transport heartbeat, distinct from the application-level ping.
        Some("ping") => return,
        Some("disconnect") => {
            log::warn!("server requested disconnect: {:?}", frame.get("reason"));
            return;
        }
        Some("confirm_subscription") => {
            deliver(routes, &frame, ChannelSignal::Confirmed);
            return;
        }
        Some("reject_subscription") => {
            deliver(routes, &frame, ChannelSignal::Rejected);
            return;
        }
        Some(other) => {
            log::debug!("unhandled cable frame type {:?}", other);
            return;
        }
        None => {}
    }

    if let Some(message) = frame.get("message") {
        deliver(routes, &frame, ChannelSignal::Payload(message.clone()));
    } else {
        log::debug!("cable frame without message dropped: {}", text);
    }
}

fn deliver(routes: &Routes, frame: &Value, signal: ChannelSignal) {
    let Some(identifier) = frame.get("identifier").and_then(Value::as_str) else {
        log::debug!("cable frame without identifier dropped");
        return;
    };
    let stale = {
        let guard = lock_routes(routes);
        match guard.get(identifier) {
            Some(tx) => tx.send(signal).is_err(),
            None => {
                log::debug!("no subscriber for identifier {}", identifier);
                false
            }
        }
    };
    if stale {
        lock_routes(routes).remove(identifier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_identifier_is_stable() {
        assert_eq!(
            channel_identifier("7"),
            r#"{"channel":"ChatChannel","chat_id":"7"}"#
        );
    }

    #[tokio::test]
    async fn test_subscribe_issues_command_and_routes_signals() {
        let (conn, mut out) = CableConnection::stub();
        let identifier = channel_identifier("7");
        let (_claim, mut rx) = conn.subscribe(&identifier).unwrap();

        let frame = out.recv().await.unwrap();
        let WsFrame::Text(raw) = frame else {
            panic!("expected a text frame");
        };
        let cmd: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(cmd["command"], "subscribe");
        assert_eq!(cmd["identifier"], Value::String(identifier.clone()));

        conn.inject(&identifier, ChannelSignal::Confirmed);
        assert!(matches!(rx.try_recv(), Ok(ChannelSignal::Confirmed)));
    }

    #[tokio::test]
    async fn test_transmit_double_encodes_data() {
        let (conn, mut out) = CableConnection::stub();
        let identifier = channel_identifier("7");
        conn.transmit(&identifier, json!({"action": "receive", "message": {"body": "hi"}}))
            .unwrap();

        let WsFrame::Text(raw) = out.recv().await.unwrap() else {
            panic!("expected a text frame");
        };
        let cmd: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(cmd["command"], "message");
        // Payload is a JSON string, not a nested object.
        let data: Value = serde_json::from_str(cmd["data"].as_str().unwrap()).unwrap();
        assert_eq!(data["message"]["body"], "hi");
    }

    #[tokio::test]
    async fn test_transmit_fails_when_connection_down() {
        let (conn, _out) = CableConnection::stub();
        conn.set_alive(false);
        assert!(conn
            .transmit(&channel_identifier("7"), json!({"action": "receive"}))
            .is_err());
    }

    #[tokio::test]
    async fn test_frame_routing_by_identifier() {
        let (conn, _out) = CableConnection::stub();
        let mine = channel_identifier("7");
        let other = channel_identifier("9");
        let (_claim, mut rx) = conn.subscribe(&mine).unwrap();

        let frame = json!({
            "identifier": other,
            "message": {"body": "not for us"}
        })
        .to_string();
        route_frame(&frame, &conn.routes);
        assert!(rx.try_recv().is_err());

        let frame = json!({
            "identifier": mine,
            "message": {"body": "for us"}
        })
        .to_string();
        route_frame(&frame, &conn.routes);
        let Ok(ChannelSignal::Payload(payload)) = rx.try_recv() else {
            panic!("expected a payload");
        };
        assert_eq!(payload["body"], "for us");
    }

    #[tokio::test]
    async fn test_welcome_and_transport_ping_are_swallowed() {
        let (conn, _out) = CableConnection::stub();
        let identifier = channel_identifier("7");
        let (_claim, mut rx) = conn.subscribe(&identifier).unwrap();

        route_frame(r#"{"type":"welcome"}"#, &conn.routes);
        route_frame(r#"{"type":"ping","message":1732000000}"#, &conn.routes);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_route() {
        let (conn, mut out) = CableConnection::stub();
        let identifier = channel_identifier("7");
        let (claim, mut rx) = conn.subscribe(&identifier).unwrap();
        let _ = out.recv().await;

        conn.unsubscribe(&identifier, &claim);
        let WsFrame::Text(raw) = out.recv().await.unwrap() else {
            panic!("expected a text frame");
        };
        let cmd: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(cmd["command"], "unsubscribe");

        conn.inject(&identifier, ChannelSignal::Confirmed);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_unsubscribe_spares_successor_route() {
        let (conn, mut out) = CableConnection::stub();
        let identifier = channel_identifier("7");
        let (old_claim, _old_rx) = conn.subscribe(&identifier).unwrap();
        let (new_claim, mut new_rx) = conn.subscribe(&identifier).unwrap();
        let _ = out.recv().await;
        let _ = out.recv().await;

        // The superseded holder backs off entirely: no eviction, no
        // unsubscribe command for the channel the successor now owns.
        conn.unsubscribe(&identifier, &old_claim);
        assert!(out.try_recv().is_err());
        conn.inject(&identifier, ChannelSignal::Confirmed);
        assert!(matches!(new_rx.try_recv(), Ok(ChannelSignal::Confirmed)));

        conn.unsubscribe(&identifier, &new_claim);
        let WsFrame::Text(raw) = out.recv().await.unwrap() else {
            panic!("expected a text frame");
        };
        let cmd: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(cmd["command"], "unsubscribe");
        conn.inject(&identifier, ChannelSignal::Confirmed);
        assert!(new_rx.try_recv().is_err());
    }
}
