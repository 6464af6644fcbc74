//! Per-conversation channel lifecycle: confirmation, application-level
//! keepalive, and reconnection after transport loss. The state machine is
//! pure; a background driver task interprets its effects against real
//! timers and the cable connection.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};

use crate::cable::{channel_identifier, CableConnection, ChannelSignal};
use crate::config::Config;

/// What the subscription reports to the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Connected {
        chat_id: String,
    },
    Disconnected {
        chat_id: String,
    },
    /// A raw broadcast payload, not yet normalized.
    Payload {
        chat_id: String,
        data: Value,
    },
    /// The fixed backoff elapsed; the owner should rebuild the subscription
    /// if this generation is still the active one.
    Retry {
        chat_id: String,
        generation: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Connecting,
    Live,
    Disconnected,
}

#[derive(Debug, PartialEq, Eq)]
enum Effect {
    StartKeepalive,
    StopKeepalive,
    ArmReconnect,
    Announce(Announcement),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Announcement {
    Connected,
    Disconnected,
    Retry,
}

/// Pure lifecycle rules. Invariant: at most one reconnect timer is armed,
/// and a closed link emits no further effects.
struct ChatLink {
    state: LinkState,
    reconnect_armed: bool,
    closed: bool,
}

impl ChatLink {
    fn new() -> Self {
        ChatLink {
            state: LinkState::Connecting,
            reconnect_armed: false,
            closed: false,
        }
    }

    fn on_confirmed(&mut self) -> Vec<Effect> {
        if self.closed || self.state == LinkState::Live {
            return Vec::new();
        }
        self.state = LinkState::Live;
        // A confirm that raced a pending retry supersedes it.
        self.reconnect_armed = false;
        vec![
            Effect::StartKeepalive,
            Effect::Announce(Announcement::Connected),
        ]
    }

    fn on_transport_closed(&mut self) -> Vec<Effect> {
        if self.closed || self.state == LinkState::Disconnected {
            return Vec::new();
        }
        let mut effects = Vec::new();
        if self.state == LinkState::Live {
            effects.push(Effect::StopKeepalive);
        }
        self.state = LinkState::Disconnected;
        effects.push(Effect::Announce(Announcement::Disconnected));
        if !self.reconnect_armed {
            self.reconnect_armed = true;
            effects.push(Effect::ArmReconnect);
        }
        effects
    }

    fn on_retry_elapsed(&mut self) -> Vec<Effect> {
        if self.closed || !self.reconnect_armed {
            return Vec::new();
        }
        self.reconnect_armed = false;
        vec![Effect::Announce(Announcement::Retry)]
    }

    fn on_close(&mut self) -> Vec<Effect> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        self.reconnect_armed = false;
        if self.state == LinkState::Live {
            self.state = LinkState::Disconnected;
            vec![Effect::StopKeepalive]
        } else {
            self.state = LinkState::Disconnected;
            Vec::new()
        }
    }

    fn reconnect_armed(&self) -> bool {
        self.reconnect_armed
    }
}

/// Handle to one live conversation channel. Owns the driver task; dropping
/// or closing the handle cancels both timers with it.
#[derive(Debug)]
pub struct ChatSubscription {
    chat_id: String,
    generation: u64,
    identifier: String,
    connection: CableConnection,
    claim: mpsc::UnboundedSender<ChannelSignal>,
    driver: JoinHandle<()>,
    closed: AtomicBool,
}

impl ChatSubscription {
    /// Subscribe to the conversation's channel and start the lifecycle
    /// driver. Events for the UI arrive on the returned receiver.
    pub async fn open(
        connection: CableConnection,
        chat_id: &str,
        generation: u64,
        cfg: &Config,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChatEvent>)> {
        let identifier = channel_identifier(chat_id);
        let (claim, signals) = connection.subscribe(&identifier)?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        log::info!("chat {}: opening subscription (generation {})", chat_id, generation);

        let driver = tokio::spawn(drive(
            connection.clone(),
            identifier.clone(),
            chat_id.to_string(),
            generation,
            cfg.keepalive,
            cfg.reconnect_delay,
            signals,
            event_tx,
        ));

        Ok((
            ChatSubscription {
                chat_id: chat_id.to_string(),
                generation,
                identifier,
                connection,
                claim,
                driver,
                closed: AtomicBool::new(false),
            },
            event_rx,
        ))
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Transmit one message over the channel. Errors surface to the caller,
    /// which owns the REST fallback; nothing is retried here.
    pub fn send(&self, text: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow!("subscription is closed"));
        }
        self.connection.transmit(
            &self.identifier,
            json!({ "action": "receive", "message": { "body": text } }),
        )
    }

    /// Stop the driver (and with it both timers) and release the channel.
    /// Idempotent, and safe to call from the update loop: nothing blocks.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.driver.abort();
        self.connection.unsubscribe(&self.identifier, &self.claim);
        log::info!("chat {}: subscription closed", self.chat_id);
    }
}

impl Drop for ChatSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// One-shot arm for the redial delay the subscription owner runs after a
/// failed dial or channel open. Invariant: at most one tick is pending, and
/// the elapsed tick decides from current state, not the state at arm time.
#[derive(Debug, Default)]
pub struct RedialGate {
    armed: bool,
}

/// What the owner should do when the redial delay elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedialStep {
    /// Realtime is back, or nothing on screen wants it.
    Idle,
    /// The socket is gone. Dial the cable again.
    Dial,
    /// The socket is up but the conversation has no channel. Reopen it.
    OpenChannel,
}

impl RedialGate {
    pub fn new() -> Self {
        RedialGate { armed: false }
    }

    /// Arm the delay once. Returns whether the caller should start the
    /// timer; a pending tick or a screen with no channel to revive leaves
    /// the gate alone.
    pub fn arm(&mut self, wants_realtime: bool) -> bool {
        if self.armed || !wants_realtime {
            return false;
        }
        self.armed = true;
        true
    }

    /// The delay elapsed. Disarms, then picks the next step from where
    /// things stand now.
    pub fn on_elapsed(&mut self, wants_realtime: bool, socket_up: bool) -> RedialStep {
        self.armed = false;
        if !wants_realtime {
            RedialStep::Idle
        } else if socket_up {
            RedialStep::OpenChannel
        } else {
            RedialStep::Dial
        }
    }

    pub fn armed(&self) -> bool {
        self.armed
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    connection: CableConnection,
    identifier: String,
    chat_id: String,
    generation: u64,
    keepalive_every: Duration,
    reconnect_delay: Duration,
    mut signals: mpsc::UnboundedReceiver<ChannelSignal>,
    events: mpsc::UnboundedSender<ChatEvent>,
) {
    let mut link = ChatLink::new();
    let mut keepalive: Option<Interval> = None;
    let mut reconnect: Option<Pin<Box<Sleep>>> = None;
    let mut transport_gone = false;

    loop {
        // Once the transport is gone and the retry has fired there is
        // nothing left to drive.
        if transport_gone && reconnect.is_none() && !link.reconnect_armed() {
            break;
        }

        let effects = tokio::select! {
            sig = signals.recv(), if !transport_gone => {
                match sig {
                    Some(ChannelSignal::Payload(data)) => {
                        let event = ChatEvent::Payload { chat_id: chat_id.clone(), data };
                        if events.send(event).is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(ChannelSignal::Confirmed) => {
                        log::info!("chat {}: subscription confirmed", chat_id);
                        link.on_confirmed()
                    }
                    Some(ChannelSignal::Rejected) => {
                        log::error!("chat {}: subscription rejected", chat_id);
                        link.on_transport_closed()
                    }
                    Some(ChannelSignal::TransportClosed) | None => {
                        log::warn!("chat {}: transport lost", chat_id);
                        transport_gone = true;
                        link.on_transport_closed()
                    }
                }
            }
            _ = tick(&mut keepalive) => {
                log::debug!("chat {}: keepalive ping", chat_id);
                if let Err(e) = connection.transmit(
                    &identifier,
                    json!({ "action": "receive", "type": "ping" }),
                ) {
                    log::warn!("chat {}: keepalive send failed: {}", chat_id, e);
                }
                continue;
            }
            _ = elapsed(&mut reconnect) => {
                reconnect = None;
                link.on_retry_elapsed()
            }
        };

        let mut receiver_gone = false;
        for effect in effects {
            match effect {
                Effect::StartKeepalive => {
                    let mut interval =
                        interval_at(Instant::now() + keepalive_every, keepalive_every);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    keepalive = Some(interval);
                }
                Effect::StopKeepalive => keepalive = None,
                Effect::ArmReconnect => {
                    log::info!("chat {}: retrying in {:?}", chat_id, reconnect_delay);
                    reconnect = Some(Box::pin(sleep(reconnect_delay)));
                }
                Effect::Announce(a) => {
                    let event = match a {
                        Announcement::Connected => ChatEvent::Connected {
                            chat_id: chat_id.clone(),
                        },
                        Announcement::Disconnected => ChatEvent::Disconnected {
                            chat_id: chat_id.clone(),
                        },
                        Announcement::Retry => ChatEvent::Retry {
                            chat_id: chat_id.clone(),
                            generation,
                        },
                    };
                    if events.send(event).is_err() {
                        receiver_gone = true;
                    }
                }
            }
        }
        if receiver_gone {
            break;
        }
    }
    log::debug!("chat {}: subscription driver finished", chat_id);
}

async fn tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn elapsed(reconnect: &mut Option<Pin<Box<Sleep>>>) {
    match reconnect {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
