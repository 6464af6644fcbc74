//! Client library for a student-community forum with direct messages.
//! The chat side merges three concurrent message sources (REST history,
//! optimistic local echoes, push events) into one deduplicated list over an
//! unreliable WebSocket transport.

pub mod api;
pub mod cable;
pub mod config;
pub mod models;
pub mod normalize;
pub mod session;
pub mod store;
pub mod subscription;

pub use api::ApiClient;
pub use cable::CableConnection;
pub use config::Config;
pub use models::{Chat, ChatHistory, Message, Sender, User, WireMessage};
pub use normalize::{history_message, normalize, Inbound, NormalizeContext};
pub use session::Session;
pub use store::MessageStore;
pub use subscription::{ChatEvent, ChatSubscription, RedialGate, RedialStep};
