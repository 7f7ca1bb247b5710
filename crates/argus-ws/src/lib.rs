//! # Argus WebSocket
//!
//! Real-time push to browser clients of the Argus NVR web tier.
//!
//! - [`Hub`] tracks clients, their topic subscriptions and the topic handler
//!   registry, and fans events out with [`Hub::broadcast`].
//! - [`upgrade`] validates the RFC 6455 handshake and builds the
//!   `101 Switching Protocols` response.
//! - [`serve_client`] drives one upgraded socket until it closes.
//!
//! Clients speak JSON [`Envelope`]s:
//!
//! ```text
//! -> {"type":"subscribe","topic":"events"}
//! <- {"type":"ack","topic":"system","payload":{"message":"Subscribed","topic":"events"}}
//! <- {"type":"event","topic":"events","payload":{...}}
//! ```

#![doc(html_root_url = "https://docs.rs/argus-ws/0.1.0")]
#![warn(missing_docs)]

mod config;
mod connection;
mod error;
mod hub;
mod message;
pub mod upgrade;

pub use config::HubConfig;
pub use connection::{serve_client, CloseReason, FrameMeter};
pub use error::{CloseCode, WsError, WsResult};
pub use hub::{ClientSession, ClientState, Hub, TopicHandler, TopicMessage};
pub use message::{Envelope, SYSTEM_TOPIC};
