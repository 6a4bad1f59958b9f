//! Signaling relay for one-to-one calls between a `client` (caller) and an
//! `admin` (responder).
//!
//! Connections declare a role, the [`router::SignalingRouter`] forwards
//! offers, answers and ICE candidates between them, and responders that
//! registered a push token are woken through [`push::PushNotifier`].

pub mod config;
pub mod push;
pub mod registry;
pub mod router;
pub mod server;
pub mod signaling;
pub mod telemetry;
pub mod websocket;
