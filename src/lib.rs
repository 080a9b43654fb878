//! Bridge a local music player daemon to remote clients over MQTT.
//!
//! The crate has two halves that share one wire protocol:
//!
//! * **Device side**: [`remote::Bridge`] connects a [`player::Player`]
//!   capability to an MQTT broker. Inbound commands are dispatched to the
//!   player and answered on the responses topic; a status publisher polls the
//!   player and publishes coalesced, retained state updates.
//! * **Client side**: [`session::Session`] subscribes to a device namespace,
//!   reconstructs player state from retained and streamed messages, issues
//!   commands as futures correlated by command id, and surfaces changes as
//!   [`events::Event`] values.
//!
//! Both halves speak through the [`transport::Transport`] capability, backed
//! by [`transport::MqttTransport`] in production and by in-process fakes in
//! tests. Topics and envelopes live under [`protocol`].

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

#[macro_use]
extern crate log;

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod player;
pub mod protocol;
pub mod remote;
pub mod session;
pub mod status;
pub mod transport;
pub mod util;
pub mod uuid;
