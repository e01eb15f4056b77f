#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! PulseForm client: a reconnecting WebSocket transport, the controller that
//! mirrors server progress into observable state, and a terminal front end.

pub mod controller;
pub mod terminal;
pub mod ws;

pub const DEFAULT_URL: &str = "ws://localhost:3000";
