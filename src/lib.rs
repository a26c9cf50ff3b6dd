//! Accu-Chek Spirit Combo insulin pump control core.
//!
//! Drives the pump over Bluetooth RFCOMM as a remote terminal (RT) and via
//! proprietary binary commands (CMD mode). This crate owns the three-layer
//! binary protocol stack (transport, application, RT display parsing) and
//! the pump controller state machine; it does not own the Bluetooth
//! stack, the pairing PIN prompt, the persistent store's backing format,
//! or any UI (see [`bt`] and [`store::PumpStore`] for the narrow contracts
//! those collaborators must satisfy).

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub use error::{Error, Result};

pub mod bt;
#[path = "codec/codec.rs"]
pub mod codec;
#[path = "transport/transport.rs"]
pub mod transport;
#[path = "app/app.rs"]
pub mod app;
#[path = "display/display.rs"]
pub mod display;
#[path = "screen/screen.rs"]
pub mod screen;
#[path = "rt/rt.rs"]
pub mod rt;
#[path = "controller/controller.rs"]
pub mod controller;
mod error;
pub mod store;

pub use combo_crypto as crypto;

type SyncMutex<T> = parking_lot::Mutex<T>;
type AsyncMutex<T> = tokio::sync::Mutex<T>;
