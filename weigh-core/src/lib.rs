//! Core domain logic for the RFID weigh-and-print edge runtime: the
//! weighing-stability detector, the batch-weigh finite-state machine, the
//! outbox store, and the capability traits the workers drive.
//!
//! This crate has no `tokio::spawn`/`main` of its own — `weigh-edge` wires
//! these pieces into the control loop and worker tasks.

pub mod detector;
pub mod error;
pub mod fsm;
pub mod model;
pub mod payload;
pub mod ports;
pub mod store;

pub use error::{Error, Result};
