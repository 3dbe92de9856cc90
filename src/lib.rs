//! # vibra-node
//!
//! Firmware core for a single-node vibration-measurement device: an
//! accelerometer driven over I²C with FIFO-watermark interrupts, streamed to
//! a host over a line-oriented ASCII protocol with a reliable windowed
//! block-transfer layer on top.
//!
//! The library is split into a hardware-agnostic core (this crate) and a
//! thin `#[rtic::app]` binary (`src/bin/vibra-node.rs`) that wires real
//! peripherals to it, mirroring how `stabilizer::hardware` is kept separate
//! from `stabilizer`'s DSP application binaries.
#![cfg_attr(not(test), no_std)]
#![deny(warnings)]

pub mod burst;
pub mod command;
pub mod config;
pub mod context;
pub mod countdown;
pub mod diag;
pub mod error;
pub mod hal;
pub mod proto;
pub mod sample;
pub mod sensor;
pub mod streaming;
pub mod telemetry;
pub mod transport;
pub mod trigger;

pub use error::Error;
