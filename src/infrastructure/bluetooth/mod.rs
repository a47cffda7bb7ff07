//! Bluetooth Module
//!
//! BLE-MIDI links to the amplifier and the foot pedal.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │   (scan + connect, spawns one link task per peripheral)  │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │  Scanner  │  │ Connection │  │ Protocol │
//! │           │  │            │  │          │
//! │ - device  │  │ - GATT     │  │ - UUIDs  │
//! │   select  │  │ - subscribe│  │ - select │
//! └───────────┘  └────────────┘  └──────────┘
//!
//!   LinkHandle ──(Transport)──▶ Device / Pedal controller
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - BLE-MIDI GATT identifiers and device selection
//! - [`scanner`] - BLE device discovery
//! - [`connection`] - Peripheral connection and GATT characteristic access
//! - [`service`] - Link tasks, reconnect policy and the [`LinkHandle`]
//! - [`transport`] - The `Transport` seam and its error type

pub mod connection;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod transport;

pub use service::{BluetoothService, LinkEvent, LinkHandle};
