// WireGuard WAN Overlay Reconciliation Library
// Shared modules for the CLI and tests

#![warn(missing_docs)]

//! WireGuard WAN Overlay Reconciliation Library
//!
//! This library turns an abstract overlay model (a WAN with tunnel and
//! shared-service ranges, its peers, their local subnets and published
//! services) into concrete WireGuard configuration on MikroTik routers, and
//! keeps that configuration reconciled through the RouterOS REST API.
//!
//! Every resource the engine creates carries an ownership tag in its comment;
//! everything else on a device is left alone.
//!
//! # Main Components
//!
//! - [`model`]: Overlay records and their invariants
//! - [`allocator`], [`conflict`], [`translation`]: Address planning
//! - [`compiler`]: Desired device state for one peer
//! - [`descriptor`]: Ownership tags and resource descriptors
//! - [`reader`], [`diff`]: Current device state and reconciliation
//! - [`executor`]: Deployment jobs, rollback, verification
//! - [`transport`], [`client`]: Device API access with timeouts and retries
//! - [`config`], [`types`]: Engine configuration

pub mod allocator;
pub mod cidr;
pub mod client;
pub mod compiler;
pub mod config;
pub mod conflict;
pub mod descriptor;
pub mod diff;
pub mod error;
pub mod executor;
pub mod export;
pub mod job;
pub mod model;
pub mod preflight;
pub mod reader;
pub mod state_file;
pub mod store;
pub mod translation;
pub mod transport;
pub mod types;
pub mod verify;

pub use error::{DeviceError, Error, Result};
