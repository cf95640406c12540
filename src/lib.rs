//! # Telsig Signalling Engine
//!
//! Layered, protocol-accurate implementation of telephony signalling over
//! digital links and over IP:
//!
//! - **MTP2/MTP3** - SS7 Message Transfer Part data link and network layers
//! - **ISUP** - ISDN User Part call control with circuit supervision
//! - **SCCP** - Connectionless routing with global title translation
//! - **TCAP** - Transaction Capabilities (ITU and ANSI dialects)
//! - **ISDN** - Q.921 data link with TEI management and Q.931 call control
//! - **SIGTRAN** - M2PA/M2UA/M3UA/IUA/SUA adaptations over an SCTP transport
//!
//! Every protocol layer runs as a component under a single [`Engine`] that
//! drives periodic ticks, routes factory-built construction and delivers
//! notifications to an externally supplied notifier.
//!
//! ## Example
//! ```rust,ignore
//! use telsig::{Engine, EngineSettings};
//!
//! let engine = Engine::new(EngineSettings::default(), vec![]);
//! engine.clone().run();
//!
//! // Build layers, wire them together, place a call...
//! let isup = IsupController::new("isup1", config, circuits);
//! engine.attach(isup.clone()).await;
//! ```

pub mod circuit;
pub mod config;
pub mod engine;
pub mod errors;
pub mod iface;
pub mod isdn;
pub mod isup;
pub mod mtp2;
pub mod mtp3;
pub mod sccp;
pub mod sigtran;
pub mod tcap;
pub mod types;

// Re-exports
pub use config::TelsigConfig;
pub use engine::{ControlMap, Engine, EngineSettings, Notification, Notifier, SigComponent};
pub use errors::{Result, TelsigError};
pub use types::*;

// Protocol layer exports
pub use circuit::{Circuit, CircuitGroup, CircuitStatus};
pub use isdn::{Q921Link, Q931CallController, TeiManager};
pub use isup::{IsupCall, IsupController, IsupMessage};
pub use mtp2::Mtp2Link;
pub use mtp3::{Mtp3Network, Router};
pub use sccp::{SccpAddress, SccpEngine, SccpMessage};
pub use tcap::{TcapComponent, TcapDialect, TcapEngine};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service Indicator values (Q.704 14.2.1)
pub mod si {
    /// Signalling Network Management
    pub const SNM: u8 = 0;
    /// Maintenance messages
    pub const MTN: u8 = 1;
    /// Maintenance special messages
    pub const MTNS: u8 = 2;
    /// Signalling Connection Control Part
    pub const SCCP: u8 = 3;
    /// Telephone User Part
    pub const TUP: u8 = 4;
    /// ISDN User Part
    pub const ISUP: u8 = 5;
    /// Broadband ISUP / BICC
    pub const BICC: u8 = 13;
}

/// Well-known subsystem numbers
pub mod ssn {
    pub const MANAGEMENT: u8 = 1;
    pub const ISUP: u8 = 3;
    pub const OMAP: u8 = 4;
    pub const MAP: u8 = 5;
    pub const HLR: u8 = 6;
    pub const VLR: u8 = 7;
    pub const MSC: u8 = 8;
}
