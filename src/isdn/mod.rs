//! ISDN access signalling
//!
//! A parallel stack to SS7: Q.921 data links on an interface, TEI
//! management for multipoint configurations, Q.931 call control on top.

mod q921;
mod q931;
mod tei;

pub use q921::{LinkState, Q921Frame, Q921Link, Q921Passive, Q921User, SType, UType};
pub use q931::{
    ie, mt, switch_flags, switch_type_flags, Q931Call, Q931CallController, Q931Message,
    Q931State,
};
pub use tei::{TeiManager, TeiMsg};
