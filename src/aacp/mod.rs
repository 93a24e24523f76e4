//! Accessory control channel: protocol tables, frame parsing, the control
//! command registry and the session that ties them to a live link.

pub mod parser;
pub mod protocol;
pub mod registry;
pub mod session;
