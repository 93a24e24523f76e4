//! Vendor GATT characteristics over a raw ATT link.
//!
//! Audio personalization (transparency and hearing-aid tuning) lives behind
//! three fixed attribute handles rather than the control channel. Only the
//! small slice of ATT the device needs is implemented: reads, writes and
//! handle-value notifications.

pub mod att;
pub mod personalization;
pub mod session;
