//! Bluetooth transport plumbing.
//!
//! Both protocol links (AACP and ATT) run over L2CAP sequential-packet
//! sockets; this module owns the socket lifecycle and the reader/writer tasks.

pub mod l2cap;
