//! Inbound/outbound adapters around the routing core.

pub mod csv;
