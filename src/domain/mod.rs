//! Domain layer: the token data model, the entity contract implemented by
//! provider integrations, the checkpoint store port, and the wire codec.

pub mod entity;
pub mod ports;
pub mod token;
pub mod wire;
