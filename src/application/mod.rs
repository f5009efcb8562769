//! Application layer: the pipeline state machine and the stage/provider
//! dispatch layers it drives tokens through. Each layer validates its own
//! positional or ownership claim on the token before delegating downward,
//! and wraps errors with its identity on the way back up.

pub mod pipeline;
pub mod provider;
pub mod stage;
