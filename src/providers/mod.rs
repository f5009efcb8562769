//! Concrete provider integrations used by the demo driver and the tests.

pub mod fx;
pub mod treasury;
