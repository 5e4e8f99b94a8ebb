//! Security module - authorization and validation

pub mod authorization;
pub mod validator;

pub use authorization::*;
pub use validator::*;
