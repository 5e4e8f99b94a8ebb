//! Data models for the document vault

mod activity;
mod entry;
mod mutation;
mod principal;
mod team;

pub use activity::*;
pub use entry::*;
pub use mutation::*;
pub use principal::*;
pub use team::*;
