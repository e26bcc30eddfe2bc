//! Data models for call documents and profiles

mod call;
mod user;

pub use call::*;
pub use user::*;
