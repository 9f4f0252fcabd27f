#![forbid(unsafe_code)]

pub mod access;
pub mod change_feed;
pub mod common;
pub mod lead;
pub mod verification;

pub use common::{ContractViolation, ReasonCodeId, Validate};
