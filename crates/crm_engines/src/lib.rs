#![forbid(unsafe_code)]

pub mod permissions;
pub mod verification;
