#![forbid(unsafe_code)]

pub mod clock;
pub mod lead_access;
pub mod verification_sync;
