#![forbid(unsafe_code)]

pub mod feed;
pub mod repo;
pub mod store;
