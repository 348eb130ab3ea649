#![forbid(unsafe_code)]

pub mod error;
pub mod id;
pub mod namespace;
pub mod registry;
pub mod utils;
