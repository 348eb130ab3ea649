#![forbid(unsafe_code)]

pub mod consensus;
pub mod counter;
mod generator;

pub use generator::*;
pub use seqid_common::{id::IdGenerator, namespace::Namespace};
