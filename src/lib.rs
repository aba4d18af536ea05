#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod code;
pub mod host;
pub mod logging;
pub mod orchestrator;
pub mod patcher;
pub mod pattern;
pub mod scan;
pub mod site;
pub mod task;
pub mod variant;
pub mod view;

#[cfg(test)]
mod testing;
