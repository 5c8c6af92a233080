//! Lenity CLI library.
//!
//! Shared pieces of the `lenity` binary: configuration, command bodies and
//! terminal colors.

pub mod colors;
pub mod commands;
pub mod config;
