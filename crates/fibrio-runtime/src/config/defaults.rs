//! Compile-time defaults
//!
//! Generated by `build.rs`. Point `FIBRIO_CONFIG_RS` at a file of
//! `pub const NAME: TYPE = VALUE;` lines to override any of them.

include!(concat!(env!("OUT_DIR"), "/fibrio_defaults.rs"));
