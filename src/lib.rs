//! A pure Rust implementation of the BrightScript/Roku remote debugger
//! protocol (`bsdebug`), suitable for writing debugger front ends and for
//! testing against an emulated device.

#![warn(
    anonymous_parameters,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_extern_crates,
    unused_qualifications,
    variant_size_differences
)]

pub mod action_queue;
pub mod client;
pub mod config;
pub mod protocol;
pub mod server;
pub mod telnet;
