//! This crate exists to coordinate versions of `tracing` used by the
//! workspace: all crates import the facade through this shim so that there is
//! exactly one place to swap it out.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub use tracing;
