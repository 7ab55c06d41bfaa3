//! Helpers shared by the xstor crates.
//!
//! This crate hosts the pieces that both the FATX engine and the XDVDFS
//! reader need: the Xbox kernel's case-insensitive name comparison, the
//! FATX timestamp encoding, and a couple of small range/alignment helpers.

pub mod str;
pub mod time;
pub mod util;
