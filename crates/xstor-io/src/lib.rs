//! The I/O request pipeline.
//!
//! The emulated kernel submits packed request descriptors through an MMIO
//! window; the CPU thread enqueues them without ever blocking, and a single
//! background worker drains the queue, talks to the FATX engine, the XDVDFS
//! reader and the host filesystem, and publishes `{status, info}` completion
//! blocks the guest polls back over MMIO.

pub mod files;
pub mod guest;
pub mod path;
pub mod request;
pub mod worker;

pub use guest::GuestMemory;
pub use path::{resolve_guest_path, ResolvedPath};
pub use request::{Device, IoInfoBlock, IoRequest, PackedIoRequest, RequestFlags, RequestOp};
pub use worker::{IoEngine, IoInitError};
