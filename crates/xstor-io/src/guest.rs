//! Guest memory access.
//!
//! The engine touches guest RAM exclusively through this trait; the
//! surrounding emulator implements it on top of the CPU's virtual address
//! space. Both the CPU thread (request submission) and the I/O worker use
//! it, hence the `Send + Sync` bound.

pub trait GuestMemory: Send + Sync {
    /// Copies `dst.len()` bytes out of guest memory at `addr`.
    fn read_block(&self, addr: u32, dst: &mut [u8]);

    /// Copies `src.len()` bytes into guest memory at `addr`.
    fn write_block(&self, addr: u32, src: &[u8]);
}
