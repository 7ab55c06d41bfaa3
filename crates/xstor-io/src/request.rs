//! The bit-exact request/response wire format.
//!
//! These definitions are shared with the guest kernel and must stay
//! synchronized with it: the descriptor is read out of guest memory as raw
//! bytes, and the completion block is read back over a fixed register pair.

use xstor_fatx::Status;

/// Request descriptor as the guest kernel lays it out, packed so that it
/// has the same padding and alignment on both sides of the wire.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PackedIoRequest {
    /// Unique id identifying this request.
    pub id: u32,
    /// High 16 bits: operation. Low 16 bits: flags and device.
    pub ty: u32,
    /// File offset from which to start the I/O.
    pub offset: i64,
    /// Bytes to transfer, or the path length for open/create requests.
    pub size: u32,
    /// Data address, or the target guest handle for open/create requests.
    pub handle_or_address: u32,
    /// Source handle, or the guest address of the path for open/create.
    pub handle_or_path: u32,
}

pub const PACKED_IO_REQUEST_SIZE: usize = 28;

bitflags::bitflags! {
    /// Flag bits in the low half of the request type word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RequestFlags: u32 {
        const DIRECTORY = 1 << 0;
        const ALWAYS = 1 << 1;
        const TRUNCATE = 1 << 2;
    }
}

/// Operation code carried in the high 16 bits of the type word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOp {
    Open,
    Create,
    Remove,
    Close,
    Read,
    Write,
}

impl RequestOp {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Open),
            2 => Some(Self::Create),
            3 => Some(Self::Remove),
            4 => Some(Self::Close),
            5 => Some(Self::Read),
            6 => Some(Self::Write),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Open => 1,
            Self::Create => 2,
            Self::Remove => 3,
            Self::Close => 4,
            Self::Read => 5,
            Self::Write => 6,
        }
    }
}

/// Device selector carried in bits 12..=15 of the type word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Dvd,
    Hdd,
}

/// Host-side form of a request, with the path already pulled out of guest
/// memory for open/create.
#[derive(Debug, Clone)]
pub struct IoRequest {
    pub id: u32,
    pub ty: u32,
    pub offset: i64,
    pub size: u32,
    pub handle_or_address: u32,
    pub handle_or_path: u32,
    pub path: Option<String>,
}

impl IoRequest {
    pub fn from_packed(packed: PackedIoRequest) -> Self {
        Self {
            id: packed.id,
            ty: packed.ty,
            offset: packed.offset,
            size: packed.size,
            handle_or_address: packed.handle_or_address,
            handle_or_path: packed.handle_or_path,
            path: None,
        }
    }

    pub fn op(&self) -> Option<RequestOp> {
        RequestOp::from_code(self.ty >> 16)
    }

    pub fn flags(&self) -> RequestFlags {
        RequestFlags::from_bits_truncate(self.ty)
    }

    pub fn device(&self) -> Device {
        if (self.ty >> 12) & 0xF == 0 { Device::Dvd } else { Device::Hdd }
    }

    pub fn is_open_or_create(&self) -> bool {
        matches!(self.op(), Some(RequestOp::Open) | Some(RequestOp::Create))
    }

    /// Guest handle assigned by an open/create request.
    pub fn target_handle(&self) -> u32 {
        self.handle_or_address
    }

    /// Guest address of the data to transfer.
    pub fn data_address(&self) -> u32 {
        self.handle_or_address
    }

    /// Handle a close/read/write request operates on.
    pub fn source_handle(&self) -> u32 {
        self.handle_or_path
    }

    /// Guest address of the path string of an open/create request.
    pub fn path_address(&self) -> u32 {
        self.handle_or_path
    }
}

/// Completion published for every request and polled back by the guest.
#[derive(Debug, Clone, Copy)]
pub struct IoInfoBlock {
    pub status: Status,
    pub info: u32,
}

impl IoInfoBlock {
    pub fn new(status: Status, info: u32) -> Self {
        Self { status, info }
    }

    pub fn success(info: u32) -> Self {
        Self { status: Status::Success, info }
    }

    pub fn error(status: Status) -> Self {
        Self { status, info: 0 }
    }
}
