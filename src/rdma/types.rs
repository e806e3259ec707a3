//! Type aliases for RDMA-related quantities.

/// [`u8`]: **Port number**, identifies a physical port on an HCA.
pub type PortNum = u8;

/// [`u16`]: **Local identifier (LID)**, identifies a port on an HCA or switch
/// in the fabric.
pub type Lid = u16;

/// [`u32`]: **Queue pair number**, identifies a local queue pair.
pub type Qpn = u32;

/// [`u32`]: **Packet sequence number (PSN)**, identifies a packet in a flow.
pub type Psn = u32;

/// [`u32`]: **Local key**, identifies a local memory region.
pub type LKey = u32;

/// [`u32`]: **Remote key**, identifies a remote memory region.
pub type RKey = u32;

/// [`u64`]: **Work request identifier**, designated by the user to correlate
/// completions with posted work requests.
pub type WrId = u64;

/// [`u32`]: **Immediate data**, can be carried in send-type work requests.
pub type ImmData = u32;
