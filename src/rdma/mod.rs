//! Safe wrappers over the fabric layer: devices, contexts, protection
//! domains, completion queues, queue pairs, and memory regions.

pub mod context;
pub mod cq;
pub mod device;
pub mod mr;
pub mod pd;
pub mod qp;
pub mod types;
pub mod wr;

pub use context::Context;
pub use cq::{Cq, Wc, WcOpcode, WcStatus};
pub use device::DeviceList;
pub use mr::{Mr, MrRemote, Permission};
pub use pd::Pd;
pub use qp::{ConnectParams, Qp, QpCaps, QpEndpoint, QpState};
pub use wr::{RecvWr, SendOp, SendWr, Sge};
