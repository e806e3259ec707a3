//! Memory region registration.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::pd::Pd;
use super::types::{LKey, RKey};
use crate::error::{Error, Result};
use crate::fabric::MrHandle;

/// Memory region access permissions.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Permission(u32);

impl Permission {
    /// No access.
    pub const EMPTY: Self = Self(0);
    /// Local write access (receives and RDMA read targets).
    pub const LOCAL_WRITE: Self = Self(1 << 0);
    /// Remote write access.
    pub const REMOTE_WRITE: Self = Self(1 << 1);
    /// Remote read access.
    pub const REMOTE_READ: Self = Self(1 << 2);
    /// Remote atomic access.
    pub const REMOTE_ATOMIC: Self = Self(1 << 3);

    /// Check whether all bits of `other` are set in `self`.
    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub(crate) fn bits(self) -> u32 {
        self.0
    }
}

impl Default for Permission {
    /// The permission superset needed for general RDMA put/get use:
    /// local write, remote read, and remote write.
    fn default() -> Self {
        Self::LOCAL_WRITE | Self::REMOTE_READ | Self::REMOTE_WRITE
    }
}

impl BitOr for Permission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permission {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Permission {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Permission({:#b})", self.0)
    }
}

/// Local memory region.
///
/// A registered, pinned span of process memory plus its access keys. The
/// memory itself belongs to the caller; the lifetime parameter ties the
/// region to the registered buffer so it cannot be deregistered after the
/// memory is gone, nor the memory dropped while still registered.
///
/// Dropping an `Mr` deregisters it. Registering the same range twice yields
/// two independent regions with distinct keys.
pub struct Mr<'a> {
    pd: Pd,
    mr: MrHandle,
    addr: usize,
    len: usize,
    lkey: LKey,
    rkey: RKey,
    _marker: PhantomData<&'a UnsafeCell<[u8]>>,
}

impl<'a> Mr<'a> {
    /// Register a buffer with the given protection domain.
    ///
    /// Fails with [`Error::RegistrationFailed`] if the range is not valid
    /// process memory or exceeds a single registration's limits.
    pub fn reg(pd: &Pd, buf: &'a [u8], perm: Permission) -> Result<Self> {
        let keys = pd
            .context()
            .fabric()
            .reg_mr(pd.handle(), buf.as_ptr() as usize, buf.len(), perm)
            .map_err(Error::RegistrationFailed)?;
        Ok(Self {
            pd: pd.clone(),
            mr: keys.handle,
            addr: buf.as_ptr() as usize,
            len: buf.len(),
            lkey: keys.lkey,
            rkey: keys.rkey,
            _marker: PhantomData,
        })
    }

    /// Get the start address of the registered memory area.
    #[inline]
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Get the length of the registered memory area.
    #[allow(clippy::len_without_is_empty)]
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Get the local key of the memory region.
    #[inline]
    pub fn lkey(&self) -> LKey {
        self.lkey
    }

    /// Get the remote key of the memory region.
    #[inline]
    pub fn rkey(&self) -> RKey {
        self.rkey
    }

    /// Get the protection domain this region is registered with.
    #[inline]
    pub fn pd(&self) -> &Pd {
        &self.pd
    }

    /// View this local memory region as a remote memory region descriptor,
    /// for handing to peers that will RDMA-access it.
    #[inline]
    pub fn as_remote(&self) -> MrRemote {
        MrRemote {
            addr: self.addr as u64,
            len: self.len,
            rkey: self.rkey,
        }
    }
}

impl fmt::Debug for Mr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mr")
            .field("addr", &(self.addr as *const u8))
            .field("len", &self.len)
            .field("lkey", &self.lkey)
            .field("rkey", &self.rkey)
            .finish()
    }
}

impl Drop for Mr<'_> {
    fn drop(&mut self) {
        self.pd.context().fabric().dereg_mr(self.mr);
    }
}

/// Remote registered memory.
///
/// Holds no local RDMA resources; it is plain data describing a (slice of a)
/// peer's memory region, exchanged out-of-band. `addr`/`len` may cover only
/// part of the peer's registration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct MrRemote {
    /// Start address in the remote process's address space.
    pub addr: u64,
    /// Length in bytes.
    pub len: usize,
    /// Remote access key.
    pub rkey: RKey,
}

impl MrRemote {
    /// Create a new remote memory descriptor.
    pub fn new(addr: u64, len: usize, rkey: RKey) -> Self {
        Self { addr, len, rkey }
    }

    /// Narrow this descriptor to `len` bytes starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the requested range is out of bounds.
    pub fn slice(&self, offset: usize, len: usize) -> Self {
        assert!(offset + len <= self.len, "slice out of bounds");
        Self {
            addr: self.addr + offset as u64,
            len,
            rkey: self.rkey,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::fabric::sim::SimNet;
    use crate::fabric::Fabric;
    use crate::rdma::context::Context;

    fn pd() -> Pd {
        let net = SimNet::new();
        let fabric: Arc<dyn Fabric> = net.add_fabric();
        let ctx = Context::open(fabric, "mlx4_0", 1).unwrap();
        Pd::alloc(&ctx).unwrap()
    }

    #[test]
    fn keys_are_distinct_and_nonzero() {
        let pd = pd();
        let buf = vec![0u8; 4096];
        let mr = Mr::reg(&pd, &buf, Permission::default()).unwrap();
        assert_ne!(mr.lkey(), 0);
        assert_ne!(mr.rkey(), 0);
        assert_ne!(mr.lkey(), mr.rkey());
    }

    #[test]
    fn same_range_registers_independently() {
        let pd = pd();
        let buf = vec![0u8; 1024];
        let a = Mr::reg(&pd, &buf, Permission::default()).unwrap();
        let b = Mr::reg(&pd, &buf, Permission::default()).unwrap();
        assert_ne!(a.lkey(), b.lkey());
        assert_ne!(a.rkey(), b.rkey());

        // Dropping one does not invalidate the other.
        drop(a);
        assert_eq!(b.addr(), buf.as_ptr() as usize);
        assert_eq!(b.len(), buf.len());
    }

    #[test]
    fn empty_range_is_rejected() {
        let pd = pd();
        let buf: Vec<u8> = vec![];
        let err = Mr::reg(&pd, &buf, Permission::default()).unwrap_err();
        assert!(matches!(err, Error::RegistrationFailed(_)));
    }

    #[test]
    fn remote_slice_narrows() {
        let remote = MrRemote::new(0x1000, 256, 42);
        let slice = remote.slice(16, 64);
        assert_eq!(slice.addr, 0x1010);
        assert_eq!(slice.len, 64);
        assert_eq!(slice.rkey, 42);
    }
}
