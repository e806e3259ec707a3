//! Protection domain.

use std::fmt;
use std::sync::Arc;

use super::context::{exhausted, Context};
use crate::error::Result;
use crate::fabric::PdHandle;

struct PdInner {
    ctx: Context,
    pd: PdHandle,
}

impl Drop for PdInner {
    fn drop(&mut self) {
        self.ctx.fabric().dealloc_pd(self.pd);
    }
}

/// Protection domain: the authorization scope that binds registered memory
/// regions to queue pairs. Clones share the same underlying domain.
#[derive(Clone)]
pub struct Pd {
    inner: Arc<PdInner>,
}

impl fmt::Debug for Pd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pd").field(&self.inner.pd).finish()
    }
}

impl Pd {
    /// Allocate a protection domain on the given context.
    pub fn alloc(ctx: &Context) -> Result<Self> {
        let pd = ctx
            .fabric()
            .alloc_pd(ctx.handle())
            .map_err(exhausted("protection domain"))?;
        Ok(Self {
            inner: Arc::new(PdInner {
                ctx: ctx.clone(),
                pd,
            }),
        })
    }

    /// Get the underlying handle.
    #[inline]
    pub(crate) fn handle(&self) -> PdHandle {
        self.inner.pd
    }

    /// Get the underlying [`Context`].
    #[inline]
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::sim::SimNet;
    use crate::fabric::Fabric;

    #[test]
    fn alloc_and_drop() {
        let net = SimNet::new();
        let fabric = net.add_fabric();
        let dyn_fabric: Arc<dyn Fabric> = fabric.clone();

        let ctx = Context::open(dyn_fabric, "mlx4_0", 1).unwrap();
        let pd = Pd::alloc(&ctx).unwrap();
        assert_eq!(pd.context().dev_name(), ctx.dev_name());
        assert_eq!(fabric.live_resources().pds, 1);

        drop(pd);
        assert_eq!(fabric.live_resources().pds, 0);
    }
}
