//! Mixed-precision bridge between the solver and its preconditioner.

use crate::error::Result;

use super::backend::Device;
use super::pool::MemoryPool;
use super::Operator;

/// How a preconditioner application reached the preconditioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgePath {
    /// Same precision: applied in place on `r` and `z`, no copies.
    Direct,
    /// Narrowed `r`, applied in preconditioner precision, widened into `z`.
    Converted,
}

/// Compute `z = M^{-1} r` on the first `n` entries.
///
/// When the device's preconditioner precision differs from its working
/// precision, `r` is narrowed into a pool buffer of `n_total` entries, the
/// preconditioner runs there, and its output is widened into `z`.
pub fn apply_preconditioner<D, M>(
    device: &D,
    pool: &MemoryPool<D>,
    precon: &mut M,
    n: usize,
    n_total: usize,
    r: &D::WorkVector,
    z: &mut D::WorkVector,
) -> Result<BridgePath>
where
    D: Device,
    M: Operator<D::PreconVector> + ?Sized,
{
    if let (Some(r_p), Some(z_p)) = (device.as_precon(r), device.as_precon_mut(z)) {
        precon.apply(r_p, z_p)?;
        return Ok(BridgePath::Direct);
    }

    let mut r_p = pool.reserve_precon(device, n_total)?;
    let mut z_p = pool.reserve_precon(device, n_total)?;
    device.narrow(n, r, &mut r_p);
    precon.apply(&r_p, &mut z_p)?;
    device.widen(n, &z_p, z);
    Ok(BridgePath::Converted)
}
