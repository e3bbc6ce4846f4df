//! Conjugate gradient solver core and its collaborators.

pub mod backend;
pub mod bridge;
pub mod comm;
#[cfg(feature = "distributed")]
pub mod comm_mpi;
pub mod comm_thread;
pub mod gpu;
pub mod gpu_shaders;
pub mod linalg;
pub mod operator;
pub mod partition;
pub mod pcg;
pub mod pool;
pub mod preconditioner;
pub mod scalar;
pub mod sparse_direct;

use crate::error::Result;

/// Anything that maps a vector to a vector of the same shape: `output = Op(input)`.
///
/// Implemented by discretization operators (`A`) on working-precision
/// vectors and by preconditioners (`M^{-1}`) on preconditioner-precision
/// vectors. `input` and `output` never alias. Implementations may read ghost
/// entries of `input` and may perform halo exchange internally; the solver
/// only relies on the owned entries of `output`.
pub trait Operator<V: ?Sized> {
    fn apply(&mut self, input: &V, output: &mut V) -> Result<()>;
}

impl<V: ?Sized, T: Operator<V> + ?Sized> Operator<V> for &mut T {
    fn apply(&mut self, input: &V, output: &mut V) -> Result<()> {
        (**self).apply(input, output)
    }
}

impl<V: ?Sized, T: Operator<V> + ?Sized> Operator<V> for Box<T> {
    fn apply(&mut self, input: &V, output: &mut V) -> Result<()> {
        (**self).apply(input, output)
    }
}

/// Adapter turning a closure into an [`Operator`].
pub struct OperatorFn<F>(pub F);

impl<V: ?Sized, F> Operator<V> for OperatorFn<F>
where
    F: FnMut(&V, &mut V) -> Result<()>,
{
    fn apply(&mut self, input: &V, output: &mut V) -> Result<()> {
        (self.0)(input, output)
    }
}

/// Wrap a closure as an [`Operator`] on `V`.
pub fn operator_fn<V: ?Sized, F>(f: F) -> OperatorFn<F>
where
    F: FnMut(&V, &mut V) -> Result<()>,
{
    OperatorFn(f)
}
