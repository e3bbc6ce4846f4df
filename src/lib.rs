//! Distributed preconditioned / flexible conjugate gradient solver.
//!
//! The core is [`solver::pcg::Pcg`]: a PCG/FPCG driver that runs on any
//! [`solver::backend::Device`], reduces scalars through a
//! [`solver::comm::CommunicationBackend`], draws its scratch vectors from a
//! [`solver::pool::MemoryPool`] and applies the preconditioner through a
//! mixed-precision bridge.

pub mod config;
pub mod error;
pub mod solver;
pub mod sparse;
pub mod stats;

pub use config::{PcgConfig, StoppingCriterion, Variant};
pub use error::{FlexcgError, Result};
pub use solver::backend::{Device, HostDevice};
pub use solver::pcg::{Pcg, SolveSummary};
pub use solver::Operator;
