use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlexcgError {
    #[error("Solve error: {0}")]
    Solve(String),

    /// `p·Ap` was not strictly positive: the operator (or the preconditioned
    /// operator) is not positive definite on the current search direction.
    #[error("CG breakdown at iteration {iteration}: p.Ap = {p_ap:e}")]
    Breakdown { iteration: usize, p_ap: f64 },

    #[error("Dimension error: {0}")]
    Dimension(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, FlexcgError>;
