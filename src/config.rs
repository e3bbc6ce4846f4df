//! Solver configuration.
//!
//! The enum spellings follow the settings vocabulary of the surrounding
//! simulation code (`"PCG"`, `"FPCG"`, `"ABS/REL-RHS-2NORM"`,
//! `"ABS/REL-INITRESID"`), so a settings file written for it can be loaded
//! unchanged.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FlexcgError, Result};

/// CG variant, fixed when the solver is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Variant {
    /// Standard PCG: `beta = rdotz1 / rdotz2`.
    #[default]
    #[serde(rename = "PCG", alias = "pcg")]
    Standard,
    /// Flexible PCG: `beta = -alpha * (z . Ap_prev) / rdotz2`. Tolerates a
    /// preconditioner that changes between iterations at the cost of one
    /// extra inner product per iteration.
    #[serde(rename = "FPCG", alias = "fpcg")]
    Flexible,
}

impl Variant {
    pub fn is_flexible(self) -> bool {
        matches!(self, Variant::Flexible)
    }
}

impl FromStr for Variant {
    type Err = FlexcgError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PCG" => Ok(Variant::Standard),
            "FPCG" => Ok(Variant::Flexible),
            other => Err(FlexcgError::Config(format!(
                "unknown linear solver variant '{other}' (expected PCG or FPCG)"
            ))),
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Standard => f.write_str("PCG"),
            Variant::Flexible => f.write_str("FPCG"),
        }
    }
}

/// What the tolerance is measured against.
///
/// Both modes produce `TOL = max(tol^2 * ref^2, tol^2)` on the squared
/// residual norm, i.e. an absolute floor of `tol` with a relative target
/// above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StoppingCriterion {
    /// Relative to the 2-norm of the right-hand side.
    #[default]
    #[serde(rename = "ABS/REL-RHS-2NORM")]
    RhsNorm,
    /// Relative to the 2-norm of the initial residual `b - A x0`.
    #[serde(rename = "ABS/REL-INITRESID")]
    InitialResidual,
}

impl FromStr for StoppingCriterion {
    type Err = FlexcgError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ABS/REL-RHS-2NORM" | "RHS" => Ok(StoppingCriterion::RhsNorm),
            "ABS/REL-INITRESID" | "INITRESID" => Ok(StoppingCriterion::InitialResidual),
            other => Err(FlexcgError::Config(format!(
                "unknown stopping criterion '{other}' \
                 (expected ABS/REL-RHS-2NORM or ABS/REL-INITRESID)"
            ))),
        }
    }
}

impl fmt::Display for StoppingCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoppingCriterion::RhsNorm => f.write_str("ABS/REL-RHS-2NORM"),
            StoppingCriterion::InitialResidual => f.write_str("ABS/REL-INITRESID"),
        }
    }
}

/// Solver settings. Every field has a default so partial TOML files load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PcgConfig {
    pub variant: Variant,
    pub stopping_criterion: StoppingCriterion,
    pub tolerance: f64,
    pub max_iterations: usize,
    pub verbose: bool,
    /// Keep the residual norm of every iteration in the solve summary.
    pub record_history: bool,
}

impl Default for PcgConfig {
    fn default() -> Self {
        Self {
            variant: Variant::Standard,
            stopping_criterion: StoppingCriterion::RhsNorm,
            tolerance: 1e-8,
            max_iterations: 5000,
            verbose: false,
            record_history: false,
        }
    }
}

impl PcgConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: PcgConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance.is_finite() && self.tolerance >= 0.0) {
            return Err(FlexcgError::Config(format!(
                "tolerance must be a finite non-negative number, got {}",
                self.tolerance
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_accepts_settings_names() {
        assert_eq!("PCG".parse::<Variant>().unwrap(), Variant::Standard);
        assert_eq!("fpcg".parse::<Variant>().unwrap(), Variant::Flexible);
        assert!("GMRES".parse::<Variant>().is_err());
        assert_eq!(Variant::Flexible.to_string(), "FPCG");
    }

    #[test]
    fn stopping_criterion_round_trips_through_display() {
        for c in [StoppingCriterion::RhsNorm, StoppingCriterion::InitialResidual] {
            assert_eq!(c.to_string().parse::<StoppingCriterion>().unwrap(), c);
        }
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config = PcgConfig::from_toml_str(
            r#"
variant = "FPCG"
stopping_criterion = "ABS/REL-INITRESID"
tolerance = 1e-6
"#,
        )
        .unwrap();
        assert_eq!(config.variant, Variant::Flexible);
        assert_eq!(config.stopping_criterion, StoppingCriterion::InitialResidual);
        assert_eq!(config.tolerance, 1e-6);
        assert_eq!(config.max_iterations, PcgConfig::default().max_iterations);
        assert!(!config.verbose);
    }

    #[test]
    fn rejects_unknown_keys_and_bad_tolerance() {
        assert!(PcgConfig::from_toml_str("tolerence = 1e-6").is_err());
        let err = PcgConfig::from_toml_str("tolerance = -1.0").unwrap_err();
        assert!(format!("{err}").contains("Config error"));
    }
}
