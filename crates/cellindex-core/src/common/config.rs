//! Serde-backed controls for the search driver and the refiner.
//!
//! Every threshold the algorithms consult lives here so that persisted
//! documents and the CLI can override it; missing keys fall back to the
//! defaults in `common::constants`.

use super::constants::*;
use crate::domain::{BravaisLattice, IndexError, IndexResult, ModulationSpec};
use serde::{Deserialize, Serialize};

/// Peak-to-reflection matching window in instrument position units:
/// `absolute + relative·|position|`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchTolerance {
    #[serde(default)]
    pub absolute: f64,
    #[serde(default)]
    pub relative: f64,
}

impl MatchTolerance {
    pub const fn absolute(value: f64) -> Self {
        Self {
            absolute: value,
            relative: 0.0,
        }
    }

    pub const fn relative(value: f64) -> Self {
        Self {
            absolute: 0.0,
            relative: value,
        }
    }

    pub fn window(&self, position: f64) -> f64 {
        self.absolute + self.relative * position.abs()
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            absolute: self.absolute * factor,
            relative: self.relative * factor,
        }
    }

    pub fn validate(&self) -> IndexResult<()> {
        let finite = self.absolute.is_finite() && self.relative.is_finite();
        if !finite || self.absolute < 0.0 || self.relative < 0.0 || self.window(1.0) <= 0.0 {
            return Err(IndexError::input(
                "INPUT.TOLERANCE",
                format!("match tolerance {self:?} must be positive"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexingControls {
    pub enabled_lattices: Vec<BravaisLattice>,
    pub d_min: f64,
    pub start_volume: f64,
    /// Upper bound on generated reflections per observed line; bounds the
    /// volume sweep of every lattice.
    pub max_nc_ratio: f64,
    /// `None` selects the instrument's default window.
    pub tolerance: Option<MatchTolerance>,
    pub trial_tolerance_scale: f64,
    pub min_m20: f64,
    pub max_unindexed: usize,
    pub max_candidates_per_lattice: usize,
    pub max_trials_per_lattice: usize,
    pub trial_refine_iterations: usize,
    /// Divide M20 by `X20 + 1`.
    pub x20_mode: bool,
    pub refine_zero: bool,
}

impl Default for IndexingControls {
    fn default() -> Self {
        Self {
            enabled_lattices: BravaisLattice::ALL.to_vec(),
            d_min: DEFAULT_D_MIN,
            start_volume: DEFAULT_START_VOLUME,
            max_nc_ratio: DEFAULT_MAX_NC_RATIO,
            tolerance: None,
            trial_tolerance_scale: DEFAULT_TRIAL_TOLERANCE_SCALE,
            min_m20: DEFAULT_MIN_M20,
            max_unindexed: DEFAULT_MAX_UNINDEXED,
            max_candidates_per_lattice: DEFAULT_MAX_CANDIDATES_PER_LATTICE,
            max_trials_per_lattice: DEFAULT_MAX_TRIALS_PER_LATTICE,
            trial_refine_iterations: DEFAULT_TRIAL_REFINE_ITERATIONS,
            x20_mode: false,
            refine_zero: false,
        }
    }
}

impl IndexingControls {
    pub fn validate(&self) -> IndexResult<()> {
        if self.enabled_lattices.is_empty() {
            return Err(IndexError::input(
                "INPUT.NO_LATTICE",
                "no Bravais lattice is enabled for the search",
            ));
        }
        if !(self.d_min.is_finite() && self.d_min > 0.0) {
            return Err(IndexError::input(
                "INPUT.D_MIN",
                format!("resolution limit d_min={} must be positive", self.d_min),
            ));
        }
        if !(self.max_nc_ratio.is_finite() && self.max_nc_ratio >= 1.0) {
            return Err(IndexError::input(
                "INPUT.NC_RATIO",
                format!("max_nc_ratio={} must be at least 1", self.max_nc_ratio),
            ));
        }
        if !(self.trial_tolerance_scale.is_finite() && self.trial_tolerance_scale >= 1.0) {
            return Err(IndexError::input(
                "INPUT.TOLERANCE",
                "trial_tolerance_scale must be at least 1",
            ));
        }
        if !self.start_volume.is_finite() || self.start_volume < 0.0 {
            return Err(IndexError::input(
                "INPUT.START_VOLUME",
                format!("start volume {} must be non-negative", self.start_volume),
            ));
        }
        if self.max_candidates_per_lattice == 0 || self.max_trials_per_lattice == 0 {
            return Err(IndexError::input(
                "INPUT.SEARCH_CAPS",
                "per-lattice candidate and trial caps must be non-zero",
            ));
        }
        if let Some(tolerance) = &self.tolerance {
            tolerance.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RefineControls {
    pub refine_zero: bool,
    pub modulation: Option<ModulationSpec>,
    pub max_iterations: usize,
    /// Largest relative parameter shift accepted as converged.
    pub tolerance: f64,
    pub initial_lambda: f64,
}

impl Default for RefineControls {
    fn default() -> Self {
        Self {
            refine_zero: false,
            modulation: None,
            max_iterations: DEFAULT_REFINE_MAX_ITERATIONS,
            tolerance: DEFAULT_REFINE_TOLERANCE,
            initial_lambda: DEFAULT_REFINE_LAMBDA,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{IndexingControls, MatchTolerance};

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let controls: IndexingControls =
            serde_json::from_str(r#"{ "dMin": 1.5, "x20Mode": true }"#).expect("controls parse");
        assert_eq!(controls.d_min, 1.5);
        assert!(controls.x20_mode);
        assert_eq!(controls.enabled_lattices.len(), 14);
        assert!(controls.validate().is_ok());
    }

    #[test]
    fn invalid_controls_are_input_errors() {
        let controls = IndexingControls {
            enabled_lattices: Vec::new(),
            ..IndexingControls::default()
        };
        let error = controls.validate().expect_err("empty lattice set must fail");
        assert_eq!(error.placeholder(), "INPUT.NO_LATTICE");

        let controls = IndexingControls {
            tolerance: Some(MatchTolerance::absolute(0.0)),
            ..IndexingControls::default()
        };
        assert!(controls.validate().is_err());
    }

    #[test]
    fn tolerance_window_combines_terms() {
        let tolerance = MatchTolerance {
            absolute: 0.1,
            relative: 0.01,
        };
        assert!((tolerance.window(-20.0) - 0.3).abs() < 1.0e-12);
        assert!((tolerance.scaled(2.0).window(0.0) - 0.2).abs() < 1.0e-12);
    }
}
