//! Shared defaults for the indexing engine.
//!
//! The `DEFAULT_*` values seed `common::config`. The figure-of-merit and
//! duplicate constants are fixed and read directly by the scorer and the
//! search driver.

pub const RADDEG: f64 = 180.0 / std::f64::consts::PI;

/// Number of low-angle lines used by the de Wolff figure of merit.
pub const FIGURE_OF_MERIT_WINDOW: usize = 20;
/// Lower bound on the mean `|ΔQ|` so an exact fit has a finite M20.
pub const MIN_MEAN_Q_DISCREPANCY: f64 = 1.0e-7;
/// Share of the matching window, in Q, below which two fits are equally exact.
pub const EXACT_FIT_FRACTION: f64 = 0.01;

pub const DEFAULT_D_MIN: f64 = 1.0;
pub const DEFAULT_START_VOLUME: f64 = 25.0;
pub const DEFAULT_MAX_NC_RATIO: f64 = 6.0;
pub const DEFAULT_MIN_M20: f64 = 5.0;
pub const DEFAULT_MAX_UNINDEXED: usize = 2;
pub const DEFAULT_MAX_CANDIDATES_PER_LATTICE: usize = 20;
pub const DEFAULT_MAX_TRIALS_PER_LATTICE: usize = 40_000;
pub const DEFAULT_TRIAL_TOLERANCE_SCALE: f64 = 4.0;
pub const DEFAULT_TRIAL_REFINE_ITERATIONS: usize = 8;
/// Relative agreement of the reciprocal metric below which two cells are duplicates.
pub const DUPLICATE_METRIC_TOLERANCE: f64 = 2.0e-3;

pub const DEFAULT_REFINE_MAX_ITERATIONS: usize = 50;
pub const DEFAULT_REFINE_TOLERANCE: f64 = 1.0e-9;
pub const DEFAULT_REFINE_LAMBDA: f64 = 1.0e-3;

pub const DEFAULT_TOLERANCE_TWO_THETA: f64 = 0.05;
pub const DEFAULT_TOLERANCE_TOF_RELATIVE: f64 = 2.0e-3;
pub const DEFAULT_TOLERANCE_D_RELATIVE: f64 = 5.0e-4;

pub const DEFAULT_MAX_UNIQUE_ATOMS: usize = 100;
pub const DEFAULT_SERVICE_TIMEOUT_SECS: u64 = 60;

#[cfg(test)]
mod tests {
    use super::{
        DEFAULT_MAX_NC_RATIO, DEFAULT_MIN_M20, DEFAULT_TRIAL_TOLERANCE_SCALE, EXACT_FIT_FRACTION,
        FIGURE_OF_MERIT_WINDOW, MIN_MEAN_Q_DISCREPANCY, RADDEG,
    };

    #[test]
    fn defaults_are_sane() {
        assert!((RADDEG * std::f64::consts::PI - 180.0).abs() < 1.0e-12);
        assert_eq!(FIGURE_OF_MERIT_WINDOW, 20);
        assert!(MIN_MEAN_Q_DISCREPANCY > 0.0);
        assert!(EXACT_FIT_FRACTION > 0.0 && EXACT_FIT_FRACTION < 1.0);
        assert!(DEFAULT_MAX_NC_RATIO > 1.0);
        assert!(DEFAULT_MIN_M20 > 0.0);
        assert!(DEFAULT_TRIAL_TOLERANCE_SCALE >= 1.0);
    }
}
