//! Conversions between d-spacing and the observable instrument axis.

use crate::common::MatchTolerance;
use crate::common::constants::{
    DEFAULT_TOLERANCE_D_RELATIVE, DEFAULT_TOLERANCE_TOF_RELATIVE, DEFAULT_TOLERANCE_TWO_THETA,
    RADDEG,
};
use crate::domain::{IndexError, IndexResult};
use serde::{Deserialize, Serialize};

const TOF_NEWTON_ITERATIONS: usize = 50;
const TOF_NEWTON_TOLERANCE: f64 = 1.0e-12;

pub trait InstrumentModel {
    /// Observable position for a d-spacing, including the zero offset.
    fn position_from_d(&self, d: f64) -> Option<f64>;

    fn d_from_position(&self, position: f64) -> Option<f64>;

    /// Derivative of the position with respect to d (zero offset excluded).
    fn dposition_dd(&self, d: f64) -> Option<f64>;

    fn zero(&self) -> f64;

    fn with_zero(&self, zero: f64) -> Self
    where
        Self: Sized;

    fn default_tolerance(&self) -> MatchTolerance;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InstrumentGeometry {
    /// Bragg two-theta in degrees.
    #[serde(rename_all = "camelCase")]
    ConstantWavelength { wavelength: f64, zero: f64 },
    /// `tof = difc·d + difa·d² + difb/d + zero`.
    #[serde(rename_all = "camelCase")]
    TimeOfFlight {
        difc: f64,
        difa: f64,
        difb: f64,
        zero: f64,
    },
    /// Positions already reduced to d-spacing.
    #[serde(rename_all = "camelCase")]
    DSpacing { zero: f64 },
}

impl Default for InstrumentGeometry {
    fn default() -> Self {
        Self::ConstantWavelength {
            wavelength: 1.5406,
            zero: 0.0,
        }
    }
}

impl InstrumentGeometry {
    pub fn constant_wavelength(wavelength: f64) -> Self {
        Self::ConstantWavelength {
            wavelength,
            zero: 0.0,
        }
    }

    pub fn time_of_flight(difc: f64, difa: f64, difb: f64) -> Self {
        Self::TimeOfFlight {
            difc,
            difa,
            difb,
            zero: 0.0,
        }
    }

    pub fn validate(&self) -> IndexResult<()> {
        let valid = match *self {
            Self::ConstantWavelength { wavelength, zero } => {
                wavelength.is_finite() && wavelength > 0.0 && zero.is_finite()
            }
            Self::TimeOfFlight {
                difc,
                difa,
                difb,
                zero,
            } => {
                difc.is_finite()
                    && difc > 0.0
                    && difa.is_finite()
                    && difb.is_finite()
                    && zero.is_finite()
            }
            Self::DSpacing { zero } => zero.is_finite(),
        };
        if valid {
            Ok(())
        } else {
            Err(IndexError::input(
                "INPUT.INSTRUMENT",
                format!("instrument parameters {self:?} are not usable"),
            ))
        }
    }
}

impl InstrumentModel for InstrumentGeometry {
    fn position_from_d(&self, d: f64) -> Option<f64> {
        if !(d.is_finite() && d > 0.0) {
            return None;
        }
        match *self {
            Self::ConstantWavelength { wavelength, zero } => {
                let sine = wavelength / (2.0 * d);
                (sine <= 1.0).then(|| 2.0 * sine.asin() * RADDEG + zero)
            }
            Self::TimeOfFlight {
                difc,
                difa,
                difb,
                zero,
            } => Some(difc * d + difa * d * d + difb / d + zero),
            Self::DSpacing { zero } => Some(d + zero),
        }
    }

    fn d_from_position(&self, position: f64) -> Option<f64> {
        if !position.is_finite() {
            return None;
        }
        match *self {
            Self::ConstantWavelength { wavelength, zero } => {
                let theta = (position - zero) / (2.0 * RADDEG);
                let sine = theta.sin();
                (theta > 0.0 && sine > 0.0).then(|| wavelength / (2.0 * sine))
            }
            Self::TimeOfFlight {
                difc,
                difa,
                difb,
                zero,
            } => {
                let target = position - zero;
                let mut d = target / difc;
                if d <= 0.0 {
                    return None;
                }
                for _ in 0..TOF_NEWTON_ITERATIONS {
                    let value = difc * d + difa * d * d + difb / d - target;
                    let slope = difc + 2.0 * difa * d - difb / (d * d);
                    if slope.abs() < f64::EPSILON {
                        return None;
                    }
                    let step = value / slope;
                    d -= step;
                    if d <= 0.0 {
                        return None;
                    }
                    if step.abs() <= TOF_NEWTON_TOLERANCE * d {
                        return Some(d);
                    }
                }
                None
            }
            Self::DSpacing { zero } => {
                let d = position - zero;
                (d > 0.0).then_some(d)
            }
        }
    }

    fn dposition_dd(&self, d: f64) -> Option<f64> {
        if !(d.is_finite() && d > 0.0) {
            return None;
        }
        match *self {
            Self::ConstantWavelength { wavelength, .. } => {
                let sine = wavelength / (2.0 * d);
                if sine >= 1.0 {
                    return None;
                }
                let cosine = (1.0 - sine * sine).sqrt();
                Some(-2.0 * sine / (d * cosine) * RADDEG)
            }
            Self::TimeOfFlight {
                difc, difa, difb, ..
            } => Some(difc + 2.0 * difa * d - difb / (d * d)),
            Self::DSpacing { .. } => Some(1.0),
        }
    }

    fn zero(&self) -> f64 {
        match *self {
            Self::ConstantWavelength { zero, .. }
            | Self::TimeOfFlight { zero, .. }
            | Self::DSpacing { zero } => zero,
        }
    }

    fn with_zero(&self, zero: f64) -> Self {
        let mut updated = *self;
        match &mut updated {
            Self::ConstantWavelength { zero: slot, .. }
            | Self::TimeOfFlight { zero: slot, .. }
            | Self::DSpacing { zero: slot } => *slot = zero,
        }
        updated
    }

    fn default_tolerance(&self) -> MatchTolerance {
        match self {
            Self::ConstantWavelength { .. } => MatchTolerance::absolute(DEFAULT_TOLERANCE_TWO_THETA),
            Self::TimeOfFlight { .. } => MatchTolerance::relative(DEFAULT_TOLERANCE_TOF_RELATIVE),
            Self::DSpacing { .. } => MatchTolerance::relative(DEFAULT_TOLERANCE_D_RELATIVE),
        }
    }
}
