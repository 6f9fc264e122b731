//! Least-squares refinement of a cell against assigned peak positions.
//!
//! The free parameters are the lattice-constrained reciprocal-metric
//! components, optionally the zero offset and any modulation components
//! flagged for refinement. Steps follow Levenberg-Marquardt on
//! column-scaled normal equations; only steps that do not raise χ² are
//! taken, and a run that cannot find one stops where it is.

use crate::common::RefineControls;
use crate::domain::{
    BravaisLattice, CellParameters, IndexError, IndexResult, ModulationSpec, ObservedPeak,
    ReciprocalMetric, TrialCell, q_coefficients, q_value, reciprocal_tensor,
};
use crate::modules::generator::effective_index;
use crate::modules::instrument::InstrumentModel;
use crate::numerics::{DenseMatrix, is_positive_definite3, lu_invert, lu_solve};
use tracing::debug;

const MAX_LAMBDA_ATTEMPTS: usize = 12;
const LAMBDA_FLOOR: f64 = 1.0e-12;
const CHI_SQUARED_SLACK: f64 = 1.0e-12;

#[derive(Debug, Clone, PartialEq)]
pub struct Refinement {
    pub trial: TrialCell,
    pub zero: f64,
    pub modulation: Option<ModulationSpec>,
    /// Standard uncertainties of `a, b, c, α, β, γ`.
    pub cell_esd: [f64; 6],
    pub zero_esd: Option<f64>,
    pub chi_squared_initial: f64,
    pub chi_squared: f64,
    pub observations: usize,
    pub iterations: usize,
    pub converged: bool,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    hkl: [i32; 3],
    m: i32,
    position: f64,
}

struct RefinementModel<I> {
    bravais: BravaisLattice,
    instrument: I,
    observations: Vec<Observation>,
    metric_count: usize,
    zero_slot: Option<usize>,
    /// `(parameter slot, vector axis)` pairs.
    modulation_slots: Vec<(usize, usize)>,
    modulation: Option<ModulationSpec>,
}

impl<I: InstrumentModel> RefinementModel<I> {
    fn parameter_count(&self) -> usize {
        self.metric_count + usize::from(self.zero_slot.is_some()) + self.modulation_slots.len()
    }

    fn initial_parameters(&self, trial: &TrialCell, zero: f64) -> IndexResult<Vec<f64>> {
        let mut parameters = trial.free_parameters()?;
        if self.zero_slot.is_some() {
            parameters.push(zero);
        }
        if let Some(spec) = &self.modulation {
            for &(_, axis) in &self.modulation_slots {
                parameters.push(spec.vector[axis]);
            }
        }
        Ok(parameters)
    }

    fn metric(&self, parameters: &[f64]) -> ReciprocalMetric {
        self.bravais
            .expand_parameters(&parameters[..self.metric_count])
    }

    fn vector(&self, parameters: &[f64]) -> [f64; 3] {
        let mut vector = self.modulation.map(|spec| spec.vector).unwrap_or([0.0; 3]);
        for &(slot, axis) in &self.modulation_slots {
            vector[axis] = parameters[slot];
        }
        vector
    }

    fn zero(&self, parameters: &[f64], fixed_zero: f64) -> f64 {
        self.zero_slot
            .map(|slot| parameters[slot])
            .unwrap_or(fixed_zero)
    }

    /// Residuals `observed - calculated` and the Jacobian of the calculated
    /// positions; `None` when the parameters leave the physical region.
    fn evaluate(
        &self,
        parameters: &[f64],
        fixed_zero: f64,
        with_jacobian: bool,
    ) -> Option<(Vec<f64>, Option<DenseMatrix>)> {
        if parameters.iter().any(|value| !value.is_finite()) {
            return None;
        }
        let metric = self.metric(parameters);
        let tensor = reciprocal_tensor(&metric);
        if !is_positive_definite3(&tensor) {
            return None;
        }
        let vector = self.vector(parameters);
        let zero = self.zero(parameters, fixed_zero);
        let basis = self.bravais.metric_basis();

        let mut residuals = Vec::with_capacity(self.observations.len());
        let mut jacobian = with_jacobian
            .then(|| DenseMatrix::zeros(self.observations.len(), self.parameter_count()));
        for (row, observation) in self.observations.iter().enumerate() {
            let index = effective_index(observation.hkl, observation.m, vector);
            let q = q_value(&metric, index);
            if !(q.is_finite() && q > 0.0) {
                return None;
            }
            let d = 1.0 / q.sqrt();
            let calculated = self.instrument.position_from_d(d)? + zero;
            residuals.push(observation.position - calculated);

            if let Some(jacobian) = jacobian.as_mut() {
                let dpos_dq = self.instrument.dposition_dd(d)? * (-0.5 * q.powf(-1.5));
                let coefficients = q_coefficients(index);
                for (col, column) in basis.iter().enumerate() {
                    let dq: f64 = column.iter().zip(&coefficients).map(|(b, c)| b * c).sum();
                    jacobian[(row, col)] = dpos_dq * dq;
                }
                if let Some(slot) = self.zero_slot {
                    jacobian[(row, slot)] = 1.0;
                }
                for &(slot, axis) in &self.modulation_slots {
                    let gradient: f64 = (0..3).map(|k| tensor[axis][k] * index[k]).sum();
                    jacobian[(row, slot)] = dpos_dq * 2.0 * f64::from(observation.m) * gradient;
                }
            }
        }
        Some((residuals, jacobian))
    }
}

fn chi_squared(residuals: &[f64]) -> f64 {
    residuals.iter().map(|r| r * r).sum()
}

/// `(JᵀJ, Jᵀr)`.
fn normal_equations(jacobian: &DenseMatrix, residuals: &[f64]) -> (DenseMatrix, Vec<f64>) {
    let columns = jacobian.ncols();
    let mut normal = DenseMatrix::zeros(columns, columns);
    let mut gradient = vec![0.0; columns];
    for row in 0..jacobian.nrows() {
        for i in 0..columns {
            let ji = jacobian[(row, i)];
            gradient[i] += ji * residuals[row];
            for j in 0..columns {
                normal[(i, j)] += ji * jacobian[(row, j)];
            }
        }
    }
    (normal, gradient)
}

pub fn refine_cell<I: InstrumentModel>(
    trial: &TrialCell,
    peaks: &[ObservedPeak],
    instrument: &I,
    controls: &RefineControls,
) -> IndexResult<Refinement> {
    let modulation = controls.modulation;
    let observations: Vec<Observation> = peaks
        .iter()
        .filter(|peak| peak.use_flag && peak.indexed)
        .filter(|peak| modulation.is_some() || peak.m.unwrap_or(0) == 0)
        .map(|peak| Observation {
            hkl: peak.hkl,
            m: peak.m.unwrap_or(0),
            position: peak.position,
        })
        .collect();

    let metric_count = trial.bravais.free_parameter_count();
    let zero_slot = controls.refine_zero.then_some(metric_count);
    let first_modulation_slot = metric_count + usize::from(zero_slot.is_some());
    let modulation_slots: Vec<(usize, usize)> = modulation
        .map(|spec| {
            (0..3)
                .filter(|&axis| spec.refine[axis])
                .enumerate()
                .map(|(offset, axis)| (first_modulation_slot + offset, axis))
                .collect()
        })
        .unwrap_or_default();

    let model = RefinementModel {
        bravais: trial.bravais,
        instrument: instrument.with_zero(0.0),
        observations,
        metric_count,
        zero_slot,
        modulation_slots,
        modulation,
    };
    let parameter_count = model.parameter_count();
    if model.observations.len() < parameter_count {
        return Err(IndexError::convergence(
            "CONVERGENCE.UNDERDETERMINED",
            format!(
                "{} indexed observations cannot determine {} parameters",
                model.observations.len(),
                parameter_count
            ),
        ));
    }

    let fixed_zero = instrument.zero();
    let mut parameters = model.initial_parameters(trial, fixed_zero)?;
    let (mut residuals, _) = model
        .evaluate(&parameters, fixed_zero, false)
        .ok_or_else(|| {
            IndexError::convergence(
                "CONVERGENCE.START",
                "starting cell cannot reproduce the indexed positions",
            )
        })?;
    let chi_squared_initial = chi_squared(&residuals);
    let mut current = chi_squared_initial;
    let mut lambda = controls.initial_lambda.max(LAMBDA_FLOOR);
    let mut iterations = 0;
    let mut converged = false;

    while iterations < controls.max_iterations {
        iterations += 1;
        let Some((_, Some(jacobian))) = model.evaluate(&parameters, fixed_zero, true) else {
            return Err(non_finite_error());
        };
        let (normal, gradient) = normal_equations(&jacobian, &residuals);
        let scales: Vec<f64> = (0..parameter_count)
            .map(|i| normal[(i, i)].sqrt())
            .collect();
        if scales.iter().any(|scale| !(scale.is_finite() && *scale > 0.0)) {
            return Err(singular_error("a parameter has no influence on any position"));
        }

        let mut accepted = None;
        for _ in 0..MAX_LAMBDA_ATTEMPTS {
            let damped = DenseMatrix::from_fn(parameter_count, parameter_count, |i, j| {
                let scaled = normal[(i, j)] / (scales[i] * scales[j]);
                if i == j { scaled + lambda } else { scaled }
            });
            let scaled_gradient: Vec<f64> =
                gradient.iter().zip(&scales).map(|(g, s)| g / s).collect();
            let step = lu_solve(&damped, &scaled_gradient)
                .map_err(|error| singular_error(&error.to_string()))?;
            let shift: Vec<f64> = step.iter().zip(&scales).map(|(x, s)| x / s).collect();
            let trial_parameters: Vec<f64> =
                parameters.iter().zip(&shift).map(|(p, d)| p + d).collect();

            match model.evaluate(&trial_parameters, fixed_zero, false) {
                Some((trial_residuals, _))
                    if chi_squared(&trial_residuals) <= current * (1.0 + CHI_SQUARED_SLACK) =>
                {
                    accepted = Some((trial_parameters, trial_residuals, shift));
                    lambda = (lambda / 10.0).max(LAMBDA_FLOOR);
                    break;
                }
                _ => lambda *= 10.0,
            }
        }

        let Some((next_parameters, next_residuals, shift)) = accepted else {
            debug!(iterations, chi_squared = current, "refinement stalled at a minimum");
            converged = true;
            break;
        };
        let largest_shift = relative_shift(&model, &parameters, &shift);
        parameters = next_parameters;
        residuals = next_residuals;
        current = chi_squared(&residuals);
        debug!(iterations, chi_squared = current, largest_shift, lambda, "refinement step");
        if largest_shift < controls.tolerance {
            converged = true;
            break;
        }
    }

    if current > chi_squared_initial * (1.0 + CHI_SQUARED_SLACK) {
        return Err(IndexError::convergence(
            "CONVERGENCE.DIVERGED",
            format!("chi-squared rose from {chi_squared_initial:e} to {current:e}"),
        ));
    }

    let refined = TrialCell::from_parameters(trial.bravais, &parameters[..metric_count])
        .ok_or_else(non_finite_error)?;
    let zero = model.zero(&parameters, fixed_zero);
    let refined_modulation = modulation.map(|spec| ModulationSpec {
        vector: model.vector(&parameters),
        ..spec
    });

    let (cell_esd, zero_esd) = estimate_uncertainties(&model, &parameters, fixed_zero, current);

    Ok(Refinement {
        trial: refined,
        zero,
        modulation: refined_modulation,
        cell_esd,
        zero_esd,
        chi_squared_initial,
        chi_squared: current,
        observations: model.observations.len(),
        iterations,
        converged,
    })
}

fn relative_shift<I: InstrumentModel>(
    model: &RefinementModel<I>,
    parameters: &[f64],
    shift: &[f64],
) -> f64 {
    let metric_floor = parameters[..model.metric_count]
        .iter()
        .fold(0.0_f64, |acc, value| acc.max(value.abs()))
        * 1.0e-3;
    shift
        .iter()
        .zip(parameters)
        .enumerate()
        .map(|(slot, (delta, value))| {
            let floor = if slot < model.metric_count {
                metric_floor
            } else {
                1.0
            };
            delta.abs() / value.abs().max(floor)
        })
        .fold(0.0, f64::max)
}

/// Covariance `(JᵀJ)⁻¹·σ²` with `σ² = χ²/(n - p)`, propagated onto the cell
/// edges and angles by central differences.
fn estimate_uncertainties<I: InstrumentModel>(
    model: &RefinementModel<I>,
    parameters: &[f64],
    fixed_zero: f64,
    chi_squared: f64,
) -> ([f64; 6], Option<f64>) {
    let unavailable = ([0.0; 6], model.zero_slot.map(|_| 0.0));
    let Some((residuals, Some(jacobian))) = model.evaluate(parameters, fixed_zero, true) else {
        return unavailable;
    };
    let (normal, _) = normal_equations(&jacobian, &residuals);
    let Ok(inverse) = lu_invert(&normal) else {
        debug!("normal matrix not invertible; uncertainties left at zero");
        return unavailable;
    };
    let freedom = residuals.len().saturating_sub(parameters.len()).max(1);
    let variance = chi_squared / freedom as f64;

    let metric_parameters = &parameters[..model.metric_count];
    let mut gradients = vec![[0.0; 6]; model.metric_count];
    for (slot, gradient) in gradients.iter_mut().enumerate() {
        let step = (metric_parameters[slot].abs() * 1.0e-6).max(1.0e-10);
        let mut plus = metric_parameters.to_vec();
        let mut minus = metric_parameters.to_vec();
        plus[slot] += step;
        minus[slot] -= step;
        let cell_at = |values: &[f64]| {
            CellParameters::from_reciprocal_metric(&model.bravais.expand_parameters(values))
        };
        let (Some(upper), Some(lower)) = (cell_at(&plus), cell_at(&minus)) else {
            return unavailable;
        };
        for (k, value) in gradient.iter_mut().enumerate() {
            *value = (upper.as_array()[k] - lower.as_array()[k]) / (2.0 * step);
        }
    }

    let mut cell_esd = [0.0; 6];
    for (k, esd) in cell_esd.iter_mut().enumerate() {
        let mut sum = 0.0;
        for i in 0..model.metric_count {
            for j in 0..model.metric_count {
                sum += gradients[i][k] * inverse[(i, j)] * gradients[j][k];
            }
        }
        *esd = (sum.max(0.0) * variance).sqrt();
    }
    let zero_esd = model
        .zero_slot
        .map(|slot| (inverse[(slot, slot)].max(0.0) * variance).sqrt());
    (cell_esd, zero_esd)
}

fn non_finite_error() -> IndexError {
    IndexError::convergence(
        "CONVERGENCE.NON_FINITE",
        "refinement left the physical parameter region",
    )
}

fn singular_error(detail: &str) -> IndexError {
    IndexError::convergence(
        "CONVERGENCE.SINGULAR",
        format!("normal equations are singular: {detail}"),
    )
}

#[cfg(test)]
mod tests {
    use super::refine_cell;
    use crate::common::RefineControls;
    use crate::domain::{BravaisLattice, CellParameters, ModulationSpec, ObservedPeak, TrialCell};
    use crate::modules::generator::{d_spacing, effective_index};
    use crate::modules::instrument::{InstrumentGeometry, InstrumentModel};

    fn indexed_peaks(
        trial: &TrialCell,
        geometry: &InstrumentGeometry,
        indices: &[[i32; 3]],
    ) -> Vec<ObservedPeak> {
        let metric = trial.reciprocal_metric().expect("metric");
        indices
            .iter()
            .map(|&hkl| {
                let d = d_spacing(&metric, hkl.map(f64::from)).expect("d");
                let mut peak =
                    ObservedPeak::new(geometry.position_from_d(d).expect("position"), 100.0);
                peak.indexed = true;
                peak.hkl = hkl;
                peak
            })
            .collect()
    }

    #[test]
    fn cubic_cell_converges_to_the_generating_edge() {
        let geometry = InstrumentGeometry::constant_wavelength(1.5406);
        let truth = TrialCell::new(BravaisLattice::CubicF, CellParameters::cubic(4.05));
        let peaks = indexed_peaks(
            &truth,
            &geometry,
            &[[1, 1, 1], [2, 0, 0], [2, 2, 0], [3, 1, 1], [2, 2, 2]],
        );
        let start = TrialCell::new(BravaisLattice::CubicF, CellParameters::cubic(4.07));
        let refinement =
            refine_cell(&start, &peaks, &geometry, &RefineControls::default()).expect("refines");
        assert!(refinement.converged);
        assert!((refinement.trial.cell.a - 4.05).abs() < 1.0e-7);
        assert!(refinement.chi_squared < refinement.chi_squared_initial);
        assert_eq!(refinement.trial.cell.b, refinement.trial.cell.a);
    }

    #[test]
    fn zero_offset_is_recovered() {
        let geometry = InstrumentGeometry::constant_wavelength(1.5406);
        let truth = TrialCell::new(
            BravaisLattice::TetragonalP,
            CellParameters::new(3.9, 3.9, 5.2, 90.0, 90.0, 90.0),
        );
        let shifted = geometry.with_zero(0.03);
        let peaks = indexed_peaks(
            &truth,
            &shifted,
            &[[0, 0, 1], [1, 0, 0], [1, 0, 1], [1, 1, 0], [1, 1, 1], [0, 0, 2], [2, 0, 0]],
        );
        let start = TrialCell::new(
            BravaisLattice::TetragonalP,
            CellParameters::new(3.91, 3.91, 5.19, 90.0, 90.0, 90.0),
        );
        let controls = RefineControls {
            refine_zero: true,
            ..RefineControls::default()
        };
        let refinement = refine_cell(&start, &peaks, &geometry, &controls).expect("refines");
        assert!((refinement.zero - 0.03).abs() < 1.0e-6, "{}", refinement.zero);
        assert!((refinement.trial.cell.c - 5.2).abs() < 1.0e-6);
        assert!(refinement.zero_esd.is_some());
    }

    #[test]
    fn too_few_observations_is_a_convergence_error() {
        let geometry = InstrumentGeometry::DSpacing { zero: 0.0 };
        let trial = TrialCell::new(
            BravaisLattice::OrthorhombicP,
            CellParameters::new(3.0, 4.0, 5.0, 90.0, 90.0, 90.0),
        );
        let peaks = indexed_peaks(&trial, &geometry, &[[1, 0, 0], [0, 1, 0]]);
        let error = refine_cell(&trial, &peaks, &geometry, &RefineControls::default())
            .expect_err("two lines cannot fix three edges");
        assert_eq!(error.placeholder(), "CONVERGENCE.UNDERDETERMINED");
    }

    #[test]
    fn unconstrained_axis_is_singular() {
        let geometry = InstrumentGeometry::DSpacing { zero: 0.0 };
        let trial = TrialCell::new(
            BravaisLattice::TetragonalP,
            CellParameters::new(4.0, 4.0, 6.0, 90.0, 90.0, 90.0),
        );
        let peaks = indexed_peaks(&trial, &geometry, &[[1, 0, 0], [1, 1, 0], [2, 0, 0]]);
        let error = refine_cell(&trial, &peaks, &geometry, &RefineControls::default())
            .expect_err("no l-dependent line");
        assert_eq!(error.placeholder(), "CONVERGENCE.SINGULAR");
    }

    #[test]
    fn modulation_component_is_refined() {
        let geometry = InstrumentGeometry::DSpacing { zero: 0.0 };
        let trial = TrialCell::new(
            BravaisLattice::OrthorhombicP,
            CellParameters::new(4.0, 5.0, 6.0, 90.0, 90.0, 90.0),
        );
        let metric = trial.reciprocal_metric().expect("metric");
        let truth = [0.0, 0.0, 0.31];
        let lines: [([i32; 3], i32); 6] = [
            ([1, 0, 0], 0),
            ([0, 1, 0], 0),
            ([0, 0, 1], 0),
            ([0, 0, 0], 1),
            ([1, 0, 0], 1),
            ([0, 1, 1], -1),
        ];
        let peaks: Vec<ObservedPeak> = lines
            .iter()
            .map(|&(hkl, m)| {
                let d = d_spacing(&metric, effective_index(hkl, m, truth)).expect("d");
                let mut peak = ObservedPeak::new(d, 10.0);
                peak.indexed = true;
                peak.hkl = hkl;
                peak.m = Some(m);
                peak
            })
            .collect();
        let mut spec = ModulationSpec::new([0.0, 0.0, 0.3], 1);
        spec.refine = [false, false, true];
        let controls = RefineControls {
            modulation: Some(spec),
            ..RefineControls::default()
        };
        let refinement = refine_cell(&trial, &peaks, &geometry, &controls).expect("refines");
        let vector = refinement.modulation.expect("modulation kept").vector;
        assert!((vector[2] - 0.31).abs() < 1.0e-6, "{vector:?}");
    }
}
