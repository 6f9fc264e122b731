//! Enumeration of symmetry-allowed reflections for a trial cell.

use crate::domain::{
    IndexError, IndexResult, ModulationSpec, ReciprocalMetric, ReflectionHkl, TrialCell, q_value,
};
use crate::modules::instrument::InstrumentModel;
use crate::modules::spacegroup::{SpaceGroup, canonical_hkl, laue_operators};

const CONSTRAINT_TOLERANCE: f64 = 1.0e-6;
const Q_LIMIT_SLACK: f64 = 1.0e-12;

/// Effective index `hkl + m·q`.
pub fn effective_index(hkl: [i32; 3], m: i32, vector: [f64; 3]) -> [f64; 3] {
    [
        f64::from(hkl[0]) + f64::from(m) * vector[0],
        f64::from(hkl[1]) + f64::from(m) * vector[1],
        f64::from(hkl[2]) + f64::from(m) * vector[2],
    ]
}

pub fn d_spacing(metric: &ReciprocalMetric, index: [f64; 3]) -> Option<f64> {
    let q = q_value(metric, index);
    (q.is_finite() && q > 0.0).then(|| 1.0 / q.sqrt())
}

/// Every reflection with `d >= d_min` that the space group allows, one per
/// Laue-equivalent set, sorted by d descending.
///
/// With a modulation spec, satellites `m = 1..=max_m` are added over the
/// full hkl sphere (the `-m` partners are Friedel mates) and main
/// reflections carry `m = Some(0)`. Reflections the instrument cannot
/// observe (e.g. beyond 2θ = 180°) are dropped.
pub fn generate_reflections<I: InstrumentModel>(
    trial: &TrialCell,
    space_group: &SpaceGroup,
    d_min: f64,
    instrument: &I,
    modulation: Option<&ModulationSpec>,
) -> IndexResult<Vec<ReflectionHkl>> {
    if !(d_min.is_finite() && d_min > 0.0) {
        return Err(IndexError::input(
            "INPUT.D_MIN",
            format!("resolution limit d_min={d_min} must be positive"),
        ));
    }
    trial.cell.validate()?;
    if !trial.bravais.satisfies(&trial.cell, CONSTRAINT_TOLERANCE) {
        return Err(IndexError::input(
            "INPUT.CELL_CONSTRAINT",
            format!(
                "cell {:?} violates the {} lattice constraints",
                trial.cell.as_array(),
                trial.bravais
            ),
        ));
    }
    if let Some(spec) = modulation {
        validate_modulation(spec)?;
    }

    let metric = trial.reciprocal_metric()?;
    let q_max = 1.0 / (d_min * d_min) * (1.0 + Q_LIMIT_SLACK);
    let operators = laue_operators(space_group.laue);
    let lengths = [trial.cell.a, trial.cell.b, trial.cell.c];
    let main_bounds = lengths.map(|length| (length / d_min).floor() as i32);

    let mut reflections = Vec::new();
    let main_m = modulation.map(|_| 0);
    for h in -main_bounds[0]..=main_bounds[0] {
        for k in -main_bounds[1]..=main_bounds[1] {
            for l in -main_bounds[2]..=main_bounds[2] {
                let hkl = [h, k, l];
                if hkl == [0, 0, 0] || space_group.is_systematically_absent(hkl) {
                    continue;
                }
                let q = q_value(&metric, hkl.map(f64::from));
                if q > q_max {
                    continue;
                }
                let (representative, multiplicity) = canonical_hkl(&operators, hkl);
                if representative != hkl {
                    continue;
                }
                push_reflection(&mut reflections, instrument, hkl, main_m, q, multiplicity);
            }
        }
    }

    if let Some(spec) = modulation {
        let max_m = i32::from(spec.max_m);
        let satellite_bounds: Vec<i32> = (0..3)
            .map(|axis| {
                (lengths[axis] / d_min + f64::from(max_m) * spec.vector[axis].abs()).ceil() as i32
            })
            .collect();
        for m in 1..=max_m {
            for h in -satellite_bounds[0]..=satellite_bounds[0] {
                for k in -satellite_bounds[1]..=satellite_bounds[1] {
                    for l in -satellite_bounds[2]..=satellite_bounds[2] {
                        let hkl = [h, k, l];
                        if space_group.is_systematically_absent(hkl) {
                            continue;
                        }
                        let q = q_value(&metric, effective_index(hkl, m, spec.vector));
                        if q <= 0.0 || q > q_max {
                            continue;
                        }
                        push_reflection(&mut reflections, instrument, hkl, Some(m), q, 2);
                    }
                }
            }
        }
    }

    reflections.sort_by(|left, right| {
        right
            .d
            .total_cmp(&left.d)
            .then_with(|| right.full_index().cmp(&left.full_index()))
    });
    Ok(reflections)
}

fn push_reflection<I: InstrumentModel>(
    reflections: &mut Vec<ReflectionHkl>,
    instrument: &I,
    hkl: [i32; 3],
    m: Option<i32>,
    q: f64,
    multiplicity: usize,
) {
    let d = 1.0 / q.sqrt();
    if let Some(position) = instrument.position_from_d(d) {
        reflections.push(ReflectionHkl {
            hkl,
            m,
            d,
            position,
            multiplicity,
        });
    }
}

pub(crate) fn validate_modulation(spec: &ModulationSpec) -> IndexResult<()> {
    if !(1..=3).contains(&spec.max_m) {
        return Err(IndexError::input(
            "INPUT.MODULATION",
            format!("maximum satellite order {} must be 1..=3", spec.max_m),
        ));
    }
    if spec.vector.iter().any(|component| !component.is_finite()) {
        return Err(IndexError::input(
            "INPUT.MODULATION",
            format!("modulation vector {:?} is not finite", spec.vector),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::generate_reflections;
    use crate::domain::{BravaisLattice, CellParameters, ModulationSpec, TrialCell};
    use crate::modules::instrument::InstrumentGeometry;
    use crate::modules::spacegroup::SpaceGroup;

    fn d_geometry() -> InstrumentGeometry {
        InstrumentGeometry::DSpacing { zero: 0.0 }
    }

    #[test]
    fn face_centred_cubic_lines_follow_allowed_sums() {
        let trial = TrialCell::new(BravaisLattice::CubicF, CellParameters::cubic(4.05));
        let group = SpaceGroup::from_bravais(BravaisLattice::CubicF);
        let reflections =
            generate_reflections(&trial, &group, 1.0, &d_geometry(), None).expect("generation");
        let indices: Vec<[i32; 3]> = reflections.iter().map(|r| r.hkl).collect();
        assert_eq!(
            indices,
            vec![[1, 1, 1], [2, 0, 0], [2, 2, 0], [3, 1, 1], [2, 2, 2], [4, 0, 0]]
        );
        assert_eq!(reflections[0].multiplicity, 8);
        assert_eq!(reflections[1].multiplicity, 6);
        assert!((reflections[0].d - 4.05 / 3.0_f64.sqrt()).abs() < 1.0e-12);
    }

    #[test]
    fn primitive_tetragonal_splits_cubic_lines() {
        let trial = TrialCell::new(
            BravaisLattice::TetragonalP,
            CellParameters::new(4.0, 4.0, 6.0, 90.0, 90.0, 90.0),
        );
        let group = SpaceGroup::from_bravais(BravaisLattice::TetragonalP);
        let reflections =
            generate_reflections(&trial, &group, 2.1, &d_geometry(), None).expect("generation");
        let indices: Vec<[i32; 3]> = reflections.iter().map(|r| r.hkl).collect();
        assert_eq!(
            indices,
            vec![
                [0, 0, 1],
                [1, 0, 0],
                [1, 0, 1],
                [0, 0, 2],
                [1, 1, 0],
                [1, 1, 1],
                [1, 0, 2]
            ]
        );
    }

    #[test]
    fn rejects_non_positive_resolution_and_broken_constraints() {
        let group = SpaceGroup::from_bravais(BravaisLattice::CubicP);
        let trial = TrialCell::new(BravaisLattice::CubicP, CellParameters::cubic(4.0));
        let error = generate_reflections(&trial, &group, 0.0, &d_geometry(), None)
            .expect_err("d_min=0 must fail");
        assert_eq!(error.placeholder(), "INPUT.D_MIN");

        let broken = TrialCell {
            bravais: BravaisLattice::CubicP,
            cell: CellParameters::new(4.0, 4.1, 4.0, 90.0, 90.0, 90.0),
        };
        let error = generate_reflections(&broken, &group, 1.0, &d_geometry(), None)
            .expect_err("non-cubic cell must fail");
        assert_eq!(error.placeholder(), "INPUT.CELL_CONSTRAINT");
    }

    #[test]
    fn satellites_are_added_for_modulated_cells() {
        let trial = TrialCell::new(
            BravaisLattice::OrthorhombicP,
            CellParameters::new(4.0, 5.0, 6.0, 90.0, 90.0, 90.0),
        );
        let group = SpaceGroup::from_bravais(BravaisLattice::OrthorhombicP);
        let spec = ModulationSpec::new([0.0, 0.0, 0.3], 1);
        let reflections = generate_reflections(&trial, &group, 2.5, &d_geometry(), Some(&spec))
            .expect("generation");
        let first_order = reflections
            .iter()
            .find(|r| r.hkl == [0, 0, 0] && r.m == Some(1))
            .expect("(0 0 0 1) satellite should be present");
        assert!((first_order.d - 6.0 / 0.3).abs() < 1.0e-9);
        assert!(reflections.iter().any(|r| r.m == Some(0)));
        assert!(reflections.iter().all(|r| r.d >= 2.5));
    }
}
