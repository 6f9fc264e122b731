use cellindex_core::common::MatchTolerance;
use cellindex_core::domain::{
    BravaisLattice, CellParameterKind, CellParameters, ObservedPeak, TrialCell,
};
use cellindex_core::modules::generator::{d_spacing, generate_reflections};
use cellindex_core::modules::instrument::{InstrumentGeometry, InstrumentModel};
use cellindex_core::modules::scoring::match_and_score;
use cellindex_core::modules::spacegroup::SpaceGroup;
use std::collections::HashSet;

fn sample_cells() -> Vec<TrialCell> {
    vec![
        TrialCell::new(BravaisLattice::CubicF, CellParameters::cubic(5.43)),
        TrialCell::new(
            BravaisLattice::TetragonalI,
            CellParameters::new(3.9, 3.9, 12.7, 90.0, 90.0, 90.0),
        ),
        TrialCell::new(
            BravaisLattice::HexagonalP,
            CellParameters::new(3.2, 3.2, 5.2, 90.0, 90.0, 120.0),
        ),
        TrialCell::new(
            BravaisLattice::MonoclinicP,
            CellParameters::new(5.1, 7.3, 6.2, 90.0, 103.5, 90.0),
        ),
        TrialCell::new(
            BravaisLattice::Triclinic,
            CellParameters::new(4.4, 5.6, 6.1, 84.0, 97.0, 101.0),
        ),
    ]
}

fn d_geometry() -> InstrumentGeometry {
    InstrumentGeometry::DSpacing { zero: 0.0 }
}

#[test]
fn reflections_respect_the_resolution_limit_and_order() {
    for trial in sample_cells() {
        let group = SpaceGroup::from_bravais(trial.bravais);
        let reflections = generate_reflections(&trial, &group, 1.2, &d_geometry(), None)
            .expect("generation should succeed");
        assert!(!reflections.is_empty(), "{} produced nothing", trial.bravais);
        assert!(reflections.iter().all(|reflection| reflection.d >= 1.2));
        assert!(
            reflections
                .windows(2)
                .all(|pair| pair[0].d >= pair[1].d),
            "{} reflections are not sorted by d",
            trial.bravais
        );
        let unique: HashSet<[i32; 4]> = reflections
            .iter()
            .map(|reflection| reflection.full_index())
            .collect();
        assert_eq!(unique.len(), reflections.len(), "{}", trial.bravais);
    }
}

#[test]
fn lowering_d_min_only_adds_reflections() {
    for trial in sample_cells() {
        let group = SpaceGroup::from_bravais(trial.bravais);
        let coarse = generate_reflections(&trial, &group, 1.5, &d_geometry(), None)
            .expect("generation should succeed");
        let fine = generate_reflections(&trial, &group, 1.1, &d_geometry(), None)
            .expect("generation should succeed");
        let fine_set: HashSet<[i32; 4]> = fine.iter().map(|r| r.full_index()).collect();
        assert!(fine.len() >= coarse.len());
        for reflection in &coarse {
            assert!(
                fine_set.contains(&reflection.full_index()),
                "{} lost {:?} at the finer limit",
                trial.bravais,
                reflection.hkl
            );
        }
    }
}

#[test]
fn generated_d_spacings_follow_the_metric() {
    for trial in sample_cells() {
        let group = SpaceGroup::from_bravais(trial.bravais);
        let metric = trial.reciprocal_metric().expect("metric");
        let reflections = generate_reflections(&trial, &group, 1.3, &d_geometry(), None)
            .expect("generation should succeed");
        for reflection in reflections {
            let expected = d_spacing(&metric, reflection.hkl.map(f64::from)).expect("d");
            assert!((reflection.d - expected).abs() < 1.0e-10);
        }
    }
}

#[test]
fn cubic_edits_keep_the_cell_cubic() {
    let mut cell = CellParameters::cubic(4.0);
    for (kind, value) in [
        (CellParameterKind::A, 4.2),
        (CellParameterKind::B, 4.3),
        (CellParameterKind::C, 4.4),
        (CellParameterKind::Alpha, 80.0),
        (CellParameterKind::Gamma, 100.0),
    ] {
        cell.set_parameter(BravaisLattice::CubicF, kind, value);
        assert_eq!(cell.b, cell.a);
        assert_eq!(cell.c, cell.a);
        assert_eq!([cell.alpha, cell.beta, cell.gamma], [90.0; 3]);
    }
    assert_eq!(cell.a, 4.4);
}

fn silicon_peaks(instrument: &InstrumentGeometry) -> Vec<ObservedPeak> {
    let trial = TrialCell::new(BravaisLattice::CubicF, CellParameters::cubic(5.431));
    let group = SpaceGroup::from_bravais(trial.bravais);
    let reflections =
        generate_reflections(&trial, &group, 1.0, instrument, None).expect("generation");
    reflections
        .iter()
        .enumerate()
        .map(|(index, reflection)| {
            let jitter = if index % 2 == 0 { 0.004 } else { -0.003 };
            ObservedPeak::new(reflection.position + jitter, 100.0 / (index + 1) as f64)
        })
        .collect()
}

#[test]
fn figures_of_merit_ignore_peak_order() {
    let instrument = InstrumentGeometry::constant_wavelength(1.5406);
    let trial = TrialCell::new(BravaisLattice::CubicF, CellParameters::cubic(5.431));
    let group = SpaceGroup::from_bravais(trial.bravais);
    let reflections =
        generate_reflections(&trial, &group, 1.0, &instrument, None).expect("generation");
    let tolerance = MatchTolerance::absolute(0.05);

    let peaks = silicon_peaks(&instrument);
    let mut shuffled = peaks.clone();
    shuffled.reverse();
    shuffled.rotate_left(3);

    let forward = match_and_score(&peaks, &reflections, &tolerance, &instrument, false);
    let permuted = match_and_score(&shuffled, &reflections, &tolerance, &instrument, false);
    assert_eq!(forward.m20, permuted.m20);
    assert_eq!(forward.x20, permuted.x20);
    assert_eq!(forward.matched, permuted.matched);

    for peak in &forward.peaks {
        let twin = permuted
            .peaks
            .iter()
            .find(|other| other.position == peak.position)
            .expect("every peak survives the permutation");
        assert_eq!(twin.hkl, peak.hkl);
        assert_eq!(twin.indexed, peak.indexed);
    }
}

#[test]
fn assignments_reproduce_calculated_positions() {
    let instrument = InstrumentGeometry::constant_wavelength(1.5406);
    let trial = TrialCell::new(BravaisLattice::CubicF, CellParameters::cubic(5.431));
    let group = SpaceGroup::from_bravais(trial.bravais);
    let reflections =
        generate_reflections(&trial, &group, 1.0, &instrument, None).expect("generation");
    let outcome = match_and_score(
        &silicon_peaks(&instrument),
        &reflections,
        &MatchTolerance::absolute(0.05),
        &instrument,
        false,
    );
    let metric = trial.reciprocal_metric().expect("metric");
    assert_eq!(outcome.matched, reflections.len());
    for peak in outcome.peaks.iter().filter(|peak| peak.indexed) {
        let d = d_spacing(&metric, peak.hkl.map(f64::from)).expect("d");
        assert!((peak.d_calc - d).abs() < 1.0e-10);
        let position = instrument.position_from_d(d).expect("observable");
        assert!((position - peak.position).abs() <= 0.05);
    }
}
