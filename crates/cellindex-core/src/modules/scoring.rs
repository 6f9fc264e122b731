//! One-to-one peak assignment and the de Wolff figures of merit.

use crate::common::MatchTolerance;
use crate::common::constants::{
    EXACT_FIT_FRACTION, FIGURE_OF_MERIT_WINDOW, MIN_MEAN_Q_DISCREPANCY,
};
use crate::domain::{IndexedCell, ObservedPeak, ReflectionHkl};
use crate::modules::instrument::InstrumentModel;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    /// Input peaks in their original order with assignments rewritten.
    pub peaks: Vec<ObservedPeak>,
    pub m20: f64,
    /// Generated reflections up to the last matched window line that no
    /// peak claimed.
    pub x20: usize,
    /// Window lines left without a reflection.
    pub unindexed: usize,
    /// Matched lines among all used peaks.
    pub matched: usize,
    pub window: usize,
}

impl MatchOutcome {
    pub fn matched_in_window(&self) -> usize {
        self.window.saturating_sub(self.unindexed)
    }
}

#[derive(Debug, Clone, Copy)]
struct CandidatePair {
    distance: f64,
    peak: usize,
    reflection: usize,
}

/// Matches peaks to reflections and scores the assignment.
///
/// Pairs inside the tolerance window are claimed closest-first, one
/// reflection per peak and one peak per reflection. Ties are broken on peak
/// position and reflection index, never on list order, so permuting the
/// input peaks leaves every figure unchanged.
pub fn match_and_score<I: InstrumentModel>(
    peaks: &[ObservedPeak],
    reflections: &[ReflectionHkl],
    tolerance: &MatchTolerance,
    instrument: &I,
    x20_mode: bool,
) -> MatchOutcome {
    let mut updated: Vec<ObservedPeak> = peaks.to_vec();
    let mut active = Vec::new();
    for (index, peak) in updated.iter_mut().enumerate() {
        peak.clear_assignment();
        if let Some(d) = instrument.d_from_position(peak.position) {
            peak.d_obs = d;
            if peak.use_flag {
                active.push(index);
            }
        }
    }

    let mut pairs = Vec::new();
    for &peak_index in &active {
        let position = updated[peak_index].position;
        let window = tolerance.window(position);
        for (reflection_index, reflection) in reflections.iter().enumerate() {
            let distance = (reflection.position - position).abs();
            if distance <= window {
                pairs.push(CandidatePair {
                    distance,
                    peak: peak_index,
                    reflection: reflection_index,
                });
            }
        }
    }
    pairs.sort_by(|left, right| {
        left.distance
            .total_cmp(&right.distance)
            .then_with(|| compare_peaks(&updated[left.peak], &updated[right.peak]))
            .then_with(|| {
                reflections[left.reflection]
                    .full_index()
                    .cmp(&reflections[right.reflection].full_index())
            })
            .then_with(|| left.peak.cmp(&right.peak))
    });

    let mut peak_claimed = vec![false; updated.len()];
    let mut reflection_claimed = vec![false; reflections.len()];
    let mut matched = 0;
    for pair in pairs {
        if peak_claimed[pair.peak] || reflection_claimed[pair.reflection] {
            continue;
        }
        peak_claimed[pair.peak] = true;
        reflection_claimed[pair.reflection] = true;
        let reflection = &reflections[pair.reflection];
        let peak = &mut updated[pair.peak];
        peak.indexed = true;
        peak.hkl = reflection.hkl;
        peak.m = reflection.m;
        peak.d_calc = reflection.d;
        matched += 1;
    }

    let mut window_lines = active.clone();
    window_lines.sort_by(|&left, &right| compare_peaks(&updated[left], &updated[right]));
    window_lines.truncate(FIGURE_OF_MERIT_WINDOW);
    let window = window_lines.len();

    let matched_window: Vec<&ObservedPeak> = window_lines
        .iter()
        .map(|&index| &updated[index])
        .filter(|peak| peak.indexed)
        .collect();
    let unindexed = window - matched_window.len();

    if matched_window.is_empty() {
        return MatchOutcome {
            peaks: updated,
            m20: 0.0,
            x20: 0,
            unindexed,
            matched,
            window,
        };
    }

    // Q20 of de Wolff: the last observed window line, or the last matched
    // reflection when that sits slightly beyond it.
    let q_matched_last = matched_window
        .iter()
        .map(|peak| q_of(peak.d_calc))
        .fold(0.0, f64::max);
    let q_window_last = window_lines
        .iter()
        .map(|&index| q_of(updated[index].d_obs))
        .fold(0.0, f64::max);
    let q20 = q_window_last.max(q_matched_last);

    let discrepancy = matched_window
        .iter()
        .map(|peak| (q_of(peak.d_obs) - q_of(peak.d_calc)).abs())
        .sum::<f64>()
        / matched_window.len() as f64;
    let floor = exact_fit_floor(&window_lines, &updated, tolerance, instrument);
    let discrepancy = discrepancy.max(floor);

    let n_calc = reflections
        .iter()
        .filter(|reflection| reflection.q() <= q20 * (1.0 + 1.0e-12))
        .count();
    let x20 = reflections
        .iter()
        .enumerate()
        .filter(|(index, reflection)| {
            !reflection_claimed[*index] && reflection.q() <= q_matched_last * (1.0 + 1.0e-12)
        })
        .count();

    // Every unexplained window line costs one calculated line on top of the
    // completeness factor, so dropping a line can never raise M20.
    let effective_calc = (n_calc + unindexed).max(1);
    let completeness = matched_window.len() as f64 / window as f64;
    let mut m20 = q20 / (2.0 * discrepancy * effective_calc as f64) * completeness;
    if x20_mode {
        m20 /= (x20 + 1) as f64;
    }

    MatchOutcome {
        peaks: updated,
        m20,
        x20,
        unindexed,
        matched,
        window,
    }
}

/// Smallest mean `|ΔQ|` the scorer distinguishes: a fixed fraction of the
/// matching window converted to Q, averaged over the window lines. It depends
/// only on the observed lines, so every candidate shares the same floor.
fn exact_fit_floor<I: InstrumentModel>(
    window_lines: &[usize],
    peaks: &[ObservedPeak],
    tolerance: &MatchTolerance,
    instrument: &I,
) -> f64 {
    let widths: Vec<f64> = window_lines
        .iter()
        .filter_map(|&index| {
            let peak = &peaks[index];
            let slope = instrument.dposition_dd(peak.d_obs)?.abs();
            (slope > 0.0).then(|| {
                2.0 / peak.d_obs.powi(3) * tolerance.window(peak.position) / slope
            })
        })
        .filter(|width| width.is_finite())
        .collect();
    if widths.is_empty() {
        return MIN_MEAN_Q_DISCREPANCY;
    }
    let mean = widths.iter().sum::<f64>() / widths.len() as f64;
    (EXACT_FIT_FRACTION * mean).max(MIN_MEAN_Q_DISCREPANCY)
}

/// d-descending with position and intensity as tie breakers.
fn compare_peaks(left: &ObservedPeak, right: &ObservedPeak) -> Ordering {
    right
        .d_obs
        .total_cmp(&left.d_obs)
        .then_with(|| left.position.total_cmp(&right.position))
        .then_with(|| right.intensity.total_cmp(&left.intensity))
}

fn q_of(d: f64) -> f64 {
    1.0 / (d * d)
}

pub fn rank_candidates(cells: &mut [IndexedCell]) {
    cells.sort_by(IndexedCell::rank_cmp);
}

#[cfg(test)]
mod tests {
    use super::{match_and_score, rank_candidates};
    use crate::common::MatchTolerance;
    use crate::domain::{
        BravaisLattice, CellParameters, IndexedCell, ObservedPeak, ReflectionHkl, TrialCell,
    };
    use crate::modules::instrument::InstrumentGeometry;

    fn reflection(hkl: [i32; 3], d: f64) -> ReflectionHkl {
        ReflectionHkl {
            hkl,
            m: None,
            d,
            position: d,
            multiplicity: 1,
        }
    }

    fn peaks(positions: &[f64]) -> Vec<ObservedPeak> {
        positions
            .iter()
            .map(|&position| ObservedPeak::new(position, 100.0))
            .collect()
    }

    #[test]
    fn reflections_are_claimed_once() {
        let geometry = InstrumentGeometry::DSpacing { zero: 0.0 };
        let reflections = vec![reflection([1, 0, 0], 4.0), reflection([1, 1, 0], 2.83)];
        let observed = peaks(&[4.001, 3.998, 2.83]);
        let outcome = match_and_score(
            &observed,
            &reflections,
            &MatchTolerance::absolute(0.01),
            &geometry,
            false,
        );
        assert_eq!(outcome.matched, 2);
        assert!(outcome.peaks[0].indexed);
        assert_eq!(outcome.peaks[0].hkl, [1, 0, 0]);
        assert!(!outcome.peaks[1].indexed);
        assert_eq!(outcome.peaks[1].d_calc, 0.0);
        assert_eq!(outcome.unindexed, 1);
        assert_eq!(outcome.x20, 0);
    }

    #[test]
    fn missing_lines_raise_x20_and_lower_m20() {
        let geometry = InstrumentGeometry::DSpacing { zero: 0.0 };
        let complete = vec![reflection([1, 0, 0], 4.0), reflection([1, 1, 0], 2.8)];
        let padded = vec![
            reflection([1, 0, 0], 4.0),
            reflection([0, 0, 1], 3.5),
            reflection([1, 1, 0], 2.8),
        ];
        let observed = peaks(&[4.0005, 2.8005]);
        let tolerance = MatchTolerance::absolute(0.01);
        let tight = match_and_score(&observed, &complete, &tolerance, &geometry, false);
        let loose = match_and_score(&observed, &padded, &tolerance, &geometry, false);
        assert_eq!(tight.x20, 0);
        assert_eq!(loose.x20, 1);
        assert!(loose.m20 < tight.m20);

        let x20_mode = match_and_score(&observed, &padded, &tolerance, &geometry, true);
        assert!((x20_mode.m20 - loose.m20 / 2.0).abs() < 1.0e-9 * loose.m20);
    }

    #[test]
    fn dropping_a_line_never_beats_indexing_it() {
        let geometry = InstrumentGeometry::DSpacing { zero: 0.0 };
        let observed = peaks(&[4.0, 2.0, 1.5]);
        let tolerance = MatchTolerance::absolute(0.01);
        let full = vec![
            reflection([1, 0, 0], 4.000001),
            reflection([2, 0, 0], 2.000001),
            reflection([1, 1, 1], 1.500001),
        ];
        let partial = vec![reflection([1, 0, 0], 4.0), reflection([2, 0, 0], 2.0)];

        let all_lines = match_and_score(&observed, &full, &tolerance, &geometry, false);
        let exact_but_short = match_and_score(&observed, &partial, &tolerance, &geometry, false);
        assert_eq!(all_lines.unindexed, 0);
        assert_eq!(exact_but_short.unindexed, 1);
        assert_eq!(exact_but_short.x20, 0);
        assert!(
            all_lines.m20 > exact_but_short.m20,
            "{} <= {}",
            all_lines.m20,
            exact_but_short.m20
        );
    }

    #[test]
    fn unused_peaks_do_not_take_part() {
        let geometry = InstrumentGeometry::DSpacing { zero: 0.0 };
        let reflections = vec![reflection([1, 0, 0], 4.0)];
        let mut observed = peaks(&[4.0]);
        observed[0].use_flag = false;
        let outcome = match_and_score(
            &observed,
            &reflections,
            &MatchTolerance::absolute(0.01),
            &geometry,
            false,
        );
        assert_eq!(outcome.matched, 0);
        assert_eq!(outcome.window, 0);
        assert_eq!(outcome.m20, 0.0);
        assert_eq!(outcome.peaks[0].d_obs, 4.0);
    }

    #[test]
    fn ranking_prefers_m20_then_x20_then_volume() {
        let cell = |m20: f64, x20: usize, a: f64| IndexedCell {
            m20,
            x20,
            unindexed: 0,
            trial: TrialCell::new(BravaisLattice::CubicP, CellParameters::cubic(a)),
            zero: 0.0,
            keep: false,
        };
        let mut cells = vec![cell(12.0, 1, 4.0), cell(30.0, 4, 8.0), cell(12.0, 1, 3.0)];
        rank_candidates(&mut cells);
        let lengths: Vec<f64> = cells.iter().map(|cell| cell.trial.cell.a).collect();
        assert_eq!(lengths, vec![8.0, 3.0, 4.0]);
    }
}
