//! Coarse-to-fine sweep over the enabled Bravais lattices.
//!
//! Each lattice with `p` free metric parameters is tried by pairing `p` of
//! the strongest low-angle lines with `p` low-index reflections and solving
//! the resulting linear system in `Q = 1/d²`. Trials that survive the cheap
//! filters are matched at a widened tolerance, refined briefly and scored
//! again at the working tolerance. The driver is cooperative: `step()`
//! evaluates one trial and `run()` hands control to an observer after every
//! step.

use crate::common::constants::DUPLICATE_METRIC_TOLERANCE;
use crate::common::{IndexingControls, MatchTolerance, RefineControls};
use crate::domain::{
    BravaisLattice, CandidateList, IndexError, IndexResult, IndexedCell, ObservedPeak,
    ReflectionHkl, TrialCell, q_coefficients,
};
use crate::modules::generator::generate_reflections;
use crate::modules::instrument::{InstrumentGeometry, InstrumentModel};
use crate::modules::refine::refine_cell;
use crate::modules::scoring::{MatchOutcome, match_and_score, rank_candidates};
use crate::modules::spacegroup::{SpaceGroup, canonical_hkl, laue_operators};
use crate::numerics::{DenseMatrix, lu_solve, metric_invariants3};
use std::collections::HashSet;
use std::ops::ControlFlow;
use tracing::{debug, info};

const BASE_INDEX_LIMIT: i32 = 4;
const EXTRA_BASE_REFLECTIONS: usize = 5;
const EXTRA_TRIAL_LINES: usize = 2;
const ESTIMATE_SLACK: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchState {
    Idle,
    Searching { lattice: BravaisLattice },
    CandidateFound { lattice: BravaisLattice, m20: f64 },
    Exhausted { lattice: BravaisLattice },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchProgress {
    pub state: SearchState,
    /// Position of the current lattice among the enabled ones.
    pub lattice_index: usize,
    pub lattice_count: usize,
    pub lattice_trials: usize,
    pub total_trials: usize,
    pub candidates: usize,
    pub best_m20: Option<f64>,
}

pub trait SearchObserver {
    fn on_progress(&mut self, progress: &SearchProgress) -> ControlFlow<()>;
}

impl<F> SearchObserver for F
where
    F: FnMut(&SearchProgress) -> ControlFlow<()>,
{
    fn on_progress(&mut self, progress: &SearchProgress) -> ControlFlow<()> {
        self(progress)
    }
}

/// Observer that never cancels.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunToCompletion;

impl SearchObserver for RunToCompletion {
    fn on_progress(&mut self, _progress: &SearchProgress) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatticeReport {
    pub bravais: BravaisLattice,
    pub trials: usize,
    pub candidates: usize,
    /// A trial or candidate cap ended the sweep before the plan ran out.
    pub terminated_early: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchReport {
    /// New candidates merged with the cells flagged `keep`, ranked.
    pub candidates: CandidateList,
    pub lattices: Vec<LatticeReport>,
    pub trials: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    Completed(SearchReport),
    Cancelled(SearchReport),
    NoViableCell(SearchReport),
}

impl SearchOutcome {
    pub fn report(&self) -> &SearchReport {
        match self {
            Self::Completed(report) | Self::Cancelled(report) | Self::NoViableCell(report) => {
                report
            }
        }
    }

    pub fn into_report(self) -> SearchReport {
        match self {
            Self::Completed(report) | Self::Cancelled(report) | Self::NoViableCell(report) => {
                report
            }
        }
    }

    pub fn candidates(&self) -> &CandidateList {
        &self.report().candidates
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

#[derive(Debug, Clone, Copy)]
struct ObservedLine {
    q: f64,
}

/// Breadth-first enumeration of `(line combination, reflection tuple)`
/// pairs: tuples are ordered by their largest base-reflection index so that
/// low-index assignments are tried first.
#[derive(Debug, Clone)]
struct TrialPlan {
    combinations: Vec<Vec<usize>>,
    base_len: usize,
    size: usize,
    level: usize,
    tuple: Vec<usize>,
    combination_cursor: usize,
    has_tuple: bool,
    exhausted: bool,
}

impl TrialPlan {
    fn new(line_count: usize, size: usize, base_len: usize) -> Self {
        let pool = line_count.min(size + EXTRA_TRIAL_LINES);
        let exhausted = size == 0 || pool < size || base_len < size;
        Self {
            combinations: if exhausted {
                Vec::new()
            } else {
                combinations(pool, size)
            },
            base_len,
            size,
            level: size.saturating_sub(1),
            tuple: vec![0; size],
            combination_cursor: 0,
            has_tuple: false,
            exhausted,
        }
    }

    fn tuple_is_valid(&self) -> bool {
        let distinct = (0..self.size)
            .all(|i| (i + 1..self.size).all(|j| self.tuple[i] != self.tuple[j]));
        distinct && self.tuple.contains(&self.level)
    }

    fn increment(&mut self) -> bool {
        for digit in self.tuple.iter_mut().rev() {
            *digit += 1;
            if *digit <= self.level {
                return true;
            }
            *digit = 0;
        }
        false
    }

    fn advance_tuple(&mut self) -> bool {
        loop {
            if !self.increment() {
                self.level += 1;
                if self.level >= self.base_len {
                    return false;
                }
                self.tuple.fill(0);
            }
            if self.tuple_is_valid() {
                return true;
            }
        }
    }
}

impl Iterator for TrialPlan {
    type Item = (Vec<usize>, Vec<usize>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        if !self.has_tuple || self.combination_cursor >= self.combinations.len() {
            let found = if self.has_tuple {
                self.advance_tuple()
            } else {
                self.tuple_is_valid() || self.advance_tuple()
            };
            if !found {
                self.exhausted = true;
                return None;
            }
            self.has_tuple = true;
            self.combination_cursor = 0;
        }
        let combination = self.combinations[self.combination_cursor].clone();
        self.combination_cursor += 1;
        Some((combination, self.tuple.clone()))
    }
}

fn combinations(pool: usize, size: usize) -> Vec<Vec<usize>> {
    fn extend(
        start: usize,
        pool: usize,
        size: usize,
        current: &mut Vec<usize>,
        out: &mut Vec<Vec<usize>>,
    ) {
        if current.len() == size {
            out.push(current.clone());
            return;
        }
        for index in start..pool {
            current.push(index);
            extend(index + 1, pool, size, current, out);
            current.pop();
        }
    }
    let mut out = Vec::new();
    extend(0, pool, size, &mut Vec::with_capacity(size), &mut out);
    out
}

/// Low-index reflections allowed by the lattice centering, one per Laue
/// orbit, ordered by `h² + k² + l²`.
pub fn base_reflections(bravais: BravaisLattice, count: usize) -> Vec<[i32; 3]> {
    let group = SpaceGroup::from_bravais(bravais);
    let operators = laue_operators(bravais.laue_class());
    let mut reflections = Vec::new();
    for h in -BASE_INDEX_LIMIT..=BASE_INDEX_LIMIT {
        for k in -BASE_INDEX_LIMIT..=BASE_INDEX_LIMIT {
            for l in -BASE_INDEX_LIMIT..=BASE_INDEX_LIMIT {
                let hkl = [h, k, l];
                if hkl == [0, 0, 0] || group.is_systematically_absent(hkl) {
                    continue;
                }
                if canonical_hkl(&operators, hkl).0 == hkl {
                    reflections.push(hkl);
                }
            }
        }
    }
    reflections.sort_by_key(|hkl| {
        let norm: i32 = hkl.iter().map(|v| v * v).sum();
        (norm, [-hkl[0], -hkl[1], -hkl[2]])
    });
    reflections.truncate(count);
    reflections
}

/// Two cells of the same lattice whose reduced direct metrics agree to
/// within `DUPLICATE_METRIC_TOLERANCE` relative to the longest axis, so
/// permuted or re-signed settings of one cell compare equal.
pub fn same_cell(left: &TrialCell, right: &TrialCell) -> bool {
    if left.bravais != right.bravais {
        return false;
    }
    let a = metric_invariants3(&left.cell.direct_metric());
    let b = metric_invariants3(&right.cell.direct_metric());
    let scale = a[0].max(b[0]);
    if !(scale.is_finite() && scale > 0.0) {
        return false;
    }
    a.iter()
        .zip(&b)
        .all(|(x, y)| (x - y).abs() <= DUPLICATE_METRIC_TOLERANCE * scale)
}

fn cell_key(trial: &TrialCell) -> [i64; 6] {
    let invariants = metric_invariants3(&trial.cell.direct_metric());
    let scale = invariants[0] * DUPLICATE_METRIC_TOLERANCE;
    invariants.map(|value| (value / scale).round() as i64)
}

struct LatticeSweep {
    bravais: BravaisLattice,
    space_group: SpaceGroup,
    base: Vec<[i32; 3]>,
    plan: TrialPlan,
    seen: HashSet<[i64; 6]>,
    report: LatticeReport,
}

impl LatticeSweep {
    fn new(bravais: BravaisLattice, line_count: usize) -> Self {
        let size = bravais.free_parameter_count();
        let base = base_reflections(bravais, size + EXTRA_BASE_REFLECTIONS);
        let plan = TrialPlan::new(line_count, size, base.len());
        Self {
            bravais,
            space_group: SpaceGroup::from_bravais(bravais),
            base,
            plan,
            seen: HashSet::new(),
            report: LatticeReport {
                bravais,
                trials: 0,
                candidates: 0,
                terminated_early: false,
            },
        }
    }
}

pub struct SearchDriver {
    peaks: Vec<ObservedPeak>,
    lines: Vec<ObservedLine>,
    instrument: InstrumentGeometry,
    controls: IndexingControls,
    tolerance: MatchTolerance,
    lattices: Vec<BravaisLattice>,
    next_lattice: usize,
    sweep: Option<LatticeSweep>,
    state: SearchState,
    finished: bool,
    candidates: Vec<IndexedCell>,
    kept: Vec<IndexedCell>,
    reports: Vec<LatticeReport>,
    total_trials: usize,
}

impl SearchDriver {
    /// Validates the inputs; `kept` cells survive into every outcome.
    pub fn new(
        peaks: &[ObservedPeak],
        instrument: &InstrumentGeometry,
        controls: &IndexingControls,
        kept: Vec<IndexedCell>,
    ) -> IndexResult<Self> {
        controls.validate()?;
        instrument.validate()?;
        let tolerance = controls
            .tolerance
            .unwrap_or_else(|| instrument.default_tolerance());
        tolerance.validate()?;

        let mut lines: Vec<ObservedLine> = peaks
            .iter()
            .filter(|peak| peak.use_flag)
            .filter_map(|peak| instrument.d_from_position(peak.position))
            .map(|d| ObservedLine { q: 1.0 / (d * d) })
            .collect();
        if lines.is_empty() {
            return Err(IndexError::input(
                "INPUT.NO_PEAKS",
                "no usable peaks: the list is empty or every peak is excluded",
            ));
        }
        lines.sort_by(|left, right| left.q.total_cmp(&right.q));

        let mut lattices = controls.enabled_lattices.clone();
        lattices.sort();
        lattices.dedup();

        Ok(Self {
            peaks: peaks.to_vec(),
            lines,
            instrument: *instrument,
            controls: controls.clone(),
            tolerance,
            lattices,
            next_lattice: 0,
            sweep: None,
            state: SearchState::Idle,
            finished: false,
            candidates: Vec::new(),
            kept,
            reports: Vec::new(),
            total_trials: 0,
        })
    }

    pub fn state(&self) -> SearchState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn candidates(&self) -> &[IndexedCell] {
        &self.candidates
    }

    pub fn progress(&self) -> SearchProgress {
        SearchProgress {
            state: self.state,
            lattice_index: self.next_lattice.saturating_sub(1),
            lattice_count: self.lattices.len(),
            lattice_trials: self.sweep.as_ref().map_or(0, |sweep| sweep.report.trials),
            total_trials: self.total_trials,
            candidates: self.candidates.len(),
            best_m20: self
                .candidates
                .iter()
                .map(|cell| cell.m20)
                .max_by(f64::total_cmp),
        }
    }

    /// Advances the search by at most one trial cell.
    pub fn step(&mut self) -> SearchState {
        if self.finished {
            return self.state;
        }
        if self.sweep.is_none() {
            let Some(&bravais) = self.lattices.get(self.next_lattice) else {
                self.finished = true;
                self.state = SearchState::Idle;
                info!(
                    trials = self.total_trials,
                    candidates = self.candidates.len(),
                    "indexing search finished"
                );
                return self.state;
            };
            self.next_lattice += 1;
            debug!(%bravais, "starting lattice sweep");
            self.sweep = Some(LatticeSweep::new(bravais, self.lines.len()));
            self.state = SearchState::Searching { lattice: bravais };
        }

        let Some(mut sweep) = self.sweep.take() else {
            return self.state;
        };
        let bravais = sweep.bravais;
        let capped = sweep.report.trials >= self.controls.max_trials_per_lattice
            || sweep.report.candidates >= self.controls.max_candidates_per_lattice;
        let next = if capped { None } else { sweep.plan.next() };
        let Some((combination, tuple)) = next else {
            sweep.report.terminated_early = capped;
            debug!(
                %bravais,
                trials = sweep.report.trials,
                candidates = sweep.report.candidates,
                terminated_early = capped,
                "lattice sweep exhausted"
            );
            self.reports.push(sweep.report);
            self.state = SearchState::Exhausted { lattice: bravais };
            return self.state;
        };

        sweep.report.trials += 1;
        self.total_trials += 1;
        self.state = match self.evaluate_trial(&mut sweep, &combination, &tuple) {
            Some(cell) => {
                let m20 = cell.m20;
                if self.admit(cell) {
                    sweep.report.candidates += 1;
                    SearchState::CandidateFound {
                        lattice: bravais,
                        m20,
                    }
                } else {
                    SearchState::Searching { lattice: bravais }
                }
            }
            None => SearchState::Searching { lattice: bravais },
        };
        self.sweep = Some(sweep);
        self.state
    }

    /// Steps until every lattice is exhausted or the observer breaks.
    pub fn run<O: SearchObserver + ?Sized>(mut self, observer: &mut O) -> SearchOutcome {
        while !self.is_finished() {
            self.step();
            if observer.on_progress(&self.progress()).is_break() {
                info!(trials = self.total_trials, "indexing search cancelled");
                if let Some(sweep) = self.sweep.take() {
                    let mut report = sweep.report;
                    report.terminated_early = true;
                    self.reports.push(report);
                }
                return SearchOutcome::Cancelled(self.finish());
            }
        }
        if self.candidates.is_empty() {
            SearchOutcome::NoViableCell(self.finish())
        } else {
            SearchOutcome::Completed(self.finish())
        }
    }

    fn finish(self) -> SearchReport {
        let mut cells = self.candidates;
        for kept in self.kept {
            if let Some(existing) = cells
                .iter_mut()
                .find(|cell| same_cell(&cell.trial, &kept.trial))
            {
                existing.keep = true;
            } else {
                cells.push(kept);
            }
        }
        rank_candidates(&mut cells);
        SearchReport {
            candidates: CandidateList::from_ranked(cells),
            lattices: self.reports,
            trials: self.total_trials,
        }
    }

    /// Inserts a candidate unless a cell of the same metric is already held;
    /// a better-scoring duplicate replaces the held one.
    fn admit(&mut self, cell: IndexedCell) -> bool {
        if let Some(existing) = self
            .candidates
            .iter_mut()
            .find(|held| same_cell(&held.trial, &cell.trial))
        {
            if cell.m20 > existing.m20 {
                *existing = cell;
            }
            return false;
        }
        debug!(
            bravais = %cell.trial.bravais,
            m20 = cell.m20,
            x20 = cell.x20,
            volume = cell.volume(),
            "candidate accepted"
        );
        self.candidates.push(cell);
        true
    }

    fn evaluate_trial(
        &self,
        sweep: &mut LatticeSweep,
        combination: &[usize],
        tuple: &[usize],
    ) -> Option<IndexedCell> {
        let bravais = sweep.bravais;
        let size = combination.len();
        let basis = bravais.metric_basis();
        let system: DenseMatrix = DenseMatrix::from_fn(size, size, |row, col| {
            let coefficients = q_coefficients(sweep.base[tuple[row]].map(f64::from));
            basis[col]
                .iter()
                .zip(&coefficients)
                .map(|(b, c)| b * c)
                .sum::<f64>()
        });
        let rhs: Vec<f64> = combination.iter().map(|&line| self.lines[line].q).collect();
        let parameters = lu_solve(&system, &rhs).ok()?;
        let trial = TrialCell::from_parameters(bravais, &parameters)?;
        if trial.volume() < self.controls.start_volume {
            return None;
        }
        trial.reciprocal_metric().ok()?;
        if !sweep.seen.insert(cell_key(&trial)) {
            return None;
        }
        if self.estimated_reflections(&sweep.space_group, &trial)
            > ESTIMATE_SLACK * self.nc_limit()
        {
            return None;
        }

        let reflections = generate_reflections(
            &trial,
            &sweep.space_group,
            self.controls.d_min,
            &self.instrument,
            None,
        )
        .ok()?;
        if reflections.len() as f64 > self.nc_limit() {
            return None;
        }

        let coarse = self.score(
            &reflections,
            &self.tolerance.scaled(self.controls.trial_tolerance_scale),
            &self.instrument,
        );
        let parameter_count =
            bravais.free_parameter_count() + usize::from(self.controls.refine_zero);
        if coarse.matched_in_window() <= parameter_count
            || coarse.unindexed > self.controls.max_unindexed
        {
            return None;
        }

        let (trial, instrument) = self.refine_trial(&trial, &coarse);
        let reflections = generate_reflections(
            &trial,
            &sweep.space_group,
            self.controls.d_min,
            &instrument,
            None,
        )
        .ok()?;
        let fine = self.score(&reflections, &self.tolerance, &instrument);
        if fine.m20 < self.controls.min_m20 || fine.unindexed > self.controls.max_unindexed {
            return None;
        }
        Some(IndexedCell {
            m20: fine.m20,
            x20: fine.x20,
            unindexed: fine.unindexed,
            trial,
            zero: instrument.zero(),
            keep: false,
        })
    }

    fn score(
        &self,
        reflections: &[ReflectionHkl],
        tolerance: &MatchTolerance,
        instrument: &InstrumentGeometry,
    ) -> MatchOutcome {
        match_and_score(
            &self.peaks,
            reflections,
            tolerance,
            instrument,
            self.controls.x20_mode,
        )
    }

    /// Short refinement against the coarse assignment; a failed refinement
    /// keeps the unrefined trial.
    fn refine_trial(
        &self,
        trial: &TrialCell,
        coarse: &MatchOutcome,
    ) -> (TrialCell, InstrumentGeometry) {
        let controls = RefineControls {
            refine_zero: self.controls.refine_zero,
            max_iterations: self.controls.trial_refine_iterations,
            ..RefineControls::default()
        };
        match refine_cell(trial, &coarse.peaks, &self.instrument, &controls) {
            Ok(refinement) => (refinement.trial, self.instrument.with_zero(refinement.zero)),
            Err(error) => {
                debug!(bravais = %trial.bravais, %error, "trial refinement skipped");
                (*trial, self.instrument)
            }
        }
    }

    fn nc_limit(&self) -> f64 {
        self.controls.max_nc_ratio * self.lines.len() as f64
    }

    /// Reciprocal-lattice points inside the `d_min` sphere divided by the
    /// Laue order and the centering multiplicity.
    fn estimated_reflections(&self, space_group: &SpaceGroup, trial: &TrialCell) -> f64 {
        let sphere = 4.0 / 3.0 * std::f64::consts::PI / self.controls.d_min.powi(3);
        let lattice_points = 1 + space_group.centering.translations().len();
        let laue_order = laue_operators(space_group.laue).len();
        sphere * trial.volume() / (laue_order * lattice_points) as f64
    }
}
