use crate::domain::lattice::{CellParameters, TrialCell};
use crate::numerics::Matrix3;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedPeak {
    /// Position on the instrument axis (2θ degrees, TOF µs or d Å).
    pub position: f64,
    #[serde(default)]
    pub intensity: f64,
    #[serde(default = "default_true")]
    pub use_flag: bool,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default)]
    pub hkl: [i32; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<i32>,
    #[serde(default)]
    pub d_obs: f64,
    #[serde(default)]
    pub d_calc: f64,
    #[serde(default)]
    pub esd: f64,
}

fn default_true() -> bool {
    true
}

impl ObservedPeak {
    pub fn new(position: f64, intensity: f64) -> Self {
        Self {
            position,
            intensity,
            use_flag: true,
            indexed: false,
            hkl: [0; 3],
            m: None,
            d_obs: 0.0,
            d_calc: 0.0,
            esd: 0.0,
        }
    }

    pub fn clear_assignment(&mut self) {
        self.indexed = false;
        self.hkl = [0; 3];
        self.m = None;
        self.d_calc = 0.0;
    }

    /// Index vector with the modulation index appended (zero for main reflections).
    pub fn full_index(&self) -> [i32; 4] {
        [self.hkl[0], self.hkl[1], self.hkl[2], self.m.unwrap_or(0)]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflectionHkl {
    pub hkl: [i32; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<i32>,
    pub d: f64,
    pub position: f64,
    pub multiplicity: usize,
}

impl ReflectionHkl {
    pub fn q(&self) -> f64 {
        1.0 / (self.d * self.d)
    }

    pub fn full_index(&self) -> [i32; 4] {
        [self.hkl[0], self.hkl[1], self.hkl[2], self.m.unwrap_or(0)]
    }
}

/// One incommensurate modulation vector with up to three refinable components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModulationSpec {
    pub vector: [f64; 3],
    pub max_m: u8,
    #[serde(default)]
    pub refine: [bool; 3],
}

impl ModulationSpec {
    pub fn new(vector: [f64; 3], max_m: u8) -> Self {
        Self {
            vector,
            max_m,
            refine: [false; 3],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedCell {
    pub m20: f64,
    pub x20: usize,
    #[serde(default)]
    pub unindexed: usize,
    pub trial: TrialCell,
    #[serde(default)]
    pub zero: f64,
    #[serde(default)]
    pub keep: bool,
}

impl IndexedCell {
    pub fn volume(&self) -> f64 {
        self.trial.volume()
    }

    /// Ranking order: M20 descending, then X20 ascending, then smaller volume.
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .m20
            .total_cmp(&self.m20)
            .then_with(|| self.x20.cmp(&other.x20))
            .then_with(|| self.volume().total_cmp(&other.volume()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortKey {
    M20,
    X20,
    Bravais,
    A,
    B,
    C,
    Alpha,
    Beta,
    Gamma,
    Volume,
    Keep,
}

/// Candidate cells with a single selection slot; selecting one cell
/// implicitly deselects any other.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateList {
    pub cells: Vec<IndexedCell>,
    #[serde(default)]
    pub selected: Option<usize>,
}

impl CandidateList {
    pub fn from_ranked(cells: Vec<IndexedCell>) -> Self {
        Self {
            cells,
            selected: None,
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn selected_cell(&self) -> Option<&IndexedCell> {
        self.selected.and_then(|index| self.cells.get(index))
    }

    pub fn select(&mut self, index: usize) -> bool {
        if index < self.cells.len() {
            self.selected = Some(index);
            true
        } else {
            false
        }
    }

    pub fn clear_selection(&mut self) {
        self.selected = None;
    }

    pub fn kept(&self) -> Vec<IndexedCell> {
        self.cells.iter().filter(|cell| cell.keep).cloned().collect()
    }

    pub fn rank(&mut self) {
        self.sort_by(SortKey::M20);
    }

    /// Sorts by `key` while keeping the selection attached to the same cell.
    pub fn sort_by(&mut self, key: SortKey) {
        let mut order: Vec<usize> = (0..self.cells.len()).collect();
        order.sort_by(|&left, &right| {
            let (l, r) = (&self.cells[left], &self.cells[right]);
            let (lc, rc) = (&l.trial.cell, &r.trial.cell);
            match key {
                SortKey::M20 => l.rank_cmp(r),
                SortKey::X20 => l.x20.cmp(&r.x20).then_with(|| l.rank_cmp(r)),
                SortKey::Bravais => l.trial.bravais.cmp(&r.trial.bravais),
                SortKey::A => lc.a.total_cmp(&rc.a),
                SortKey::B => lc.b.total_cmp(&rc.b),
                SortKey::C => lc.c.total_cmp(&rc.c),
                SortKey::Alpha => lc.alpha.total_cmp(&rc.alpha),
                SortKey::Beta => lc.beta.total_cmp(&rc.beta),
                SortKey::Gamma => lc.gamma.total_cmp(&rc.gamma),
                SortKey::Volume => l.volume().total_cmp(&r.volume()),
                SortKey::Keep => r.keep.cmp(&l.keep),
            }
        });
        self.selected = self
            .selected
            .and_then(|selected| order.iter().position(|&index| index == selected));
        let mut previous: Vec<Option<IndexedCell>> =
            std::mem::take(&mut self.cells).into_iter().map(Some).collect();
        self.cells = order
            .into_iter()
            .filter_map(|index| previous[index].take())
            .collect();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtomSite {
    pub label: String,
    pub element: String,
    pub fractional: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentPhase {
    pub name: String,
    pub space_group: String,
    pub cell: CellParameters,
    #[serde(default)]
    pub atoms: Vec<AtomSite>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubgroupPhase {
    pub symbol: String,
    pub parent_space_group: String,
    pub transform: Matrix3,
    pub origin_shift: [f64; 3],
    pub cell: CellParameters,
    #[serde(default)]
    pub operators: Vec<String>,
    pub conjugacy_class: usize,
    #[serde(default)]
    pub supergroups: Vec<usize>,
    #[serde(default = "default_true")]
    pub keep: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_atoms: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubgroupList {
    pub phases: Vec<SubgroupPhase>,
    #[serde(default)]
    pub selected: Option<usize>,
}
