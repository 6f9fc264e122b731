//! Superlattice and magnetic-subgroup exploration around a parent phase.
//!
//! Enumeration itself is delegated to external services behind the
//! `SubgroupService` and `PseudoLatticeService` traits; this module turns
//! their records into phases in the transformed cells and filters them by
//! unique-atom count and maximality.

use crate::domain::{
    BravaisLattice, CellParameters, IndexError, IndexResult, ParentPhase, SubgroupList,
    SubgroupPhase,
};
use crate::modules::spacegroup::{SpaceGroup, SymOp};
use crate::numerics::{
    Matrix3, det3, fractional_distance, inverse3, mul3, mul3_vec, transpose3, wrap_unit,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

const POSITION_TOLERANCE: f64 = 1.0e-4;

pub const NO_RESULTS_MESSAGE: &str = "no results for given propagation vector(s)";

/// Typed outcome of a remote call; both failure kinds surface as
/// `ExternalServiceError`.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceResponse<T> {
    Success(T),
    Empty,
    Failed(String),
}

impl<T> ServiceResponse<T> {
    pub fn into_result(self) -> IndexResult<T> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Empty => Err(IndexError::external_service(
                "SERVICE.EMPTY",
                NO_RESULTS_MESSAGE,
            )),
            Self::Failed(reason) => Err(IndexError::external_service(
                "SERVICE.FAILED",
                format!("check your connection: {reason}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterMode {
    #[default]
    AtomCount,
    Maximal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubgroupRequest {
    pub parent_symbol: String,
    pub operators: Vec<String>,
    pub kvecs: Vec<[f64; 3]>,
    pub whole_star: bool,
    pub filter: FilterMode,
    pub landau: bool,
    pub timeout: Duration,
}

impl SubgroupRequest {
    pub fn validate(&self) -> IndexResult<()> {
        if !(1..=3).contains(&self.kvecs.len()) {
            return Err(IndexError::incompatible_data(
                "INCOMPATIBLE.KVEC_COUNT",
                format!(
                    "between one and three propagation vectors are required, got {}",
                    self.kvecs.len()
                ),
            ));
        }
        if let Some(kvec) = self
            .kvecs
            .iter()
            .find(|kvec| kvec.iter().any(|component| !component.is_finite()))
        {
            return Err(IndexError::input(
                "INPUT.KVEC",
                format!("propagation vector {kvec:?} is not finite"),
            ));
        }
        if self.operators.is_empty() {
            return Err(IndexError::incompatible_data(
                "INCOMPATIBLE.NO_OPERATORS",
                format!("parent group {} has no operators", self.parent_symbol),
            ));
        }
        Ok(())
    }
}

/// One subgroup as returned by an enumeration service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubgroupRecord {
    pub symbol: String,
    /// Rows give the new axes in parent-cell coordinates.
    pub transform: Matrix3,
    pub origin_shift: [f64; 3],
    pub operators: Vec<String>,
    pub conjugacy_class: usize,
    /// Indices of records that contain this one as a proper subgroup.
    #[serde(default)]
    pub supergroups: Vec<usize>,
}

pub trait SubgroupService {
    fn enumerate(&self, request: &SubgroupRequest) -> ServiceResponse<Vec<SubgroupRecord>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PseudoLatticeRequest {
    pub space_group_number: u16,
    pub cell: CellParameters,
    pub angle_tolerance: f64,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PseudoLatticeRecord {
    pub bravais: BravaisLattice,
    pub cell: CellParameters,
    pub transform: Matrix3,
}

pub trait PseudoLatticeService {
    fn search(&self, request: &PseudoLatticeRequest) -> ServiceResponse<Vec<PseudoLatticeRecord>>;
}

/// Cell spanned by the rows of `matrix`: `G' = M·G·Mᵀ`.
pub fn transform_cell(parent: &CellParameters, matrix: &Matrix3) -> IndexResult<CellParameters> {
    let determinant = det3(matrix);
    if !determinant.is_finite() || determinant <= 0.0 {
        return Err(IndexError::incompatible_data(
            "INCOMPATIBLE.TRANSFORM",
            format!("transformation {matrix:?} must have a positive determinant"),
        ));
    }
    let metric = mul3(&mul3(matrix, &parent.direct_metric()), &transpose3(matrix));
    CellParameters::from_direct_metric(&metric).ok_or_else(|| {
        IndexError::incompatible_data(
            "INCOMPATIBLE.TRANSFORM",
            format!("transformation {matrix:?} does not produce a cell"),
        )
    })
}

pub fn build_subgroup_phases(
    records: &[SubgroupRecord],
    parent: &ParentPhase,
) -> IndexResult<SubgroupList> {
    let phases = records
        .iter()
        .map(|record| {
            Ok(SubgroupPhase {
                symbol: record.symbol.clone(),
                parent_space_group: parent.space_group.clone(),
                transform: record.transform,
                origin_shift: record.origin_shift,
                cell: transform_cell(&parent.cell, &record.transform)?,
                operators: record.operators.clone(),
                conjugacy_class: record.conjugacy_class,
                supergroups: record.supergroups.clone(),
                keep: true,
                unique_atoms: None,
            })
        })
        .collect::<IndexResult<Vec<_>>>()?;
    Ok(SubgroupList {
        phases,
        selected: None,
    })
}

fn push_unique(positions: &mut Vec<[f64; 3]>, candidate: [f64; 3]) {
    let wrapped = candidate.map(wrap_unit);
    if !positions
        .iter()
        .any(|existing| fractional_distance(*existing, wrapped) < POSITION_TOLERANCE)
    {
        positions.push(wrapped);
    }
}

/// Number of symmetry-distinct atoms once the parent structure is
/// re-expressed in the subgroup cell.
pub fn count_unique_atoms(
    parent: &ParentPhase,
    parent_group: &SpaceGroup,
    subgroup_operators: &[SymOp],
    matrix: &Matrix3,
    origin_shift: [f64; 3],
) -> IndexResult<usize> {
    if parent.atoms.is_empty() {
        return Err(IndexError::incompatible_data(
            "INCOMPATIBLE.NO_ATOMS",
            format!("parent phase {} has no atoms", parent.name),
        ));
    }
    let to_child = inverse3(&transpose3(matrix)).ok_or_else(|| {
        IndexError::incompatible_data(
            "INCOMPATIBLE.TRANSFORM",
            format!("transformation {matrix:?} is singular"),
        )
    })?;

    let parent_operators = parent_group.full_operators();
    let mut parent_positions = Vec::new();
    for atom in &parent.atoms {
        for operator in &parent_operators {
            push_unique(&mut parent_positions, operator.apply(atom.fractional));
        }
    }

    let mut bounds = [(0.0_f64, 0.0_f64); 3];
    for corner in 0..8 {
        let weights = [corner & 1, (corner >> 1) & 1, (corner >> 2) & 1].map(|bit| bit as f64);
        for (axis, bound) in bounds.iter_mut().enumerate() {
            let value: f64 = (0..3).map(|row| weights[row] * matrix[row][axis]).sum();
            bound.0 = bound.0.min(value);
            bound.1 = bound.1.max(value);
        }
    }
    let ranges = bounds.map(|(low, high)| (low.floor() as i32 - 1, high.ceil() as i32 + 1));

    let mut child_positions = Vec::new();
    for tx in ranges[0].0..=ranges[0].1 {
        for ty in ranges[1].0..=ranges[1].1 {
            for tz in ranges[2].0..=ranges[2].1 {
                let translation = [f64::from(tx), f64::from(ty), f64::from(tz)];
                for position in &parent_positions {
                    let shifted = [
                        position[0] + translation[0] - origin_shift[0],
                        position[1] + translation[1] - origin_shift[1],
                        position[2] + translation[2] - origin_shift[2],
                    ];
                    let child = mul3_vec(&to_child, shifted);
                    let inside = child
                        .iter()
                        .all(|value| *value > -POSITION_TOLERANCE && *value < 1.0 - POSITION_TOLERANCE);
                    if inside {
                        push_unique(&mut child_positions, child);
                    }
                }
            }
        }
    }

    let operators: Vec<SymOp> = if subgroup_operators.is_empty() {
        vec![SymOp::IDENTITY]
    } else {
        subgroup_operators.to_vec()
    };
    let mut assigned = vec![false; child_positions.len()];
    let mut orbits = 0;
    for start in 0..child_positions.len() {
        if assigned[start] {
            continue;
        }
        orbits += 1;
        for operator in &operators {
            let image = operator.apply(child_positions[start]).map(wrap_unit);
            for (index, position) in child_positions.iter().enumerate() {
                if !assigned[index] && fractional_distance(*position, image) < POSITION_TOLERANCE {
                    assigned[index] = true;
                }
            }
        }
        assigned[start] = true;
    }
    debug!(
        positions = child_positions.len(),
        orbits, "unique atoms counted in subgroup cell"
    );
    Ok(orbits)
}

pub fn parse_operators(operators: &[String]) -> IndexResult<Vec<SymOp>> {
    operators
        .iter()
        .map(|operator| {
            SymOp::parse(operator).map_err(|error| {
                IndexError::incompatible_data("INCOMPATIBLE.OPERATOR", error.to_string())
            })
        })
        .collect()
}

/// Recomputes `unique_atoms` and the `keep` flags; returns the kept count.
/// Maximal mode additionally drops every subgroup that has a supergroup in
/// the list.
pub fn filter_subgroups(
    list: &mut SubgroupList,
    parent: &ParentPhase,
    parent_group: &SpaceGroup,
    max_atoms: usize,
    mode: FilterMode,
) -> IndexResult<usize> {
    let mut updates = Vec::with_capacity(list.phases.len());
    for phase in &list.phases {
        let operators = parse_operators(&phase.operators)?;
        let count = count_unique_atoms(
            parent,
            parent_group,
            &operators,
            &phase.transform,
            phase.origin_shift,
        )?;
        let maximal = phase.supergroups.is_empty();
        let keep = count <= max_atoms && (mode == FilterMode::AtomCount || maximal);
        updates.push((count, keep));
    }
    for (phase, (count, keep)) in list.phases.iter_mut().zip(updates) {
        phase.unique_atoms = Some(count);
        phase.keep = keep;
    }
    if list
        .selected
        .is_some_and(|index| !list.phases.get(index).is_some_and(|phase| phase.keep))
    {
        list.selected = None;
    }
    let kept = list.phases.iter().filter(|phase| phase.keep).count();
    info!(
        total = list.phases.len(),
        kept,
        max_atoms,
        ?mode,
        "subgroup filter applied"
    );
    Ok(kept)
}

/// Phase indices grouped by conjugacy class, classes in order of first
/// appearance.
pub fn conjugacy_classes(list: &SubgroupList) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = Vec::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (index, phase) in list.phases.iter().enumerate() {
        match order.iter().position(|&class| class == phase.conjugacy_class) {
            Some(slot) => groups[slot].push(index),
            None => {
                order.push(phase.conjugacy_class);
                groups.push(vec![index]);
            }
        }
    }
    groups
}

/// Next kept phase after `from`, wrapping around the list.
pub fn next_kept(list: &SubgroupList, from: usize) -> Option<usize> {
    let count = list.phases.len();
    (1..=count)
        .map(|offset| (from + offset) % count)
        .find(|&index| list.phases[index].keep)
}

pub fn previous_kept(list: &SubgroupList, from: usize) -> Option<usize> {
    let count = list.phases.len();
    (1..=count)
        .map(|offset| (from + count * 2 - offset) % count)
        .find(|&index| list.phases[index].keep)
}
