//! The per-histogram "Unit Cells" document and the operations that edit it.
//!
//! Every operation validates and computes against a borrowed document
//! first and only assigns into it once nothing else can fail, so an error
//! never leaves a half-applied edit behind.

use crate::common::IndexingControls;
use crate::common::RefineControls;
use crate::common::constants::DEFAULT_SERVICE_TIMEOUT_SECS;
use crate::domain::{
    BravaisLattice, CandidateList, CellParameterKind, CellParameters, IndexError, IndexResult,
    IndexedCell, ModulationSpec, ObservedPeak, ParentPhase, ReflectionHkl, SortKey, SubgroupList,
    TrialCell,
};
use crate::modules::generator::generate_reflections;
use crate::modules::instrument::{InstrumentGeometry, InstrumentModel};
use crate::modules::refine::{Refinement, refine_cell};
use crate::modules::scoring::{MatchOutcome, match_and_score};
use crate::modules::search::{SearchDriver, SearchObserver, SearchOutcome, same_cell};
use crate::modules::serialization::write_text_artifact;
use crate::modules::spacegroup::{
    BuiltinSpaceGroups, SpaceGroup, SpaceGroupService, parse_modulation_symbol,
};
use crate::modules::subgroups::{
    FilterMode, PseudoLatticeRequest, PseudoLatticeService, SubgroupRequest, SubgroupService,
    build_subgroup_phases, conjugacy_classes, filter_subgroups, next_kept, previous_kept,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentControls {
    #[serde(default)]
    pub indexing: IndexingControls,
    /// Working cell for "index with cell", the reflection table and
    /// refinement when no candidate is selected.
    #[serde(default = "default_controls_cell")]
    pub cell: TrialCell,
    /// Space group used with the working cell; `None` means the lattice's
    /// holohedral group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_group: Option<String>,
}

fn default_controls_cell() -> TrialCell {
    TrialCell::new(BravaisLattice::CubicP, CellParameters::cubic(1.0))
}

impl Default for DocumentControls {
    fn default() -> Self {
        Self {
            indexing: IndexingControls::default(),
            cell: default_controls_cell(),
            space_group: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitCellsDocument {
    pub schema_version: u32,
    #[serde(default)]
    pub peaks: Vec<ObservedPeak>,
    #[serde(default)]
    pub instrument: InstrumentGeometry,
    #[serde(default)]
    pub controls: DocumentControls,
    #[serde(default)]
    pub candidates: CandidateList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modulation: Option<ModulationSpec>,
    #[serde(default)]
    pub subgroups: SubgroupList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentPhase>,
}

impl Default for UnitCellsDocument {
    fn default() -> Self {
        Self::new(Vec::new(), InstrumentGeometry::default())
    }
}

impl UnitCellsDocument {
    pub fn new(peaks: Vec<ObservedPeak>, instrument: InstrumentGeometry) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            peaks,
            instrument,
            controls: DocumentControls::default(),
            candidates: CandidateList::default(),
            modulation: None,
            subgroups: SubgroupList::default(),
            parent: None,
        }
    }

    pub fn validate(&self) -> IndexResult<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(IndexError::incompatible_data(
                "INCOMPATIBLE.SCHEMA_VERSION",
                format!(
                    "document schema version {} is not supported (expected {SCHEMA_VERSION})",
                    self.schema_version
                ),
            ));
        }
        self.instrument.validate()?;
        if let Some(peak) = self
            .peaks
            .iter()
            .find(|peak| !peak.position.is_finite() || !peak.intensity.is_finite())
        {
            return Err(IndexError::input(
                "INPUT.PEAK",
                format!("peak at position {} is not finite", peak.position),
            ));
        }
        if let Some(index) = self.candidates.selected
            && index >= self.candidates.len()
        {
            return Err(IndexError::incompatible_data(
                "INCOMPATIBLE.SELECTION",
                format!(
                    "selected candidate {index} is outside the list of {}",
                    self.candidates.len()
                ),
            ));
        }
        if let Some(index) = self.subgroups.selected
            && index >= self.subgroups.phases.len()
        {
            return Err(IndexError::incompatible_data(
                "INCOMPATIBLE.SELECTION",
                format!(
                    "selected subgroup {index} is outside the list of {}",
                    self.subgroups.phases.len()
                ),
            ));
        }
        Ok(())
    }

    /// Re-applies the lattice constraint to every stored cell.
    fn normalize(&mut self) {
        self.controls.cell = TrialCell::new(self.controls.cell.bravais, self.controls.cell.cell);
        for candidate in &mut self.candidates.cells {
            candidate.trial = TrialCell::new(candidate.trial.bravais, candidate.trial.cell);
        }
    }
}

/// Parses a document, migrating the legacy positional layout when the
/// input carries no `schemaVersion`.
pub fn load(json: &str) -> IndexResult<UnitCellsDocument> {
    let value: Value = serde_json::from_str(json).map_err(|error| {
        IndexError::input("INPUT.DOCUMENT", format!("document is not valid JSON: {error}"))
    })?;
    let mut document = if value.get("schemaVersion").is_some() {
        serde_json::from_value::<UnitCellsDocument>(value).map_err(|error| {
            IndexError::incompatible_data(
                "INCOMPATIBLE.DOCUMENT",
                format!("document does not match the unit-cells schema: {error}"),
            )
        })?
    } else {
        migrate_legacy(&value)?
    };
    document.validate()?;
    document.normalize();
    Ok(document)
}

pub fn read_document(path: &Path) -> IndexResult<UnitCellsDocument> {
    let content = fs::read_to_string(path).map_err(|error| {
        IndexError::io_system(
            "IO.DOCUMENT_READ",
            format!("failed to read '{}': {error}", path.display()),
        )
    })?;
    load(&content)
}

pub fn to_json(document: &UnitCellsDocument) -> IndexResult<String> {
    serde_json::to_string_pretty(document).map_err(|error| {
        IndexError::internal(
            "INTERNAL.SERIALIZE",
            format!("failed to serialize document: {error}"),
        )
    })
}

pub fn save(document: &UnitCellsDocument, path: &Path) -> IndexResult<()> {
    let content = to_json(document)?;
    write_text_artifact(path, &content).map_err(|error| {
        IndexError::io_system(
            "IO.DOCUMENT_WRITE",
            format!("failed to write '{}': {error}", path.display()),
        )
    })
}

fn legacy_error(message: impl Into<String>) -> IndexError {
    IndexError::incompatible_data("INCOMPATIBLE.LEGACY_LAYOUT", message)
}

fn legacy_number(value: &Value, what: &str) -> IndexResult<f64> {
    match value {
        Value::Number(number) => number
            .as_f64()
            .ok_or_else(|| legacy_error(format!("{what} is not a finite number"))),
        Value::Bool(flag) => Ok(f64::from(u8::from(*flag))),
        other => Err(legacy_error(format!("{what} must be a number, found {other}"))),
    }
}

fn legacy_flag(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|value| value != 0.0),
        _ => false,
    }
}

fn legacy_index(value: &Value, what: &str) -> IndexResult<i32> {
    let number = legacy_number(value, what)?;
    if number.fract() != 0.0 || number.abs() > f64::from(i32::MAX) {
        return Err(legacy_error(format!("{what} must be an integer, found {number}")));
    }
    Ok(number as i32)
}

fn legacy_rows<'a>(value: &'a Value, key: &str) -> IndexResult<&'a [Value]> {
    match value.get(key) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(rows)) => Ok(rows),
        Some(other) => Err(legacy_error(format!("'{key}' must be an array, found {other}"))),
    }
}

fn legacy_row<'a>(
    row: &'a Value,
    key: &str,
    index: usize,
    min_len: usize,
) -> IndexResult<&'a [Value]> {
    match row {
        Value::Array(fields) if fields.len() >= min_len => Ok(fields),
        _ => Err(legacy_error(format!(
            "row {index} of '{key}' must be an array of at least {min_len} fields"
        ))),
    }
}

/// Converts the legacy positional layout to the current schema.
///
/// * `controls`: `[_, refine zero, zero, max Nc/Nobs, start volume, lattice
///   symbol, a, b, c, α, β, γ, volume, space group]`; trailing fields may be
///   missing.
/// * `bravais`: fourteen flags in lattice id order.
/// * `cells`: `[M20, X20, lattice id, a, b, c, α, β, γ, volume, use, keep]`;
///   when several rows claim `use` the first one wins.
/// * `indexPeaks`: `[position, intensity, use, indexed, h, k, l, (m), d_obs,
///   d_calc]`.
/// * `ssopt`: `{Use, ModVec, maxH, ssSymb}`.
pub fn migrate_legacy(value: &Value) -> IndexResult<UnitCellsDocument> {
    if !value.is_object() {
        return Err(legacy_error("legacy document must be a JSON object"));
    }
    let mut document = UnitCellsDocument::default();
    if let Some(instrument) = value.get("instrument") {
        document.instrument = serde_json::from_value(instrument.clone())
            .map_err(|error| legacy_error(format!("instrument block is malformed: {error}")))?;
    }
    if let Some(d_min) = value.get("dMin") {
        document.controls.indexing.d_min = legacy_number(d_min, "dMin")?;
    }

    let controls = legacy_rows(value, "controls")?;
    if let Some(flag) = controls.get(1) {
        document.controls.indexing.refine_zero = legacy_flag(flag);
    }
    if let Some(zero) = controls.get(2) {
        let zero = legacy_number(zero, "controls zero")?;
        document.instrument = document.instrument.with_zero(zero);
    }
    if let Some(ratio) = controls.get(3) {
        document.controls.indexing.max_nc_ratio = legacy_number(ratio, "controls Nc/Nobs")?;
    }
    if let Some(volume) = controls.get(4) {
        document.controls.indexing.start_volume = legacy_number(volume, "controls start volume")?;
    }
    if controls.len() >= 12 {
        let bravais = match controls.get(5) {
            Some(Value::String(symbol)) => lattice_from_symbol(symbol)
                .ok_or_else(|| legacy_error(format!("unknown lattice symbol '{symbol}'")))?,
            Some(id) => {
                let id = legacy_index(id, "controls lattice")?;
                usize::try_from(id)
                    .ok()
                    .and_then(BravaisLattice::from_id)
                    .ok_or_else(|| legacy_error(format!("unknown lattice id {id}")))?
            }
            None => BravaisLattice::CubicP,
        };
        let mut values = [0.0; 6];
        for (slot, field) in values.iter_mut().zip(&controls[6..12]) {
            *slot = legacy_number(field, "controls cell")?;
        }
        document.controls.cell = TrialCell::new(bravais, CellParameters::from_array(values));
    }
    if let Some(Value::String(symbol)) = controls.get(13) {
        document.controls.space_group = Some(symbol.clone());
    }

    let flags = legacy_rows(value, "bravais")?;
    if !flags.is_empty() {
        if flags.len() != BravaisLattice::ALL.len() {
            return Err(legacy_error(format!(
                "'bravais' must hold {} flags, found {}",
                BravaisLattice::ALL.len(),
                flags.len()
            )));
        }
        document.controls.indexing.enabled_lattices = BravaisLattice::ALL
            .iter()
            .zip(flags)
            .filter(|(_, flag)| legacy_flag(flag))
            .map(|(bravais, _)| *bravais)
            .collect();
    }

    for (index, row) in legacy_rows(value, "cells")?.iter().enumerate() {
        let fields = legacy_row(row, "cells", index, 11)?;
        let id = legacy_index(&fields[2], "cell lattice id")?;
        let bravais = usize::try_from(id)
            .ok()
            .and_then(BravaisLattice::from_id)
            .ok_or_else(|| legacy_error(format!("row {index} of 'cells' has lattice id {id}")))?;
        let mut values = [0.0; 6];
        for (slot, field) in values.iter_mut().zip(&fields[3..9]) {
            *slot = legacy_number(field, "cell parameter")?;
        }
        let x20 = legacy_number(&fields[1], "X20")?;
        document.candidates.cells.push(IndexedCell {
            m20: legacy_number(&fields[0], "M20")?,
            x20: if x20 > 0.0 { x20.round() as usize } else { 0 },
            unindexed: 0,
            trial: TrialCell::new(bravais, CellParameters::from_array(values)),
            zero: document.instrument.zero(),
            keep: fields.get(11).is_some_and(legacy_flag),
        });
        if legacy_flag(&fields[10]) && document.candidates.selected.is_none() {
            document.candidates.selected = Some(index);
        }
    }

    for (index, row) in legacy_rows(value, "indexPeaks")?.iter().enumerate() {
        let fields = legacy_row(row, "indexPeaks", index, 9)?;
        let modulated = fields.len() >= 10;
        let tail = if modulated { 8 } else { 7 };
        let mut peak = ObservedPeak::new(
            legacy_number(&fields[0], "peak position")?,
            legacy_number(&fields[1], "peak intensity")?,
        );
        peak.use_flag = legacy_flag(&fields[2]);
        peak.indexed = legacy_flag(&fields[3]);
        peak.hkl = [
            legacy_index(&fields[4], "h")?,
            legacy_index(&fields[5], "k")?,
            legacy_index(&fields[6], "l")?,
        ];
        if modulated {
            peak.m = Some(legacy_index(&fields[7], "m")?);
        }
        peak.d_obs = legacy_number(&fields[tail], "d_obs")?;
        peak.d_calc = legacy_number(&fields[tail + 1], "d_calc")?;
        document.peaks.push(peak);
    }

    if let Some(ssopt) = value.get("ssopt").filter(|ssopt| ssopt.is_object()) {
        document.modulation = migrate_modulation(ssopt)?;
    }

    info!(
        peaks = document.peaks.len(),
        candidates = document.candidates.len(),
        "migrated legacy unit-cells document"
    );
    Ok(document)
}

fn migrate_modulation(ssopt: &Value) -> IndexResult<Option<ModulationSpec>> {
    if !ssopt.get("Use").is_some_and(legacy_flag) {
        return Ok(None);
    }
    let mut vector = [0.0; 3];
    if let Some(Value::Array(components)) = ssopt.get("ModVec") {
        if components.len() != 3 {
            return Err(legacy_error("'ssopt.ModVec' must hold three components"));
        }
        for (slot, component) in vector.iter_mut().zip(components) {
            *slot = legacy_number(component, "modulation component")?;
        }
    }
    let max_m = match ssopt.get("maxH") {
        Some(value) => legacy_index(value, "maxH")?.clamp(1, 3) as u8,
        None => 1,
    };
    let mut spec = ModulationSpec::new(vector, max_m);
    if let Some(Value::String(symbol)) = ssopt.get("ssSymb")
        && let Some(parsed) = parse_modulation_symbol(symbol, 0.0, max_m)
    {
        spec.refine = parsed.refine;
    }
    Ok(Some(spec))
}

fn lattice_from_symbol(symbol: &str) -> Option<BravaisLattice> {
    BravaisLattice::ALL
        .iter()
        .copied()
        .find(|bravais| bravais.symbol() == symbol.trim())
}

/// Figures for a cell matched against the document peaks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellScore {
    pub m20: f64,
    pub x20: usize,
    pub matched: usize,
    pub unindexed: usize,
}

impl From<&MatchOutcome> for CellScore {
    fn from(outcome: &MatchOutcome) -> Self {
        Self {
            m20: outcome.m20,
            x20: outcome.x20,
            matched: outcome.matched,
            unindexed: outcome.unindexed,
        }
    }
}

fn resolve_space_group(symbol: &str, bravais: BravaisLattice) -> IndexResult<SpaceGroup> {
    let group = BuiltinSpaceGroups.lookup(symbol).ok_or_else(|| {
        IndexError::input(
            "INPUT.SPACE_GROUP",
            format!("space group '{symbol}' is not known"),
        )
    })?;
    if group.laue != bravais.laue_class() {
        return Err(IndexError::incompatible_data(
            "INCOMPATIBLE.SPACE_GROUP",
            format!("space group '{symbol}' does not belong to the {bravais} lattice"),
        ));
    }
    Ok(group)
}

fn controls_space_group(document: &UnitCellsDocument) -> IndexResult<SpaceGroup> {
    let bravais = document.controls.cell.bravais;
    match &document.controls.space_group {
        Some(symbol) => resolve_space_group(symbol, bravais),
        None => Ok(SpaceGroup::from_bravais(bravais)),
    }
}

fn working_tolerance(
    document: &UnitCellsDocument,
    instrument: &InstrumentGeometry,
) -> crate::common::MatchTolerance {
    document
        .controls
        .indexing
        .tolerance
        .unwrap_or_else(|| instrument.default_tolerance())
}

fn score_cell(
    document: &UnitCellsDocument,
    trial: &TrialCell,
    space_group: &SpaceGroup,
    zero: f64,
    modulation: Option<&ModulationSpec>,
) -> IndexResult<MatchOutcome> {
    score_cell_within(document, trial, space_group, zero, modulation, 1.0)
}

/// As `score_cell`, with the matching window widened by `scale`.
fn score_cell_within(
    document: &UnitCellsDocument,
    trial: &TrialCell,
    space_group: &SpaceGroup,
    zero: f64,
    modulation: Option<&ModulationSpec>,
    scale: f64,
) -> IndexResult<MatchOutcome> {
    let instrument = document.instrument.with_zero(zero);
    let tolerance = working_tolerance(document, &instrument).scaled(scale);
    tolerance.validate()?;
    let reflections = generate_reflections(
        trial,
        space_group,
        document.controls.indexing.d_min,
        &instrument,
        modulation,
    )?;
    Ok(match_and_score(
        &document.peaks,
        &reflections,
        &tolerance,
        &instrument,
        document.controls.indexing.x20_mode,
    ))
}

/// Makes `index` the selected candidate: the working cell follows it and
/// the peaks are re-indexed against it.
fn apply_candidate(
    document: &UnitCellsDocument,
    candidates: CandidateList,
    index: usize,
) -> IndexResult<UnitCellsDocument> {
    let cell = candidates.cells.get(index).ok_or_else(|| {
        IndexError::input(
            "INPUT.CANDIDATE",
            format!("candidate {index} is outside the list of {}", candidates.len()),
        )
    })?;
    let group = SpaceGroup::from_bravais(cell.trial.bravais);
    let outcome = score_cell(
        document,
        &cell.trial,
        &group,
        cell.zero,
        document.modulation.as_ref(),
    )?;
    let mut updated = document.clone();
    updated.controls.cell = cell.trial;
    updated.controls.space_group = None;
    updated.instrument = document.instrument.with_zero(cell.zero);
    updated.peaks = outcome.peaks;
    updated.candidates = candidates;
    updated.candidates.selected = Some(index);
    Ok(updated)
}

/// Runs the lattice search over the document peaks.
///
/// Cells flagged `keep` survive every outcome. A completed search selects
/// the best candidate and indexes the peaks with it; a cancelled one stores
/// the partial list without touching the selection target.
pub fn run_index<O: SearchObserver + ?Sized>(
    document: &mut UnitCellsDocument,
    observer: &mut O,
) -> IndexResult<SearchOutcome> {
    let driver = SearchDriver::new(
        &document.peaks,
        &document.instrument,
        &document.controls.indexing,
        document.candidates.kept(),
    )?;
    let outcome = driver.run(observer);
    match &outcome {
        SearchOutcome::Completed(report) => {
            let updated = apply_candidate(document, report.candidates.clone(), 0)?;
            *document = updated;
        }
        SearchOutcome::Cancelled(report) | SearchOutcome::NoViableCell(report) => {
            let mut candidates = report.candidates.clone();
            candidates.clear_selection();
            document.candidates = candidates;
        }
    }
    info!(
        candidates = document.candidates.len(),
        cancelled = outcome.is_cancelled(),
        "indexing results stored"
    );
    Ok(outcome)
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefineReport {
    Improved {
        refinement: Refinement,
        score: CellScore,
    },
    /// χ² did not decrease; the document is untouched.
    Unchanged { chi_squared: f64 },
}

/// Refines the selected candidate (or the working cell) and writes the
/// result back only if χ² dropped. The peaks are first re-indexed against
/// that cell at the widened trial tolerance, so assignments left over from
/// another candidate never reach the least-squares fit.
pub fn refine_selected(
    document: &mut UnitCellsDocument,
    refine_zero: bool,
) -> IndexResult<RefineReport> {
    let (trial, zero) = match document.candidates.selected_cell() {
        Some(cell) => (cell.trial, cell.zero),
        None => (document.controls.cell, document.instrument.zero()),
    };
    let group = match document.candidates.selected {
        Some(_) => SpaceGroup::from_bravais(trial.bravais),
        None => controls_space_group(document)?,
    };

    let assigned = score_cell_within(
        document,
        &trial,
        &group,
        zero,
        document.modulation.as_ref(),
        document.controls.indexing.trial_tolerance_scale,
    )?;

    let controls = RefineControls {
        refine_zero,
        modulation: document.modulation,
        ..RefineControls::default()
    };
    let refinement = refine_cell(
        &trial,
        &assigned.peaks,
        &document.instrument.with_zero(zero),
        &controls,
    )?;
    if refinement.chi_squared >= refinement.chi_squared_initial {
        debug!(
            chi_squared = refinement.chi_squared_initial,
            "refinement did not lower chi-squared"
        );
        return Ok(RefineReport::Unchanged {
            chi_squared: refinement.chi_squared_initial,
        });
    }

    let outcome = score_cell(
        document,
        &refinement.trial,
        &group,
        refinement.zero,
        refinement.modulation.as_ref(),
    )?;
    let score = CellScore::from(&outcome);
    if let Some(index) = document.candidates.selected
        && let Some(cell) = document.candidates.cells.get_mut(index)
    {
        cell.trial = refinement.trial;
        cell.zero = refinement.zero;
        cell.m20 = score.m20;
        cell.x20 = score.x20;
        cell.unindexed = score.unindexed;
    }
    document.controls.cell = refinement.trial;
    document.instrument = document.instrument.with_zero(refinement.zero);
    document.modulation = refinement.modulation;
    document.peaks = outcome.peaks;
    info!(
        bravais = %refinement.trial.bravais,
        chi_squared = refinement.chi_squared,
        m20 = score.m20,
        "refined cell stored"
    );
    Ok(RefineReport::Improved { refinement, score })
}

pub fn select_candidate(document: &mut UnitCellsDocument, index: usize) -> IndexResult<()> {
    let updated = apply_candidate(document, document.candidates.clone(), index)?;
    *document = updated;
    Ok(())
}

/// Flips the `keep` flag of one candidate and returns the new value.
pub fn toggle_keep(document: &mut UnitCellsDocument, index: usize) -> IndexResult<bool> {
    let count = document.candidates.len();
    let cell = document.candidates.cells.get_mut(index).ok_or_else(|| {
        IndexError::input(
            "INPUT.CANDIDATE",
            format!("candidate {index} is outside the list of {count}"),
        )
    })?;
    cell.keep = !cell.keep;
    Ok(cell.keep)
}

pub fn sort_candidates(document: &mut UnitCellsDocument, key: SortKey) {
    document.candidates.sort_by(key);
}

/// Edits one parameter of the working cell under its lattice constraint.
pub fn set_cell_parameter(
    document: &mut UnitCellsDocument,
    kind: CellParameterKind,
    value: f64,
) -> IndexResult<CellParameters> {
    let mut cell = document.controls.cell.cell;
    cell.set_parameter(document.controls.cell.bravais, kind, value);
    cell.validate()?;
    document.controls.cell.cell = cell;
    Ok(cell)
}

/// Switches the working cell to another lattice, constraining the current
/// parameters to it and resetting the space group.
pub fn set_lattice(document: &mut UnitCellsDocument, bravais: BravaisLattice) -> IndexResult<()> {
    let trial = TrialCell::new(bravais, document.controls.cell.cell);
    trial.cell.validate()?;
    document.controls.cell = trial;
    document.controls.space_group = None;
    Ok(())
}

pub fn set_space_group(document: &mut UnitCellsDocument, symbol: Option<&str>) -> IndexResult<()> {
    if let Some(symbol) = symbol {
        resolve_space_group(symbol, document.controls.cell.bravais)?;
    }
    document.controls.space_group = symbol.map(str::to_string);
    Ok(())
}

/// Indexes the peaks against the working cell for display.
pub fn index_with_cell(document: &mut UnitCellsDocument) -> IndexResult<CellScore> {
    let group = controls_space_group(document)?;
    let outcome = score_cell(
        document,
        &document.controls.cell,
        &group,
        document.instrument.zero(),
        document.modulation.as_ref(),
    )?;
    let score = CellScore::from(&outcome);
    document.peaks = outcome.peaks;
    Ok(score)
}

pub fn reflection_table(document: &UnitCellsDocument) -> IndexResult<Vec<ReflectionHkl>> {
    let group = controls_space_group(document)?;
    generate_reflections(
        &document.controls.cell,
        &group,
        document.controls.indexing.d_min,
        &document.instrument,
        document.modulation.as_ref(),
    )
}

/// Asks the service for higher-symmetry lattices close to the current cell
/// and appends the ones not already listed, scored against the peaks.
/// Returns the number of cells added.
pub fn search_pseudo_lattices<S: PseudoLatticeService + ?Sized>(
    document: &mut UnitCellsDocument,
    service: &S,
    angle_tolerance: f64,
) -> IndexResult<usize> {
    if !(angle_tolerance.is_finite() && angle_tolerance > 0.0) {
        return Err(IndexError::input(
            "INPUT.ANGLE_TOLERANCE",
            format!("angle tolerance {angle_tolerance} must be positive"),
        ));
    }
    let (base, zero) = match document.candidates.selected_cell() {
        Some(cell) => (cell.trial, cell.zero),
        None => (document.controls.cell, document.instrument.zero()),
    };
    let request = PseudoLatticeRequest {
        space_group_number: base.bravais.space_group_number(),
        cell: base.cell,
        angle_tolerance,
        timeout: Duration::from_secs(DEFAULT_SERVICE_TIMEOUT_SECS),
    };
    let records = service.search(&request).into_result().inspect_err(|error| {
        warn!(error = %error, "pseudo-lattice search failed");
    })?;

    let mut additions: Vec<IndexedCell> = Vec::new();
    for record in &records {
        let trial = TrialCell::new(record.bravais, record.cell);
        let known = document
            .candidates
            .cells
            .iter()
            .chain(&additions)
            .any(|cell| same_cell(&cell.trial, &trial));
        if known {
            continue;
        }
        let group = SpaceGroup::from_bravais(trial.bravais);
        let outcome = score_cell(document, &trial, &group, zero, None)?;
        additions.push(IndexedCell {
            m20: outcome.m20,
            x20: outcome.x20,
            unindexed: outcome.unindexed,
            trial,
            zero,
            keep: false,
        });
    }
    let added = additions.len();
    document.candidates.cells.extend(additions);
    document.candidates.rank();
    info!(returned = records.len(), added, "pseudo-lattice cells added");
    Ok(added)
}

/// Caller-chosen parameters of a subgroup enumeration.
#[derive(Debug, Clone, PartialEq)]
pub struct SubgroupSearchOptions {
    pub kvecs: Vec<[f64; 3]>,
    pub whole_star: bool,
    pub filter: FilterMode,
    pub landau: bool,
    pub max_atoms: usize,
    pub timeout: Duration,
}

impl Default for SubgroupSearchOptions {
    fn default() -> Self {
        Self {
            kvecs: vec![[0.0; 3]],
            whole_star: true,
            filter: FilterMode::AtomCount,
            landau: false,
            max_atoms: crate::common::constants::DEFAULT_MAX_UNIQUE_ATOMS,
            timeout: Duration::from_secs(DEFAULT_SERVICE_TIMEOUT_SECS),
        }
    }
}

fn parent_with_group(document: &UnitCellsDocument) -> IndexResult<(&ParentPhase, SpaceGroup)> {
    let parent = document.parent.as_ref().ok_or_else(|| {
        IndexError::incompatible_data(
            "INCOMPATIBLE.NO_PARENT",
            "no parent phase is attached to the document",
        )
    })?;
    let group = BuiltinSpaceGroups.lookup(&parent.space_group).ok_or_else(|| {
        IndexError::incompatible_data(
            "INCOMPATIBLE.SPACE_GROUP",
            format!("parent space group '{}' is not known", parent.space_group),
        )
    })?;
    Ok((parent, group))
}

/// Enumerates subgroups of the parent phase, builds their cells and filters
/// them. Returns the number of kept subgroups.
pub fn search_subgroups<S: SubgroupService + ?Sized>(
    document: &mut UnitCellsDocument,
    service: &S,
    options: &SubgroupSearchOptions,
) -> IndexResult<usize> {
    let (parent, group) = parent_with_group(document)?;
    let request = SubgroupRequest {
        parent_symbol: parent.space_group.clone(),
        operators: group
            .full_operators()
            .iter()
            .map(ToString::to_string)
            .collect(),
        kvecs: options.kvecs.clone(),
        whole_star: options.whole_star,
        filter: options.filter,
        landau: options.landau,
        timeout: options.timeout,
    };
    request.validate()?;
    let records = service
        .enumerate(&request)
        .into_result()
        .inspect_err(|error| warn!(error = %error, "subgroup enumeration failed"))?;
    let mut list = build_subgroup_phases(&records, parent)?;
    let kept = filter_subgroups(&mut list, parent, &group, options.max_atoms, options.filter)?;
    document.subgroups = list;
    Ok(kept)
}

/// Re-runs the subgroup filter on the stored list without contacting a
/// service.
pub fn refilter_subgroups(
    document: &mut UnitCellsDocument,
    max_atoms: usize,
    mode: FilterMode,
) -> IndexResult<usize> {
    let (parent, group) = parent_with_group(document)?;
    let mut list = document.subgroups.clone();
    let kept = filter_subgroups(&mut list, parent, &group, max_atoms, mode)?;
    document.subgroups = list;
    Ok(kept)
}

pub fn select_subgroup(document: &mut UnitCellsDocument, index: usize) -> IndexResult<()> {
    match document.subgroups.phases.get(index) {
        Some(phase) if phase.keep => {
            document.subgroups.selected = Some(index);
            Ok(())
        }
        Some(phase) => Err(IndexError::input(
            "INPUT.SUBGROUP",
            format!("subgroup {index} ({}) was filtered out", phase.symbol),
        )),
        None => Err(IndexError::input(
            "INPUT.SUBGROUP",
            format!(
                "subgroup {index} is outside the list of {}",
                document.subgroups.phases.len()
            ),
        )),
    }
}

/// Direction for walking the kept subgroups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubgroupStep {
    Next,
    Previous,
}

/// Stored phase indices grouped by conjugacy class.
pub fn subgroup_classes(document: &UnitCellsDocument) -> Vec<Vec<usize>> {
    conjugacy_classes(&document.subgroups)
}

/// Moves the subgroup selection to the neighbouring kept phase, wrapping
/// around the list. Without a selection `Next` lands on the first kept
/// phase and `Previous` on the last.
pub fn step_subgroup(document: &mut UnitCellsDocument, step: SubgroupStep) -> IndexResult<usize> {
    let count = document.subgroups.phases.len();
    let list = &document.subgroups;
    let target = match (step, list.selected) {
        (SubgroupStep::Next, Some(from)) => next_kept(list, from),
        (SubgroupStep::Previous, Some(from)) => previous_kept(list, from),
        (SubgroupStep::Next, None) if count > 0 => next_kept(list, count - 1),
        (SubgroupStep::Previous, None) if count > 0 => previous_kept(list, 0),
        _ => None,
    };
    let Some(index) = target else {
        return Err(IndexError::input("INPUT.SUBGROUP", "no kept subgroup to step to"));
    };
    document.subgroups.selected = Some(index);
    debug!(index, symbol = %document.subgroups.phases[index].symbol, "subgroup selected");
    Ok(index)
}
