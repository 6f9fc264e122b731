use super::CliError;
use anyhow::Context;
use cellindex_core::domain::{BravaisLattice, IndexError};
use cellindex_core::modules::document::{
    SubgroupStep, read_document, refilter_subgroups, refine_selected, reflection_table, run_index,
    save, select_candidate, step_subgroup, subgroup_classes,
};
use cellindex_core::modules::serialization::{
    format_candidate_table, format_fixed_f64, format_peak_table, format_reflection_table,
};
use cellindex_core::modules::{
    FilterMode, RefineReport, SearchOutcome, SearchProgress, SearchState,
};
use std::io::Write;
use std::ops::ControlFlow;
use std::path::PathBuf;
use tracing::info;

#[derive(clap::Args)]
pub(super) struct IndexArgs {
    /// Unit-cells document (JSON)
    document: PathBuf,

    /// Write the candidates back into the document
    #[arg(long)]
    write: bool,

    /// Comma-separated lattice symbols overriding the enabled set, e.g. Fm-3m,P4/mmm
    #[arg(long, value_delimiter = ',')]
    lattices: Vec<String>,

    /// Number of candidates to print
    #[arg(long, default_value_t = 10)]
    top: usize,
}

#[derive(clap::Args)]
pub(super) struct RefineArgs {
    /// Unit-cells document (JSON)
    document: PathBuf,

    /// Refine the zero offset together with the cell
    #[arg(long)]
    zero: bool,

    /// Write the refined cell back into the document
    #[arg(long)]
    write: bool,
}

#[derive(clap::Args)]
pub(super) struct SelectArgs {
    /// Unit-cells document (JSON)
    document: PathBuf,

    /// Row of the candidate list, as printed by `index`
    #[arg(value_name = "row")]
    index: usize,
}

#[derive(clap::Args)]
pub(super) struct ReflectionsArgs {
    /// Unit-cells document (JSON)
    document: PathBuf,
}

#[derive(clap::Args)]
pub(super) struct MigrateArgs {
    /// Document in the legacy or the current layout
    document: PathBuf,

    /// Destination of the migrated document
    #[arg(long)]
    output: PathBuf,
}

#[derive(clap::Args)]
pub(super) struct SubgroupsFilterArgs {
    /// Unit-cells document (JSON)
    document: PathBuf,

    /// Largest number of symmetry-distinct atoms a kept subgroup may have
    #[arg(long)]
    max_atoms: usize,

    /// Keep only maximal subgroups
    #[arg(long)]
    maximal: bool,

    /// Write the filtered list back into the document
    #[arg(long)]
    write: bool,
}

#[derive(clap::Args)]
pub(super) struct SubgroupsArgs {
    /// Unit-cells document (JSON)
    document: PathBuf,

    /// Select the next kept subgroup and save the document
    #[arg(long, conflicts_with = "previous")]
    next: bool,

    /// Select the previous kept subgroup and save the document
    #[arg(long)]
    previous: bool,
}

fn emit(text: &str) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(text.as_bytes())
        .and_then(|()| stdout.flush())
        .context("failed to write to stdout")
}

fn parse_lattices(symbols: &[String]) -> Result<Vec<BravaisLattice>, CliError> {
    symbols
        .iter()
        .map(|symbol| {
            BravaisLattice::ALL
                .iter()
                .copied()
                .find(|bravais| bravais.symbol() == symbol.trim())
                .ok_or_else(|| {
                    let known: Vec<&str> =
                        BravaisLattice::ALL.iter().map(|bravais| bravais.symbol()).collect();
                    CliError::Usage(format!(
                        "Unknown lattice '{}'; expected one of {}",
                        symbol,
                        known.join(", ")
                    ))
                })
        })
        .collect()
}

pub(super) fn run_index_command(args: IndexArgs) -> Result<i32, CliError> {
    let mut document = read_document(&args.document)?;
    if !args.lattices.is_empty() {
        document.controls.indexing.enabled_lattices = parse_lattices(&args.lattices)?;
    }

    let mut observer = |progress: &SearchProgress| {
        if let SearchState::CandidateFound { lattice, m20 } = progress.state {
            info!(%lattice, m20, trials = progress.total_trials, "candidate found");
        }
        ControlFlow::Continue(())
    };
    let outcome = run_index(&mut document, &mut observer)?;

    let report = outcome.report();
    let mut summary = String::new();
    for lattice in &report.lattices {
        summary.push_str(&format!(
            "{:<7} trials {:>7}  candidates {:>3}{}\n",
            lattice.bravais.symbol(),
            lattice.trials,
            lattice.candidates,
            if lattice.terminated_early { "  (capped)" } else { "" }
        ));
    }
    let shown = args.top.min(document.candidates.len());
    summary.push_str(&format_candidate_table(
        &document.candidates.cells[..shown],
        document.candidates.selected,
    ));
    emit(&summary)?;

    if args.write {
        save(&document, &args.document)?;
        emit(&format!("Wrote {}\n", args.document.display()))?;
    }

    match outcome {
        SearchOutcome::NoViableCell(_) => Err(CliError::Compute(IndexError::search_exhausted(
            "SEARCH.NO_VIABLE_CELL",
            "no trial cell reached the figure-of-merit threshold",
        ))),
        SearchOutcome::Completed(_) | SearchOutcome::Cancelled(_) => Ok(0),
    }
}

pub(super) fn run_refine_command(args: RefineArgs) -> Result<i32, CliError> {
    let mut document = read_document(&args.document)?;
    match refine_selected(&mut document, args.zero)? {
        RefineReport::Improved { refinement, score } => {
            let mut text = String::from("parameter        value          esd\n");
            let names = ["a", "b", "c", "alpha", "beta", "gamma"];
            for ((name, value), esd) in names
                .iter()
                .zip(refinement.trial.cell.as_array())
                .zip(refinement.cell_esd)
            {
                text.push_str(&format!(
                    "{name:<9}{}{}\n",
                    format_fixed_f64(value, 13, 5),
                    format_fixed_f64(esd, 13, 5)
                ));
            }
            if let Some(zero_esd) = refinement.zero_esd {
                text.push_str(&format!(
                    "{:<9}{}{}\n",
                    "zero",
                    format_fixed_f64(refinement.zero, 13, 5),
                    format_fixed_f64(zero_esd, 13, 5)
                ));
            }
            text.push_str(&format!(
                "chi2 {:.6e} -> {:.6e} after {} iterations; M20 {:.2} X20 {}\n",
                refinement.chi_squared_initial,
                refinement.chi_squared,
                refinement.iterations,
                score.m20,
                score.x20
            ));
            emit(&text)?;
            if args.write {
                save(&document, &args.document)?;
                emit(&format!("Wrote {}\n", args.document.display()))?;
            }
        }
        RefineReport::Unchanged { chi_squared } => {
            emit(&format!(
                "Refinement did not lower chi2 ({chi_squared:.6e}); document unchanged\n"
            ))?;
        }
    }
    Ok(0)
}

pub(super) fn run_select_command(args: SelectArgs) -> Result<i32, CliError> {
    let mut document = read_document(&args.document)?;
    select_candidate(&mut document, args.index)?;
    save(&document, &args.document)?;
    emit(&format_peak_table(&document.peaks))?;
    Ok(0)
}

pub(super) fn run_reflections_command(args: ReflectionsArgs) -> Result<i32, CliError> {
    let document = read_document(&args.document)?;
    let reflections = reflection_table(&document)?;
    emit(&format_reflection_table(&reflections))?;
    Ok(0)
}

pub(super) fn run_migrate_command(args: MigrateArgs) -> Result<i32, CliError> {
    let document = read_document(&args.document)?;
    save(&document, &args.output)?;
    emit(&format!(
        "Migrated {} -> {} ({} peaks, {} candidates)\n",
        args.document.display(),
        args.output.display(),
        document.peaks.len(),
        document.candidates.len()
    ))?;
    Ok(0)
}

pub(super) fn run_subgroups_filter_command(args: SubgroupsFilterArgs) -> Result<i32, CliError> {
    let mut document = read_document(&args.document)?;
    let mode = if args.maximal {
        FilterMode::Maximal
    } else {
        FilterMode::AtomCount
    };
    let kept = refilter_subgroups(&mut document, args.max_atoms, mode)?;
    let mut text = format!(
        "kept {kept} of {} subgroups\n",
        document.subgroups.phases.len()
    );
    for phase in document.subgroups.phases.iter().filter(|phase| phase.keep) {
        text.push_str(&format!(
            "{:<12} atoms {:>4}  class {}\n",
            phase.symbol,
            phase.unique_atoms.unwrap_or(0),
            phase.conjugacy_class
        ));
    }
    emit(&text)?;
    if args.write {
        save(&document, &args.document)?;
    }
    Ok(0)
}

pub(super) fn run_subgroups_command(args: SubgroupsArgs) -> Result<i32, CliError> {
    let mut document = read_document(&args.document)?;
    let step = match (args.next, args.previous) {
        (true, _) => Some(SubgroupStep::Next),
        (_, true) => Some(SubgroupStep::Previous),
        _ => None,
    };
    if let Some(step) = step {
        step_subgroup(&mut document, step)?;
        save(&document, &args.document)?;
    }

    let mut text = String::new();
    for members in subgroup_classes(&document) {
        let class = document.subgroups.phases[members[0]].conjugacy_class;
        text.push_str(&format!("class {class}\n"));
        for index in members {
            let phase = &document.subgroups.phases[index];
            let marker = if document.subgroups.selected == Some(index) {
                '*'
            } else {
                ' '
            };
            text.push_str(&format!(
                "{marker}{index:>4}  {:<12} atoms {:>4}  {}\n",
                phase.symbol,
                phase.unique_atoms.unwrap_or(0),
                if phase.keep { "kept" } else { "filtered" }
            ));
        }
    }
    emit(&text)?;
    Ok(0)
}
