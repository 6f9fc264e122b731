use crate::domain::{IndexedCell, ObservedPeak, ReflectionHkl};
use std::fs;
use std::path::Path;

pub fn format_fixed_f64(value: f64, width: usize, precision: usize) -> String {
    format!(
        "{value:>width$.precision$}",
        width = width,
        precision = precision
    )
}

pub fn normalize_text_artifact(content: &str) -> String {
    let mut normalized = content.replace("\r\n", "\n").replace('\r', "\n");
    if !normalized.is_empty() && !normalized.ends_with('\n') {
        normalized.push('\n');
    }
    normalized
}

pub fn write_text_artifact(path: &Path, content: &str) -> std::io::Result<()> {
    fs::write(path, normalize_text_artifact(content))
}

/// Fixed-width listing of generated reflections; the `m` column appears only
/// when at least one reflection carries a modulation index.
pub fn format_reflection_table(reflections: &[ReflectionHkl]) -> String {
    let modulated = reflections.iter().any(|reflection| reflection.m.is_some());
    let mut table = String::new();
    table.push_str(if modulated {
        "   h   k   l   m            d     position  mult\n"
    } else {
        "   h   k   l            d     position  mult\n"
    });
    for reflection in reflections {
        let [h, k, l] = reflection.hkl;
        table.push_str(&format!("{h:>4}{k:>4}{l:>4}"));
        if modulated {
            table.push_str(&format!("{:>4}", reflection.m.unwrap_or(0)));
        }
        table.push_str(&format_fixed_f64(reflection.d, 13, 5));
        table.push_str(&format_fixed_f64(reflection.position, 13, 4));
        table.push_str(&format!("{:>6}\n", reflection.multiplicity));
    }
    table
}

pub fn format_peak_table(peaks: &[ObservedPeak]) -> String {
    let mut table =
        String::from("     position    intensity use idx   h   k   l        d_obs       d_calc\n");
    for peak in peaks {
        let [h, k, l] = peak.hkl;
        table.push_str(&format_fixed_f64(peak.position, 13, 4));
        table.push_str(&format_fixed_f64(peak.intensity, 13, 1));
        table.push_str(&format!(
            "{:>4}{:>4}{h:>4}{k:>4}{l:>4}",
            flag(peak.use_flag),
            flag(peak.indexed)
        ));
        table.push_str(&format_fixed_f64(peak.d_obs, 13, 5));
        table.push_str(&format_fixed_f64(peak.d_calc, 13, 5));
        table.push('\n');
    }
    table
}

pub fn format_candidate_table(cells: &[IndexedCell], selected: Option<usize>) -> String {
    let mut table = String::from(
        "  #        M20  X20 lattice        a          b          c      alpha       beta      gamma       volume keep\n",
    );
    for (index, cell) in cells.iter().enumerate() {
        let marker = if selected == Some(index) { '*' } else { ' ' };
        let parameters = cell.trial.cell;
        table.push_str(&format!("{marker}{index:>2}"));
        table.push_str(&format_fixed_f64(cell.m20, 11, 2));
        table.push_str(&format!("{:>5} {:<7}", cell.x20, cell.trial.bravais.symbol()));
        for value in parameters.as_array() {
            table.push_str(&format_fixed_f64(value, 11, 5));
        }
        table.push_str(&format_fixed_f64(cell.volume(), 13, 3));
        table.push_str(&format!("{:>5}\n", flag(cell.keep)));
    }
    table
}

fn flag(value: bool) -> char {
    if value { 'Y' } else { '.' }
}

#[cfg(test)]
mod tests {
    use super::{
        format_candidate_table, format_fixed_f64, format_reflection_table,
        normalize_text_artifact, write_text_artifact,
    };
    use crate::domain::{BravaisLattice, CellParameters, IndexedCell, ReflectionHkl, TrialCell};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn fixed_width_float_formatting_is_deterministic() {
        let first = format_fixed_f64(1.23, 13, 5);
        let second = format_fixed_f64(1.23, 13, 5);

        assert_eq!(first, "      1.23000");
        assert_eq!(first, second);
    }

    #[test]
    fn normalize_text_artifact_uses_canonical_line_endings() {
        let normalized = normalize_text_artifact("alpha\r\nbeta\rgamma");
        assert_eq!(normalized, "alpha\nbeta\ngamma\n");
    }

    #[test]
    fn repeated_text_writes_produce_identical_bytes() {
        let temp = TempDir::new().expect("tempdir should be created");
        let path = temp.path().join("cells.json");
        let input = "line 1\r\nline 2\rline 3";

        write_text_artifact(&path, input).expect("first write should succeed");
        let first = fs::read(&path).expect("artifact should be readable");

        write_text_artifact(&path, input).expect("second write should succeed");
        let second = fs::read(&path).expect("artifact should be readable");

        assert_eq!(first, second);
        assert_eq!(second, b"line 1\nline 2\nline 3\n");
    }

    #[test]
    fn reflection_table_lists_one_row_per_reflection() {
        let reflections = vec![
            ReflectionHkl {
                hkl: [1, 1, 1],
                m: None,
                d: 2.33827,
                position: 38.4712,
                multiplicity: 8,
            },
            ReflectionHkl {
                hkl: [2, 0, 0],
                m: None,
                d: 2.025,
                position: 44.7148,
                multiplicity: 6,
            },
        ];
        let table = format_reflection_table(&reflections);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(!lines[0].contains(" m "));
        assert_eq!(lines[1], "   1   1   1      2.33827      38.4712     8");
    }

    #[test]
    fn candidate_table_marks_the_selection() {
        let cells = vec![IndexedCell {
            m20: 150.0,
            x20: 0,
            unindexed: 0,
            trial: TrialCell::new(BravaisLattice::CubicF, CellParameters::cubic(4.05)),
            zero: 0.0,
            keep: true,
        }];
        let table = format_candidate_table(&cells, Some(0));
        let row = table.lines().nth(1).expect("one candidate row");
        assert!(row.starts_with("* 0"));
        assert!(row.contains("Fm-3m"));
        assert!(row.ends_with('Y'));
    }
}
