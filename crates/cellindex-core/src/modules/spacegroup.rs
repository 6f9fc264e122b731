//! Space-group data consumed by the reflection generator and the subgroup
//! filters: operators, systematic absences and Laue-class orbits.

use crate::domain::{BravaisLattice, Centering, LaueClass, ModulationSpec};
use serde::{Deserialize, Serialize};

pub type IntMatrix3 = [[i32; 3]; 3];

const INT_IDENTITY: IntMatrix3 = [[1, 0, 0], [0, 1, 0], [0, 0, 1]];
const PHASE_EPSILON: f64 = 1.0e-6;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SymOpParseError {
    #[error("operator '{operator}' must have three comma-separated components, found {found}")]
    WrongComponentCount { operator: String, found: usize },
    #[error("cannot parse term in component '{component}'")]
    InvalidTerm { component: String },
    #[error("coefficient in component '{component}' is not an integer")]
    NonIntegralCoefficient { component: String },
}

/// Affine operator `x' = R·x + t` on fractional coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymOp {
    pub rotation: IntMatrix3,
    pub translation: [f64; 3],
}

impl SymOp {
    pub const IDENTITY: SymOp = SymOp {
        rotation: INT_IDENTITY,
        translation: [0.0; 3],
    };

    /// Parses the Jones-faithful form, e.g. `-x+1/2,y,-z` or `x-y, x, z+1/6`.
    pub fn parse(operator: &str) -> Result<Self, SymOpParseError> {
        let components: Vec<&str> = operator.split(',').collect();
        if components.len() != 3 {
            return Err(SymOpParseError::WrongComponentCount {
                operator: operator.to_string(),
                found: components.len(),
            });
        }
        let mut rotation = [[0; 3]; 3];
        let mut translation = [0.0; 3];
        for (row, component) in components.iter().enumerate() {
            let (coefficients, shift) = parse_component(component)?;
            rotation[row] = coefficients;
            translation[row] = shift;
        }
        Ok(Self {
            rotation,
            translation,
        })
    }

    pub fn apply(&self, position: [f64; 3]) -> [f64; 3] {
        let mut result = self.translation;
        for (row, slot) in result.iter_mut().enumerate() {
            for col in 0..3 {
                *slot += f64::from(self.rotation[row][col]) * position[col];
            }
        }
        result
    }

    /// Row-vector action `h·R` on Miller indices.
    pub fn act_on_hkl(&self, hkl: [i32; 3]) -> [i32; 3] {
        let mut result = [0; 3];
        for (col, slot) in result.iter_mut().enumerate() {
            *slot = (0..3).map(|row| hkl[row] * self.rotation[row][col]).sum();
        }
        result
    }

    pub fn phase(&self, hkl: [i32; 3]) -> f64 {
        (0..3)
            .map(|axis| f64::from(hkl[axis]) * self.translation[axis])
            .sum()
    }

    pub fn with_translation(&self, extra: [f64; 3]) -> Self {
        let mut combined = *self;
        for axis in 0..3 {
            combined.translation[axis] += extra[axis];
        }
        combined
    }
}

impl std::fmt::Display for SymOp {
    /// Jones-faithful form accepted by [`SymOp::parse`], e.g. `-x+1/2,y,-z`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for row in 0..3 {
            if row > 0 {
                f.write_str(",")?;
            }
            let mut component = String::new();
            for (axis, name) in ['x', 'y', 'z'].iter().enumerate() {
                let coefficient = self.rotation[row][axis];
                if coefficient == 0 {
                    continue;
                }
                if coefficient < 0 {
                    component.push('-');
                } else if !component.is_empty() {
                    component.push('+');
                }
                if coefficient.abs() != 1 {
                    component.push_str(&coefficient.abs().to_string());
                }
                component.push(*name);
            }
            let shift = self.translation[row];
            if shift.abs() > PHASE_EPSILON {
                if shift > 0.0 && !component.is_empty() {
                    component.push('+');
                } else if shift < 0.0 {
                    component.push('-');
                }
                component.push_str(&format_fraction(shift.abs()));
            }
            if component.is_empty() {
                component.push('0');
            }
            f.write_str(&component)?;
        }
        Ok(())
    }
}

fn format_fraction(value: f64) -> String {
    for denominator in [1_i32, 2, 3, 4, 6, 8, 12] {
        let numerator = value * f64::from(denominator);
        if (numerator - numerator.round()).abs() < PHASE_EPSILON {
            let numerator = numerator.round() as i32;
            return if denominator == 1 {
                numerator.to_string()
            } else {
                format!("{numerator}/{denominator}")
            };
        }
    }
    format!("{value}")
}

fn parse_component(component: &str) -> Result<([i32; 3], f64), SymOpParseError> {
    let chars: Vec<char> = component
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let invalid = || SymOpParseError::InvalidTerm {
        component: component.to_string(),
    };
    if chars.is_empty() {
        return Err(invalid());
    }

    let mut coefficients = [0; 3];
    let mut shift = 0.0;
    let mut index = 0;
    while index < chars.len() {
        let mut sign = 1.0;
        match chars[index] {
            '+' => index += 1,
            '-' => {
                sign = -1.0;
                index += 1;
            }
            _ => {}
        }
        let start = index;
        while index < chars.len() && (chars[index].is_ascii_digit() || matches!(chars[index], '.' | '/'))
        {
            index += 1;
        }
        let number: String = chars[start..index].iter().collect();
        let axis = chars.get(index).and_then(|c| match c {
            'x' => Some(0),
            'y' => Some(1),
            'z' => Some(2),
            _ => None,
        });
        match axis {
            Some(axis) => {
                let coefficient = if number.is_empty() {
                    1.0
                } else {
                    parse_number(&number).ok_or_else(invalid)?
                };
                if coefficient.fract() != 0.0 {
                    return Err(SymOpParseError::NonIntegralCoefficient {
                        component: component.to_string(),
                    });
                }
                coefficients[axis] += (sign * coefficient) as i32;
                index += 1;
            }
            None => {
                if number.is_empty() {
                    return Err(invalid());
                }
                shift += sign * parse_number(&number).ok_or_else(invalid)?;
            }
        }
    }
    Ok((coefficients, shift))
}

fn parse_number(text: &str) -> Option<f64> {
    match text.split_once('/') {
        Some((numerator, denominator)) => {
            let numerator: f64 = numerator.parse().ok()?;
            let denominator: f64 = denominator.parse().ok()?;
            (denominator != 0.0).then(|| numerator / denominator)
        }
        None => text.parse().ok(),
    }
}

fn int_mul(left: &IntMatrix3, right: &IntMatrix3) -> IntMatrix3 {
    let mut product = [[0; 3]; 3];
    for row in 0..3 {
        for col in 0..3 {
            product[row][col] = (0..3).map(|k| left[row][k] * right[k][col]).sum();
        }
    }
    product
}

fn int_transpose(m: &IntMatrix3) -> IntMatrix3 {
    let mut transposed = [[0; 3]; 3];
    for row in 0..3 {
        for col in 0..3 {
            transposed[row][col] = m[col][row];
        }
    }
    transposed
}

fn close_group(generators: &[IntMatrix3]) -> Vec<IntMatrix3> {
    let mut group = vec![INT_IDENTITY];
    let mut frontier = vec![INT_IDENTITY];
    while let Some(element) = frontier.pop() {
        for generator in generators {
            let product = int_mul(generator, &element);
            if !group.contains(&product) {
                group.push(product);
                frontier.push(product);
            }
        }
    }
    group
}

/// Laue-group operators acting on Miller indices as column vectors, `h' = M·h`.
pub fn laue_operators(laue: LaueClass) -> Vec<IntMatrix3> {
    const INVERSION: IntMatrix3 = [[-1, 0, 0], [0, -1, 0], [0, 0, -1]];
    const TWOFOLD_Y: IntMatrix3 = [[-1, 0, 0], [0, 1, 0], [0, 0, -1]];
    const TWOFOLD_Z: IntMatrix3 = [[-1, 0, 0], [0, -1, 0], [0, 0, 1]];
    const TWOFOLD_X: IntMatrix3 = [[1, 0, 0], [0, -1, 0], [0, 0, -1]];
    const FOURFOLD_Z: IntMatrix3 = [[0, -1, 0], [1, 0, 0], [0, 0, 1]];
    const THREEFOLD_HEX: IntMatrix3 = [[0, 1, 0], [-1, -1, 0], [0, 0, 1]];
    const TWOFOLD_HEX_DIAGONAL: IntMatrix3 = [[0, 1, 0], [1, 0, 0], [0, 0, -1]];
    const THREEFOLD_BODY: IntMatrix3 = [[0, 0, 1], [1, 0, 0], [0, 1, 0]];

    let generators: &[IntMatrix3] = match laue {
        LaueClass::Triclinic => &[INVERSION],
        LaueClass::Monoclinic => &[INVERSION, TWOFOLD_Y],
        LaueClass::Orthorhombic => &[INVERSION, TWOFOLD_Z, TWOFOLD_X],
        LaueClass::Tetragonal => &[INVERSION, FOURFOLD_Z, TWOFOLD_X],
        LaueClass::Trigonal => &[INVERSION, THREEFOLD_HEX, TWOFOLD_HEX_DIAGONAL],
        LaueClass::Hexagonal => &[INVERSION, THREEFOLD_HEX, TWOFOLD_HEX_DIAGONAL, TWOFOLD_Z],
        LaueClass::Cubic => &[INVERSION, FOURFOLD_Z, THREEFOLD_BODY],
    };
    close_group(generators)
}

fn apply_int(m: &IntMatrix3, hkl: [i32; 3]) -> [i32; 3] {
    [
        m[0][0] * hkl[0] + m[0][1] * hkl[1] + m[0][2] * hkl[2],
        m[1][0] * hkl[0] + m[1][1] * hkl[1] + m[1][2] * hkl[2],
        m[2][0] * hkl[0] + m[2][1] * hkl[1] + m[2][2] * hkl[2],
    ]
}

/// Canonical representative (lexicographic maximum) of the orbit of `hkl`
/// and the orbit size.
pub fn canonical_hkl(operators: &[IntMatrix3], hkl: [i32; 3]) -> ([i32; 3], usize) {
    let mut orbit: Vec<[i32; 3]> = operators.iter().map(|op| apply_int(op, hkl)).collect();
    orbit.sort_unstable();
    orbit.dedup();
    let representative = orbit.last().copied().unwrap_or(hkl);
    (representative, orbit.len())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceGroup {
    pub symbol: String,
    pub centering: Centering,
    pub laue: LaueClass,
    /// Coset representatives; centering translations are implied.
    pub operators: Vec<SymOp>,
}

impl SpaceGroup {
    /// Holohedral group of a Bravais lattice (no glides or screws).
    pub fn from_bravais(bravais: BravaisLattice) -> Self {
        let laue = bravais.laue_class();
        let operators = laue_operators(laue)
            .iter()
            .map(|op| SymOp {
                rotation: int_transpose(op),
                translation: [0.0; 3],
            })
            .collect();
        Self {
            symbol: bravais.symbol().to_string(),
            centering: bravais.centering(),
            laue,
            operators,
        }
    }

    pub fn from_operators(
        symbol: &str,
        laue: LaueClass,
        operators: &[&str],
    ) -> Result<Self, SymOpParseError> {
        let operators = operators
            .iter()
            .map(|op| SymOp::parse(op))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            symbol: symbol.to_string(),
            centering: Centering::from_symbol(symbol).unwrap_or(Centering::P),
            laue,
            operators,
        })
    }

    /// All operators with the centering translations applied.
    pub fn full_operators(&self) -> Vec<SymOp> {
        let mut operators = self.operators.clone();
        if operators.is_empty() {
            operators.push(SymOp::IDENTITY);
        }
        let base = operators.clone();
        for translation in self.centering.translations() {
            operators.extend(base.iter().map(|op| op.with_translation(*translation)));
        }
        operators
    }

    /// `hkl` is extinct when an operator fixes it (`h·R = h`) while
    /// contributing a non-integral phase `h·t`.
    pub fn is_systematically_absent(&self, hkl: [i32; 3]) -> bool {
        let centering_absent = self.centering.translations().iter().any(|translation| {
            let phase: f64 = (0..3)
                .map(|axis| f64::from(hkl[axis]) * translation[axis])
                .sum();
            is_non_integral(phase)
        });
        centering_absent
            || self
                .operators
                .iter()
                .any(|op| op.act_on_hkl(hkl) == hkl && is_non_integral(op.phase(hkl)))
    }
}

fn is_non_integral(value: f64) -> bool {
    (value - value.round()).abs() > PHASE_EPSILON
}

pub trait SpaceGroupService {
    fn lookup(&self, symbol: &str) -> Option<SpaceGroup>;
}

/// Holohedral groups of the fourteen lattices plus a short table of common
/// groups given by their operators.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinSpaceGroups;

const OPERATOR_TABLE: &[(&str, LaueClass, &[&str])] = &[
    ("P1", LaueClass::Triclinic, &["x,y,z"]),
    ("P-1", LaueClass::Triclinic, &["x,y,z", "-x,-y,-z"]),
    (
        "P21/c",
        LaueClass::Monoclinic,
        &["x,y,z", "-x,y+1/2,-z+1/2", "-x,-y,-z", "x,-y+1/2,z+1/2"],
    ),
    (
        "P212121",
        LaueClass::Orthorhombic,
        &[
            "x,y,z",
            "-x+1/2,-y,z+1/2",
            "-x,y+1/2,-z+1/2",
            "x+1/2,-y+1/2,-z",
        ],
    ),
    (
        "P63/mmc",
        LaueClass::Hexagonal,
        &[
            "x,y,z",
            "-y,x-y,z",
            "-x+y,-x,z",
            "-x,-y,z+1/2",
            "y,-x+y,z+1/2",
            "x-y,x,z+1/2",
            "y,x,-z",
            "x-y,-y,-z",
            "-x,-x+y,-z",
            "-y,-x,-z+1/2",
            "-x+y,y,-z+1/2",
            "x,x-y,-z+1/2",
            "-x,-y,-z",
            "y,-x+y,-z",
            "x-y,x,-z",
            "x,y,-z+1/2",
            "-y,x-y,-z+1/2",
            "-x+y,-x,-z+1/2",
            "-y,-x,z",
            "-x+y,y,z",
            "x,x-y,z",
            "y,x,z+1/2",
            "x-y,-y,z+1/2",
            "-x,-x+y,z+1/2",
        ],
    ),
];

pub fn normalize_symbol(symbol: &str) -> String {
    symbol.chars().filter(|c| !c.is_whitespace()).collect()
}

impl SpaceGroupService for BuiltinSpaceGroups {
    fn lookup(&self, symbol: &str) -> Option<SpaceGroup> {
        let normalized = normalize_symbol(symbol);
        if let Some(bravais) = BravaisLattice::ALL
            .iter()
            .find(|bravais| normalize_symbol(bravais.symbol()) == normalized)
        {
            return Some(SpaceGroup::from_bravais(*bravais));
        }
        OPERATOR_TABLE
            .iter()
            .find(|(name, _, _)| *name == normalized)
            .and_then(|(name, laue, operators)| {
                SpaceGroup::from_operators(name, *laue, operators).ok()
            })
    }
}

/// Modulation-vector types compatible with a parent group, written in the
/// usual `(αβγ)` notation with `a`, `b`, `g` marking free components.
pub fn modulation_symbols(group: &SpaceGroup) -> Vec<&'static str> {
    match group.laue {
        LaueClass::Triclinic => vec!["(abg)"],
        LaueClass::Monoclinic => vec!["(a0g)", "(a1/2g)", "(0b0)", "(1/2b0)", "(0b1/2)"],
        LaueClass::Orthorhombic => vec![
            "(00g)", "(1/20g)", "(01/2g)", "(1/21/2g)", "(a00)", "(a01/2)", "(a1/20)",
            "(a1/21/2)", "(0b0)", "(1/2b0)", "(0b1/2)", "(1/2b1/2)",
        ],
        LaueClass::Tetragonal => {
            if group.centering == Centering::P {
                vec!["(00g)", "(1/21/2g)"]
            } else {
                vec!["(00g)"]
            }
        }
        LaueClass::Trigonal | LaueClass::Hexagonal => {
            if group.centering == Centering::P {
                vec!["(00g)", "(1/31/3g)"]
            } else {
                vec!["(00g)"]
            }
        }
        LaueClass::Cubic => Vec::new(),
    }
}

/// Builds a modulation spec from a symbol such as `(a1/2g)`: free
/// components start at `initial` and are flagged for refinement.
pub fn parse_modulation_symbol(symbol: &str, initial: f64, max_m: u8) -> Option<ModulationSpec> {
    let body = symbol.trim().strip_prefix('(')?.strip_suffix(')')?;
    let chars: Vec<char> = body.chars().collect();
    let mut vector = [0.0; 3];
    let mut refine = [false; 3];
    let mut component = 0;
    let mut index = 0;
    while index < chars.len() {
        if component >= 3 {
            return None;
        }
        match chars[index] {
            'a' | 'b' | 'g' => {
                vector[component] = initial;
                refine[component] = true;
                index += 1;
            }
            '0' => index += 1,
            '1' if chars.get(index + 1) == Some(&'/') => {
                let denominator = chars.get(index + 2)?.to_digit(10)?;
                vector[component] = 1.0 / f64::from(denominator);
                index += 3;
            }
            _ => return None,
        }
        component += 1;
    }
    (component == 3).then_some(ModulationSpec {
        vector,
        max_m,
        refine,
    })
}

#[cfg(test)]
mod tests {
    use super::{
        BuiltinSpaceGroups, SpaceGroup, SpaceGroupService, SymOp, SymOpParseError, canonical_hkl,
        laue_operators, modulation_symbols, parse_modulation_symbol,
    };
    use crate::domain::{BravaisLattice, LaueClass};

    #[test]
    fn parses_jones_faithful_operators() {
        let op = SymOp::parse("-x+1/2, y-x, z+0.25").expect("operator should parse");
        assert_eq!(op.rotation, [[-1, 0, 0], [-1, 1, 0], [0, 0, 1]]);
        assert_eq!(op.translation, [0.5, 0.0, 0.25]);
        let moved = op.apply([0.1, 0.2, 0.3]);
        assert!((moved[0] - 0.4).abs() < 1.0e-12);
        assert!((moved[1] - 0.1).abs() < 1.0e-12);
        assert!((moved[2] - 0.55).abs() < 1.0e-12);
    }

    #[test]
    fn operators_render_in_parseable_form() {
        let op = SymOp::parse("-x+1/2,x-y,-z+1/6").expect("operator should parse");
        assert_eq!(op.to_string(), "-x+1/2,x-y,-z+1/6");
        let reparsed = SymOp::parse(&op.to_string()).expect("rendered operator should parse");
        assert_eq!(reparsed.rotation, op.rotation);
        assert_eq!(SymOp::IDENTITY.to_string(), "x,y,z");
    }

    #[test]
    fn malformed_operators_are_rejected() {
        assert!(matches!(
            SymOp::parse("x,y"),
            Err(SymOpParseError::WrongComponentCount { found: 2, .. })
        ));
        assert!(matches!(
            SymOp::parse("x,y,w"),
            Err(SymOpParseError::InvalidTerm { .. })
        ));
        assert!(matches!(
            SymOp::parse("0.5x,y,z"),
            Err(SymOpParseError::NonIntegralCoefficient { .. })
        ));
    }

    #[test]
    fn laue_group_orders_match_point_group_tables() {
        let cases = [
            (LaueClass::Triclinic, 2),
            (LaueClass::Monoclinic, 4),
            (LaueClass::Orthorhombic, 8),
            (LaueClass::Tetragonal, 16),
            (LaueClass::Trigonal, 12),
            (LaueClass::Hexagonal, 24),
            (LaueClass::Cubic, 48),
        ];
        for (laue, order) in cases {
            assert_eq!(laue_operators(laue).len(), order, "{laue:?}");
        }
    }

    #[test]
    fn cubic_orbits_collapse_permutations() {
        let operators = laue_operators(LaueClass::Cubic);
        let (representative, multiplicity) = canonical_hkl(&operators, [0, -1, 2]);
        assert_eq!(representative, [2, 1, 0]);
        assert_eq!(multiplicity, 24);
        assert_eq!(canonical_hkl(&operators, [1, 1, 1]).1, 8);
    }

    #[test]
    fn centering_extinctions_follow_lattice_rules() {
        let face = SpaceGroup::from_bravais(BravaisLattice::CubicF);
        assert!(!face.is_systematically_absent([1, 1, 1]));
        assert!(face.is_systematically_absent([1, 0, 0]));
        assert!(face.is_systematically_absent([2, 1, 0]));

        let body = SpaceGroup::from_bravais(BravaisLattice::CubicI);
        assert!(body.is_systematically_absent([1, 0, 0]));
        assert!(!body.is_systematically_absent([1, 1, 0]));

        let rhombohedral = SpaceGroup::from_bravais(BravaisLattice::RhombohedralR);
        assert!(!rhombohedral.is_systematically_absent([0, 0, 3]));
        assert!(rhombohedral.is_systematically_absent([0, 0, 1]));
        assert!(!rhombohedral.is_systematically_absent([1, 0, 1]));
    }

    #[test]
    fn screw_and_glide_extinctions_come_from_operators() {
        let group = BuiltinSpaceGroups
            .lookup("P 21/c")
            .expect("P21/c should be tabulated");
        assert!(group.is_systematically_absent([0, 1, 0]));
        assert!(!group.is_systematically_absent([0, 2, 0]));
        assert!(group.is_systematically_absent([1, 0, 1]));
        assert!(!group.is_systematically_absent([1, 0, 2]));
        assert!(!group.is_systematically_absent([1, 1, 1]));

        let hcp = BuiltinSpaceGroups.lookup("P 63/m m c").expect("P63/mmc");
        assert!(hcp.is_systematically_absent([0, 0, 1]));
        assert!(hcp.is_systematically_absent([1, 1, 1]));
        assert!(!hcp.is_systematically_absent([1, 0, 1]));
        assert_eq!(hcp.full_operators().len(), 24);
    }

    #[test]
    fn bravais_groups_carry_full_point_operators() {
        let group = BuiltinSpaceGroups.lookup("Fm-3m").expect("Fm-3m");
        assert_eq!(group.operators.len(), 48);
        assert_eq!(group.full_operators().len(), 192);
        assert!(BuiltinSpaceGroups.lookup("Q 42").is_none());
    }

    #[test]
    fn modulation_symbols_parse_into_specs() {
        let group = SpaceGroup::from_bravais(BravaisLattice::OrthorhombicP);
        assert!(modulation_symbols(&group).contains(&"(a1/20)"));
        let spec = parse_modulation_symbol("(a1/20)", 0.1, 1).expect("symbol should parse");
        assert_eq!(spec.vector, [0.1, 0.5, 0.0]);
        assert_eq!(spec.refine, [true, false, false]);
        let spec = parse_modulation_symbol("(1/31/3g)", 0.2, 2).expect("symbol should parse");
        assert!((spec.vector[0] - 1.0 / 3.0).abs() < 1.0e-12);
        assert_eq!(spec.refine, [false, false, true]);
        assert!(parse_modulation_symbol("(ab)", 0.1, 1).is_none());
    }
}
