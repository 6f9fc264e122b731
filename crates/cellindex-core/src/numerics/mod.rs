pub mod linalg;

pub use linalg::{LuDecomposition, LuError, lu_factorize, lu_invert, lu_solve};

use faer::Mat;
use std::cmp::Ordering;

pub type DenseMatrix = Mat<f64>;
pub type Matrix3 = [[f64; 3]; 3];

pub const IDENTITY3: Matrix3 = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

pub fn det3(m: &Matrix3) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

pub fn inverse3(m: &Matrix3) -> Option<Matrix3> {
    let det = det3(m);
    if !det.is_finite() || det.abs() < 1.0e-300 {
        return None;
    }
    let inv_det = 1.0 / det;
    let mut inverse = [[0.0; 3]; 3];
    for row in 0..3 {
        for col in 0..3 {
            let (r1, r2) = ((col + 1) % 3, (col + 2) % 3);
            let (c1, c2) = ((row + 1) % 3, (row + 2) % 3);
            inverse[row][col] = (m[r1][c1] * m[r2][c2] - m[r1][c2] * m[r2][c1]) * inv_det;
        }
    }
    Some(inverse)
}

pub fn mul3(left: &Matrix3, right: &Matrix3) -> Matrix3 {
    let mut product = [[0.0; 3]; 3];
    for row in 0..3 {
        for col in 0..3 {
            product[row][col] = (0..3).map(|k| left[row][k] * right[k][col]).sum();
        }
    }
    product
}

pub fn transpose3(m: &Matrix3) -> Matrix3 {
    let mut transposed = [[0.0; 3]; 3];
    for row in 0..3 {
        for col in 0..3 {
            transposed[row][col] = m[col][row];
        }
    }
    transposed
}

pub fn mul3_vec(m: &Matrix3, v: [f64; 3]) -> [f64; 3] {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

/// Sylvester test on a symmetric 3x3 matrix.
pub fn is_positive_definite3(m: &Matrix3) -> bool {
    let minor1 = m[0][0];
    let minor2 = m[0][0] * m[1][1] - m[0][1] * m[1][0];
    minor1 > 0.0 && minor2 > 0.0 && det3(m) > 0.0
}

/// Wraps a fractional coordinate into `[0, 1)` with a snap for values that
/// round-trip to 1 through floating point.
pub fn wrap_unit(value: f64) -> f64 {
    let wrapped = value - value.floor();
    if (1.0 - wrapped).abs() < 1.0e-9 {
        0.0
    } else {
        wrapped
    }
}

pub fn fractional_distance(left: [f64; 3], right: [f64; 3]) -> f64 {
    left.iter()
        .zip(right.iter())
        .map(|(l, r)| {
            let delta = l - r;
            let delta = delta - delta.round();
            delta * delta
        })
        .sum::<f64>()
        .sqrt()
}

pub fn total_cmp_desc(left: f64, right: f64) -> Ordering {
    right.total_cmp(&left)
}

const REDUCTION_SWEEPS: usize = 64;

/// Pairwise Gauss reduction of a direct metric: `b_j -= n·b_i` while that
/// strictly shortens `b_j`. The result describes the same lattice on a
/// basis of short vectors.
pub fn reduce_metric3(metric: &Matrix3) -> Matrix3 {
    let mut g = *metric;
    for _ in 0..REDUCTION_SWEEPS {
        let mut changed = false;
        for i in 0..3 {
            for j in 0..3 {
                if i == j || g[i][i] <= 0.0 {
                    continue;
                }
                let n = (g[i][j] / g[i][i]).round();
                let shortened = g[j][j] - 2.0 * n * g[i][j] + n * n * g[i][i];
                if n == 0.0 || shortened >= g[j][j] * (1.0 - 1.0e-12) {
                    continue;
                }
                let row_i = g[i];
                for k in 0..3 {
                    if k != j {
                        g[j][k] -= n * row_i[k];
                        g[k][j] = g[j][k];
                    }
                }
                g[j][j] = shortened;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    g
}

/// Squared lengths and absolute cross terms of the reduced metric, each
/// sorted descending; independent of axis order and axis sign.
pub fn metric_invariants3(metric: &Matrix3) -> [f64; 6] {
    let g = reduce_metric3(metric);
    let mut lengths = [g[0][0], g[1][1], g[2][2]];
    let mut cross = [g[0][1].abs(), g[0][2].abs(), g[1][2].abs()];
    lengths.sort_by(|l, r| total_cmp_desc(*l, *r));
    cross.sort_by(|l, r| total_cmp_desc(*l, *r));
    [lengths[0], lengths[1], lengths[2], cross[0], cross[1], cross[2]]
}
