//! Small floating point helpers shared across the crate.
use nalgebra::DMatrix;

/// Compare two values with only a relative tolerance, treating two exact zeros as equal
pub fn relative_close(x: f64, y: f64, rtol: f64) -> bool {
    if x == y {
        return true;
    }
    let scale = x.abs().max(y.abs());
    (x - y).abs() <= rtol * scale
}

/// The arithmetic mean of `values`, `None` when empty
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Force exact symmetry on a matrix that should be symmetric up to rounding
pub(crate) fn symmetrize(mut m: DMatrix<f64>) -> DMatrix<f64> {
    let n = m.nrows().min(m.ncols());
    for i in 0..n {
        for j in (i + 1)..n {
            let v = 0.5 * (m[(i, j)] + m[(j, i)]);
            m[(i, j)] = v;
            m[(j, i)] = v;
        }
    }
    m
}
