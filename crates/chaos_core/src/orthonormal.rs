//! Re-orthonormalization of deviation vectors.
//!
//! Deviation blocks are `D×k` matrices whose columns are the deviation
//! vectors. Inside integrators they live row-major in a flat slice.

use nalgebra::linalg::{QR, SVD};
use nalgebra::{DMatrix, DVector};

/// Householder QR of `a` (`D×k`, `k ≤ D`) with the convention `r_i ≥ 0`.
///
/// Returns the `D×k` orthonormal factor and the diagonal of `R`, whose logs
/// are the local growth rates. A zero or linearly dependent column yields
/// `r_i = 0`; callers see that as a very negative growth rate.
pub fn qr_growth(a: &DMatrix<f64>) -> (DMatrix<f64>, DVector<f64>) {
    let k = a.ncols();
    let (mut q, r) = QR::new(a.clone()).unpack();
    let mut diag = DVector::zeros(k);
    for i in 0..k {
        let value = r[(i, i)];
        if value < 0.0 {
            q.column_mut(i).neg_mut();
        }
        diag[i] = value.abs();
    }
    (q, diag)
}

/// Replaces the row-major `D×k` block in `block` by its orthonormal factor and
/// returns the diagonal of `R`.
pub(crate) fn orthonormalize_block(block: &mut [f64], dim: usize, k: usize) -> DVector<f64> {
    let matrix = DMatrix::from_row_slice(dim, k, block);
    let (q, diag) = qr_growth(&matrix);
    write_row_major(block, &q);
    diag
}

/// Scales every column of the row-major `D×k` block to unit length and
/// returns the norms it had.
pub(crate) fn normalize_block(block: &mut [f64], dim: usize, k: usize) -> Vec<f64> {
    let mut norms = vec![0.0; k];
    for row in 0..dim {
        for col in 0..k {
            norms[col] += block[row * k + col] * block[row * k + col];
        }
    }
    for norm in norms.iter_mut() {
        *norm = norm.sqrt();
    }
    for row in 0..dim {
        for col in 0..k {
            if norms[col] > 0.0 {
                block[row * k + col] /= norms[col];
            }
        }
    }
    norms
}

/// Product of the singular values of `a`, i.e. the `k`-volume spanned by its
/// columns. Used for GALI instead of a Gram determinant.
pub fn singular_value_product(a: &DMatrix<f64>) -> f64 {
    SVD::new(a.clone(), false, false)
        .singular_values
        .iter()
        .product()
}

pub(crate) fn write_row_major(block: &mut [f64], matrix: &DMatrix<f64>) {
    let cols = matrix.ncols();
    for i in 0..matrix.nrows() {
        for j in 0..cols {
            block[i * cols + j] = matrix[(i, j)];
        }
    }
}
