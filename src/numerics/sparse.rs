//! Sparse matrix helpers on top of `nalgebra_sparse`.
//!
//! Operators are assembled as [`CooMatrix`] triplets (duplicates are summed on
//! conversion) and stored as [`CsrMatrix`] with sorted column indices per row.

use std::collections::HashMap;
use std::ops::{Add, AddAssign, Mul, SubAssign};

use nalgebra::DVector;
use num_complex::Complex64;
use num_traits::{One, Zero};

pub use nalgebra_sparse::{CooMatrix, CsrMatrix};

/// Element type of the operators in this crate.
pub trait Entry:
    nalgebra::Scalar + Copy + Zero + One + Add<Output = Self> + AddAssign + SubAssign + Mul<Output = Self>
{
}

impl<T> Entry for T where
    T: nalgebra::Scalar
        + Copy
        + Zero
        + One
        + Add<Output = T>
        + AddAssign
        + SubAssign
        + Mul<Output = T>
{
}

/// Row-oriented operations used by the discretization.
pub trait CsrMatrixExt<T: Entry> {
    /// Iterate over `(col, value)` pairs of row `i`.
    fn row_entries(&self, i: usize) -> impl Iterator<Item = (usize, T)> + '_;
    /// Entry `(i, j)`, zero when not stored.
    fn entry(&self, i: usize, j: usize) -> T;
    fn diagonal_entries(&self) -> Vec<T>;
    fn mul_vec(&self, x: &DVector<T>) -> DVector<T>;
    fn row_sums(&self) -> Vec<T>;
    /// Multiply row `i` by `scale[i]`.
    fn scale_rows(&mut self, scale: &[T]);
}

impl<T: Entry> CsrMatrixExt<T> for CsrMatrix<T> {
    fn row_entries(&self, i: usize) -> impl Iterator<Item = (usize, T)> + '_ {
        let offsets = self.row_offsets();
        let range = offsets[i]..offsets[i + 1];
        self.col_indices()[range.clone()]
            .iter()
            .copied()
            .zip(self.values()[range].iter().copied())
    }

    fn entry(&self, i: usize, j: usize) -> T {
        let offsets = self.row_offsets();
        let range = offsets[i]..offsets[i + 1];
        match self.col_indices()[range.clone()].binary_search(&j) {
            Ok(k) => self.values()[range.start + k],
            Err(_) => T::zero(),
        }
    }

    fn diagonal_entries(&self) -> Vec<T> {
        (0..self.nrows().min(self.ncols()))
            .map(|i| self.entry(i, i))
            .collect()
    }

    fn mul_vec(&self, x: &DVector<T>) -> DVector<T> {
        debug_assert_eq!(x.len(), self.ncols());
        DVector::from_iterator(
            self.nrows(),
            (0..self.nrows()).map(|i| {
                self.row_entries(i).fold(T::zero(), |mut acc, (j, v)| {
                    acc += v * x[j];
                    acc
                })
            }),
        )
    }

    fn row_sums(&self) -> Vec<T> {
        (0..self.nrows())
            .map(|i| {
                self.row_entries(i).fold(T::zero(), |mut acc, (_, v)| {
                    acc += v;
                    acc
                })
            })
            .collect()
    }

    fn scale_rows(&mut self, scale: &[T]) {
        let offsets = self.row_offsets().to_vec();
        let values = self.values_mut();
        for (i, window) in offsets.windows(2).enumerate() {
            for v in &mut values[window[0]..window[1]] {
                *v = *v * scale[i];
            }
        }
    }
}

/// Square system with Dirichlet rows for the `fixed` unknowns.
///
/// Fixed columns move to the right-hand side and fixed rows become identity
/// rows carrying the prescribed value, so a symmetric (Hermitian) operator
/// stays symmetric.
pub fn build_with_dirichlet<T: Entry>(
    coo: &CooMatrix<T>,
    fixed: &HashMap<usize, T>,
    rhs: &mut DVector<T>,
) -> CsrMatrix<T> {
    let mut reduced = CooMatrix::new(coo.nrows(), coo.ncols());
    for (i, j, &v) in coo.triplet_iter() {
        if fixed.contains_key(&i) {
            continue;
        }
        if let Some(&g) = fixed.get(&j) {
            rhs[i] -= v * g;
            continue;
        }
        reduced.push(i, j, v);
    }
    for (&j, &g) in fixed {
        reduced.push(j, j, T::one());
        rhs[j] = g;
    }
    CsrMatrix::from(&reduced)
}

pub fn conjugate_transpose(matrix: &CsrMatrix<Complex64>) -> CsrMatrix<Complex64> {
    let mut transposed = matrix.transpose();
    for v in transposed.values_mut() {
        *v = v.conj();
    }
    transposed
}

/// Real `2n x 2n` form `[[A, -B], [B, A]]` of `A + iB`, acting on `[Re z; Im z]`.
/// Hermitian input gives a symmetric result.
pub fn real_embedding(matrix: &CsrMatrix<Complex64>) -> CsrMatrix<f64> {
    let (n, m) = (matrix.nrows(), matrix.ncols());
    let mut coo = CooMatrix::new(2 * n, 2 * m);
    for (i, j, v) in matrix.triplet_iter() {
        if v.re != 0.0 {
            coo.push(i, j, v.re);
            coo.push(n + i, m + j, v.re);
        }
        if v.im != 0.0 {
            coo.push(i, m + j, -v.im);
            coo.push(n + i, j, v.im);
        }
    }
    CsrMatrix::from(&coo)
}

/// Copy into the `kryst` matrix type used by the Krylov solvers.
pub fn to_kryst(matrix: &CsrMatrix<f64>) -> kryst::matrix::sparse::CsrMatrix<f64> {
    kryst::matrix::sparse::CsrMatrix::from_csr(
        matrix.nrows(),
        matrix.ncols(),
        matrix.row_offsets().to_vec(),
        matrix.col_indices().to_vec(),
        matrix.values().to_vec(),
    )
}

/// Stack a complex vector as `[Re z; Im z]`.
pub fn split_complex(z: &DVector<Complex64>) -> DVector<f64> {
    let n = z.len();
    DVector::from_iterator(
        2 * n,
        z.iter().map(|c| c.re).chain(z.iter().map(|c| c.im)),
    )
}

/// Inverse of [`split_complex`].
pub fn join_complex(x: &DVector<f64>) -> DVector<Complex64> {
    let n = x.len() / 2;
    DVector::from_iterator(n, (0..n).map(|i| Complex64::new(x[i], x[n + i])))
}
