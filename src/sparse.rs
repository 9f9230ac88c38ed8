//! Sparse matrix storage for the coupled Jacobian.
//!
//! Contributions are accumulated as (row, col, value) triplets, combined
//! across ranks, then compressed into CSR for the linear solve.

use std::ops::AddAssign;

/// Sparse matrix in Compressed Sparse Row format.
#[derive(Debug, Clone)]
pub struct CsrMatrix<T> {
    pub nrows: usize,
    pub ncols: usize,
    /// Non-zero values, stored row by row.
    pub values: Vec<T>,
    /// Column index for each non-zero value.
    pub col_indices: Vec<usize>,
    /// `row_pointers[i]` is the index into values/col_indices where row i starts.
    /// `row_pointers[nrows]` = total number of non-zeros.
    pub row_pointers: Vec<usize>,
}

impl<T: Copy + Default + AddAssign> CsrMatrix<T> {
    /// Create an empty matrix with no non-zero entries.
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            values: Vec::new(),
            col_indices: Vec::new(),
            row_pointers: vec![0; nrows + 1],
        }
    }

    /// Number of non-zero entries.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Build CSR matrix from (row, col, value) triplets.
    /// Duplicate entries at the same (row, col) are summed.
    pub fn from_triplets(nrows: usize, ncols: usize, triplets: &[(usize, usize, T)]) -> Self {
        if triplets.is_empty() {
            return Self::new(nrows, ncols);
        }

        let mut order: Vec<usize> = (0..triplets.len()).collect();
        order.sort_by_key(|&i| (triplets[i].0, triplets[i].1));

        let mut values = Vec::with_capacity(triplets.len());
        let mut col_indices = Vec::with_capacity(triplets.len());
        let mut row_pointers = vec![0usize; nrows + 1];

        let (mut cur_row, mut cur_col, mut cur_val) = triplets[order[0]];
        for &idx in &order[1..] {
            let (row, col, val) = triplets[idx];
            if row == cur_row && col == cur_col {
                cur_val += val;
                continue;
            }
            values.push(cur_val);
            col_indices.push(cur_col);
            row_pointers[cur_row + 1] += 1;
            (cur_row, cur_col, cur_val) = (row, col, val);
        }
        values.push(cur_val);
        col_indices.push(cur_col);
        row_pointers[cur_row + 1] += 1;

        for i in 1..=nrows {
            row_pointers[i] += row_pointers[i - 1];
        }

        Self {
            nrows,
            ncols,
            values,
            col_indices,
            row_pointers,
        }
    }

    /// Position of (row, col) in `values`, if the entry is stored.
    pub fn value_index(&self, row: usize, col: usize) -> Option<usize> {
        let range = self.row_pointers[row]..self.row_pointers[row + 1];
        self.col_indices[range.clone()]
            .binary_search(&col)
            .ok()
            .map(|offset| range.start + offset)
    }

    /// Column indices and values of one row.
    pub fn row(&self, row: usize) -> (&[usize], &[T]) {
        let range = self.row_pointers[row]..self.row_pointers[row + 1];
        (&self.col_indices[range.clone()], &self.values[range])
    }

    /// Number of stored entries in one row.
    pub fn row_nnz(&self, row: usize) -> usize {
        self.row_pointers[row + 1] - self.row_pointers[row]
    }

    /// Convert to dense matrix (row-major). For testing and small matrices only.
    pub fn to_dense(&self) -> Vec<Vec<T>> {
        let mut dense = vec![vec![T::default(); self.ncols]; self.nrows];
        for row in 0..self.nrows {
            for idx in self.row_pointers[row]..self.row_pointers[row + 1] {
                dense[row][self.col_indices[idx]] = self.values[idx];
            }
        }
        dense
    }
}

impl CsrMatrix<f64> {
    /// Sparse matrix-vector multiply: y = A * x
    pub fn spmv(&self, x: &[f64]) -> Vec<f64> {
        assert_eq!(x.len(), self.ncols, "spmv dimension mismatch");
        let mut y = vec![0.0; self.nrows];
        for (row, yi) in y.iter_mut().enumerate() {
            let mut sum = 0.0;
            for idx in self.row_pointers[row]..self.row_pointers[row + 1] {
                sum += self.values[idx] * x[self.col_indices[idx]];
            }
            *yi = sum;
        }
        y
    }
}

/// Unordered Jacobian accumulator.
///
/// Each rank adds the entries of the rows it owns; the solver gathers all
/// ranks' entries before compression.
#[derive(Debug, Clone, Default)]
pub struct TripletMatrix {
    pub n: usize,
    entries: Vec<(usize, usize, f64)>,
}

impl TripletMatrix {
    pub fn new(n: usize) -> Self {
        Self::with_capacity(n, 0)
    }

    pub fn with_capacity(n: usize, capacity: usize) -> Self {
        Self {
            n,
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Accumulate into (row, col). Duplicates are summed on compression.
    pub fn add(&mut self, row: usize, col: usize, value: f64) {
        debug_assert!(row < self.n && col < self.n, "triplet ({row}, {col}) out of range");
        self.entries.push((row, col, value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(usize, usize, f64)] {
        &self.entries
    }

    /// Drop every entry of `row` and replace it with `diag` on the diagonal.
    pub fn zero_row_set_diag(&mut self, row: usize, diag: f64) {
        self.entries.retain(|&(r, _, _)| r != row);
        self.entries.push((row, row, diag));
    }

    /// Flat `[row, col, value, ...]` encoding for collective transfer.
    pub fn to_flat(&self) -> Vec<f64> {
        let mut flat = Vec::with_capacity(self.entries.len() * 3);
        for &(r, c, v) in &self.entries {
            flat.extend_from_slice(&[r as f64, c as f64, v]);
        }
        flat
    }

    /// Inverse of [`TripletMatrix::to_flat`].
    pub fn from_flat(n: usize, flat: &[f64]) -> Self {
        let entries = flat
            .chunks_exact(3)
            .map(|t| (t[0] as usize, t[1] as usize, t[2]))
            .collect();
        Self { n, entries }
    }

    pub fn to_csr(&self) -> CsrMatrix<f64> {
        CsrMatrix::from_triplets(self.n, self.n, &self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_are_summed() {
        let m = CsrMatrix::from_triplets(2, 2, &[(0, 0, 1.0), (1, 1, 2.0), (0, 0, 3.0)]);
        assert_eq!(m.nnz(), 2);
        assert_eq!(m.to_dense(), vec![vec![4.0, 0.0], vec![0.0, 2.0]]);
    }

    #[test]
    fn value_index_and_row_lookup() {
        let m = CsrMatrix::from_triplets(3, 3, &[(1, 2, 5.0), (1, 0, 4.0), (2, 2, 1.0)]);
        assert_eq!(m.value_index(1, 2).map(|i| m.values[i]), Some(5.0));
        assert_eq!(m.value_index(0, 0), None);
        let (cols, vals) = m.row(1);
        assert_eq!(cols, &[0, 2]);
        assert_eq!(vals, &[4.0, 5.0]);
        assert_eq!(m.row_nnz(0), 0);
    }

    #[test]
    fn spmv_matches_dense_product() {
        let m = CsrMatrix::from_triplets(2, 2, &[(0, 0, 2.0), (0, 1, 1.0), (1, 1, 3.0)]);
        assert_eq!(m.spmv(&[1.0, 2.0]), vec![4.0, 6.0]);
    }

    #[test]
    fn pinned_row_becomes_identity() {
        let mut t = TripletMatrix::new(3);
        t.add(0, 0, 2.0);
        t.add(0, 1, -1.0);
        t.add(1, 0, -1.0);
        t.add(1, 1, 2.0);
        t.zero_row_set_diag(0, 1.0);
        let dense = t.to_csr().to_dense();
        assert_eq!(dense[0], vec![1.0, 0.0, 0.0]);
        assert_eq!(dense[1], vec![-1.0, 2.0, 0.0]);
    }

    #[test]
    fn flat_encoding_preserves_entries() {
        let mut t = TripletMatrix::new(4);
        t.add(3, 1, 0.25);
        t.add(0, 2, -7.0);
        let back = TripletMatrix::from_flat(4, &t.to_flat());
        assert_eq!(back.entries(), t.entries());
    }
}
