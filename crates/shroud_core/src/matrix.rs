//! Dense row-major f64 matrices.
//!
//! Everything the protocol needs is a handful of operations on small dense
//! blocks: the `A · Bᵀ` product (masked exchanges and Gram fragments all
//! have this shape), elementwise combination, and block concatenation for
//! the final assembly. Kept as a plain `Vec<f64>` so matrices serialize
//! directly into wire messages.

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        assert_eq!(data.len(), rows * cols, "matrix data length mismatch");
        Self { rows, cols, data }
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::new(rows, cols, vec![0.0; rows * cols])
    }

    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.rows, self.cols)
    }

    /// Build from row slices; all rows must have equal length.
    pub fn from_rows(rows: &[Vec<f64>]) -> Self {
        let nrows = rows.len();
        let ncols = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut data = Vec::with_capacity(nrows * ncols);
        for row in rows {
            assert_eq!(row.len(), ncols, "ragged rows");
            data.extend_from_slice(row);
        }
        Self::new(nrows, ncols, data)
    }

    /// Sample every entry independently uniform in `[min, max)`.
    pub fn sample_uniform<R: Rng + ?Sized>(
        rows: usize,
        cols: usize,
        min: f64,
        max: f64,
        rng: &mut R,
    ) -> Self {
        let data = (0..rows * cols).map(|_| rng.gen_range(min..max)).collect();
        Self::new(rows, cols, data)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.data[r * self.cols + c]
    }

    pub fn set(&mut self, r: usize, c: usize, v: f64) {
        self.data[r * self.cols + c] = v;
    }

    pub fn row(&self, r: usize) -> &[f64] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// `self · otherᵀ`. Both operands must share the column count; the
    /// result is `self.rows × other.rows`. This is the only product the
    /// protocol uses, so rows of both operands stream contiguously.
    pub fn matmul_nt(&self, other: &Matrix) -> Matrix {
        assert_eq!(self.cols, other.cols, "inner dimension mismatch");
        let mut out = Matrix::zeros(self.rows, other.rows);
        for i in 0..self.rows {
            let a = self.row(i);
            for j in 0..other.rows {
                let b = other.row(j);
                let mut acc = 0.0;
                for k in 0..self.cols {
                    acc += a[k] * b[k];
                }
                out.set(i, j, acc);
            }
        }
        out
    }

    pub fn add(&self, other: &Matrix) -> Matrix {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Matrix) -> Matrix {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn mul_elementwise(&self, other: &Matrix) -> Matrix {
        self.zip_with(other, |a, b| a * b)
    }

    fn zip_with(&self, other: &Matrix, f: impl Fn(f64, f64) -> f64) -> Matrix {
        assert_eq!(self.shape(), other.shape(), "shape mismatch");
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(&a, &b)| f(a, b))
            .collect();
        Matrix::new(self.rows, self.cols, data)
    }

    pub fn scale(&self, factor: f64) -> Matrix {
        let data = self.data.iter().map(|&v| v * factor).collect();
        Matrix::new(self.rows, self.cols, data)
    }

    pub fn transpose(&self) -> Matrix {
        let mut out = Matrix::zeros(self.cols, self.rows);
        for r in 0..self.rows {
            for c in 0..self.cols {
                out.set(c, r, self.get(r, c));
            }
        }
        out
    }

    /// Stack blocks side by side; all blocks must share the row count.
    pub fn hcat(blocks: &[Matrix]) -> Matrix {
        assert!(!blocks.is_empty(), "nothing to concatenate");
        let rows = blocks[0].rows;
        let cols = blocks.iter().map(|b| b.cols).sum();
        let mut out = Matrix::zeros(rows, cols);
        for r in 0..rows {
            let mut offset = 0;
            for block in blocks {
                assert_eq!(block.rows, rows, "row count mismatch in hcat");
                out.data[r * cols + offset..r * cols + offset + block.cols]
                    .copy_from_slice(block.row(r));
                offset += block.cols;
            }
        }
        out
    }

    /// Stack blocks on top of each other; all blocks must share the column
    /// count.
    pub fn vcat(blocks: &[Matrix]) -> Matrix {
        assert!(!blocks.is_empty(), "nothing to concatenate");
        let cols = blocks[0].cols;
        let rows = blocks.iter().map(|b| b.rows).sum();
        let mut data = Vec::with_capacity(rows * cols);
        for block in blocks {
            assert_eq!(block.cols, cols, "column count mismatch in vcat");
            data.extend_from_slice(&block.data);
        }
        Matrix::new(rows, cols, data)
    }

    /// Extract the row range `[start, end)` as a new matrix.
    pub fn row_slice(&self, start: usize, end: usize) -> Matrix {
        assert!(start <= end && end <= self.rows, "row range out of bounds");
        Matrix::new(
            end - start,
            self.cols,
            self.data[start * self.cols..end * self.cols].to_vec(),
        )
    }

    /// Elementwise closeness with absolute and relative tolerance:
    /// `|a - b| <= atol + rtol * |b|` for every entry.
    pub fn allclose(&self, other: &Matrix, atol: f64, rtol: f64) -> bool {
        self.shape() == other.shape()
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(&a, &b)| (a - b).abs() <= atol + rtol * b.abs())
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }
}
