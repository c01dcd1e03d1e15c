//! Tensor Operations
//!
//! A minimal row-major `f32` tensor carrying exactly the operations the
//! decoder layers need. Every layer in this crate works on one sequence at a
//! time, so almost everything here is a 2D `[rows, cols]` operation; batches
//! are assembled by [`Tensor::stack`] into `[batch, rows, cols]`.
//!
//! ## Layout
//!
//! ```text
//! shape   [2, 3]
//! data    [r0c0, r0c1, r0c2, r1c0, r1c1, r1c2]
//! strides [3, 1]
//! ```
//!
//! ## Example
//!
//! ```rust
//! use gpt_transfer::Tensor;
//!
//! // Attention scores for a 2-token sequence
//! let q = Tensor::new(vec![1.0, 0.0, 0.0, 1.0], vec![2, 2]);
//! let k = Tensor::new(vec![1.0, 0.0, 0.0, 1.0], vec![2, 2]);
//! let scores = q.matmul(&k.transpose());
//!
//! // Hide the future, then normalize each row
//! let mask = Tensor::new(vec![0.0, 1.0, 0.0, 0.0], vec![2, 2]);
//! let weights = scores.masked_fill(&mask, -1e9).softmax_rows();
//! assert_eq!(weights.row(0), &[1.0, 0.0]);
//! ```
//!
//! ## Parallelism
//!
//! Matrix multiplication above a small work threshold runs a cache-blocked
//! kernel with output row blocks spread across the rayon pool. Element-wise
//! operations and row softmax iterate in parallel as well. Which pool is used
//! is decided by the caller (see [`crate::config::Device`]).
//!
//! Shape errors inside this module are programmer errors and panic with the
//! offending shapes. Data coming from users is validated before it gets here.

use rayon::prelude::*;

/// Work (m * n * k) above which matmul switches to the blocked parallel kernel.
const PARALLEL_MATMUL_WORK: usize = 1_000;

/// A multi-dimensional array stored as a flat row-major `Vec<f32>`.
///
/// # Memory Layout
///
/// For shape `[2, 3]` the data is stored as
/// `[row0_col0, row0_col1, row0_col2, row1_col0, row1_col1, row1_col2]` and the
/// strides are `[3, 1]`: one step along the rows advances 3 positions in
/// `data`, one step along the columns advances 1.
///
/// Fields are public because the layers and the optimizer walk `data`
/// directly. Keep `shape` and `strides` consistent with `data` by building
/// tensors through [`Tensor::new`].
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all tensor elements
    pub data: Vec<f32>,
    /// Dimensions of the tensor
    pub shape: Vec<usize>,
    /// Step sizes for each dimension, derived from `shape`
    pub strides: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor with given data and shape
    ///
    /// # Panics
    ///
    /// Panics if the product of shape dimensions doesn't equal data length
    ///
    /// # Example
    ///
    /// ```rust
    /// # use gpt_transfer::Tensor;
    /// let tensor = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
    /// assert_eq!(tensor.shape, vec![2, 2]);
    /// ```
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected_size: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_size,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_size
        );

        let strides = Self::compute_strides(&shape);
        Self {
            data,
            shape,
            strides,
        }
    }

    /// Tensor of the given shape filled with `0.0`.
    ///
    /// Gradient accumulators and optimizer moments start from this.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![0.0; size], shape)
    }

    /// Tensor of the given shape filled with `1.0`. Layer norm gains start here.
    pub fn ones(shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![1.0; size], shape)
    }

    /// For shape `[d0, d1, d2]`, strides are `[d1*d2, d2, 1]`
    fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    fn rows_cols(&self) -> (usize, usize) {
        assert_eq!(
            self.shape.len(),
            2,
            "Expected a 2D tensor, found shape {:?}",
            self.shape
        );
        (self.shape[0], self.shape[1])
    }

    /// 2D matrix multiplication `[m, k] @ [k, n] -> [m, n]`
    ///
    /// ```text
    /// C[i, j] = sum_l A[i, l] * B[l, j]
    /// ```
    ///
    /// # Performance
    ///
    /// Small products (`m * n * k` below 1000) run a plain loop in `i, l, j`
    /// order, so the innermost loop walks a contiguous row of `B` and a
    /// contiguous row of `C`.
    ///
    /// Larger ones use an 8x8 cache-blocked kernel. Output row blocks are
    /// independent, so they are spread across the rayon pool, and each block
    /// works on tiles of `A` and `B` small enough to stay in L1 cache.
    ///
    /// Both paths add the `l` terms of one output element in the same order,
    /// so a row of the result depends only on the matching row of `A`.
    /// Causal attention relies on this to keep earlier positions bit-identical
    /// when later tokens change.
    ///
    /// # Panics
    ///
    /// Panics if either operand is not 2D or the inner dimensions differ.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use gpt_transfer::Tensor;
    /// let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
    /// let b = Tensor::new(vec![1.0, 0.0, 0.0, 1.0], vec![2, 2]);
    /// assert_eq!(a.matmul(&b).data, a.data);
    /// ```
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        let (m, k) = self.rows_cols();
        let (k2, n) = other.rows_cols();
        assert_eq!(
            k, k2,
            "Matrix dimensions incompatible: [{}, {}] @ [{}, {}]",
            m, k, k2, n
        );

        if m * n * k >= PARALLEL_MATMUL_WORK {
            return self.matmul_parallel_blocked(other, m, n, k);
        }

        let mut result = vec![0.0; m * n];
        for i in 0..m {
            for l in 0..k {
                let a_val = self.data[i * k + l];
                Self::axpy(a_val, &other.data[l * n..(l + 1) * n], &mut result[i * n..(i + 1) * n]);
            }
        }
        Tensor::new(result, vec![m, n])
    }

    /// `result[j] += a * b[j]`, written so LLVM can auto-vectorize it.
    #[inline(always)]
    fn axpy(a: f32, b: &[f32], result: &mut [f32]) {
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a * b_val;
        }
    }

    fn matmul_parallel_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const BLOCK_SIZE: usize = 8;

        let mut result = vec![0.0; m * n];

        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for j_start in (0..n).step_by(BLOCK_SIZE) {
                    let j_end = (j_start + BLOCK_SIZE).min(n);

                    for k_start in (0..k).step_by(BLOCK_SIZE) {
                        let k_end = (k_start + BLOCK_SIZE).min(k);

                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for k_idx in k_start..k_end {
                                Self::axpy(
                                    self.data[i * k + k_idx],
                                    &other.data[k_idx * n + j_start..k_idx * n + j_end],
                                    &mut result_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// Numerically stable softmax over the last axis of a 2D tensor.
    ///
    /// ```text
    /// softmax(x)[i] = exp(x[i] - max(x)) / sum(exp(x[j] - max(x)))
    /// ```
    ///
    /// Subtracting the row maximum keeps `exp` from overflowing and does not
    /// change the result, since the factor cancels. Entries that were filled
    /// with a large negative value come out as exact zeros.
    ///
    /// Rows are processed in parallel.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use gpt_transfer::Tensor;
    /// let logits = Tensor::new(vec![1.0, 1.0, 2.0, 2.0], vec![2, 2]);
    /// let probs = logits.softmax_rows();
    /// assert_eq!(probs.data, vec![0.5, 0.5, 0.5, 0.5]);
    /// ```
    pub fn softmax_rows(&self) -> Tensor {
        let (_, cols) = self.rows_cols();
        let mut result = self.data.clone();
        result.par_chunks_mut(cols).for_each(|row| {
            let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let mut sum = 0.0;
            for v in row.iter_mut() {
                *v = (*v - max).exp();
                sum += *v;
            }
            for v in row.iter_mut() {
                *v /= sum;
            }
        });
        Tensor::new(result, self.shape.clone())
    }

    /// Element-wise addition with broadcasting
    ///
    /// Supports two cases:
    ///
    /// - **Same shape**: plain element-wise addition
    /// - **`[*, n] + [n]`**: the vector is added to every row (bias addition)
    ///
    /// # Example
    ///
    /// ```rust
    /// # use gpt_transfer::Tensor;
    /// let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
    /// let bias = Tensor::new(vec![10.0, 20.0], vec![2]);
    /// assert_eq!(x.add(&bias).data, vec![11.0, 22.0, 13.0, 24.0]);
    /// ```
    ///
    /// # Panics
    ///
    /// Panics for any other shape combination.
    pub fn add(&self, other: &Tensor) -> Tensor {
        self.zip_broadcast(other, "add", |a, b| a + b)
    }

    /// Element-wise multiplication, same broadcasting rules as [`Tensor::add`].
    pub fn mul(&self, other: &Tensor) -> Tensor {
        self.zip_broadcast(other, "mul", |a, b| a * b)
    }

    /// Element-wise subtraction of tensors with identical shapes.
    pub fn sub(&self, other: &Tensor) -> Tensor {
        assert_eq!(self.shape, other.shape, "Shapes must match for subtraction");
        self.zip_broadcast(other, "sub", |a, b| a - b)
    }

    fn zip_broadcast<F>(&self, other: &Tensor, op: &str, f: F) -> Tensor
    where
        F: Fn(f32, f32) -> f32 + Sync,
    {
        if self.shape == other.shape {
            let result = self
                .data
                .par_iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        let last_dim = self.shape.last().copied().unwrap_or(0);
        if other.shape.len() == 1 && other.data.len() == last_dim && last_dim > 0 {
            let result = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &a)| f(a, other.data[i % last_dim]))
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        panic!(
            "Unsupported broadcast for {}: {:?} and {:?}",
            op, self.shape, other.shape
        );
    }

    /// In-place `self += other` for tensors of identical shape.
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(
            self.shape, other.shape,
            "Shapes must match for accumulation"
        );
        self.data
            .par_iter_mut()
            .zip(&other.data)
            .for_each(|(a, &b)| *a += b);
    }

    /// Add `scalar` to every element.
    pub fn add_scalar(&self, scalar: f32) -> Tensor {
        self.map(|x| x + scalar)
    }

    /// Multiply every element by `scalar`.
    ///
    /// Attention uses this for the `1 / sqrt(head_dim)` score scaling.
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        self.map(|x| x * scalar)
    }

    /// Apply `f` to every element.
    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32 + Sync + Send,
    {
        let result = self.data.par_iter().map(|&x| f(x)).collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Sum of squared elements, used for gradient norms.
    pub fn sum_squares(&self) -> f32 {
        self.data.par_iter().map(|&x| x * x).sum()
    }

    /// Transpose of a 2D tensor: `[rows, cols] -> [cols, rows]`.
    ///
    /// The backward pass of `y = x @ W` needs both `x^T` and `W^T`, so this
    /// shows up in every linear layer.
    pub fn transpose(&self) -> Tensor {
        let (rows, cols) = self.rows_cols();
        let mut result = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                result[j * rows + i] = self.data[i * cols + j];
            }
        }
        Tensor::new(result, vec![cols, rows])
    }

    /// Replace values where mask is non-zero with `value`
    ///
    /// Used for causal masking in attention: future positions get a large
    /// negative score, so the following softmax gives them zero weight.
    ///
    /// ```text
    /// scores  [[0.3, 0.9],      mask [[0, 1],      [[0.3, -1e9],
    ///          [0.2, 0.4]]            [0, 0]]  ->   [0.2,  0.4]]
    /// ```
    pub fn masked_fill(&self, mask: &Tensor, value: f32) -> Tensor {
        assert_eq!(
            self.shape, mask.shape,
            "Mask shape must match tensor shape"
        );
        let result = self
            .data
            .par_iter()
            .zip(&mask.data)
            .map(|(&x, &m)| if m != 0.0 { value } else { x })
            .collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Sum over rows of a 2D tensor: `[rows, cols] -> [cols]`.
    pub fn sum_rows(&self) -> Tensor {
        let (rows, cols) = self.rows_cols();
        let mut result = vec![0.0; cols];
        for r in 0..rows {
            for (acc, &v) in result.iter_mut().zip(&self.data[r * cols..(r + 1) * cols]) {
                *acc += v;
            }
        }
        Tensor::new(result, vec![cols])
    }

    /// Mean over rows of a 2D tensor: `[rows, cols] -> [1, cols]`.
    pub fn mean_rows(&self) -> Tensor {
        let (rows, cols) = self.rows_cols();
        let summed = self.sum_rows();
        Tensor::new(
            summed.data.iter().map(|v| v / rows as f32).collect(),
            vec![1, cols],
        )
    }

    /// Borrow row `i` of a 2D tensor (or matrix `i` of a 3D tensor, flattened).
    ///
    /// Greedy decoding reads the logits of the last position through this.
    pub fn row(&self, i: usize) -> &[f32] {
        assert!(!self.shape.is_empty(), "Cannot index a scalar tensor");
        let width = self.strides[0];
        &self.data[i * width..(i + 1) * width]
    }

    /// Copy of columns `[start, end)` of a 2D tensor.
    pub fn slice_cols(&self, start: usize, end: usize) -> Tensor {
        let (rows, cols) = self.rows_cols();
        assert!(start <= end && end <= cols, "Column range {start}..{end} out of bounds for {cols}");
        let width = end - start;
        let mut result = Vec::with_capacity(rows * width);
        for r in 0..rows {
            result.extend_from_slice(&self.data[r * cols + start..r * cols + end]);
        }
        Tensor::new(result, vec![rows, width])
    }

    /// Concatenate 2D tensors with equal row counts along the column axis.
    pub fn concat_cols(parts: &[Tensor]) -> Tensor {
        assert!(!parts.is_empty(), "Cannot concatenate zero tensors");
        let rows = parts[0].shape[0];
        let cols: usize = parts.iter().map(|p| p.rows_cols().1).sum();
        let mut result = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for part in parts {
                let (part_rows, part_cols) = part.rows_cols();
                assert_eq!(part_rows, rows, "Row counts must match for concatenation");
                result.extend_from_slice(&part.data[r * part_cols..(r + 1) * part_cols]);
            }
        }
        Tensor::new(result, vec![rows, cols])
    }

    /// Stack equally shaped tensors along a new leading axis.
    pub fn stack(items: &[Tensor]) -> Tensor {
        assert!(!items.is_empty(), "Cannot stack zero tensors");
        let inner = items[0].shape.clone();
        let mut data = Vec::with_capacity(items.len() * items[0].numel());
        for item in items {
            assert_eq!(item.shape, inner, "All stacked tensors must share a shape");
            data.extend_from_slice(&item.data);
        }
        let mut shape = vec![items.len()];
        shape.extend(inner);
        Tensor::new(data, shape)
    }

    /// Index of the largest value in `values`; ties resolve to the first index.
    ///
    /// This is the greedy choice used when decoding. An empty slice
    /// returns `0`.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use gpt_transfer::Tensor;
    /// assert_eq!(Tensor::argmax(&[0.1, 0.7, 0.7, 0.2]), 1);
    /// ```
    pub fn argmax(values: &[f32]) -> usize {
        values
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |(best_i, best_v), (i, &v)| {
                if v > best_v {
                    (i, v)
                } else {
                    (best_i, best_v)
                }
            })
            .0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequential(rows: usize, cols: usize) -> Tensor {
        Tensor::new((0..rows * cols).map(|v| v as f32 * 0.1).collect(), vec![rows, cols])
    }

    #[test]
    fn test_matmul_small_and_blocked_agree() {
        let a = sequential(20, 13);
        let b = sequential(13, 11);
        let blocked = a.matmul(&b);

        let mut naive = vec![0.0; 20 * 11];
        for i in 0..20 {
            for j in 0..11 {
                for l in 0..13 {
                    naive[i * 11 + j] += a.data[i * 13 + l] * b.data[l * 11 + j];
                }
            }
        }
        for (x, y) in blocked.data.iter().zip(&naive) {
            assert!((x - y).abs() < 1e-3, "{x} vs {y}");
        }
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, -1e9, 0.0, 5.0], vec![2, 3]);
        let s = t.softmax_rows();
        for r in 0..2 {
            let sum: f32 = s.row(r).iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
        assert_eq!(s.data[3], 0.0);
    }

    #[test]
    fn test_bias_broadcast() {
        let t = Tensor::zeros(vec![2, 3]);
        let bias = Tensor::new(vec![1.0, 2.0, 3.0], vec![3]);
        assert_eq!(t.add(&bias).data, vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_slice_and_concat_cols_invert() {
        let t = sequential(3, 6);
        let left = t.slice_cols(0, 2);
        let right = t.slice_cols(2, 6);
        assert_eq!(Tensor::concat_cols(&[left, right]), t);
    }

    #[test]
    fn test_transpose_and_sum_rows() {
        let t = sequential(2, 3);
        let tt = t.transpose();
        assert_eq!(tt.shape, vec![3, 2]);
        assert_eq!(tt.data[1], t.data[3]);
        let sums = t.sum_rows();
        assert!((sums.data[0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_argmax_prefers_first_tie() {
        assert_eq!(Tensor::argmax(&[0.5, 2.0, 2.0, -1.0]), 1);
    }

    #[test]
    fn test_stack_adds_leading_axis() {
        let s = Tensor::stack(&[sequential(2, 2), sequential(2, 2)]);
        assert_eq!(s.shape, vec![2, 2, 2]);
        assert_eq!(s.row(1), sequential(2, 2).data.as_slice());
    }
}
