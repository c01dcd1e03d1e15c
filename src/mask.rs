//! Attention masks.
//!
//! The causal mask depends only on sequence length: entry `[i, j]` is `1.0`
//! (hidden) when `j > i`, so position `i` sees itself and everything before
//! it. The same mask is shared by every sequence of a batch.

use crate::error::{GptError, Result};
use crate::tensor::Tensor;

/// Token id treated as padding by [`generate_mask`].
pub const PAD_TOKEN: usize = 0;

/// `[seq_len, seq_len]` look-ahead mask, `1.0` strictly above the diagonal.
pub fn causal_mask(seq_len: usize) -> Tensor {
    let mut mask = vec![0.0; seq_len * seq_len];
    for i in 0..seq_len {
        for j in i + 1..seq_len {
            mask[i * seq_len + j] = 1.0;
        }
    }
    Tensor::new(mask, vec![seq_len, seq_len])
}

/// Build `(padding_mask, causal_mask)` for a batch of equal-length sequences.
///
/// `padding_mask` is `[batch, seq_len]` with `1.0` where the token is
/// [`PAD_TOKEN`]. The decoder only consumes the causal half.
pub fn generate_mask(batch: &[Vec<usize>]) -> Result<(Tensor, Tensor)> {
    let seq_len = uniform_length(batch)?;

    let padding: Vec<f32> = batch
        .iter()
        .flat_map(|seq| seq.iter().map(|&t| if t == PAD_TOKEN { 1.0 } else { 0.0 }))
        .collect();

    Ok((
        Tensor::new(padding, vec![batch.len(), seq_len]),
        causal_mask(seq_len),
    ))
}

/// Common length of every sequence in a non-empty batch.
pub(crate) fn uniform_length(batch: &[Vec<usize>]) -> Result<usize> {
    let first = batch
        .first()
        .ok_or_else(|| GptError::invalid_input("empty batch"))?;
    if first.is_empty() {
        return Err(GptError::invalid_input("empty sequence"));
    }
    if let Some((i, seq)) = batch.iter().enumerate().find(|(_, s)| s.len() != first.len()) {
        return Err(GptError::invalid_input(format!(
            "sequence {i} has length {}, expected {}",
            seq.len(),
            first.len()
        )));
    }
    Ok(first.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causal_mask_hides_future_only() {
        let mask = causal_mask(3);
        assert_eq!(
            mask.data,
            vec![0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_generate_mask_shapes_and_padding() {
        let batch = vec![vec![5, 6, 0], vec![0, 1, 2]];
        let (padding, causal) = generate_mask(&batch).unwrap();
        assert_eq!(padding.shape, vec![2, 3]);
        assert_eq!(padding.data, vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
        assert_eq!(causal, causal_mask(3));
    }

    #[test]
    fn test_generate_mask_rejects_bad_batches() {
        assert!(generate_mask(&[]).is_err());
        assert!(generate_mask(&[vec![]]).is_err());
        assert!(generate_mask(&[vec![1, 2], vec![3]]).is_err());
    }
}
