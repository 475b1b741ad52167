/// Linear memory: a single [dim_out, dim_in] matrix, no bias, no activation.
///
///   y = x @ W^T
///
/// `x` is any stack of rows of width `dim_in`; the leading dims pass through.

use crate::init::Init;
use crate::memory_store::{MemoryError, MemoryVariant};
use crate::tape::{BufId, Tape};
use crate::tensor::{SimpleRng, Tensor};
use crate::traced::traced_linear;

/// Name of the single weight entry.
pub const LINEAR_WEIGHT: &str = "model";

#[derive(Clone, Debug, PartialEq)]
pub struct LinearMemory {
    dim_in: usize,
    dim_out: usize,
    init: Init,
}

impl LinearMemory {
    pub fn new(dim_in: usize, dim_out: usize) -> Result<Self, MemoryError> {
        Self::with_init(dim_in, dim_out, Init::default())
    }

    pub fn with_init(dim_in: usize, dim_out: usize, init: Init) -> Result<Self, MemoryError> {
        if dim_in == 0 || dim_out == 0 {
            return Err(MemoryError::InvalidConfig(format!(
                "linear memory dims must be positive, got dim_in={dim_in} dim_out={dim_out}"
            )));
        }
        Ok(LinearMemory { dim_in, dim_out, init })
    }

    pub fn dim_in(&self) -> usize {
        self.dim_in
    }

    pub fn dim_out(&self) -> usize {
        self.dim_out
    }
}

impl MemoryVariant for LinearMemory {
    fn construct_layers(&self, rng: &mut SimpleRng) -> Vec<(String, Tensor)> {
        let mut w = Tensor::zeros(&[self.dim_out, self.dim_in]);
        self.init.fill(rng, &mut w.data, self.dim_in, self.dim_out);
        vec![(LINEAR_WEIGHT.to_string(), w)]
    }

    fn forward(&self, tape: &mut Tape, weights: &[BufId], x: BufId) -> Result<BufId, MemoryError> {
        let shape = tape.buf_shape(x).to_vec();
        if shape.last().copied() != Some(self.dim_in) {
            return Err(MemoryError::InvalidInput {
                shape,
                reason: format!("linear memory expects rows of width {}", self.dim_in),
            });
        }
        let w = weights[0];
        Ok(traced_linear(tape, x, w, None, self.dim_in, self.dim_out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::tensor::matmul_transpose_b_f32;

    #[test]
    fn test_zero_dims_rejected() {
        assert!(LinearMemory::new(0, 4).is_err());
        assert!(LinearMemory::new(4, 0).is_err());
    }

    #[test]
    fn test_single_weight_of_shape_out_in() {
        let store = MemoryStore::new(LinearMemory::new(3, 5).unwrap(), 1e-3, 42).unwrap();
        assert_eq!(store.len(), 1);
        let w = store.weight(LINEAR_WEIGHT).unwrap();
        assert_eq!(w.shape, vec![5, 3]);
        assert!(w.data.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_forward_matches_direct_matmul() {
        let (dim_in, dim_out) = (4, 3);
        let mut store = MemoryStore::new(LinearMemory::new(dim_in, dim_out).unwrap(), 1e-3, 7).unwrap();
        for batch in [1usize, 2, 5] {
            let mut tape = Tape::new();
            let data: Vec<f32> = (0..batch * dim_in).map(|i| (i as f32 * 0.37).sin()).collect();
            let x = tape.register_input(&data, vec![batch, dim_in]);
            let y = store.forward(&mut tape, x).unwrap();
            assert_eq!(tape.buf_shape(y), &[batch, dim_out]);

            let w = &store.weight(LINEAR_WEIGHT).unwrap().data;
            let mut expected = vec![0.0f32; batch * dim_out];
            matmul_transpose_b_f32(&data, w, &mut expected, batch, dim_in, dim_out);
            assert_eq!(tape.buf_data(y), &expected[..]);
        }
    }

    #[test]
    fn test_forward_rejects_wrong_width() {
        let mut store = MemoryStore::new(LinearMemory::new(4, 4).unwrap(), 1e-3, 7).unwrap();
        let mut tape = Tape::new();
        let x = tape.register_input(&[0.0; 6], vec![2, 3]);
        let err = store.forward(&mut tape, x).unwrap_err();
        assert!(matches!(err, MemoryError::InvalidInput { .. }));
    }

    #[test]
    fn test_forward_does_not_mutate() {
        let mut store = MemoryStore::new(LinearMemory::new(2, 2).unwrap(), 1e-3, 3).unwrap();
        let before = store.weight(LINEAR_WEIGHT).unwrap().clone();
        let mut tape = Tape::new();
        let x = tape.register_input(&[1.0, -1.0], vec![1, 2]);
        store.forward(&mut tape, x).unwrap();
        store.forward(&mut tape, x).unwrap();
        assert_eq!(store.weight(LINEAR_WEIGHT).unwrap(), &before);
        assert_eq!(store.update_count(), 0);
    }
}
