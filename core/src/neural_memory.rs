/// Neural memory unit: projections, surprise, and the chunked inner loop.
///
/// Write path (`condition`), per chunk of the sequence axis:
///   k = chunk @ W_k^T + b_k
///   v = chunk @ W_v^T + b_v
///   surprise = sum |M(k) - v|
///   g = d surprise / d M            (recorded, so g stays differentiable)
///   M <- memory.update(g)
///
/// Read path (`forward`): optional query projection, then M(q).
///
/// The projections are outer-loop parameters (`BufKind::Param`); the memory
/// weights are recurrence-owned (`BufKind::Memory`). An outer `backward` on
/// anything computed from `forward` reaches the projections through every
/// inner update.

use tracing::debug;

use crate::linear_memory::LinearMemory;
use crate::memory_store::{MemoryError, MemoryStore, MemoryVariant};
use crate::model::{NeuralMemoryConfig, ProjectionParams};
use crate::tape::{BufId, Tape};
use crate::traced::{seq_dims, traced_chunk, traced_l1_loss, traced_linear, Reduction};

/// Tape buffers of the projection parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProjectionIds {
    pub w_k: BufId,
    pub b_k: BufId,
    pub w_v: BufId,
    pub b_v: BufId,
    pub w_q: BufId,
    pub b_q: BufId,
}

#[derive(Clone, Debug)]
struct BoundParams {
    tape_id: u64,
    ids: ProjectionIds,
}

/// Memory plus the affine maps that feed it.
#[derive(Clone, Debug)]
pub struct NeuralMemoryUnit<V = LinearMemory> {
    cfg: NeuralMemoryConfig,
    memory: MemoryStore<V>,
    params: ProjectionParams,
    bound: Option<BoundParams>,
}

impl NeuralMemoryUnit<LinearMemory> {
    /// Linear memory of shape [dim_out, dim_in] with step size `cfg.lr`.
    pub fn new(cfg: NeuralMemoryConfig, seed: u64) -> Result<Self, MemoryError> {
        cfg.validate()?;
        let variant = LinearMemory::new(cfg.dim_in, cfg.dim_out)?;
        let memory = MemoryStore::new(variant, cfg.lr, seed)?;
        Self::with_memory(cfg, memory, seed)
    }
}

impl<V: MemoryVariant> NeuralMemoryUnit<V> {
    /// Wrap an existing store. Its lr must equal `cfg.lr`, and a read of one
    /// `dim_in` row must come back with `dim_out` elements.
    pub fn with_memory(cfg: NeuralMemoryConfig, memory: MemoryStore<V>, seed: u64) -> Result<Self, MemoryError> {
        cfg.validate()?;
        if memory.lr() != cfg.lr {
            return Err(MemoryError::InvalidConfig(format!(
                "memory lr {} differs from config lr {}", memory.lr(), cfg.lr
            )));
        }
        let out = memory.output_shape(&[1, cfg.dim_in]).map_err(|e| {
            MemoryError::InvalidConfig(format!("memory cannot read dim_in = {}: {e}", cfg.dim_in))
        })?;
        if out.iter().product::<usize>() != cfg.dim_out {
            return Err(MemoryError::InvalidConfig(format!(
                "memory reads out {out:?} for one row, expected dim_out = {}", cfg.dim_out
            )));
        }
        let params = ProjectionParams::init(&cfg, seed.wrapping_add(1));
        Ok(NeuralMemoryUnit { cfg, memory, params, bound: None })
    }

    pub fn config(&self) -> &NeuralMemoryConfig {
        &self.cfg
    }

    pub fn memory(&self) -> &MemoryStore<V> {
        &self.memory
    }

    /// Replace the memory state, e.g. to restart from a saved initial state.
    pub fn set_memory(&mut self, memory: MemoryStore<V>) {
        self.memory = memory;
    }

    pub fn params(&self) -> &ProjectionParams {
        &self.params
    }

    /// Replace the projections. Shapes must match the config.
    pub fn set_params(&mut self, params: ProjectionParams) -> Result<(), MemoryError> {
        let expected = ProjectionParams::zeros_like(&self.cfg);
        for (got, want) in params.buffers().iter().zip(expected.buffers()) {
            if got.len() != want.len() {
                return Err(MemoryError::InvalidConfig(format!(
                    "projection buffer has {} elements, expected {}", got.len(), want.len()
                )));
            }
        }
        self.params = params;
        self.bound = None;
        Ok(())
    }

    /// Register the projections on `tape` as outer parameters. Idempotent per tape.
    pub fn register_params(&mut self, tape: &mut Tape) -> ProjectionIds {
        if let Some(b) = &self.bound {
            if b.tape_id == tape.id() {
                return b.ids;
            }
        }
        let (d, o) = (self.cfg.dim_in, self.cfg.dim_out);
        let p = &self.params;
        let ids = ProjectionIds {
            w_k: tape.register_param(&p.w_k, vec![d, d]),
            b_k: tape.register_param(&p.b_k, vec![d]),
            w_v: tape.register_param(&p.w_v, vec![o, d]),
            b_v: tape.register_param(&p.b_v, vec![o]),
            w_q: tape.register_param(&p.w_q, vec![d, d]),
            b_q: tape.register_param(&p.b_q, vec![d]),
        };
        self.bound = Some(BoundParams { tape_id: tape.id(), ids });
        ids
    }

    /// Projection gradients left on `tape` by `Tape::backward`.
    /// Parameters not registered on this tape, or unreached, read as zeros.
    pub fn projection_grads(&self, tape: &Tape) -> ProjectionParams {
        match &self.bound {
            Some(b) if b.tape_id == tape.id() => ProjectionParams {
                w_k: tape.get_param_grad(b.ids.w_k),
                b_k: tape.get_param_grad(b.ids.b_k),
                w_v: tape.get_param_grad(b.ids.w_v),
                b_v: tape.get_param_grad(b.ids.b_v),
                w_q: tape.get_param_grad(b.ids.w_q),
                b_q: tape.get_param_grad(b.ids.b_q),
            },
            _ => ProjectionParams::zeros_like(&self.cfg),
        }
    }

    /// Outer SGD step on the projections. The memory is untouched.
    pub fn apply_weight_gradients(&mut self, grads: &ProjectionParams, lr: f32) {
        self.params.apply_weight_gradients(grads, lr);
        self.bound = None;
    }

    fn check_input(&self, tape: &Tape, x: BufId) -> Result<(usize, usize), MemoryError> {
        let shape = tape.buf_shape(x);
        let reject = |reason: String| Err(MemoryError::InvalidInput { shape: shape.to_vec(), reason });
        if !(2..=3).contains(&shape.len()) {
            return reject("expected [seq, dim_in] or [batch, seq, dim_in]".into());
        }
        let (batch, seq, width) = seq_dims(shape);
        if width != self.cfg.dim_in {
            return reject(format!("last dim must be dim_in = {}", self.cfg.dim_in));
        }
        if seq == 0 || batch == 0 {
            return reject("empty sequence".into());
        }
        Ok((batch, seq))
    }

    /// Chunk windows `(start, len)` covering `0..seq`.
    fn chunks(&self, seq: usize) -> Vec<(usize, usize)> {
        let size = self.cfg.update_chunk_size.unwrap_or(seq).max(1);
        (0..seq).step_by(size).map(|start| (start, size.min(seq - start))).collect()
    }

    /// Write `x` into memory, one update per chunk. Returns the summed surprise.
    pub fn condition(&mut self, tape: &mut Tape, x: BufId) -> Result<f32, MemoryError> {
        let (_, seq) = self.check_input(tape, x)?;
        let ids = self.register_params(tape);
        let (d, o) = (self.cfg.dim_in, self.cfg.dim_out);
        let (eta, alpha) = (self.cfg.eta, self.cfg.alpha);

        let mut total = 0.0f32;
        for (i, (start, len)) in self.chunks(seq).into_iter().enumerate() {
            let chunk = if len == seq { x } else { traced_chunk(tape, x, start, len) };
            let key = traced_linear(tape, chunk, ids.w_k, Some(ids.b_k), d, d);
            let value = traced_linear(tape, chunk, ids.w_v, Some(ids.b_v), d, o);

            let prediction = self.memory.forward(tape, key)?;
            if tape.buf_numel(prediction) != tape.buf_numel(value) {
                return Err(MemoryError::InvalidInput {
                    shape: tape.buf_shape(prediction).to_vec(),
                    reason: format!("memory read does not match value shape {:?}", tape.buf_shape(value)),
                });
            }
            let surprise = traced_l1_loss(tape, prediction, value, Reduction::Sum);

            let weights = self.memory.weight_nodes(tape);
            let grads = tape.grad(surprise, &weights, true);
            self.memory.update(tape, &grads, eta, alpha)?;

            let s = tape.buf_data(surprise)[0];
            debug!(chunk = i, start, len, surprise = s, "memory conditioned");
            total += s;
        }
        Ok(total)
    }

    /// Read the memory at `x`, through the query projection when `query` is set.
    pub fn forward(&mut self, tape: &mut Tape, x: BufId, query: bool) -> Result<BufId, MemoryError> {
        self.check_input(tape, x)?;
        let ids = self.register_params(tape);
        let d = self.cfg.dim_in;
        let q = if query {
            traced_linear(tape, x, ids.w_q, Some(ids.b_q), d, d)
        } else {
            x
        };
        self.memory.forward(tape, q)
    }
}
