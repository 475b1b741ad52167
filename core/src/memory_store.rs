/// Surprise-paired memory store.
///
/// A `MemoryStore` owns a set of named memory weights, each structurally
/// paired with a surprise (momentum) accumulator of the same shape. A
/// `MemoryVariant` supplies the initial weights and the read function; the
/// store owns everything else:
///
///   surprise_t = eta * surprise_{t-1} + lr * grad_t
///   weight_t   = (1 - alpha) * weight_{t-1} + surprise_t
///
/// Both lines are recorded on the tape, so weight_t stays differentiable
/// w.r.t. weight_{t-1} and whatever grad_t was computed from. An update never
/// writes into an existing buffer: it allocates new ones and rebinds the pair.

use thiserror::Error;
use tracing::{debug, warn};

use crate::tape::{BufId, Tape};
use crate::tensor::{SimpleRng, Tensor};
use crate::traced::{traced_add, traced_scale};

// ── Errors ───────────────────────────────────────────────────────────

/// Errors raised by the memory kernel.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MemoryError {
    /// `update` received a different number of gradients than there are weights.
    #[error("expected {expected} gradients (one per memory weight), got {got}")]
    ShapeMismatch { expected: usize, got: usize },

    /// A gradient does not match the shape of the weight it belongs to.
    #[error("gradient for memory weight `{name}` has {got} elements, expected {expected}")]
    GradientShape { name: String, expected: usize, got: usize },

    /// Construction parameters are unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The input tensor cannot be processed.
    #[error("invalid input of shape {shape:?}: {reason}")]
    InvalidInput { shape: Vec<usize>, reason: String },

    /// A variant produced two weights with the same name.
    #[error("duplicate memory weight `{0}`")]
    DuplicateWeight(String),
}

// ── Variant capability ───────────────────────────────────────────────

/// What a memory variant must provide. Pairing, tape binding and the update
/// recurrence are shared and live in `MemoryStore`.
pub trait MemoryVariant {
    /// Initial named weights. Called exactly once, by `MemoryStore::new`.
    fn construct_layers(&self, rng: &mut SimpleRng) -> Vec<(String, Tensor)>;

    /// Read the memory at `x`. `weights` are the current weight buffers in
    /// registration order. Must not mutate anything.
    fn forward(&self, tape: &mut Tape, weights: &[BufId], x: BufId) -> Result<BufId, MemoryError>;
}

// ── Store ────────────────────────────────────────────────────────────

/// One memory weight and its surprise accumulator.
#[derive(Clone, Debug)]
pub struct MemoryEntry {
    pub name: String,
    pub weight: Tensor,
    pub surprise: Tensor,
}

/// Tape buffers currently holding one entry's pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryNodes {
    pub weight: BufId,
    pub surprise: BufId,
}

#[derive(Clone, Debug)]
struct Binding {
    tape_id: u64,
    nodes: Vec<EntryNodes>,
}

/// Memory weights paired with surprise state, generic over the read function.
#[derive(Clone, Debug)]
pub struct MemoryStore<V> {
    variant: V,
    lr: f32,
    entries: Vec<MemoryEntry>,
    binding: Option<Binding>,
    updates: usize,
}

impl<V: MemoryVariant> MemoryStore<V> {
    /// Build the store: construct the variant's weights once and pair each
    /// with a zero surprise accumulator.
    pub fn new(variant: V, lr: f32, seed: u64) -> Result<Self, MemoryError> {
        if !lr.is_finite() {
            return Err(MemoryError::InvalidConfig(format!("memory lr must be finite, got {lr}")));
        }
        let mut rng = SimpleRng::new(seed);
        let layers = variant.construct_layers(&mut rng);
        if layers.is_empty() {
            return Err(MemoryError::InvalidConfig("memory variant constructed no weights".into()));
        }

        let mut entries: Vec<MemoryEntry> = Vec::with_capacity(layers.len());
        for (name, weight) in layers {
            if entries.iter().any(|e| e.name == name) {
                return Err(MemoryError::DuplicateWeight(name));
            }
            let surprise = Tensor::zeros(&weight.shape);
            entries.push(MemoryEntry { name, weight, surprise });
        }
        debug!(weights = entries.len(), lr, "memory store constructed");

        Ok(MemoryStore { variant, lr, entries, binding: None, updates: 0 })
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    /// Number of (weight, surprise) pairs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of `update` calls that passed validation.
    pub fn update_count(&self) -> usize {
        self.updates
    }

    pub fn entries(&self) -> &[MemoryEntry] {
        &self.entries
    }

    /// Current weights in registration order. Never yields surprise state.
    pub fn named_weights(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|e| (e.name.as_str(), &e.weight))
    }

    pub fn weights(&self) -> Vec<&Tensor> {
        self.entries.iter().map(|e| &e.weight).collect()
    }

    pub fn weight(&self, name: &str) -> Option<&Tensor> {
        self.entries.iter().find(|e| e.name == name).map(|e| &e.weight)
    }

    /// Surprise accumulator paired with weight `name`.
    pub fn surprise(&self, name: &str) -> Option<&Tensor> {
        self.entries.iter().find(|e| e.name == name).map(|e| &e.surprise)
    }

    /// Forget the tape binding. Values are kept; the next tape starts a fresh graph.
    pub fn detach(&mut self) {
        self.binding = None;
    }

    /// Make sure every pair lives on `tape`, registering the current values as
    /// memory leaves when the store is new to this tape.
    pub fn attach(&mut self, tape: &mut Tape) -> &[EntryNodes] {
        let bound = matches!(&self.binding, Some(b) if b.tape_id == tape.id());
        if !bound {
            let nodes = self.entries.iter().map(|e| EntryNodes {
                weight: tape.register_memory(&e.weight.data, e.weight.shape.clone(), true),
                surprise: tape.register_memory(&e.surprise.data, e.surprise.shape.clone(), false),
            }).collect();
            self.binding = Some(Binding { tape_id: tape.id(), nodes });
        }
        match &self.binding {
            Some(b) => b.nodes.as_slice(),
            None => &[],
        }
    }

    /// Weight buffers on `tape`, in registration order.
    pub fn weight_nodes(&mut self, tape: &mut Tape) -> Vec<BufId> {
        self.attach(tape).iter().map(|n| n.weight).collect()
    }

    /// Shape the variant reads out for an input of `shape`, evaluated on a
    /// scratch tape. The store's own tape binding is left alone.
    pub fn output_shape(&self, shape: &[usize]) -> Result<Vec<usize>, MemoryError> {
        let mut scratch = Tape::new();
        let weights: Vec<BufId> = self.entries.iter()
            .map(|e| scratch.register_memory(&e.weight.data, e.weight.shape.clone(), false))
            .collect();
        let numel = shape.iter().product();
        let x = scratch.register_input(&vec![0.0; numel], shape.to_vec());
        let y = self.variant.forward(&mut scratch, &weights, x)?;
        Ok(scratch.buf_shape(y).to_vec())
    }

    /// Read the memory at `x` with the current weights.
    pub fn forward(&mut self, tape: &mut Tape, x: BufId) -> Result<BufId, MemoryError> {
        let weights = self.weight_nodes(tape);
        self.variant.forward(tape, &weights, x)
    }

    /// Fold one gradient step into every pair.
    ///
    /// `grads` must hold one entry per weight, in registration order. A `None`
    /// entry leaves that pair untouched (with a warning). All shape checks run
    /// before the first write, so a rejected call mutates nothing.
    pub fn update(
        &mut self,
        tape: &mut Tape,
        grads: &[Option<BufId>],
        eta: f32,
        alpha: f32,
    ) -> Result<(), MemoryError> {
        if grads.len() != self.entries.len() {
            return Err(MemoryError::ShapeMismatch { expected: self.entries.len(), got: grads.len() });
        }
        for (entry, grad) in self.entries.iter().zip(grads) {
            if let Some(g) = *grad {
                if g >= tape.num_bufs() {
                    return Err(MemoryError::InvalidInput {
                        shape: Vec::new(),
                        reason: format!("gradient buffer {g} for memory weight `{}` is not on this tape", entry.name),
                    });
                }
                let got = tape.buf_numel(g);
                if got != entry.weight.numel() {
                    return Err(MemoryError::GradientShape {
                        name: entry.name.clone(),
                        expected: entry.weight.numel(),
                        got,
                    });
                }
            }
        }

        let mut nodes = self.attach(tape).to_vec();
        let lr = self.lr;
        for (i, grad) in grads.iter().enumerate() {
            let Some(g) = *grad else {
                warn!(weight = %self.entries[i].name, "no gradient reached memory weight; skipping its update");
                continue;
            };
            let EntryNodes { weight, surprise } = nodes[i];

            // surprise_t = eta * surprise_{t-1} + lr * grad
            let carried = traced_scale(tape, surprise, eta);
            let step = traced_scale(tape, g, lr);
            let new_surprise = traced_add(tape, carried, step);

            // weight_t = (1 - alpha) * weight_{t-1} + surprise_t
            let retained = traced_scale(tape, weight, 1.0 - alpha);
            let new_weight = traced_add(tape, retained, new_surprise);

            let entry = &mut self.entries[i];
            entry.surprise.data.copy_from_slice(tape.buf_data(new_surprise));
            entry.weight.data.copy_from_slice(tape.buf_data(new_weight));
            tape.set_shape(new_surprise, entry.surprise.shape.clone());
            tape.set_shape(new_weight, entry.weight.shape.clone());
            nodes[i] = EntryNodes { weight: new_weight, surprise: new_surprise };
        }

        self.binding = Some(Binding { tape_id: tape.id(), nodes });
        self.updates += 1;
        debug!(update = self.updates, eta, alpha, "memory updated");
        Ok(())
    }
}
