// Wengert tape: reverse-mode AD via operation recording.
//
// Records operations during the forward pass into a linear tape, then replays
// them in reverse to compute gradients via the chain rule. One set of VJP
// rules serves two sweeps:
//
//   backward(loss)                 first-order; plain gradients land in the
//                                  accumulator (outer loop).
//   grad(loss, wrt, create_graph)  returns gradient *buffers*. With
//                                  create_graph = true every VJP is itself
//                                  recorded, so the result can be
//                                  differentiated again (inner loop).
//
// Only buffers with requires_grad are tracked; an op whose inputs are all
// constants is computed but never recorded.
// Nothing is freed before the tape is dropped, so intermediates needed by a
// later sweep are always in the arena.
// Leaves are snapshotted at registration, immune to later mutation of the
// caller's copy.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::traced;

// ── Buffer management ────────────────────────────────────────────────

/// Arena index for tensor buffers. Immutable after creation.
pub type BufId = usize;

/// Ownership category of a buffer.
///
/// `Param` and `Memory` are both differentiable leaves but belong to
/// different owners: params are updated by an outer optimizer from
/// `backward()` gradients, memory buffers are only ever replaced by the
/// inner-loop recurrence in `MemoryStore::update`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufKind {
    /// Op output or constant.
    Intermediate,
    /// Caller-provided data (no gradient).
    Input,
    /// Outer-loop parameter (projection weights and biases).
    Param,
    /// Inner-loop memory state (weight or surprise accumulator).
    Memory,
}

/// A flat tensor buffer in the tape arena.
#[derive(Clone, Debug)]
pub struct TapeBuf {
    /// Flat storage (row-major).
    pub data: Vec<f32>,
    /// Shape metadata, e.g., [seq_len, d].
    pub shape: Vec<usize>,
    pub kind: BufKind,
    /// True when some tracked leaf reaches this buffer through recorded ops.
    pub requires_grad: bool,
}

impl TapeBuf {
    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

// ── Tape operations ──────────────────────────────────────────────────

/// A single recorded operation on the tape.
#[derive(Debug, Clone)]
pub enum TapeOp {
    // ── Linear algebra ──────────────────────────────────────────
    /// out = A @ B where A: [m, k], B: [k, n], out: [m, n]
    Matmul { a: BufId, b: BufId, out: BufId, m: usize, k: usize, n: usize },
    /// out = A @ B^T where A: [m, k], B: [n, k], out: [m, n]
    MatmulTransposeB { a: BufId, b: BufId, out: BufId, m: usize, k: usize, n: usize },
    /// out = A^T where A: [rows, cols], out: [cols, rows]
    Transpose { input: BufId, out: BufId, rows: usize, cols: usize },

    // ── Element-wise ────────────────────────────────────────────
    /// out = A + B
    Add { a: BufId, b: BufId, out: BufId },
    /// out = A - B
    Sub { a: BufId, b: BufId, out: BufId },
    /// out = A * B  (element-wise)
    Mul { a: BufId, b: BufId, out: BufId },
    /// out = scalar * A
    Scale { input: BufId, scalar: f32, out: BufId },
    /// out = |A|
    Abs { input: BufId, out: BufId },
    /// out = sign(A); zero derivative everywhere it is defined
    Sign { input: BufId, out: BufId },

    // ── Broadcast / reductions ──────────────────────────────────
    /// out[r, c] = A[r, c] + bias[c]
    AddRowBroadcast { input: BufId, bias: BufId, out: BufId, rows: usize, cols: usize },
    /// out[c] = sum_r A[r, c]
    SumRows { input: BufId, out: BufId, rows: usize, cols: usize },
    /// out[r, c] = A[c]
    BroadcastRows { input: BufId, out: BufId, rows: usize, cols: usize },
    /// out = sum(A)  (scalar)
    Sum { input: BufId, out: BufId },
    /// out[i] = A[0] for every element of an `out` of any shape
    Fill { input: BufId, out: BufId },

    // ── Sequence slicing ────────────────────────────────────────
    /// out = A[:, start..start+len, :] where A: [batch, seq, width]
    SliceSeq { input: BufId, out: BufId, batch: usize, seq: usize, width: usize, start: usize, len: usize },
    /// Inverse of SliceSeq: zeros of [batch, seq, width] with the window set to A
    PadSeq { input: BufId, out: BufId, batch: usize, seq: usize, width: usize, start: usize, len: usize },
}

impl TapeOp {
    /// Buffers read by this op.
    pub fn inputs(&self) -> Vec<BufId> {
        match *self {
            TapeOp::Matmul { a, b, .. }
            | TapeOp::MatmulTransposeB { a, b, .. }
            | TapeOp::Add { a, b, .. }
            | TapeOp::Sub { a, b, .. }
            | TapeOp::Mul { a, b, .. } => vec![a, b],
            TapeOp::AddRowBroadcast { input, bias, .. } => vec![input, bias],
            TapeOp::Transpose { input, .. }
            | TapeOp::Scale { input, .. }
            | TapeOp::Abs { input, .. }
            | TapeOp::Sign { input, .. }
            | TapeOp::SumRows { input, .. }
            | TapeOp::BroadcastRows { input, .. }
            | TapeOp::Sum { input, .. }
            | TapeOp::Fill { input, .. }
            | TapeOp::SliceSeq { input, .. }
            | TapeOp::PadSeq { input, .. } => vec![input],
        }
    }

    /// Buffer written by this op.
    pub fn output(&self) -> BufId {
        match *self {
            TapeOp::Matmul { out, .. }
            | TapeOp::MatmulTransposeB { out, .. }
            | TapeOp::Transpose { out, .. }
            | TapeOp::Add { out, .. }
            | TapeOp::Sub { out, .. }
            | TapeOp::Mul { out, .. }
            | TapeOp::Scale { out, .. }
            | TapeOp::Abs { out, .. }
            | TapeOp::Sign { out, .. }
            | TapeOp::AddRowBroadcast { out, .. }
            | TapeOp::SumRows { out, .. }
            | TapeOp::BroadcastRows { out, .. }
            | TapeOp::Sum { out, .. }
            | TapeOp::Fill { out, .. }
            | TapeOp::SliceSeq { out, .. }
            | TapeOp::PadSeq { out, .. } => out,
        }
    }
}

// ── The Tape ─────────────────────────────────────────────────────────

static NEXT_TAPE_ID: AtomicU64 = AtomicU64::new(1);

/// Wengert tape for reverse-mode AD.
///
/// Records operations during forward pass, replays in reverse for gradients.
/// Usually created via `with_tape()` and dropped after the outer backward pass.
pub struct Tape {
    /// Process-unique identity; buffers bound to one tape are meaningless on another.
    id: u64,
    /// Operations in forward order. Replayed in reverse during backward.
    ops: Vec<TapeOp>,
    /// Arena of tensor buffers. Indexed by BufId.
    bufs: Vec<TapeBuf>,
    /// Gradient accumulators, indexed by BufId. Filled by `backward()`.
    grad_accum: Vec<Option<Vec<f32>>>,
    /// Explicit upstream gradients for non-scalar losses.
    seeds: HashMap<BufId, Vec<f32>>,
    /// False while a non-graph-building sweep is running.
    recording: bool,
}

impl Default for Tape {
    fn default() -> Self {
        Tape::new()
    }
}

impl Tape {
    pub fn new() -> Self {
        Tape {
            id: NEXT_TAPE_ID.fetch_add(1, Ordering::Relaxed),
            ops: Vec::new(),
            bufs: Vec::new(),
            grad_accum: Vec::new(),
            seeds: HashMap::new(),
            recording: true,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    // ── Buffer management ────────────────────────────────────────

    fn push_buf(&mut self, data: Vec<f32>, shape: Vec<usize>, kind: BufKind, requires_grad: bool) -> BufId {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>(),
                         "buffer of {} elements for shape {:?}", data.len(), shape);
        let id = self.bufs.len();
        self.bufs.push(TapeBuf { data, shape, kind, requires_grad });
        self.grad_accum.push(None);
        id
    }

    /// Allocate a constant buffer in the arena. Returns its BufId.
    pub fn alloc(&mut self, data: Vec<f32>, shape: Vec<usize>) -> BufId {
        self.push_buf(data, shape, BufKind::Intermediate, false)
    }

    /// Register an outer-loop parameter. CLONES the data.
    pub fn register_param(&mut self, data: &[f32], shape: Vec<usize>) -> BufId {
        self.push_buf(data.to_vec(), shape, BufKind::Param, true)
    }

    /// Register inner-loop memory state. CLONES the data.
    ///
    /// Memory weights are tracked (`requires_grad = true`) so the surprise
    /// gradient can be taken w.r.t. them; surprise accumulators start untracked.
    pub fn register_memory(&mut self, data: &[f32], shape: Vec<usize>, requires_grad: bool) -> BufId {
        self.push_buf(data.to_vec(), shape, BufKind::Memory, requires_grad)
    }

    /// Register an input (non-parameter) buffer. Clones the data.
    pub fn register_input(&mut self, data: &[f32], shape: Vec<usize>) -> BufId {
        self.push_buf(data.to_vec(), shape, BufKind::Input, false)
    }

    /// Get the data for a buffer.
    pub fn buf_data(&self, id: BufId) -> &[f32] {
        &self.bufs[id].data
    }

    /// Get the shape for a buffer.
    pub fn buf_shape(&self, id: BufId) -> &[usize] {
        &self.bufs[id].shape
    }

    /// Get the number of elements in a buffer.
    pub fn buf_numel(&self, id: BufId) -> usize {
        self.bufs[id].numel()
    }

    pub fn buf_kind(&self, id: BufId) -> BufKind {
        self.bufs[id].kind
    }

    pub fn requires_grad(&self, id: BufId) -> bool {
        self.bufs[id].requires_grad
    }

    /// Check if a buffer is an outer-loop parameter.
    pub fn is_param(&self, id: BufId) -> bool {
        self.bufs[id].kind == BufKind::Param
    }

    /// Relabel the shape of a buffer without touching its data.
    /// Matmul outputs come back as [rows, n]; callers restore leading dims here.
    pub fn set_shape(&mut self, id: BufId, shape: Vec<usize>) {
        assert_eq!(shape.iter().product::<usize>(), self.bufs[id].numel(),
                   "set_shape: {:?} does not fit {} elements", shape, self.bufs[id].numel());
        self.bufs[id].shape = shape;
    }

    /// Number of buffers in the arena.
    pub fn num_bufs(&self) -> usize {
        self.bufs.len()
    }

    /// Number of ops recorded.
    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    // ── Recording ────────────────────────────────────────────────

    /// Whether new ops are currently being recorded.
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Record an operation whose output buffer is already allocated.
    ///
    /// The op is kept only if recording is on and at least one input requires
    /// grad; in that case the output is marked as requiring grad too.
    pub fn record(&mut self, op: TapeOp) {
        let tracked = self.recording
            && op.inputs().iter().any(|&i| self.bufs[i].requires_grad);
        if tracked {
            self.bufs[op.output()].requires_grad = true;
            self.ops.push(op);
        }
    }

    /// Record an operation and allocate its output buffer in one step.
    /// Returns the output BufId.
    pub fn record_with_output(&mut self, data: Vec<f32>, shape: Vec<usize>,
                              op_fn: impl FnOnce(BufId) -> TapeOp) -> BufId {
        let out_id = self.alloc(data, shape);
        let op = op_fn(out_id);
        self.record(op);
        out_id
    }

    // ── Gradient seeding and access ──────────────────────────────

    /// Seed the gradient for a buffer (needed for non-scalar losses).
    pub fn seed_grad(&mut self, id: BufId, grad: Vec<f32>) {
        assert_eq!(grad.len(), self.bufs[id].numel(),
                   "Gradient size mismatch: grad={} buf={}", grad.len(), self.bufs[id].numel());
        self.seeds.insert(id, grad);
    }

    /// Get the accumulated gradient for a buffer. Returns None if no gradient flowed to it.
    pub fn get_grad(&self, id: BufId) -> Option<&[f32]> {
        self.grad_accum[id].as_deref()
    }

    /// Get gradient for a parameter buffer, returning zeros if no gradient flowed.
    pub fn get_param_grad(&self, id: BufId) -> Vec<f32> {
        assert!(self.is_param(id), "get_param_grad called on non-param buffer {}", id);
        match &self.grad_accum[id] {
            Some(g) => g.clone(),
            None => vec![0.0; self.bufs[id].numel()],
        }
    }

    // ── Reverse sweeps ───────────────────────────────────────────

    /// First-order backward pass: replay ops in reverse and leave the gradient
    /// of every reachable tracked buffer in the accumulator.
    ///
    /// Scalar losses are seeded with 1.0 unless `seed_grad()` was called.
    pub fn backward(&mut self, loss_id: BufId) {
        let adj = self.reverse_sweep(loss_id, None, false);
        self.grad_accum.iter_mut().for_each(|g| *g = None);
        for (id, g) in adj.into_iter().enumerate() {
            if let Some(g) = g {
                self.grad_accum[id] = Some(self.bufs[g].data.clone());
            }
        }
    }

    /// Gradient of a scalar `loss` w.r.t. each buffer in `wrt`.
    ///
    /// Returns one entry per `wrt` buffer: `None` when no recorded path
    /// connects it to `loss`. With `create_graph` the VJPs are recorded, so
    /// the returned buffers stay differentiable. The existing graph is never
    /// consumed; the tape can be swept again afterwards.
    ///
    /// Only ops downstream of some `wrt` buffer are replayed, so the cost of a
    /// call does not grow with unrelated history on the tape.
    pub fn grad(&mut self, loss: BufId, wrt: &[BufId], create_graph: bool) -> Vec<Option<BufId>> {
        let adj = self.reverse_sweep(loss, Some(wrt), create_graph);
        wrt.iter().map(|&id| adj.get(id).copied().flatten()).collect()
    }

    /// Tracked buffers that depend on some buffer in `wrt` (all tracked
    /// buffers when `wrt` is None). One forward pass over the recorded ops.
    fn live_mask(&self, wrt: Option<&[BufId]>) -> Vec<bool> {
        let Some(wrt) = wrt else {
            return self.bufs.iter().map(|b| b.requires_grad).collect();
        };
        let mut live = vec![false; self.bufs.len()];
        for &id in wrt {
            live[id] = self.bufs[id].requires_grad;
        }
        for op in &self.ops {
            if op.inputs().iter().any(|&i| live[i]) {
                live[op.output()] = true;
            }
        }
        live
    }

    /// Returns the adjoint buffer of every buffer that existed when the sweep began.
    fn reverse_sweep(&mut self, loss: BufId, wrt: Option<&[BufId]>, create_graph: bool) -> Vec<Option<BufId>> {
        let n_bufs = self.bufs.len();
        let n_ops = self.ops.len();
        let mut adj: Vec<Option<BufId>> = vec![None; n_bufs];
        let live = self.live_mask(wrt);
        if !live[loss] {
            return adj;
        }

        let was_recording = self.recording;
        self.recording = create_graph;

        let seed = match self.seeds.get(&loss).cloned() {
            Some(g) => g,
            None => {
                assert_eq!(self.bufs[loss].numel(), 1,
                           "Auto-seeding only works for scalar loss (got {} elements)",
                           self.bufs[loss].numel());
                vec![1.0]
            }
        };
        let seed_shape = self.bufs[loss].shape.clone();
        adj[loss] = Some(self.alloc(seed, seed_shape));

        for op_idx in (0..n_ops).rev() {
            // Clone the op to avoid borrow conflict with self.
            let op = self.ops[op_idx].clone();
            if !live[op.output()] {
                continue;
            }
            let Some(d_out) = adj[op.output()] else { continue };
            for (input, d_in) in self.vjp(&op, d_out, &live) {
                adj[input] = Some(match adj[input] {
                    Some(prev) => traced::traced_add(self, prev, d_in),
                    None => d_in,
                });
            }
        }

        self.recording = was_recording;
        adj
    }

    /// Vector-Jacobian product of one op, expressed with traced ops so that it
    /// is itself recorded when the sweep builds a graph.
    /// Returns (input, gradient buffer) for each input marked in `live`.
    fn vjp(&mut self, op: &TapeOp, d: BufId, live: &[bool]) -> Vec<(BufId, BufId)> {
        use crate::traced::*;
        let needs = |id: BufId| live[id];

        let mut out = Vec::with_capacity(2);
        match *op {
            // ── Matmul: out = A @ B ──────────────────────────────
            TapeOp::Matmul { a, b, m, k, n, .. } => {
                if needs(a) {
                    // d_A = d_out @ B^T
                    out.push((a, traced_matmul_transpose_b(self, d, b, m, n, k)));
                }
                if needs(b) {
                    // d_B = A^T @ d_out
                    let a_t = traced_transpose(self, a, m, k);
                    out.push((b, traced_matmul(self, a_t, d, k, m, n)));
                }
            }

            // ── MatmulTransposeB: out = A @ B^T ─────────────────
            TapeOp::MatmulTransposeB { a, b, m, k, n, .. } => {
                if needs(a) {
                    // d_A = d_out @ B  (d_out: m×n, B: n×k → d_A: m×k)
                    out.push((a, traced_matmul(self, d, b, m, n, k)));
                }
                if needs(b) {
                    // d_B = d_out^T @ A  (d_out^T: n×m, A: m×k → d_B: n×k)
                    let d_t = traced_transpose(self, d, m, n);
                    out.push((b, traced_matmul(self, d_t, a, n, m, k)));
                }
            }

            TapeOp::Transpose { input, rows, cols, .. } => {
                if needs(input) {
                    out.push((input, traced_transpose(self, d, cols, rows)));
                }
            }

            TapeOp::Add { a, b, .. } => {
                if needs(a) {
                    out.push((a, d));
                }
                if needs(b) {
                    out.push((b, d));
                }
            }

            TapeOp::Sub { a, b, .. } => {
                if needs(a) {
                    out.push((a, d));
                }
                if needs(b) {
                    out.push((b, traced_scale(self, d, -1.0)));
                }
            }

            TapeOp::Mul { a, b, .. } => {
                if needs(a) {
                    out.push((a, traced_mul(self, d, b)));
                }
                if needs(b) {
                    out.push((b, traced_mul(self, d, a)));
                }
            }

            TapeOp::Scale { input, scalar, .. } => {
                if needs(input) {
                    out.push((input, traced_scale(self, d, scalar)));
                }
            }

            // ── Abs: d_x = d_out * sign(x) ───────────────────────
            TapeOp::Abs { input, .. } => {
                if needs(input) {
                    let s = traced_sign(self, input);
                    out.push((input, traced_mul(self, d, s)));
                }
            }

            // Piecewise constant: the gradient exists and is zero.
            TapeOp::Sign { input, .. } => {
                if needs(input) {
                    let shape = self.bufs[input].shape.clone();
                    let zeros = vec![0.0; self.bufs[input].numel()];
                    out.push((input, self.alloc(zeros, shape)));
                }
            }

            TapeOp::AddRowBroadcast { input, bias, rows, cols, .. } => {
                if needs(input) {
                    out.push((input, d));
                }
                if needs(bias) {
                    out.push((bias, traced_sum_rows(self, d, rows, cols)));
                }
            }

            TapeOp::SumRows { input, rows, cols, .. } => {
                if needs(input) {
                    out.push((input, traced_broadcast_rows(self, d, rows, cols)));
                }
            }

            TapeOp::BroadcastRows { input, rows, cols, .. } => {
                if needs(input) {
                    out.push((input, traced_sum_rows(self, d, rows, cols)));
                }
            }

            TapeOp::Sum { input, .. } => {
                if needs(input) {
                    let shape = self.bufs[input].shape.clone();
                    out.push((input, traced_fill(self, d, shape)));
                }
            }

            TapeOp::Fill { input, .. } => {
                if needs(input) {
                    out.push((input, traced_sum(self, d)));
                }
            }

            TapeOp::SliceSeq { input, batch, seq, width, start, len, .. } => {
                if needs(input) {
                    let shape = self.bufs[input].shape.clone();
                    out.push((input, traced_pad_seq(self, d, batch, seq, width, start, len, shape)));
                }
            }

            TapeOp::PadSeq { input, batch, seq, width, start, len, .. } => {
                if needs(input) {
                    let shape = self.bufs[input].shape.clone();
                    out.push((input, traced_slice_seq(self, d, batch, seq, width, start, len, shape)));
                }
            }
        }
        out
    }
}

// ── Thread-local tape access (opt-in) ────────────────────────────────

thread_local! {
    static TAPE_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Drop guard that clears the TAPE_ACTIVE flag when scope exits, including
/// on panic. Ensures `is_tape_active()` is never left stale.
struct TapeGuard;

impl Drop for TapeGuard {
    fn drop(&mut self) {
        TAPE_ACTIVE.with(|flag| flag.set(false));
    }
}

/// Execute a closure with a fresh tape. Sets the thread-local active flag
/// for the duration of `f`, making `is_tape_active()` return true. After `f`
/// returns (or panics) the flag is cleared via a drop guard.
pub fn with_tape<F, R>(f: F) -> R
where
    F: FnOnce(&mut Tape) -> R,
{
    TAPE_ACTIVE.with(|flag| {
        debug_assert!(!flag.get(), "nested with_tape() calls are not supported");
        flag.set(true);
    });

    let _guard = TapeGuard;
    let mut tape = Tape::new();
    f(&mut tape)
    // _guard dropped here, resetting flag even on panic.
}

/// Check if a tape is currently active on this thread.
pub fn is_tape_active() -> bool {
    TAPE_ACTIVE.with(|flag| flag.get())
}

// ── Tests ────────────────────────────────────────────────────────────
