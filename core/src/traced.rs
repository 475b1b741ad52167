/// Traced wrappers: tape-aware computation that records ops for backward.
///
/// Each wrapper:
///   1. Reads inputs from tape arena (clones to release borrow)
///   2. Calls the real tensor function
///   3. Allocates output in tape arena
///   4. Records the TapeOp (dropped by the tape if no input requires grad)
///   5. Returns the output BufId
///
/// The tape's own VJP rules are written with these wrappers, which is what
/// makes `Tape::grad(.., create_graph = true)` differentiable a second time.

use crate::tape::{BufId, Tape, TapeOp};
use crate::tensor::{
    abs_f32, add_f32, add_row_broadcast_f32, matmul_f32, matmul_transpose_b_f32, mul_f32,
    row_count, scale_f32, sign_f32, sub_f32, sum_f32, sum_rows_f32, transpose_f32,
};

// ── Linear algebra ───────────────────────────────────────────────────

/// Matrix multiply: out = A @ B, A: [m, k], B: [k, n].
pub fn traced_matmul(
    tape: &mut Tape,
    a: BufId,
    b: BufId,
    m: usize,
    k: usize,
    n: usize,
) -> BufId {
    let a_data = tape.buf_data(a).to_vec();
    let b_data = tape.buf_data(b).to_vec();
    let mut out = vec![0.0f32; m * n];
    matmul_f32(&a_data, &b_data, &mut out, m, k, n);
    tape.record_with_output(out, vec![m, n], |out_id| {
        TapeOp::Matmul { a, b, out: out_id, m, k, n }
    })
}

/// Matrix multiply with transposed B: out = A @ B^T, A: [m, k], B: [n, k].
pub fn traced_matmul_transpose_b(
    tape: &mut Tape,
    a: BufId,
    b: BufId,
    m: usize,
    k: usize,
    n: usize,
) -> BufId {
    let a_data = tape.buf_data(a).to_vec();
    let b_data = tape.buf_data(b).to_vec();
    let mut out = vec![0.0f32; m * n];
    matmul_transpose_b_f32(&a_data, &b_data, &mut out, m, k, n);
    tape.record_with_output(out, vec![m, n], |out_id| {
        TapeOp::MatmulTransposeB { a, b, out: out_id, m, k, n }
    })
}

/// Transpose: out = A^T, A: [rows, cols].
pub fn traced_transpose(tape: &mut Tape, input: BufId, rows: usize, cols: usize) -> BufId {
    let data = tape.buf_data(input).to_vec();
    let mut out = vec![0.0f32; rows * cols];
    transpose_f32(&data, &mut out, rows, cols);
    tape.record_with_output(out, vec![cols, rows], |out_id| {
        TapeOp::Transpose { input, out: out_id, rows, cols }
    })
}

// ── Element-wise ─────────────────────────────────────────────────────

/// Element-wise add: out = a + b.
pub fn traced_add(tape: &mut Tape, a: BufId, b: BufId) -> BufId {
    let a_data = tape.buf_data(a).to_vec();
    let b_data = tape.buf_data(b).to_vec();
    let mut out = vec![0.0f32; a_data.len()];
    add_f32(&a_data, &b_data, &mut out);
    let shape = tape.buf_shape(a).to_vec();
    tape.record_with_output(out, shape, |out_id| {
        TapeOp::Add { a, b, out: out_id }
    })
}

/// Element-wise subtract: out = a - b.
pub fn traced_sub(tape: &mut Tape, a: BufId, b: BufId) -> BufId {
    let a_data = tape.buf_data(a).to_vec();
    let b_data = tape.buf_data(b).to_vec();
    let mut out = vec![0.0f32; a_data.len()];
    sub_f32(&a_data, &b_data, &mut out);
    let shape = tape.buf_shape(a).to_vec();
    tape.record_with_output(out, shape, |out_id| {
        TapeOp::Sub { a, b, out: out_id }
    })
}

/// Element-wise multiply: out = a * b.
pub fn traced_mul(tape: &mut Tape, a: BufId, b: BufId) -> BufId {
    let a_data = tape.buf_data(a).to_vec();
    let b_data = tape.buf_data(b).to_vec();
    let mut out = vec![0.0f32; a_data.len()];
    mul_f32(&a_data, &b_data, &mut out);
    let shape = tape.buf_shape(a).to_vec();
    tape.record_with_output(out, shape, |out_id| {
        TapeOp::Mul { a, b, out: out_id }
    })
}

/// Scalar multiply: out = scalar * input.
pub fn traced_scale(tape: &mut Tape, input: BufId, scalar: f32) -> BufId {
    let data = tape.buf_data(input).to_vec();
    let mut out = vec![0.0f32; data.len()];
    scale_f32(&data, scalar, &mut out);
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| {
        TapeOp::Scale { input, scalar, out: out_id }
    })
}

pub fn traced_abs(tape: &mut Tape, input: BufId) -> BufId {
    let data = tape.buf_data(input).to_vec();
    let mut out = vec![0.0f32; data.len()];
    abs_f32(&data, &mut out);
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| {
        TapeOp::Abs { input, out: out_id }
    })
}

pub fn traced_sign(tape: &mut Tape, input: BufId) -> BufId {
    let data = tape.buf_data(input).to_vec();
    let mut out = vec![0.0f32; data.len()];
    sign_f32(&data, &mut out);
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| {
        TapeOp::Sign { input, out: out_id }
    })
}

// ── Broadcast / reductions ───────────────────────────────────────────

/// Bias add over rows: out[r, c] = input[r, c] + bias[c].
pub fn traced_add_row_broadcast(
    tape: &mut Tape,
    input: BufId,
    bias: BufId,
    rows: usize,
    cols: usize,
) -> BufId {
    let data = tape.buf_data(input).to_vec();
    let bias_data = tape.buf_data(bias).to_vec();
    let mut out = vec![0.0f32; rows * cols];
    add_row_broadcast_f32(&data, &bias_data, &mut out, rows, cols);
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| {
        TapeOp::AddRowBroadcast { input, bias, out: out_id, rows, cols }
    })
}

/// Column sums: out[c] = sum_r input[r, c].
pub fn traced_sum_rows(tape: &mut Tape, input: BufId, rows: usize, cols: usize) -> BufId {
    let data = tape.buf_data(input).to_vec();
    let mut out = vec![0.0f32; cols];
    sum_rows_f32(&data, &mut out, rows, cols);
    tape.record_with_output(out, vec![cols], |out_id| {
        TapeOp::SumRows { input, out: out_id, rows, cols }
    })
}

/// Repeat a [cols] vector over `rows` rows.
pub fn traced_broadcast_rows(tape: &mut Tape, input: BufId, rows: usize, cols: usize) -> BufId {
    let data = tape.buf_data(input).to_vec();
    debug_assert_eq!(data.len(), cols);
    let mut out = Vec::with_capacity(rows * cols);
    for _ in 0..rows {
        out.extend_from_slice(&data);
    }
    tape.record_with_output(out, vec![rows, cols], |out_id| {
        TapeOp::BroadcastRows { input, out: out_id, rows, cols }
    })
}

/// Sum of all elements → [1].
pub fn traced_sum(tape: &mut Tape, input: BufId) -> BufId {
    let total = sum_f32(tape.buf_data(input));
    tape.record_with_output(vec![total], vec![1], |out_id| {
        TapeOp::Sum { input, out: out_id }
    })
}

/// Broadcast a one-element buffer to `shape`.
pub fn traced_fill(tape: &mut Tape, input: BufId, shape: Vec<usize>) -> BufId {
    let value = tape.buf_data(input)[0];
    let n: usize = shape.iter().product();
    tape.record_with_output(vec![value; n], shape, |out_id| {
        TapeOp::Fill { input, out: out_id }
    })
}

// ── Sequence slicing ─────────────────────────────────────────────────

/// View a [.., seq, width] shape as (batch, seq, width).
/// Rank-2 shapes are a batch of one; rank-1 shapes are one row.
pub fn seq_dims(shape: &[usize]) -> (usize, usize, usize) {
    match shape.len() {
        0 => (1, 1, 1),
        1 => (1, 1, shape[0]),
        n => {
            let batch = shape[..n - 2].iter().product();
            (batch, shape[n - 2], shape[n - 1])
        }
    }
}

fn with_seq_len(full_shape: &[usize], len: usize) -> Vec<usize> {
    let mut shape = full_shape.to_vec();
    let n = shape.len();
    if n >= 2 {
        shape[n - 2] = len;
    }
    shape
}

/// out = input[:, start..start+len, :] for input viewed as [batch, seq, width].
/// `full_shape` is the shape of the unsliced tensor; the output keeps its rank.
#[allow(clippy::too_many_arguments)]
pub fn traced_slice_seq(
    tape: &mut Tape,
    input: BufId,
    batch: usize,
    seq: usize,
    width: usize,
    start: usize,
    len: usize,
    full_shape: Vec<usize>,
) -> BufId {
    assert!(start + len <= seq, "traced_slice_seq: window {start}..{} exceeds seq {seq}", start + len);
    let data = tape.buf_data(input).to_vec();
    debug_assert_eq!(data.len(), batch * seq * width);
    let mut out = Vec::with_capacity(batch * len * width);
    for b in 0..batch {
        let base = (b * seq + start) * width;
        out.extend_from_slice(&data[base..base + len * width]);
    }
    tape.record_with_output(out, with_seq_len(&full_shape, len), |out_id| {
        TapeOp::SliceSeq { input, out: out_id, batch, seq, width, start, len }
    })
}

/// Scatter a [batch, len, width] window into zeros of [batch, seq, width].
#[allow(clippy::too_many_arguments)]
pub fn traced_pad_seq(
    tape: &mut Tape,
    input: BufId,
    batch: usize,
    seq: usize,
    width: usize,
    start: usize,
    len: usize,
    full_shape: Vec<usize>,
) -> BufId {
    let data = tape.buf_data(input).to_vec();
    debug_assert_eq!(data.len(), batch * len * width);
    let mut out = vec![0.0f32; batch * seq * width];
    for b in 0..batch {
        let src = b * len * width;
        let dst = (b * seq + start) * width;
        out[dst..dst + len * width].copy_from_slice(&data[src..src + len * width]);
    }
    tape.record_with_output(out, full_shape, |out_id| {
        TapeOp::PadSeq { input, out: out_id, batch, seq, width, start, len }
    })
}

/// Slice positions `start..start+len` of the sequence axis, reading dims from the buffer.
pub fn traced_chunk(tape: &mut Tape, input: BufId, start: usize, len: usize) -> BufId {
    let full_shape = tape.buf_shape(input).to_vec();
    let (batch, seq, width) = seq_dims(&full_shape);
    traced_slice_seq(tape, input, batch, seq, width, start, len, full_shape)
}

// ── Composites ───────────────────────────────────────────────────────

/// Affine map on the last dim: out = x @ W^T + b, W: [d_out, d_in], b: [d_out].
/// Leading dims of `x` are preserved.
pub fn traced_linear(tape: &mut Tape, x: BufId, w: BufId, b: Option<BufId>, d_in: usize, d_out: usize) -> BufId {
    let in_shape = tape.buf_shape(x).to_vec();
    let rows = row_count(&in_shape);
    debug_assert_eq!(tape.buf_numel(x), rows * d_in);
    let mut out_shape = in_shape;
    match out_shape.last_mut() {
        Some(last) => *last = d_out,
        None => out_shape.push(d_out),
    }

    let xw = traced_matmul_transpose_b(tape, x, w, rows, d_in, d_out);
    let out = match b {
        Some(b) => traced_add_row_broadcast(tape, xw, b, rows, d_out),
        None => xw,
    };
    tape.set_shape(out, out_shape);
    out
}

/// How a loss folds its element-wise terms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reduction {
    Sum,
    Mean,
}

fn reduce(tape: &mut Tape, terms: BufId, reduction: Reduction) -> BufId {
    let total = traced_sum(tape, terms);
    match reduction {
        Reduction::Sum => total,
        Reduction::Mean => {
            let n = tape.buf_numel(terms).max(1);
            traced_scale(tape, total, 1.0 / n as f32)
        }
    }
}

/// L1 loss: reduce(|prediction - target|) → [1].
pub fn traced_l1_loss(tape: &mut Tape, prediction: BufId, target: BufId, reduction: Reduction) -> BufId {
    let diff = traced_sub(tape, prediction, target);
    let abs = traced_abs(tape, diff);
    reduce(tape, abs, reduction)
}

/// Squared-error loss: reduce((prediction - target)^2) → [1].
pub fn traced_mse_loss(tape: &mut Tape, prediction: BufId, target: BufId, reduction: Reduction) -> BufId {
    let diff = traced_sub(tape, prediction, target);
    let sq = traced_mul(tape, diff, diff);
    reduce(tape, sq, reduction)
}
