//! Neural memory unit integration tests: chunked conditioning against a
//! hand-computed fold, batch inputs, and gradient reachability of the projections.

use approx::assert_abs_diff_eq;

use neural_memory_core::linear_memory::LINEAR_WEIGHT;
use neural_memory_core::tape::Tape;
use neural_memory_core::tensor::{
    add_row_broadcast_f32, matmul_f32, matmul_transpose_b_f32, sign_f32, transpose_f32,
};
use neural_memory_core::traced::{traced_mse_loss, Reduction};
use neural_memory_core::{MemoryError, NeuralMemoryConfig, NeuralMemoryUnit};

fn make_input(seq: usize, d: usize, phase: f32) -> Vec<f32> {
    (0..seq * d).map(|i| ((i as f32) * 0.73 + phase).sin() * 1.5).collect()
}

fn affine(x: &[f32], w: &[f32], b: &[f32], rows: usize, d_in: usize, d_out: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; rows * d_out];
    matmul_transpose_b_f32(x, w, &mut out, rows, d_in, d_out);
    let mut biased = vec![0.0f32; rows * d_out];
    add_row_broadcast_f32(&out, b, &mut biased, rows, d_out);
    biased
}

/// Plain-arithmetic replay of `condition`. Each entry of `chunks` holds the
/// rows of one chunk. Returns (final memory weight, final surprise, total surprise).
fn reference_fold(unit: &NeuralMemoryUnit, chunks: &[Vec<f32>]) -> (Vec<f32>, Vec<f32>, f32) {
    let cfg = unit.config();
    let (d, o) = (cfg.dim_in, cfg.dim_out);
    let p = unit.params();
    let lr = unit.memory().lr();
    let mut m = unit.memory().weight(LINEAR_WEIGHT).unwrap().data.clone();
    let mut s = vec![0.0f32; o * d];
    let mut total = 0.0f32;

    for rows in chunks {
        let n = rows.len() / d;
        let k = affine(rows, &p.w_k, &p.b_k, n, d, d);
        let v = affine(rows, &p.w_v, &p.b_v, n, d, o);
        let mut pred = vec![0.0f32; n * o];
        matmul_transpose_b_f32(&k, &m, &mut pred, n, d, o);

        let diff: Vec<f32> = pred.iter().zip(&v).map(|(a, b)| a - b).collect();
        total += diff.iter().map(|x| x.abs()).sum::<f32>();

        // g = sign(pred - v)^T @ k  → [o, d]
        let mut sign = vec![0.0f32; n * o];
        sign_f32(&diff, &mut sign);
        let mut sign_t = vec![0.0f32; o * n];
        transpose_f32(&sign, &mut sign_t, n, o);
        let mut g = vec![0.0f32; o * d];
        matmul_f32(&sign_t, &k, &mut g, o, n, d);

        for i in 0..o * d {
            s[i] = cfg.eta * s[i] + lr * g[i];
            m[i] = (1.0 - cfg.alpha) * m[i] + s[i];
        }
    }
    (m, s, total)
}

fn split_rows(x: &[f32], d: usize, chunk: usize) -> Vec<Vec<f32>> {
    x.chunks(chunk * d).map(|c| c.to_vec()).collect()
}

fn assert_all_close(actual: &[f32], expected: &[f32], eps: f32) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert_abs_diff_eq!(*a, *e, epsilon = eps);
    }
}

// ── Update counts ────────────────────────────────────────────────────

#[test]
fn test_update_count_is_ceil_of_seq_over_chunk() {
    for (seq, chunk) in [(1, 1), (4, 2), (5, 2), (7, 3), (6, 6), (3, 8)] {
        let cfg = NeuralMemoryConfig::new(3, 3).with_chunk_size(chunk);
        let mut unit = NeuralMemoryUnit::new(cfg, 1).unwrap();
        let mut tape = Tape::new();
        let x = tape.register_input(&make_input(seq, 3, 0.0), vec![seq, 3]);
        unit.condition(&mut tape, x).unwrap();
        assert_eq!(unit.memory().update_count(), seq.div_ceil(chunk), "seq={seq} chunk={chunk}");
    }
}

#[test]
fn test_no_chunk_size_means_single_update() {
    let mut unit = NeuralMemoryUnit::new(NeuralMemoryConfig::new(4, 4), 2).unwrap();
    let mut tape = Tape::new();
    let x = tape.register_input(&make_input(9, 4, 0.2), vec![9, 4]);
    unit.condition(&mut tape, x).unwrap();
    assert_eq!(unit.memory().update_count(), 1);
}

// ── Sequential semantics ─────────────────────────────────────────────

#[test]
fn test_dim4_chunk2_five_positions() {
    let cfg = NeuralMemoryConfig::new(4, 4).with_chunk_size(2).with_lr(0.1);
    let mut unit = NeuralMemoryUnit::new(cfg, 17).unwrap();
    let x = make_input(5, 4, 0.5);
    let (expected_m, _, expected_total) = reference_fold(&unit, &split_rows(&x, 4, 2));

    let mut tape = Tape::new();
    let xid = tape.register_input(&x, vec![5, 4]);
    let total = unit.condition(&mut tape, xid).unwrap();

    assert_eq!(unit.memory().update_count(), 3);
    assert_abs_diff_eq!(total, expected_total, epsilon = 1e-4);
    assert_all_close(&unit.memory().weight(LINEAR_WEIGHT).unwrap().data, &expected_m, 1e-5);
}

#[test]
fn test_later_chunks_see_updated_memory() {
    // Conditioning chunk by chunk on separate calls gives the same memory as
    // one call over the whole sequence.
    let cfg = NeuralMemoryConfig::new(3, 2).with_chunk_size(2).with_lr(0.05);
    let x = make_input(6, 3, 1.0);

    let mut whole = NeuralMemoryUnit::new(cfg.clone(), 5).unwrap();
    let mut tape = Tape::new();
    let xid = tape.register_input(&x, vec![6, 3]);
    let total_whole = whole.condition(&mut tape, xid).unwrap();

    let mut pieces = NeuralMemoryUnit::new(cfg, 5).unwrap();
    let mut total_pieces = 0.0;
    let mut tape = Tape::new();
    for rows in split_rows(&x, 3, 2) {
        let id = tape.register_input(&rows, vec![2, 3]);
        total_pieces += pieces.condition(&mut tape, id).unwrap();
    }

    assert_abs_diff_eq!(total_whole, total_pieces, epsilon = 1e-5);
    assert_all_close(
        &whole.memory().weight(LINEAR_WEIGHT).unwrap().data,
        &pieces.memory().weight(LINEAR_WEIGHT).unwrap().data,
        1e-6,
    );
    assert_eq!(pieces.memory().update_count(), 3);
}

#[test]
fn test_surprise_state_matches_fold() {
    let cfg = NeuralMemoryConfig::new(4, 3).with_chunk_size(3).with_lr(0.2);
    let mut unit = NeuralMemoryUnit::new(cfg, 8).unwrap();
    let x = make_input(6, 4, 0.0);
    let (_, expected_s, _) = reference_fold(&unit, &split_rows(&x, 4, 3));

    let mut tape = Tape::new();
    let xid = tape.register_input(&x, vec![6, 4]);
    unit.condition(&mut tape, xid).unwrap();

    let s = unit.memory().surprise(LINEAR_WEIGHT).unwrap();
    assert_eq!(s.shape, vec![3, 4]);
    assert!(s.data.iter().any(|&v| v != 0.0));
    assert_all_close(&s.data, &expected_s, 1e-5);
}

#[test]
fn test_tape_growth_per_chunk_is_constant() {
    // Every chunk after the first records the same ops, however long the
    // tape already is.
    let cfg = NeuralMemoryConfig::new(4, 4).with_chunk_size(1).with_lr(0.1);
    let ops: Vec<usize> = (2..=8)
        .map(|seq| {
            let mut unit = NeuralMemoryUnit::new(cfg.clone(), 6).unwrap();
            let mut tape = Tape::new();
            let x = tape.register_input(&make_input(seq, 4, 0.4), vec![seq, 4]);
            unit.condition(&mut tape, x).unwrap();
            tape.num_ops()
        })
        .collect();
    let per_chunk: Vec<usize> = ops.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(per_chunk.iter().all(|&n| n == per_chunk[0]), "ops per sequence length: {ops:?}");
}

// ── Batched input ────────────────────────────────────────────────────

#[test]
fn test_batch_of_one_matches_rank2() {
    let cfg = NeuralMemoryConfig::new(4, 4).with_chunk_size(2);
    let x = make_input(5, 4, 0.3);

    let mut flat = NeuralMemoryUnit::new(cfg.clone(), 9).unwrap();
    let mut tape = Tape::new();
    let id = tape.register_input(&x, vec![5, 4]);
    let t_flat = flat.condition(&mut tape, id).unwrap();

    let mut batched = NeuralMemoryUnit::new(cfg, 9).unwrap();
    let mut tape = Tape::new();
    let id = tape.register_input(&x, vec![1, 5, 4]);
    let t_batched = batched.condition(&mut tape, id).unwrap();

    assert_eq!(t_flat, t_batched);
    assert_eq!(
        flat.memory().weight(LINEAR_WEIGHT).unwrap(),
        batched.memory().weight(LINEAR_WEIGHT).unwrap(),
    );
}

#[test]
fn test_batch_chunks_slice_the_sequence_axis() {
    let (batch, seq, d, chunk) = (2, 5, 3, 2);
    let cfg = NeuralMemoryConfig::new(d, d).with_chunk_size(chunk).with_lr(0.1);
    let mut unit = NeuralMemoryUnit::new(cfg, 4).unwrap();
    let x = make_input(batch * seq, d, 0.9);

    // Chunk i gathers positions i*chunk.. of every batch element.
    let mut chunks = Vec::new();
    for start in (0..seq).step_by(chunk) {
        let len = chunk.min(seq - start);
        let mut rows = Vec::new();
        for b in 0..batch {
            let base = (b * seq + start) * d;
            rows.extend_from_slice(&x[base..base + len * d]);
        }
        chunks.push(rows);
    }
    let (expected_m, _, expected_total) = reference_fold(&unit, &chunks);

    let mut tape = Tape::new();
    let id = tape.register_input(&x, vec![batch, seq, d]);
    let total = unit.condition(&mut tape, id).unwrap();

    assert_eq!(unit.memory().update_count(), 3);
    assert_abs_diff_eq!(total, expected_total, epsilon = 1e-4);
    assert_all_close(&unit.memory().weight(LINEAR_WEIGHT).unwrap().data, &expected_m, 1e-5);

    let q = tape.register_input(&make_input(seq, d, 0.1), vec![seq, d]);
    let y = unit.forward(&mut tape, q, true).unwrap();
    assert_eq!(tape.buf_shape(y), &[seq, d]);
}

// ── Gradient reachability ────────────────────────────────────────────

#[test]
fn test_all_projections_receive_gradients() {
    let cfg = NeuralMemoryConfig::new(4, 4).with_chunk_size(2).with_lr(0.1);
    let mut unit = NeuralMemoryUnit::new(cfg, 21).unwrap();
    let mut tape = Tape::new();
    let x = tape.register_input(&make_input(6, 4, 0.0), vec![6, 4]);
    unit.condition(&mut tape, x).unwrap();

    let q = tape.register_input(&make_input(3, 4, 2.0), vec![3, 4]);
    let target = tape.register_input(&[0.5; 12], vec![3, 4]);
    let y = unit.forward(&mut tape, q, true).unwrap();
    let loss = traced_mse_loss(&mut tape, y, target, Reduction::Mean);
    tape.backward(loss);

    let ids = unit.register_params(&mut tape);
    let nonzero = |g: &[f32]| g.iter().any(|&v| v != 0.0);
    assert!(nonzero(tape.get_grad(ids.w_k).expect("key projection has a gradient")));
    assert!(nonzero(tape.get_grad(ids.w_q).expect("query projection has a gradient")));

    // The value projection only reaches the read through sign(pred - v):
    // present, and exactly zero.
    let g_v = tape.get_grad(ids.w_v).expect("value projection has a gradient");
    assert!(g_v.iter().all(|&v| v == 0.0));
    assert!(tape.get_grad(ids.b_v).is_some());

    let grads = unit.projection_grads(&tape);
    assert_eq!(grads.w_k, tape.get_grad(ids.w_k).unwrap());
}

#[test]
fn test_memory_weights_are_not_params() {
    let mut unit = NeuralMemoryUnit::new(NeuralMemoryConfig::test_config(), 3).unwrap();
    let mut tape = Tape::new();
    let x = tape.register_input(&make_input(4, 4, 0.0), vec![4, 4]);
    unit.condition(&mut tape, x).unwrap();
    let ids = unit.register_params(&mut tape);
    assert!(tape.is_param(ids.w_k));

    let mut view = unit.memory().clone();
    let w = view.weight_nodes(&mut tape)[0];
    assert!(!tape.is_param(w));
    assert!(tape.requires_grad(w));
}

// ── Errors ───────────────────────────────────────────────────────────

#[test]
fn test_config_errors_surface_at_construction() {
    let err = NeuralMemoryUnit::new(NeuralMemoryConfig::new(4, 4).with_chunk_size(0), 1).unwrap_err();
    assert!(matches!(err, MemoryError::InvalidConfig(_)));
    let err = NeuralMemoryUnit::new(NeuralMemoryConfig::new(4, 0), 1).unwrap_err();
    assert!(matches!(err, MemoryError::InvalidConfig(_)));
}

#[test]
fn test_wrong_width_leaves_memory_untouched() {
    let mut unit = NeuralMemoryUnit::new(NeuralMemoryConfig::test_config(), 3).unwrap();
    let before = unit.memory().weight(LINEAR_WEIGHT).unwrap().clone();
    let mut tape = Tape::new();
    let x = tape.register_input(&make_input(4, 3, 0.0), vec![4, 3]);
    let err = unit.condition(&mut tape, x).unwrap_err();
    assert!(matches!(err, MemoryError::InvalidInput { .. }));
    assert_eq!(unit.memory().weight(LINEAR_WEIGHT).unwrap(), &before);
}
