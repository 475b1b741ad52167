/// Outer-loop gradient orchestration and verification.
///
/// Provides:
/// - `compute_gradients`: loss and projection gradients through condition + read
/// - `outer_loss`: the same loss without a backward pass
/// - `finite_diff_gradient`: central finite differences for verification
/// - `check_weight_gradient`: sampled analytical-vs-numerical comparison
///
/// Every call works on a clone of the unit, so the caller's memory state is
/// the starting point of each evaluation and is never advanced.

use tracing::warn;

use crate::memory_store::{MemoryError, MemoryVariant};
use crate::model::ProjectionParams;
use crate::neural_memory::NeuralMemoryUnit;
use crate::tape::{with_tape, BufId, Tape};
use crate::tensor::Tensor;
use crate::traced::{traced_mse_loss, Reduction};

/// Names of the projection buffers, in `ProjectionParams::buffers` order.
pub const PROJECTION_NAMES: [&str; 6] = ["w_k", "b_k", "w_v", "b_v", "w_q", "b_q"];

/// One outer training example: condition on `context`, read at `query`,
/// compare against `target` with mean squared error.
#[derive(Clone, Debug)]
pub struct OuterSample {
    pub context: Tensor,
    pub query: Tensor,
    pub target: Tensor,
}

fn run<V: MemoryVariant + Clone>(
    unit: &mut NeuralMemoryUnit<V>,
    tape: &mut Tape,
    sample: &OuterSample,
) -> Result<BufId, MemoryError> {
    let x = tape.register_input(&sample.context.data, sample.context.shape.clone());
    let q = tape.register_input(&sample.query.data, sample.query.shape.clone());
    let t = tape.register_input(&sample.target.data, sample.target.shape.clone());
    unit.condition(tape, x)?;
    let y = unit.forward(tape, q, true)?;
    if tape.buf_numel(y) != tape.buf_numel(t) {
        return Err(MemoryError::InvalidInput {
            shape: sample.target.shape.clone(),
            reason: format!("target must match the read of {} elements", tape.buf_numel(y)),
        });
    }
    Ok(traced_mse_loss(tape, y, t, Reduction::Mean))
}

/// Loss and projection gradients of one sample.
pub fn compute_gradients<V: MemoryVariant + Clone>(
    unit: &NeuralMemoryUnit<V>,
    sample: &OuterSample,
) -> Result<(f32, ProjectionParams), MemoryError> {
    let mut unit = unit.clone();
    with_tape(|tape| -> Result<(f32, ProjectionParams), MemoryError> {
        let loss = run(&mut unit, tape, sample)?;
        tape.backward(loss);
        Ok((tape.buf_data(loss)[0], unit.projection_grads(tape)))
    })
}

/// Loss of one sample, no gradients.
pub fn outer_loss<V: MemoryVariant + Clone>(
    unit: &NeuralMemoryUnit<V>,
    sample: &OuterSample,
) -> Result<f32, MemoryError> {
    let mut unit = unit.clone();
    let mut tape = Tape::new();
    let loss = run(&mut unit, &mut tape, sample)?;
    Ok(tape.buf_data(loss)[0])
}

/// One outer SGD step on the projections. Returns the loss before the step.
pub fn sgd_step<V: MemoryVariant + Clone>(
    unit: &mut NeuralMemoryUnit<V>,
    sample: &OuterSample,
    lr: f32,
) -> Result<f32, MemoryError> {
    let (loss, grads) = compute_gradients(unit, sample)?;
    unit.apply_weight_gradients(&grads, lr);
    Ok(loss)
}

/// Central difference (f(x+eps) - f(x-eps)) / (2*eps) for element `idx` of
/// projection buffer `which`.
pub fn finite_diff_gradient<V: MemoryVariant + Clone>(
    unit: &NeuralMemoryUnit<V>,
    sample: &OuterSample,
    which: usize,
    idx: usize,
    eps: f32,
) -> Result<f32, MemoryError> {
    let eval = |delta: f32| -> Result<f32, MemoryError> {
        let mut params = unit.params().clone();
        let mut bufs = params.buffers_mut();
        bufs[which][idx] += delta;
        let mut shifted = unit.clone();
        shifted.set_params(params)?;
        outer_loss(&shifted, sample)
    };
    Ok((eval(eps)? - eval(-eps)?) / (2.0 * eps))
}

/// Check the analytical gradient of one projection buffer against finite
/// differences at up to `num_samples` evenly strided elements.
/// Returns (num_checked, num_passed, max_relative_error).
///
/// Relative error uses denominator = max(|a|, |b|); pairs where both sides
/// are below `abs_threshold` pass automatically (below FD resolution).
pub fn check_weight_gradient<V: MemoryVariant + Clone>(
    unit: &NeuralMemoryUnit<V>,
    sample: &OuterSample,
    grads: &ProjectionParams,
    which: usize,
    num_samples: usize,
    eps: f32,
    tol: f32,
) -> Result<(usize, usize, f32), MemoryError> {
    let abs_threshold = 5e-4;
    let grad_vec = grads.buffers()[which];
    let n = grad_vec.len();
    let step = if n > num_samples { n / num_samples } else { 1 };

    let mut checked = 0;
    let mut passed = 0;
    let mut max_rel_err = 0.0f32;
    for idx in (0..n).step_by(step).take(num_samples) {
        let analytical = grad_vec[idx];
        let numerical = finite_diff_gradient(unit, sample, which, idx, eps)?;
        checked += 1;

        let denom = analytical.abs().max(numerical.abs());
        if denom < abs_threshold {
            passed += 1;
            continue;
        }
        let rel_err = (analytical - numerical).abs() / denom;
        max_rel_err = max_rel_err.max(rel_err);
        if rel_err < tol {
            passed += 1;
        } else {
            warn!(
                weight = PROJECTION_NAMES[which], idx, analytical, numerical, rel_err,
                "gradient check mismatch"
            );
        }
    }
    Ok((checked, passed, max_rel_err))
}
