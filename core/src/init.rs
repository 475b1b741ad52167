/// Parameter fill strategies.
///
/// Memory weights use variance-scaling (Xavier/Glorot) so the initial
/// prediction `k @ W^T` keeps the key's scale. Projection layers use the
/// fan-in uniform scheme of a standard affine layer.

use serde::{Deserialize, Serialize};
use crate::tensor::SimpleRng;

/// How to fill a freshly allocated weight tensor.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Init {
    /// N(0, gain^2 * 2 / (fan_in + fan_out)).
    XavierNormal { gain: f32 },
    /// U(-1/sqrt(fan_in), 1/sqrt(fan_in)); used for affine weight and bias.
    FanInUniform,
    Zeros,
}

impl Default for Init {
    fn default() -> Self {
        Init::XavierNormal { gain: 1.0 }
    }
}

impl Init {
    /// Fill `buf` in place. `fan_in`/`fan_out` describe a [fan_out, fan_in] matrix.
    pub fn fill(&self, rng: &mut SimpleRng, buf: &mut [f32], fan_in: usize, fan_out: usize) {
        let fans = (fan_in + fan_out).max(1) as f32;
        match *self {
            Init::XavierNormal { gain } => {
                rng.fill_normal(buf, gain * (2.0 / fans).sqrt());
            }
            Init::FanInUniform => {
                rng.fill_uniform(buf, 1.0 / (fan_in.max(1) as f32).sqrt());
            }
            Init::Zeros => buf.fill(0.0),
        }
    }
}
