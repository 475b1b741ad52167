/// Neural memory configuration and outer-loop parameters.
///
/// The memory weights themselves live in `MemoryStore`; this module holds
/// what the outer optimiser owns: the key, value and query affine maps.
/// All weight matrices are flat Vec<f32> in row-major layout.

use serde::{Deserialize, Serialize};

use crate::init::Init;
use crate::memory_store::MemoryError;
use crate::tensor::SimpleRng;

fn default_lr() -> f32 {
    1e-3
}

fn default_eta() -> f32 {
    0.9
}

fn default_alpha() -> f32 {
    0.1
}

/// Model configuration, immutable after construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NeuralMemoryConfig {
    pub dim_in: usize,
    pub dim_out: usize,
    /// Positions per memory update. `None` conditions on the whole sequence at once.
    #[serde(default)]
    pub update_chunk_size: Option<usize>,
    /// Inner-loop step size applied to each surprise gradient.
    #[serde(default = "default_lr")]
    pub lr: f32,
    /// Surprise momentum.
    #[serde(default = "default_eta")]
    pub eta: f32,
    /// Weight decay (forgetting) per update.
    #[serde(default = "default_alpha")]
    pub alpha: f32,
}

impl NeuralMemoryConfig {
    pub fn new(dim_in: usize, dim_out: usize) -> Self {
        NeuralMemoryConfig {
            dim_in,
            dim_out,
            update_chunk_size: None,
            lr: default_lr(),
            eta: default_eta(),
            alpha: default_alpha(),
        }
    }

    /// Test configuration: tiny memory for fast iteration.
    pub fn test_config() -> Self {
        NeuralMemoryConfig {
            dim_in: 4,
            dim_out: 4,
            update_chunk_size: Some(2),
            lr: 0.1,
            eta: default_eta(),
            alpha: default_alpha(),
        }
    }

    pub fn with_chunk_size(mut self, chunk: usize) -> Self {
        self.update_chunk_size = Some(chunk);
        self
    }

    pub fn with_lr(mut self, lr: f32) -> Self {
        self.lr = lr;
        self
    }

    pub fn validate(&self) -> Result<(), MemoryError> {
        let bad = |msg: String| Err(MemoryError::InvalidConfig(msg));
        if self.dim_in == 0 || self.dim_out == 0 {
            return bad(format!("dims must be positive, got dim_in={} dim_out={}", self.dim_in, self.dim_out));
        }
        if self.update_chunk_size == Some(0) {
            return bad("update_chunk_size must be positive".into());
        }
        if !self.lr.is_finite() {
            return bad(format!("lr must be finite, got {}", self.lr));
        }
        if !(0.0..=1.0).contains(&self.eta) {
            return bad(format!("eta must lie in [0, 1], got {}", self.eta));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return bad(format!("alpha must lie in [0, 1], got {}", self.alpha));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, MemoryError> {
        let cfg: NeuralMemoryConfig = serde_json::from_str(json)
            .map_err(|e| MemoryError::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json(&self) -> Result<String, MemoryError> {
        serde_json::to_string_pretty(self).map_err(|e| MemoryError::InvalidConfig(e.to_string()))
    }
}

/// Outer-loop learnable parameters as flat Vec<f32>.
///
/// Layout (row-major):
///   w_k: [dim_in, dim_in]   b_k: [dim_in]
///   w_v: [dim_out, dim_in]  b_v: [dim_out]
///   w_q: [dim_in, dim_in]   b_q: [dim_in]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectionParams {
    pub w_k: Vec<f32>,
    pub b_k: Vec<f32>,
    pub w_v: Vec<f32>,
    pub b_v: Vec<f32>,
    pub w_q: Vec<f32>,
    pub b_q: Vec<f32>,
}

impl ProjectionParams {
    /// Standard affine init: weight and bias ~ U(-1/sqrt(dim_in), 1/sqrt(dim_in)).
    pub fn init(cfg: &NeuralMemoryConfig, seed: u64) -> Self {
        let mut rng = SimpleRng::new(seed);
        let (d, o) = (cfg.dim_in, cfg.dim_out);
        let mut fill = |n: usize, fan_out: usize| {
            let mut buf = vec![0.0f32; n];
            Init::FanInUniform.fill(&mut rng, &mut buf, d, fan_out);
            buf
        };
        let w_k = fill(d * d, d);
        let b_k = fill(d, d);
        let w_v = fill(o * d, o);
        let b_v = fill(o, o);
        let w_q = fill(d * d, d);
        let b_q = fill(d, d);
        ProjectionParams { w_k, b_k, w_v, b_v, w_q, b_q }
    }

    /// Create a zero-initialized shadow for gradient accumulation.
    pub fn zeros_like(cfg: &NeuralMemoryConfig) -> Self {
        let (d, o) = (cfg.dim_in, cfg.dim_out);
        ProjectionParams {
            w_k: vec![0.0; d * d],
            b_k: vec![0.0; d],
            w_v: vec![0.0; o * d],
            b_v: vec![0.0; o],
            w_q: vec![0.0; d * d],
            b_q: vec![0.0; d],
        }
    }

    pub fn num_params(&self) -> usize {
        self.w_k.len() + self.b_k.len() + self.w_v.len()
            + self.b_v.len() + self.w_q.len() + self.b_q.len()
    }

    /// Outer-loop weight update: param -= lr * grad for every projection.
    pub fn apply_weight_gradients(&mut self, grads: &ProjectionParams, lr: f32) {
        fn step(param: &mut [f32], grad: &[f32], lr: f32) {
            debug_assert_eq!(param.len(), grad.len(), "gradient length differs from its parameter");
            for (p, g) in param.iter_mut().zip(grad) {
                *p -= lr * g;
            }
        }
        step(&mut self.w_k, &grads.w_k, lr);
        step(&mut self.b_k, &grads.b_k, lr);
        step(&mut self.w_v, &grads.w_v, lr);
        step(&mut self.b_v, &grads.b_v, lr);
        step(&mut self.w_q, &grads.w_q, lr);
        step(&mut self.b_q, &grads.b_q, lr);
    }

    /// All buffers in a fixed order, for norms and finite-difference sweeps.
    pub fn buffers(&self) -> [&Vec<f32>; 6] {
        [&self.w_k, &self.b_k, &self.w_v, &self.b_v, &self.w_q, &self.b_q]
    }

    pub fn buffers_mut(&mut self) -> [&mut Vec<f32>; 6] {
        [&mut self.w_k, &mut self.b_k, &mut self.w_v, &mut self.b_v, &mut self.w_q, &mut self.b_q]
    }
}
