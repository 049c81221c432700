use tracing::debug;

use crate::layer::Param;

pub const DEFAULT_LEARNING_RATE: f32 = 1e-3;
pub const DEFAULT_BETA1: f32 = 0.9;
pub const DEFAULT_BETA2: f32 = 0.999;
pub const DEFAULT_EPSILON: f32 = 1e-7;

/// Adam with bias-corrected step size.
#[derive(Clone, Debug)]
pub struct Adam {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    iterations: u64,
    // First and second moments, one pair per parameter in visiting order
    moments: Vec<(Vec<f32>, Vec<f32>)>,
}

impl Adam {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: DEFAULT_BETA1,
            beta2: DEFAULT_BETA2,
            epsilon: DEFAULT_EPSILON,
            iterations: 0,
            moments: Vec::new(),
        }
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Applies one update from the gradients currently stored on `params`.
    ///
    /// Parameters must be passed in the same order on every call. Gradients
    /// that are not finite skip the whole step.
    pub fn step(&mut self, mut params: Vec<&mut Param>) {
        if params.iter().any(|p| p.grad.iter().any(|g| !g.is_finite())) {
            debug!(iteration = self.iterations, "skipping step with non-finite gradient");
            return;
        }
        if self.moments.len() != params.len() {
            self.moments = params
                .iter()
                .map(|p| (vec![0.0; p.len()], vec![0.0; p.len()]))
                .collect();
        }

        self.iterations += 1;
        let t = self.iterations as i32;
        let lr_t = self.learning_rate * (1.0 - self.beta2.powi(t)).sqrt() / (1.0 - self.beta1.powi(t));
        let (b1, b2, eps) = (self.beta1, self.beta2, self.epsilon);

        for (param, (m, v)) in params.iter_mut().zip(self.moments.iter_mut()) {
            if param.grad.len() != param.value.len() {
                continue;
            }
            for (((w, g), m), v) in param.value.iter_mut().zip(&param.grad).zip(m.iter_mut()).zip(v.iter_mut()) {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                *w -= lr_t * *m / (v.sqrt() + eps);
            }
        }
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(DEFAULT_LEARNING_RATE)
    }
}
