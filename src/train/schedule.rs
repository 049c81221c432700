use tracing::info;

/// Cuts the learning rate when the monitored loss stops improving.
#[derive(Clone, Debug)]
pub struct ReduceLrOnPlateau {
    pub factor: f32,
    pub patience: usize,
    pub min_delta: f32,
    pub min_lr: f32,
    best: f32,
    wait: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(factor: f32, patience: usize) -> Self {
        Self {
            factor,
            patience,
            min_delta: 1e-4,
            min_lr: 0.0,
            best: f32::INFINITY,
            wait: 0,
        }
    }

    pub fn best(&self) -> f32 {
        self.best
    }

    /// Records one epoch's metric and returns the learning rate to use next.
    pub fn step(&mut self, metric: f32, lr: f32) -> f32 {
        if metric < self.best - self.min_delta {
            self.best = metric;
            self.wait = 0;
            return lr;
        }

        self.wait += 1;
        if self.wait < self.patience {
            return lr;
        }
        self.wait = 0;
        let reduced = (lr * self.factor).max(self.min_lr);
        if reduced < lr {
            info!(from = lr, to = reduced, "reducing learning rate");
        }
        reduced
    }
}

impl Default for ReduceLrOnPlateau {
    fn default() -> Self {
        Self::new(0.1, 3)
    }
}
