use super::Optimizer;
use crate::{MlErr, Result};

/// Adam with bias correction folded into the step size.
#[derive(Debug)]
pub struct Adam {
    learning_rate: f32,
    betas: (f32, f32),
    epsilon: f32,
    /// The amount of updates applied so far.
    t: i32,
    /// First and second moment estimates, one per parameter.
    moments: Vec<(f32, f32)>,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `num_params` - The amount of parameters it will update.
    /// * `learning_rate` - The scale of every update.
    /// * `betas` - The decay rates of the first and second moment estimates.
    /// * `epsilon` - Keeps the update finite when the second moment vanishes.
    pub fn new(num_params: usize, learning_rate: f32, betas: (f32, f32), epsilon: f32) -> Self {
        Self {
            learning_rate,
            betas,
            epsilon,
            t: 0,
            moments: vec![(0., 0.); num_params],
        }
    }

    /// Creates a new `Adam` optimizer with the usual `(0.9, 0.999)` betas and `1e-8` epsilon.
    pub fn with_defaults(num_params: usize, learning_rate: f32) -> Self {
        Self::new(num_params, learning_rate, (0.9, 0.999), 1e-8)
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

impl Optimizer for Adam {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        if grad.len() != params.len() {
            return Err(MlErr::SizeMismatch {
                what: "gradient",
                got: grad.len(),
                expected: params.len(),
            });
        }

        if params.len() != self.moments.len() {
            return Err(MlErr::SizeMismatch {
                what: "optimizer state",
                got: params.len(),
                expected: self.moments.len(),
            });
        }

        self.t = self.t.saturating_add(1);
        let (b1, b2) = self.betas;
        let eps = self.epsilon;

        let corrected_lr =
            self.learning_rate * (1. - b2.powi(self.t)).sqrt() / (1. - b1.powi(self.t));

        for ((p, &g), (m, v)) in params.iter_mut().zip(grad).zip(&mut self.moments) {
            *m = b1 * *m + (1. - b1) * g;
            *v = b2 * *v + (1. - b2) * g * g;
            *p -= corrected_lr * *m / (v.sqrt() + eps);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_moves_each_parameter_by_the_learning_rate() {
        let mut adam = Adam::with_defaults(3, 0.1);
        let mut params = [1f32, 1., 1.];

        adam.update_params(&[2., -0.5, 0.], &mut params).unwrap();

        assert!((params[0] - 0.9).abs() < 1e-5);
        assert!((params[1] - 1.1).abs() < 1e-5);
        assert_eq!(params[2], 1.);
    }

    #[test]
    fn minimizes_a_quadratic() {
        let mut adam = Adam::with_defaults(2, 0.05);
        let mut params = [3f32, -2.];

        for _ in 0..2000 {
            let grad = [2. * params[0], 2. * params[1]];
            adam.update_params(&grad, &mut params).unwrap();
        }

        assert!(params.iter().all(|p| p.abs() < 5e-2), "{params:?}");
    }

    #[test]
    fn custom_betas_are_used() {
        let mut adam = Adam::new(1, 0.1, (0.5, 0.5), 0.);
        let mut params = [0f32];

        // bias correction makes every step of a constant gradient exactly lr
        for _ in 0..3 {
            adam.update_params(&[4.], &mut params).unwrap();
        }

        assert!((params[0] + 0.3).abs() < 1e-5, "{params:?}");
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let mut adam = Adam::with_defaults(2, 0.1);
        assert!(adam.update_params(&[1.], &mut [1., 1.]).is_err());
        assert!(adam.update_params(&[1.; 3], &mut [1.; 3]).is_err());
    }
}
