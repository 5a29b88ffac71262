use serde::{Deserialize, Serialize};

/// The nonlinearity applied between the affine layers of a residual block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActFn {
    #[default]
    Relu,
    Tanh,
    Sigmoid {
        amp: f32,
    },
}
use ActFn::*;

impl ActFn {
    pub fn sigmoid(amp: f32) -> Self {
        Sigmoid { amp }
    }

    pub fn f(&self, z: f32) -> f32 {
        match *self {
            Relu => z.max(0.),
            Tanh => z.tanh(),
            Sigmoid { amp } => amp / (1. + (-z).exp()),
        }
    }

    pub fn df(&self, z: f32) -> f32 {
        match *self {
            Relu => {
                if z > 0. {
                    1.
                } else {
                    0.
                }
            }
            Tanh => 1. - z.tanh().powi(2),
            Sigmoid { amp } => {
                let e = (-z).exp();
                (amp * e) / (e + 1.).powi(2)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relu_clamps_negatives() {
        assert_eq!(Relu.f(-2.), 0.);
        assert_eq!(Relu.f(3.), 3.);
        assert_eq!(Relu.df(-2.), 0.);
        assert_eq!(Relu.df(3.), 1.);
    }

    #[test]
    fn derivatives_match_finite_differences() {
        let eps = 1e-3;
        for act_fn in [Tanh, ActFn::sigmoid(2.)] {
            for z in [-1.5f32, -0.2, 0.3, 1.1] {
                let numeric = (act_fn.f(z + eps) - act_fn.f(z - eps)) / (2. * eps);
                assert!((numeric - act_fn.df(z)).abs() < 1e-2, "{act_fn:?} at {z}");
            }
        }
    }

    #[test]
    fn serde_round_trip_keeps_amplitude() {
        let json = serde_json::to_string(&ActFn::sigmoid(0.5)).unwrap();
        assert_eq!(json, r#"{"kind":"sigmoid","amp":0.5}"#);

        let act_fn: ActFn = serde_json::from_str(r#"{"kind":"relu"}"#).unwrap();
        assert_eq!(act_fn, Relu);
    }
}
