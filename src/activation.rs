//! Degree-3 polynomial sigmoid and its derivative.

use cellcnn_ckks::{CkksScheme, Evaluator, Leveled};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Fit interval of the sigmoid approximation. The narrow fit is tighter but
/// leaves the sigmoid sooner, so inputs must stay in a smaller range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Activation {
    /// Fit on [-3, 3].
    #[default]
    Narrow,
    /// Fit on [-8, 8].
    Wide,
}

impl Activation {
    /// `[a0, a1, a2, a3]` with `a2 = 0`.
    pub fn coefficients(self) -> [f64; 4] {
        match self {
            Self::Narrow => [0.5, 0.24656666666666668, 0.0, -0.009070370370370371],
            Self::Wide => [0.5, 0.1831, 0.0, -0.003817],
        }
    }

    /// `[a1, 0, 3·a3]`.
    pub fn derivative_coefficients(self) -> [f64; 3] {
        let a = self.coefficients();
        [a[1], 0.0, 3.0 * a[3]]
    }

    /// Coefficients of `σ(y / 2)`, for inputs that arrive doubled.
    pub fn halved_input_coefficients(self) -> [f64; 4] {
        let a = self.coefficients();
        [a[0], a[1] / 2.0, 0.0, a[3] / 8.0]
    }

    pub fn eval(self, x: f64) -> f64 {
        let a = self.coefficients();
        a[0] + x * (a[1] + x * x * a[3])
    }

    pub fn derivative(self, x: f64) -> f64 {
        let d = self.derivative_coefficients();
        d[0] + d[2] * x * x
    }
}

/// σ(x) and σ′(x) from one shared square. Both land two levels below `x` at
/// `target_scale`.
pub struct ActivationPair<C> {
    pub value: C,
    pub derivative: C,
}

impl<C: Leveled> ActivationPair<C> {
    pub fn evaluate<S>(
        eval: &Evaluator<'_, S>,
        x: &C,
        activation: Activation,
        target_scale: f64,
    ) -> Result<Self>
    where
        S: CkksScheme<Ciphertext = C>,
    {
        let x2 = eval.square(x)?;
        let value = eval.evaluate_polynomial_with_square(x, &x2, &activation.coefficients(), target_scale)?;

        let d = activation.derivative_coefficients();
        let level = x2.level();
        let cs = target_scale * eval.params().q(level) / x2.scale();
        let derivative = eval.mul_const(&x2, d[2], cs)?;
        let derivative = eval.add_const(&derivative, d[0])?;
        let derivative = eval.rescale(&derivative)?;
        Ok(Self { value, derivative })
    }
}
