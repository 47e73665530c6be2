use nalgebra::DMatrix;
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars when evaluating constraints.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// A vector-valued map R^n -> R^k that can be evaluated over any `Scalar`.
///
/// Implementing it for both `f64` and `Dual` is what lets a constraint get its
/// Jacobian from forward-mode differentiation.
pub trait ScalarMap<T: Scalar> {
    /// Number of input variables (the ambient dimension).
    fn inputs(&self) -> usize;

    /// Number of output rows.
    fn outputs(&self) -> usize;

    /// x: point in the ambient space
    /// out: buffer of length `outputs()` receiving F(x)
    fn evaluate(&self, x: &[T], out: &mut [T]);
}

/// An equality constraint F(x) = 0 over an ambient vector space.
/// Its zero set is the manifold the planner works on.
pub trait Constraint {
    /// Dimension of the ambient space the constraint is defined over.
    fn ambient_dimension(&self) -> usize;

    /// Number of scalar equations.
    fn co_dimension(&self) -> usize;

    /// Dimension of the constraint manifold.
    fn manifold_dimension(&self) -> usize {
        self.ambient_dimension().saturating_sub(self.co_dimension())
    }

    /// Evaluates F(x) into `out` (length `co_dimension()`).
    fn function(&self, x: &[f64], out: &mut [f64]);

    /// Jacobian of F at x, `co_dimension() x ambient_dimension()`.
    ///
    /// The default uses central differences.
    fn jacobian(&self, x: &[f64]) -> DMatrix<f64> {
        let n = self.ambient_dimension();
        let k = self.co_dimension();
        let mut jac = DMatrix::zeros(k, n);
        let mut probe = x.to_vec();
        let mut plus = vec![0.0; k];
        let mut minus = vec![0.0; k];
        for j in 0..n {
            let step = 1e-7 * (1.0 + x[j].abs());
            probe[j] = x[j] + step;
            self.function(&probe, &mut plus);
            probe[j] = x[j] - step;
            self.function(&probe, &mut minus);
            probe[j] = x[j];
            for i in 0..k {
                jac[(i, j)] = (plus[i] - minus[i]) / (2.0 * step);
            }
        }
        jac
    }

    /// ‖F(x)‖₂.
    fn residual_norm(&self, x: &[f64]) -> f64 {
        let mut out = vec![0.0; self.co_dimension()];
        self.function(x, &mut out);
        out.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    fn is_satisfied(&self, x: &[f64], tolerance: f64) -> bool {
        self.residual_norm(x) <= tolerance
    }
}
