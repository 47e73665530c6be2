//! Newton projection onto the constraint manifold and tangent-space bases.

use anyhow::{anyhow, bail, Context, Result};
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use serde::{Deserialize, Serialize};

use crate::traits::Constraint;

/// Smallest eigenvalue of JᵀJ, outside the tangent space, for which the
/// Jacobian still counts as full rank.
const RANK_EPS: f64 = 1e-10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProjectionSettings {
    /// Residual ‖F(x)‖ below which a point is considered on the manifold.
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for ProjectionSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 50,
        }
    }
}

impl ProjectionSettings {
    fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            bail!("max_iterations must be greater than zero.");
        }
        if !(self.tolerance > 0.0) {
            bail!("tolerance must be positive.");
        }
        Ok(())
    }
}

/// Moves `x` onto the manifold with minimum-norm Newton steps
/// `dx = Jᵀ (J Jᵀ)⁻¹ F(x)`.
pub fn project(
    constraint: &dyn Constraint,
    x: &DVector<f64>,
    settings: ProjectionSettings,
) -> Result<DVector<f64>> {
    settings.validate()?;
    check_dimension(constraint, x)?;

    let mut state = x.clone();
    let mut residual = DVector::zeros(constraint.co_dimension());
    constraint.function(state.as_slice(), residual.as_mut_slice());
    let mut residual_norm = residual.norm();
    let mut iterations = 0usize;

    loop {
        if !residual_norm.is_finite() {
            bail!("Projection produced a non-finite residual.");
        }
        if residual_norm <= settings.tolerance {
            break;
        }
        if iterations >= settings.max_iterations {
            bail!(
                "Projection failed to converge in {} iterations (‖F(x)‖ = {}).",
                settings.max_iterations,
                residual_norm
            );
        }

        let jacobian = constraint.jacobian(state.as_slice());
        let delta = min_norm_step(&jacobian, &residual)
            .context("Failed to solve for the projection step.")?;
        state -= delta;

        iterations += 1;
        constraint.function(state.as_slice(), residual.as_mut_slice());
        residual_norm = residual.norm();
    }

    Ok(state)
}

/// Moves `x` onto the manifold while keeping `basisᵀ (x - x_start)` fixed, i.e.
/// only along the orthogonal complement of `basis`. This is the lift from a
/// chart's tangent plane back onto the manifold.
pub fn project_orthogonal(
    constraint: &dyn Constraint,
    x: &DVector<f64>,
    basis: &DMatrix<f64>,
    settings: ProjectionSettings,
) -> Result<DVector<f64>> {
    settings.validate()?;
    check_dimension(constraint, x)?;

    let n = constraint.ambient_dimension();
    let k = constraint.co_dimension();
    if basis.nrows() != n || basis.ncols() + k != n {
        bail!(
            "Tangent basis has shape {}x{}, expected {}x{}.",
            basis.nrows(),
            basis.ncols(),
            n,
            n - k
        );
    }

    let mut state = x.clone();
    let mut f_val = DVector::zeros(k);

    for _ in 0..settings.max_iterations {
        constraint.function(state.as_slice(), f_val.as_mut_slice());
        let offset = basis.tr_mul(&(&state - x));

        let mut rhs = DVector::zeros(n);
        rhs.rows_mut(0, k).copy_from(&(-&f_val));
        rhs.rows_mut(k, n - k).copy_from(&(-offset));

        if !rhs.iter().all(|v| v.is_finite()) {
            bail!("Chart lift produced a non-finite residual.");
        }
        if f_val.norm() <= settings.tolerance {
            return Ok(state);
        }

        let mut a = DMatrix::zeros(n, n);
        a.view_mut((0, 0), (k, n))
            .copy_from(&constraint.jacobian(state.as_slice()));
        a.view_mut((k, 0), (n - k, n)).copy_from(&basis.transpose());

        let delta = a
            .lu()
            .solve(&rhs)
            .ok_or_else(|| anyhow!("Singular matrix in chart lift"))?;
        state += &delta;
    }

    constraint.function(state.as_slice(), f_val.as_mut_slice());
    if f_val.norm() <= settings.tolerance {
        return Ok(state);
    }
    bail!(
        "Chart lift failed to converge in {} iterations (‖F(x)‖ = {}).",
        settings.max_iterations,
        f_val.norm()
    )
}

/// Orthonormal basis (as columns) of the tangent space at `x`, the null space
/// of J(x). Errors at singular points where J loses rank.
pub fn tangent_basis(constraint: &dyn Constraint, x: &DVector<f64>) -> Result<DMatrix<f64>> {
    check_dimension(constraint, x)?;
    let n = constraint.ambient_dimension();
    let m = constraint.manifold_dimension();
    if m == 0 {
        bail!("Failed to compute tangent space: manifold is zero-dimensional");
    }

    let jacobian = constraint.jacobian(x.as_slice());
    let gram = jacobian.transpose() * &jacobian;
    if gram.iter().any(|v| !v.is_finite()) {
        bail!("Failed to compute tangent space: non-finite Jacobian");
    }

    let eig = SymmetricEigen::new(gram);
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| eig.eigenvalues[a].total_cmp(&eig.eigenvalues[b]));

    if m < n && eig.eigenvalues[order[m]] < RANK_EPS {
        bail!("Failed to compute tangent space: constraint Jacobian is rank deficient");
    }

    let mut basis = DMatrix::zeros(n, m);
    for (col, &idx) in order.iter().take(m).enumerate() {
        basis.set_column(col, &eig.eigenvectors.column(idx));
    }
    Ok(basis)
}

fn min_norm_step(jacobian: &DMatrix<f64>, residual: &DVector<f64>) -> Result<DVector<f64>> {
    let jjt = jacobian * jacobian.transpose();
    let y = jjt
        .lu()
        .solve(residual)
        .ok_or_else(|| anyhow!("Constraint Jacobian is rank deficient."))?;
    Ok(jacobian.tr_mul(&y))
}

fn check_dimension(constraint: &dyn Constraint, x: &DVector<f64>) -> Result<()> {
    if x.len() != constraint.ambient_dimension() {
        bail!(
            "Point dimension mismatch. Expected {}, got {}.",
            constraint.ambient_dimension(),
            x.len()
        );
    }
    Ok(())
}
