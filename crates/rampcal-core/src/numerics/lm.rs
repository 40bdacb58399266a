//! Levenberg-Marquardt minimization of a residual vector.
//!
//! The Jacobian is taken by forward differences, so models only supply the
//! residual function.

use super::linalg::{DenseMatrix, LuError, lu_solve};

const LAMBDA_CEILING: f64 = 1.0e10;
const RELATIVE_STEP: f64 = 1.0e-7;

#[derive(Debug, Clone, PartialEq)]
pub struct LmConfig {
    pub max_iterations: usize,
    /// Largest absolute parameter change that counts as converged.
    pub convergence_threshold: f64,
    pub initial_lambda: f64,
    pub lambda_up: f64,
    pub lambda_down: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            convergence_threshold: 1.0e-8,
            initial_lambda: 1.0e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LmError {
    #[error("least squares needs at least {parameters} residuals, got {residuals}")]
    Underdetermined { parameters: usize, residuals: usize },
    #[error("residual function returned a non-finite value at the starting point")]
    NonFiniteStart,
    #[error("damped normal equations failed: {0}")]
    Solve(#[from] LuError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LmResult<const N: usize> {
    pub params: [f64; N],
    /// Sum of squared residuals at `params`.
    pub cost: f64,
    pub converged: bool,
    pub iterations: usize,
}

pub fn minimize<const N: usize, F>(
    mut residuals: F,
    initial: [f64; N],
    config: &LmConfig,
) -> Result<LmResult<N>, LmError>
where
    F: FnMut(&[f64; N]) -> Vec<f64>,
{
    let mut params = initial;
    let mut current = residuals(&params);
    if current.len() < N {
        return Err(LmError::Underdetermined {
            parameters: N,
            residuals: current.len(),
        });
    }
    let mut cost = sum_of_squares(&current);
    if !cost.is_finite() {
        return Err(LmError::NonFiniteStart);
    }

    let mut lambda = config.initial_lambda;
    let mut converged = false;
    let mut iterations = 0;

    for iteration in 0..config.max_iterations {
        iterations = iteration + 1;
        let jacobian = forward_jacobian(&mut residuals, &params, &current);
        let (hessian, gradient) = normal_equations(&jacobian, &current);

        let mut damped = DenseMatrix::zeros(N, N);
        for i in 0..N {
            for j in 0..N {
                damped[(i, j)] = hessian[i][j];
            }
            damped[(i, i)] = hessian[i][i] * (1.0 + lambda) + f64::EPSILON;
        }
        let rhs: Vec<f64> = gradient.iter().map(|g| -g).collect();
        let delta = match lu_solve(&damped, &rhs) {
            Ok(delta) => delta,
            Err(_) if iteration > 0 => break,
            Err(error) => return Err(error.into()),
        };

        let mut trial = params;
        for (p, d) in trial.iter_mut().zip(&delta) {
            *p += d;
        }
        let trial_residuals = residuals(&trial);
        let trial_cost = sum_of_squares(&trial_residuals);

        if trial_cost.is_finite() && trial_cost < cost {
            params = trial;
            current = trial_residuals;
            cost = trial_cost;
            lambda *= config.lambda_down;

            let max_delta = delta.iter().fold(0.0_f64, |acc, d| acc.max(d.abs()));
            if max_delta < config.convergence_threshold {
                converged = true;
                break;
            }
        } else {
            lambda *= config.lambda_up;
            if lambda > LAMBDA_CEILING {
                converged = true;
                break;
            }
        }
    }

    Ok(LmResult {
        params,
        cost,
        converged,
        iterations,
    })
}

fn forward_jacobian<const N: usize, F>(
    residuals: &mut F,
    params: &[f64; N],
    base: &[f64],
) -> Vec<[f64; N]>
where
    F: FnMut(&[f64; N]) -> Vec<f64>,
{
    let mut jacobian = vec![[0.0; N]; base.len()];
    for k in 0..N {
        let step = RELATIVE_STEP * params[k].abs().max(1.0);
        let mut shifted = *params;
        shifted[k] += step;
        let perturbed = residuals(&shifted);
        for (row, (value, reference)) in jacobian.iter_mut().zip(perturbed.iter().zip(base)) {
            row[k] = (value - reference) / step;
        }
    }
    jacobian
}

fn normal_equations<const N: usize>(
    jacobian: &[[f64; N]],
    residuals: &[f64],
) -> ([[f64; N]; N], [f64; N]) {
    let mut hessian = [[0.0; N]; N];
    let mut gradient = [0.0; N];
    for (row, residual) in jacobian.iter().zip(residuals) {
        for i in 0..N {
            gradient[i] += row[i] * residual;
            for j in i..N {
                hessian[i][j] += row[i] * row[j];
            }
        }
    }
    for i in 0..N {
        for j in 0..i {
            hessian[i][j] = hessian[j][i];
        }
    }
    (hessian, gradient)
}

fn sum_of_squares(values: &[f64]) -> f64 {
    values.iter().map(|value| value * value).sum()
}
