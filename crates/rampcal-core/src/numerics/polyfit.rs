//! Least-squares polynomial fits in a power or Legendre basis.
//!
//! A [`PolyFitter`] precomputes the projection matrix for one abscissa so that
//! every pixel of a ramp cube can be fit with a handful of fused multiply-adds.

use super::linalg::{DenseMatrix, LuError, lu_factorize};
use ndarray::{Array3, ArrayView3, Axis};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PolyBasis {
    Power,
    /// Legendre polynomials over `domain` remapped onto `[-1, 1]`.
    Legendre { domain: [f64; 2] },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolyFitError {
    #[error("degree {degree} fit needs at least {required} samples, got {actual}")]
    InsufficientPoints {
        degree: usize,
        required: usize,
        actual: usize,
    },
    #[error("abscissa/ordinate length mismatch: x={x}, y={y}")]
    LengthMismatch { x: usize, y: usize },
    #[error("abscissa must be finite at index {index}, got {value}")]
    NonFiniteAbscissa { index: usize, value: f64 },
    #[error("Legendre domain [{low}, {high}] has zero width")]
    DegenerateDomain { low: f64, high: f64 },
    #[error("normal equations could not be solved: {0}")]
    Singular(#[from] LuError),
}

#[derive(Debug, Clone)]
pub struct PolyFitter {
    degree: usize,
    basis: PolyBasis,
    sample_count: usize,
    /// `projection[k][t]` maps sample `t` onto coefficient `k`.
    projection: Vec<Vec<f64>>,
}

impl PolyFitter {
    pub fn new(abscissa: &[f64], degree: usize, basis: PolyBasis) -> Result<Self, PolyFitError> {
        let required = degree + 1;
        if abscissa.len() < required {
            return Err(PolyFitError::InsufficientPoints {
                degree,
                required,
                actual: abscissa.len(),
            });
        }
        if let Some((index, value)) = abscissa
            .iter()
            .enumerate()
            .find(|(_, value)| !value.is_finite())
        {
            return Err(PolyFitError::NonFiniteAbscissa {
                index,
                value: *value,
            });
        }
        if let PolyBasis::Legendre { domain } = basis {
            if domain[1] == domain[0] {
                return Err(PolyFitError::DegenerateDomain {
                    low: domain[0],
                    high: domain[1],
                });
            }
        }

        // Power fits run on a centered, scaled abscissa and are converted back.
        let conditioning = match basis {
            PolyBasis::Power => Some(centering(abscissa)),
            PolyBasis::Legendre { .. } => None,
        };
        let design_rows: Vec<Vec<f64>> = abscissa
            .iter()
            .map(|x| {
                let x = conditioning.map_or(*x, |(center, scale)| (x - center) / scale);
                basis_values(x, degree, basis)
            })
            .collect();

        let mut normal = DenseMatrix::zeros(required, required);
        for row in &design_rows {
            for i in 0..required {
                for j in 0..required {
                    normal[(i, j)] += row[i] * row[j];
                }
            }
        }
        let decomposition = lu_factorize(&normal)?;

        let mut projection = vec![vec![0.0; abscissa.len()]; required];
        for (t, row) in design_rows.iter().enumerate() {
            let column = decomposition.solve(row)?;
            for k in 0..required {
                projection[k][t] = column[k];
            }
        }

        if let Some((center, scale)) = conditioning {
            projection = unscale_projection(&projection, center, scale);
        }

        Ok(Self {
            degree,
            basis,
            sample_count: abscissa.len(),
            projection,
        })
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn basis(&self) -> PolyBasis {
        self.basis
    }

    pub fn fit(&self, ordinate: &[f64]) -> Result<Vec<f64>, PolyFitError> {
        if ordinate.len() != self.sample_count {
            return Err(PolyFitError::LengthMismatch {
                x: self.sample_count,
                y: ordinate.len(),
            });
        }

        Ok(self
            .projection
            .iter()
            .map(|weights| weights.iter().zip(ordinate).map(|(w, y)| w * y).sum())
            .collect())
    }

    /// Fit every pixel of a `[samples, rows, cols]` cube; returns `[degree+1, rows, cols]`.
    pub fn fit_cube(&self, cube: ArrayView3<'_, f64>) -> Result<Array3<f64>, PolyFitError> {
        let (samples, rows, cols) = cube.dim();
        if samples != self.sample_count {
            return Err(PolyFitError::LengthMismatch {
                x: self.sample_count,
                y: samples,
            });
        }

        let mut coefficients = Array3::<f64>::zeros((self.degree + 1, rows, cols));
        for (k, weights) in self.projection.iter().enumerate() {
            let mut plane = coefficients.index_axis_mut(Axis(0), k);
            for (t, weight) in weights.iter().enumerate() {
                plane.scaled_add(*weight, &cube.index_axis(Axis(0), t));
            }
        }
        Ok(coefficients)
    }
}

pub fn poly_fit(
    abscissa: &[f64],
    ordinate: &[f64],
    degree: usize,
    basis: PolyBasis,
) -> Result<Vec<f64>, PolyFitError> {
    if abscissa.len() != ordinate.len() {
        return Err(PolyFitError::LengthMismatch {
            x: abscissa.len(),
            y: ordinate.len(),
        });
    }
    PolyFitter::new(abscissa, degree, basis)?.fit(ordinate)
}

pub fn poly_eval(x: f64, coefficients: &[f64], basis: PolyBasis) -> f64 {
    if coefficients.is_empty() {
        return 0.0;
    }
    basis_values(x, coefficients.len() - 1, basis)
        .iter()
        .zip(coefficients)
        .map(|(b, c)| b * c)
        .sum()
}

/// Evaluate per-pixel coefficients `[degree+1, rows, cols]` at every abscissa.
pub fn poly_eval_cube(
    abscissa: &[f64],
    coefficients: ArrayView3<'_, f64>,
    basis: PolyBasis,
) -> Array3<f64> {
    let (terms, rows, cols) = coefficients.dim();
    let mut values = Array3::<f64>::zeros((abscissa.len(), rows, cols));
    if terms == 0 {
        return values;
    }
    for (t, x) in abscissa.iter().enumerate() {
        let basis_row = basis_values(*x, terms - 1, basis);
        let mut plane = values.index_axis_mut(Axis(0), t);
        for (k, weight) in basis_row.iter().enumerate() {
            plane.scaled_add(*weight, &coefficients.index_axis(Axis(0), k));
        }
    }
    values
}

fn basis_values(x: f64, degree: usize, basis: PolyBasis) -> Vec<f64> {
    let mut values = Vec::with_capacity(degree + 1);
    match basis {
        PolyBasis::Power => {
            let mut term = 1.0;
            for _ in 0..=degree {
                values.push(term);
                term *= x;
            }
        }
        PolyBasis::Legendre { domain } => {
            let mapped = 2.0 * (x - domain[0]) / (domain[1] - domain[0]) - 1.0;
            values.push(1.0);
            if degree >= 1 {
                values.push(mapped);
            }
            for k in 1..degree {
                let k_f = k as f64;
                let next = ((2.0 * k_f + 1.0) * mapped * values[k] - k_f * values[k - 1])
                    / (k_f + 1.0);
                values.push(next);
            }
        }
    }
    values
}

fn centering(abscissa: &[f64]) -> (f64, f64) {
    let low = abscissa.iter().copied().fold(f64::INFINITY, f64::min);
    let high = abscissa.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let center = 0.5 * (low + high);
    let half_width = 0.5 * (high - low);
    let scale = if half_width > 0.0 { half_width } else { 1.0 };
    (center, scale)
}

/// Convert projections for `u = (x - c)/s` coefficients into plain power coefficients.
fn unscale_projection(projection: &[Vec<f64>], center: f64, scale: f64) -> Vec<Vec<f64>> {
    let terms = projection.len();
    let samples = projection.first().map_or(0, Vec::len);
    let mut converted = vec![vec![0.0; samples]; terms];
    for k in 0..terms {
        let inv_scale_k = scale.powi(-(k as i32));
        for j in 0..=k {
            let factor =
                inv_scale_k * binomial(k, j) as f64 * (-center).powi((k - j) as i32);
            for t in 0..samples {
                converted[j][t] += factor * projection[k][t];
            }
        }
    }
    converted
}

fn binomial(n: usize, k: usize) -> u64 {
    let k = k.min(n - k);
    (0..k).fold(1u64, |acc, i| acc * (n - i) as u64 / (i + 1) as u64)
}
