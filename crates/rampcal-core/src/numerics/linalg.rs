use faer::Mat;

pub type DenseMatrix = Mat<f64>;

const SINGULAR_PIVOT_EPSILON: f64 = 1.0e-300;
const ILL_CONDITIONED_RELATIVE_PIVOT_EPSILON: f64 = 1.0e-14;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LuError {
    #[error("LU factorization requires a square matrix, got {rows}x{cols}")]
    NonSquareMatrix { rows: usize, cols: usize },
    #[error("LU factorization requires a non-empty matrix")]
    EmptyMatrix,
    #[error("matrix is singular at pivot index {pivot_index}")]
    SingularMatrix { pivot_index: usize },
    #[error("matrix is ill-conditioned at pivot index {pivot_index}")]
    IllConditionedMatrix { pivot_index: usize },
    #[error("right-hand side length mismatch: expected {expected}, got {actual}")]
    RhsLengthMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Clone)]
pub struct LuDecomposition {
    lu: DenseMatrix,
    pivots: Vec<usize>,
    input_norm_infty: f64,
}

impl LuDecomposition {
    pub fn dimension(&self) -> usize {
        self.lu.nrows()
    }

    pub fn solve(&self, rhs: &[f64]) -> Result<Vec<f64>, LuError> {
        let dimension = self.dimension();
        if rhs.len() != dimension {
            return Err(LuError::RhsLengthMismatch {
                expected: dimension,
                actual: rhs.len(),
            });
        }

        let mut forward = vec![0.0; dimension];
        for row in 0..dimension {
            let mut value = rhs[self.pivots[row]];
            for col in 0..row {
                value -= self.lu[(row, col)] * forward[col];
            }
            forward[row] = value;
        }

        let mut solution = vec![0.0; dimension];
        for row in (0..dimension).rev() {
            let mut value = forward[row];
            for col in (row + 1)..dimension {
                value -= self.lu[(row, col)] * solution[col];
            }

            let diagonal = self.lu[(row, row)];
            if diagonal.abs() <= self.input_norm_infty * ILL_CONDITIONED_RELATIVE_PIVOT_EPSILON {
                return Err(LuError::IllConditionedMatrix { pivot_index: row });
            }
            solution[row] = value / diagonal;
        }

        Ok(solution)
    }
}

pub fn lu_factorize(matrix: &DenseMatrix) -> Result<LuDecomposition, LuError> {
    let dimension = validate_square_shape(matrix)?;
    let input_norm_infty = matrix_infinity_norm(matrix);
    let mut lu = matrix.clone();
    let mut pivots: Vec<usize> = (0..dimension).collect();

    for pivot_col in 0..dimension {
        let (pivot_row, pivot_abs) = select_pivot_row(&lu, pivot_col);
        if pivot_abs <= SINGULAR_PIVOT_EPSILON {
            return Err(LuError::SingularMatrix {
                pivot_index: pivot_col,
            });
        }

        if pivot_row != pivot_col {
            swap_rows(&mut lu, pivot_col, pivot_row);
            pivots.swap(pivot_col, pivot_row);
        }

        let pivot = lu[(pivot_col, pivot_col)];
        for row in (pivot_col + 1)..dimension {
            lu[(row, pivot_col)] /= pivot;
            let multiplier = lu[(row, pivot_col)];
            for col in (pivot_col + 1)..dimension {
                let updated = lu[(row, col)] - multiplier * lu[(pivot_col, col)];
                lu[(row, col)] = updated;
            }
        }
    }

    Ok(LuDecomposition {
        lu,
        pivots,
        input_norm_infty,
    })
}

pub fn lu_solve(matrix: &DenseMatrix, rhs: &[f64]) -> Result<Vec<f64>, LuError> {
    lu_factorize(matrix)?.solve(rhs)
}

/// Solve the normal equations `(AᵀA) x = Aᵀy` for a row-major design matrix.
pub fn solve_least_squares(
    design: &DenseMatrix,
    observations: &[f64],
) -> Result<Vec<f64>, LuError> {
    let rows = design.nrows();
    let cols = design.ncols();
    if observations.len() != rows {
        return Err(LuError::RhsLengthMismatch {
            expected: rows,
            actual: observations.len(),
        });
    }

    let mut normal = DenseMatrix::zeros(cols, cols);
    let mut rhs = vec![0.0; cols];
    for row in 0..rows {
        for i in 0..cols {
            let a_i = design[(row, i)];
            rhs[i] += a_i * observations[row];
            for j in 0..cols {
                normal[(i, j)] += a_i * design[(row, j)];
            }
        }
    }

    lu_solve(&normal, &rhs)
}

fn validate_square_shape(matrix: &DenseMatrix) -> Result<usize, LuError> {
    let rows = matrix.nrows();
    let cols = matrix.ncols();
    if rows == 0 || cols == 0 {
        return Err(LuError::EmptyMatrix);
    }
    if rows != cols {
        return Err(LuError::NonSquareMatrix { rows, cols });
    }

    Ok(rows)
}

fn select_pivot_row(matrix: &DenseMatrix, pivot_col: usize) -> (usize, f64) {
    let mut best_row = pivot_col;
    let mut best_abs = matrix[(pivot_col, pivot_col)].abs();

    for row in (pivot_col + 1)..matrix.nrows() {
        let candidate = matrix[(row, pivot_col)].abs();
        if candidate > best_abs {
            best_abs = candidate;
            best_row = row;
        }
    }

    (best_row, best_abs)
}

fn swap_rows(matrix: &mut DenseMatrix, lhs: usize, rhs: usize) {
    for col in 0..matrix.ncols() {
        let value = matrix[(lhs, col)];
        matrix[(lhs, col)] = matrix[(rhs, col)];
        matrix[(rhs, col)] = value;
    }
}

fn matrix_infinity_norm(matrix: &DenseMatrix) -> f64 {
    let mut best_row_sum: f64 = 0.0;
    for row in 0..matrix.nrows() {
        let mut row_sum = 0.0;
        for col in 0..matrix.ncols() {
            row_sum += matrix[(row, col)].abs();
        }
        best_row_sum = best_row_sum.max(row_sum);
    }
    best_row_sum
}

#[cfg(test)]
mod tests {
    use super::{DenseMatrix, LuError, lu_solve, solve_least_squares};

    fn dense_matrix(rows: &[Vec<f64>]) -> DenseMatrix {
        let mut matrix = DenseMatrix::zeros(rows.len(), rows[0].len());
        for (r, row) in rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                matrix[(r, c)] = *value;
            }
        }
        matrix
    }

    #[test]
    fn lu_solve_recovers_known_solution_with_pivoting() {
        let matrix = dense_matrix(&[
            vec![0.0, 2.0, 1.0],
            vec![1.0, -2.0, -3.0],
            vec![2.0, 3.0, 1.0],
        ]);
        let expected = [1.0, -2.0, 3.0];
        let rhs: Vec<f64> = (0..3)
            .map(|r| (0..3).map(|c| matrix[(r, c)] * expected[c]).sum())
            .collect();

        let solution = lu_solve(&matrix, &rhs).expect("solvable system");
        for (actual, wanted) in solution.iter().zip(expected) {
            assert!((actual - wanted).abs() < 1.0e-12);
        }
    }

    #[test]
    fn lu_solve_rejects_singular_matrix() {
        let matrix = dense_matrix(&[vec![1.0, 2.0], vec![2.0, 4.0]]);
        let error = lu_solve(&matrix, &[1.0, 2.0]).expect_err("singular");
        assert!(matches!(
            error,
            LuError::SingularMatrix { .. } | LuError::IllConditionedMatrix { .. }
        ));
    }

    #[test]
    fn least_squares_fits_exact_line() {
        let xs = [0.0, 1.0, 2.0, 3.0];
        let mut design = DenseMatrix::zeros(4, 2);
        for (row, x) in xs.iter().enumerate() {
            design[(row, 0)] = 1.0;
            design[(row, 1)] = *x;
        }
        let ys: Vec<f64> = xs.iter().map(|x| 2.0 + 0.5 * x).collect();
        let coefficients = solve_least_squares(&design, &ys).expect("full rank");
        assert!((coefficients[0] - 2.0).abs() < 1.0e-12);
        assert!((coefficients[1] - 0.5).abs() < 1.0e-12);
    }
}
