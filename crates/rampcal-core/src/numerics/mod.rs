pub mod fft;
pub mod filters;
pub mod linalg;
pub mod lm;
pub mod polyfit;
pub mod robust;
pub mod savgol;

pub use fft::{Fft2d, FftError, RealPowerSpectrum, fftshift, next_power_of_two, rfft_frequencies};
pub use filters::median_filter;
pub use linalg::{DenseMatrix, LuDecomposition, LuError, lu_factorize, lu_solve, solve_least_squares};
pub use lm::{LmConfig, LmError, LmResult, minimize};
pub use polyfit::{PolyBasis, PolyFitError, PolyFitter, poly_eval, poly_eval_cube, poly_fit};
pub use robust::{
    MAD_TO_SIGMA, histogram_mode, mean, median, median_abs_deviation, median_in_place,
    median_stack, population_std, reduce_stack, robust_mean, robust_mean_stack, robust_std,
    robust_std_stack,
};
pub use savgol::{SavGolError, SavGolFilter, fill_gaps};

use crate::domain::CalibError;

impl From<LuError> for CalibError {
    fn from(error: LuError) -> Self {
        CalibError::numeric_degeneracy("NUMERIC.LU", error.to_string())
    }
}

impl From<PolyFitError> for CalibError {
    fn from(error: PolyFitError) -> Self {
        CalibError::numeric_degeneracy("NUMERIC.POLYFIT", error.to_string())
    }
}

impl From<SavGolError> for CalibError {
    fn from(error: SavGolError) -> Self {
        CalibError::numeric_degeneracy("NUMERIC.SAVGOL", error.to_string())
    }
}

impl From<FftError> for CalibError {
    fn from(error: FftError) -> Self {
        CalibError::numeric_degeneracy("NUMERIC.FFT", error.to_string())
    }
}

impl From<LmError> for CalibError {
    fn from(error: LmError) -> Self {
        CalibError::numeric_degeneracy("NUMERIC.LEAST_SQUARES", error.to_string())
    }
}
