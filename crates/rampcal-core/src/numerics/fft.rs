//! FFT helpers on top of `rustfft`: cached 2-D transforms, real power spectra
//! and the matching frequency axis.

use ndarray::Array2;
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FftError {
    #[error("FFT plan expects shape {expected_rows}x{expected_cols}, got {rows}x{cols}")]
    ShapeMismatch {
        expected_rows: usize,
        expected_cols: usize,
        rows: usize,
        cols: usize,
    },
    #[error("FFT requires a non-empty input")]
    EmptyInput,
}

/// Row/column 2-D transform with plans cached for one image shape.
#[derive(Clone)]
pub struct Fft2d {
    rows: usize,
    cols: usize,
    row_forward: Arc<dyn Fft<f64>>,
    row_inverse: Arc<dyn Fft<f64>>,
    col_forward: Arc<dyn Fft<f64>>,
    col_inverse: Arc<dyn Fft<f64>>,
}

impl std::fmt::Debug for Fft2d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fft2d")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .finish()
    }
}

impl Fft2d {
    pub fn new(rows: usize, cols: usize) -> Result<Self, FftError> {
        if rows == 0 || cols == 0 {
            return Err(FftError::EmptyInput);
        }
        let mut planner = FftPlanner::new();
        Ok(Self {
            rows,
            cols,
            row_forward: planner.plan_fft_forward(cols),
            row_inverse: planner.plan_fft_inverse(cols),
            col_forward: planner.plan_fft_forward(rows),
            col_inverse: planner.plan_fft_inverse(rows),
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn forward_real(&self, image: &Array2<f64>) -> Result<Array2<Complex64>, FftError> {
        self.check_shape(image.dim())?;
        let mut data = image.mapv(|value| Complex64::new(value, 0.0));
        self.transform(&mut data, true);
        Ok(data)
    }

    /// Normalized inverse transform.
    pub fn inverse(&self, spectrum: &Array2<Complex64>) -> Result<Array2<Complex64>, FftError> {
        self.check_shape(spectrum.dim())?;
        let mut data = spectrum.clone();
        self.transform(&mut data, false);
        let norm = 1.0 / (self.rows * self.cols) as f64;
        data.mapv_inplace(|value| value * norm);
        Ok(data)
    }

    fn transform(&self, data: &mut Array2<Complex64>, forward: bool) {
        let (row_plan, col_plan) = if forward {
            (&self.row_forward, &self.col_forward)
        } else {
            (&self.row_inverse, &self.col_inverse)
        };

        let mut row_buffer = vec![Complex64::new(0.0, 0.0); self.cols];
        for mut row in data.rows_mut() {
            for (slot, value) in row_buffer.iter_mut().zip(row.iter()) {
                *slot = *value;
            }
            row_plan.process(&mut row_buffer);
            for (value, slot) in row.iter_mut().zip(&row_buffer) {
                *value = *slot;
            }
        }

        let mut col_buffer = vec![Complex64::new(0.0, 0.0); self.rows];
        for mut column in data.columns_mut() {
            for (slot, value) in col_buffer.iter_mut().zip(column.iter()) {
                *slot = *value;
            }
            col_plan.process(&mut col_buffer);
            for (value, slot) in column.iter_mut().zip(&col_buffer) {
                *value = *slot;
            }
        }
    }

    fn check_shape(&self, (rows, cols): (usize, usize)) -> Result<(), FftError> {
        if rows != self.rows || cols != self.cols {
            return Err(FftError::ShapeMismatch {
                expected_rows: self.rows,
                expected_cols: self.cols,
                rows,
                cols,
            });
        }
        Ok(())
    }
}

/// Circularly shift an image by half its size along both axes.
pub fn fftshift(image: &Array2<f64>) -> Array2<f64> {
    let (rows, cols) = image.dim();
    let mut shifted = Array2::<f64>::zeros((rows, cols));
    for ((row, col), value) in image.indexed_iter() {
        shifted[((row + rows / 2) % rows, (col + cols / 2) % cols)] = *value;
    }
    shifted
}

/// Power spectrum `|rfft(x, n)|² / n` of a real series zero-padded to `padded_len`.
#[derive(Clone)]
pub struct RealPowerSpectrum {
    padded_len: usize,
    plan: Arc<dyn Fft<f64>>,
}

impl RealPowerSpectrum {
    pub fn new(padded_len: usize) -> Result<Self, FftError> {
        if padded_len == 0 {
            return Err(FftError::EmptyInput);
        }
        let mut planner = FftPlanner::new();
        Ok(Self {
            padded_len,
            plan: planner.plan_fft_forward(padded_len),
        })
    }

    pub fn bin_count(&self) -> usize {
        self.padded_len / 2 + 1
    }

    /// Samples beyond `padded_len` are truncated, shorter inputs are zero-padded.
    pub fn power(&self, samples: impl IntoIterator<Item = f64>) -> Vec<f64> {
        let mut buffer = vec![Complex64::new(0.0, 0.0); self.padded_len];
        for (slot, value) in buffer.iter_mut().zip(samples) {
            *slot = Complex64::new(value, 0.0);
        }
        self.plan.process(&mut buffer);
        let norm = 1.0 / self.padded_len as f64;
        buffer
            .iter()
            .take(self.bin_count())
            .map(|value| value.norm_sqr() * norm)
            .collect()
    }
}

/// Frequencies of an rFFT with `bin_count` bins from an even-length series.
pub fn rfft_frequencies(bin_count: usize, sample_spacing: f64) -> Vec<f64> {
    if bin_count == 0 {
        return Vec::new();
    }
    let samples = 2 * (bin_count - 1);
    let span = samples.max(1) as f64 * sample_spacing;
    (0..bin_count).map(|k| k as f64 / span).collect()
}

pub fn next_power_of_two(len: usize) -> usize {
    len.max(1).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::{Fft2d, RealPowerSpectrum, fftshift, rfft_frequencies};
    use ndarray::Array2;

    #[test]
    fn forward_then_inverse_restores_image() {
        let image = Array2::from_shape_fn((6, 10), |(r, c)| (r * 10 + c) as f64 * 0.5 - 3.0);
        let plan = Fft2d::new(6, 10).expect("plan");
        let spectrum = plan.forward_real(&image).expect("forward");
        let restored = plan.inverse(&spectrum).expect("inverse");
        for (value, expected) in restored.iter().zip(image.iter()) {
            assert!((value.re - expected).abs() < 1.0e-10);
            assert!(value.im.abs() < 1.0e-10);
        }
    }

    #[test]
    fn dc_bin_holds_image_sum() {
        let image = Array2::from_elem((4, 4), 2.0);
        let spectrum = Fft2d::new(4, 4)
            .expect("plan")
            .forward_real(&image)
            .expect("forward");
        assert!((spectrum[(0, 0)].re - 32.0).abs() < 1.0e-12);
    }

    #[test]
    fn fftshift_moves_origin_to_center() {
        let mut image = Array2::<f64>::zeros((4, 6));
        image[(0, 0)] = 1.0;
        let shifted = fftshift(&image);
        assert_eq!(shifted[(2, 3)], 1.0);
    }

    #[test]
    fn power_spectrum_satisfies_parseval_for_tone() {
        let n = 64;
        let samples: Vec<f64> = (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * 4.0 * i as f64 / n as f64).cos())
            .collect();
        let power = RealPowerSpectrum::new(n).expect("plan").power(samples);
        assert_eq!(power.len(), 33);
        assert!((power[4] - 16.0).abs() < 1.0e-9, "bin 4 = {}", power[4]);
        assert!(power[5].abs() < 1.0e-9);
    }

    #[test]
    fn rfft_frequencies_span_to_nyquist() {
        let freq = rfft_frequencies(5, 0.5);
        assert_eq!(freq.len(), 5);
        assert!((freq[4] - 1.0).abs() < 1.0e-12);
        assert!((freq[1] - 0.25).abs() < 1.0e-12);
    }
}
