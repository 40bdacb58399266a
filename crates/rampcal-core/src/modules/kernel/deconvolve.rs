//! FFT convolution and deconvolution with small coupling kernels.
//!
//! The kernel is centered at `(rows / 2, cols / 2)` of a zero image before the
//! transform, so every result is `fftshift`ed back into place.

use super::CouplingKernels;
use crate::common::constants::KERNEL_SPECTRUM_FLOOR;
use crate::detector::DetectorGeometry;
use crate::domain::{CalibError, CalibResult};
use crate::numerics::{Fft2d, fftshift};
use ndarray::{Array2, s};
use num_complex::Complex64;

/// Forward transform of a kernel embedded in an image of fixed shape.
#[derive(Debug, Clone)]
pub struct KernelSpectrum {
    plan: Fft2d,
    spectrum: Array2<Complex64>,
    near_zero_bins: usize,
}

impl KernelSpectrum {
    pub fn new(kernel: &Array2<f64>, shape: (usize, usize)) -> CalibResult<Self> {
        let (rows, cols) = shape;
        let (kernel_rows, kernel_cols) = kernel.dim();
        if kernel_rows > rows || kernel_cols > cols {
            return Err(CalibError::invalid_configuration(
                "CONFIG.KERNEL_SHAPE",
                format!("{kernel_rows}x{kernel_cols} kernel does not fit a {rows}x{cols} image"),
            ));
        }

        let mut embedded = Array2::<f64>::zeros(shape);
        let row0 = rows / 2 - kernel_rows / 2;
        let col0 = cols / 2 - kernel_cols / 2;
        embedded
            .slice_mut(s![row0..row0 + kernel_rows, col0..col0 + kernel_cols])
            .assign(kernel);

        let plan = Fft2d::new(rows, cols)?;
        let spectrum = plan.forward_real(&embedded)?;
        let near_zero_bins = spectrum
            .iter()
            .filter(|value| value.norm() < KERNEL_SPECTRUM_FLOOR)
            .count();
        if near_zero_bins > 0 {
            tracing::warn!(
                bins = near_zero_bins,
                rows,
                cols,
                "kernel spectrum has near-zero bins, passing them through unchanged"
            );
        }
        Ok(Self {
            plan,
            spectrum,
            near_zero_bins,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        self.plan.shape()
    }

    pub fn near_zero_bins(&self) -> usize {
        self.near_zero_bins
    }

    fn divisor(&self, bin: Complex64) -> Complex64 {
        if bin.norm() < KERNEL_SPECTRUM_FLOOR {
            Complex64::new(1.0, 0.0)
        } else {
            bin
        }
    }

    fn apply(&self, image: &Array2<f64>, divide: bool) -> CalibResult<Array2<f64>> {
        let mut transformed = self.plan.forward_real(image)?;
        for (value, bin) in transformed.iter_mut().zip(self.spectrum.iter()) {
            if divide {
                *value /= self.divisor(*bin);
            } else {
                *value *= *bin;
            }
        }
        let restored = self.plan.inverse(&transformed)?;
        Ok(fftshift(&restored.mapv(|value| value.re)))
    }
}

/// Remove the kernel's blur from `image`.
///
/// The image is biased non-negative by its minimum for the division and the
/// minimum is restored afterwards.
pub fn deconvolve(image: &Array2<f64>, spectrum: &KernelSpectrum) -> CalibResult<Array2<f64>> {
    let minimum = image
        .iter()
        .copied()
        .filter(|value| value.is_finite())
        .min_by(f64::total_cmp)
        .unwrap_or(0.0);
    let biased = image.mapv(|value| value - minimum);
    let mut result = spectrum.apply(&biased, true)?;
    result.mapv_inplace(|value| value + minimum);
    Ok(result)
}

pub fn convolve(image: &Array2<f64>, spectrum: &KernelSpectrum) -> CalibResult<Array2<f64>> {
    spectrum.apply(image, false)
}

/// PPC deconvolution channel by channel in readout order.
///
/// One kernel spectrum at the channel shape is shared by every channel.
pub fn deconvolve_ppc(
    image: &Array2<f64>,
    kernel: &Array2<f64>,
    geometry: &DetectorGeometry,
) -> CalibResult<Array2<f64>> {
    let spectrum = KernelSpectrum::new(kernel, (geometry.rows, geometry.channel_width))?;
    deconvolve_ppc_with(image, &spectrum, geometry)
}

fn deconvolve_ppc_with(
    image: &Array2<f64>,
    spectrum: &KernelSpectrum,
    geometry: &DetectorGeometry,
) -> CalibResult<Array2<f64>> {
    let mut output = image.clone();
    for channel in 0..geometry.channel_count {
        let slab = geometry.channel_in_readout_order(image.view(), channel);
        let corrected = deconvolve(&slab, spectrum)?;
        geometry.store_channel(output.view_mut(), channel, &corrected);
    }
    Ok(output)
}

/// Spectra for repeated deconvolution of same-shaped images.
#[derive(Debug, Clone)]
pub struct KernelDeconvolver {
    ipc: KernelSpectrum,
    ppc: Option<KernelSpectrum>,
    geometry: DetectorGeometry,
}

impl KernelDeconvolver {
    pub fn new(kernels: &CouplingKernels, geometry: &DetectorGeometry) -> CalibResult<Self> {
        let ipc = KernelSpectrum::new(&kernels.ipc.values, geometry.shape())?;
        let ppc = kernels
            .ppc
            .as_ref()
            .map(|kernel| KernelSpectrum::new(&kernel.values, (geometry.rows, geometry.channel_width)))
            .transpose()?;
        Ok(Self {
            ipc,
            ppc,
            geometry: *geometry,
        })
    }

    /// PPC first, on raw readout order, then IPC.
    pub fn apply(&self, image: &Array2<f64>) -> CalibResult<Array2<f64>> {
        let image = match &self.ppc {
            Some(ppc) => deconvolve_ppc_with(image, ppc, &self.geometry)?,
            None => image.clone(),
        };
        deconvolve(&image, &self.ipc)
    }
}

pub fn deconvolve_image(
    image: &Array2<f64>,
    kernels: &CouplingKernels,
    geometry: &DetectorGeometry,
) -> CalibResult<Array2<f64>> {
    KernelDeconvolver::new(kernels, geometry)?.apply(image)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeconvolvedSupers {
    pub super_bias: Array2<f64>,
    pub super_dark: Array2<f64>,
}

pub fn deconvolve_supers(
    super_bias: &Array2<f64>,
    super_dark: &Array2<f64>,
    kernels: &CouplingKernels,
    geometry: &DetectorGeometry,
) -> CalibResult<DeconvolvedSupers> {
    let deconvolver = KernelDeconvolver::new(kernels, geometry)?;
    Ok(DeconvolvedSupers {
        super_bias: deconvolver.apply(super_bias)?,
        super_dark: deconvolver.apply(super_dark)?,
    })
}

#[cfg(test)]
mod tests {
    use super::{KernelSpectrum, convolve, deconvolve, deconvolve_ppc};
    use crate::detector::{DetectorGeometry, ReferenceBorders, ScanLayout};
    use ndarray::{Array2, array};

    fn ipc_kernel(alpha: f64) -> Array2<f64> {
        array![
            [0.0, alpha, 0.0],
            [alpha, 1.0 - 4.0 * alpha, alpha],
            [0.0, alpha, 0.0]
        ]
    }

    #[test]
    fn convolution_spreads_a_point_source_symmetrically() {
        let mut image = Array2::<f64>::zeros((16, 16));
        image[(8, 8)] = 1000.0;
        let spectrum = KernelSpectrum::new(&ipc_kernel(0.02), (16, 16)).expect("spectrum");
        let blurred = convolve(&image, &spectrum).expect("convolve");
        assert!((blurred[(8, 8)] - 920.0).abs() < 1.0e-8);
        assert!((blurred[(7, 8)] - 20.0).abs() < 1.0e-8);
        assert!((blurred[(8, 9)] - 20.0).abs() < 1.0e-8);
        assert!(blurred[(7, 7)].abs() < 1.0e-8);
        assert!((blurred.sum() - 1000.0).abs() < 1.0e-6);
    }

    #[test]
    fn deconvolution_undoes_convolution() {
        let image = Array2::from_shape_fn((12, 12), |(r, c)| ((r * 7 + c * 3) % 11) as f64 - 2.0);
        let spectrum = KernelSpectrum::new(&ipc_kernel(0.015), (12, 12)).expect("spectrum");
        let blurred = convolve(&image, &spectrum).expect("convolve");
        let restored = deconvolve(&blurred, &spectrum).expect("deconvolve");
        for (value, expected) in restored.iter().zip(image.iter()) {
            assert!((value - expected).abs() < 1.0e-8, "{value} vs {expected}");
        }
    }

    #[test]
    fn zero_spectrum_bins_pass_through_finite() {
        // A two-tap average has an exact zero at the Nyquist column.
        let kernel = array![[0.5, 0.5]];
        let spectrum = KernelSpectrum::new(&kernel, (4, 4)).expect("spectrum");
        assert!(spectrum.near_zero_bins() > 0);
        let image = Array2::from_shape_fn((4, 4), |(r, c)| (r + 2 * c) as f64);
        let result = deconvolve(&image, &spectrum).expect("deconvolve");
        assert!(result.iter().all(|value| value.is_finite()));
    }

    #[test]
    fn ppc_deconvolution_respects_scan_direction() {
        let geometry = DetectorGeometry {
            rows: 8,
            cols: 16,
            channel_count: 2,
            channel_width: 8,
            borders: ReferenceBorders::default(),
            scan_layout: ScanLayout::default(),
        };
        let ppc = array![[0.0, 0.0, 0.0], [0.0, 0.9, 0.1], [0.0, 0.0, 0.0]];
        let mut truth = Array2::<f64>::zeros((8, 16));
        truth[(4, 3)] = 100.0;
        truth[(4, 11)] = 100.0;

        // Channel 1 reads right to left, so its leak lands on the left neighbor.
        let mut observed = truth.clone();
        observed[(4, 3)] = 90.0;
        observed[(4, 4)] = 10.0;
        observed[(4, 11)] = 90.0;
        observed[(4, 10)] = 10.0;

        let restored = deconvolve_ppc(&observed, &ppc, &geometry).expect("deconvolve");
        for (value, expected) in restored.iter().zip(truth.iter()) {
            assert!((value - expected).abs() < 1.0e-6, "{value} vs {expected}");
        }
    }
}
