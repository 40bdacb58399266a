//! Interpixel (IPC) and post-pixel (PPC) coupling kernels measured from
//! isolated hot pixels in the dark ramp.

pub mod deconvolve;

pub use deconvolve::{
    DeconvolvedSupers, KernelDeconvolver, KernelSpectrum, convolve, deconvolve, deconvolve_image,
    deconvolve_ppc, deconvolve_supers,
};

use crate::common::KernelConfig;
use crate::detector::{DetectorGeometry, ScanDirection};
use crate::domain::{CalibError, CalibResult, CalibrationStage};
use crate::numerics::{median_filter, median_in_place, median_stack, robust_mean_stack, robust_std_stack};
use ndarray::{Array2, Array3, ArrayView2, Axis, array, s, stack};
use serde::Serialize;

/// 3x3 kernel normalized to unit sum, with its per-cell uncertainty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CouplingKernel {
    pub values: Array2<f64>,
    pub sigma: Array2<f64>,
}

impl CouplingKernel {
    /// Leak into the right-hand neighbor, `values[1, 2]`, with its sigma.
    pub fn coupling_fraction(&self) -> (f64, f64) {
        (self.values[(1, 2)], self.sigma[(1, 2)])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CouplingKernels {
    pub ipc: CouplingKernel,
    pub ppc: Option<CouplingKernel>,
}

/// Kernels measured from one difference image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageKernels {
    pub ipc: Array2<f64>,
    pub ppc: Option<Array2<f64>>,
    pub candidates: usize,
}

fn symmetric_kernel(edge: f64, corner: f64) -> Array2<f64> {
    let kernel = array![
        [corner, edge, corner],
        [edge, 1.0 - 4.0 * edge, edge],
        [corner, edge, corner]
    ];
    let total = kernel.sum();
    kernel / total
}

fn post_pixel_kernel(leak: f64) -> Array2<f64> {
    let mut kernel = Array2::<f64>::zeros((3, 3));
    kernel[(1, 1)] = 1.0 - leak;
    kernel[(1, 2)] = leak;
    let total = kernel.sum();
    kernel / total
}

/// Hot-pixel locations inside the cut window, clear of borders, channel seams
/// and each other.
pub fn isolated_hot_pixels(
    image: ArrayView2<'_, f64>,
    geometry: &DetectorGeometry,
    config: &KernelConfig,
) -> Vec<(usize, usize)> {
    let (rows, cols) = image.dim();
    let half = config.box_size / 2;
    let margin = config.edge_margin + half;
    if rows <= 2 * margin || cols <= 2 * margin {
        return Vec::new();
    }

    let on_seam = |col: usize| {
        (1..geometry.channel_count).any(|channel| {
            let seam = channel * geometry.channel_width;
            col + half >= seam && col < seam + half
        })
    };
    let candidates: Vec<(usize, usize)> = (margin..rows - margin)
        .flat_map(|row| (margin..cols - margin).map(move |col| (row, col)))
        .filter(|&(row, col)| {
            let value = image[(row, col)];
            value > config.low_cut && value < config.high_cut && !on_seam(col)
        })
        .collect();

    let min_distance = (std::f64::consts::SQRT_2 * half as f64).ceil();
    candidates
        .iter()
        .filter(|&&(row, col)| {
            !candidates.iter().any(|&(other_row, other_col)| {
                let dy = row as f64 - other_row as f64;
                let dx = col as f64 - other_col as f64;
                let distance = dx.hypot(dy);
                distance > 0.0 && distance < min_distance
            })
        })
        .copied()
        .collect()
}

/// Estimate kernels from one image; `None` when it holds no isolated hot pixel.
pub fn image_kernels(
    image: ArrayView2<'_, f64>,
    geometry: &DetectorGeometry,
    config: &KernelConfig,
) -> Option<ImageKernels> {
    let hot = isolated_hot_pixels(image, geometry, config);
    if hot.is_empty() {
        return None;
    }
    let half = config.box_size / 2;
    let size = 2 * half + 1;

    let cutouts: Vec<Array2<f64>> = hot
        .iter()
        .map(|&(row, col)| {
            let window = image.slice(s![row - half..=row + half, col - half..=col + half]);
            let mut cutout = if config.compute_ppc
                && geometry.scan_direction(geometry.channel_of_column(col)) == ScanDirection::Reverse
            {
                window.slice(s![.., ..;-1]).to_owned()
            } else {
                window.to_owned()
            };
            if size > 3 && config.box_background_remove {
                let mut edges: Vec<f64> = cutout.row(0).to_vec();
                edges.extend(cutout.column(0).iter());
                edges.extend(cutout.row(size - 1).iter());
                edges.extend(cutout.column(size - 1).iter());
                let background = median_in_place(&mut edges).unwrap_or(0.0);
                cutout -= background;
            }
            let core = cutout.slice(s![half - 1..=half + 1, half - 1..=half + 1]).sum();
            cutout / core
        })
        .collect();

    let views: Vec<_> = cutouts.iter().map(Array2::view).collect();
    let stacked = stack(Axis(0), &views).ok()?;
    let average = median_stack(stacked.view());
    let at = |dr: isize, dc: isize| {
        average[(
            (half as isize + dr) as usize,
            (half as isize + dc) as usize,
        )]
    };

    let corner = ((at(-1, -1) + at(1, 1) + at(1, -1) + at(-1, 1)) / 4.0).max(0.0);
    let (ipc, ppc) = if config.compute_ppc {
        let edge = ((at(-1, 0) + at(0, -1) + at(1, 0)) / 3.0).max(0.0);
        let leak = (at(0, 1) - edge).max(0.0);
        (symmetric_kernel(edge, corner), Some(post_pixel_kernel(leak)))
    } else {
        let edge = ((at(-1, 0) + at(0, -1) + at(0, 1) + at(1, 0)) / 4.0).max(0.0);
        (symmetric_kernel(edge, corner), None)
    };

    Some(ImageKernels {
        ipc,
        ppc,
        candidates: hot.len(),
    })
}

fn aggregate(estimates: &[Array2<f64>]) -> Option<CouplingKernel> {
    let views: Vec<_> = estimates.iter().map(Array2::view).collect();
    let stacked: Array3<f64> = stack(Axis(0), &views).ok()?;
    let values = robust_mean_stack(stacked.view());
    let sigma = robust_std_stack(stacked.view());
    let norm = values.sum();
    Some(CouplingKernel {
        values: values / norm,
        sigma: sigma / norm,
    })
}

/// Measure coupling kernels from the super dark ramp.
///
/// `super_dark` is the slope image used for the smooth background and `times`
/// the group times of the ramp. Returns `None` when fewer than two isolated
/// hot pixels are found across all sampled images.
pub fn estimate_kernels(
    super_dark_ramp: &Array3<f64>,
    super_dark: &Array2<f64>,
    times: &[f64],
    geometry: &DetectorGeometry,
    config: &KernelConfig,
) -> CalibResult<Option<CouplingKernels>> {
    let frames = super_dark_ramp.len_of(Axis(0));
    if frames < 2 || times.len() < frames {
        return Err(CalibError::invalid_configuration(
            "CONFIG.KERNEL_RAMP",
            format!(
                "kernel estimation needs at least 2 groups with times, got {frames} groups and {} times",
                times.len()
            ),
        ));
    }
    if super_dark.dim() != geometry.shape() || super_dark_ramp.dim().1 != geometry.rows {
        return Err(CalibError::invalid_configuration(
            "CONFIG.CUBE_SHAPE",
            "super dark and geometry disagree on the detector shape",
        ));
    }

    let background = if config.background_remove {
        median_filter(super_dark, config.background_filter_size)
    } else {
        Array2::zeros(super_dark.dim())
    };

    let first = super_dark_ramp.index_axis(Axis(0), 0);
    let mut differences = super_dark_ramp.slice(s![1.., .., ..]).to_owned();
    for (index, mut image) in differences.axis_iter_mut(Axis(0)).enumerate() {
        image -= &first;
        image.scaled_add(-(times[index + 1] - times[0]), &background);
        for channel in 0..geometry.channel_count {
            let mut slab = image.slice_mut(s![.., geometry.channel_columns(channel)]);
            let mut values: Vec<f64> = slab.iter().copied().collect();
            let level = median_in_place(&mut values).unwrap_or(0.0);
            slab -= level;
        }
    }

    let last = differences.index_axis(Axis(0), differences.len_of(Axis(0)) - 1);
    let mut ipc_estimates = Vec::new();
    let mut ppc_estimates = Vec::new();
    let mut candidates = 0;
    for image in differences.axis_iter(Axis(0)).step_by(config.stride.max(1)) {
        let diff = &last - &image;
        if let Some(kernels) = image_kernels(diff.view(), geometry, config) {
            candidates += kernels.candidates;
            ipc_estimates.push(kernels.ipc);
            ppc_estimates.extend(kernels.ppc);
        }
    }

    if candidates < 2 {
        tracing::warn!(
            stage = %CalibrationStage::Kernels,
            candidates,
            "insufficient isolated hot pixels for coupling kernels"
        );
        return Ok(None);
    }

    let Some(ipc) = aggregate(&ipc_estimates) else {
        return Ok(None);
    };
    let ppc = if config.compute_ppc {
        aggregate(&ppc_estimates)
    } else {
        None
    };

    let (alpha, alpha_sigma) = ipc.coupling_fraction();
    tracing::info!(
        stage = %CalibrationStage::Kernels,
        images = ipc_estimates.len(),
        candidates,
        "IPC = {:.3}% +/- {:.3}%",
        alpha * 100.0,
        alpha_sigma * 100.0
    );
    if let Some(ppc) = &ppc {
        let (leak, leak_sigma) = ppc.coupling_fraction();
        tracing::info!(
            stage = %CalibrationStage::Kernels,
            "PPC = {:.3}% +/- {:.3}%",
            leak * 100.0,
            leak_sigma * 100.0
        );
    }

    Ok(Some(CouplingKernels { ipc, ppc }))
}
