use super::robust::median_in_place;
use ndarray::Array2;

/// Square median filter with half-sample symmetric (`d c b a | a b c d`) edges.
///
/// Even sizes are widened by one so the footprint stays centered.
pub fn median_filter(image: &Array2<f64>, size: usize) -> Array2<f64> {
    let (rows, cols) = image.dim();
    if rows == 0 || cols == 0 || size <= 1 {
        return image.clone();
    }
    let size = if size % 2 == 0 { size + 1 } else { size };
    let half = (size / 2) as isize;

    let mut window = Vec::with_capacity(size * size);
    Array2::from_shape_fn((rows, cols), |(row, col)| {
        window.clear();
        for dr in -half..=half {
            let r = reflect_index(row as isize + dr, rows);
            for dc in -half..=half {
                let c = reflect_index(col as isize + dc, cols);
                window.push(image[(r, c)]);
            }
        }
        median_in_place(&mut window).unwrap_or(f64::NAN)
    })
}

fn reflect_index(index: isize, len: usize) -> usize {
    let len = len as isize;
    let period = 2 * len;
    let mut wrapped = index.rem_euclid(period);
    if wrapped >= len {
        wrapped = period - 1 - wrapped;
    }
    wrapped as usize
}

#[cfg(test)]
mod tests {
    use super::{median_filter, reflect_index};
    use ndarray::Array2;

    #[test]
    fn reflection_mirrors_edge_samples() {
        assert_eq!(reflect_index(-1, 5), 0);
        assert_eq!(reflect_index(-2, 5), 1);
        assert_eq!(reflect_index(5, 5), 4);
        assert_eq!(reflect_index(6, 5), 3);
        assert_eq!(reflect_index(2, 5), 2);
    }

    #[test]
    fn isolated_spike_is_removed() {
        let mut image = Array2::from_elem((9, 9), 3.0);
        image[(4, 4)] = 1000.0;
        let filtered = median_filter(&image, 3);
        assert!(filtered.iter().all(|value| (*value - 3.0).abs() < 1.0e-12));
    }

    #[test]
    fn linear_ramp_survives_interior() {
        let image = Array2::from_shape_fn((10, 12), |(r, c)| r as f64 + 2.0 * c as f64);
        let filtered = median_filter(&image, 3);
        for row in 1..9 {
            for col in 1..11 {
                assert!((filtered[(row, col)] - image[(row, col)]).abs() < 1.0e-12);
            }
        }
    }
}
