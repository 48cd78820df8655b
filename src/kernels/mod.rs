/*!
# Numeric kernels

Pure array functions used by the derivations of the data container:
 * [`median`]: median along an axis, restricted to the valid samples of a mask
 * [`median_filter`]: masked 3D median filter
 * [`fft_convolve`]: 1D convolution along an axis of an array by the mean of FFTs
 * [`ct_integrate`]: least-squares integration of a 2D gradient field

Every kernel runs in its own rayon thread pool of `num_threads` workers.
*/

use std::{f64::consts::PI, sync::Arc};

use ndarray::{Array, Array2, Array3, ArrayD, ArrayView, ArrayView2, ArrayView3, ArrayViewD, Axis, Dimension, Zip};
use rayon::prelude::*;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use strum_macros::{Display, EnumString};

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("axis {axis} is out of bounds for a {ndim}D array")]
    Axis { axis: usize, ndim: usize },
    #[error("mask shape {mask:?} doesn't match data shape {data:?}")]
    MaskShape { data: Vec<usize>, mask: Vec<usize> },
    #[error("invalid filter size: {0:?}")]
    Size([usize; 3]),
    #[error("the convolution kernel is empty")]
    EmptyKernel,
    #[error("gradient shapes differ: {0:?} and {1:?}")]
    Gradients(Vec<usize>, Vec<usize>),
    #[error("failed to build the kernel thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("failed to reshape the kernel output")]
    Shape(#[from] ndarray::ShapeError),
}
type Result<T> = std::result::Result<T, KernelError>;

/// Boundary mode: how an array is extended beyond its edges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Mode {
    /// `(d c b a | a b c d | d c b a)`
    #[default]
    Reflect,
    /// `(0 0 0 0 | a b c d | 0 0 0 0)`
    Constant,
    /// `(a a a a | a b c d | d d d d)`
    Nearest,
    /// `(d c b | a b c d | c b a)`
    Mirror,
    /// `(a b c d | a b c d | a b c d)`
    Wrap,
}
impl Mode {
    /// Maps the index `i` of the extended array into `0..n`, `None` stands for the constant zero
    pub fn extend(&self, i: isize, n: usize) -> Option<usize> {
        if n == 0 {
            return None;
        }
        let n = n as isize;
        if (0..n).contains(&i) {
            return Some(i as usize);
        }
        let index = match self {
            Mode::Constant => return None,
            Mode::Nearest => i.clamp(0, n - 1),
            Mode::Wrap => i.rem_euclid(n),
            Mode::Reflect => {
                let i = i.rem_euclid(2 * n);
                if i < n {
                    i
                } else {
                    2 * n - 1 - i
                }
            }
            Mode::Mirror => {
                if n == 1 {
                    0
                } else {
                    let i = i.rem_euclid(2 * n - 2);
                    if i < n {
                        i
                    } else {
                        2 * n - 2 - i
                    }
                }
            }
        };
        Some(index as usize)
    }
}

fn install<T, F>(num_threads: usize, op: F) -> Result<T>
where
    T: Send,
    F: FnOnce() -> T + Send,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads.max(1))
        .build()?;
    Ok(pool.install(op))
}

/// Returns the median of `values`, the mean of the two middle values for an even count
///
/// An empty slice has a zero median.
pub fn median_of(values: &mut [f64]) -> f64 {
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    let (_, &mut upper, _) = values.select_nth_unstable_by(n / 2, f64::total_cmp);
    if n % 2 == 1 {
        upper
    } else {
        let lower = values[..n / 2]
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        0.5 * (lower + upper)
    }
}

/// Median of `data` along `axis`
///
/// Only the samples where `mask` is true contribute, a lane without any valid sample is 0.
pub fn median(
    data: ArrayViewD<f64>,
    axis: usize,
    mask: Option<ArrayViewD<bool>>,
    num_threads: usize,
) -> Result<ArrayD<f64>> {
    if axis >= data.ndim() {
        return Err(KernelError::Axis {
            axis,
            ndim: data.ndim(),
        });
    }
    let lanes = data.lanes(Axis(axis));
    install(num_threads, || match mask {
        Some(mask) => {
            if mask.shape() != data.shape() {
                return Err(KernelError::MaskShape {
                    data: data.shape().to_vec(),
                    mask: mask.shape().to_vec(),
                });
            }
            Ok(Zip::from(lanes)
                .and(mask.lanes(Axis(axis)))
                .par_map_collect(|lane, valid| {
                    let mut values: Vec<f64> = lane
                        .iter()
                        .zip(valid.iter())
                        .filter_map(|(&v, &m)| m.then_some(v))
                        .collect();
                    median_of(&mut values)
                }))
        }
        None => Ok(Zip::from(lanes).par_map_collect(|lane| {
            let mut values = lane.to_vec();
            median_of(&mut values)
        })),
    })?
}

/// Multidimensional median filter of a stack of frames
///
/// The window of `size` is centered on each sample, the array is extended beyond
/// its edges according to `mode`. Samples where `mask` is false are left out of the windows.
pub fn median_filter(
    data: ArrayView3<f64>,
    size: [usize; 3],
    mask: Option<ArrayView3<bool>>,
    mode: Mode,
    num_threads: usize,
) -> Result<Array3<f64>> {
    if size.iter().any(|&s| s == 0) {
        return Err(KernelError::Size(size));
    }
    if let Some(mask) = &mask {
        if mask.shape() != data.shape() {
            return Err(KernelError::MaskShape {
                data: data.shape().to_vec(),
                mask: mask.shape().to_vec(),
            });
        }
    }
    let dim = data.dim();
    let (n0, n1, n2) = dim;
    let offsets = size.map(|s| (s / 2) as isize);
    let window = size.iter().product::<usize>();
    let values = install(num_threads, || {
        (0..n0 * n1 * n2)
            .into_par_iter()
            .map_init(
                || Vec::with_capacity(window),
                |buffer, flat| {
                    let (k, i, j) = (flat / (n1 * n2), (flat / n2) % n1, flat % n2);
                    buffer.clear();
                    for dk in 0..size[0] as isize {
                        let kk = mode.extend(k as isize + dk - offsets[0], n0);
                        for di in 0..size[1] as isize {
                            let ii = mode.extend(i as isize + di - offsets[1], n1);
                            for dj in 0..size[2] as isize {
                                let jj = mode.extend(j as isize + dj - offsets[2], n2);
                                match (kk, ii, jj) {
                                    (Some(kk), Some(ii), Some(jj)) => {
                                        let valid =
                                            mask.as_ref().map_or(true, |mask| mask[[kk, ii, jj]]);
                                        if valid {
                                            buffer.push(data[[kk, ii, jj]]);
                                        }
                                    }
                                    _ => buffer.push(0.0),
                                }
                            }
                        }
                    }
                    median_of(buffer)
                },
            )
            .collect::<Vec<f64>>()
    })?;
    Ok(Array3::from_shape_vec(dim, values)?)
}

/// Convolution of `data` with a 1D `kernel` along `axis`
///
/// The kernel is centered on each sample, the array is extended beyond its edges
/// according to `mode`. The output has the shape of `data`.
pub fn fft_convolve<D: Dimension>(
    data: ArrayView<f64, D>,
    kernel: &[f64],
    mode: Mode,
    axis: usize,
    num_threads: usize,
) -> Result<Array<f64, D>> {
    if axis >= data.ndim() {
        return Err(KernelError::Axis {
            axis,
            ndim: data.ndim(),
        });
    }
    if kernel.is_empty() {
        return Err(KernelError::EmptyKernel);
    }
    let n = data.len_of(Axis(axis));
    let k = kernel.len();
    let mut output = data.to_owned();
    if n == 0 {
        return Ok(output);
    }
    let pad = k - 1 - k / 2;
    let fft_size = (n + 2 * k - 2).next_power_of_two();
    let mut planner = FftPlanner::new();
    let forward: Arc<dyn Fft<f64>> = planner.plan_fft_forward(fft_size);
    let inverse: Arc<dyn Fft<f64>> = planner.plan_fft_inverse(fft_size);

    let mut kernel_fft = vec![Complex::new(0.0, 0.0); fft_size];
    kernel_fft
        .iter_mut()
        .zip(kernel)
        .for_each(|(c, &w)| *c = Complex::new(w, 0.0));
    forward.process(&mut kernel_fft);

    install(num_threads, || {
        Zip::from(output.lanes_mut(Axis(axis))).par_for_each(|mut lane| {
            let mut buffer = vec![Complex::new(0.0, 0.0); fft_size];
            for (m, c) in buffer.iter_mut().take(n + k - 1).enumerate() {
                if let Some(index) = mode.extend(m as isize - pad as isize, n) {
                    *c = Complex::new(lane[index], 0.0);
                }
            }
            forward.process(&mut buffer);
            buffer
                .iter_mut()
                .zip(&kernel_fft)
                .for_each(|(c, w)| *c *= *w);
            inverse.process(&mut buffer);
            let norm = fft_size as f64;
            lane.iter_mut()
                .zip(&buffer[k - 1..k - 1 + n])
                .for_each(|(v, c)| *v = c.re / norm);
        })
    })?;
    Ok(output)
}

/// In-place 2D FFT of a complex array
fn fft2(data: &mut Array2<Complex<f64>>, planner: &mut FftPlanner<f64>, inverse: bool) {
    let (rows, cols) = data.dim();
    let plan = |planner: &mut FftPlanner<f64>, n: usize| {
        if inverse {
            planner.plan_fft_inverse(n)
        } else {
            planner.plan_fft_forward(n)
        }
    };
    let row_fft = plan(planner, cols);
    let col_fft = plan(planner, rows);
    let mut buffer = vec![Complex::new(0.0, 0.0); rows.max(cols)];
    for mut lane in data.lanes_mut(Axis(1)) {
        let buffer = &mut buffer[..cols];
        buffer.iter_mut().zip(lane.iter()).for_each(|(b, v)| *b = *v);
        row_fft.process(buffer);
        lane.iter_mut().zip(buffer.iter()).for_each(|(v, b)| *v = *b);
    }
    for mut lane in data.lanes_mut(Axis(0)) {
        let buffer = &mut buffer[..rows];
        buffer.iter_mut().zip(lane.iter()).for_each(|(b, v)| *b = *v);
        col_fft.process(buffer);
        lane.iter_mut().zip(buffer.iter()).for_each(|(v, b)| *v = *b);
    }
}

/// Sample frequencies of a discrete Fourier transform of length `n`, in cycles per sample
fn fftfreq(n: usize) -> impl Iterator<Item = f64> {
    (0..n).map(move |i| {
        let i = if i < n.div_ceil(2) {
            i as f64
        } else {
            i as f64 - n as f64
        };
        i / n as f64
    })
}

/// Integrates the gradient field `(sy, sx)` into the surface it derives from
///
/// Least-squares solution in Fourier space (Frankot-Chellappa) of the gradient field
/// extended with its even mirror images, the result is defined up to a constant.
pub fn ct_integrate(sy: ArrayView2<f64>, sx: ArrayView2<f64>) -> Result<Array2<f64>> {
    if sy.shape() != sx.shape() {
        return Err(KernelError::Gradients(
            sy.shape().to_vec(),
            sx.shape().to_vec(),
        ));
    }
    let (rows, cols) = sy.dim();
    if rows == 0 || cols == 0 {
        return Ok(Array2::zeros((rows, cols)));
    }
    let extend = |s: &ArrayView2<f64>, flip_x_sign: f64, flip_y_sign: f64| {
        Array2::from_shape_fn((2 * rows, 2 * cols), |(i, j)| {
            let (ii, sign_y) = if i < rows {
                (i, 1.0)
            } else {
                (2 * rows - 1 - i, flip_y_sign)
            };
            let (jj, sign_x) = if j < cols {
                (j, 1.0)
            } else {
                (2 * cols - 1 - j, flip_x_sign)
            };
            Complex::new(sign_y * sign_x * s[[ii, jj]], 0.0)
        })
    };
    let mut sy_ext = extend(&sy, 1.0, -1.0);
    let mut sx_ext = extend(&sx, -1.0, 1.0);

    let mut planner = FftPlanner::new();
    fft2(&mut sy_ext, &mut planner, false);
    fft2(&mut sx_ext, &mut planner, false);

    let ky: Vec<f64> = fftfreq(2 * rows).map(|f| 2.0 * PI * f).collect();
    let kx: Vec<f64> = fftfreq(2 * cols).map(|f| 2.0 * PI * f).collect();
    let i_unit = Complex::new(0.0, 1.0);
    let mut phi = Array2::from_shape_fn((2 * rows, 2 * cols), |(i, j)| {
        let k_sq = ky[i] * ky[i] + kx[j] * kx[j];
        if k_sq == 0.0 {
            Complex::new(0.0, 0.0)
        } else {
            -i_unit * (sy_ext[[i, j]] * ky[i] + sx_ext[[i, j]] * kx[j]) / k_sq
        }
    });
    fft2(&mut phi, &mut planner, true);
    let norm = (4 * rows * cols) as f64;
    Ok(Array2::from_shape_fn((rows, cols), |(i, j)| {
        phi[[i, j]].re / norm
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    #[test]
    fn boundary_modes() {
        let reflect: Vec<_> = (-4..8).map(|i| Mode::Reflect.extend(i, 4)).collect();
        let expected: Vec<_> = [3, 2, 1, 0, 0, 1, 2, 3, 3, 2, 1, 0]
            .into_iter()
            .map(Some)
            .collect();
        assert_eq!(reflect, expected);
        assert_eq!(Mode::Mirror.extend(-1, 4), Some(1));
        assert_eq!(Mode::Mirror.extend(4, 4), Some(2));
        assert_eq!(Mode::Nearest.extend(-3, 4), Some(0));
        assert_eq!(Mode::Wrap.extend(5, 4), Some(1));
        assert_eq!(Mode::Constant.extend(-1, 4), None);
        assert_eq!(Mode::Reflect.extend(-9, 2), Some(0));
    }

    #[test]
    fn median_values() {
        assert_eq!(median_of(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median_of(&mut [4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(median_of(&mut []), 0.0);
    }

    #[test]
    fn masked_median() {
        let data = array![[1.0, 10.0, 3.0], [2.0, 20.0, 4.0], [100.0, 30.0, 5.0]].into_dyn();
        let mask = array![[true, true, false], [true, true, false], [false, true, false]].into_dyn();
        let out = median(data.view(), 0, Some(mask.view()), 2).unwrap();
        assert_eq!(out, array![1.5, 20.0, 0.0].into_dyn());
        let out = median(data.view(), 1, None, 1).unwrap();
        assert_eq!(out, array![3.0, 4.0, 30.0].into_dyn());
        assert!(median(data.view(), 2, None, 1).is_err());
    }

    #[test]
    fn median_filter_removes_spike() {
        let mut data = Array3::from_elem((1, 5, 5), 1.0);
        data[[0, 2, 2]] = 100.0;
        let out = median_filter(data.view(), [1, 3, 3], None, Mode::Reflect, 2).unwrap();
        assert!(out.iter().all(|&v| v == 1.0));
        assert!(median_filter(data.view(), [0, 3, 3], None, Mode::Reflect, 2).is_err());
    }

    #[test]
    fn median_filter_mask() {
        let data = Array3::from_shape_fn((5, 1, 1), |(k, _, _)| k as f64);
        let mut mask = Array3::from_elem((5, 1, 1), true);
        mask[[2, 0, 0]] = false;
        let out = median_filter(data.view(), [3, 1, 1], Some(mask.view()), Mode::Reflect, 1)
            .unwrap();
        assert_eq!(out[[2, 0, 0]], 2.0);
        assert_eq!(out[[0, 0, 0]], 0.0);
        assert_eq!(out[[4, 0, 0]], 4.0);
    }

    #[test]
    fn convolution_matches_direct_sum() {
        let data = Array2::from_shape_fn((3, 11), |(i, j)| ((i * 7 + j * 3) % 5) as f64 + 0.5);
        let kernel = [0.2, 0.5, 0.3, 0.1];
        let out = fft_convolve(data.view(), &kernel, Mode::Reflect, 1, 2).unwrap();
        let k = kernel.len() as isize;
        for ((i, j), &value) in out.indexed_iter() {
            let expected: f64 = (0..k)
                .map(|m| {
                    let index = Mode::Reflect.extend(j as isize + k / 2 - m, 11).unwrap();
                    kernel[m as usize] * data[[i, index]]
                })
                .sum();
            assert!((value - expected).abs() < 1e-12, "{value} != {expected}");
        }
    }

    #[test]
    fn box_filter_keeps_constant() {
        let data = Array2::from_elem((4, 6), 3.0);
        let kernel = vec![1.0 / 9.0; 9];
        let out = fft_convolve(data.view(), &kernel, Mode::Reflect, 0, 1).unwrap();
        assert!(out.iter().all(|v| (v - 3.0).abs() < 1e-12));
        assert!(fft_convolve(data.view(), &[], Mode::Reflect, 0, 1).is_err());
    }

    #[test]
    fn integrate_cosine() {
        let (rows, cols) = (4, 16);
        let w = cols as f64;
        let x = Array1::from_iter((0..cols).map(|j| PI * (j as f64 + 0.5) / w));
        let phi = Array2::from_shape_fn((rows, cols), |(_, j)| x[j].cos());
        let sx = Array2::from_shape_fn((rows, cols), |(_, j)| -PI / w * x[j].sin());
        let sy = Array2::zeros((rows, cols));
        let out = ct_integrate(sy.view(), sx.view()).unwrap();
        let offset = out.mean().unwrap() - phi.mean().unwrap();
        for (a, b) in out.iter().zip(phi.iter()) {
            assert!((a - offset - b).abs() < 1e-9, "{a} != {b}");
        }
    }

    #[test]
    fn integrate_mismatched_gradients() {
        let sy = Array2::<f64>::zeros((2, 3));
        let sx = Array2::<f64>::zeros((3, 2));
        assert!(matches!(
            ct_integrate(sy.view(), sx.view()),
            Err(KernelError::Gradients(..))
        ));
    }
}
