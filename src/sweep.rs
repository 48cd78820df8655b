/*!
# Defocus sweep

Estimates the focus to sample distance by scanning a set of candidate defocus distances.
For each candidate the reference image is updated by the speckle tracking solver and scored
with the mean of its local variance, the sharpest reference image giving the best candidate.

The sample translations in pixels scale as the inverse of the defocus distance, so the solver
built for the mean candidate is reused throughout the sweep by rescaling its pixel offsets.
*/

use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array2, ArrayView2, Axis, Slice};
use serde::{Deserialize, Serialize};

use crate::{
    data::{DataError, Result, STData},
    kernels::{self, Mode},
    tracking::{SpeckleTracking, TrackingConfig},
};

/// Defocus sweep configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Local variance window size [pixels]
    pub size: usize,
    /// Kernel bandwidth, estimated by the solver if `None`
    pub hval: Option<f64>,
    /// Returns the reference images and the local variance maps
    pub return_extra: bool,
    pub verbose: bool,
    pub tracking: TrackingConfig,
}
impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            size: 51,
            hval: None,
            return_extra: false,
            verbose: true,
            tracking: TrackingConfig::default(),
        }
    }
}
impl SweepConfig {
    pub fn size(self, size: usize) -> Self {
        Self { size, ..self }
    }
    pub fn hval(self, hval: f64) -> Self {
        Self {
            hval: Some(hval),
            ..self
        }
    }
    pub fn return_extra(self, return_extra: bool) -> Self {
        Self {
            return_extra,
            ..self
        }
    }
    pub fn verbose(self, verbose: bool) -> Self {
        Self { verbose, ..self }
    }
    pub fn tracking(self, tracking: TrackingConfig) -> Self {
        Self { tracking, ..self }
    }
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(DataError::invalid("size", self.size));
        }
        if let Some(hval) = self.hval {
            if !(hval.is_finite() && hval > 0.0) {
                return Err(DataError::invalid("hval", hval));
            }
        }
        self.tracking.validate()
    }
}

/// Reference images and local variance maps of a sweep
#[derive(Debug, Clone, Default)]
pub struct SweepExtra {
    pub reference_images: Vec<Array2<f64>>,
    pub r_images: Vec<Array2<f64>>,
}

/// Defocus sweep scores
#[derive(Debug, Clone, Default)]
pub struct SweepResult {
    /// Mean local variance of the reference image for each candidate
    pub r_values: Vec<f64>,
    pub extra: Option<SweepExtra>,
}
impl SweepResult {
    /// Index of the candidate with the sharpest reference image
    pub fn best(&self) -> Option<usize> {
        self.r_values
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_finite())
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(index, _)| index)
    }
}

/// Normalized local variance `(<I²> - <I>²) / <I>²` of an image
///
/// The local averages are computed over a `size` wide box along every axis longer than
/// `size`, the edges of these axes are trimmed by half the window.
pub fn local_variance(image: ArrayView2<f64>, size: usize, num_threads: usize) -> Result<Array2<f64>> {
    if size == 0 {
        return Err(DataError::invalid("size", size));
    }
    let kernel = vec![1.0 / size as f64; size];
    let mut mean = image.to_owned();
    let mut mean_sq = image.mapv(|v| v * v);
    for axis in 0..2 {
        let n = image.len_of(Axis(axis));
        if n > size {
            let range = Slice::from(size / 2..n - (size + 1) / 2);
            mean = kernels::fft_convolve(mean.view(), &kernel, Mode::Reflect, axis, num_threads)?;
            mean_sq =
                kernels::fft_convolve(mean_sq.view(), &kernel, Mode::Reflect, axis, num_threads)?;
            mean = mean.slice_axis(Axis(axis), range).to_owned();
            mean_sq = mean_sq.slice_axis(Axis(axis), range).to_owned();
        }
    }
    Ok((mean_sq - mean.mapv(|m| m * m)) / mean.mapv(|m| m * m))
}

fn check_candidates(name: &'static str, defoci: &[f64]) -> Result<()> {
    if defoci.is_empty() {
        return Err(DataError::invalid(name, "no candidate"));
    }
    match defoci.iter().find(|df| **df == 0.0 || !df.is_finite()) {
        Some(df) => Err(DataError::invalid(name, df)),
        None => Ok(()),
    }
}

impl STData {
    /// Scores the candidate defocus distances `defoci_x` and `defoci_y`
    ///
    /// `defoci_y` defaults to `defoci_x`. The candidates are evaluated in order, one score
    /// per candidate pair.
    pub fn defocus_sweep<S: SpeckleTracking>(
        &self,
        defoci_x: &[f64],
        defoci_y: Option<&[f64]>,
        config: &SweepConfig,
    ) -> Result<SweepResult> {
        config.validate()?;
        let defoci_y = defoci_y.unwrap_or(defoci_x);
        check_candidates("defoci_x", defoci_x)?;
        check_candidates("defoci_y", defoci_y)?;
        if defoci_x.len() != defoci_y.len() {
            return Err(DataError::invalid(
                "defoci_y",
                format!("{} candidates instead of {}", defoci_y.len(), defoci_x.len()),
            ));
        }
        let n = defoci_x.len();
        let mut df_x = defoci_x.iter().sum::<f64>() / n as f64;
        let mut df_y = defoci_y.iter().sum::<f64>() / n as f64;

        let now = Instant::now();
        let mut solver: S = self
            .update_defocus(df_x, Some(df_y))?
            .get_st(&config.tracking)?;
        let method = config.tracking.ref_method;
        let hval = match config.hval {
            Some(hval) => hval,
            None => solver.find_hopt(method).map_err(DataError::Solver)?,
        };
        log::info!("Defocus sweep over {n} candidates with a {hval} kernel bandwidth");

        let pb = if config.verbose {
            let pb = ProgressBar::new(n as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template(
                        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            pb
        } else {
            ProgressBar::hidden()
        };
        let mut r_values = Vec::with_capacity(n);
        let mut extra = config.return_extra.then(SweepExtra::default);
        let num_threads = self.num_threads();
        for (&df1_x, &df1_y) in defoci_x.iter().zip(defoci_y) {
            pb.set_message(format!("df = ({df1_x:.3e}, {df1_y:.3e})"));
            let (scale_y, scale_x) = ((df_y / df1_y).abs(), (df_x / df1_x).abs());
            solver.di_pix_mut().mapv_inplace(|di| di * scale_y);
            solver.dj_pix_mut().mapv_inplace(|dj| dj * scale_x);
            (df_x, df_y) = (df1_x, df1_y);

            solver
                .update_reference(hval, method)
                .map_err(DataError::Solver)?;
            let reference_image = solver.reference_image();
            let r_image = local_variance(reference_image, config.size, num_threads)?;
            r_values.push(r_image.mean().unwrap_or_default());
            if let Some(extra) = extra.as_mut() {
                extra.reference_images.push(reference_image.to_owned());
                extra.r_images.push(r_image);
            }
            pb.inc(1);
        }
        pb.finish_and_clear();
        log::info!("Defocus sweep done in {:}ms", now.elapsed().as_millis());
        Ok(SweepResult { r_values, extra })
    }
}
