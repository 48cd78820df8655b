/*!
# Bad pixels and whitefields

 * the bad pixels mask ([`STData::update_mask`])
 * the static whitefield, median of the valid pixels of the good frames
 * the dynamic whitefields, obtained by median filtering the frames or from the eigen
   flat-fields of the principal component analysis ([`STData::get_pca`]) of the frames
*/

use std::borrow::Cow;

use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, Array3, ArrayView3, Axis, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use super::{DataError, Patch, Result, STData};
use crate::{
    kernels::{self, Mode},
    protocol::{Attr, Value},
};

/// Bad pixels masking method
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum MaskMethod {
    /// No bad pixels
    NoBad,
    /// Pixels outside of the `[vmin, vmax)` range are bad
    RangeBad,
    /// Pixels whose deviation from their neighbours lies outside of the `[pmin, pmax]`
    /// percentiles are bad
    #[default]
    PercBad,
}

/// Combination of a new mask with the current one
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MaskUpdate {
    /// The new mask replaces the current one
    #[default]
    Reset,
    /// The new mask is computed from the valid pixels and combined with the current one
    Multiply,
}

/// Bad pixels mask configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskConfig {
    pub method: MaskMethod,
    pub pmin: f64,
    pub pmax: f64,
    pub vmin: u32,
    pub vmax: u32,
    pub update: MaskUpdate,
}
impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            method: MaskMethod::default(),
            pmin: 0.,
            pmax: 99.99,
            vmin: 0,
            vmax: 65535,
            update: MaskUpdate::default(),
        }
    }
}
impl MaskConfig {
    /// Creates a configuration from the method and update keywords
    pub fn from_keywords(method: &str, update: &str) -> Result<Self> {
        Ok(Self {
            method: method
                .parse()
                .map_err(|_| DataError::invalid("method", method))?,
            update: update
                .parse()
                .map_err(|_| DataError::invalid("update", update))?,
            ..Default::default()
        })
    }
    pub fn method(self, method: MaskMethod) -> Self {
        Self { method, ..self }
    }
    pub fn percentiles(self, pmin: f64, pmax: f64) -> Self {
        Self { pmin, pmax, ..self }
    }
    pub fn range(self, vmin: u32, vmax: u32) -> Self {
        Self { vmin, vmax, ..self }
    }
    pub fn update(self, update: MaskUpdate) -> Self {
        Self { update, ..self }
    }
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.pmin) {
            return Err(DataError::invalid("pmin", self.pmin));
        }
        if !(self.pmin..=100.0).contains(&self.pmax) {
            return Err(DataError::invalid("pmax", self.pmax));
        }
        Ok(())
    }
}

/// Dynamic whitefields generation method
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WhitefieldMethod {
    /// Median filtering of the frames
    #[default]
    Median,
    /// Projection of the frames on the eigen flat-fields
    Pca,
}

/// Principal component analysis of the frames
#[derive(Debug, Clone)]
pub struct Pca {
    /// Background corrected good frames
    pub cor_data: Array3<f64>,
    /// Eigen flat-fields
    pub effs: Array3<f64>,
    /// Eigen values as fractions of their sum
    pub eig_vals: Array1<f64>,
}

/// Linear interpolation of the `p` percentile of sorted values
fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        n => {
            let position = p / 100.0 * (n - 1) as f64;
            let lower = position.floor() as usize;
            let upper = position.ceil() as usize;
            sorted[lower] + (sorted[upper] - sorted[lower]) * (position - lower as f64)
        }
    }
}

/// Median of the valid pixels of the good frames
pub(crate) fn median_whitefield(st: &STData) -> Result<Value> {
    let data = st.data()?;
    let mask = st.mask()?;
    let good_frames = st.good_frames()?.to_vec();
    if data.shape() != mask.shape() {
        return Err(DataError::Shape(format!(
            "data {:?} and mask {:?}",
            data.shape(),
            mask.shape()
        )));
    }
    if let Some(index) = good_frames
        .iter()
        .find(|&&index| index >= data.len_of(Axis(0)))
    {
        return Err(DataError::invalid("good_frames", index));
    }
    let frames = data.select(Axis(0), &good_frames).mapv(f64::from);
    let valid = mask.select(Axis(0), &good_frames);
    let whitefield = kernels::median(
        frames.into_dyn().view(),
        0,
        Some(valid.into_dyn().view()),
        st.num_threads(),
    )?;
    Ok(Value::Float(whitefield))
}

/// Background corrected frames: frames minus the whitefield on the valid pixels, zero elsewhere
fn background_corrected(st: &STData, idxs: &[usize]) -> Result<Array3<f64>> {
    let whitefield = st.whitefield()?;
    let mut frames = super::masked_frames(st.data()?, st.mask()?, idxs)?;
    if frames.shape()[1..] != *whitefield.shape() {
        return Err(DataError::Shape(format!(
            "frames {:?} and whitefield {:?}",
            frames.shape(),
            whitefield.shape()
        )));
    }
    let mask = st.mask()?;
    for (mut frame, &index) in frames.outer_iter_mut().zip(idxs) {
        Zip::from(&mut frame)
            .and(&whitefield)
            .and(mask.index_axis(Axis(0), index))
            .for_each(|value, &wf, &valid| {
                if valid {
                    *value -= wf;
                }
            });
    }
    Ok(frames)
}

/// Returns the dot products `<a[i], b[j]>` of the frames of two stacks
fn frame_products(a: ArrayView3<f64>, b: ArrayView3<f64>) -> Array2<f64> {
    let (n_a, n_b) = (a.len_of(Axis(0)), b.len_of(Axis(0)));
    let products: Vec<f64> = (0..n_a * n_b)
        .into_par_iter()
        .map(|ij| {
            let (i, j) = (ij / n_b, ij % n_b);
            Zip::from(a.index_axis(Axis(0), i))
                .and(b.index_axis(Axis(0), j))
                .fold(0.0, |acc, &x, &y| acc + x * y)
        })
        .collect();
    Array2::from_shape_vec((n_a, n_b), products).unwrap_or_else(|_| Array2::zeros((n_a, n_b)))
}

impl STData {
    /// Returns a new container with an updated bad pixels mask
    ///
    /// The whitefield is derived again from the new mask.
    pub fn update_mask(&self, config: &MaskConfig) -> Result<STData> {
        config.validate()?;
        let data = self.data()?;
        let current = self.mask()?;
        if data.shape() != current.shape() {
            return Err(DataError::Shape(format!(
                "data {:?} and mask {:?}",
                data.shape(),
                current.shape()
            )));
        }
        let input: Cow<Array3<u32>> = match config.update {
            MaskUpdate::Reset => Cow::Borrowed(data),
            MaskUpdate::Multiply => Cow::Owned(
                Zip::from(data)
                    .and(current)
                    .map_collect(|&value, &valid| if valid { value } else { 0 }),
            ),
        };
        let mask = match config.method {
            MaskMethod::NoBad => Array3::from_elem(data.raw_dim(), true),
            MaskMethod::RangeBad => input.mapv(|value| value >= config.vmin && value < config.vmax),
            MaskMethod::PercBad => {
                let average = kernels::median_filter(
                    input.mapv(f64::from).view(),
                    [1, 3, 3],
                    None,
                    Mode::Reflect,
                    self.num_threads(),
                )?;
                let offsets = Zip::from(&*input)
                    .and(&average)
                    .map_collect(|&value, &average| value as i64 - average as i64);
                let mut sorted: Vec<f64> = offsets.iter().map(|&offset| offset as f64).collect();
                sorted.par_sort_unstable_by(f64::total_cmp);
                let lower = percentile(&sorted, config.pmin);
                let upper = percentile(&sorted, config.pmax);
                log::debug!("valid pixel offsets in [{lower}, {upper}]");
                offsets.mapv(|offset| (lower..=upper).contains(&(offset as f64)))
            }
        };
        let mask = match config.update {
            MaskUpdate::Reset => mask,
            MaskUpdate::Multiply => mask & current,
        };
        self.apply(
            Patch::new()
                .set(Attr::Mask, mask)
                .clear(Attr::Whitefield),
        )
    }
    /// Returns a new container with a new set of dynamic whitefields
    ///
    /// * `Median`: median filter of the frames with a `(size, 1, 1)` window, restricted to
    ///   the pixels within three standard deviations of the whitefield
    /// * `Pca`: whitefield plus the projections of the background corrected frames `cor_data`
    ///   on the eigen flat-fields `effs`. `cor_data` defaults to every frame, if it holds the
    ///   good frames only, the other frames get the static whitefield.
    pub fn update_whitefields(
        &self,
        method: WhitefieldMethod,
        size: usize,
        cor_data: Option<ArrayView3<f64>>,
        effs: Option<ArrayView3<f64>>,
    ) -> Result<STData> {
        let data = self.data()?;
        let whitefield = self.whitefield()?;
        if data.shape()[1..] != *whitefield.shape() {
            return Err(DataError::Shape(format!(
                "data {:?} and whitefield {:?}",
                data.shape(),
                whitefield.shape()
            )));
        }
        let whitefields = match method {
            WhitefieldMethod::Median => {
                if size % 2 == 0 {
                    return Err(DataError::invalid("size", size));
                }
                let frames = data.mapv(f64::from);
                let mut inliers = Array3::from_elem(data.raw_dim(), false);
                for (mut inliers, frame) in inliers.outer_iter_mut().zip(frames.outer_iter()) {
                    Zip::from(&mut inliers)
                        .and(&frame)
                        .and(&whitefield)
                        .for_each(|inlier, &value, &wf| {
                            *inlier = (value - wf).abs() < 3.0 * wf.sqrt();
                        });
                }
                kernels::median_filter(
                    frames.view(),
                    [size, 1, 1],
                    Some(inliers.view()),
                    Mode::Reflect,
                    self.num_threads(),
                )?
            }
            WhitefieldMethod::Pca => {
                let effs = effs.ok_or_else(|| DataError::invalid("effs", "none"))?;
                if effs.shape()[1..] != *whitefield.shape() {
                    return Err(DataError::Shape(format!(
                        "eigen flat-fields {:?} and whitefield {:?}",
                        effs.shape(),
                        whitefield.shape()
                    )));
                }
                let n_frames = data.len_of(Axis(0));
                let good_frames = self.good_frames()?.to_vec();
                let all_frames: Vec<usize> = (0..n_frames).collect();
                let cor_data: Cow<Array3<f64>> = match cor_data {
                    Some(cor_data) => Cow::Owned(cor_data.to_owned()),
                    None => Cow::Owned(background_corrected(self, &all_frames)?),
                };
                let frames = match cor_data.len_of(Axis(0)) {
                    n if n == n_frames => all_frames,
                    n if n == good_frames.len() => good_frames,
                    _ => {
                        return Err(DataError::Shape(format!(
                            "corrected frames {:?} and data {:?}",
                            cor_data.shape(),
                            data.shape()
                        )))
                    }
                };
                if cor_data.shape()[1..] != *whitefield.shape() {
                    return Err(DataError::Shape(format!(
                        "corrected frames {:?} and whitefield {:?}",
                        cor_data.shape(),
                        whitefield.shape()
                    )));
                }
                let mut weights = frame_products(cor_data.view(), effs);
                for (mut column, eff) in weights.columns_mut().into_iter().zip(effs.outer_iter()) {
                    let norm = eff.iter().map(|v| v * v).sum::<f64>();
                    if norm > 0.0 {
                        column /= norm;
                    } else {
                        column.fill(0.0);
                    }
                }
                let mut whitefields = Array3::from_shape_fn(data.raw_dim(), |(_, i, j)| {
                    whitefield[[i, j]]
                });
                for (weights, &index) in weights.outer_iter().zip(&frames) {
                    let mut frame = whitefields.index_axis_mut(Axis(0), index);
                    for (&weight, eff) in weights.iter().zip(effs.outer_iter()) {
                        frame.scaled_add(weight, &eff);
                    }
                }
                whitefields
            }
        };
        log::debug!("{method} whitefields of {}", self.id());
        self.apply(Patch::new().set(Attr::Whitefields, whitefields))
    }
    /// Principal component analysis of the background corrected good frames
    ///
    /// The eigen flat-fields are sorted by decreasing eigen values.
    pub fn get_pca(&self) -> Result<Pca> {
        let good_frames = self.good_frames()?.to_vec();
        let cor_data = background_corrected(self, &good_frames)?;
        let n = cor_data.len_of(Axis(0));
        if n == 0 {
            return Err(DataError::invalid("good_frames", "empty"));
        }
        let gram = frame_products(cor_data.view(), cor_data.view());
        let eigen = SymmetricEigen::new(DMatrix::from_fn(n, n, |i, j| gram[[i, j]]));
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

        let (_, rows, cols) = cor_data.dim();
        let mut effs = Array3::<f64>::zeros((n, rows, cols));
        for (mut eff, &k) in effs.outer_iter_mut().zip(&order) {
            for (frame, &v) in cor_data.outer_iter().zip(eigen.eigenvectors.column(k).iter()) {
                eff.scaled_add(v, &frame);
            }
        }
        let eig_vals: Array1<f64> = order.iter().map(|&k| eigen.eigenvalues[k]).collect();
        let total = eig_vals.sum();
        let eig_vals = if total == 0.0 {
            Array1::zeros(n)
        } else {
            eig_vals / total
        };
        Ok(Pca {
            cor_data,
            effs,
            eig_vals,
        })
    }
}
