/*!
# Aberrations fit

The lens' aberrations are obtained by fitting a polynomial to the pixel aberrations profile
along one detector axis with a nonlinear least-squares fitter external to this crate that
implements [`AberrationsFit`].
*/

use ndarray::{Array1, Axis, Ix2, Ix3};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::{
    data::{ContainerId, DataError, Result, STData},
    protocol::Attr,
    tracking::SolverError,
};

/// Least-squares loss function
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Loss {
    Linear,
    SoftL1,
    Huber,
    #[default]
    Cauchy,
    Arctan,
}

/// Fitter inputs derived from a data container
#[derive(Debug, Clone)]
pub struct FitInput {
    /// Container the input is derived from
    pub parent: ContainerId,
    /// Defocus distance along the axis [m], positive
    pub defocus: f64,
    pub distance: f64,
    pub wavelength: f64,
    pub pixel_size: f64,
    /// Pixel coordinates relative to the origin, increasing
    pub pixels: Array1<f64>,
    /// Pixel aberrations profile along the axis [pixels]
    pub pixel_aberrations: Array1<f64>,
    /// Phase profile along the axis [rad]
    pub phase: Array1<f64>,
    /// Detector axis: 0 (vertical) or 1 (horizontal)
    pub axis: usize,
}

/// Fitted aberrations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitResult {
    /// Polynomial coefficients of the pixel aberrations fit
    pub fit: Array1<f64>,
    /// Polynomial coefficients of the phase
    pub ph_fit: Array1<f64>,
    /// Third order aberration coefficient [rad/mrad^3]
    pub c_3: f64,
    /// Fourth order aberration coefficient [rad/mrad^4]
    pub c_4: f64,
    /// Relative errors of the coefficients
    pub rel_err: Array1<f64>,
    /// Coefficient of determination
    pub r_sq: f64,
}

/// Polynomial aberrations fitter
pub trait AberrationsFit {
    fn from_input(input: FitInput) -> std::result::Result<Self, SolverError>
    where
        Self: Sized;
    /// Identity of the container the fitter is derived from
    fn parent(&self) -> ContainerId;
    fn fit(
        &self,
        max_order: usize,
        xtol: f64,
        ftol: f64,
        loss: Loss,
    ) -> std::result::Result<FitResult, SolverError>;
}

/// Fitter options
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    pub max_order: usize,
    pub xtol: f64,
    pub ftol: f64,
    pub loss: Loss,
}
impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_order: 2,
            xtol: 1e-14,
            ftol: 1e-14,
            loss: Loss::default(),
        }
    }
}
impl FitOptions {
    pub fn max_order(self, max_order: usize) -> Self {
        Self { max_order, ..self }
    }
    pub fn tolerances(self, xtol: f64, ftol: f64) -> Self {
        Self { xtol, ftol, ..self }
    }
    pub fn loss(self, loss: Loss) -> Self {
        Self { loss, ..self }
    }
}

impl STData {
    /// Builds an aberrations fitter along the detector `axis`
    ///
    /// The pixel coordinates are counted from `center`, which must lie at or beyond one edge
    /// of the axis. With the origin beyond the far edge the profiles are reversed and the
    /// pixel aberrations negated, so that the coordinates increase with the distance to the
    /// origin.
    pub fn get_fit<F: AberrationsFit>(&self, center: isize, axis: usize) -> Result<F> {
        let (defocus, pixel_size) = match axis {
            0 => (Attr::DefocusY, Attr::YPixelSize),
            1 => (Attr::DefocusX, Attr::XPixelSize),
            _ => return Err(DataError::invalid("axis", axis)),
        };
        for attr in [Attr::PixelAberrations, Attr::Phase] {
            if !self.is_set(attr) {
                return Err(DataError::Missing(attr));
            }
        }
        let pixel_aberrations = self.float::<Ix3>(Attr::PixelAberrations)?;
        let phase = self.float::<Ix2>(Attr::Phase)?;
        if pixel_aberrations.shape()[1..] != *phase.shape() {
            return Err(DataError::Shape(format!(
                "pixel aberrations {:?} and phase {:?}",
                pixel_aberrations.shape(),
                phase.shape()
            )));
        }
        let other = Axis(1 - axis);
        let profile = pixel_aberrations
            .index_axis(Axis(0), axis)
            .mean_axis(other)
            .ok_or(DataError::Missing(Attr::PixelAberrations))?;
        let phase = phase
            .mean_axis(other)
            .ok_or(DataError::Missing(Attr::Phase))?;

        let n = profile.len() as isize;
        let (pixels, pixel_aberrations, phase) = if center <= 0 {
            let pixels: Array1<f64> = (0..n).map(|i| (i - center) as f64).collect();
            (pixels, profile, phase)
        } else if center >= n - 1 {
            // reversed to keep the pixels in increasing order
            let pixels: Array1<f64> = (0..n).rev().map(|i| (center - i) as f64).collect();
            let mut profile = -profile;
            profile.invert_axis(Axis(0));
            let mut phase = phase;
            phase.invert_axis(Axis(0));
            (
                pixels,
                profile.as_standard_layout().into_owned(),
                phase.as_standard_layout().into_owned(),
            )
        } else {
            return Err(DataError::invalid(
                "center",
                format!("{center}, the origin must be outside of the region of interest"),
            ));
        };

        F::from_input(FitInput {
            parent: self.id(),
            defocus: self.scalar(defocus)?.abs(),
            distance: self.scalar(Attr::Distance)?,
            wavelength: self.scalar(Attr::Wavelength)?,
            pixel_size: self.scalar(pixel_size)?,
            pixels,
            pixel_aberrations,
            phase,
            axis,
        })
        .map_err(DataError::Solver)
    }
    /// Fits the lens' aberrations along the detector `axis`
    pub fn fit_phase<F: AberrationsFit>(
        &self,
        center: isize,
        axis: usize,
        options: &FitOptions,
    ) -> Result<FitResult> {
        let fitter: F = self.get_fit(center, axis)?;
        let result = fitter
            .fit(options.max_order, options.xtol, options.ftol, options.loss)
            .map_err(DataError::Solver)?;
        log::debug!(
            "aberrations fit of {} along axis {axis}: c_3 = {:e}, c_4 = {:e}, R² = {}",
            self.id(),
            result.c_3,
            result.c_4,
            result.r_sq
        );
        Ok(result)
    }
}
