/*!
# Speckle tracking solver interface

The reference image and the pixel mapping are reconstructed by an iterative solver
external to this crate that implements [`SpeckleTracking`].
[`STData::get_st`] builds the solver from a data container.
*/

use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3, ArrayViewMut1, Axis, Ix2, Ix3};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::{
    data::{masked_frames, ContainerId, DataError, Result, STData},
    protocol::{Attr, Value},
};

/// Error returned by the external solvers
pub type SolverError = Box<dyn std::error::Error + Send + Sync>;

/// Reference image update algorithm
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display, Serialize, Deserialize,
)]
pub enum RefMethod {
    /// Kernel regression
    #[default]
    KerReg,
    /// Local weighted linear regression
    #[strum(serialize = "LOWESS")]
    #[serde(rename = "LOWESS")]
    Lowess,
}

/// Floating point precision of the solver arrays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Precision {
    Single,
    Double,
}
impl Precision {
    /// Single precision for 32-bit (or narrower) integer counts, double otherwise
    pub fn of<T>(_data: &Array3<T>) -> Self {
        if std::mem::size_of::<T>() <= 4 {
            Precision::Single
        } else {
            Precision::Double
        }
    }
}

/// Solver inputs derived from a data container
#[derive(Debug, Clone)]
pub struct TrackingInput {
    /// Container the input is derived from
    pub parent: ContainerId,
    /// Masked good frames
    pub data: Array3<f64>,
    /// Sample translations along the vertical axis [pixels]
    pub di_pix: Array1<f64>,
    /// Sample translations along the horizontal axis [pixels]
    pub dj_pix: Array1<f64>,
    pub num_threads: usize,
    pub pixel_map: Array3<f64>,
    pub scale_map: Option<Array2<f64>>,
    /// Reference image sampling interval along the vertical axis [pixels]
    pub ds_y: f64,
    /// Reference image sampling interval along the horizontal axis [pixels]
    pub ds_x: f64,
    pub whitefield: Array2<f64>,
    pub precision: Precision,
}

/// Speckle tracking reference solver
pub trait SpeckleTracking {
    fn from_input(input: TrackingInput) -> std::result::Result<Self, SolverError>
    where
        Self: Sized;
    /// Identity of the container the solver is derived from
    fn parent(&self) -> ContainerId;
    /// Updates the reference image with the kernel bandwidth `hval`
    fn update_reference(
        &mut self,
        hval: f64,
        method: RefMethod,
    ) -> std::result::Result<(), SolverError>;
    /// Returns the optimal kernel bandwidth
    fn find_hopt(&self, method: RefMethod) -> std::result::Result<f64, SolverError>;
    fn reference_image(&self) -> ArrayView2<f64>;
    fn pixel_map(&self) -> ArrayView3<f64>;
    fn scale_map(&self) -> Option<ArrayView2<f64>>;
    fn di_pix_mut(&mut self) -> ArrayViewMut1<f64>;
    fn dj_pix_mut(&mut self) -> ArrayViewMut1<f64>;
}

/// Speckle tracking solver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub ds_y: f64,
    pub ds_x: f64,
    /// Adds `pixel_aberrations` to the pixel map
    pub aberrations: bool,
    /// Applies the dynamic flat-field correction
    pub ff_correction: bool,
    pub ref_method: RefMethod,
}
impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            ds_y: 1.0,
            ds_x: 1.0,
            aberrations: false,
            ff_correction: false,
            ref_method: RefMethod::default(),
        }
    }
}
impl TrackingConfig {
    pub fn sampling(self, ds_y: f64, ds_x: f64) -> Self {
        Self { ds_y, ds_x, ..self }
    }
    pub fn aberrations(self, aberrations: bool) -> Self {
        Self {
            aberrations,
            ..self
        }
    }
    pub fn ff_correction(self, ff_correction: bool) -> Self {
        Self {
            ff_correction,
            ..self
        }
    }
    pub fn ref_method(self, ref_method: RefMethod) -> Self {
        Self { ref_method, ..self }
    }
    pub fn validate(&self) -> Result<()> {
        for (name, ds) in [("ds_y", self.ds_y), ("ds_x", self.ds_x)] {
            if !(ds.is_finite() && ds > 0.0) {
                return Err(DataError::invalid(name, ds));
            }
        }
        Ok(())
    }
}

impl STData {
    /// Builds a speckle tracking solver from the container
    ///
    /// The solver gets the masked good frames, the whitefield, the pixel translations and the
    /// pixel map, with the lens' aberrations if `aberrations` is set.
    pub fn get_st<S: SpeckleTracking>(&self, config: &TrackingConfig) -> Result<S> {
        config.validate()?;
        if !self.is_set(Attr::DefocusX) {
            return Err(DataError::Missing(Attr::DefocusX));
        }
        let data = self.data()?;
        let good_frames = self.good_frames()?.to_vec();
        let precision = Precision::of(data);
        let mut frames = masked_frames(data, self.mask()?, &good_frames)?;
        let whitefield = self.whitefield()?.to_owned();

        let pixel_translations = self.float::<Ix2>(Attr::PixelTranslations)?;
        if let Some(index) = good_frames
            .iter()
            .find(|&&index| index >= pixel_translations.nrows())
        {
            return Err(DataError::invalid("good_frames", index));
        }
        let dij_pix = pixel_translations.select(Axis(0), &good_frames);

        if config.ff_correction {
            if let Some(Value::Float(whitefields)) = self.get(Attr::Whitefields)? {
                let whitefields = whitefields
                    .view()
                    .into_dimensionality::<Ix3>()
                    .map_err(|e| DataError::Shape(e.to_string()))?;
                if whitefields.len_of(Axis(0)) != data.len_of(Axis(0))
                    || whitefields.shape()[1..] != *whitefield.shape()
                {
                    return Err(DataError::Shape(format!(
                        "whitefields {:?} and data {:?}",
                        whitefields.shape(),
                        data.shape()
                    )));
                }
                for (mut frame, &index) in frames.outer_iter_mut().zip(&good_frames) {
                    frame
                        .iter_mut()
                        .zip(whitefields.index_axis(Axis(0), index))
                        .zip(&whitefield)
                        .for_each(|((value, &wfs), &wf)| {
                            if wfs > 0.0 {
                                *value = (*value * wf / wfs).round_ties_even();
                            }
                        });
                }
            }
        }

        let mut pixel_map = self.pixel_map()?;
        let scale_map = if config.aberrations {
            let pixel_aberrations = self.float::<Ix3>(Attr::PixelAberrations)?;
            if pixel_aberrations.shape() != pixel_map.shape() {
                return Err(DataError::Shape(format!(
                    "pixel aberrations {:?} and pixel map {:?}",
                    pixel_aberrations.shape(),
                    pixel_map.shape()
                )));
            }
            pixel_map += &pixel_aberrations;
            match self.get(Attr::ScaleMap)? {
                Some(Value::Float(scale_map)) => Some(
                    scale_map
                        .view()
                        .into_dimensionality::<Ix2>()
                        .map_err(|e| DataError::Shape(e.to_string()))?
                        .to_owned(),
                ),
                _ => None,
            }
        } else {
            None
        };
        log::debug!(
            "building a {precision} precision solver from {} good frames of {}",
            good_frames.len(),
            self.id()
        );

        S::from_input(TrackingInput {
            parent: self.id(),
            data: frames,
            di_pix: dij_pix.column(0).to_owned(),
            dj_pix: dij_pix.column(1).to_owned(),
            num_threads: self.num_threads(),
            pixel_map,
            scale_map,
            ds_y: config.ds_y,
            ds_x: config.ds_x,
            whitefield,
            precision,
        })
        .map_err(DataError::Solver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{tests::container, Patch};
    use std::str::FromStr;

    struct Inputs(TrackingInput);
    impl SpeckleTracking for Inputs {
        fn from_input(input: TrackingInput) -> std::result::Result<Self, SolverError> {
            Ok(Self(input))
        }
        fn parent(&self) -> ContainerId {
            self.0.parent
        }
        fn update_reference(
            &mut self,
            _hval: f64,
            _method: RefMethod,
        ) -> std::result::Result<(), SolverError> {
            Err("not a solver".into())
        }
        fn find_hopt(&self, _method: RefMethod) -> std::result::Result<f64, SolverError> {
            Ok(1.0)
        }
        fn reference_image(&self) -> ArrayView2<f64> {
            self.0.whitefield.view()
        }
        fn pixel_map(&self) -> ArrayView3<f64> {
            self.0.pixel_map.view()
        }
        fn scale_map(&self) -> Option<ArrayView2<f64>> {
            self.0.scale_map.as_ref().map(|scale_map| scale_map.view())
        }
        fn di_pix_mut(&mut self) -> ArrayViewMut1<f64> {
            self.0.di_pix.view_mut()
        }
        fn dj_pix_mut(&mut self) -> ArrayViewMut1<f64> {
            self.0.dj_pix.view_mut()
        }
    }

    #[test]
    fn ref_method_names() {
        assert_eq!(RefMethod::from_str("LOWESS").unwrap(), RefMethod::Lowess);
        assert_eq!(RefMethod::KerReg.to_string(), "KerReg");
    }

    #[test]
    fn precision_preset() {
        let mut data = Array3::<u32>::zeros((1, 2, 2));
        assert_eq!(Precision::of(&data), Precision::Single);
        data[[0, 1, 1]] = 20_000_000;
        assert_eq!(Precision::of(&data), Precision::Single);
        assert_eq!(Precision::of(&Array3::<u16>::zeros((1, 1, 1))), Precision::Single);
        assert_eq!(Precision::of(&Array3::<u64>::zeros((1, 1, 1))), Precision::Double);
    }

    #[test]
    fn solver_input() {
        let st = container(4, 3, 5).update_defocus(1e-3, None).unwrap();
        assert!(matches!(
            container(4, 3, 5).get_st::<Inputs>(&Default::default()),
            Err(DataError::Missing(Attr::DefocusX))
        ));
        let st = st.mask_frames(Some(vec![0, 2, 3])).unwrap();
        let Inputs(input) = st.get_st(&TrackingConfig::default()).unwrap();
        assert_eq!(input.parent, st.id());
        assert_eq!(input.data.dim(), (3, 3, 5));
        assert_eq!(input.di_pix.len(), 3);
        assert_eq!(input.pixel_map.dim(), (2, 3, 5));
        assert_eq!(input.whitefield.dim(), (3, 5));
        assert_eq!(input.precision, Precision::Single);
        assert!(input.scale_map.is_none());
        assert_eq!(input.data[[1, 0, 0]], st.data().unwrap()[[2, 0, 0]] as f64);
    }

    #[test]
    fn flat_field_correction() {
        let st = container(2, 2, 2).update_defocus(1e-3, None).unwrap();
        let whitefield = st.whitefield().unwrap().to_owned();
        let whitefields = ndarray::Array3::from_shape_fn((2, 2, 2), |(k, i, j)| {
            whitefield[[i, j]] * if k == 0 { 2.0 } else { 1.0 }
        });
        let st = st
            .apply(Patch::new().set(Attr::Whitefields, whitefields))
            .unwrap();
        let config = TrackingConfig::default().ff_correction(true);
        let Inputs(input) = st.get_st(&config).unwrap();
        let data = st.data().unwrap();
        assert_eq!(input.data[[0, 1, 1]], (data[[0, 1, 1]] as f64 / 2.0).round_ties_even());
        assert_eq!(input.data[[1, 1, 1]], data[[1, 1, 1]] as f64);
    }

    #[test]
    fn invalid_sampling() {
        let config = TrackingConfig::default().sampling(0.0, 1.0);
        assert!(matches!(
            config.validate(),
            Err(DataError::InvalidArgument { name: "ds_y", .. })
        ));
    }
}
