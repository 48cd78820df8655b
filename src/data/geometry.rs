//! Detector geometry: pixel mapping, sample translations in pixels and the import of the
//! speckle tracking results

use std::f64::consts::PI;

use ndarray::{stack, Array2, Array3, Axis, Ix2, Ix3};

use super::{identity_grid, DataError, Patch, Result, STData};
use crate::{
    kernels,
    protocol::{Attr, Value},
    storage::Session,
    tracking::SpeckleTracking,
};

impl STData {
    /// Returns the preliminary pixel mapping `[2, rows, columns]`
    ///
    /// The mapping is the identity grid of the storage frames, filtered by the container
    /// transform and flipped along the axes with a negative defocus distance.
    /// If the storage holds no frames, the identity grid of the container frames is used and
    /// the transform is ignored: the coordinates of a cropped container start at 0.
    pub fn pixel_map(&self) -> Result<Array3<f64>> {
        let (mut rows, mut cols) = Session::open(&**self.input())?.read_shape()?;
        let [_, n_rows, n_cols] = self.shape();
        let (ss_idxs, fs_idxs) = if rows * cols == 0 {
            identity_grid((n_rows, n_cols))
        } else {
            // integrated data
            if n_rows == 1 {
                rows = 1;
            }
            if n_cols == 1 {
                cols = 1;
            }
            let (ss_idxs, fs_idxs) = identity_grid((rows, cols));
            match self.transform() {
                Some(transform) => transform.index_array(ss_idxs.view(), fs_idxs.view())?,
                None => (ss_idxs, fs_idxs),
            }
        };
        let mut pixel_map = stack(Axis(0), &[ss_idxs.view(), fs_idxs.view()])
            .map_err(|e| DataError::Shape(e.to_string()))?;
        if self.is_set(Attr::DefocusX) {
            if self.scalar(Attr::DefocusY)? < 0.0 {
                pixel_map.invert_axis(Axis(1));
            }
            if self.scalar(Attr::DefocusX)? < 0.0 {
                pixel_map.invert_axis(Axis(2));
            }
        }
        Ok(pixel_map.as_standard_layout().into_owned())
    }
    /// Imports the results of a speckle tracking solver derived from this container
    ///
    /// Returns a new container with `pixel_aberrations`, `phase`, `reference_image` and
    /// `scale_map` updated.
    pub fn import_st<S: SpeckleTracking + ?Sized>(&self, solver: &S) -> Result<STData> {
        if solver.parent() != self.id() {
            return Err(DataError::Provenance);
        }
        let pixel_map = self.pixel_map()?;
        let solver_map = solver.pixel_map();
        if solver_map.shape() != pixel_map.shape() {
            return Err(DataError::Shape(format!(
                "solver pixel map {:?} and pixel map {:?}",
                solver_map.shape(),
                pixel_map.shape()
            )));
        }
        let mut dpm = &solver_map - &pixel_map;
        for mut component in dpm.outer_iter_mut() {
            let mean = component.mean().unwrap_or_default();
            component -= mean;
        }

        let distance = self.scalar(Attr::Distance)?;
        let wavelength = self.scalar(Attr::Wavelength)?;
        let defocus_y = self.scalar(Attr::DefocusY)?;
        let defocus_x = self.scalar(Attr::DefocusX)?;
        let y_pixel_size = self.scalar(Attr::YPixelSize)?;
        let x_pixel_size = self.scalar(Attr::XPixelSize)?;

        // magnification and reference plane to detector distance
        let mag_y = ((distance + defocus_y) / defocus_y).abs();
        let mag_x = ((distance + defocus_x) / defocus_x).abs();
        let dist_y = distance * (mag_y - 1.0) / mag_y;
        let dist_x = distance * (mag_x - 1.0) / mag_x;

        let sy = dpm.index_axis(Axis(0), 0).mapv(|v| v * y_pixel_size.powi(2) / dist_y / mag_y);
        let sx = dpm.index_axis(Axis(0), 1).mapv(|v| v * x_pixel_size.powi(2) / dist_x / mag_x);
        let phase = kernels::ct_integrate(sy.view(), sx.view())? * (2.0 * PI / wavelength);
        log::debug!("imported the speckle tracking results into {}", self.id());

        let patch = Patch::new()
            .set(Attr::PixelAberrations, dpm)
            .set(Attr::Phase, phase)
            .set(Attr::ReferenceImage, solver.reference_image().to_owned());
        let patch = match solver.scale_map() {
            Some(scale_map) => patch.set(Attr::ScaleMap, scale_map.to_owned()),
            None => patch.clear(Attr::ScaleMap),
        };
        self.apply(patch)
    }
}

/// Sample translations projected on the detector axes, in pixels
///
/// The translations are relative to the first frame and centered on their mean.
pub(crate) fn pixel_translations(st: &STData) -> Result<Value> {
    let translations = st.float::<Ix2>(Attr::Translations)?;
    let basis_vectors = st.float::<Ix3>(Attr::BasisVectors)?;
    let n_frames = translations.nrows();
    if basis_vectors.len_of(Axis(0)) != n_frames
        || basis_vectors.len_of(Axis(2)) != translations.ncols()
    {
        return Err(DataError::Shape(format!(
            "translations {:?} and basis vectors {:?}",
            translations.shape(),
            basis_vectors.shape()
        )));
    }
    let distance = st.scalar(Attr::Distance)?;
    let mag = [
        (distance / st.scalar(Attr::DefocusY)?).abs(),
        (distance / st.scalar(Attr::DefocusX)?).abs(),
    ];
    let mut pixel_translations = Array2::<f64>::zeros((n_frames, 2));
    for ((k, axis), value) in pixel_translations.indexed_iter_mut() {
        let basis = basis_vectors.slice(ndarray::s![k, axis, ..]);
        let norm: f64 = basis.iter().map(|b| b * b).sum();
        if norm == 0.0 {
            return Err(DataError::invalid("basis_vectors", format!("null vector in frame {k}")));
        }
        *value = translations.row(k).dot(&basis) * mag[axis] / norm;
    }
    if n_frames > 0 {
        let first = pixel_translations.row(0).to_owned();
        pixel_translations -= &first;
        if let Some(mean) = pixel_translations.mean_axis(Axis(0)) {
            pixel_translations -= &mean;
        }
    }
    Ok(Value::from(pixel_translations))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ndarray::{Array1, ArrayView2, ArrayView3, ArrayViewMut1};

    use super::*;
    use crate::{
        data::{tests::container, ContainerId},
        storage::MemoryStore,
        tracking::{RefMethod, SolverError, TrackingInput},
        transform::Transform,
    };

    fn stored(rows: usize, cols: usize) -> STData {
        let store = MemoryStore::default()
            .with(Attr::Data, Array3::<u32>::ones((2, rows, cols)))
            .unwrap();
        STData::new(Arc::new(store)).load(None, None, 1, false).unwrap()
    }

    #[test]
    fn identity_pixel_map() {
        let st = stored(3, 4);
        let pixel_map = st.pixel_map().unwrap();
        assert_eq!(pixel_map.dim(), (2, 3, 4));
        assert_eq!(pixel_map[[0, 2, 1]], 2.0);
        assert_eq!(pixel_map[[1, 2, 1]], 1.0);
    }

    #[test]
    fn transformed_and_flipped_pixel_map() {
        let st = stored(6, 6)
            .update_transform(Transform::crop([1, 4, 2, 6]).unwrap())
            .unwrap();
        let pixel_map = st.pixel_map().unwrap();
        assert_eq!(pixel_map.dim(), (2, 3, 4));
        assert_eq!(pixel_map[[0, 0, 0]], 1.0);
        assert_eq!(pixel_map[[1, 0, 0]], 2.0);

        let flipped = st.update_defocus(-1e-3, Some(1e-3)).unwrap().pixel_map().unwrap();
        assert_eq!(flipped[[1, 0, 0]], 5.0);
        assert_eq!(flipped[[0, 0, 0]], 1.0);
    }

    #[test]
    fn pixel_map_without_stored_frames() {
        let st = container(2, 3, 4)
            .update_transform(Transform::crop([1, 3, 2, 4]).unwrap())
            .unwrap();
        let pixel_map = st.pixel_map().unwrap();
        assert_eq!(pixel_map.dim(), (2, 2, 2));
        assert_eq!(pixel_map[[0, 0, 0]], 0.0);
        assert_eq!(pixel_map[[1, 1, 1]], 1.0);
    }

    #[test]
    fn integrated_pixel_map() {
        let st = stored(3, 4).integrate_data(0).unwrap();
        assert_eq!(st.pixel_map().unwrap().dim(), (2, 1, 4));
    }

    #[test]
    fn translations_offset_invariance() {
        let st = container(5, 3, 3).update_defocus(1e-3, Some(2e-3)).unwrap();
        let pt = st.float::<Ix2>(Attr::PixelTranslations).unwrap().to_owned();
        assert_eq!(pt.dim(), (5, 2));
        let shifted = st.float::<Ix2>(Attr::Translations).unwrap().mapv(|t| t + 3e-6);
        let st = st
            .apply(Patch::new().set(Attr::Translations, shifted))
            .unwrap();
        let shifted_pt = st.float::<Ix2>(Attr::PixelTranslations).unwrap();
        for (a, b) in pt.iter().zip(shifted_pt.iter()) {
            assert!((a - b).abs() < 1e-9, "{a} != {b}");
        }
        let mean = pt.mean_axis(Axis(0)).unwrap();
        assert!(mean.iter().all(|m| m.abs() < 1e-9));
    }

    struct Solver {
        parent: ContainerId,
        pixel_map: Array3<f64>,
        reference_image: Array2<f64>,
        di_pix: Array1<f64>,
        dj_pix: Array1<f64>,
    }
    impl SpeckleTracking for Solver {
        fn from_input(input: TrackingInput) -> std::result::Result<Self, SolverError> {
            let mut pixel_map = input.pixel_map;
            pixel_map
                .index_axis_mut(Axis(0), 1)
                .indexed_iter_mut()
                .for_each(|((_, j), v)| *v += 0.1 * j as f64);
            Ok(Self {
                parent: input.parent,
                pixel_map,
                reference_image: Array2::ones((4, 4)),
                di_pix: input.di_pix,
                dj_pix: input.dj_pix,
            })
        }
        fn parent(&self) -> ContainerId {
            self.parent
        }
        fn update_reference(
            &mut self,
            _hval: f64,
            _method: RefMethod,
        ) -> std::result::Result<(), SolverError> {
            Ok(())
        }
        fn find_hopt(&self, _method: RefMethod) -> std::result::Result<f64, SolverError> {
            Ok(1.0)
        }
        fn reference_image(&self) -> ArrayView2<f64> {
            self.reference_image.view()
        }
        fn pixel_map(&self) -> ArrayView3<f64> {
            self.pixel_map.view()
        }
        fn scale_map(&self) -> Option<ArrayView2<f64>> {
            None
        }
        fn di_pix_mut(&mut self) -> ArrayViewMut1<f64> {
            self.di_pix.view_mut()
        }
        fn dj_pix_mut(&mut self) -> ArrayViewMut1<f64> {
            self.dj_pix.view_mut()
        }
    }

    #[test]
    fn import_solver_results() {
        let st = container(3, 4, 6).update_defocus(1e-3, None).unwrap();
        let solver: Solver = st.get_st(&Default::default()).unwrap();
        let updated = st.import_st(&solver).unwrap();
        let dpm = updated.float::<Ix3>(Attr::PixelAberrations).unwrap();
        assert_eq!(dpm.dim(), (2, 4, 6));
        assert!(dpm.index_axis(Axis(0), 0).iter().all(|v| v.abs() < 1e-12));
        assert!((dpm[[1, 0, 5]] - dpm[[1, 0, 0]] - 0.5).abs() < 1e-12);
        assert_eq!(updated.float::<Ix2>(Attr::Phase).unwrap().dim(), (4, 6));
        assert!(updated.is_set(Attr::ReferenceImage));
        assert!(!updated.is_set(Attr::ScaleMap));

        let other = container(3, 4, 6).update_defocus(1e-3, None).unwrap();
        assert!(matches!(
            other.import_st(&solver),
            Err(DataError::Provenance)
        ));
    }
}
