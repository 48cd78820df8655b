use std::sync::Arc;

use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3, ArrayViewMut1, Axis, Ix2, Ix3};
use pxst::{
    tracking::SolverError, Attr, ContainerId, DataError, MaskConfig, MaskMethod, MemoryStore,
    RefMethod, STData, SaveMode, SpeckleTracking, Storage, SweepConfig, TrackingConfig,
    TrackingInput, Transform,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

const DISTANCE: f64 = 2.0;
const PIXEL_SIZE: f64 = 5.5e-5;
const DEFOCUS: f64 = 1e-4;

/// Random speckle pattern scanned by one pixel per frame along the fast axis
fn speckles(n: usize, rows: usize, cols: usize) -> MemoryStore {
    let mut rng = StdRng::seed_from_u64(7);
    let reference = Array2::from_shape_fn((rows, cols + n), |_| rng.gen_range(50..150u32));
    let data = Array3::from_shape_fn((n, rows, cols), |(k, i, j)| reference[[i, j + k]]);
    let basis_vectors = Array3::from_shape_fn((n, 2, 3), |(_, a, b)| match (a, b) {
        (0, 1) | (1, 0) => PIXEL_SIZE,
        _ => 0.0,
    });
    let step = DEFOCUS * PIXEL_SIZE / DISTANCE;
    let translations =
        Array2::from_shape_fn((n, 3), |(k, c)| if c == 0 { step * k as f64 } else { 0.0 });
    MemoryStore::default()
        .with(Attr::Data, data)
        .unwrap()
        .with(Attr::BasisVectors, basis_vectors)
        .unwrap()
        .with(Attr::Translations, translations)
        .unwrap()
        .with(Attr::Frames, (0..n).collect::<Vec<_>>())
        .unwrap()
        .with(Attr::Distance, DISTANCE)
        .unwrap()
        .with(Attr::Wavelength, 7.29e-11)
        .unwrap()
        .with(Attr::XPixelSize, PIXEL_SIZE)
        .unwrap()
        .with(Attr::YPixelSize, PIXEL_SIZE)
        .unwrap()
}

/// Reference image made of the frames shifted back by their rounded offsets and averaged
struct ShiftAndAdd {
    parent: ContainerId,
    data: Array3<f64>,
    pixel_map: Array3<f64>,
    di_pix: Array1<f64>,
    dj_pix: Array1<f64>,
    reference_image: Array2<f64>,
}
impl SpeckleTracking for ShiftAndAdd {
    fn from_input(input: TrackingInput) -> Result<Self, SolverError> {
        Ok(Self {
            parent: input.parent,
            data: input.data,
            pixel_map: input.pixel_map,
            di_pix: input.di_pix,
            dj_pix: input.dj_pix,
            reference_image: Array2::zeros((0, 0)),
        })
    }
    fn parent(&self) -> ContainerId {
        self.parent
    }
    fn update_reference(&mut self, _hval: f64, _method: RefMethod) -> Result<(), SolverError> {
        let offsets: Vec<i64> = self.dj_pix.iter().map(|dj| dj.round() as i64).collect();
        let min = offsets.iter().copied().min().ok_or("no frames")?;
        let max = offsets.iter().copied().max().ok_or("no frames")?;
        let (_, rows, cols) = self.data.dim();
        let width = cols + (max - min) as usize;
        let mut sum = Array2::<f64>::zeros((rows, width));
        let mut count = Array2::<f64>::zeros((rows, width));
        for (frame, offset) in self.data.outer_iter().zip(&offsets) {
            for ((i, j), value) in frame.indexed_iter() {
                let x = j + (offset - min) as usize;
                sum[[i, x]] += value;
                count[[i, x]] += 1.0;
            }
        }
        self.reference_image = sum / count.mapv(|c| c.max(1.0));
        Ok(())
    }
    fn find_hopt(&self, _method: RefMethod) -> Result<f64, SolverError> {
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

fn loaded(n: usize, rows: usize, cols: usize) -> STData {
    STData::new(Arc::new(speckles(n, rows, cols)))
        .load(None, None, 2, false)
        .unwrap()
}

#[test]
fn load_and_derive() {
    let st = loaded(9, 12, 40);
    assert_eq!(st.shape(), [9, 12, 40]);
    assert!(st.missing_required().is_empty());
    let st = st
        .update_mask(&MaskConfig::default().method(MaskMethod::NoBad))
        .unwrap()
        .mask_frames(None)
        .unwrap()
        .update_defocus(DEFOCUS, None)
        .unwrap();
    assert_eq!(st.good_frames().unwrap().len(), 9);
    let pixel_translations = st.float::<Ix2>(Attr::PixelTranslations).unwrap();
    for (k, dj) in pixel_translations.column(1).iter().enumerate() {
        assert!((dj - (k as f64 - 4.0)).abs() < 1e-9, "{dj}");
    }
    assert!(pixel_translations.column(0).iter().all(|di| di.abs() < 1e-12));
}

#[test]
fn cropped_load() {
    let storage: Arc<dyn Storage> = Arc::new(speckles(3, 12, 40));
    let st = STData::new(storage)
        .update_transform(Transform::crop([2, 10, 5, 25]).unwrap())
        .unwrap()
        .load(Some("data, frames".into()), Some(vec![0, 2]), 1, false)
        .unwrap();
    assert_eq!(st.shape(), [2, 8, 20]);
    let full = loaded(3, 12, 40);
    assert_eq!(
        st.data().unwrap()[[1, 0, 0]],
        full.data().unwrap()[[2, 2, 5]]
    );
    assert_eq!(st.pixel_map().unwrap().dim(), (2, 8, 20));
    assert!(matches!(
        STData::new(Arc::new(MemoryStore::default())).load(Some(Attr::Phase.into()), None, 1, false),
        Err(DataError::Storage(_))
    ));
}

#[test]
fn sweep_finds_the_defocus() {
    let st = loaded(9, 16, 48);
    let defoci = [5e-5, DEFOCUS, 2e-4];
    let config = SweepConfig::default()
        .size(5)
        .verbose(false)
        .return_extra(true);
    let sweep = st
        .defocus_sweep::<ShiftAndAdd>(&defoci, None, &config)
        .unwrap();
    assert_eq!(sweep.r_values.len(), 3);
    assert_eq!(sweep.best(), Some(1));
    let extra = sweep.extra.unwrap();
    assert_eq!(extra.reference_images[1].dim(), (16, 56));

    let single = st
        .defocus_sweep::<ShiftAndAdd>(&[DEFOCUS], None, &config.return_extra(false))
        .unwrap();
    assert_eq!(single.r_values.len(), 1);
    assert!((single.r_values[0] - sweep.r_values[1]).abs() < 1e-12);
}

#[test]
fn import_tracking_results() {
    let st = loaded(5, 8, 24).update_defocus(DEFOCUS, None).unwrap();
    let mut solver: ShiftAndAdd = st.get_st(&TrackingConfig::default()).unwrap();
    solver.update_reference(1.0, RefMethod::KerReg).unwrap();
    let updated = st.import_st(&solver).unwrap();
    let pixel_aberrations = updated.float::<Ix3>(Attr::PixelAberrations).unwrap();
    assert_eq!(pixel_aberrations.dim(), (2, 8, 24));
    assert!(pixel_aberrations.iter().all(|v| v.abs() < 1e-12));
    let phase = updated.float::<Ix2>(Attr::Phase).unwrap();
    assert!(phase.iter().all(|v| v.abs() < 1e-9));
    assert_eq!(
        updated.float::<Ix2>(Attr::ReferenceImage).unwrap(),
        solver.reference_image()
    );
    assert!(matches!(
        updated.import_st(&solver),
        Err(DataError::Provenance)
    ));
}

#[test]
fn save_and_reload() {
    let output: Arc<dyn Storage> = Arc::new(MemoryStore::default());
    let st = loaded(6, 8, 10)
        .mask_frames(Some(vec![0, 2, 3, 5]))
        .unwrap()
        .update_defocus(DEFOCUS, Some(2.0 * DEFOCUS))
        .unwrap();
    assert!(matches!(
        st.save(None, SaveMode::Overwrite, None),
        Err(DataError::MissingOutput)
    ));
    let st = st.update_output_file(output.clone()).unwrap();
    st.save(None, SaveMode::Overwrite, None).unwrap();

    let reloaded = STData::new(output).load(None, None, 2, false).unwrap();
    assert_eq!(reloaded.shape(), [4, 8, 10]);
    assert_eq!(
        reloaded.indices(Attr::Frames).unwrap(),
        &Array1::from(vec![0, 2, 3, 5])
    );
    assert_eq!(
        reloaded.data().unwrap(),
        &st.data().unwrap().select(Axis(0), &[0, 2, 3, 5])
    );
    assert_eq!(reloaded.whitefield().unwrap(), st.whitefield().unwrap());
    assert_eq!(reloaded.scalar(Attr::DefocusY).unwrap(), 2.0 * DEFOCUS);
    assert_eq!(reloaded.good_frames().unwrap().len(), 4);
}

#[test]
fn sweep_config_pickle() {
    let config = SweepConfig::default()
        .size(31)
        .hval(2.5)
        .tracking(TrackingConfig::default().ref_method(RefMethod::Lowess));
    let bytes = serde_pickle::to_vec(&config, Default::default()).unwrap();
    let restored: SweepConfig = serde_pickle::from_slice(&bytes, Default::default()).unwrap();
    assert_eq!(restored, config);
}
