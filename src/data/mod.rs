/*!
# Speckle tracking data container

[`STData`] holds the measured frames of a speckle tracking experiment, its geometry
and the quantities derived from them.
A container is immutable: every update returns a new container made of the attributes
of the current one overridden by a [`Patch`], sharing the unchanged values.

Some attributes are derived from the others on first access when they are not set:
 * `num_threads`: the number of available CPUs, capped at 64
 * `good_frames`: every frame
 * `mask`: every pixel is valid
 * `whitefield`: median of the valid pixels of the good frames
 * `defocus_y`: `defocus_x`
 * `pixel_translations`: translations projected on the detector plane
*/

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use ndarray::{Array1, Array2, Array3, ArrayView, ArrayView2, Axis, Dimension, Ix2, Zip};
use once_cell::sync::OnceCell;
use strum::IntoEnumIterator;

use crate::{
    kernels::KernelError,
    protocol::{Attr, Kind, ProtocolError, Selection, Value},
    storage::{SaveMode, Session, Storage, StorageError},
    tracking::SolverError,
    transform::{self, Transform, TransformError},
};

pub mod geometry;
pub mod whitefield;
pub use whitefield::{MaskConfig, MaskMethod, MaskUpdate, Pca, WhitefieldMethod};

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("'{0}' is not defined inside the container")]
    Missing(Attr),
    #[error("'output_file' is not defined inside the container")]
    MissingOutput,
    #[error("invalid {name} argument: {value}")]
    InvalidArgument { name: &'static str, value: String },
    #[error("the object wasn't derived from this data container")]
    Provenance,
    #[error("incompatible shapes: {0}")]
    Shape(String),
    #[error("Error in the `protocol` module")]
    Protocol(#[from] ProtocolError),
    #[error("Error in the `storage` module")]
    Storage(#[from] StorageError),
    #[error("Error in the `transform` module")]
    Transform(#[from] TransformError),
    #[error("Error in the `kernels` module")]
    Kernel(#[from] KernelError),
    #[error("the external solver failed")]
    Solver(#[source] SolverError),
}
pub type Result<T> = std::result::Result<T, DataError>;

impl DataError {
    pub(crate) fn invalid<T: fmt::Display>(name: &'static str, value: T) -> Self {
        DataError::InvalidArgument {
            name,
            value: value.to_string(),
        }
    }
}

/// Identity of a data container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(u64);
impl ContainerId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}
impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Attribute updates: a new value or the removal of the attribute
#[derive(Debug, Clone, Default)]
pub struct Patch {
    entries: BTreeMap<Attr, Option<Value>>,
}
impl Patch {
    pub fn new() -> Self {
        Default::default()
    }
    pub fn set<V: Into<Value>>(mut self, attr: Attr, value: V) -> Self {
        self.entries.insert(attr, Some(value.into()));
        self
    }
    pub fn clear(mut self, attr: Attr) -> Self {
        self.entries.insert(attr, None);
        self
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    /// Returns true if the patch changes `attr` or any attribute `attr` is derived from
    pub fn touches(&self, attr: Attr) -> bool {
        self.entries
            .keys()
            .any(|&other| other == attr || depends_on(attr, other))
    }
}

fn depends_on(attr: Attr, other: Attr) -> bool {
    attr.dependencies()
        .iter()
        .any(|&dep| dep == other || depends_on(dep, other))
}

const DERIVED: [Attr; 6] = [
    Attr::NumThreads,
    Attr::GoodFrames,
    Attr::Mask,
    Attr::Whitefield,
    Attr::DefocusY,
    Attr::PixelTranslations,
];

/// Default number of threads: the available parallelism in `1..=64`
pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, 64)
}

/// Speckle tracking data container
pub struct STData {
    id: ContainerId,
    input: Arc<dyn Storage>,
    output: Option<Arc<dyn Storage>>,
    values: BTreeMap<Attr, Arc<Value>>,
    derived: BTreeMap<Attr, OnceCell<Arc<Value>>>,
}
impl fmt::Debug for STData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("STData")
            .field("id", &self.id)
            .field("shape", &self.shape())
            .field("attributes", &self.values.keys().collect::<Vec<_>>())
            .field("output", &self.output.is_some())
            .finish()
    }
}
impl STData {
    /// Creates an empty container reading from the `input` storage
    pub fn new(input: Arc<dyn Storage>) -> Self {
        Self {
            id: ContainerId::next(),
            input,
            output: None,
            values: BTreeMap::new(),
            derived: DERIVED.iter().map(|&attr| (attr, OnceCell::new())).collect(),
        }
    }
    /// Sets the storage the container saves to
    pub fn with_output(self, output: Arc<dyn Storage>) -> Self {
        Self {
            output: Some(output),
            ..self
        }
    }
    /// Creates a container from a set of attributes
    pub fn from_patch(input: Arc<dyn Storage>, patch: Patch) -> Result<Self> {
        Self::new(input).apply(patch)
    }
    pub fn id(&self) -> ContainerId {
        self.id
    }
    pub fn input(&self) -> &Arc<dyn Storage> {
        &self.input
    }
    pub fn output(&self) -> Option<&Arc<dyn Storage>> {
        self.output.as_ref()
    }
    /// Returns a new container with the attributes updated by the patch
    ///
    /// The derived attributes computed by this container are shared with the new one
    /// unless the patch touches one of their dependencies.
    pub fn apply(&self, patch: Patch) -> Result<Self> {
        let derived = self
            .derived
            .iter()
            .map(|(&attr, cell)| {
                if patch.touches(attr) {
                    (attr, OnceCell::new())
                } else {
                    (attr, cell.clone())
                }
            })
            .collect();
        let mut values = self.values.clone();
        for (attr, value) in patch.entries {
            match value {
                Some(value) => {
                    value.check(attr)?;
                    values.insert(attr, Arc::new(value));
                }
                None => {
                    values.remove(&attr);
                }
            }
        }
        Ok(Self {
            id: ContainerId::next(),
            input: self.input.clone(),
            output: self.output.clone(),
            values,
            derived,
        })
    }
    /// Attributes explicitly set in the container
    pub fn keys(&self) -> impl Iterator<Item = Attr> + '_ {
        self.values.keys().copied()
    }
    pub fn is_set(&self, attr: Attr) -> bool {
        self.values.contains_key(&attr)
    }
    /// Returns true if the attribute is set or can be derived
    pub fn contains(&self, attr: Attr) -> bool {
        self.is_set(attr) || self.is_derivable(attr)
    }
    fn is_derivable(&self, attr: Attr) -> bool {
        match attr {
            Attr::NumThreads => true,
            Attr::GoodFrames => self.shape()[0] > 0,
            Attr::Mask | Attr::Whitefield => self.is_set(Attr::Data),
            Attr::DefocusY | Attr::PixelTranslations => self.is_set(Attr::DefocusX),
            _ => false,
        }
    }
    fn derive(&self, attr: Attr) -> Result<Value> {
        log::debug!("deriving {attr} of {}", self.id);
        match attr {
            Attr::NumThreads => Ok(Value::Threads(default_threads())),
            Attr::GoodFrames => Ok(Value::Indices(Array1::from_iter(0..self.shape()[0]))),
            Attr::Mask => Ok(Value::Mask(Array3::from_elem(self.shape(), true))),
            Attr::Whitefield => whitefield::median_whitefield(self),
            Attr::DefocusY => Ok(Value::Scalar(self.scalar(Attr::DefocusX)?)),
            Attr::PixelTranslations => geometry::pixel_translations(self),
            _ => Err(DataError::Missing(attr)),
        }
    }
    /// Returns the attribute value, deriving it if needed
    pub fn get(&self, attr: Attr) -> Result<Option<&Value>> {
        if let Some(value) = self.values.get(&attr) {
            return Ok(Some(&**value));
        }
        match self.derived.get(&attr) {
            Some(cell) if self.is_derivable(attr) => {
                let value = cell.get_or_try_init(|| self.derive(attr).map(Arc::new))?;
                Ok(Some(&**value))
            }
            _ => Ok(None),
        }
    }
    /// Returns the attribute value or a [`DataError::Missing`] error
    pub fn require(&self, attr: Attr) -> Result<&Value> {
        self.get(attr)?.ok_or(DataError::Missing(attr))
    }
    fn mismatch(attr: Attr, value: &Value) -> DataError {
        ProtocolError::Value {
            attr,
            expected: attr.value_type().to_string(),
            found: value.value_type().to_string(),
        }
        .into()
    }
    pub fn scalar(&self, attr: Attr) -> Result<f64> {
        match self.require(attr)? {
            Value::Scalar(value) => Ok(*value),
            value => Err(Self::mismatch(attr, value)),
        }
    }
    pub fn indices(&self, attr: Attr) -> Result<&Array1<usize>> {
        match self.require(attr)? {
            Value::Indices(value) => Ok(value),
            value => Err(Self::mismatch(attr, value)),
        }
    }
    /// Returns a float array attribute with the dimensionality `D`
    pub fn float<D: Dimension>(&self, attr: Attr) -> Result<ArrayView<f64, D>> {
        match self.require(attr)? {
            Value::Float(value) => value
                .view()
                .into_dimensionality::<D>()
                .map_err(|_| Self::mismatch(attr, &Value::Float(value.clone()))),
            value => Err(Self::mismatch(attr, value)),
        }
    }
    pub fn data(&self) -> Result<&Array3<u32>> {
        match self.require(Attr::Data)? {
            Value::Counts(value) => Ok(value),
            value => Err(Self::mismatch(Attr::Data, value)),
        }
    }
    pub fn mask(&self) -> Result<&Array3<bool>> {
        match self.require(Attr::Mask)? {
            Value::Mask(value) => Ok(value),
            value => Err(Self::mismatch(Attr::Mask, value)),
        }
    }
    pub fn good_frames(&self) -> Result<&Array1<usize>> {
        self.indices(Attr::GoodFrames)
    }
    pub fn whitefield(&self) -> Result<ArrayView2<f64>> {
        self.float::<Ix2>(Attr::Whitefield)
    }
    pub fn transform(&self) -> Option<&Transform> {
        match self.values.get(&Attr::Transform).map(|value| &**value) {
            Some(Value::Transform(transform)) => Some(transform),
            _ => None,
        }
    }
    pub fn num_threads(&self) -> usize {
        match self.get(Attr::NumThreads) {
            Ok(Some(Value::Threads(n))) => (*n).max(1),
            _ => default_threads(),
        }
    }
    /// Required attributes neither set nor derivable
    pub fn missing_required(&self) -> Vec<Attr> {
        Attr::iter()
            .filter(|attr| attr.is_required() && !self.contains(*attr))
            .collect()
    }
    /// Attributes explicitly set with the given kind
    fn explicit_of(&self, kind: Kind) -> impl Iterator<Item = (Attr, &Value)> + '_ {
        let protocol = self.input.protocol();
        self.values
            .iter()
            .filter(move |(attr, _)| protocol.kind(**attr) == Some(kind))
            .map(|(attr, value)| (*attr, &**value))
    }
    /// Returns the shape `(frames, rows, columns)` of the container
    ///
    /// The number of frames is given by the sequence attributes, the frame shape by the frame
    /// attributes, and both are overridden by the stack attributes.
    pub fn shape(&self) -> [usize; 3] {
        let mut shape = [0; 3];
        for (_, value) in self.explicit_of(Kind::Sequence) {
            if let Some(&n) = value.shape().first() {
                shape[0] = n;
            }
        }
        for (_, value) in self.explicit_of(Kind::Frame) {
            let dims = value.shape();
            if dims.len() >= 2 {
                shape[1..].copy_from_slice(&dims[dims.len() - 2..]);
            }
        }
        for (_, value) in self.explicit_of(Kind::Stack) {
            if let [n, rows, cols] = value.shape() {
                shape = [*n, *rows, *cols];
            }
        }
        shape
    }
    /// Loads attributes from the input storage
    ///
    /// Every available attribute is loaded if `selection` is `None`, and all the frames
    /// of the storage if `idxs` is `None`. The frames are cropped with the container
    /// transform if any.
    pub fn load(
        &self,
        selection: Option<Selection>,
        idxs: Option<Vec<usize>>,
        processes: usize,
        verbose: bool,
    ) -> Result<Self> {
        let session = Session::open(&*self.input)?;
        let frame_shape = session.read_shape()?;
        let protocol = session.protocol();
        let available = session.list_available_attributes()?;
        let attrs = match selection {
            Some(selection) => protocol.str_to_list(selection)?,
            None => available
                .iter()
                .copied()
                .filter(|attr| protocol.contains(*attr))
                .collect(),
        };
        if let Some(attr) = attrs.iter().find(|attr| !available.contains(attr)) {
            return Err(StorageError::Missing(*attr).into());
        }
        let idxs = match idxs {
            Some(idxs) => idxs,
            None => session.indices()?.to_vec(),
        };
        let pixels = match self.transform() {
            Some(transform) if frame_shape.0 * frame_shape.1 > 0 => {
                let (ss_idxs, fs_idxs) = transform::indices(frame_shape);
                Some(transform.index_array(ss_idxs.view(), fs_idxs.view())?)
            }
            _ => None,
        };
        let now = Instant::now();
        let mut patch = Patch::new()
            .set(Attr::Frames, idxs.clone())
            .clear(Attr::GoodFrames);
        for attr in attrs {
            let value = session.load_attribute(
                attr,
                &idxs,
                pixels.as_ref().map(|(ss, fs)| (ss, fs)),
                processes,
                verbose,
            )?;
            patch = patch.set(attr, value);
        }
        if verbose {
            log::info!("Data loaded in {:}ms", now.elapsed().as_millis());
        }
        self.apply(patch)
    }
    /// Saves attributes to the output storage
    ///
    /// Every attribute the container holds, explicitly or derived, is saved if `selection`
    /// is `None`, but for `num_threads` and `good_frames`.
    /// Only the good frames of the stack and sequence attributes are saved.
    pub fn save(
        &self,
        selection: Option<Selection>,
        mode: SaveMode,
        idxs: Option<&[usize]>,
    ) -> Result<()> {
        let output = self.output.as_ref().ok_or(DataError::MissingOutput)?;
        let session = Session::open(&**output)?;
        let protocol = session.protocol();
        let attrs = match selection {
            Some(selection) => protocol.str_to_list(selection)?,
            None => Attr::iter()
                .filter(|attr| {
                    !matches!(attr, Attr::NumThreads | Attr::GoodFrames) && self.contains(*attr)
                })
                .collect(),
        };
        let now = Instant::now();
        for attr in attrs {
            let Some(kind) = protocol.kind(attr) else {
                continue;
            };
            let Some(value) = self.get(attr)? else {
                continue;
            };
            log::info!("Saving {attr} ({mode})...");
            match kind {
                Kind::Stack | Kind::Sequence => {
                    let good_frames = self.good_frames()?.to_vec();
                    let frames = value.select_frames(attr, &good_frames)?;
                    session.save_attribute(attr, &frames, mode, idxs)?
                }
                Kind::Scalar | Kind::Frame => session.save_attribute(attr, value, mode, idxs)?,
            }
        }
        log::info!("... saved in {:}ms", now.elapsed().as_millis());
        Ok(())
    }
    /// Clears array attributes
    pub fn clear(&self, selection: Option<Selection>) -> Result<Self> {
        let attrs = match selection {
            Some(selection) => self.input.protocol().str_to_list(selection)?,
            None => self.keys().collect(),
        };
        let patch = attrs
            .into_iter()
            .filter(|attr| self.values.get(attr).is_some_and(|value| value.is_array()))
            .fold(Patch::new(), Patch::clear);
        self.apply(patch)
    }
    /// Returns a new container saving to the `output` storage
    pub fn update_output_file(&self, output: Arc<dyn Storage>) -> Result<Self> {
        Ok(self.apply(Patch::new())?.with_output(output))
    }
    /// Sums the valid pixels of `data` along the slow (0) or fast (1) detector axis
    ///
    /// The frame and stack attributes are cleared.
    pub fn integrate_data(&self, axis: usize) -> Result<Self> {
        if axis > 1 {
            return Err(DataError::invalid("axis", axis));
        }
        let data = self.data()?;
        let mask = self.mask()?;
        if data.shape() != mask.shape() {
            return Err(DataError::Shape(format!(
                "data {:?} and mask {:?}",
                data.shape(),
                mask.shape()
            )));
        }
        let (n_frames, rows, cols) = data.dim();
        let shape = if axis == 0 {
            (n_frames, 1, cols)
        } else {
            (n_frames, rows, 1)
        };
        let mut sums = Array3::<u64>::zeros(shape);
        Zip::from(sums.lanes_mut(Axis(axis + 1)))
            .and(data.lanes(Axis(axis + 1)))
            .and(mask.lanes(Axis(axis + 1)))
            .for_each(|mut sum, data, mask| {
                sum[0] = data
                    .iter()
                    .zip(mask.iter())
                    .filter_map(|(&value, &valid)| valid.then_some(value as u64))
                    .sum();
            });
        let integrated = sums.mapv(|sum| sum.min(u32::MAX as u64) as u32);
        let patch = self
            .explicit_of(Kind::Stack)
            .chain(self.explicit_of(Kind::Frame))
            .fold(Patch::new(), |patch, (attr, _)| patch.clear(attr))
            .set(Attr::Data, integrated);
        self.apply(patch)
    }
    /// Selects the good frames, the frames with a positive sum by default
    pub fn mask_frames(&self, good_frames: Option<Vec<usize>>) -> Result<Self> {
        let good_frames = match good_frames {
            Some(good_frames) => {
                let n_frames = self.shape()[0];
                if let Some(index) = good_frames.iter().find(|&&index| index >= n_frames) {
                    return Err(DataError::invalid("good_frames", index));
                }
                good_frames
            }
            None => self
                .data()?
                .outer_iter()
                .enumerate()
                .filter(|(_, frame)| frame.iter().any(|&value| value > 0))
                .map(|(index, _)| index)
                .collect(),
        };
        self.apply(
            Patch::new()
                .set(Attr::GoodFrames, good_frames)
                .clear(Attr::Whitefield),
        )
    }
    /// Sets the frames transform
    ///
    /// Without a previous transform the frame and stack attributes are transformed,
    /// otherwise they are cleared and need to be reloaded.
    pub fn update_transform(&self, transform: Transform) -> Result<Self> {
        let had_transform = self.transform().is_some();
        let mut patch = Patch::new();
        for (attr, value) in self
            .explicit_of(Kind::Stack)
            .chain(self.explicit_of(Kind::Frame))
        {
            patch = if had_transform {
                patch.clear(attr)
            } else {
                patch.set(attr, forward(&transform, value)?)
            };
        }
        self.apply(patch.set(Attr::Transform, transform))
    }
    /// Clears the whitefield, derived again on next access
    pub fn update_whitefield(&self) -> Result<Self> {
        self.apply(Patch::new().clear(Attr::Whitefield))
    }
    /// Sets the defocus distances, `defocus_y` equals `defocus_x` if not given
    pub fn update_defocus(&self, defocus_x: f64, defocus_y: Option<f64>) -> Result<Self> {
        let defocus_y = defocus_y.unwrap_or(defocus_x);
        for (name, defocus) in [("defocus_x", defocus_x), ("defocus_y", defocus_y)] {
            if defocus == 0.0 || !defocus.is_finite() {
                return Err(DataError::invalid(name, defocus));
            }
        }
        self.apply(
            Patch::new()
                .set(Attr::DefocusX, defocus_x)
                .set(Attr::DefocusY, defocus_y)
                .clear(Attr::PixelTranslations),
        )
    }
}

/// Applies a transform to the two trailing axes of an array value
fn forward(transform: &Transform, value: &Value) -> Result<Value> {
    Ok(match value {
        Value::Float(array) => Value::Float(transform.forward(array)?),
        Value::Counts(array) => Value::Counts(transform.forward(array)?),
        Value::Mask(array) => Value::Mask(transform.forward(array)?),
        value => value.clone(),
    })
}

/// Converts the frames `idxs` of a stack to floats, zeroing the masked pixels
pub(crate) fn masked_frames(
    data: &Array3<u32>,
    mask: &Array3<bool>,
    idxs: &[usize],
) -> Result<Array3<f64>> {
    if data.shape() != mask.shape() {
        return Err(DataError::Shape(format!(
            "data {:?} and mask {:?}",
            data.shape(),
            mask.shape()
        )));
    }
    let n_frames = data.len_of(Axis(0));
    if let Some(index) = idxs.iter().find(|&&index| index >= n_frames) {
        return Err(DataError::invalid("good_frames", index));
    }
    let (_, rows, cols) = data.dim();
    Ok(Array3::from_shape_fn((idxs.len(), rows, cols), |(k, i, j)| {
        let index = idxs[k];
        if mask[[index, i, j]] {
            data[[index, i, j]] as f64
        } else {
            0.0
        }
    }))
}

/// Identity pixel grid of a frame
pub(crate) fn identity_grid(shape: (usize, usize)) -> (Array2<f64>, Array2<f64>) {
    let (ss, fs) = transform::indices(shape);
    (ss.mapv(|i| i as f64), fs.mapv(|j| j as f64))
}
