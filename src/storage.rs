/*!
# Storage backends

The [`Storage`] trait is the contract of the file backend that persists and
loads the data attributes of a [`STData`](crate::STData) container: a key-value
store keyed by attribute name, supporting partial loads and saves along the
frame axis.

[`MemoryStore`] is an in-memory implementation of the contract.
*/

use std::{
    collections::BTreeMap,
    ops::Deref,
    sync::atomic::{AtomicUsize, Ordering},
    time::Instant,
};

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{concatenate, Array, Array1, Array2, ArrayView, Axis, RemoveAxis};
use parking_lot::RwLock;
use rayon::prelude::*;
use strum_macros::{Display, EnumString};

use crate::protocol::{Attr, Kind, Protocol, ProtocolError, Value};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("no '{0}' attribute in the storage")]
    Missing(Attr),
    #[error("the storage is closed")]
    Closed,
    #[error("invalid save mode: {0:?}")]
    InvalidMode(String),
    #[error("'insert' mode needs a set of frame indices")]
    Indices,
    #[error("frames of {0} have incompatible shapes")]
    FrameShape(Attr),
    #[error("invalid attribute value")]
    Protocol(#[from] ProtocolError),
    #[error("failed to assemble {0}")]
    Shape(Attr, #[source] ndarray::ShapeError),
    #[error("failed to build the loading workers pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
type Result<T> = std::result::Result<T, StorageError>;

/// Writing mode of [`Storage::save_attribute`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SaveMode {
    /// Append the data array to the already existing dataset
    #[default]
    Append,
    /// Insert the data under the given frame indices
    Insert,
    /// Overwrite the existing dataset
    Overwrite,
}
impl SaveMode {
    pub fn from_name(name: &str) -> Result<Self> {
        name.parse()
            .map_err(|_| StorageError::InvalidMode(name.to_string()))
    }
}

/// Storage backend contract
pub trait Storage: Send + Sync {
    /// Attribute kinds of the stored data
    fn protocol(&self) -> &Protocol;
    fn open(&self) -> Result<()>;
    fn close(&self);
    /// Shape `(rows, columns)` of the stored detector frames
    fn read_shape(&self) -> Result<(usize, usize)>;
    /// Positions of the stored frames
    fn indices(&self) -> Result<Array1<usize>>;
    fn list_available_attributes(&self) -> Result<Vec<Attr>>;
    /// Loads the frames `idxs` of an attribute
    ///
    /// Only the detector pixels `(ss_idxs, fs_idxs)` are loaded if `pixels` is given.
    /// The loading may be split between `processes` workers.
    fn load_attribute(
        &self,
        attr: Attr,
        idxs: &[usize],
        pixels: Option<(&Array2<usize>, &Array2<usize>)>,
        processes: usize,
        verbose: bool,
    ) -> Result<Value>;
    fn save_attribute(
        &self,
        attr: Attr,
        value: &Value,
        mode: SaveMode,
        idxs: Option<&[usize]>,
    ) -> Result<()>;
}

/// Opened storage, closed when dropped
pub struct Session<'a> {
    storage: &'a dyn Storage,
}
impl<'a> Session<'a> {
    pub fn open(storage: &'a dyn Storage) -> Result<Self> {
        storage.open()?;
        Ok(Self { storage })
    }
}
impl<'a> Deref for Session<'a> {
    type Target = dyn Storage + 'a;

    fn deref(&self) -> &Self::Target {
        self.storage
    }
}
impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.storage.close();
    }
}

/// In-memory storage
#[derive(Debug, Default)]
pub struct MemoryStore {
    protocol: Protocol,
    attributes: RwLock<BTreeMap<Attr, Value>>,
    sessions: AtomicUsize,
}
impl MemoryStore {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            ..Default::default()
        }
    }
    /// Adds an attribute to the store
    pub fn with<V: Into<Value>>(self, attr: Attr, value: V) -> Result<Self> {
        let value = value.into();
        value.check(attr)?;
        self.attributes.write().insert(attr, value);
        Ok(self)
    }
    /// Returns a copy of a stored attribute
    pub fn get(&self, attr: Attr) -> Option<Value> {
        self.attributes.read().get(&attr).cloned()
    }
    pub fn is_open(&self) -> bool {
        self.sessions.load(Ordering::SeqCst) > 0
    }
    fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(StorageError::Closed)
        }
    }
    fn load_frames(
        &self,
        attr: Attr,
        value: &Value,
        idxs: &[usize],
        processes: usize,
        verbose: bool,
    ) -> Result<Value> {
        if processes <= 1 || idxs.len() < 2 {
            return Ok(value.select_frames(attr, idxs)?);
        }
        let pb = if verbose {
            let pb = ProgressBar::new(idxs.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            pb.set_message(format!("Loading {attr}"));
            pb
        } else {
            ProgressBar::hidden()
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(processes)
            .build()?;
        let chunk_size = idxs.len().div_ceil(processes);
        let chunks = pool.install(|| {
            idxs.par_chunks(chunk_size)
                .map(|chunk| {
                    let frames = value.select_frames(attr, chunk);
                    pb.inc(chunk.len() as u64);
                    frames
                })
                .collect::<std::result::Result<Vec<_>, _>>()
        })?;
        pb.finish_and_clear();
        concatenate_frames(attr, &chunks)
    }
}

fn append<A: Clone, D: RemoveAxis>(
    attr: Attr,
    views: &[ArrayView<A, D>],
) -> Result<Array<A, D>> {
    concatenate(Axis(0), views).map_err(|e| StorageError::Shape(attr, e))
}

/// Assembles the chunks of an attribute along the frame axis
fn concatenate_frames(attr: Attr, chunks: &[Value]) -> Result<Value> {
    let Some(first) = chunks.first() else {
        return Err(StorageError::Missing(attr));
    };
    macro_rules! join {
        ($variant:ident) => {{
            let views: Vec<_> = chunks
                .iter()
                .filter_map(|chunk| match chunk {
                    Value::$variant(array) => Some(array.view()),
                    _ => None,
                })
                .collect();
            if views.len() != chunks.len() {
                return Err(StorageError::FrameShape(attr));
            }
            Value::$variant(append(attr, &views)?)
        }};
    }
    Ok(match first {
        Value::Indices(_) => join!(Indices),
        Value::Float(_) => join!(Float),
        Value::Counts(_) => join!(Counts),
        Value::Mask(_) => join!(Mask),
        value => value.clone(),
    })
}

/// Writes the frames of `source` into `target` at `idxs`
fn insert_frames<A: Clone, D: RemoveAxis>(
    attr: Attr,
    target: &mut Array<A, D>,
    source: &Array<A, D>,
    idxs: &[usize],
) -> Result<()> {
    let len = target.len_of(Axis(0));
    for (frame, &index) in source.axis_iter(Axis(0)).zip(idxs) {
        if index >= len {
            return Err(ProtocolError::Frame { attr, index, len }.into());
        }
        let mut row = target.index_axis_mut(Axis(0), index);
        if row.shape() != frame.shape() {
            return Err(StorageError::FrameShape(attr));
        }
        row.assign(&frame);
    }
    Ok(())
}

impl Storage for MemoryStore {
    fn protocol(&self) -> &Protocol {
        &self.protocol
    }
    fn open(&self) -> Result<()> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn close(&self) {
        let _ = self
            .sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
    fn read_shape(&self) -> Result<(usize, usize)> {
        self.check_open()?;
        let attributes = self.attributes.read();
        let frame_shape = |value: &Value| {
            let shape = value.shape();
            let ndim = shape.len();
            (ndim >= 2).then(|| (shape[ndim - 2], shape[ndim - 1]))
        };
        if let Some(shape) = attributes.get(&Attr::Data).and_then(frame_shape) {
            return Ok(shape);
        }
        Ok(attributes
            .iter()
            .filter(|(attr, _)| {
                matches!(
                    self.protocol.kind(**attr),
                    Some(Kind::Stack) | Some(Kind::Frame)
                )
            })
            .find_map(|(_, value)| frame_shape(value))
            .unwrap_or_default())
    }
    fn indices(&self) -> Result<Array1<usize>> {
        self.check_open()?;
        let attributes = self.attributes.read();
        if let Some(&n_frames) = attributes
            .get(&Attr::Data)
            .and_then(|data| data.shape().first())
        {
            return Ok(Array1::from_iter(0..n_frames));
        }
        let n_frames = attributes
            .iter()
            .filter(|(attr, _)| {
                matches!(
                    self.protocol.kind(**attr),
                    Some(Kind::Stack) | Some(Kind::Sequence)
                )
            })
            .find_map(|(_, value)| value.shape().first().copied())
            .unwrap_or_default();
        Ok(Array1::from_iter(0..n_frames))
    }
    fn list_available_attributes(&self) -> Result<Vec<Attr>> {
        self.check_open()?;
        Ok(self.attributes.read().keys().copied().collect())
    }
    fn load_attribute(
        &self,
        attr: Attr,
        idxs: &[usize],
        pixels: Option<(&Array2<usize>, &Array2<usize>)>,
        processes: usize,
        verbose: bool,
    ) -> Result<Value> {
        self.check_open()?;
        let value = self
            .attributes
            .read()
            .get(&attr)
            .cloned()
            .ok_or(StorageError::Missing(attr))?;
        if verbose {
            log::info!("Loading {attr}...");
        }
        let now = Instant::now();
        let value = match self.protocol.kind(attr) {
            Some(Kind::Stack) => self.load_frames(attr, &value, idxs, processes, verbose)?,
            Some(Kind::Sequence) => value.select_frames(attr, idxs)?,
            _ => value,
        };
        let value = match (self.protocol.kind(attr), pixels) {
            (Some(Kind::Stack) | Some(Kind::Frame), Some((ss_idxs, fs_idxs))) => {
                value.select_pixels(attr, ss_idxs, fs_idxs)?
            }
            _ => value,
        };
        if verbose {
            log::info!("... {attr} loaded in {:}ms", now.elapsed().as_millis());
        }
        Ok(value)
    }
    fn save_attribute(
        &self,
        attr: Attr,
        value: &Value,
        mode: SaveMode,
        idxs: Option<&[usize]>,
    ) -> Result<()> {
        self.check_open()?;
        value.check(attr)?;
        let framed = matches!(
            self.protocol.kind(attr),
            Some(Kind::Stack) | Some(Kind::Sequence)
        );
        let mut attributes = self.attributes.write();
        let existing = attributes.get_mut(&attr);
        log::debug!("saving {attr} ({mode})");
        match (mode, existing) {
            (SaveMode::Append, Some(existing)) if framed => {
                let joined = concatenate_frames(attr, &[existing.clone(), value.clone()])?;
                *existing = joined;
            }
            (SaveMode::Insert, Some(existing)) if framed => {
                let idxs = idxs.ok_or(StorageError::Indices)?;
                match (existing, value) {
                    (Value::Indices(target), Value::Indices(source)) => {
                        insert_frames(attr, target, source, idxs)?
                    }
                    (Value::Float(target), Value::Float(source)) => {
                        insert_frames(attr, target, source, idxs)?
                    }
                    (Value::Counts(target), Value::Counts(source)) => {
                        insert_frames(attr, target, source, idxs)?
                    }
                    (Value::Mask(target), Value::Mask(source)) => {
                        insert_frames(attr, target, source, idxs)?
                    }
                    _ => return Err(StorageError::FrameShape(attr)),
                }
            }
            (SaveMode::Insert, None) if idxs.is_none() => return Err(StorageError::Indices),
            _ => {
                attributes.insert(attr, value.clone());
            }
        }
        Ok(())
    }
}
