//! Data attributes, their kinds and values

use std::{collections::BTreeMap, fmt, str::FromStr};

use ndarray::{Array1, Array2, Array3, ArrayBase, ArrayD, Axis, Data, Dimension, Ix3, IxDyn};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

use crate::transform::Transform;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid attribute: {0:?}")]
    Attribute(String),
    #[error("{attr} expects {expected}, got {found}")]
    Value {
        attr: Attr,
        expected: String,
        found: String,
    },
    #[error("frame index {index} is out of bounds for {attr} with {len} frames")]
    Frame {
        attr: Attr,
        index: usize,
        len: usize,
    },
    #[error("pixel index is out of bounds for {0}")]
    Pixel(Attr),
}
type Result<T> = std::result::Result<T, ProtocolError>;

/// Data attributes of a speckle tracking experiment
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    EnumIter,
    EnumString,
    Display,
    AsRefStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Attr {
    /// Detector basis vectors [m]
    BasisVectors,
    /// Measured intensity frames
    Data,
    /// Defocus distance along the horizontal detector axis [m]
    DefocusX,
    /// Defocus distance along the vertical detector axis [m]
    DefocusY,
    /// Sample-to-detector distance [m]
    Distance,
    /// Frame indices
    Frames,
    /// Indices of the frames used in the processing
    GoodFrames,
    /// Bad pixels mask
    Mask,
    /// Number of threads used in the computations
    NumThreads,
    /// Phase profile of the lens' aberrations [rad]
    Phase,
    /// Lens' aberrations along the vertical and horizontal axes [pixels]
    PixelAberrations,
    /// Sample's translations in the detector plane [pixels]
    PixelTranslations,
    /// Unaberrated reference image of the sample
    ReferenceImage,
    /// Huber scale map
    ScaleMap,
    /// Frames transform
    Transform,
    /// Sample's translations [m]
    Translations,
    /// Incoming beam's wavelength [m]
    Wavelength,
    /// White-field of the measured frames
    Whitefield,
    /// Dynamic white-fields, one per frame
    Whitefields,
    /// Pixel size along the horizontal detector axis [m]
    XPixelSize,
    /// Pixel size along the vertical detector axis [m]
    YPixelSize,
}

/// Value variant expected by an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Scalar,
    Threads,
    Indices,
    Float(usize),
    Counts,
    Mask,
    Transform,
}
impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Scalar => write!(f, "a scalar"),
            ValueType::Threads => write!(f, "a thread count"),
            ValueType::Indices => write!(f, "an index array"),
            ValueType::Float(ndim) => write!(f, "a {ndim}D float array"),
            ValueType::Counts => write!(f, "a 3D count array"),
            ValueType::Mask => write!(f, "a 3D boolean array"),
            ValueType::Transform => write!(f, "a transform"),
        }
    }
}

impl Attr {
    /// Attributes a container can't do without
    pub fn is_required(&self) -> bool {
        use Attr::*;
        matches!(
            self,
            BasisVectors | Data | Distance | Frames | Translations | Wavelength | XPixelSize
                | YPixelSize
        )
    }
    pub fn value_type(&self) -> ValueType {
        use Attr::*;
        match self {
            DefocusX | DefocusY | Distance | Wavelength | XPixelSize | YPixelSize => {
                ValueType::Scalar
            }
            NumThreads => ValueType::Threads,
            Frames | GoodFrames => ValueType::Indices,
            Data => ValueType::Counts,
            Mask => ValueType::Mask,
            Attr::Transform => ValueType::Transform,
            Translations | PixelTranslations | Phase | ReferenceImage | ScaleMap
            | Whitefield => ValueType::Float(2),
            BasisVectors | PixelAberrations | Whitefields => ValueType::Float(3),
        }
    }
    /// Attributes a derived attribute is computed from
    pub fn dependencies(&self) -> &'static [Attr] {
        use Attr::*;
        match self {
            GoodFrames => &[Data, Frames, BasisVectors, Translations],
            Mask => &[Data],
            Whitefield => &[Data, Mask, GoodFrames],
            DefocusY => &[DefocusX],
            PixelTranslations => &[Translations, BasisVectors, Distance, DefocusX, DefocusY],
            _ => &[],
        }
    }
}

/// Attribute kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    /// A single value
    Scalar,
    /// A 2D field with the shape of a detector frame
    Frame,
    /// One value per frame
    Sequence,
    /// One detector frame per frame
    Stack,
}

/// Attribute kind lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Protocol {
    kinds: BTreeMap<Attr, Kind>,
}
impl Default for Protocol {
    fn default() -> Self {
        use Attr::*;
        let kinds = Attr::iter()
            .filter_map(|attr| {
                let kind = match attr {
                    BasisVectors | Frames | Translations | PixelTranslations => Kind::Sequence,
                    Data | Mask | Whitefields => Kind::Stack,
                    Whitefield | Phase | PixelAberrations | ScaleMap => Kind::Frame,
                    Attr::Transform => return None,
                    _ => Kind::Scalar,
                };
                Some((attr, kind))
            })
            .collect();
        Self { kinds }
    }
}
impl Protocol {
    /// Returns the kind of an attribute, if it is part of the protocol
    pub fn kind(&self, attr: Attr) -> Option<Kind> {
        self.kinds.get(&attr).copied()
    }
    pub fn contains(&self, attr: Attr) -> bool {
        self.kinds.contains_key(&attr)
    }
    /// Changes the kind of an attribute
    pub fn with_kind(mut self, attr: Attr, kind: Kind) -> Self {
        self.kinds.insert(attr, kind);
        self
    }
    /// Normalizes a selection of attribute names into a list of attributes
    pub fn str_to_list<S: Into<Selection>>(&self, selection: S) -> Result<Vec<Attr>> {
        selection.into().into_list()
    }
}

/// One attribute, a comma separated list of attribute names or a list of attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Names(Vec<String>),
    Attrs(Vec<Attr>),
}
impl Selection {
    pub fn into_list(self) -> Result<Vec<Attr>> {
        match self {
            Selection::Attrs(attrs) => Ok(attrs),
            Selection::Names(names) => names
                .iter()
                .map(|name| name.trim())
                .filter(|name| !name.is_empty())
                .map(|name| {
                    Attr::from_str(name).map_err(|_| ProtocolError::Attribute(name.to_string()))
                })
                .collect(),
        }
    }
}
impl From<Attr> for Selection {
    fn from(attr: Attr) -> Self {
        Selection::Attrs(vec![attr])
    }
}
impl From<Vec<Attr>> for Selection {
    fn from(attrs: Vec<Attr>) -> Self {
        Selection::Attrs(attrs)
    }
}
impl From<&[Attr]> for Selection {
    fn from(attrs: &[Attr]) -> Self {
        Selection::Attrs(attrs.to_vec())
    }
}
impl From<&str> for Selection {
    fn from(names: &str) -> Self {
        Selection::Names(names.split(',').map(String::from).collect())
    }
}
impl From<Vec<&str>> for Selection {
    fn from(names: Vec<&str>) -> Self {
        Selection::Names(names.into_iter().map(String::from).collect())
    }
}
impl From<Vec<String>> for Selection {
    fn from(names: Vec<String>) -> Self {
        Selection::Names(names)
    }
}

/// Attribute value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Threads(usize),
    Indices(Array1<usize>),
    Float(ArrayD<f64>),
    Counts(Array3<u32>),
    Mask(Array3<bool>),
    Transform(Transform),
}
impl Value {
    pub fn shape(&self) -> &[usize] {
        match self {
            Value::Indices(value) => value.shape(),
            Value::Float(value) => value.shape(),
            Value::Counts(value) => value.shape(),
            Value::Mask(value) => value.shape(),
            Value::Scalar(_) | Value::Threads(_) | Value::Transform(_) => &[],
        }
    }
    /// Returns true if the value is an array
    pub fn is_array(&self) -> bool {
        matches!(
            self,
            Value::Indices(_) | Value::Float(_) | Value::Counts(_) | Value::Mask(_)
        )
    }
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Scalar(_) => ValueType::Scalar,
            Value::Threads(_) => ValueType::Threads,
            Value::Indices(_) => ValueType::Indices,
            Value::Float(value) => ValueType::Float(value.ndim()),
            Value::Counts(_) => ValueType::Counts,
            Value::Mask(_) => ValueType::Mask,
            Value::Transform(_) => ValueType::Transform,
        }
    }
    /// Checks that the value fits the attribute
    pub fn check(&self, attr: Attr) -> Result<()> {
        let expected = attr.value_type();
        let found = self.value_type();
        if expected == found {
            Ok(())
        } else {
            Err(ProtocolError::Value {
                attr,
                expected: expected.to_string(),
                found: found.to_string(),
            })
        }
    }
    /// Selects the frames `idxs` along the first axis of an array value
    pub fn select_frames(&self, attr: Attr, idxs: &[usize]) -> Result<Value> {
        let len = self.shape().first().copied().unwrap_or_default();
        if let Some(&index) = idxs.iter().find(|&&index| index >= len) {
            if self.is_array() {
                return Err(ProtocolError::Frame { attr, index, len });
            }
        }
        Ok(match self {
            Value::Indices(value) => Value::Indices(value.select(Axis(0), idxs)),
            Value::Float(value) => Value::Float(value.select(Axis(0), idxs)),
            Value::Counts(value) => Value::Counts(value.select(Axis(0), idxs)),
            Value::Mask(value) => Value::Mask(value.select(Axis(0), idxs)),
            value => value.clone(),
        })
    }
    /// Picks the detector pixels `(ss_idxs, fs_idxs)` along the two trailing axes
    pub fn select_pixels(
        &self,
        attr: Attr,
        ss_idxs: &Array2<usize>,
        fs_idxs: &Array2<usize>,
    ) -> Result<Value> {
        Ok(match self {
            Value::Float(value) => Value::Float(pick_pixels(attr, value, ss_idxs, fs_idxs)?),
            Value::Counts(value) => Value::Counts(
                pick_pixels(attr, value, ss_idxs, fs_idxs)?
                    .into_dimensionality::<Ix3>()
                    .map_err(|_| ProtocolError::Pixel(attr))?,
            ),
            Value::Mask(value) => Value::Mask(
                pick_pixels(attr, value, ss_idxs, fs_idxs)?
                    .into_dimensionality::<Ix3>()
                    .map_err(|_| ProtocolError::Pixel(attr))?,
            ),
            value => value.clone(),
        })
    }
}

fn pick_pixels<A, S, D>(
    attr: Attr,
    value: &ArrayBase<S, D>,
    ss_idxs: &Array2<usize>,
    fs_idxs: &Array2<usize>,
) -> Result<ArrayD<A>>
where
    A: Clone,
    S: Data<Elem = A>,
    D: Dimension,
{
    let shape = value.shape();
    let ndim = shape.len();
    if ndim < 2 {
        return Err(ProtocolError::Pixel(attr));
    }
    let (rows, cols) = (shape[ndim - 2], shape[ndim - 1]);
    if ss_idxs.iter().any(|&i| i >= rows) || fs_idxs.iter().any(|&j| j >= cols) {
        return Err(ProtocolError::Pixel(attr));
    }
    let flat: Vec<&A> = value.iter().collect();
    let n_lead: usize = shape[..ndim - 2].iter().product();
    let mut values = Vec::with_capacity(n_lead * ss_idxs.len());
    for k in 0..n_lead {
        let offset = k * rows * cols;
        values.extend(
            ss_idxs
                .iter()
                .zip(fs_idxs.iter())
                .map(|(&i, &j)| flat[offset + i * cols + j].clone()),
        );
    }
    let mut out_shape = shape[..ndim - 2].to_vec();
    out_shape.extend_from_slice(ss_idxs.shape());
    ArrayD::from_shape_vec(IxDyn(&out_shape), values).map_err(|_| ProtocolError::Pixel(attr))
}
impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Scalar(value)
    }
}
impl From<Array3<u32>> for Value {
    fn from(value: Array3<u32>) -> Self {
        Value::Counts(value)
    }
}
impl From<Array3<bool>> for Value {
    fn from(value: Array3<bool>) -> Self {
        Value::Mask(value)
    }
}
impl From<Array1<usize>> for Value {
    fn from(value: Array1<usize>) -> Self {
        Value::Indices(value)
    }
}
impl From<Vec<usize>> for Value {
    fn from(value: Vec<usize>) -> Self {
        Value::Indices(Array1::from(value))
    }
}
impl From<Array2<f64>> for Value {
    fn from(value: Array2<f64>) -> Self {
        Value::Float(value.into_dyn())
    }
}
impl From<Array3<f64>> for Value {
    fn from(value: Array3<f64>) -> Self {
        Value::Float(value.into_dyn())
    }
}
impl From<Transform> for Value {
    fn from(value: Transform) -> Self {
        Value::Transform(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_names() {
        assert_eq!(Attr::XPixelSize.to_string(), "x_pixel_size");
        assert_eq!(Attr::from_str("pixel_aberrations").unwrap(), Attr::PixelAberrations);
        assert!(Attr::from_str("not_an_attribute").is_err());
    }

    #[test]
    fn default_kinds() {
        let protocol = Protocol::default();
        assert_eq!(protocol.kind(Attr::Data), Some(Kind::Stack));
        assert_eq!(protocol.kind(Attr::Whitefield), Some(Kind::Frame));
        assert_eq!(protocol.kind(Attr::Translations), Some(Kind::Sequence));
        assert_eq!(protocol.kind(Attr::Distance), Some(Kind::Scalar));
        assert_eq!(protocol.kind(Attr::Transform), None);
    }

    #[test]
    fn str_to_list() {
        let protocol = Protocol::default();
        assert_eq!(protocol.str_to_list("data").unwrap(), vec![Attr::Data]);
        assert_eq!(
            protocol.str_to_list("data, mask,whitefield").unwrap(),
            vec![Attr::Data, Attr::Mask, Attr::Whitefield]
        );
        assert_eq!(
            protocol.str_to_list(vec!["frames", "distance"]).unwrap(),
            vec![Attr::Frames, Attr::Distance]
        );
        assert_eq!(protocol.str_to_list(Attr::Phase).unwrap(), vec![Attr::Phase]);
        assert!(matches!(
            protocol.str_to_list("data,foo"),
            Err(ProtocolError::Attribute(name)) if name == "foo"
        ));
    }

    #[test]
    fn value_check() {
        let value = Value::from(Array2::<f64>::zeros((3, 3)));
        assert!(value.check(Attr::Whitefield).is_ok());
        assert!(value.check(Attr::Whitefields).is_err());
        assert!(Value::Scalar(1.0).check(Attr::Data).is_err());
    }

    #[test]
    fn select_frames_and_pixels() {
        let data = Array3::from_shape_fn((4, 3, 3), |(k, i, j)| (100 * k + 10 * i + j) as u32);
        let value = Value::from(data);
        let frames = value.select_frames(Attr::Data, &[3, 1]).unwrap();
        assert_eq!(frames.shape(), &[2, 3, 3]);
        assert!(value.select_frames(Attr::Data, &[4]).is_err());

        let ss = Array2::from_elem((1, 2), 2usize);
        let fs = Array2::from_shape_vec((1, 2), vec![0usize, 2]).unwrap();
        match value.select_pixels(Attr::Data, &ss, &fs).unwrap() {
            Value::Counts(out) => {
                assert_eq!(out.dim(), (4, 1, 2));
                assert_eq!(out[[1, 0, 1]], 122);
            }
            other => panic!("unexpected value {other:?}"),
        }
    }
}
