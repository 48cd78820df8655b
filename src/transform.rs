/*!
# Frame transforms

Transforms remap the detector index grids `(ss_idxs, fs_idxs)` of a frame:
cropping, downscaling and mirroring, or any ordered composition of them.
The same remap is applied to every 2D or 3D attribute of a [`STData`](crate::STData)
container, so that all consumers of the detector coordinates stay consistent.

Every transform has a canonical state ([`TransformState`]), used for structural
equality, serialization and reconstruction.
*/

use std::{fmt, ops::Index};

use ndarray::{s, Array, Array2, ArrayBase, ArrayView2, Data, Dimension, IxDyn};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("axis must equal to 0 or 1, got {0}")]
    Axis(usize),
    #[error("downscaling ratio must be a positive integer")]
    Scale,
    #[error("invalid region of interest: {0:?}")]
    Roi([usize; 4]),
    #[error("two or more transforms are needed to compose, got {0}")]
    Compose(usize),
    #[error("index grids have different shapes: {0:?} and {1:?}")]
    Grids(Vec<usize>, Vec<usize>),
    #[error("a frame must have at least 2 dimensions, got {0}")]
    Rank(usize),
    #[error("failed to assemble the transformed frame")]
    Shape(#[from] ndarray::ShapeError),
}
type Result<T> = std::result::Result<T, TransformError>;

/// Identity index grids `(ss_idxs, fs_idxs)` of a frame of the given shape
pub fn indices((rows, cols): (usize, usize)) -> (Array2<usize>, Array2<usize>) {
    (
        Array2::from_shape_fn((rows, cols), |(i, _)| i),
        Array2::from_shape_fn((rows, cols), |(_, j)| j),
    )
}

/// Crops a frame to a region of interest `[y_min, y_max, x_min, x_max]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crop {
    roi: [usize; 4],
}
impl Crop {
    pub fn new(roi: [usize; 4]) -> Result<Self> {
        if roi[0] > roi[1] || roi[2] > roi[3] {
            return Err(TransformError::Roi(roi));
        }
        Ok(Self { roi })
    }
    pub fn roi(&self) -> [usize; 4] {
        self.roi
    }
    fn index_array<A: Clone>(
        &self,
        ss_idxs: ArrayView2<A>,
        fs_idxs: ArrayView2<A>,
    ) -> (Array2<A>, Array2<A>) {
        let (rows, cols) = ss_idxs.dim();
        let [y0, y1, x0, x1] = self.roi;
        let (y0, y1) = (y0.min(rows), y1.min(rows));
        let (x0, x1) = (x0.min(cols), x1.min(cols));
        // a single row (or column) frame is cropped along its only long axis
        if rows == 1 {
            return (
                ss_idxs.slice(s![.., x0..x1]).to_owned(),
                fs_idxs.slice(s![.., x0..x1]).to_owned(),
            );
        }
        if cols == 1 {
            return (
                ss_idxs.slice(s![y0..y1, ..]).to_owned(),
                fs_idxs.slice(s![y0..y1, ..]).to_owned(),
            );
        }
        (
            ss_idxs.slice(s![y0..y1, x0..x1]).to_owned(),
            fs_idxs.slice(s![y0..y1, x0..x1]).to_owned(),
        )
    }
}

/// Downscales a frame by an integer ratio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downscale {
    scale: usize,
}
impl Downscale {
    pub fn new(scale: usize) -> Result<Self> {
        if scale == 0 {
            return Err(TransformError::Scale);
        }
        Ok(Self { scale })
    }
    pub fn scale(&self) -> usize {
        self.scale
    }
    fn index_array<A: Clone>(
        &self,
        ss_idxs: ArrayView2<A>,
        fs_idxs: ArrayView2<A>,
    ) -> (Array2<A>, Array2<A>) {
        let step = self.scale as isize;
        (
            ss_idxs.slice(s![..;step, ..;step]).to_owned(),
            fs_idxs.slice(s![..;step, ..;step]).to_owned(),
        )
    }
}

/// Mirrors a frame around an axis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mirror {
    axis: usize,
}
impl Mirror {
    pub fn new(axis: usize) -> Result<Self> {
        match axis {
            0 | 1 => Ok(Self { axis }),
            _ => Err(TransformError::Axis(axis)),
        }
    }
    pub fn axis(&self) -> usize {
        self.axis
    }
    fn index_array<A: Clone>(
        &self,
        ss_idxs: ArrayView2<A>,
        fs_idxs: ArrayView2<A>,
    ) -> Result<(Array2<A>, Array2<A>)> {
        match self.axis {
            0 => Ok((
                ss_idxs.slice(s![..;-1, ..]).to_owned(),
                fs_idxs.slice(s![..;-1, ..]).to_owned(),
            )),
            1 => Ok((
                ss_idxs.slice(s![.., ..;-1]).to_owned(),
                fs_idxs.slice(s![.., ..;-1]).to_owned(),
            )),
            axis => Err(TransformError::Axis(axis)),
        }
    }
}

/// Ordered chain of two or more transforms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compose {
    transforms: Vec<Transform>,
}
impl Compose {
    /// Composes the transforms, each one being rebuilt from its own state
    pub fn new(transforms: Vec<Transform>) -> Result<Self> {
        let transforms = transforms
            .into_iter()
            .map(|transform| Transform::try_from(transform.state()))
            .collect::<Result<Vec<_>>>()?;
        if transforms.len() < 2 {
            return Err(TransformError::Compose(transforms.len()));
        }
        Ok(Self { transforms })
    }
    pub fn len(&self) -> usize {
        self.transforms.len()
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Transform> {
        self.transforms.iter()
    }
}
impl Index<usize> for Compose {
    type Output = Transform;

    fn index(&self, index: usize) -> &Self::Output {
        &self.transforms[index]
    }
}
impl<'a> IntoIterator for &'a Compose {
    type Item = &'a Transform;
    type IntoIter = std::slice::Iter<'a, Transform>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Canonical state of a transform: the transform name and its parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformState {
    Crop { roi: [usize; 4] },
    Downscale { scale: usize },
    Mirror { axis: usize },
    Compose { transforms: Vec<TransformState> },
}

/// Frame transform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TransformState", into = "TransformState")]
pub enum Transform {
    Crop(Crop),
    Downscale(Downscale),
    Mirror(Mirror),
    Compose(Compose),
}
impl Transform {
    pub fn crop(roi: [usize; 4]) -> Result<Self> {
        Crop::new(roi).map(Transform::Crop)
    }
    pub fn downscale(scale: usize) -> Result<Self> {
        Downscale::new(scale).map(Transform::Downscale)
    }
    pub fn mirror(axis: usize) -> Result<Self> {
        Mirror::new(axis).map(Transform::Mirror)
    }
    pub fn compose(transforms: Vec<Transform>) -> Result<Self> {
        Compose::new(transforms).map(Transform::Compose)
    }
    /// Returns the transform state
    pub fn state(&self) -> TransformState {
        match self {
            Transform::Crop(crop) => TransformState::Crop { roi: crop.roi },
            Transform::Downscale(downscale) => TransformState::Downscale {
                scale: downscale.scale,
            },
            Transform::Mirror(mirror) => TransformState::Mirror { axis: mirror.axis },
            Transform::Compose(compose) => TransformState::Compose {
                transforms: compose.iter().map(Transform::state).collect(),
            },
        }
    }
    /// Filters the indices of a frame `(ss_idxs, fs_idxs)` according to the transform
    pub fn index_array<A: Clone>(
        &self,
        ss_idxs: ArrayView2<A>,
        fs_idxs: ArrayView2<A>,
    ) -> Result<(Array2<A>, Array2<A>)> {
        if ss_idxs.shape() != fs_idxs.shape() {
            return Err(TransformError::Grids(
                ss_idxs.shape().to_vec(),
                fs_idxs.shape().to_vec(),
            ));
        }
        match self {
            Transform::Crop(crop) => Ok(crop.index_array(ss_idxs, fs_idxs)),
            Transform::Downscale(downscale) => Ok(downscale.index_array(ss_idxs, fs_idxs)),
            Transform::Mirror(mirror) => mirror.index_array(ss_idxs, fs_idxs),
            Transform::Compose(compose) => {
                let mut grids = (ss_idxs.to_owned(), fs_idxs.to_owned());
                for transform in compose {
                    grids = transform.index_array(grids.0.view(), grids.1.view())?;
                }
                Ok(grids)
            }
        }
    }
    /// Returns the transformed array
    ///
    /// The transform applies to the two trailing axes, any leading axis is kept
    pub fn forward<A, S, D>(&self, inp: &ArrayBase<S, D>) -> Result<Array<A, D>>
    where
        A: Clone,
        S: Data<Elem = A>,
        D: Dimension,
    {
        let shape = inp.shape();
        let ndim = shape.len();
        if ndim < 2 {
            return Err(TransformError::Rank(ndim));
        }
        let (rows, cols) = (shape[ndim - 2], shape[ndim - 1]);
        let (ss_idxs, fs_idxs) = indices((rows, cols));
        let (ss_idxs, fs_idxs) = self.index_array(ss_idxs.view(), fs_idxs.view())?;

        let n_lead: usize = shape[..ndim - 2].iter().product();
        let flat: Vec<&A> = inp.iter().collect();
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
        Ok(Array::from_shape_vec(IxDyn(&out_shape), values)?.into_dimensionality::<D>()?)
    }
}
impl TryFrom<TransformState> for Transform {
    type Error = TransformError;

    fn try_from(state: TransformState) -> Result<Self> {
        match state {
            TransformState::Crop { roi } => Transform::crop(roi),
            TransformState::Downscale { scale } => Transform::downscale(scale),
            TransformState::Mirror { axis } => Transform::mirror(axis),
            TransformState::Compose { transforms } => Transform::compose(
                transforms
                    .into_iter()
                    .map(Transform::try_from)
                    .collect::<Result<Vec<_>>>()?,
            ),
        }
    }
}
impl From<Transform> for TransformState {
    fn from(transform: Transform) -> Self {
        transform.state()
    }
}
impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Axis};

    fn frame(rows: usize, cols: usize) -> Array2<usize> {
        Array2::from_shape_fn((rows, cols), |(i, j)| 100 * i + j)
    }

    fn fancy_index(frame: &Array2<usize>, grids: &(Array2<usize>, Array2<usize>)) -> Array2<usize> {
        Array2::from_shape_fn(grids.0.dim(), |(i, j)| {
            frame[[grids.0[[i, j]], grids.1[[i, j]]]]
        })
    }

    #[test]
    fn index_array_matches_forward() {
        let transforms = vec![
            Transform::crop([1, 4, 2, 6]).unwrap(),
            Transform::downscale(2).unwrap(),
            Transform::mirror(0).unwrap(),
            Transform::mirror(1).unwrap(),
            Transform::compose(vec![
                Transform::crop([0, 5, 1, 7]).unwrap(),
                Transform::mirror(1).unwrap(),
                Transform::downscale(2).unwrap(),
            ])
            .unwrap(),
        ];
        let inp = frame(6, 8);
        for transform in transforms {
            let (ss, fs) = indices(inp.dim());
            let grids = transform.index_array(ss.view(), fs.view()).unwrap();
            assert_eq!(
                fancy_index(&inp, &grids),
                transform.forward(&inp).unwrap(),
                "{}",
                transform
            );
        }
    }

    #[test]
    fn crop() {
        let inp = frame(6, 8);
        let out = Transform::crop([1, 4, 2, 6]).unwrap().forward(&inp).unwrap();
        assert_eq!(out, inp.slice(s![1..4, 2..6]));
    }

    #[test]
    fn crop_clamps_to_frame() {
        let inp = frame(4, 4);
        let out = Transform::crop([2, 10, 0, 10]).unwrap().forward(&inp).unwrap();
        assert_eq!(out, inp.slice(s![2.., ..]));
    }

    #[test]
    fn crop_single_row_and_column() {
        let crop = Transform::crop([1, 2, 3, 6]).unwrap();
        let row = frame(1, 8);
        assert_eq!(crop.forward(&row).unwrap(), row.slice(s![.., 3..6]));
        let column = frame(8, 1);
        assert_eq!(crop.forward(&column).unwrap(), column.slice(s![1..2, ..]));
    }

    #[test]
    fn invalid_parameters() {
        assert!(matches!(
            Transform::crop([4, 1, 0, 2]),
            Err(TransformError::Roi(_))
        ));
        assert!(matches!(Transform::downscale(0), Err(TransformError::Scale)));
        assert!(matches!(Transform::mirror(2), Err(TransformError::Axis(2))));
    }

    #[test]
    fn downscale() {
        let inp = frame(5, 7);
        let out = Transform::downscale(3).unwrap().forward(&inp).unwrap();
        assert_eq!(out.dim(), (2, 3));
        assert_eq!(out, inp.slice(s![..;3, ..;3]));
    }

    #[test]
    fn mirror() {
        let inp = frame(3, 4);
        let out = Transform::mirror(0).unwrap().forward(&inp).unwrap();
        assert_eq!(out.row(0), inp.row(2));
        let out = Transform::mirror(1).unwrap().forward(&inp).unwrap();
        assert_eq!(out.column(0), inp.column(3));
    }

    #[test]
    fn compose_needs_two_transforms() {
        assert!(matches!(
            Transform::compose(vec![Transform::mirror(0).unwrap()]),
            Err(TransformError::Compose(1))
        ));
        assert!(matches!(
            Transform::compose(vec![]),
            Err(TransformError::Compose(0))
        ));
    }

    #[test]
    fn compose_is_sequential() {
        let crop = Transform::crop([1, 5, 0, 6]).unwrap();
        let mirror = Transform::mirror(1).unwrap();
        let compose = Transform::compose(vec![crop.clone(), mirror.clone()]).unwrap();
        let inp = frame(6, 8);
        let manual = mirror.forward(&crop.forward(&inp).unwrap()).unwrap();
        assert_eq!(compose.forward(&inp).unwrap(), manual);
        if let Transform::Compose(compose) = &compose {
            assert_eq!(compose.len(), 2);
            assert_eq!(compose[0], crop);
            assert_eq!(compose[1], mirror);
        }
    }

    #[test]
    fn forward_keeps_leading_axes() {
        let stack = Array3::from_shape_fn((3, 4, 5), |(k, i, j)| 1000 * k + 10 * i + j);
        let transform = Transform::crop([1, 3, 0, 2]).unwrap();
        let out = transform.forward(&stack).unwrap();
        assert_eq!(out.dim(), (3, 2, 2));
        for (k, frame) in stack.axis_iter(Axis(0)).enumerate() {
            assert_eq!(out.index_axis(Axis(0), k), transform.forward(&frame).unwrap());
        }
    }

    #[test]
    fn float_grids() {
        let ss = Array2::from_shape_fn((4, 4), |(i, _)| i as f64);
        let fs = Array2::from_shape_fn((4, 4), |(_, j)| j as f64);
        let (ss, fs) = Transform::mirror(0)
            .unwrap()
            .index_array(ss.view(), fs.view())
            .unwrap();
        assert_eq!(ss[[0, 0]], 3.0);
        assert_eq!(fs[[0, 3]], 3.0);
    }

    #[test]
    fn mismatched_grids() {
        let (ss, _) = indices((3, 3));
        let (_, fs) = indices((3, 4));
        assert!(matches!(
            Transform::downscale(1)
                .unwrap()
                .index_array(ss.view(), fs.view()),
            Err(TransformError::Grids(..))
        ));
    }

    #[test]
    fn state_round_trip() {
        let transform = Transform::compose(vec![
            Transform::crop([0, 10, 2, 8]).unwrap(),
            Transform::downscale(2).unwrap(),
        ])
        .unwrap();
        let bytes = serde_pickle::to_vec(&transform, Default::default()).unwrap();
        let restored: Transform = serde_pickle::from_slice(&bytes, Default::default()).unwrap();
        assert_eq!(restored, transform);
        assert_eq!(Transform::try_from(transform.state()).unwrap(), transform);
    }

    #[test]
    fn invalid_state_is_rejected() {
        let bytes = serde_pickle::to_vec(
            &TransformState::Mirror { axis: 3 },
            Default::default(),
        )
        .unwrap();
        assert!(serde_pickle::from_slice::<Transform>(&bytes, Default::default()).is_err());
    }
}
