/*!
# X-ray speckle tracking data pipeline

Data container and derivations of a speckle tracking wavefront metrology experiment.

The measured frames, the experimental geometry and the derived quantities are held by an
immutable container, [`STData`], loaded from a [`Storage`] backend.
The container derives the inputs of a speckle tracking reference solver ([`SpeckleTracking`]):
 * the bad pixels mask and the whitefields (median or eigen flat-fields),
 * the pixel mapping and the sample translations in pixels,
 * the defocus distance by a sweep over candidates ([`STData::defocus_sweep`]),

and imports the solver results back to fit the lens' aberrations ([`AberrationsFit`]).

```no_run
use std::sync::Arc;
use pxst::{MaskConfig, MemoryStore, STData};

let storage = Arc::new(MemoryStore::default());
let st = STData::new(storage)
    .load(None, None, 4, true)?
    .update_mask(&MaskConfig::default())?
    .mask_frames(None)?
    .update_defocus(1e-4, None)?;
println!("{:?}", st.shape());
# Ok::<(), pxst::Error>(())
```
*/

pub mod data;
pub mod error;
pub mod fit;
pub mod kernels;
pub mod protocol;
pub mod storage;
pub mod sweep;
pub mod tracking;
pub mod transform;

pub use data::{
    ContainerId, DataError, MaskConfig, MaskMethod, MaskUpdate, Patch, Pca, STData,
    WhitefieldMethod,
};
pub use error::{Error, Result};
pub use fit::{AberrationsFit, FitInput, FitOptions, FitResult, Loss};
pub use protocol::{Attr, Kind, Protocol, Selection, Value};
pub use storage::{MemoryStore, SaveMode, Session, Storage};
pub use sweep::{SweepConfig, SweepExtra, SweepResult};
pub use tracking::{Precision, RefMethod, SpeckleTracking, TrackingConfig, TrackingInput};
pub use transform::Transform;
