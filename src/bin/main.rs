use std::{sync::Arc, time::Instant};

use itertools::{Itertools, MinMaxResult::MinMax};
use ndarray::{Array2, Array3, Axis, Ix2};
use pxst::{Attr, MaskConfig, MemoryStore, STData};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "pxst", about = "X-ray speckle tracking data pipeline")]
struct Opt {
    /// Number of frames
    #[structopt(short, long, default_value = "20")]
    frames: usize,
    /// Frame height [pixels]
    #[structopt(long, default_value = "32")]
    rows: usize,
    /// Frame width [pixels]
    #[structopt(long, default_value = "64")]
    cols: usize,
    /// Defocus distance [m]
    #[structopt(short, long, default_value = "1e-4")]
    defocus: f64,
    /// Bad pixels upper percentile
    #[structopt(long, default_value = "99.99")]
    pmax: f64,
    /// Number of loading processes
    #[structopt(short, long, default_value = "4")]
    processes: usize,
    /// Number of eigen flat-fields to display
    #[structopt(long, default_value = "5")]
    eigen: usize,
    /// Display progress bars
    #[structopt(short, long)]
    verbose: bool,
}

/// Synthetic speckle pattern scanned across a detector
///
/// Frame `k` sees the pattern shifted by `k` steps of the horizontal translation,
/// under a slowly varying illumination. One pixel is hot and the middle frame is dead.
fn synthetic(opt: &Opt) -> anyhow::Result<MemoryStore> {
    let (n, rows, cols) = (opt.frames, opt.rows, opt.cols);
    let step = 2e-7;
    let pixel_size = 5.5e-5;
    let distance = 2.0;
    let shift = step * distance / opt.defocus / pixel_size;
    let speckle = |y: f64, x: f64| {
        1.0 + 0.3 * (0.9 * y + 0.4 * x).sin() * (0.5 * y - 1.3 * x).cos()
            + 0.2 * (2.1 * x + 0.3 * y).sin()
    };
    let mut data = Array3::from_shape_fn((n, rows, cols), |(k, i, j)| {
        let illumination = 1000.0 * (1.0 + 0.05 * (0.3 * k as f64).sin());
        (illumination * speckle(i as f64, j as f64 + shift * k as f64)).round() as u32
    });
    if rows * cols > 0 {
        data.index_axis_mut(Axis(1), rows / 2)
            .column_mut(cols / 2)
            .fill(u32::MAX / 2);
    }
    if n > 2 {
        data.index_axis_mut(Axis(0), n / 2).fill(0);
    }
    let basis_vectors = Array3::from_shape_fn((n, 2, 3), |(_, a, b)| match (a, b) {
        (0, 1) | (1, 0) => pixel_size,
        _ => 0.0,
    });
    let translations =
        Array2::from_shape_fn((n, 3), |(k, c)| if c == 0 { step * k as f64 } else { 0.0 });

    Ok(MemoryStore::default()
        .with(Attr::Data, data)?
        .with(Attr::BasisVectors, basis_vectors)?
        .with(Attr::Translations, translations)?
        .with(Attr::Frames, (0..n).collect::<Vec<_>>())?
        .with(Attr::Distance, distance)?
        .with(Attr::Wavelength, 7.29e-11)?
        .with(Attr::XPixelSize, pixel_size)?
        .with(Attr::YPixelSize, pixel_size)?)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let now = Instant::now();
    let storage = Arc::new(synthetic(&opt)?);
    let st = STData::new(storage).load(None, None, opt.processes, opt.verbose)?;
    println!("Data container {}: {:?}", st.id(), st.shape());
    let missing = st.missing_required();
    if !missing.is_empty() {
        anyhow::bail!("missing required attributes: {missing:?}");
    }

    let st = st
        .update_mask(&MaskConfig::default().percentiles(0.0, opt.pmax))?
        .mask_frames(None)?;
    let bad_pixels = st.mask()?.iter().filter(|&&valid| !valid).count();
    println!(" - bad pixels: {bad_pixels}");
    println!(
        " - good frames: {}/{}",
        st.good_frames()?.len(),
        st.shape()[0]
    );

    let pca = st.get_pca()?;
    let fractions: Vec<String> = pca
        .eig_vals
        .iter()
        .take(opt.eigen)
        .map(|fraction| format!("{:.2}%", fraction * 100.0))
        .collect();
    println!(" - eigen flat-fields variance: {}", fractions.join(", "));

    let st = st.update_defocus(opt.defocus, None)?;
    let pixel_translations = st.float::<Ix2>(Attr::PixelTranslations)?;
    for (axis, name) in ["vertical", "horizontal"].into_iter().enumerate() {
        if let MinMax(min, max) = pixel_translations.column(axis).iter().minmax() {
            println!(" - {name} pixel translations: [{min:.3}, {max:.3}]");
        }
    }
    log::info!("Pipeline completed in {}ms", now.elapsed().as_millis());

    Ok(())
}
