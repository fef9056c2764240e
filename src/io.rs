use crate::data_container::SpectrumImage;
use crate::error::IoError;
use crate::operators::operator::AnalysisOutput;
use ndarray::{Array, Array2, Array3, ArrayD, Dimension, Ix1, Ix2, Ix3, OwnedRepr};
use ndarray_npy::{read_npy, write_npy, NpzReader, ReadNpyError, ReadNpzError, WritableElement};
use std::fs::File;
use std::path::{Path, PathBuf};

fn path_string(path: &Path) -> String {
    path.display().to_string()
}

fn read_npy_cube(path: &Path) -> Result<ArrayD<f32>, IoError> {
    let read_error = |source| IoError::Read {
        path: path_string(path),
        source,
    };
    match read_npy::<_, ArrayD<f32>>(path) {
        Ok(array) => Ok(array),
        // double precision cubes are converted on load
        Err(ReadNpyError::WrongDescriptor(_)) => read_npy::<_, ArrayD<f64>>(path)
            .map(|array| array.mapv(|v| v as f32))
            .map_err(read_error),
        Err(err) => Err(read_error(err)),
    }
}

fn read_npz_cube(path: &Path) -> Result<ArrayD<f32>, IoError> {
    let archive_error = |source| IoError::ReadArchive {
        path: path_string(path),
        source,
    };
    let file = File::open(path).map_err(|err| IoError::Read {
        path: path_string(path),
        source: ReadNpyError::from(err),
    })?;
    let mut npz = NpzReader::new(file).map_err(archive_error)?;
    match npz.by_index::<OwnedRepr<f32>, _>(0) {
        Ok(array) => Ok(array),
        Err(ReadNpzError::Npy(ReadNpyError::WrongDescriptor(_))) => npz
            .by_index::<OwnedRepr<f64>, _>(0)
            .map(|array| array.mapv(|v| v as f32))
            .map_err(archive_error),
        Err(err) => Err(archive_error(err)),
    }
}

/// Opens a spectrum image from a `.npy` file or the first array of a `.npz` archive.
///
/// One-dimensional arrays are single spectra, two-dimensional arrays are line scans
/// `(positions, channels)` and three-dimensional arrays are maps `(x, y, channels)`.
pub fn open_cube(path: &Path) -> Result<SpectrumImage, IoError> {
    let array = match path.extension().and_then(|ext| ext.to_str()) {
        Some("npy") => read_npy_cube(path)?,
        Some("npz") => read_npz_cube(path)?,
        _ => return Err(IoError::UnsupportedFile(path_string(path))),
    };
    let ndim = array.ndim();
    let unsupported = || IoError::UnsupportedRank {
        path: path_string(path),
        ndim,
    };
    let image = match ndim {
        1 => SpectrumImage::from_point(
            array
                .into_dimensionality::<Ix1>()
                .map_err(|_| unsupported())?,
        ),
        2 => SpectrumImage::from_line(
            array
                .into_dimensionality::<Ix2>()
                .map_err(|_| unsupported())?,
        ),
        3 => SpectrumImage::from_map(
            array
                .into_dimensionality::<Ix3>()
                .map_err(|_| unsupported())?,
        ),
        _ => return Err(unsupported()),
    };
    Ok(image)
}

fn save_array<T, D>(path: &Path, array: &Array<T, D>) -> Result<PathBuf, IoError>
where
    T: WritableElement,
    D: Dimension,
{
    write_npy(path, array).map_err(|source| IoError::Write {
        path: path_string(path),
        source,
    })?;
    log::info!("saved {}", path.display());
    Ok(path.to_path_buf())
}

/// Writes every array of `output` to `directory` as `<stem>_<name>.npy`.
///
/// # Returns
/// The paths of the written files.
pub fn save_output(
    output: &AnalysisOutput,
    directory: &Path,
    stem: &str,
) -> Result<Vec<PathBuf>, IoError> {
    let file = |name: &str| directory.join(format!("{stem}_{name}.npy"));
    let mut written = vec![];
    match output {
        AnalysisOutput::Subtracted { cube, fit } => {
            written.push(save_array(&file("subtracted"), &cube.data)?);
            written.push(save_array(&file("coefficients"), &fit.coefficients)?);
            written.push(save_array(&file("residual"), &fit.residual)?);
        }
        AnalysisOutput::Integrated { map, scale } => {
            written.push(save_array(&file("integrated"), map)?);
            if let Some(scale) = scale {
                written.push(save_array(&file("scale"), scale)?);
            }
        }
        AnalysisOutput::HcmIntegrated { map, .. } => {
            written.push(save_array(&file("hcm"), map)?);
        }
        AnalysisOutput::Components(result) => {
            let mut maps = Array3::<f64>::zeros((
                result.component_count(),
                result.width,
                result.height,
            ));
            for (component, mut slot) in maps.outer_iter_mut().enumerate() {
                if let Ok(map) = result.component_map(component) {
                    slot.assign(&map);
                }
            }
            written.push(save_array(&file("component_maps"), &maps)?);
            let mut spectra =
                Array2::<f64>::zeros((result.component_count(), result.spectra.nrows()));
            for (component, mut slot) in spectra.outer_iter_mut().enumerate() {
                if let Ok(spectrum) = result.component_spectrum(component) {
                    slot.assign(&spectrum);
                }
            }
            written.push(save_array(&file("component_spectra"), &spectra)?);
            let series = result.scree_series();
            let scree = Array2::from_shape_fn((series.len(), 2), |(i, j)| series[i][j]);
            written.push(save_array(&file("scree"), &scree)?);
        }
        AnalysisOutput::Reconstructed { cube, .. } => {
            written.push(save_array(&file("reconstructed"), &cube.data)?);
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_container::CubeRank;
    use ndarray::Array1;

    #[test]
    fn test_open_cube_by_rank() {
        let dir = tempfile::tempdir().unwrap();

        let spectrum_path = dir.path().join("point.npy");
        write_npy(&spectrum_path, &Array1::<f32>::linspace(0.0, 1.0, 8)).unwrap();
        let point = open_cube(&spectrum_path).unwrap();
        assert_eq!(point.rank, CubeRank::Point);
        assert_eq!(point.channel_count(), 8);

        let line_path = dir.path().join("line.npy");
        write_npy(&line_path, &Array2::<f64>::ones((5, 8))).unwrap();
        let line = open_cube(&line_path).unwrap();
        assert_eq!(line.rank, CubeRank::Line);
        assert_eq!(line.data.dim(), (5, 1, 8));

        let map_path = dir.path().join("map.npy");
        write_npy(&map_path, &Array3::<f32>::zeros((3, 4, 8))).unwrap();
        assert_eq!(open_cube(&map_path).unwrap().rank, CubeRank::Map);
    }

    #[test]
    fn test_unsupported_inputs() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            open_cube(&dir.path().join("cube.txt")),
            Err(IoError::UnsupportedFile(_))
        ));

        let path = dir.path().join("hyper.npy");
        write_npy(&path, &ndarray::Array4::<f32>::zeros((1, 2, 3, 4))).unwrap();
        assert!(matches!(
            open_cube(&path),
            Err(IoError::UnsupportedRank { ndim: 4, .. })
        ));
    }

    #[test]
    fn test_save_subtracted_output_includes_fit() {
        let dir = tempfile::tempdir().unwrap();
        let image = SpectrumImage::from_map(Array3::from_elem((2, 3, 10), 4.0f32));
        let x = Array1::from_shape_fn(10, |i| 1.0 + i as f64);
        let fit = crate::fit::fit_image(
            crate::fit::model::FitModel::Constant,
            &image,
            x.view(),
            crate::request::ChannelWindow::new(2, 8),
            [20.0, 80.0],
        );
        let output = AnalysisOutput::Subtracted { cube: image, fit };
        let written = save_output(&output, dir.path(), "run").unwrap();
        assert_eq!(written.len(), 3);
        let residual: Array2<f64> = read_npy(&written[2]).unwrap();
        assert_eq!(residual.dim(), (6, 6));
        assert!(residual.iter().all(|r| r.abs() < 1e-9));
    }

    #[test]
    fn test_save_integrated_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = AnalysisOutput::Integrated {
            map: Array2::from_elem((3, 2), 1.5),
            scale: Some(Array2::ones((3, 2))),
        };
        let written = save_output(&output, dir.path(), "run").unwrap();
        assert_eq!(written.len(), 2);
        let map: Array2<f64> = read_npy(&written[0]).unwrap();
        assert_eq!(map, Array2::from_elem((3, 2), 1.5));
        assert!(written[1].ends_with("run_scale.npy"));
    }
}
