//! Per-hemisphere mosaics of task outputs, one per polarization or mask layer

use crate::types::{Hemisphere, LogContext, MosaicLayer, MosaicResult, SarError, SarResult};
use serde::{Deserialize, Serialize};
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Mosaic parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MosaicParams {
    /// CRS of the merged raster
    pub target_crs: String,
    /// Pixel value excluded from blending and written where no input covers
    pub nodata: f64,
    /// GDAL driver of the merged raster
    pub output_format: String,
    /// Extension of engine band files
    pub band_extension: String,
    /// Ignore task outputs without exactly one matching band file
    pub skip_ambiguous_outputs: bool,
}

impl Default for MosaicParams {
    fn default() -> Self {
        Self {
            target_crs: "EPSG:4326".to_string(),
            nodata: 0.0,
            output_format: "GTiff".to_string(),
            band_extension: "img".to_string(),
            skip_ambiguous_outputs: true,
        }
    }
}

/// Merges several rasters into one
pub trait RasterMerger: Send + Sync {
    fn merge(&self, inputs: &[PathBuf], output: &Path, params: &MosaicParams) -> SarResult<()>;
}

/// Merge through GDALWarp with source and destination nodata
#[derive(Debug, Clone, Copy, Default)]
pub struct GdalWarpMerger;

impl GdalWarpMerger {
    fn warp_args(params: &MosaicParams) -> Vec<String> {
        let nodata = format!("{}", params.nodata);
        vec![
            "-of".to_string(),
            params.output_format.clone(),
            "-srcnodata".to_string(),
            nodata.clone(),
            "-dstnodata".to_string(),
            nodata,
            "-t_srs".to_string(),
            params.target_crs.clone(),
            "-overwrite".to_string(),
        ]
    }
}

impl RasterMerger for GdalWarpMerger {
    fn merge(&self, inputs: &[PathBuf], output: &Path, params: &MosaicParams) -> SarResult<()> {
        if inputs.is_empty() {
            return Err(SarError::MosaicAssembly("No rasters to merge".to_string()));
        }

        // datasets must stay open until the warp is done
        let datasets = inputs
            .iter()
            .map(gdal::Dataset::open)
            .collect::<Result<Vec<_>, _>>()?;

        let to_cstring = |s: &str| {
            CString::new(s).map_err(|e| SarError::MosaicAssembly(format!("Invalid argument '{}': {}", s, e)))
        };
        let args = Self::warp_args(params)
            .iter()
            .map(|a| to_cstring(a))
            .collect::<SarResult<Vec<_>>>()?;
        let destination = to_cstring(&output.to_string_lossy())?;

        let mut argv: Vec<*mut c_char> = args.iter().map(|a| a.as_ptr() as *mut c_char).collect();
        argv.push(std::ptr::null_mut());

        unsafe {
            let options = gdal_sys::GDALWarpAppOptionsNew(argv.as_mut_ptr(), std::ptr::null_mut());
            if options.is_null() {
                return Err(SarError::MosaicAssembly(format!(
                    "Invalid warp options: {}",
                    last_gdal_error()
                )));
            }

            let mut handles: Vec<gdal_sys::GDALDatasetH> = datasets.iter().map(|d| d.c_dataset()).collect();
            let mut usage_error: c_int = 0;
            let merged = gdal_sys::GDALWarp(
                destination.as_ptr(),
                std::ptr::null_mut(),
                handles.len() as c_int,
                handles.as_mut_ptr(),
                options,
                &mut usage_error,
            );
            gdal_sys::GDALWarpAppOptionsFree(options);

            if merged.is_null() {
                return Err(SarError::MosaicAssembly(format!(
                    "GDALWarp failed for {}: {}",
                    output.display(),
                    last_gdal_error()
                )));
            }
            gdal_sys::GDALClose(merged);
        }
        Ok(())
    }
}

fn last_gdal_error() -> String {
    unsafe {
        let msg = gdal_sys::CPLGetLastErrorMsg();
        if msg.is_null() {
            return "unknown error".to_string();
        }
        CStr::from_ptr(msg).to_string_lossy().into_owned()
    }
}

/// Band files below `root` whose name contains the layer's band token
/// (the polarization code for backscatter) and ends in `extension`, searched
/// recursively and sorted
pub fn find_band_files(
    root: &Path,
    layer: impl Into<MosaicLayer>,
    extension: &str,
) -> SarResult<Vec<PathBuf>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let code = layer.into().band_token();
    let extension = extension.trim_start_matches('.').to_lowercase();

    let mut found = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            SarError::MosaicAssembly(format!("Cannot search {}: {}", root.display(), e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_lowercase();
        let matches_ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase() == extension)
            .unwrap_or(false);
        if matches_ext && name.contains(code) {
            found.push(path.to_path_buf());
        }
    }
    found.sort();
    Ok(found)
}

/// Deterministic mosaic location
pub fn mosaic_path(
    out_dir: &Path,
    scene: &str,
    hemisphere: Hemisphere,
    layer: impl Into<MosaicLayer>,
) -> PathBuf {
    out_dir.join(format!("{}_{}_{}.tif", scene, hemisphere, layer.into()))
}

/// Locates task band files and merges them per hemisphere and layer
pub struct MosaicAssembler<'a> {
    params: MosaicParams,
    merger: &'a dyn RasterMerger,
    ctx: LogContext,
}

impl<'a> MosaicAssembler<'a> {
    pub fn new(params: MosaicParams, merger: &'a dyn RasterMerger, ctx: LogContext) -> Self {
        Self { params, merger, ctx }
    }

    /// The single band file of each task output; ambiguous outputs are
    /// skipped or rejected depending on `skip_ambiguous_outputs`
    pub fn select_inputs(
        &self,
        task_outputs: &[PathBuf],
        layer: impl Into<MosaicLayer>,
    ) -> SarResult<Vec<PathBuf>> {
        let layer = layer.into();
        let mut inputs = Vec::new();
        for output in task_outputs {
            let mut matches = find_band_files(output, layer, &self.params.band_extension)?;
            // SNAP writers may append .data to the requested name
            let mut data_dir = output.clone().into_os_string();
            data_dir.push(".data");
            matches.extend(find_band_files(Path::new(&data_dir), layer, &self.params.band_extension)?);

            if matches.len() == 1 {
                inputs.extend(matches);
                continue;
            }
            let message = format!(
                "{} {} band files for {} in {}",
                matches.len(),
                self.params.band_extension,
                layer,
                output.display()
            );
            if self.params.skip_ambiguous_outputs {
                log::warn!("{} Skipping task output: {}", self.ctx, message);
            } else {
                return Err(SarError::MosaicAssembly(message));
            }
        }
        Ok(inputs)
    }

    /// Merge the task outputs of one hemisphere; `None` when nothing contributes
    pub fn assemble(
        &self,
        scene: &str,
        hemisphere: Hemisphere,
        layer: impl Into<MosaicLayer>,
        task_outputs: &[PathBuf],
        out_dir: &Path,
    ) -> SarResult<Option<MosaicResult>> {
        let layer = layer.into();
        let inputs = self.select_inputs(task_outputs, layer)?;
        if inputs.is_empty() {
            log::warn!(
                "{} No {} {} inputs, no mosaic produced",
                self.ctx,
                hemisphere,
                layer
            );
            return Ok(None);
        }

        std::fs::create_dir_all(out_dir)?;
        let path = mosaic_path(out_dir, scene, hemisphere, layer);
        log::info!(
            "{} Merging {} {} {} rasters into {}",
            self.ctx,
            inputs.len(),
            hemisphere,
            layer,
            path.display()
        );
        self.merger.merge(&inputs, &path, &self.params)?;

        Ok(Some(MosaicResult {
            hemisphere,
            layer,
            path,
            inputs: inputs.len(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Polarization;

    #[test]
    fn test_find_band_files_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("Gamma0_VV_db.img"), b"").unwrap();
        std::fs::write(nested.join("Gamma0_VV_db.hdr"), b"").unwrap();
        std::fs::write(dir.path().join("Gamma0_VH_db.img"), b"").unwrap();

        let vv = find_band_files(dir.path(), Polarization::VV, "img").unwrap();
        assert_eq!(vv, vec![nested.join("Gamma0_VV_db.img")]);
        let vh = find_band_files(dir.path(), Polarization::VH, ".img").unwrap();
        assert_eq!(vh.len(), 1);
        assert!(find_band_files(&dir.path().join("missing"), Polarization::VV, "img").unwrap().is_empty());
    }

    #[test]
    fn test_find_mask_band_files() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("x_lsm.data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("layover_shadow_mask.img"), b"").unwrap();
        std::fs::write(data.join("Gamma0_VV_db.img"), b"").unwrap();

        let mask = find_band_files(dir.path(), MosaicLayer::LayoverShadowMask, "img").unwrap();
        assert_eq!(mask, vec![data.join("layover_shadow_mask.img")]);
        assert_eq!(
            mosaic_path(Path::new("/out"), "scene", Hemisphere::East, MosaicLayer::LayoverShadowMask),
            PathBuf::from("/out/scene_east_layover_shadow_mask.tif")
        );
    }

    #[test]
    fn test_mosaic_path() {
        assert_eq!(
            mosaic_path(Path::new("/out"), "S1A_IW_170328T063214_bnr_orb_cal_ml_tf_tc_db", Hemisphere::West, Polarization::VV),
            PathBuf::from("/out/S1A_IW_170328T063214_bnr_orb_cal_ml_tf_tc_db_west_Gamma0_VV_db.tif")
        );
    }

    #[test]
    fn test_warp_args() {
        let args = GdalWarpMerger::warp_args(&MosaicParams::default());
        assert_eq!(
            args,
            vec!["-of", "GTiff", "-srcnodata", "0", "-dstnodata", "0", "-t_srs", "EPSG:4326", "-overwrite"]
        );
    }
}
