use crate::io::annotation::TiePointGridReader;
use crate::io::manifest::ManifestReader;
use crate::types::{Polarization, SarError, SarResult, SceneMetadata};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::ZipArchive;

const MANIFEST_NAME: &str = "manifest.safe";

/// Working copy of a Sentinel-1 product inside a scene workspace.
///
/// The caller's `.SAFE` directory or zip archive is never modified; annotation
/// writeback only touches the copy.
#[derive(Debug, Clone)]
pub struct SafeProduct {
    root: PathBuf,
    product_name: String,
}

impl SafeProduct {
    /// Open a product. Directories are copied and zip archives extracted
    /// below `workspace/product`.
    pub fn open<P: AsRef<Path>>(path: P, workspace: &Path) -> SarResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SarError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("File not found: {}", path.display()),
            )));
        }

        let root = if path.is_dir() {
            if !path.join(MANIFEST_NAME).is_file() {
                return Err(SarError::InvalidFormat(format!(
                    "No {} in {}",
                    MANIFEST_NAME,
                    path.display()
                )));
            }
            Self::copy_directory(path, workspace)?
        } else {
            Self::extract_archive(path, workspace)?
        };

        if !root.join(MANIFEST_NAME).is_file() {
            return Err(SarError::InvalidFormat(format!(
                "No {} in {}",
                MANIFEST_NAME,
                root.display()
            )));
        }

        let product_name = root
            .file_name()
            .map(|n| n.to_string_lossy().trim_end_matches(".SAFE").to_string())
            .ok_or_else(|| {
                SarError::InvalidFormat(format!("Cannot name product at {}", root.display()))
            })?;

        log::info!("Opened product {} at {}", product_name, root.display());
        Ok(Self { root, product_name })
    }

    fn copy_directory(source: &Path, workspace: &Path) -> SarResult<PathBuf> {
        let name = source.file_name().ok_or_else(|| {
            SarError::InvalidFormat(format!("Cannot name product at {}", source.display()))
        })?;
        let target = workspace.join("product").join(name);
        if target.starts_with(source) {
            return Err(SarError::InvalidFormat(format!(
                "Workspace {} lies inside the product {}",
                workspace.display(),
                source.display()
            )));
        }
        log::info!("Copying {} into {}", source.display(), target.display());

        let mut files = 0usize;
        for entry in WalkDir::new(source).follow_links(true) {
            let entry = entry.map_err(|e| {
                SarError::InvalidFormat(format!("Cannot read product {}: {}", source.display(), e))
            })?;
            let relative = entry.path().strip_prefix(source).map_err(|e| {
                SarError::Processing(format!("Unexpected path {}: {}", entry.path().display(), e))
            })?;
            let destination = target.join(relative);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&destination)?;
            } else {
                std::fs::copy(entry.path(), &destination)?;
                files += 1;
            }
        }
        log::debug!("Copied {} product files", files);
        Ok(target)
    }

    fn extract_archive(zip_path: &Path, workspace: &Path) -> SarResult<PathBuf> {
        log::info!("Extracting {} into {}", zip_path.display(), workspace.display());
        let file = File::open(zip_path)?;
        let mut archive = ZipArchive::new(file)
            .map_err(|e| SarError::InvalidFormat(format!("Failed to open ZIP: {}", e)))?;
        let target = workspace.join("product");
        std::fs::create_dir_all(&target)?;
        archive
            .extract(&target)
            .map_err(|e| SarError::InvalidFormat(format!("Failed to extract ZIP: {}", e)))?;

        if target.join(MANIFEST_NAME).is_file() {
            return Ok(target);
        }
        for entry in std::fs::read_dir(&target)? {
            let entry = entry?;
            if entry.path().is_dir() && entry.path().join(MANIFEST_NAME).is_file() {
                return Ok(entry.path());
            }
        }
        Err(SarError::InvalidFormat(format!(
            "Archive {} contains no SAFE directory",
            zip_path.display()
        )))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_NAME)
    }

    /// Polarizations encoded in the product name (`..._1SDV_...` etc.)
    pub fn polarizations(&self) -> Vec<Polarization> {
        polarizations_from_product_name(&self.product_name)
    }

    /// Annotation file per polarization, from `annotation/s1*-{pol}-*.xml`
    pub fn annotation_files(&self) -> SarResult<BTreeMap<Polarization, PathBuf>> {
        let dir = self.root.join("annotation");
        let mut files = BTreeMap::new();

        for pol in [Polarization::VV, Polarization::VH, Polarization::HV, Polarization::HH] {
            let pattern = Regex::new(&format!(r"^s1.*-{}-.*\.xml$", pol.file_code()))
                .map_err(|e| SarError::Processing(format!("Bad annotation pattern: {}", e)))?;
            let mut matches: Vec<PathBuf> = std::fs::read_dir(&dir)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|p| p.is_file())
                .filter(|p| {
                    p.file_name()
                        .map(|n| pattern.is_match(&n.to_string_lossy()))
                        .unwrap_or(false)
                })
                .collect();
            matches.sort();
            if matches.len() > 1 {
                log::warn!(
                    "{} annotation files for {}; using {}",
                    matches.len(),
                    pol,
                    matches[0].display()
                );
            }
            if let Some(first) = matches.into_iter().next() {
                files.insert(pol, first);
            }
        }

        if files.is_empty() {
            return Err(SarError::InvalidFormat(format!(
                "No annotation files found in {}",
                dir.display()
            )));
        }
        Ok(files)
    }

    /// Scene metadata from the manifest plus the reference annotation.
    ///
    /// Polarizations come from the manifest, then the product name code,
    /// then whichever annotation files exist.
    pub fn read_metadata(&self) -> SarResult<SceneMetadata> {
        let manifest = ManifestReader::read(self.manifest_path())?;
        let annotations = self.annotation_files()?;

        let mut polarizations = manifest.polarizations;
        if polarizations.is_empty() {
            polarizations = self.polarizations();
        }
        if polarizations.is_empty() {
            polarizations = annotations.keys().copied().collect();
        }

        let reference = polarizations
            .iter()
            .find_map(|p| annotations.get(p))
            .or_else(|| annotations.values().next())
            .ok_or_else(|| SarError::InvalidFormat("No reference annotation".to_string()))?;
        let grid = TiePointGridReader::read(reference)?;

        Ok(SceneMetadata {
            product_name: self.product_name.clone(),
            mission: manifest.mission,
            platform: manifest.platform,
            acquisition_mode: manifest.mode,
            start_time: manifest.start_time,
            aoi: manifest.footprint,
            dimensions: grid.dimensions,
            pixel_spacing: grid.pixel_spacing,
            polarizations,
        })
    }
}

/// Map the product-name polarization code to its bands
pub fn polarizations_from_product_name(name: &str) -> Vec<Polarization> {
    let pattern = match Regex::new(r"_\d(S[SD][VH])_") {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    match pattern.captures(name).and_then(|c| c.get(1)).map(|m| m.as_str()) {
        Some("SSV") => vec![Polarization::VV],
        Some("SDV") => vec![Polarization::VH, Polarization::VV],
        Some("SSH") => vec![Polarization::HH],
        Some("SDH") => vec![Polarization::HV, Polarization::HH],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polarizations_from_name() {
        assert_eq!(
            polarizations_from_product_name("S1A_IW_GRDH_1SDV_20170328T063214_20170328T063239_015899_01A37D_9C4E"),
            vec![Polarization::VH, Polarization::VV]
        );
        assert_eq!(
            polarizations_from_product_name("S1B_IW_GRDH_1SSV_20190101T000000_x"),
            vec![Polarization::VV]
        );
        assert_eq!(
            polarizations_from_product_name("S1A_EW_GRDM_1SDH_20190101T000000_x"),
            vec![Polarization::HV, Polarization::HH]
        );
        assert!(polarizations_from_product_name("not-a-product").is_empty());
    }

    #[test]
    fn test_directory_is_copied_into_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("S1A_IW_GRDH_1SSV_20190101T000000_x.SAFE");
        std::fs::create_dir_all(source.join("annotation").join("calibration")).unwrap();
        std::fs::write(source.join(MANIFEST_NAME), "<manifest/>").unwrap();
        std::fs::write(source.join("annotation").join("s1a-iw-grd-vv-001.xml"), "<product/>").unwrap();
        let workspace = dir.path().join("work");

        let product = SafeProduct::open(&source, &workspace).unwrap();
        assert_eq!(product.product_name(), "S1A_IW_GRDH_1SSV_20190101T000000_x");
        assert!(product.root().starts_with(&workspace));
        assert_ne!(product.root(), source.as_path());
        assert!(product.root().join("annotation").join("calibration").is_dir());

        // writes land in the copy only
        let copied = product.root().join("annotation").join("s1a-iw-grd-vv-001.xml");
        std::fs::write(&copied, "<changed/>").unwrap();
        assert_eq!(
            std::fs::read_to_string(source.join("annotation").join("s1a-iw-grd-vv-001.xml")).unwrap(),
            "<product/>"
        );
    }

    #[test]
    fn test_open_rejects_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SafeProduct::open(dir.path().join("nope.zip"), dir.path()).is_err());
        // directory without a manifest
        assert!(matches!(
            SafeProduct::open(dir.path(), dir.path()),
            Err(SarError::InvalidFormat(_))
        ));
    }
}
