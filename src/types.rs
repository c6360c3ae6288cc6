use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Polarization modes for Sentinel-1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Polarization {
    VV,
    VH,
    HV,
    HH,
}

impl Polarization {
    /// Lower-case code as used in SAFE file names (`s1a-iw-grd-vv-...`)
    pub fn file_code(&self) -> &'static str {
        match self {
            Polarization::VV => "vv",
            Polarization::VH => "vh",
            Polarization::HV => "hv",
            Polarization::HH => "hh",
        }
    }
}

impl std::fmt::Display for Polarization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Polarization::VV => write!(f, "VV"),
            Polarization::VH => write!(f, "VH"),
            Polarization::HV => write!(f, "HV"),
            Polarization::HH => write!(f, "HH"),
        }
    }
}

impl std::str::FromStr for Polarization {
    type Err = SarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "VV" => Ok(Polarization::VV),
            "VH" => Ok(Polarization::VH),
            "HV" => Ok(Polarization::HV),
            "HH" => Ok(Polarization::HH),
            _ => Err(SarError::InvalidFormat(format!("Invalid polarization: {}", s))),
        }
    }
}

/// Sentinel-1 acquisition mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionMode {
    IW, // Interferometric Wide swath
    EW, // Extra Wide swath
    SM, // StripMap
    WV, // Wave
}

impl std::fmt::Display for AcquisitionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            AcquisitionMode::IW => "IW",
            AcquisitionMode::EW => "EW",
            AcquisitionMode::SM => "SM",
            AcquisitionMode::WV => "WV",
        };
        write!(f, "{}", code)
    }
}

impl std::str::FromStr for AcquisitionMode {
    type Err = SarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "IW" => Ok(AcquisitionMode::IW),
            "EW" => Ok(AcquisitionMode::EW),
            // stripmap beams are annotated S1..S6
            "SM" | "S1" | "S2" | "S3" | "S4" | "S5" | "S6" => Ok(AcquisitionMode::SM),
            "WV" => Ok(AcquisitionMode::WV),
            other => Err(SarError::Parse(format!("Unknown acquisition mode: {}", other))),
        }
    }
}

/// East/west longitude-sign partition used for antemeridian scenes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Hemisphere {
    East,
    West,
}

impl Hemisphere {
    /// Processing order for crossing scenes
    pub const ALL: [Hemisphere; 2] = [Hemisphere::East, Hemisphere::West];

    /// Hemisphere of a longitude; zero counts as east
    pub fn of_longitude(lon: f64) -> Self {
        if lon < 0.0 {
            Hemisphere::West
        } else {
            Hemisphere::East
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Hemisphere::East => "east",
            Hemisphere::West => "west",
        }
    }
}

impl std::fmt::Display for Hemisphere {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Geographic point (degrees)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Geospatial bounding box
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    /// Min/max over a set of corner points
    pub fn from_points(points: &[GeoPoint]) -> SarResult<Self> {
        if points.is_empty() {
            return Err(SarError::Parse("Cannot compute extent of an empty AOI".to_string()));
        }

        let mut bbox = BoundingBox {
            min_lon: f64::INFINITY,
            max_lon: f64::NEG_INFINITY,
            min_lat: f64::INFINITY,
            max_lat: f64::NEG_INFINITY,
        };
        for pt in points {
            bbox.min_lon = bbox.min_lon.min(pt.lon);
            bbox.max_lon = bbox.max_lon.max(pt.lon);
            bbox.min_lat = bbox.min_lat.min(pt.lat);
            bbox.max_lat = bbox.max_lat.max(pt.lat);
        }
        Ok(bbox)
    }

    pub fn lon_span(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    pub fn center(&self) -> GeoPoint {
        GeoPoint {
            lat: (self.min_lat + self.max_lat) / 2.0,
            lon: (self.min_lon + self.max_lon) / 2.0,
        }
    }
}

/// Affine pixel/line to map transform, GDAL coefficient order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Map coordinates of an image position
    pub fn apply(&self, pixel: f64, line: f64) -> (f64, f64) {
        (
            self.top_left_x + pixel * self.pixel_width + line * self.rotation_x,
            self.top_left_y + pixel * self.rotation_y + line * self.pixel_height,
        )
    }
}

/// Image size in samples (columns) and lines (rows)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDimensions {
    pub samples: usize,
    pub lines: usize,
}

/// Image/ground correspondence
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundControlPoint {
    pub pixel: f64,
    pub line: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Geolocation grid point with its auxiliary timing/geometry fields.
///
/// `gcp.x`/`gcp.y` are longitude/latitude when read from an annotation file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TiePoint {
    pub gcp: GroundControlPoint,
    pub azimuth_time: NaiveDateTime,
    pub slant_range_time: f64,
    pub incidence_angle: f64,
    pub elevation_angle: f64,
}

/// Pixel rectangle with inclusive corners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubsetWindow {
    pub x1: usize,
    pub y1: usize,
    pub x2: usize,
    pub y2: usize,
}

impl SubsetWindow {
    /// Build a window, rejecting inverted corners or corners outside the image
    pub fn new(x1: usize, y1: usize, x2: usize, y2: usize, dims: ImageDimensions) -> SarResult<Self> {
        let window = Self { x1, y1, x2, y2 };
        window.validate(dims)?;
        Ok(window)
    }

    pub fn validate(&self, dims: ImageDimensions) -> SarResult<()> {
        if self.x1 > self.x2 || self.y1 > self.y2 {
            return Err(SarError::Processing(format!("Inverted subset window {}", self.region())));
        }
        if self.x2 >= dims.samples || self.y2 >= dims.lines {
            return Err(SarError::Processing(format!(
                "Subset window {} exceeds image {}x{}",
                self.region(),
                dims.samples,
                dims.lines
            )));
        }
        Ok(())
    }

    /// Engine region string `x1,y1,x2,y2`
    pub fn region(&self) -> String {
        format!("{},{},{},{}", self.x1, self.y1, self.x2, self.y2)
    }

    /// Underscore-joined corners, used to namespace task outputs
    pub fn tag(&self) -> String {
        format!("{}_{}_{}_{}", self.x1, self.y1, self.x2, self.y2)
    }
}

/// Elevation model per hemisphere; `None` lets the engine use its default DEM
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DemReferences {
    pub east: Option<PathBuf>,
    pub west: Option<PathBuf>,
}

impl DemReferences {
    pub fn for_hemisphere(&self, hemisphere: Hemisphere) -> Option<&Path> {
        match hemisphere {
            Hemisphere::East => self.east.as_deref(),
            Hemisphere::West => self.west.as_deref(),
        }
    }
}

/// Scene-level metadata from the manifest and the reference annotation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneMetadata {
    pub product_name: String,
    pub mission: String,
    /// Satellite unit, e.g. "A"
    pub platform: String,
    pub acquisition_mode: AcquisitionMode,
    pub start_time: DateTime<Utc>,
    /// Footprint corners in manifest order
    pub aoi: Vec<GeoPoint>,
    pub dimensions: ImageDimensions,
    pub pixel_spacing: (f64, f64), // (range, azimuth) in meters
    pub polarizations: Vec<Polarization>,
}

impl SceneMetadata {
    pub fn extent(&self) -> SarResult<BoundingBox> {
        BoundingBox::from_points(&self.aoi)
    }

    /// Output stem naming the platform, mode, start time and applied operator chain
    pub fn output_name(&self) -> String {
        format!(
            "S1{}_{}_{}_{}",
            self.platform,
            self.acquisition_mode,
            self.start_time.format("%y%m%dT%H%M%S"),
            "bnr_orb_cal_ml_tf_tc_db"
        )
    }
}

/// One engine invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingTask {
    pub hemisphere: Hemisphere,
    /// `None` processes the whole scene
    pub window: Option<SubsetWindow>,
    pub dem: Option<PathBuf>,
    pub output_path: PathBuf,
}

impl ProcessingTask {
    /// Short identity for log records
    pub fn label(&self) -> String {
        match &self.window {
            Some(w) => format!("{}:{}", self.hemisphere, w.region()),
            None => format!("{}:full", self.hemisphere),
        }
    }

    /// Sibling output of the layover/shadow mask pass: a trailing `_dB`
    /// becomes `_lsm`, any other name gains the suffix
    pub fn mask_output_path(&self) -> PathBuf {
        let name = self
            .output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = name.strip_suffix("_dB").unwrap_or(&name);
        self.output_path.with_file_name(format!("{}_lsm", stem))
    }
}

/// Product an engine task writes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    /// Terrain-flattened gamma0 in dB, one band per polarization
    #[default]
    Backscatter,
    /// Terrain-correction layover/shadow mask
    LayoverShadowMask,
}

/// Band family merged into one mosaic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MosaicLayer {
    Backscatter(Polarization),
    LayoverShadowMask,
}

impl MosaicLayer {
    /// Substring identifying the layer's band files, matched case-insensitively
    pub fn band_token(&self) -> &'static str {
        match self {
            MosaicLayer::Backscatter(p) => p.file_code(),
            MosaicLayer::LayoverShadowMask => "layover_shadow_mask",
        }
    }

    pub fn polarization(&self) -> Option<Polarization> {
        match self {
            MosaicLayer::Backscatter(p) => Some(*p),
            MosaicLayer::LayoverShadowMask => None,
        }
    }
}

impl From<Polarization> for MosaicLayer {
    fn from(polarization: Polarization) -> Self {
        MosaicLayer::Backscatter(polarization)
    }
}

impl std::fmt::Display for MosaicLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MosaicLayer::Backscatter(p) => write!(f, "Gamma0_{}_db", p),
            MosaicLayer::LayoverShadowMask => write!(f, "layover_shadow_mask"),
        }
    }
}

/// Merged raster for one hemisphere and layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MosaicResult {
    pub hemisphere: Hemisphere,
    pub layer: MosaicLayer,
    pub path: PathBuf,
    /// Number of task rasters merged
    pub inputs: usize,
}

impl MosaicResult {
    pub fn polarization(&self) -> Option<Polarization> {
        self.layer.polarization()
    }
}

/// Scene/task identity carried by each component and prefixed to its log records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogContext {
    pub scene: String,
    pub task: Option<String>,
}

impl LogContext {
    pub fn new(scene: impl Into<String>) -> Self {
        Self {
            scene: scene.into(),
            task: None,
        }
    }

    pub fn with_task(&self, task: impl Into<String>) -> Self {
        Self {
            scene: self.scene.clone(),
            task: Some(task.into()),
        }
    }
}

impl std::fmt::Display for LogContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.task {
            Some(task) => write!(f, "[{} {}]", self.scene, task),
            None => write!(f, "[{}]", self.scene),
        }
    }
}

/// Error types for SAR processing
#[derive(Debug, thiserror::Error)]
pub enum SarError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Metadata parse error: {0}")]
    Parse(String),

    #[error("Reprojection error: {0}")]
    Reprojection(String),

    #[error("Densification error: {0}")]
    Densification(String),

    #[error("Processing graph error: {0}")]
    Graph(String),

    #[error("Processing engine error: {0}")]
    ProcessingEngine(String),

    #[error("Mosaic assembly error: {0}")]
    MosaicAssembly(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

/// Result type for SAR operations
pub type SarResult<T> = Result<T, SarError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> ImageDimensions {
        ImageDimensions { samples: 100, lines: 50 }
    }

    #[test]
    fn test_subset_window_bounds() {
        assert!(SubsetWindow::new(0, 0, 99, 49, dims()).is_ok());
        assert!(SubsetWindow::new(10, 0, 5, 49, dims()).is_err());
        assert!(SubsetWindow::new(0, 0, 100, 49, dims()).is_err());
        assert!(SubsetWindow::new(0, 20, 10, 10, dims()).is_err());

        let w = SubsetWindow::new(1, 2, 3, 4, dims()).unwrap();
        assert_eq!(w.region(), "1,2,3,4");
        assert_eq!(w.tag(), "1_2_3_4");
    }

    #[test]
    fn test_bounding_box() {
        let pts = [
            GeoPoint { lat: -16.0, lon: 179.5 },
            GeoPoint { lat: -17.0, lon: -179.8 },
            GeoPoint { lat: -18.5, lon: 178.1 },
        ];
        let bbox = BoundingBox::from_points(&pts).unwrap();
        assert_eq!(bbox.min_lon, -179.8);
        assert_eq!(bbox.max_lon, 179.5);
        assert_eq!(bbox.min_lat, -18.5);
        assert_eq!(bbox.max_lat, -16.0);
        assert!(BoundingBox::from_points(&[]).is_err());
    }

    #[test]
    fn test_geotransform_apply() {
        let gt = GeoTransform::from_gdal([100.0, 2.0, 0.5, 50.0, 0.25, -3.0]);
        assert_eq!(gt.apply(0.0, 0.0), (100.0, 50.0));
        assert_eq!(gt.apply(10.0, 4.0), (100.0 + 20.0 + 2.0, 50.0 + 2.5 - 12.0));
        assert_eq!(gt.to_gdal(), [100.0, 2.0, 0.5, 50.0, 0.25, -3.0]);
    }

    #[test]
    fn test_polarization_parsing() {
        assert_eq!("vh".parse::<Polarization>().unwrap(), Polarization::VH);
        assert!("xx".parse::<Polarization>().is_err());
        assert_eq!(Polarization::HH.file_code(), "hh");
    }

    #[test]
    fn test_mask_output_path() {
        let mut task = ProcessingTask {
            hemisphere: Hemisphere::West,
            window: None,
            dem: None,
            output_path: PathBuf::from("/t/subset_600_0_999_260_west_Orb_Cal_Deb_ML_TF_TC_dB"),
        };
        assert_eq!(
            task.mask_output_path(),
            PathBuf::from("/t/subset_600_0_999_260_west_Orb_Cal_Deb_ML_TF_TC_lsm")
        );
        task.output_path = PathBuf::from("/t/S1A_IW_170328T063214_bnr_orb_cal_ml_tf_tc_db");
        assert_eq!(
            task.mask_output_path(),
            PathBuf::from("/t/S1A_IW_170328T063214_bnr_orb_cal_ml_tf_tc_db_lsm")
        );
    }

    #[test]
    fn test_mosaic_layer_names() {
        let vv: MosaicLayer = Polarization::VV.into();
        assert_eq!(vv.to_string(), "Gamma0_VV_db");
        assert_eq!(vv.band_token(), "vv");
        assert_eq!(MosaicLayer::LayoverShadowMask.polarization(), None);
        assert_eq!(MosaicLayer::LayoverShadowMask.to_string(), "layover_shadow_mask");
    }

    #[test]
    fn test_log_context_display() {
        let ctx = LogContext::new("S1A_IW");
        assert_eq!(ctx.to_string(), "[S1A_IW]");
        assert_eq!(ctx.with_task("east:0,0,9,9").to_string(), "[S1A_IW east:0,0,9,9]");
    }
}
