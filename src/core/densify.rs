use crate::core::geometry::{
    affine_rms, fit_affine, normalize_longitude, GdalPointTransform, ParallelReprojector, Point3,
    PointTransform,
};
use crate::core::interpolation::CubicInterpolator;
use crate::io::annotation::{TiePointGrid, TiePointGridReader};
use crate::types::{
    GroundControlPoint, ImageDimensions, LogContext, SarError, SarResult, TiePoint,
};
use chrono::{Duration, NaiveDateTime};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Grid densification parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DensifyParams {
    /// Mesh size N; the dense grid holds N x N points
    pub grid_points: usize,
    /// Reprojection worker count
    pub workers: usize,
    /// CRS of the annotation tie points
    pub source_epsg: u32,
    /// Antemeridian-safe projected CRS used for the affine fit
    pub projected_epsg: u32,
}

impl Default for DensifyParams {
    fn default() -> Self {
        Self {
            grid_points: 250,
            workers: 4,
            source_epsg: 4326,
            // Fiji 1986 / Fiji Map Grid, transverse Mercator centred on 178.75E
            projected_epsg: 3460,
        }
    }
}

/// Interpolated N x N geolocation grid.
///
/// All arrays are indexed in mesh traversal order (line outer, pixel inner).
#[derive(Debug, Clone)]
pub struct DenseGrid {
    pub dimensions: ImageDimensions,
    pub size: usize,
    pub pixels: Vec<f64>,
    pub lines: Vec<f64>,
    pub azimuth_times: Vec<NaiveDateTime>,
    pub slant_range_times: Vec<f64>,
    pub incidence_angles: Vec<f64>,
    pub elevation_angles: Vec<f64>,
    /// Ground control points with x = longitude, y = latitude, z = height
    pub gcps: Vec<GroundControlPoint>,
}

impl DenseGrid {
    pub fn len(&self) -> usize {
        self.gcps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gcps.is_empty()
    }

    /// Tie points for annotation writeback
    pub fn to_tie_points(&self) -> Vec<TiePoint> {
        (0..self.len())
            .map(|k| TiePoint {
                gcp: self.gcps[k],
                azimuth_time: self.azimuth_times[k],
                slant_range_time: self.slant_range_times[k],
                incidence_angle: self.incidence_angles[k],
                elevation_angle: self.elevation_angles[k],
            })
            .collect()
    }
}

/// Sample positions of an N x N mesh over the image, line-major
pub fn build_mesh(dims: ImageDimensions, size: usize) -> (Vec<f64>, Vec<f64>) {
    let pixel_at = |i: usize| ((i * dims.samples) / size) as f64;
    let line_at = |j: usize| ((j * dims.lines) / size) as f64;

    let pixels = Array2::from_shape_fn((size, size), |(_, i)| pixel_at(i));
    let lines = Array2::from_shape_fn((size, size), |(j, _)| line_at(j));
    (pixels.into_raw_vec(), lines.into_raw_vec())
}

/// True when lines never decrease and pixels strictly increase within each line
pub fn is_grid_ordered(gcps: &[GroundControlPoint]) -> bool {
    gcps.windows(2).all(|pair| {
        let (a, b) = (&pair[0], &pair[1]);
        b.line > a.line || (b.line == a.line && b.pixel > a.pixel)
    })
}

/// Interpolates a sparse tie-point grid to a dense one and regeolocates it
/// through an antemeridian-safe projected CRS.
pub struct GridDensifier {
    params: DensifyParams,
    forward: Arc<dyn PointTransform>,
    inverse: Arc<dyn PointTransform>,
    reprojector: ParallelReprojector,
    ctx: LogContext,
}

impl GridDensifier {
    /// Densifier reprojecting through GDAL between the configured EPSG codes
    pub fn new(params: DensifyParams, ctx: LogContext) -> SarResult<Self> {
        let forward = GdalPointTransform::new(params.source_epsg, params.projected_epsg);
        forward.check()?;
        let inverse = forward.inverse();
        Ok(Self::with_transforms(params, Arc::new(forward), Arc::new(inverse), ctx))
    }

    pub fn with_transforms(
        params: DensifyParams,
        forward: Arc<dyn PointTransform>,
        inverse: Arc<dyn PointTransform>,
        ctx: LogContext,
    ) -> Self {
        let reprojector = ParallelReprojector::new(params.workers).with_context(ctx.clone());
        Self { params, forward, inverse, reprojector, ctx }
    }

    pub fn params(&self) -> &DensifyParams {
        &self.params
    }

    /// Densify the grid of one annotation file, optionally writing it back
    pub fn densify_file<P: AsRef<Path>>(&self, path: P, writeback: bool) -> SarResult<DenseGrid> {
        let grid = TiePointGridReader::read(path.as_ref())?;
        let dense = self.densify(&grid)?;
        if writeback {
            TiePointGridReader::write_grid(path.as_ref(), &dense.to_tie_points())?;
        }
        Ok(dense)
    }

    pub fn densify(&self, grid: &TiePointGrid) -> SarResult<DenseGrid> {
        self.densify_points(&grid.points, grid.dimensions)
    }

    pub fn densify_points(&self, points: &[TiePoint], dims: ImageDimensions) -> SarResult<DenseGrid> {
        let size = self.params.grid_points;
        if size < 2 {
            return Err(SarError::Densification(format!("Grid size {} is below 2", size)));
        }
        if dims.samples == 0 || dims.lines == 0 {
            return Err(SarError::Densification(format!(
                "Invalid image dimensions {}x{}",
                dims.samples, dims.lines
            )));
        }
        if points.len() < 4 {
            return Err(SarError::Densification(format!(
                "Need at least 4 tie points, got {}",
                points.len()
            )));
        }

        log::info!(
            "{} Densifying {} tie points to a {}x{} grid over {}x{} image",
            self.ctx,
            points.len(),
            size,
            size,
            dims.samples,
            dims.lines
        );
        let start = std::time::Instant::now();

        let (mesh_pixels, mesh_lines) = build_mesh(dims, size);

        // auxiliary fields
        let sparse_pixels: Vec<f64> = points.iter().map(|p| p.gcp.pixel).collect();
        let sparse_lines: Vec<f64> = points.iter().map(|p| p.gcp.line).collect();
        let interpolator = CubicInterpolator::new(&sparse_pixels, &sparse_lines)?;

        let epoch = points
            .iter()
            .map(|p| p.azimuth_time)
            .min()
            .ok_or_else(|| SarError::Densification("No azimuth times".to_string()))?;
        let seconds: Vec<f64> = points
            .iter()
            .map(|p| seconds_since(epoch, p.azimuth_time))
            .collect::<SarResult<_>>()?;

        let fields = [
            interpolator.fit(&seconds)?,
            interpolator.fit(&points.iter().map(|p| p.slant_range_time).collect::<Vec<_>>())?,
            interpolator.fit(&points.iter().map(|p| p.incidence_angle).collect::<Vec<_>>())?,
            interpolator.fit(&points.iter().map(|p| p.elevation_angle).collect::<Vec<_>>())?,
            interpolator.fit(&points.iter().map(|p| p.gcp.z).collect::<Vec<_>>())?,
        ];
        let mut dense = interpolator.evaluate(&fields, &mesh_pixels, &mesh_lines).into_iter();
        let mut next_field = || {
            dense
                .next()
                .ok_or_else(|| SarError::Densification("Missing interpolated field".to_string()))
        };
        let dense_seconds = next_field()?;
        let slant_range_times = next_field()?;
        let incidence_angles = next_field()?;
        let elevation_angles = next_field()?;
        let heights = next_field()?;

        let azimuth_times = dense_seconds
            .iter()
            .map(|&s| epoch + Duration::microseconds((s * 1e6).round() as i64))
            .collect();

        // ground coordinates via the projected CRS
        let gcps = self.regeolocate(points, &mesh_pixels, &mesh_lines, &heights)?;

        log::info!(
            "{} Densified grid of {} points in {:.2?}",
            self.ctx,
            gcps.len(),
            start.elapsed()
        );

        Ok(DenseGrid {
            dimensions: dims,
            size,
            pixels: mesh_pixels,
            lines: mesh_lines,
            azimuth_times,
            slant_range_times,
            incidence_angles,
            elevation_angles,
            gcps,
        })
    }

    fn regeolocate(
        &self,
        points: &[TiePoint],
        mesh_pixels: &[f64],
        mesh_lines: &[f64],
        heights: &[f64],
    ) -> SarResult<Vec<GroundControlPoint>> {
        let geographic: Vec<Point3> = points.iter().map(|p| [p.gcp.x, p.gcp.y, p.gcp.z]).collect();
        let projected = self.reprojector.reproject(&geographic, self.forward.as_ref())?;

        let projected_gcps: Vec<GroundControlPoint> = points
            .iter()
            .zip(&projected)
            .map(|(p, q)| GroundControlPoint {
                pixel: p.gcp.pixel,
                line: p.gcp.line,
                x: q[0],
                y: q[1],
                z: q[2],
            })
            .collect();
        if let Some(bad) = projected_gcps.iter().position(|g| !g.x.is_finite() || !g.y.is_finite()) {
            return Err(SarError::Reprojection(format!(
                "Tie point {} has no finite projected coordinate",
                bad
            )));
        }

        let transform = fit_affine(&projected_gcps)?;
        log::debug!(
            "{} Affine ground transform {:?}, rms residual {:.3}",
            self.ctx,
            transform.to_gdal(),
            affine_rms(&transform, &projected_gcps)
        );

        let provisional: Vec<Point3> = mesh_pixels
            .iter()
            .zip(mesh_lines)
            .zip(heights)
            .map(|((&pixel, &line), &z)| {
                let (x, y) = transform.apply(pixel, line);
                [x, y, z]
            })
            .collect();
        let geographic = self.reprojector.reproject(&provisional, self.inverse.as_ref())?;

        Ok(mesh_pixels
            .iter()
            .zip(mesh_lines)
            .zip(geographic.iter().zip(heights))
            .map(|((&pixel, &line), (g, &z))| GroundControlPoint {
                pixel,
                line,
                x: normalize_longitude(g[0]),
                y: g[1],
                z,
            })
            .collect())
    }
}

fn seconds_since(epoch: NaiveDateTime, time: NaiveDateTime) -> SarResult<f64> {
    (time - epoch)
        .num_microseconds()
        .map(|us| us as f64 / 1e6)
        .ok_or_else(|| SarError::Densification(format!("Azimuth time {} out of range", time)))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Identity;

    impl PointTransform for Identity {
        fn transform(&self, _xs: &mut [f64], _ys: &mut [f64], _zs: &mut [f64]) -> SarResult<()> {
            Ok(())
        }
    }

    fn params(grid_points: usize) -> DensifyParams {
        DensifyParams { grid_points, workers: 2, ..DensifyParams::default() }
    }

    fn sparse_points() -> Vec<TiePoint> {
        let t0 = NaiveDateTime::parse_from_str("2017-03-28T06:32:14.000000", "%Y-%m-%dT%H:%M:%S%.f")
            .unwrap();
        let mut points = Vec::new();
        for line in [0.0, 50.0, 99.0] {
            for pixel in [0.0, 100.0, 199.0] {
                points.push(TiePoint {
                    gcp: GroundControlPoint {
                        pixel,
                        line,
                        x: 10.0 + pixel * 0.01,
                        y: 20.0 - line * 0.01,
                        z: 5.0,
                    },
                    azimuth_time: t0 + Duration::microseconds((line * 1000.0) as i64),
                    slant_range_time: 0.005 + pixel * 1e-6,
                    incidence_angle: 30.0 + pixel * 0.05,
                    elevation_angle: 27.0 + pixel * 0.04,
                });
            }
        }
        points
    }

    #[test]
    fn test_build_mesh() {
        let (pixels, lines) = build_mesh(ImageDimensions { samples: 10, lines: 7 }, 4);
        assert_eq!(pixels.len(), 16);
        assert_eq!(&pixels[..4], &[0.0, 2.0, 5.0, 7.0]);
        assert_eq!(lines[..4], [0.0; 4]);
        assert_eq!(lines[4], 1.0);
        assert_eq!(lines[15], 5.0);
    }

    #[test]
    fn test_densify_linear_scene() {
        let densifier = GridDensifier::with_transforms(
            params(5),
            Arc::new(Identity),
            Arc::new(Identity),
            LogContext::new("test"),
        );
        let dense = densifier
            .densify_points(&sparse_points(), ImageDimensions { samples: 200, lines: 100 })
            .unwrap();

        assert_eq!(dense.len(), 25);
        assert!(is_grid_ordered(&dense.gcps));
        for g in &dense.gcps {
            assert!((g.x - (10.0 + g.pixel * 0.01)).abs() < 1e-6);
            assert!((g.y - (20.0 - g.line * 0.01)).abs() < 1e-6);
            assert!((g.z - 5.0).abs() < 1e-6);
        }
        // line 40 is 40 ms after the first tie point
        let k = dense.lines.iter().position(|&l| l == 40.0).unwrap();
        assert_eq!(
            (dense.azimuth_times[k] - dense.azimuth_times[0]).num_microseconds(),
            Some(40_000)
        );
    }

    #[test]
    fn test_densify_rejects_small_input() {
        let densifier = GridDensifier::with_transforms(
            params(5),
            Arc::new(Identity),
            Arc::new(Identity),
            LogContext::default(),
        );
        let dims = ImageDimensions { samples: 200, lines: 100 };
        assert!(matches!(
            densifier.densify_points(&sparse_points()[..3], dims),
            Err(SarError::Densification(_))
        ));
        assert!(densifier
            .densify_points(&sparse_points(), ImageDimensions { samples: 0, lines: 100 })
            .is_err());
    }
}
