//! Coordinate transforms, affine ground-control fits and parallel point reprojection

use crate::types::{GeoTransform, GroundControlPoint, LogContext, SarError, SarResult};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use nalgebra::{Matrix3, Vector3};
use std::sync::{mpsc, Arc};

/// Ground point (x, y, z) in some CRS
pub type Point3 = [f64; 3];

/// In-place coordinate transform over parallel coordinate slices
pub trait PointTransform: Send + Sync {
    fn transform(&self, xs: &mut [f64], ys: &mut [f64], zs: &mut [f64]) -> SarResult<()>;
}

/// EPSG-to-EPSG transform through GDAL/PROJ.
///
/// Geographic CRSs use longitude/latitude axis order. A fresh GDAL transform is
/// built per call because the handles cannot be shared between threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GdalPointTransform {
    pub source_epsg: u32,
    pub target_epsg: u32,
}

impl GdalPointTransform {
    pub fn new(source_epsg: u32, target_epsg: u32) -> Self {
        Self { source_epsg, target_epsg }
    }

    pub fn inverse(&self) -> Self {
        Self::new(self.target_epsg, self.source_epsg)
    }

    fn spatial_ref(epsg: u32) -> SarResult<SpatialRef> {
        let srs = SpatialRef::from_epsg(epsg)
            .map_err(|e| SarError::Reprojection(format!("Cannot initialise EPSG:{}: {}", epsg, e)))?;
        srs.set_axis_mapping_strategy(
            gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER,
        );
        Ok(srs)
    }

    /// Build the GDAL transform once, surfacing library initialisation errors
    pub fn check(&self) -> SarResult<()> {
        self.coord_transform().map(|_| ())
    }

    fn coord_transform(&self) -> SarResult<CoordTransform> {
        let source = Self::spatial_ref(self.source_epsg)?;
        let target = Self::spatial_ref(self.target_epsg)?;
        CoordTransform::new(&source, &target).map_err(|e| {
            SarError::Reprojection(format!(
                "Cannot build EPSG:{} -> EPSG:{} transform: {}",
                self.source_epsg, self.target_epsg, e
            ))
        })
    }
}

impl PointTransform for GdalPointTransform {
    fn transform(&self, xs: &mut [f64], ys: &mut [f64], zs: &mut [f64]) -> SarResult<()> {
        if xs.is_empty() {
            return Ok(());
        }
        self.coord_transform()?
            .transform_coords(xs, ys, zs)
            .map_err(|e| {
                SarError::Reprojection(format!(
                    "EPSG:{} -> EPSG:{} failed for {} points: {}",
                    self.source_epsg,
                    self.target_epsg,
                    xs.len(),
                    e
                ))
            })
    }
}

/// Apply a transform to a slice of points, returning new points
pub fn reproject_points(points: &[Point3], transform: &dyn PointTransform) -> SarResult<Vec<Point3>> {
    let mut xs: Vec<f64> = points.iter().map(|p| p[0]).collect();
    let mut ys: Vec<f64> = points.iter().map(|p| p[1]).collect();
    let mut zs: Vec<f64> = points.iter().map(|p| p[2]).collect();
    transform.transform(&mut xs, &mut ys, &mut zs)?;

    Ok(xs
        .into_iter()
        .zip(ys)
        .zip(zs)
        .map(|((x, y), z)| [x, y, z])
        .collect())
}

/// Contiguous, non-overlapping index ranges covering `0..len`
pub fn partition_ranges(len: usize, parts: usize) -> Vec<std::ops::Range<usize>> {
    let parts = parts.max(1).min(len.max(1));
    let base = len / parts;
    let remainder = len % parts;

    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let size = base + usize::from(i < remainder);
        ranges.push(start..start + size);
        start += size;
    }
    ranges
}

/// Fixed-size worker pool for point reprojection.
///
/// Points are split into contiguous ranges, each range is transformed on its
/// own worker and the tagged results are reassembled in range order. The pool
/// is started once and shared by clones.
#[derive(Debug, Clone)]
pub struct ParallelReprojector {
    workers: usize,
    /// `None` for a single worker; a failed start is reported by `reproject`
    pool: Option<Result<Arc<rayon::ThreadPool>, String>>,
    ctx: LogContext,
}

impl ParallelReprojector {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let pool = (workers > 1).then(|| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("reproject-{}", i))
                .build()
                .map(Arc::new)
                .map_err(|e| e.to_string())
        });
        if let Some(Err(e)) = &pool {
            log::warn!("Cannot start {} reprojection workers: {}", workers, e);
        }
        Self { workers, pool, ctx: LogContext::default() }
    }

    /// Prefix worker log records with a scene context
    pub fn with_context(mut self, ctx: LogContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn reproject(&self, points: &[Point3], transform: &dyn PointTransform) -> SarResult<Vec<Point3>> {
        let ranges = partition_ranges(points.len(), self.workers);
        log::debug!(
            "Reprojecting {} points across {} partitions",
            points.len(),
            ranges.len()
        );

        if ranges.len() <= 1 {
            return reproject_points(points, transform);
        }
        let pool = match &self.pool {
            None => return reproject_points(points, transform),
            Some(Ok(pool)) => pool,
            Some(Err(e)) => {
                return Err(SarError::Reprojection(format!("Cannot start reprojection pool: {}", e)))
            }
        };

        let (sender, receiver) = mpsc::channel();
        let ctx = &self.ctx;
        pool.scope(|scope| {
            for (index, range) in ranges.iter().enumerate() {
                let sender = sender.clone();
                let chunk = &points[range.clone()];
                scope.spawn(move |_| {
                    if let Err(e) = sender.send((index, reproject_points(chunk, transform))) {
                        log::warn!("{} Partition {} result dropped: {}", ctx, index, e);
                    }
                });
            }
        });
        drop(sender);

        let mut tagged: Vec<(usize, SarResult<Vec<Point3>>)> = receiver.into_iter().collect();
        if tagged.len() != ranges.len() {
            return Err(SarError::Reprojection(format!(
                "Expected {} partition results, received {}",
                ranges.len(),
                tagged.len()
            )));
        }
        tagged.sort_by_key(|(index, _)| *index);

        let mut result = Vec::with_capacity(points.len());
        for (_, part) in tagged {
            result.extend(part?);
        }

        if result.len() != points.len() {
            return Err(SarError::Reprojection(format!(
                "Reprojected {} of {} points",
                result.len(),
                points.len()
            )));
        }
        Ok(result)
    }
}

impl Default for ParallelReprojector {
    fn default() -> Self {
        Self::new(4)
    }
}

/// Least-squares six-parameter affine transform from image to ground coordinates
pub fn fit_affine(gcps: &[GroundControlPoint]) -> SarResult<GeoTransform> {
    if gcps.len() < 3 {
        return Err(SarError::Reprojection(format!(
            "Affine fit needs at least 3 control points, got {}",
            gcps.len()
        )));
    }

    // centre pixel/line for conditioning
    let n = gcps.len() as f64;
    let mean_p = gcps.iter().map(|g| g.pixel).sum::<f64>() / n;
    let mean_l = gcps.iter().map(|g| g.line).sum::<f64>() / n;

    let mut normal = Matrix3::<f64>::zeros();
    let mut rhs_x = Vector3::<f64>::zeros();
    let mut rhs_y = Vector3::<f64>::zeros();
    for g in gcps {
        let row = Vector3::new(1.0, g.pixel - mean_p, g.line - mean_l);
        normal += row * row.transpose();
        rhs_x += row * g.x;
        rhs_y += row * g.y;
    }

    let lu = normal.lu();
    let (cx, cy) = match (lu.solve(&rhs_x), lu.solve(&rhs_y)) {
        (Some(cx), Some(cy)) if cx.iter().chain(cy.iter()).all(|v| v.is_finite()) => (cx, cy),
        _ => {
            return Err(SarError::Reprojection(
                "Degenerate control points: affine fit is singular".to_string(),
            ))
        }
    };

    Ok(GeoTransform {
        top_left_x: cx[0] - cx[1] * mean_p - cx[2] * mean_l,
        pixel_width: cx[1],
        rotation_x: cx[2],
        top_left_y: cy[0] - cy[1] * mean_p - cy[2] * mean_l,
        rotation_y: cy[1],
        pixel_height: cy[2],
    })
}

/// Root-mean-square residual of an affine fit
pub fn affine_rms(transform: &GeoTransform, gcps: &[GroundControlPoint]) -> f64 {
    if gcps.is_empty() {
        return 0.0;
    }
    let sum: f64 = gcps
        .iter()
        .map(|g| {
            let (x, y) = transform.apply(g.pixel, g.line);
            (x - g.x).powi(2) + (y - g.y).powi(2)
        })
        .sum();
    (sum / gcps.len() as f64).sqrt()
}

/// Wrap a longitude into [-180, 180)
pub fn normalize_longitude(lon: f64) -> f64 {
    let wrapped = (lon + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 && lon > 0.0 {
        180.0
    } else {
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    struct Offset;

    impl PointTransform for Offset {
        fn transform(&self, xs: &mut [f64], ys: &mut [f64], _zs: &mut [f64]) -> SarResult<()> {
            for (x, y) in xs.iter_mut().zip(ys.iter_mut()) {
                *x += 1.0;
                *y *= 2.0;
            }
            Ok(())
        }
    }

    #[test]
    fn test_partition_ranges_cover() {
        for (len, parts) in [(10, 4), (3, 8), (0, 4), (16, 1), (7, 7)] {
            let ranges = partition_ranges(len, parts);
            let mut expected = 0;
            for r in &ranges {
                assert_eq!(r.start, expected);
                expected = r.end;
            }
            assert_eq!(expected, len);
        }
        assert_eq!(partition_ranges(10, 4).len(), 4);
        assert_eq!(partition_ranges(3, 8).len(), 3);
    }

    #[test]
    fn test_parallel_matches_serial() {
        let points: Vec<Point3> = (0..101).map(|i| [i as f64, -(i as f64), 0.5]).collect();
        let serial = ParallelReprojector::new(1).reproject(&points, &Offset).unwrap();
        let parallel = ParallelReprojector::new(4).reproject(&points, &Offset).unwrap();
        assert_eq!(serial, parallel);
        assert_eq!(parallel[100], [101.0, -200.0, 0.5]);
    }

    #[test]
    fn test_pool_is_reused_across_calls() {
        let reprojector = ParallelReprojector::new(3);
        let pool = match &reprojector.pool {
            Some(Ok(pool)) => Arc::clone(pool),
            other => panic!("expected a running pool, got {:?}", other.as_ref().map(|p| p.is_ok())),
        };
        assert_eq!(pool.current_num_threads(), 3);

        let copy = reprojector.clone();
        let points: Vec<Point3> = (0..30).map(|i| [i as f64, 0.0, 0.0]).collect();
        for _ in 0..3 {
            assert_eq!(copy.reproject(&points, &Offset).unwrap().len(), 30);
        }
        // clones share the one pool
        match &copy.pool {
            Some(Ok(shared)) => assert!(Arc::ptr_eq(shared, &pool)),
            _ => panic!("clone lost the pool"),
        }
        assert!(ParallelReprojector::new(1).pool.is_none());
    }

    #[test]
    fn test_fit_affine_exact() {
        let truth = GeoTransform::from_gdal([500.0, 10.0, -2.0, 7000.0, 1.5, -12.0]);
        let gcps: Vec<GroundControlPoint> = [(0.0, 0.0), (100.0, 0.0), (0.0, 80.0), (60.0, 40.0), (100.0, 80.0)]
            .iter()
            .map(|&(pixel, line)| {
                let (x, y) = truth.apply(pixel, line);
                GroundControlPoint { pixel, line, x, y, z: 0.0 }
            })
            .collect();

        let fitted = fit_affine(&gcps).unwrap();
        for (a, b) in fitted.to_gdal().iter().zip(truth.to_gdal().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }
        assert!(affine_rms(&fitted, &gcps) < 1e-8);
    }

    #[test]
    fn test_fit_affine_degenerate() {
        let collinear: Vec<GroundControlPoint> = (0..5)
            .map(|i| GroundControlPoint { pixel: i as f64, line: i as f64, x: 1.0, y: 2.0, z: 0.0 })
            .collect();
        assert!(matches!(fit_affine(&collinear), Err(SarError::Reprojection(_))));
        assert!(fit_affine(&collinear[..2]).is_err());
    }

    #[test]
    fn test_normalize_longitude() {
        assert_abs_diff_eq!(normalize_longitude(181.0), -179.0, epsilon = 1e-12);
        assert_abs_diff_eq!(normalize_longitude(-181.0), 179.0, epsilon = 1e-12);
        assert_abs_diff_eq!(normalize_longitude(45.0), 45.0, epsilon = 1e-12);
        assert_eq!(normalize_longitude(180.0), 180.0);
    }
}
