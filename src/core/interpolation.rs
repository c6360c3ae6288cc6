//! Cubic interpolation of tie-point fields over image coordinates
//!
//! Sites on a rectilinear lattice (every grid row shares the same pixel
//! columns, as in annotation geolocation grids) use a local bicubic Hermite
//! scheme: each evaluation touches a 4x4 neighbourhood, so cost grows
//! linearly with the number of sites. Scattered sites fall back to a global
//! polyharmonic spline (kernel `r^3` plus a linear tail), limited to
//! [`MAX_SCATTERED_SITES`]. Both schemes pass through every site and
//! reproduce linear fields exactly.

use crate::types::{SarError, SarResult};
use nalgebra::linalg::LU;
use nalgebra::{DMatrix, DVector, Dyn};
use ndarray::Array2;
use std::collections::HashMap;

/// Largest scattered site set solved with the dense global spline
pub const MAX_SCATTERED_SITES: usize = 2500;

/// Maps image coordinates onto the unit square to keep the system well conditioned
#[derive(Debug, Clone, Copy)]
struct Normalization {
    x0: f64,
    y0: f64,
    scale: f64,
}

impl Normalization {
    fn fit(xs: &[f64], ys: &[f64]) -> Self {
        let (min_x, max_x) = min_max(xs);
        let (min_y, max_y) = min_max(ys);
        let span = (max_x - min_x).max(max_y - min_y);
        Self {
            x0: min_x,
            y0: min_y,
            scale: if span > 0.0 { 1.0 / span } else { 1.0 },
        }
    }

    fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        ((x - self.x0) * self.scale, (y - self.y0) * self.scale)
    }
}

fn min_max(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

#[inline]
fn kernel(r2: f64) -> f64 {
    let r = r2.sqrt();
    r2 * r
}

/// Index `k` of the segment `[nodes[k], nodes[k + 1]]` used for `t`; clamped
/// to the end segments outside the node range
fn segment(nodes: &[f64], t: f64) -> usize {
    nodes
        .partition_point(|&v| v <= t)
        .saturating_sub(1)
        .min(nodes.len() - 2)
}

/// Three-point derivative at node `k`, one-sided at the ends
fn node_slope(nodes: &[f64], values: &[f64], k: usize) -> f64 {
    let last = nodes.len() - 1;
    if k == 0 {
        (values[1] - values[0]) / (nodes[1] - nodes[0])
    } else if k == last {
        (values[last] - values[last - 1]) / (nodes[last] - nodes[last - 1])
    } else {
        let h0 = nodes[k] - nodes[k - 1];
        let h1 = nodes[k + 1] - nodes[k];
        let d0 = (values[k] - values[k - 1]) / h0;
        let d1 = (values[k + 1] - values[k]) / h1;
        (h0 * d1 + h1 * d0) / (h0 + h1)
    }
}

/// Cubic Hermite segment through `(t0, f0)` and `(t1, f1)` with end slopes `d0`, `d1`
#[inline]
fn hermite(t0: f64, t1: f64, f0: f64, f1: f64, d0: f64, d1: f64, t: f64) -> f64 {
    let h = t1 - t0;
    let s = (t - t0) / h;
    let s2 = s * s;
    let s3 = s2 * s;
    (2.0 * s3 - 3.0 * s2 + 1.0) * f0
        + (s3 - 2.0 * s2 + s) * h * d0
        + (-2.0 * s3 + 3.0 * s2) * f1
        + (s3 - s2) * h * d1
}

/// Sites arranged as rows (lines) by columns (pixels)
#[derive(Debug, Clone)]
struct Lattice {
    columns: Vec<f64>,
    rows: Vec<f64>,
    /// (row, column) cell of every site, in site order
    cells: Vec<(usize, usize)>,
}

impl Lattice {
    /// `None` unless every (line, pixel) pair of the unique lines and pixels
    /// occurs exactly once
    fn detect(xs: &[f64], ys: &[f64]) -> Option<Self> {
        let unique = |values: &[f64]| {
            let mut v = values.to_vec();
            v.sort_by(|a, b| a.total_cmp(b));
            v.dedup();
            v
        };
        let columns = unique(xs);
        let rows = unique(ys);
        if columns.len() < 2 || rows.len() < 2 || columns.len() * rows.len() != xs.len() {
            return None;
        }

        let column_index: HashMap<u64, usize> =
            columns.iter().enumerate().map(|(i, v)| (v.to_bits(), i)).collect();
        let row_index: HashMap<u64, usize> =
            rows.iter().enumerate().map(|(i, v)| (v.to_bits(), i)).collect();

        let mut seen = vec![false; xs.len()];
        let mut cells = Vec::with_capacity(xs.len());
        for (&x, &y) in xs.iter().zip(ys) {
            let cell = (*row_index.get(&y.to_bits())?, *column_index.get(&x.to_bits())?);
            let flat = cell.0 * columns.len() + cell.1;
            if seen[flat] {
                return None;
            }
            seen[flat] = true;
            cells.push(cell);
        }
        Some(Self { columns, rows, cells })
    }

    fn fit(&self, values: &[f64]) -> FieldModel {
        let mut grid = Array2::<f64>::zeros((self.rows.len(), self.columns.len()));
        for (&(r, c), &v) in self.cells.iter().zip(values) {
            grid[[r, c]] = v;
        }
        let mut x_slopes = Array2::<f64>::zeros(grid.dim());
        for (r, row) in grid.outer_iter().enumerate() {
            let row = row.to_vec();
            for c in 0..self.columns.len() {
                x_slopes[[r, c]] = node_slope(&self.columns, &row, c);
            }
        }
        FieldModel::Lattice { values: grid, x_slopes }
    }

    fn evaluate(&self, values: &Array2<f64>, x_slopes: &Array2<f64>, x: f64, y: f64) -> f64 {
        let c = segment(&self.columns, x);
        let r = segment(&self.rows, y);

        // rows r-1..=r+2 give the same slopes at r and r+1 as the full column
        let lo = r.saturating_sub(1);
        let hi = (r + 2).min(self.rows.len() - 1);
        let along: Vec<f64> = (lo..=hi)
            .map(|i| {
                hermite(
                    self.columns[c],
                    self.columns[c + 1],
                    values[[i, c]],
                    values[[i, c + 1]],
                    x_slopes[[i, c]],
                    x_slopes[[i, c + 1]],
                    x,
                )
            })
            .collect();

        let nodes = &self.rows[lo..=hi];
        let k = r - lo;
        let d0 = node_slope(nodes, &along, k);
        let d1 = node_slope(nodes, &along, k + 1);
        hermite(nodes[k], nodes[k + 1], along[k], along[k + 1], d0, d1, y)
    }
}

/// Global polyharmonic spline over scattered sites
struct GlobalSpline {
    sites: Vec<(f64, f64)>,
    norm: Normalization,
    lu: LU<f64, Dyn, Dyn>,
}

impl GlobalSpline {
    fn new(xs: &[f64], ys: &[f64]) -> SarResult<Self> {
        let n = xs.len();
        if n > MAX_SCATTERED_SITES {
            return Err(SarError::Densification(format!(
                "{} scattered sites exceed the limit of {}; tie points must form a pixel/line lattice",
                n, MAX_SCATTERED_SITES
            )));
        }

        let norm = Normalization::fit(xs, ys);
        let sites: Vec<(f64, f64)> = xs.iter().zip(ys).map(|(&x, &y)| norm.apply(x, y)).collect();

        let size = n + 3;
        let mut system = DMatrix::<f64>::zeros(size, size);
        for i in 0..n {
            let (xi, yi) = sites[i];
            for j in (i + 1)..n {
                let (xj, yj) = sites[j];
                let phi = kernel((xi - xj).powi(2) + (yi - yj).powi(2));
                system[(i, j)] = phi;
                system[(j, i)] = phi;
            }
            let poly = [1.0, xi, yi];
            for (k, &p) in poly.iter().enumerate() {
                system[(i, n + k)] = p;
                system[(n + k, i)] = p;
            }
        }

        let lu = system.lu();
        if !lu.is_invertible() {
            return Err(SarError::Densification(
                "Interpolation system is singular (duplicate or collinear sites)".to_string(),
            ));
        }
        Ok(Self { sites, norm, lu })
    }

    fn fit(&self, values: &[f64]) -> SarResult<FieldModel> {
        let n = self.sites.len();
        let rhs = DVector::from_iterator(n + 3, values.iter().copied().chain([0.0; 3]));
        let solution = self
            .lu
            .solve(&rhs)
            .filter(|s| s.iter().all(|v| v.is_finite()))
            .ok_or_else(|| SarError::Densification("Interpolation solve failed".to_string()))?;
        Ok(FieldModel::Global(solution))
    }

    fn evaluate(&self, weights: &DVector<f64>, x: f64, y: f64) -> f64 {
        let n = self.sites.len();
        let (u, v) = self.norm.apply(x, y);
        let tail = weights[n] + weights[n + 1] * u + weights[n + 2] * v;
        self.sites.iter().enumerate().fold(tail, |acc, (i, &(sx, sy))| {
            acc + weights[i] * kernel((u - sx).powi(2) + (v - sy).powi(2))
        })
    }
}

enum Scheme {
    Lattice(Lattice),
    Global(GlobalSpline),
}

#[derive(Debug, Clone)]
enum FieldModel {
    Lattice { values: Array2<f64>, x_slopes: Array2<f64> },
    Global(DVector<f64>),
}

/// Fitted coefficients for one interpolated field
#[derive(Debug, Clone)]
pub struct FieldWeights(FieldModel);

/// Cubic interpolator over a fixed set of sites.
///
/// The site layout is analysed once; every field sampled at the same sites
/// reuses it.
pub struct CubicInterpolator {
    len: usize,
    scheme: Scheme,
}

impl CubicInterpolator {
    pub fn new(xs: &[f64], ys: &[f64]) -> SarResult<Self> {
        if xs.len() != ys.len() {
            return Err(SarError::Densification(format!(
                "Site coordinate length mismatch: {} vs {}",
                xs.len(),
                ys.len()
            )));
        }
        let n = xs.len();
        if n < 4 {
            return Err(SarError::Densification(format!(
                "Cubic interpolation needs at least 4 sites, got {}",
                n
            )));
        }
        if let Some(bad) = xs.iter().chain(ys).position(|v| !v.is_finite()) {
            return Err(SarError::Densification(format!("Non-finite site coordinate at {}", bad % n)));
        }

        let scheme = match Lattice::detect(xs, ys) {
            Some(lattice) => {
                log::debug!(
                    "Interpolating on a {}x{} site lattice",
                    lattice.rows.len(),
                    lattice.columns.len()
                );
                Scheme::Lattice(lattice)
            }
            None => {
                log::debug!("Interpolating {} scattered sites with a global spline", n);
                Scheme::Global(GlobalSpline::new(xs, ys)?)
            }
        };
        Ok(Self { len: n, scheme })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when the sites form a pixel/line lattice
    pub fn is_lattice(&self) -> bool {
        matches!(self.scheme, Scheme::Lattice(_))
    }

    /// Fit one field sampled at the sites
    pub fn fit(&self, values: &[f64]) -> SarResult<FieldWeights> {
        if values.len() != self.len {
            return Err(SarError::Densification(format!(
                "Expected {} field values, got {}",
                self.len,
                values.len()
            )));
        }
        if let Some(bad) = values.iter().position(|v| !v.is_finite()) {
            return Err(SarError::Densification(format!("Non-finite field value at site {}", bad)));
        }

        let model = match &self.scheme {
            Scheme::Lattice(lattice) => lattice.fit(values),
            Scheme::Global(spline) => spline.fit(values)?,
        };
        Ok(FieldWeights(model))
    }

    fn evaluate_point(&self, fields: &[FieldWeights], x: f64, y: f64) -> Vec<f64> {
        fields
            .iter()
            .map(|field| match (&self.scheme, &field.0) {
                (Scheme::Lattice(lattice), FieldModel::Lattice { values, x_slopes }) => {
                    lattice.evaluate(values, x_slopes, x, y)
                }
                (Scheme::Global(spline), FieldModel::Global(weights)) => spline.evaluate(weights, x, y),
                // weights are only produced by this interpolator's own fit
                _ => f64::NAN,
            })
            .collect()
    }

    /// Evaluate several fields at the given positions; one output vector per field
    pub fn evaluate(&self, fields: &[FieldWeights], xs: &[f64], ys: &[f64]) -> Vec<Vec<f64>> {
        let per_point = self.evaluate_points(fields, xs, ys);

        let mut columns: Vec<Vec<f64>> = vec![Vec::with_capacity(per_point.len()); fields.len()];
        for values in per_point {
            for (column, value) in columns.iter_mut().zip(values) {
                column.push(value);
            }
        }
        columns
    }

    #[cfg(feature = "parallel")]
    fn evaluate_points(&self, fields: &[FieldWeights], xs: &[f64], ys: &[f64]) -> Vec<Vec<f64>> {
        use rayon::prelude::*;

        xs.par_iter()
            .zip(ys.par_iter())
            .map(|(&x, &y)| self.evaluate_point(fields, x, y))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn evaluate_points(&self, fields: &[FieldWeights], xs: &[f64], ys: &[f64]) -> Vec<Vec<f64>> {
        xs.iter()
            .zip(ys.iter())
            .map(|(&x, &y)| self.evaluate_point(fields, x, y))
            .collect()
    }
}
