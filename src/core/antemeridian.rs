//! Antemeridian detection and hemisphere chunking of a scene
//!
//! A crossing scene is processed as independent pixel windows per hemisphere
//! and row block. Windows are derived from the dense ground control grid so
//! that each one stays on its own side of the dateline.

use crate::types::{
    BoundingBox, DemReferences, GeoPoint, GroundControlPoint, Hemisphere, ImageDimensions,
    LogContext, ProcessingTask, SarError, SarResult, SubsetWindow,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Operator chain suffix appended to every task output name
pub const TASK_OUTPUT_SUFFIX: &str = "Orb_Cal_Deb_ML_TF_TC_dB";

/// Splitting parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitterParams {
    /// Longitude span (degrees) above which a scene counts as crossing
    pub crossing_threshold_deg: f64,
    /// Number of row blocks per hemisphere
    pub chunks: usize,
    /// Rows added on each side of a block
    pub row_overlap: usize,
}

impl Default for SplitterParams {
    fn default() -> Self {
        Self {
            crossing_threshold_deg: 10.0,
            chunks: 6,
            row_overlap: 10,
        }
    }
}

/// Ground control points of one grid row on one side of the dateline
#[derive(Debug, Clone, PartialEq)]
pub struct GcpRow {
    /// Grid line of the row, kept for empty rows
    pub line: f64,
    pub gcps: Vec<GroundControlPoint>,
}

/// Row-aligned east/west partition of a ground control grid
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HemisphereGroup {
    pub east: Vec<GcpRow>,
    pub west: Vec<GcpRow>,
}

impl HemisphereGroup {
    pub fn rows(&self, hemisphere: Hemisphere) -> &[GcpRow] {
        match hemisphere {
            Hemisphere::East => &self.east,
            Hemisphere::West => &self.west,
        }
    }

    pub fn row_count(&self) -> usize {
        self.east.len()
    }

    pub fn is_aligned(&self) -> bool {
        self.east.len() == self.west.len()
            && self.east.iter().zip(&self.west).all(|(e, w)| e.line == w.line)
    }

    pub fn gcp_count(&self, hemisphere: Hemisphere) -> usize {
        self.rows(hemisphere).iter().map(|r| r.gcps.len()).sum()
    }

    fn mean_pixel(&self, hemisphere: Hemisphere) -> Option<f64> {
        let count = self.gcp_count(hemisphere);
        if count == 0 {
            return None;
        }
        let sum: f64 = self
            .rows(hemisphere)
            .iter()
            .flat_map(|r| r.gcps.iter())
            .map(|g| g.pixel)
            .sum();
        Some(sum / count as f64)
    }

    /// Pixel-space side of the dateline for each hemisphere.
    ///
    /// With both sides populated the hemisphere lying at higher columns has the
    /// dateline on its left. Otherwise the ascending-pass layout is assumed.
    pub fn dateline_side(&self, hemisphere: Hemisphere) -> DatelineSide {
        let west_side = match (self.mean_pixel(Hemisphere::West), self.mean_pixel(Hemisphere::East)) {
            (Some(west), Some(east)) if west <= east => DatelineSide::Right,
            _ => DatelineSide::Left,
        };
        match hemisphere {
            Hemisphere::West => west_side,
            Hemisphere::East => west_side.opposite(),
        }
    }
}

/// Where the dateline sits relative to a hemisphere's pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatelineSide {
    /// Dateline at lower pixel columns
    Left,
    /// Dateline at higher pixel columns
    Right,
}

impl DatelineSide {
    pub fn opposite(&self) -> Self {
        match self {
            DatelineSide::Left => DatelineSide::Right,
            DatelineSide::Right => DatelineSide::Left,
        }
    }
}

/// Inclusive row range of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowBlock {
    pub start: usize,
    pub end: usize,
}

/// Longitude span test on the AOI bounding box
pub fn is_crossing(aoi: &[GeoPoint], threshold_deg: f64) -> SarResult<bool> {
    Ok(BoundingBox::from_points(aoi)?.lon_span() > threshold_deg)
}

/// Hemisphere of a scene that does not cross the dateline
pub fn scene_hemisphere(aoi: &[GeoPoint]) -> SarResult<Hemisphere> {
    Ok(Hemisphere::of_longitude(BoundingBox::from_points(aoi)?.center().lon))
}

/// Split grid rows into east (x >= 0) and west (x < 0) lists.
///
/// A row ends whenever the line value changes; both sides get an entry for
/// every row, empty or not.
pub fn partition_hemispheres(gcps: &[GroundControlPoint]) -> HemisphereGroup {
    let mut group = HemisphereGroup::default();
    let mut current_line: Option<f64> = None;

    for gcp in gcps {
        if current_line != Some(gcp.line) {
            group.east.push(GcpRow { line: gcp.line, gcps: Vec::new() });
            group.west.push(GcpRow { line: gcp.line, gcps: Vec::new() });
            current_line = Some(gcp.line);
        }
        let rows = match Hemisphere::of_longitude(gcp.x) {
            Hemisphere::East => &mut group.east,
            Hemisphere::West => &mut group.west,
        };
        if let Some(row) = rows.last_mut() {
            row.gcps.push(*gcp);
        }
    }
    group
}

/// Overlapping row blocks covering `0..total_lines`
pub fn row_blocks(total_lines: usize, chunks: usize, overlap: usize) -> Vec<RowBlock> {
    if total_lines == 0 || chunks == 0 {
        return Vec::new();
    }
    let span = (total_lines + chunks - 1) / chunks;
    (0..total_lines)
        .step_by(span)
        .map(|start| RowBlock {
            start: start.saturating_sub(overlap),
            end: (start + span + overlap).min(total_lines - 1),
        })
        .collect()
}

/// Rows covering a block, widened by one bracketing row on each side.
/// Rows must be sorted by line.
fn rows_for_block(rows: &[GcpRow], block: RowBlock) -> SarResult<&[GcpRow]> {
    if block.start > block.end {
        return Err(SarError::Processing(format!(
            "Inverted row block {}..{}",
            block.start, block.end
        )));
    }
    if rows.is_empty() {
        return Ok(rows);
    }
    let first = rows
        .iter()
        .rposition(|r| r.line <= block.start as f64)
        .unwrap_or(0);
    let last = rows
        .iter()
        .position(|r| r.line >= block.end as f64)
        .unwrap_or(rows.len() - 1);
    if first > last {
        return Err(SarError::Processing(format!(
            "Ground control rows are not ordered by line around block {}..{}",
            block.start, block.end
        )));
    }
    Ok(&rows[first..=last])
}

/// Pixel window of one hemisphere inside one row block
pub fn subset_window(
    rows: &[GcpRow],
    block: RowBlock,
    side: DatelineSide,
    dims: ImageDimensions,
) -> SarResult<SubsetWindow> {
    if dims.samples == 0 || dims.lines == 0 {
        return Err(SarError::Processing("Cannot window an empty image".to_string()));
    }
    let last_sample = dims.samples - 1;
    let last_line = dims.lines - 1;

    // representative column one grid cell inside the dateline, per row
    let columns: Vec<f64> = rows_for_block(rows, block)?
        .iter()
        .filter(|r| r.gcps.len() >= 2)
        .map(|r| {
            let mut pixels: Vec<f64> = r.gcps.iter().map(|g| g.pixel).collect();
            pixels.sort_by(|a, b| a.total_cmp(b));
            match side {
                DatelineSide::Left => pixels[1],
                DatelineSide::Right => pixels[pixels.len() - 2],
            }
        })
        .collect();

    let to_column = |p: f64| (p.max(0.0).round() as usize).min(last_sample);
    let (x1, x2) = match side {
        DatelineSide::Left => {
            let x1 = columns.iter().copied().reduce(f64::max).map(to_column).unwrap_or(0);
            (x1, last_sample)
        }
        DatelineSide::Right => {
            let x2 = columns
                .iter()
                .copied()
                .reduce(f64::min)
                .map(to_column)
                .unwrap_or(last_sample);
            (0, x2)
        }
    };

    let y2 = block.end.min(last_line);
    let y1 = block.start.min(y2);
    SubsetWindow::new(x1.min(x2), y1, x2, y2, dims)
}

/// Output location of a task; unique per window and hemisphere
pub fn task_output_path(output_dir: &Path, window: &SubsetWindow, hemisphere: Hemisphere) -> std::path::PathBuf {
    output_dir.join(format!(
        "subset_{}_{}_{}",
        window.tag(),
        hemisphere,
        TASK_OUTPUT_SUFFIX
    ))
}

/// Crossing detection and per-hemisphere task planning
pub struct AntemeridianSplitter {
    params: SplitterParams,
    ctx: LogContext,
}

impl AntemeridianSplitter {
    pub fn new(params: SplitterParams, ctx: LogContext) -> Self {
        Self { params, ctx }
    }

    pub fn params(&self) -> &SplitterParams {
        &self.params
    }

    pub fn is_crossing(&self, aoi: &[GeoPoint]) -> SarResult<bool> {
        let bbox = BoundingBox::from_points(aoi)?;
        let crossing = bbox.lon_span() > self.params.crossing_threshold_deg;
        log::info!(
            "{} Longitude span {:.3} deg ({:.3}..{:.3}), antemeridian crossing: {}",
            self.ctx,
            bbox.lon_span(),
            bbox.min_lon,
            bbox.max_lon,
            crossing
        );
        Ok(crossing)
    }

    /// Plan one task per hemisphere and row block, east first
    pub fn plan(
        &self,
        gcps: &[GroundControlPoint],
        dims: ImageDimensions,
        dems: &DemReferences,
        output_dir: &Path,
    ) -> SarResult<Vec<ProcessingTask>> {
        let group = partition_hemispheres(gcps);
        if !group.is_aligned() {
            return Err(SarError::Processing("Hemisphere rows are not aligned".to_string()));
        }
        log::info!(
            "{} Partitioned {} grid rows: {} east / {} west GCPs",
            self.ctx,
            group.row_count(),
            group.gcp_count(Hemisphere::East),
            group.gcp_count(Hemisphere::West)
        );

        let blocks = row_blocks(dims.lines, self.params.chunks, self.params.row_overlap);
        let mut tasks = Vec::with_capacity(blocks.len() * 2);

        for hemisphere in Hemisphere::ALL {
            let side = group.dateline_side(hemisphere);
            let rows = group.rows(hemisphere);
            if group.gcp_count(hemisphere) == 0 {
                log::warn!(
                    "{} No {} GCPs; using full-width windows",
                    self.ctx,
                    hemisphere
                );
            }

            for block in &blocks {
                let window = subset_window(rows, *block, side, dims)?;
                log::debug!(
                    "{} {} block {}..{} -> window {} ({:?})",
                    self.ctx,
                    hemisphere,
                    block.start,
                    block.end,
                    window.region(),
                    side
                );
                tasks.push(ProcessingTask {
                    hemisphere,
                    window: Some(window),
                    dem: dems.for_hemisphere(hemisphere).map(Path::to_path_buf),
                    output_path: task_output_path(output_dir, &window, hemisphere),
                });
            }
        }

        log::info!("{} Planned {} subset tasks", self.ctx, tasks.len());
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gcp(pixel: f64, line: f64, x: f64) -> GroundControlPoint {
        GroundControlPoint { pixel, line, x, y: -17.0, z: 0.0 }
    }

    #[test]
    fn test_row_blocks() {
        let blocks = row_blocks(100, 6, 10);
        // ceil(100 / 6) = 17
        assert_eq!(blocks.len(), 6);
        assert_eq!(blocks[0], RowBlock { start: 0, end: 27 });
        assert_eq!(blocks[1], RowBlock { start: 7, end: 44 });
        assert_eq!(blocks[5], RowBlock { start: 75, end: 99 });
        assert!(row_blocks(0, 6, 10).is_empty());
        assert_eq!(row_blocks(5, 6, 0), (0..5).map(|s| RowBlock { start: s, end: (s + 1).min(4) }).collect::<Vec<_>>());
    }

    #[test]
    fn test_partition_keeps_empty_rows() {
        let gcps = vec![
            gcp(0.0, 0.0, 179.0),
            gcp(10.0, 0.0, 179.5),
            gcp(0.0, 5.0, 179.2),
            gcp(10.0, 5.0, -179.9),
        ];
        let group = partition_hemispheres(&gcps);
        assert!(group.is_aligned());
        assert_eq!(group.row_count(), 2);
        assert!(group.west[0].gcps.is_empty());
        assert_eq!(group.west[0].line, 0.0);
        assert_eq!(group.west[1].gcps.len(), 1);
        assert_eq!(group.east[0].gcps.len(), 2);
    }

    #[test]
    fn test_dateline_side_inference() {
        let gcps = vec![gcp(0.0, 0.0, 179.0), gcp(50.0, 0.0, -179.0)];
        let group = partition_hemispheres(&gcps);
        assert_eq!(group.dateline_side(Hemisphere::West), DatelineSide::Left);
        assert_eq!(group.dateline_side(Hemisphere::East), DatelineSide::Right);

        let gcps = vec![gcp(0.0, 0.0, -179.0), gcp(50.0, 0.0, 179.0)];
        let group = partition_hemispheres(&gcps);
        assert_eq!(group.dateline_side(Hemisphere::West), DatelineSide::Right);

        let empty = HemisphereGroup::default();
        assert_eq!(empty.dateline_side(Hemisphere::West), DatelineSide::Left);
        assert_eq!(empty.dateline_side(Hemisphere::East), DatelineSide::Right);
    }

    #[test]
    fn test_right_side_window() {
        let dims = ImageDimensions { samples: 300, lines: 100 };
        let rows = vec![
            GcpRow { line: 0.0, gcps: vec![gcp(0.0, 0.0, 1.0), gcp(100.0, 0.0, 1.0), gcp(150.0, 0.0, 1.0)] },
            GcpRow { line: 50.0, gcps: vec![gcp(0.0, 50.0, 1.0), gcp(90.0, 50.0, 1.0), gcp(140.0, 50.0, 1.0)] },
        ];
        let window =
            subset_window(&rows, RowBlock { start: 0, end: 99 }, DatelineSide::Right, dims).unwrap();
        assert_eq!(window, SubsetWindow { x1: 0, y1: 0, x2: 90, y2: 99 });
    }

    #[test]
    fn test_block_brackets_rows() {
        let rows: Vec<GcpRow> = [0.0, 20.0, 40.0, 60.0]
            .iter()
            .map(|&line| GcpRow { line, gcps: vec![] })
            .collect();
        let picked = rows_for_block(&rows, RowBlock { start: 25, end: 45 }).unwrap();
        let lines: Vec<f64> = picked.iter().map(|r| r.line).collect();
        assert_eq!(lines, vec![20.0, 40.0, 60.0]);
    }

    #[test]
    fn test_inverted_blocks_and_rows_are_rejected() {
        let dims = ImageDimensions { samples: 100, lines: 100 };
        let rows: Vec<GcpRow> = [0.0, 20.0, 40.0, 60.0]
            .iter()
            .map(|&line| GcpRow { line, gcps: vec![] })
            .collect();
        let inverted = RowBlock { start: 45, end: 25 };
        assert!(matches!(rows_for_block(&rows, inverted), Err(SarError::Processing(_))));
        assert!(subset_window(&rows, inverted, DatelineSide::Left, dims).is_err());

        let mut unordered = rows.clone();
        unordered.reverse();
        assert!(matches!(
            rows_for_block(&unordered, RowBlock { start: 25, end: 45 }),
            Err(SarError::Processing(_))
        ));
    }
}
