use crate::types::{
    GroundControlPoint, ImageDimensions, Polarization, SarError, SarResult, TiePoint,
};
use chrono::NaiveDateTime;
use quick_xml::de::from_str;
use quick_xml::events::BytesText;
use quick_xml::Writer;
use serde::Deserialize;
use std::path::Path;

/// Timestamp layout used by Sentinel-1 annotation files
pub const ANNOTATION_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

const GRID_LIST_OPEN: &str = "<geolocationGridPointList";
const GRID_LIST_CLOSE: &str = "</geolocationGridPointList>";

/// Detailed annotation structures for Sentinel-1
/// This represents the root <product> element directly
#[derive(Debug, Deserialize)]
pub struct AnnotationRoot {
    #[serde(rename = "adsHeader")]
    pub ads_header: Option<AdsHeader>,
    #[serde(rename = "imageAnnotation")]
    pub image_annotation: Option<ImageAnnotation>,
    #[serde(rename = "geolocationGrid")]
    pub geolocation_grid: Option<GeolocationGrid>,
}

#[derive(Debug, Deserialize)]
pub struct AdsHeader {
    #[serde(rename = "missionId")]
    pub mission_id: Option<String>,
    #[serde(rename = "polarisation")]
    pub polarisation: Option<String>,
    #[serde(rename = "mode")]
    pub mode: Option<String>,
    #[serde(rename = "startTime")]
    pub start_time: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ImageAnnotation {
    #[serde(rename = "imageInformation")]
    pub image_information: ImageInformation,
}

#[derive(Debug, Deserialize)]
pub struct ImageInformation {
    #[serde(rename = "rangePixelSpacing")]
    pub range_pixel_spacing: f64,
    #[serde(rename = "azimuthPixelSpacing")]
    pub azimuth_pixel_spacing: f64,
    #[serde(rename = "numberOfSamples")]
    pub number_of_samples: usize,
    #[serde(rename = "numberOfLines")]
    pub number_of_lines: usize,
}

/// Geolocation grid for geographic coordinate extraction
#[derive(Debug, Deserialize)]
pub struct GeolocationGrid {
    #[serde(rename = "geolocationGridPointList")]
    pub geolocation_grid_point_list: GeolocationGridPointList,
}

#[derive(Debug, Deserialize)]
pub struct GeolocationGridPointList {
    #[serde(rename = "@count")]
    pub count: Option<usize>,
    #[serde(rename = "geolocationGridPoint", default)]
    pub geolocation_grid_points: Vec<GeolocationGridPoint>,
}

#[derive(Debug, Deserialize)]
pub struct GeolocationGridPoint {
    #[serde(rename = "azimuthTime")]
    pub azimuth_time: String,
    #[serde(rename = "slantRangeTime")]
    pub slant_range_time: f64,
    #[serde(rename = "line")]
    pub line: f64,
    #[serde(rename = "pixel")]
    pub pixel: f64,
    #[serde(rename = "latitude")]
    pub latitude: f64,
    #[serde(rename = "longitude")]
    pub longitude: f64,
    #[serde(rename = "height")]
    pub height: f64,
    #[serde(rename = "incidenceAngle")]
    pub incidence_angle: f64,
    #[serde(rename = "elevationAngle")]
    pub elevation_angle: f64,
}

/// Sparse geolocation grid of one annotation file
#[derive(Debug, Clone)]
pub struct TiePointGrid {
    pub mission_id: Option<String>,
    pub polarization: Option<Polarization>,
    pub mode: Option<String>,
    pub start_time: Option<NaiveDateTime>,
    pub dimensions: ImageDimensions,
    pub pixel_spacing: (f64, f64), // (range, azimuth) in meters
    /// Grid points in annotation order (line-major, pixel ascending)
    pub points: Vec<TiePoint>,
}

/// Reader/writer for the geolocation grid of Sentinel-1 annotation files
pub struct TiePointGridReader;

impl TiePointGridReader {
    /// Read the tie-point grid of an annotation file
    pub fn read<P: AsRef<Path>>(path: P) -> SarResult<TiePointGrid> {
        log::debug!("Reading geolocation grid from {}", path.as_ref().display());
        let xml = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SarError::Parse(format!("Cannot read annotation {}: {}", path.as_ref().display(), e))
        })?;
        Self::parse(&xml)
    }

    /// Parse annotation XML content
    pub fn parse(xml_content: &str) -> SarResult<TiePointGrid> {
        let root = from_str::<AnnotationRoot>(xml_content)
            .map_err(|e| SarError::Parse(format!("Failed to parse annotation XML: {}", e)))?;

        let image_info = root
            .image_annotation
            .map(|ia| ia.image_information)
            .ok_or_else(|| SarError::Parse("Annotation has no imageInformation".to_string()))?;

        if image_info.number_of_samples == 0 || image_info.number_of_lines == 0 {
            return Err(SarError::Parse(format!(
                "Invalid image dimensions {}x{}",
                image_info.number_of_samples, image_info.number_of_lines
            )));
        }

        let grid_list = root
            .geolocation_grid
            .map(|g| g.geolocation_grid_point_list)
            .ok_or_else(|| SarError::Parse("Annotation has no geolocationGrid".to_string()))?;

        if let Some(count) = grid_list.count {
            if count != grid_list.geolocation_grid_points.len() {
                log::warn!(
                    "geolocationGridPointList count attribute {} disagrees with {} parsed points",
                    count,
                    grid_list.geolocation_grid_points.len()
                );
            }
        }

        let points = grid_list
            .geolocation_grid_points
            .iter()
            .map(|pt| {
                Ok(TiePoint {
                    gcp: GroundControlPoint {
                        pixel: pt.pixel,
                        line: pt.line,
                        x: pt.longitude,
                        y: pt.latitude,
                        z: pt.height,
                    },
                    azimuth_time: parse_annotation_time(&pt.azimuth_time)?,
                    slant_range_time: pt.slant_range_time,
                    incidence_angle: pt.incidence_angle,
                    elevation_angle: pt.elevation_angle,
                })
            })
            .collect::<SarResult<Vec<_>>>()?;

        let header = root.ads_header;
        let polarization = header
            .as_ref()
            .and_then(|h| h.polarisation.as_deref())
            .and_then(|p| p.parse::<Polarization>().ok());
        let start_time = match header.as_ref().and_then(|h| h.start_time.as_deref()) {
            Some(t) => Some(parse_annotation_time(t)?),
            None => None,
        };

        Ok(TiePointGrid {
            mission_id: header.as_ref().and_then(|h| h.mission_id.clone()),
            polarization,
            mode: header.as_ref().and_then(|h| h.mode.clone()),
            start_time,
            dimensions: ImageDimensions {
                samples: image_info.number_of_samples,
                lines: image_info.number_of_lines,
            },
            pixel_spacing: (image_info.range_pixel_spacing, image_info.azimuth_pixel_spacing),
            points,
        })
    }

    /// Replace the geolocation grid of an annotation file with `points`.
    ///
    /// Only the `geolocationGridPointList` element is rewritten; the rest of the
    /// document is preserved byte for byte.
    pub fn write_grid<P: AsRef<Path>>(path: P, points: &[TiePoint]) -> SarResult<()> {
        let xml = std::fs::read_to_string(path.as_ref())?;
        let updated = Self::replace_grid(&xml, points)?;
        std::fs::write(path.as_ref(), updated)?;
        log::info!(
            "Wrote {} geolocation grid points to {}",
            points.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    /// Splice a regenerated grid point list into annotation XML content
    pub fn replace_grid(xml_content: &str, points: &[TiePoint]) -> SarResult<String> {
        let start = xml_content
            .find(GRID_LIST_OPEN)
            .ok_or_else(|| SarError::Parse("Annotation has no geolocationGridPointList".to_string()))?;
        let end = xml_content[start..]
            .find(GRID_LIST_CLOSE)
            .map(|offset| start + offset + GRID_LIST_CLOSE.len())
            .ok_or_else(|| {
                SarError::Parse("Unterminated geolocationGridPointList element".to_string())
            })?;

        let block = Self::render_grid(points)?;

        let mut updated = String::with_capacity(xml_content.len() + block.len());
        updated.push_str(&xml_content[..start]);
        updated.push_str(&block);
        updated.push_str(&xml_content[end..]);
        Ok(updated)
    }

    fn render_grid(points: &[TiePoint]) -> SarResult<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        let count = points.len().to_string();

        writer
            .create_element("geolocationGridPointList")
            .with_attribute(("count", count.as_str()))
            .write_inner_content(|w| {
                for pt in points {
                    let fields = [
                        ("azimuthTime", format_annotation_time(&pt.azimuth_time)),
                        ("slantRangeTime", format!("{:e}", pt.slant_range_time)),
                        ("line", format!("{}", pt.gcp.line.round() as i64)),
                        ("pixel", format!("{}", pt.gcp.pixel.round() as i64)),
                        ("latitude", format!("{}", pt.gcp.y)),
                        ("longitude", format!("{}", pt.gcp.x)),
                        ("height", format!("{}", pt.gcp.z)),
                        ("incidenceAngle", format!("{}", pt.incidence_angle)),
                        ("elevationAngle", format!("{}", pt.elevation_angle)),
                    ];
                    w.create_element("geolocationGridPoint").write_inner_content(|w| {
                        for (name, value) in fields.iter() {
                            w.create_element(*name)
                                .write_text_content(BytesText::new(value))?;
                        }
                        Ok::<(), quick_xml::Error>(())
                    })?;
                }
                Ok::<(), quick_xml::Error>(())
            })
            .map_err(|e| SarError::Parse(format!("Failed to render geolocation grid: {}", e)))?;

        String::from_utf8(writer.into_inner())
            .map_err(|e| SarError::Parse(format!("Rendered grid is not UTF-8: {}", e)))
    }
}

pub fn parse_annotation_time(value: &str) -> SarResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value.trim().trim_end_matches('Z'), ANNOTATION_TIME_FORMAT)
        .map_err(|e| SarError::Parse(format!("Invalid annotation time '{}': {}", value, e)))
}

pub fn format_annotation_time(time: &NaiveDateTime) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<product>
  <adsHeader>
    <missionId>S1A</missionId>
    <polarisation>VV</polarisation>
    <mode>IW</mode>
    <startTime>2017-03-28T06:32:14.123456</startTime>
  </adsHeader>
  <imageAnnotation>
    <imageInformation>
      <rangePixelSpacing>1.000000e+01</rangePixelSpacing>
      <azimuthPixelSpacing>1.000000e+01</azimuthPixelSpacing>
      <numberOfSamples>200</numberOfSamples>
      <numberOfLines>100</numberOfLines>
    </imageInformation>
  </imageAnnotation>
  <geolocationGrid>
    <geolocationGridPointList count="2">
      <geolocationGridPoint>
        <azimuthTime>2017-03-28T06:32:14.123456</azimuthTime>
        <slantRangeTime>5.3e-03</slantRangeTime>
        <line>0</line>
        <pixel>0</pixel>
        <latitude>-16.5</latitude>
        <longitude>179.9</longitude>
        <height>12.5</height>
        <incidenceAngle>30.1</incidenceAngle>
        <elevationAngle>27.2</elevationAngle>
      </geolocationGridPoint>
      <geolocationGridPoint>
        <azimuthTime>2017-03-28T06:32:14.623456</azimuthTime>
        <slantRangeTime>5.4e-03</slantRangeTime>
        <line>0</line>
        <pixel>199</pixel>
        <latitude>-16.4</latitude>
        <longitude>-179.9</longitude>
        <height>0.0</height>
        <incidenceAngle>45.9</incidenceAngle>
        <elevationAngle>40.1</elevationAngle>
      </geolocationGridPoint>
    </geolocationGridPointList>
  </geolocationGrid>
  <trailer>kept</trailer>
</product>
"#;

    #[test]
    fn test_parse_geolocation_grid() {
        let grid = TiePointGridReader::parse(SAMPLE).unwrap();
        assert_eq!(grid.dimensions, ImageDimensions { samples: 200, lines: 100 });
        assert_eq!(grid.polarization, Some(Polarization::VV));
        assert_eq!(grid.mission_id.as_deref(), Some("S1A"));
        assert_eq!(grid.points.len(), 2);

        let second = &grid.points[1];
        assert_eq!(second.gcp.pixel, 199.0);
        assert_eq!(second.gcp.x, -179.9);
        assert_eq!(second.gcp.y, -16.4);
        assert_eq!(second.incidence_angle, 45.9);
        assert_eq!(format_annotation_time(&second.azimuth_time), "2017-03-28T06:32:14.623456");
    }

    #[test]
    fn test_missing_grid_is_parse_error() {
        let xml = "<product><imageAnnotation><imageInformation><rangePixelSpacing>1</rangePixelSpacing>\
                   <azimuthPixelSpacing>1</azimuthPixelSpacing><numberOfSamples>10</numberOfSamples>\
                   <numberOfLines>10</numberOfLines></imageInformation></imageAnnotation></product>";
        assert!(matches!(TiePointGridReader::parse(xml), Err(SarError::Parse(_))));
        assert!(matches!(TiePointGridReader::parse("<product>"), Err(SarError::Parse(_))));
    }

    #[test]
    fn test_replace_grid_preserves_document() {
        let grid = TiePointGridReader::parse(SAMPLE).unwrap();
        let mut points = grid.points.clone();
        points.push(TiePoint {
            gcp: GroundControlPoint { pixel: 100.0, line: 50.0, x: 179.99, y: -16.45, z: 3.0 },
            ..grid.points[0].clone()
        });

        let updated = TiePointGridReader::replace_grid(SAMPLE, &points).unwrap();
        assert!(updated.contains("count=\"3\""));
        assert!(updated.contains("<trailer>kept</trailer>"));
        assert!(updated.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));

        let reparsed = TiePointGridReader::parse(&updated).unwrap();
        assert_eq!(reparsed.points.len(), 3);
        assert_eq!(reparsed.points[2].gcp.pixel, 100.0);
        assert_eq!(reparsed.points[2].gcp.x, 179.99);
        assert_eq!(reparsed.points[1].slant_range_time, 5.4e-3);
    }
}
