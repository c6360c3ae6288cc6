//! Synthetic Sentinel-1 fixtures shared by the integration tests
#![allow(dead_code)]

use chrono::{Duration, NaiveDateTime};
use sardine_am::core::geometry::{normalize_longitude, PointTransform};
use sardine_am::types::{GroundControlPoint, SarResult, TiePoint};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const SAMPLES: usize = 1000;
pub const LINES: usize = 500;
pub const SPARSE_PIXELS: [f64; 6] = [0.0, 200.0, 400.0, 600.0, 800.0, 999.0];
pub const SPARSE_LINES: [f64; 5] = [0.0, 125.0, 250.0, 375.0, 499.0];

pub const PRODUCT_NAME: &str = "S1A_IW_GRDH_1SDV_20170328T063214_20170328T063239_015899_01A37D_9C4E";
pub const SCENE_NAME: &str = "S1A_IW_170328T063214_bnr_orb_cal_ml_tf_tc_db";

/// Western edge longitude of a scene that crosses the antemeridian
pub const CROSSING_LON: f64 = 179.01;
/// Western edge longitude of a scene well inside the eastern hemisphere
pub const EASTERN_LON: f64 = 170.0;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn start_time() -> NaiveDateTime {
    NaiveDateTime::parse_from_str("2017-03-28T06:32:14.123456", "%Y-%m-%dT%H:%M:%S%.f").unwrap()
}

/// Longitude before wrapping, linear in image position
pub fn raw_longitude(base_lon: f64, pixel: f64, line: f64) -> f64 {
    base_lon + pixel * 0.002 + line * 0.0004
}

pub fn latitude(pixel: f64, line: f64) -> f64 {
    -16.0 - line * 0.002 + pixel * 0.0001
}

pub fn sparse_points(base_lon: f64) -> Vec<TiePoint> {
    let t0 = start_time();
    let mut points = Vec::new();
    for &line in SPARSE_LINES.iter() {
        for &pixel in SPARSE_PIXELS.iter() {
            points.push(TiePoint {
                gcp: GroundControlPoint {
                    pixel,
                    line,
                    x: normalize_longitude(raw_longitude(base_lon, pixel, line)),
                    y: latitude(pixel, line),
                    z: 10.0 + pixel * 0.01,
                },
                azimuth_time: t0 + Duration::microseconds((line * 1500.0) as i64),
                slant_range_time: 5.3e-3 + pixel * 1e-7,
                incidence_angle: 30.0 + pixel * 0.015,
                elevation_angle: 27.0 + pixel * 0.013,
            });
        }
    }
    points
}

pub fn annotation_xml(polarisation: &str, points: &[TiePoint]) -> String {
    let mut grid = String::new();
    for p in points {
        grid.push_str(&format!(
            "      <geolocationGridPoint>\n\
             \x20       <azimuthTime>{}</azimuthTime>\n\
             \x20       <slantRangeTime>{:e}</slantRangeTime>\n\
             \x20       <line>{}</line>\n\
             \x20       <pixel>{}</pixel>\n\
             \x20       <latitude>{}</latitude>\n\
             \x20       <longitude>{}</longitude>\n\
             \x20       <height>{}</height>\n\
             \x20       <incidenceAngle>{}</incidenceAngle>\n\
             \x20       <elevationAngle>{}</elevationAngle>\n\
             \x20     </geolocationGridPoint>\n",
            p.azimuth_time.format("%Y-%m-%dT%H:%M:%S%.6f"),
            p.slant_range_time,
            p.gcp.line,
            p.gcp.pixel,
            p.gcp.y,
            p.gcp.x,
            p.gcp.z,
            p.incidence_angle,
            p.elevation_angle
        ));
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<product>
  <adsHeader>
    <missionId>S1A</missionId>
    <productType>GRD</productType>
    <polarisation>{pol}</polarisation>
    <mode>IW</mode>
    <swath>IW</swath>
    <startTime>2017-03-28T06:32:14.123456</startTime>
  </adsHeader>
  <imageAnnotation>
    <imageInformation>
      <rangePixelSpacing>1.000000e+01</rangePixelSpacing>
      <azimuthPixelSpacing>1.000000e+01</azimuthPixelSpacing>
      <numberOfSamples>{samples}</numberOfSamples>
      <numberOfLines>{lines}</numberOfLines>
    </imageInformation>
  </imageAnnotation>
  <geolocationGrid>
    <geolocationGridPointList count="{count}">
{grid}    </geolocationGridPointList>
  </geolocationGrid>
</product>
"#,
        pol = polarisation,
        samples = SAMPLES,
        lines = LINES,
        count = points.len(),
        grid = grid
    )
}

pub fn manifest_xml(base_lon: f64) -> String {
    let last_pixel = (SAMPLES - 1) as f64;
    let last_line = (LINES - 1) as f64;
    let corners = [(0.0, 0.0), (last_pixel, 0.0), (last_pixel, last_line), (0.0, last_line)];
    let coordinates: Vec<String> = corners
        .iter()
        .map(|&(p, l)| {
            format!(
                "{},{}",
                latitude(p, l),
                normalize_longitude(raw_longitude(base_lon, p, l))
            )
        })
        .collect();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<xfdu:XFDU xmlns:xfdu="urn:ccsds:schema:xfdu:1" xmlns:safe="http://www.esa.int/safe/sentinel-1.0" xmlns:s1sarl1="http://www.esa.int/safe/sentinel-1.0/sentinel-1/sar/level-1" xmlns:gml="http://www.opengis.net/gml">
  <metadataSection>
    <metadataObject ID="platform">
      <metadataWrap><xmlData>
        <safe:platform>
          <safe:familyName>SENTINEL-1</safe:familyName>
          <safe:number>A</safe:number>
          <safe:instrument>
            <safe:familyName abbreviation="SAR">Synthetic Aperture Radar</safe:familyName>
            <safe:extension>
              <s1sarl1:instrumentMode><s1sarl1:mode>IW</s1sarl1:mode></s1sarl1:instrumentMode>
            </safe:extension>
          </safe:instrument>
        </safe:platform>
      </xmlData></metadataWrap>
    </metadataObject>
    <metadataObject ID="generalProductInformation">
      <metadataWrap><xmlData>
        <s1sarl1:standAloneProductInformation>
          <s1sarl1:productType>GRD</s1sarl1:productType>
          <s1sarl1:transmitterReceiverPolarisation>VV</s1sarl1:transmitterReceiverPolarisation>
          <s1sarl1:transmitterReceiverPolarisation>VH</s1sarl1:transmitterReceiverPolarisation>
        </s1sarl1:standAloneProductInformation>
      </xmlData></metadataWrap>
    </metadataObject>
    <metadataObject ID="acquisitionPeriod">
      <metadataWrap><xmlData>
        <safe:acquisitionPeriod>
          <safe:startTime>2017-03-28T06:32:14.123456</safe:startTime>
        </safe:acquisitionPeriod>
      </xmlData></metadataWrap>
    </metadataObject>
    <metadataObject ID="measurementFrameSet">
      <metadataWrap><xmlData>
        <safe:frameSet><safe:frame><safe:footPrint srsName="http://www.opengis.net/gml/srs/epsg.xml#4326">
          <gml:coordinates>{}</gml:coordinates>
        </safe:footPrint></safe:frame></safe:frameSet>
      </xmlData></metadataWrap>
    </metadataObject>
  </metadataSection>
</xfdu:XFDU>
"#,
        coordinates.join(" ")
    )
}

pub fn annotation_name(polarisation: &str, index: usize) -> String {
    format!(
        "s1a-iw-grd-{}-20170328t063214-20170328t063239-015899-01a37d-{:03}.xml",
        polarisation.to_lowercase(),
        index
    )
}

/// Write a dual-polarization `.SAFE` directory and return its path
pub fn write_safe(dir: &Path, base_lon: f64) -> PathBuf {
    let root = dir.join(format!("{}.SAFE", PRODUCT_NAME));
    let annotation = root.join("annotation");
    std::fs::create_dir_all(annotation.join("calibration")).unwrap();
    std::fs::write(root.join("manifest.safe"), manifest_xml(base_lon)).unwrap();

    let points = sparse_points(base_lon);
    for (index, pol) in ["VH", "VV"].iter().enumerate() {
        std::fs::write(
            annotation.join(annotation_name(pol, index + 1)),
            annotation_xml(pol, &points),
        )
        .unwrap();
    }
    // calibration files share the naming pattern and must be ignored
    std::fs::write(
        annotation.join("calibration").join(format!("calibration-{}", annotation_name("vv", 1))),
        "<calibration/>",
    )
    .unwrap();
    root
}

pub const CENTRAL_MERIDIAN: f64 = 178.75;
pub const METERS_PER_DEGREE: f64 = 111_320.0;

/// Equirectangular projection centred on 178.75E; continuous across 180
pub struct ShiftedEquirectangular;

impl PointTransform for ShiftedEquirectangular {
    fn transform(&self, xs: &mut [f64], ys: &mut [f64], _zs: &mut [f64]) -> SarResult<()> {
        for (x, y) in xs.iter_mut().zip(ys.iter_mut()) {
            *x = normalize_longitude(*x - CENTRAL_MERIDIAN) * METERS_PER_DEGREE;
            *y *= METERS_PER_DEGREE;
        }
        Ok(())
    }
}

pub struct InverseShiftedEquirectangular;

impl PointTransform for InverseShiftedEquirectangular {
    fn transform(&self, xs: &mut [f64], ys: &mut [f64], _zs: &mut [f64]) -> SarResult<()> {
        for (x, y) in xs.iter_mut().zip(ys.iter_mut()) {
            *x = normalize_longitude(*x / METERS_PER_DEGREE + CENTRAL_MERIDIAN);
            *y /= METERS_PER_DEGREE;
        }
        Ok(())
    }
}

pub fn analytic_transforms() -> (Arc<dyn PointTransform>, Arc<dyn PointTransform>) {
    (Arc::new(ShiftedEquirectangular), Arc::new(InverseShiftedEquirectangular))
}

/// Regular ground control grid whose longitude wraps past 180
pub fn crossing_gcp_grid(columns: &[f64], rows: &[f64], base_lon: f64) -> Vec<GroundControlPoint> {
    let mut gcps = Vec::new();
    for &line in rows {
        for &pixel in columns {
            let raw = base_lon + pixel * 0.001;
            gcps.push(GroundControlPoint {
                pixel,
                line,
                x: if raw >= 180.0 { raw - 360.0 } else { raw },
                y: latitude(pixel, line),
                z: 0.0,
            });
        }
    }
    gcps
}
