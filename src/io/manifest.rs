use crate::types::{AcquisitionMode, GeoPoint, Polarization, SarError, SarResult};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::path::Path;

/// Scene identity and footprint from `manifest.safe`
#[derive(Debug, Clone)]
pub struct ManifestInfo {
    /// Mission family, e.g. "SENTINEL-1"
    pub mission: String,
    /// Satellite unit, e.g. "A"
    pub platform: String,
    pub mode: AcquisitionMode,
    pub start_time: DateTime<Utc>,
    /// Footprint corners in manifest order
    pub footprint: Vec<GeoPoint>,
    /// Transmit/receive polarizations of the product, empty when not listed
    pub polarizations: Vec<Polarization>,
}

pub struct ManifestReader;

impl ManifestReader {
    pub fn read<P: AsRef<Path>>(path: P) -> SarResult<ManifestInfo> {
        log::debug!("Reading manifest {}", path.as_ref().display());
        let xml = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SarError::Parse(format!("Cannot read manifest {}: {}", path.as_ref().display(), e))
        })?;
        Self::parse(&xml)
    }

    /// Parse manifest XML.
    ///
    /// Elements are matched by local name and by their parent, since the
    /// instrument block reuses `familyName`.
    pub fn parse(xml_content: &str) -> SarResult<ManifestInfo> {
        let mut reader = Reader::from_str(xml_content);
        reader.trim_text(true);

        let mut stack: Vec<String> = Vec::new();
        let mut mission = None;
        let mut platform = None;
        let mut mode = None;
        let mut start_time = None;
        let mut coordinates = None;
        let mut polarizations: Vec<Polarization> = Vec::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    stack.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                }
                Ok(Event::End(_)) => {
                    stack.pop();
                }
                Ok(Event::Text(t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| SarError::Parse(format!("Bad manifest text: {}", e)))?
                        .into_owned();
                    let current = stack.last().map(String::as_str);
                    let parent = stack.len().checked_sub(2).map(|i| stack[i].as_str());

                    match (current, parent) {
                        (Some("familyName"), Some("platform")) if mission.is_none() => {
                            mission = Some(text)
                        }
                        (Some("number"), Some("platform")) if platform.is_none() => {
                            platform = Some(text)
                        }
                        (Some("mode"), _) if mode.is_none() => mode = Some(text),
                        (Some("startTime"), Some("acquisitionPeriod")) if start_time.is_none() => {
                            start_time = Some(text)
                        }
                        (Some("coordinates"), _)
                            if coordinates.is_none()
                                && stack.iter().any(|name| name == "footPrint") =>
                        {
                            coordinates = Some(text)
                        }
                        (Some("transmitterReceiverPolarisation"), _) => {
                            let polarization: Polarization = text.parse().map_err(|_| {
                                SarError::Parse(format!("Unknown manifest polarisation '{}'", text))
                            })?;
                            if !polarizations.contains(&polarization) {
                                polarizations.push(polarization);
                            }
                        }
                        _ => {}
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(SarError::Parse(format!(
                        "Manifest XML error at position {}: {}",
                        reader.buffer_position(),
                        e
                    )))
                }
            }
        }

        let missing = |what: &str| SarError::Parse(format!("Manifest has no {}", what));

        let footprint = parse_footprint(&coordinates.ok_or_else(|| missing("footprint"))?)?;
        let start_time = parse_manifest_time(&start_time.ok_or_else(|| missing("start time"))?)?;
        let mode = mode.ok_or_else(|| missing("instrument mode"))?.parse()?;

        Ok(ManifestInfo {
            mission: mission.ok_or_else(|| missing("platform family name"))?,
            platform: platform.ok_or_else(|| missing("platform number"))?,
            mode,
            start_time,
            footprint,
            polarizations,
        })
    }
}

/// Parse a GML coordinate list of whitespace-separated `lat,lon` pairs
pub fn parse_footprint(coordinates: &str) -> SarResult<Vec<GeoPoint>> {
    let points = coordinates
        .split_whitespace()
        .map(|pair| {
            let (lat, lon) = pair
                .split_once(',')
                .ok_or_else(|| SarError::Parse(format!("Malformed footprint pair '{}'", pair)))?;
            let parse = |v: &str| {
                v.trim()
                    .parse::<f64>()
                    .map_err(|e| SarError::Parse(format!("Bad footprint value '{}': {}", v, e)))
            };
            Ok(GeoPoint { lat: parse(lat)?, lon: parse(lon)? })
        })
        .collect::<SarResult<Vec<_>>>()?;

    if points.len() < 3 {
        return Err(SarError::Parse(format!(
            "Footprint needs at least 3 corners, found {}",
            points.len()
        )));
    }
    Ok(points)
}

fn parse_manifest_time(value: &str) -> SarResult<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(value.trim().trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|e| SarError::Parse(format!("Invalid manifest time '{}': {}", value, e)))?;
    Ok(Utc.from_utc_datetime(&naive))
}
