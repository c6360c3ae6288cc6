//! Processing graph model for the external radar engine
//!
//! A graph is an ordered chain of operator nodes. Every node except the first
//! names exactly one source, an earlier node's id. Parameters of the operators
//! the pipeline edits are typed; all other operators keep their parameters as
//! an ordered name/value list.

use crate::types::{SarError, SarResult, SubsetWindow};
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Built-in recipe: border noise removal, orbit, beta0 calibration, multilook,
/// terrain flattening, terrain correction and dB conversion
pub const BASE_GRAPH_XML: &str = include_str!("recipes/base_graph.xml");

const PARAMETERS_CLASS: &str = "com.bc.ceres.binding.dom.XppDomElement";

pub const READ_OPERATOR: &str = "Read";
pub const SUBSET_OPERATOR: &str = "Subset";
pub const CALIBRATION_OPERATOR: &str = "Calibration";
pub const TERRAIN_FLATTENING_OPERATOR: &str = "Terrain-Flattening";
pub const TERRAIN_CORRECTION_OPERATOR: &str = "Terrain-Correction";
pub const DB_CONVERSION_OPERATOR: &str = "LinearToFromdB";
pub const WRITE_OPERATOR: &str = "Write";

/// Ordered name/value parameter list; empty values serialize as empty elements
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet(Vec<(String, String)>);

impl ParameterSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// Replace a value in place, or append a new entry
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self.0.iter().position(|(k, _)| k == name)?;
        Some(self.0.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn take_non_empty(&mut self, name: &str) -> Option<String> {
        self.remove(name).filter(|v| !v.trim().is_empty())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ParameterSet {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

fn parse_bool(operator: &str, name: &str, value: &str) -> SarResult<bool> {
    match value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(SarError::Graph(format!(
            "{}: parameter {} expects true/false, got '{}'",
            operator, name, other
        ))),
    }
}

/// Read operator: `file` is required at execution time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadParameters {
    pub file: Option<PathBuf>,
    pub format_name: Option<String>,
    pub extra: ParameterSet,
}

/// Subset operator: pixel `region` or `geoRegion`, at least one required
#[derive(Debug, Clone, PartialEq)]
pub struct SubsetParameters {
    pub region: Option<String>,
    pub geo_region: Option<String>,
    pub copy_metadata: bool,
    pub extra: ParameterSet,
}

impl Default for SubsetParameters {
    fn default() -> Self {
        Self {
            region: None,
            geo_region: None,
            copy_metadata: true,
            extra: ParameterSet::new(),
        }
    }
}

/// Terrain-Flattening and Terrain-Correction share their DEM options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DemParameters {
    pub dem_name: Option<String>,
    pub external_dem_file: Option<PathBuf>,
    pub extra: ParameterSet,
}

/// Write operator: `file` is required at execution time
#[derive(Debug, Clone, PartialEq)]
pub struct WriteParameters {
    pub file: Option<PathBuf>,
    pub format_name: String,
    pub extra: ParameterSet,
}

impl Default for WriteParameters {
    fn default() -> Self {
        Self {
            file: None,
            format_name: "BEAM-DIMAP".to_string(),
            extra: ParameterSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorParameters {
    Read(ReadParameters),
    Subset(SubsetParameters),
    TerrainFlattening(DemParameters),
    TerrainCorrection(DemParameters),
    Write(WriteParameters),
    Generic(ParameterSet),
}

impl OperatorParameters {
    /// Interpret a raw parameter list according to the operator's schema
    pub fn from_parameter_set(operator: &str, mut set: ParameterSet) -> SarResult<Self> {
        Ok(match operator {
            READ_OPERATOR => OperatorParameters::Read(ReadParameters {
                file: set.take_non_empty("file").map(PathBuf::from),
                format_name: set.take_non_empty("formatName"),
                extra: set,
            }),
            SUBSET_OPERATOR => {
                let copy_metadata = match set.remove("copyMetadata") {
                    Some(v) if !v.trim().is_empty() => parse_bool(operator, "copyMetadata", &v)?,
                    _ => true,
                };
                OperatorParameters::Subset(SubsetParameters {
                    region: set.take_non_empty("region"),
                    geo_region: set.take_non_empty("geoRegion"),
                    copy_metadata,
                    extra: set,
                })
            }
            TERRAIN_FLATTENING_OPERATOR | TERRAIN_CORRECTION_OPERATOR => {
                let dem = DemParameters {
                    dem_name: set.take_non_empty("demName"),
                    external_dem_file: set.take_non_empty("externalDEMFile").map(PathBuf::from),
                    extra: set,
                };
                if operator == TERRAIN_FLATTENING_OPERATOR {
                    OperatorParameters::TerrainFlattening(dem)
                } else {
                    OperatorParameters::TerrainCorrection(dem)
                }
            }
            WRITE_OPERATOR => OperatorParameters::Write(WriteParameters {
                file: set.take_non_empty("file").map(PathBuf::from),
                format_name: set
                    .take_non_empty("formatName")
                    .unwrap_or_else(|| WriteParameters::default().format_name),
                extra: set,
            }),
            _ => OperatorParameters::Generic(set),
        })
    }

    /// Flatten back to an ordered list; schema fields come first
    pub fn to_parameter_set(&self) -> ParameterSet {
        let path_value = |p: &Option<PathBuf>| {
            p.as_ref().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default()
        };
        let mut set = ParameterSet::new();
        let extra = match self {
            OperatorParameters::Read(p) => {
                set.set("file", path_value(&p.file));
                set.set("formatName", p.format_name.clone().unwrap_or_default());
                &p.extra
            }
            OperatorParameters::Subset(p) => {
                set.set("region", p.region.clone().unwrap_or_default());
                set.set("geoRegion", p.geo_region.clone().unwrap_or_default());
                set.set("copyMetadata", p.copy_metadata.to_string());
                &p.extra
            }
            OperatorParameters::TerrainFlattening(p) | OperatorParameters::TerrainCorrection(p) => {
                set.set("demName", p.dem_name.clone().unwrap_or_default());
                set.set("externalDEMFile", path_value(&p.external_dem_file));
                &p.extra
            }
            OperatorParameters::Write(p) => {
                set.set("file", path_value(&p.file));
                set.set("formatName", p.format_name.clone());
                &p.extra
            }
            OperatorParameters::Generic(p) => p,
        };
        for (k, v) in extra.iter() {
            set.set(k, v);
        }
        set
    }

    /// Check fields that must be set before the graph can run
    pub fn check_required(&self, node_id: &str) -> SarResult<()> {
        let missing = |what: &str| {
            Err(SarError::Graph(format!("Node {} is missing required parameter {}", node_id, what)))
        };
        match self {
            OperatorParameters::Read(p) if p.file.is_none() => missing("file"),
            OperatorParameters::Write(p) if p.file.is_none() => missing("file"),
            OperatorParameters::Write(p) if p.format_name.trim().is_empty() => missing("formatName"),
            OperatorParameters::Subset(p) if p.region.is_none() && p.geo_region.is_none() => {
                missing("region or geoRegion")
            }
            _ => Ok(()),
        }
    }
}

/// One operator invocation in the chain
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub id: String,
    pub operator: String,
    pub source: Option<String>,
    pub parameters: OperatorParameters,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, operator: impl Into<String>, parameters: ParameterSet) -> SarResult<Self> {
        let operator = operator.into();
        let parameters = OperatorParameters::from_parameter_set(&operator, parameters)?;
        Ok(Self { id: id.into(), operator, source: None, parameters })
    }

    /// Pixel subset node for a window
    pub fn subset(window: &SubsetWindow) -> Self {
        let mut extra = ParameterSet::new();
        extra.set("sourceBands", "");
        extra.set("subSamplingX", "1");
        extra.set("subSamplingY", "1");
        extra.set("fullSwath", "false");
        extra.set("tiePointGrids", "");
        Self {
            id: SUBSET_OPERATOR.to_string(),
            operator: SUBSET_OPERATOR.to_string(),
            source: None,
            parameters: OperatorParameters::Subset(SubsetParameters {
                region: Some(window.region()),
                geo_region: None,
                copy_metadata: true,
                extra,
            }),
        }
    }
}

/// Ordered operator chain in the engine's graph format
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingGraph {
    pub id: String,
    pub version: String,
    pub nodes: Vec<GraphNode>,
}

impl ProcessingGraph {
    /// The embedded recipe
    pub fn base() -> SarResult<Self> {
        Self::from_xml(BASE_GRAPH_XML)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> SarResult<Self> {
        log::debug!("Loading graph template {}", path.as_ref().display());
        let xml = std::fs::read_to_string(path.as_ref())?;
        Self::from_xml(&xml)
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// First node running `operator`
    pub fn node_by_operator(&self, operator: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.operator == operator)
    }

    pub fn node_by_operator_mut(&mut self, operator: &str) -> Option<&mut GraphNode> {
        self.nodes.iter_mut().find(|n| n.operator == operator)
    }

    /// New graph with `node` placed right after `predecessor_id` and every
    /// source rewritten to the preceding node
    pub fn insert_after(&self, predecessor_id: &str, node: GraphNode) -> SarResult<Self> {
        let index = self
            .nodes
            .iter()
            .position(|n| n.id == predecessor_id)
            .ok_or_else(|| SarError::Graph(format!("No node with id {}", predecessor_id)))?;
        self.insert_at(index + 1, node)
    }

    /// New graph with `node` appended at the end of the chain
    pub fn append(&self, node: GraphNode) -> SarResult<Self> {
        self.insert_at(self.nodes.len(), node)
    }

    /// New graph without node `id`; its successor takes over its source
    pub fn remove(&self, id: &str) -> SarResult<Self> {
        let index = self
            .nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| SarError::Graph(format!("No node with id {}", id)))?;
        if self.nodes.len() == 1 {
            return Err(SarError::Graph(format!("Removing {} would leave an empty graph", id)));
        }
        let mut nodes = self.nodes.clone();
        nodes.remove(index);
        relink(&mut nodes);
        Ok(Self { id: self.id.clone(), version: self.version.clone(), nodes })
    }

    /// Variant of this chain that writes only the terrain-correction
    /// layover/shadow mask: dB conversion is dropped and the corrected
    /// source bands are not saved
    pub fn layover_shadow_mask(&self) -> SarResult<Self> {
        let mut graph = self.clone();
        let conversions: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| n.operator == DB_CONVERSION_OPERATOR)
            .map(|n| n.id.clone())
            .collect();
        for id in &conversions {
            graph = graph.remove(id)?;
        }

        let correction = graph
            .node_by_operator_mut(TERRAIN_CORRECTION_OPERATOR)
            .ok_or_else(|| SarError::Graph("Template has no Terrain-Correction node".to_string()))?;
        match &mut correction.parameters {
            OperatorParameters::TerrainCorrection(p) => {
                p.extra.set("saveLayoverShadowMask", "true");
                p.extra.set("saveSelectedSourceBand", "false");
            }
            other => {
                return Err(SarError::Graph(format!(
                    "Node {} carries unexpected parameters {:?}",
                    correction.id, other
                )))
            }
        }
        Ok(graph)
    }

    fn insert_at(&self, index: usize, node: GraphNode) -> SarResult<Self> {
        if self.node(&node.id).is_some() {
            return Err(SarError::Graph(format!("Duplicate node id {}", node.id)));
        }
        let mut nodes = self.nodes.clone();
        nodes.insert(index, node);
        relink(&mut nodes);
        Ok(Self { id: self.id.clone(), version: self.version.clone(), nodes })
    }

    /// Structural checks: unique ids, a source-less head and back-references only
    pub fn validate(&self) -> SarResult<()> {
        if self.nodes.is_empty() {
            return Err(SarError::Graph("Graph has no nodes".to_string()));
        }
        let mut seen = HashSet::new();
        for (i, node) in self.nodes.iter().enumerate() {
            match (&node.source, i) {
                (Some(source), 0) => {
                    return Err(SarError::Graph(format!(
                        "First node {} must not have a source (found {})",
                        node.id, source
                    )))
                }
                (None, i) if i > 0 => {
                    return Err(SarError::Graph(format!("Node {} has no source", node.id)))
                }
                (Some(source), _) if !seen.contains(source.as_str()) => {
                    return Err(SarError::Graph(format!(
                        "Node {} refers to {} which is not an earlier node",
                        node.id, source
                    )))
                }
                _ => {}
            }
            if !seen.insert(node.id.as_str()) {
                return Err(SarError::Graph(format!("Duplicate node id {}", node.id)));
            }
        }
        Ok(())
    }

    /// Structure plus required operator parameters
    pub fn validate_for_execution(&self) -> SarResult<()> {
        self.validate()?;
        for node in &self.nodes {
            node.parameters.check_required(&node.id)?;
        }
        Ok(())
    }

    pub fn from_xml(xml: &str) -> SarResult<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        loop {
            match reader.read_event().map_err(xml_error)? {
                Event::Start(e) if e.local_name().as_ref() == b"graph" => {
                    let id = attribute(&e, "id")?.unwrap_or_else(|| "Graph".to_string());
                    let graph = read_graph(&mut reader, id)?;
                    graph.validate()?;
                    return Ok(graph);
                }
                Event::Eof => return Err(SarError::Graph("No <graph> element".to_string())),
                _ => {}
            }
        }
    }

    pub fn to_xml(&self) -> SarResult<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .create_element("graph")
            .with_attribute(("id", self.id.as_str()))
            .write_inner_content(|w| {
                w.create_element("version")
                    .write_text_content(BytesText::new(&self.version))?;
                for node in &self.nodes {
                    write_node(w, node)?;
                }
                Ok(())
            })
            .map_err(xml_error)?;

        String::from_utf8(writer.into_inner())
            .map_err(|e| SarError::Graph(format!("Serialized graph is not UTF-8: {}", e)))
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> SarResult<()> {
        std::fs::write(path.as_ref(), self.to_xml()?)?;
        Ok(())
    }
}

fn relink(nodes: &mut [GraphNode]) {
    let mut previous: Option<String> = None;
    for node in nodes.iter_mut() {
        node.source = previous.take();
        previous = Some(node.id.clone());
    }
}

fn xml_error(e: quick_xml::Error) -> SarError {
    SarError::Graph(format!("Graph XML error: {}", e))
}

fn attribute(e: &BytesStart, name: &str) -> SarResult<Option<String>> {
    let attr = e
        .try_get_attribute(name)
        .map_err(|err| SarError::Graph(format!("Bad attribute {}: {}", name, err)))?;
    match attr {
        Some(a) => Ok(Some(a.unescape_value().map_err(xml_error)?.into_owned())),
        None => Ok(None),
    }
}

fn local_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

/// Text content up to the closing tag; nested elements are rejected
fn read_text(reader: &mut Reader<&[u8]>, end: &str) -> SarResult<String> {
    let mut text = String::new();
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Text(t) => text.push_str(&t.unescape().map_err(xml_error)?),
            Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c.into_inner())),
            Event::End(e) if e.local_name().as_ref() == end.as_bytes() => return Ok(text),
            Event::Start(e) | Event::Empty(e) => {
                return Err(SarError::Graph(format!(
                    "Unsupported nested element <{}> inside <{}>",
                    local_name(&e),
                    end
                )))
            }
            Event::Eof => return Err(SarError::Graph(format!("Unterminated <{}>", end))),
            _ => {}
        }
    }
}

fn read_graph(reader: &mut Reader<&[u8]>, id: String) -> SarResult<ProcessingGraph> {
    let mut version = "1.0".to_string();
    let mut nodes = Vec::new();

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"version" => version = read_text(reader, "version")?,
                b"node" => {
                    let node_id = attribute(&e, "id")?
                        .ok_or_else(|| SarError::Graph("Node without id".to_string()))?;
                    nodes.push(read_node(reader, node_id)?);
                }
                // presentation data and other extensions are dropped
                _ => {
                    reader.read_to_end(e.name()).map_err(xml_error)?;
                }
            },
            Event::End(e) if e.local_name().as_ref() == b"graph" => break,
            Event::Eof => return Err(SarError::Graph("Unterminated <graph>".to_string())),
            _ => {}
        }
    }

    Ok(ProcessingGraph { id, version, nodes })
}

fn read_node(reader: &mut Reader<&[u8]>, id: String) -> SarResult<GraphNode> {
    let mut operator = None;
    let mut sources: Vec<String> = Vec::new();
    let mut parameters = ParameterSet::new();

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"operator" => operator = Some(read_text(reader, "operator")?),
                b"sources" => sources = read_sources(reader)?,
                b"parameters" => parameters = read_parameters(reader)?,
                _ => {
                    reader.read_to_end(e.name()).map_err(xml_error)?;
                }
            },
            Event::End(e) if e.local_name().as_ref() == b"node" => break,
            Event::Eof => return Err(SarError::Graph(format!("Unterminated node {}", id))),
            _ => {}
        }
    }

    let operator = operator.ok_or_else(|| SarError::Graph(format!("Node {} has no operator", id)))?;
    if sources.len() > 1 {
        return Err(SarError::Graph(format!(
            "Node {} has {} sources; only linear chains are supported",
            id,
            sources.len()
        )));
    }

    let parameters = OperatorParameters::from_parameter_set(&operator, parameters)?;
    Ok(GraphNode { id, operator, source: sources.pop(), parameters })
}

fn read_sources(reader: &mut Reader<&[u8]>) -> SarResult<Vec<String>> {
    let mut sources = Vec::new();
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Empty(e) => {
                if let Some(refid) = attribute(&e, "refid")? {
                    sources.push(refid);
                }
            }
            Event::Start(e) => {
                let name = local_name(&e);
                match attribute(&e, "refid")? {
                    Some(refid) => {
                        reader.read_to_end(e.name()).map_err(xml_error)?;
                        sources.push(refid);
                    }
                    None => {
                        let text = read_text(reader, &name)?;
                        if !text.trim().is_empty() {
                            sources.push(text.trim().to_string());
                        }
                    }
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"sources" => return Ok(sources),
            Event::Eof => return Err(SarError::Graph("Unterminated <sources>".to_string())),
            _ => {}
        }
    }
}

fn read_parameters(reader: &mut Reader<&[u8]>) -> SarResult<ParameterSet> {
    let mut set = ParameterSet::new();
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Empty(e) => set.set(local_name(&e), ""),
            Event::Start(e) => {
                let name = local_name(&e);
                let value = read_text(reader, &name)?;
                set.set(name, value);
            }
            Event::End(e) if e.local_name().as_ref() == b"parameters" => return Ok(set),
            Event::Eof => return Err(SarError::Graph("Unterminated <parameters>".to_string())),
            _ => {}
        }
    }
}

fn write_node(w: &mut Writer<Vec<u8>>, node: &GraphNode) -> quick_xml::Result<()> {
    w.create_element("node")
        .with_attribute(("id", node.id.as_str()))
        .write_inner_content(|w| {
            w.create_element("operator")
                .write_text_content(BytesText::new(&node.operator))?;
            match &node.source {
                Some(source) => {
                    w.create_element("sources").write_inner_content(|w| {
                        w.create_element("sourceProduct")
                            .with_attribute(("refid", source.as_str()))
                            .write_empty()?;
                        Ok::<(), quick_xml::Error>(())
                    })?;
                }
                None => {
                    w.create_element("sources").write_empty()?;
                }
            }
            let parameters = node.parameters.to_parameter_set();
            w.create_element("parameters")
                .with_attribute(("class", PARAMETERS_CLASS))
                .write_inner_content(|w| {
                    for (name, value) in parameters.iter() {
                        if value.is_empty() {
                            w.create_element(name).write_empty()?;
                        } else {
                            w.create_element(name).write_text_content(BytesText::new(value))?;
                        }
                    }
                    Ok::<(), quick_xml::Error>(())
                })?;
            Ok::<(), quick_xml::Error>(())
        })?;
    Ok(())
}
