//! SVG export serializer.
//!
//! Converts a [`VectorDocument`] into an SVG string with one filled
//! `<path>` per shape node, using the [`svg`] crate for document
//! construction, XML escaping, and path data formatting.
//!
//! The root element declares the document's pixel size and a matching
//! `viewBox`, and nothing else: no background `<rect>`, no embedded
//! raster. Areas no shape covers stay transparent.
//!
//! Optional [`SvgMetadata`] embeds `<title>` and `<desc>` elements for
//! accessibility and to help file managers identify exported files.
//!
//! This is a pure function with no I/O -- it returns a `String`.

use svg::Document;
use svg::node::element::path::Data;
use svg::node::element::{Description, Element, Path, Title};
use svg::node::{Node, Text, Value};

use haidar_pipeline::{Point, ShapeNode, VectorDocument};

/// Decimal places never exceed this; `f32` formatting cannot show more.
const MAX_PATH_PRECISION: u32 = 8;

/// Metadata to embed in the SVG document.
///
/// All fields are optional.  When present, a `<title>` and/or `<desc>`
/// element is emitted immediately after the opening `<svg>` tag.
///
/// Text values are XML-escaped automatically by the `svg` crate.
#[derive(Debug, Clone, Default)]
pub struct SvgMetadata<'a> {
    /// Document title: emitted as `<title>`.
    ///
    /// Typically the source image file stem.
    pub title: Option<&'a str>,

    /// Document description: emitted as `<desc>`.
    pub description: Option<&'a str>,

    /// Engine configuration record: emitted inside a `<metadata>`
    /// element wrapped in a namespaced `<haidar:conversion>` element, so
    /// a result can be re-converted with the same settings.
    pub config_json: Option<&'a str>,
}

/// Round to `precision` decimal places.
#[allow(clippy::cast_possible_wrap)]
fn round_to(value: f64, precision: u32) -> f64 {
    let scale = 10f64.powi(precision.min(MAX_PATH_PRECISION) as i32);
    (value * scale).round() / scale
}

/// Build an SVG path `d` attribute string for a shape node.
///
/// Each subpath becomes `M` to the first point, `L` to the rest, then a
/// close command. Subpaths with fewer than 3 points enclose no area and
/// are skipped. Returns an empty string when nothing remains.
///
/// # Examples
///
/// ```
/// use haidar_pipeline::{Point, ShapeNode};
/// use haidar_export::build_path_data;
///
/// let node = ShapeNode::new([0, 0, 0], vec![vec![
///     Point::new(0.0, 0.0),
///     Point::new(4.0, 0.0),
///     Point::new(4.0, 2.5),
/// ]]);
/// let d = build_path_data(&node, 2);
/// assert!(d.starts_with("M0,0 L4,0 L4,2.5"));
/// ```
#[must_use]
pub fn build_path_data(node: &ShapeNode, precision: u32) -> String {
    let at = |p: &Point| (round_to(p.x, precision), round_to(p.y, precision));

    let mut data = Data::new();
    let mut any = false;
    for subpath in &node.subpaths {
        let [first, rest @ ..] = subpath.as_slice() else {
            continue;
        };
        if rest.len() < 2 {
            continue;
        }
        data = data.move_to(at(first));
        for p in rest {
            data = data.line_to(at(p));
        }
        data = data.close();
        any = true;
    }

    if any {
        String::from(Value::from(data))
    } else {
        String::new()
    }
}

/// Serialize a vector document into an SVG string.
///
/// `path_precision` is the number of decimal places kept in path
/// coordinates.
#[must_use]
pub fn to_svg(document: &VectorDocument, metadata: &SvgMetadata<'_>, path_precision: u32) -> String {
    let dims = document.dimensions();
    let mut doc = Document::new()
        .set("width", dims.width)
        .set("height", dims.height)
        .set("viewBox", (0, 0, dims.width, dims.height));

    if let Some(title) = metadata.title {
        doc = doc.add(Title::new(title));
    }

    if let Some(description) = metadata.description {
        doc = doc.add(Description::new().add(Text::new(description)));
    }

    if let Some(config_json) = metadata.config_json {
        let mut conversion_el = Element::new("haidar:conversion");
        conversion_el.assign("xmlns:haidar", "https://haidar.app/ns/1");
        conversion_el.append(Text::new(config_json));
        let mut metadata_el = Element::new("metadata");
        metadata_el.append(conversion_el);
        doc = doc.add(metadata_el);
    }

    for node in document.nodes() {
        let d = build_path_data(node, path_precision);
        if d.is_empty() {
            continue;
        }
        let path = Path::new().set("d", d).set("fill", node.fill_hex());
        doc = doc.add(path);
    }

    // The svg crate omits the XML declaration, so we prepend it.
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{doc}\n")
}
