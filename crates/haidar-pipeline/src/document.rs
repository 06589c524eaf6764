//! The vector document produced by a vectorization engine.
//!
//! A [`VectorDocument`] is an ordered list of filled shapes in image
//! coordinates, painted back to front, plus the canvas size the shapes
//! were traced from. It has no background: areas not covered by any node
//! are transparent.

use serde::{Deserialize, Serialize};

use crate::types::{Dimensions, Point};

/// One filled shape. Every subpath is an implicitly closed polygon;
/// overlapping subpaths combine with the non-zero fill rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeNode {
    /// Fill colour as `[r, g, b]`. Shapes are always fully opaque.
    pub fill: [u8; 3],
    /// Closed polygons making up the shape.
    pub subpaths: Vec<Vec<Point>>,
}

impl ShapeNode {
    /// Create a node from its fill colour and subpaths.
    #[must_use]
    pub const fn new(fill: [u8; 3], subpaths: Vec<Vec<Point>>) -> Self {
        Self { fill, subpaths }
    }

    /// Fill as a `#rrggbb` hex string.
    #[must_use]
    pub fn fill_hex(&self) -> String {
        let [r, g, b] = self.fill;
        format!("#{r:02x}{g:02x}{b:02x}")
    }

    /// Whether this node is a single rectangle covering the whole canvas.
    ///
    /// Such a node is an opaque backing shape: it paints over every
    /// transparent pixel of the source.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn covers_canvas(&self, dimensions: Dimensions) -> bool {
        let [subpath] = self.subpaths.as_slice() else {
            return false;
        };
        let w = f64::from(dimensions.width);
        let h = f64::from(dimensions.height);
        let corners = [
            Point::new(0.0, 0.0),
            Point::new(w, 0.0),
            Point::new(w, h),
            Point::new(0.0, h),
        ];

        let mut points: Vec<Point> = subpath.clone();
        if points.len() > 1 && points.first() == points.last() {
            points.pop();
        }
        points.len() == 4
            && corners.iter().all(|c| points.contains(c))
            && points.iter().all(|p| corners.contains(p))
    }
}

/// An ordered list of shapes over a fixed-size canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorDocument {
    dimensions: Dimensions,
    nodes: Vec<ShapeNode>,
}

impl VectorDocument {
    /// An empty document for a canvas of the given size.
    #[must_use]
    pub const fn new(dimensions: Dimensions) -> Self {
        Self {
            dimensions,
            nodes: Vec::new(),
        }
    }

    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    #[must_use]
    pub fn nodes(&self) -> &[ShapeNode] {
        &self.nodes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append a node on top of the existing ones.
    pub fn push(&mut self, node: ShapeNode) {
        self.nodes.push(node);
    }

    /// Remove every node and adopt new canvas dimensions.
    pub fn reset(&mut self, dimensions: Dimensions) {
        self.dimensions = dimensions;
        self.nodes.clear();
    }

    /// Index of the first node that covers the whole canvas, if any.
    #[must_use]
    pub fn find_backdrop(&self) -> Option<usize> {
        self.nodes
            .iter()
            .position(|node| node.covers_canvas(self.dimensions))
    }
}
