//! In-memory design document for the reference host.
//!
//! Tracks named bodies, the active selection and an undo/redo history.
//! Geometry is descriptive only: a body records its primitive, placement
//! and the features applied to it, which is enough for scripts to query
//! and mutate live host state.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DocumentError {
    #[error("no body named '{0}'")]
    UnknownBody(String),
    #[error("a body named '{0}' already exists")]
    DuplicateBody(String),
    #[error("{what} must be a positive finite number, got {value}")]
    InvalidDimension { what: &'static str, value: f64 },
    #[error("invalid {what} '{value}', expected one of: {expected}")]
    InvalidChoice {
        what: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("selection required: {0}")]
    Selection(String),
    #[error("body '{body}' has no {filter} edges")]
    NoEdges { body: String, filter: EdgeFilter },
    #[error("nothing to undo")]
    NothingToUndo,
    #[error("nothing to redo")]
    NothingToRedo,
}

pub type DocumentResult<T> = Result<T, DocumentError>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3D {
    pub const ORIGIN: Self = Self::new(0.0, 0.0, 0.0);

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    fn translated(self, v: Vector3D) -> Self {
        Self::new(self.x + v.x, self.y + v.y, self.z + v.z)
    }

    /// Rotate about `pivot` around a world axis by `degrees`.
    fn rotated(self, axis: Axis, degrees: f64, pivot: Self) -> Self {
        let (s, c) = degrees.to_radians().sin_cos();
        let (x, y, z) = (self.x - pivot.x, self.y - pivot.y, self.z - pivot.z);
        let (x, y, z) = match axis {
            Axis::X => (x, y.mul_add(c, -z * s), y.mul_add(s, z * c)),
            Axis::Y => (x.mul_add(c, z * s), y, (-x).mul_add(s, z * c)),
            Axis::Z => (x.mul_add(c, -y * s), x.mul_add(s, y * c), z),
        };
        Self::new(x + pivot.x, y + pivot.y, z + pivot.z)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Vector3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3D {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

macro_rules! choice_enum {
    ($name:ident, $what:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const NAMES: &'static [&'static str] = &[$($text),+];

            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = DocumentError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(DocumentError::InvalidChoice {
                        what: $what,
                        value: s.to_string(),
                        expected: concat!($($text, " "),+),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

choice_enum!(Plane, "plane", { Xy => "xy", Yz => "yz", Xz => "xz" });
choice_enum!(Axis, "axis", { X => "x", Y => "y", Z => "z" });
choice_enum!(BooleanOp, "operation", { Join => "join", Cut => "cut", Intersect => "intersect" });
choice_enum!(EdgeFilter, "edge type", { All => "all", Circular => "circular" });

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Shape {
    Box {
        width: f64,
        depth: f64,
        height: f64,
    },
    Cylinder {
        radius: f64,
        height: f64,
    },
    Sphere {
        radius: f64,
    },
    Cone {
        radius: f64,
        height: f64,
    },
    Pyramid {
        sides: u8,
        side_length: f64,
        height: f64,
    },
    Compound {
        operation: BooleanOp,
        parts: Vec<Shape>,
    },
}

impl Shape {
    /// Edge count split into (linear, circular).
    fn edge_counts(&self) -> (usize, usize) {
        match self {
            Self::Box { .. } => (12, 0),
            Self::Cylinder { .. } => (0, 2),
            Self::Sphere { .. } => (0, 0),
            Self::Cone { .. } => (0, 1),
            Self::Pyramid { sides, .. } => (usize::from(*sides) * 2, 0),
            Self::Compound { parts, .. } => parts
                .iter()
                .map(Self::edge_counts)
                .fold((0, 0), |(l, c), (pl, pc)| (l + pl, c + pc)),
        }
    }

    fn edges(&self, filter: EdgeFilter) -> usize {
        let (linear, circular) = self.edge_counts();
        match filter {
            EdgeFilter::All => linear + circular,
            EdgeFilter::Circular => circular,
        }
    }

    fn dimensions(&self) -> Vec<(&'static str, f64)> {
        match *self {
            Self::Box {
                width,
                depth,
                height,
            } => vec![("width", width), ("depth", depth), ("height", height)],
            Self::Cylinder { radius, height } | Self::Cone { radius, height } => {
                vec![("radius", radius), ("height", height)]
            }
            Self::Sphere { radius } => vec![("radius", radius)],
            Self::Pyramid {
                side_length,
                height,
                ..
            } => vec![("side_length", side_length), ("height", height)],
            Self::Compound { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fillet {
    pub radius: f64,
    pub edges: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rotation {
    pub axis: Axis,
    pub degrees: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Body {
    pub name: String,
    pub shape: Shape,
    pub plane: Plane,
    pub center: Point3D,
    pub rotations: Vec<Rotation>,
    pub fillets: Vec<Fillet>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Selection {
    Bodies {
        names: Vec<String>,
    },
    Edges {
        body: String,
        filter: EdgeFilter,
        count: usize,
    },
}

impl Selection {
    pub fn len(&self) -> usize {
        match self {
            Self::Bodies { names } => names.len(),
            Self::Edges { count, .. } => *count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Snapshots kept for undo; the oldest is dropped past this depth.
pub const MAX_UNDO_DEPTH: usize = 100;

/// The active design.
#[derive(Debug, Clone)]
pub struct Document {
    pub name: String,
    bodies: Vec<Body>,
    selection: Option<Selection>,
    undo: VecDeque<Vec<Body>>,
    redo: Vec<Vec<Body>>,
    next_body: usize,
}

impl Document {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bodies: Vec::new(),
            selection: None,
            undo: VecDeque::new(),
            redo: Vec::new(),
            next_body: 1,
        }
    }

    pub fn bodies(&self) -> &[Body] {
        &self.bodies
    }

    pub fn body(&self, name: &str) -> DocumentResult<&Body> {
        self.bodies
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| DocumentError::UnknownBody(name.to_string()))
    }

    fn body_mut(&mut self, name: &str) -> DocumentResult<&mut Body> {
        self.bodies
            .iter_mut()
            .find(|b| b.name == name)
            .ok_or_else(|| DocumentError::UnknownBody(name.to_string()))
    }

    pub const fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    /// Add a primitive body. An empty or `"none"` name gets an automatic one.
    pub fn add_body(
        &mut self,
        name: &str,
        shape: Shape,
        plane: Plane,
        center: Point3D,
    ) -> DocumentResult<String> {
        for (what, value) in shape.dimensions() {
            if !value.is_finite() || value <= 0.0 {
                return Err(DocumentError::InvalidDimension { what, value });
            }
        }

        let name = match name.trim() {
            "" | "none" => self.auto_name(),
            explicit => explicit.to_string(),
        };
        if self.bodies.iter().any(|b| b.name == name) {
            return Err(DocumentError::DuplicateBody(name));
        }

        self.checkpoint();
        self.bodies.push(Body {
            name: name.clone(),
            shape,
            plane,
            center,
            rotations: Vec::new(),
            fillets: Vec::new(),
        });
        Ok(name)
    }

    fn auto_name(&mut self) -> String {
        loop {
            let candidate = format!("Body{}", self.next_body);
            self.next_body += 1;
            if !self.bodies.iter().any(|b| b.name == candidate) {
                return candidate;
            }
        }
    }

    pub fn select_body(&mut self, name: &str) -> DocumentResult<()> {
        self.body(name)?;
        self.selection = Some(Selection::Bodies {
            names: vec![name.to_string()],
        });
        Ok(())
    }

    pub fn select_bodies(&mut self, first: &str, second: &str) -> DocumentResult<()> {
        self.body(first)?;
        self.body(second)?;
        if first == second {
            return Err(DocumentError::Selection(
                "two distinct bodies must be selected".into(),
            ));
        }
        self.selection = Some(Selection::Bodies {
            names: vec![first.to_string(), second.to_string()],
        });
        Ok(())
    }

    /// Select the matching edges of a body and return how many were picked.
    pub fn select_edges(&mut self, body: &str, filter: EdgeFilter) -> DocumentResult<usize> {
        let count = self.body(body)?.shape.edges(filter);
        if count == 0 {
            return Err(DocumentError::NoEdges {
                body: body.to_string(),
                filter,
            });
        }
        self.selection = Some(Selection::Edges {
            body: body.to_string(),
            filter,
            count,
        });
        Ok(count)
    }

    pub fn clear_selection(&mut self) {
        self.selection = None;
    }

    fn selected_bodies(&self) -> DocumentResult<Vec<String>> {
        match &self.selection {
            Some(Selection::Bodies { names }) => Ok(names.clone()),
            _ => Err(DocumentError::Selection("select one or more bodies first".into())),
        }
    }

    pub fn fillet_selection(&mut self, radius: f64) -> DocumentResult<()> {
        if !radius.is_finite() || radius <= 0.0 {
            return Err(DocumentError::InvalidDimension {
                what: "fillet radius",
                value: radius,
            });
        }
        let Some(Selection::Edges { body, count, .. }) = self.selection.clone() else {
            return Err(DocumentError::Selection("select edges first".into()));
        };
        self.checkpoint();
        self.body_mut(&body)?.fillets.push(Fillet {
            radius,
            edges: count,
        });
        Ok(())
    }

    pub fn move_selection(&mut self, offset: Vector3D) -> DocumentResult<()> {
        let names = self.selected_bodies()?;
        self.checkpoint();
        for name in &names {
            let body = self.body_mut(name)?;
            body.center = body.center.translated(offset);
        }
        Ok(())
    }

    pub fn rotate_selection(
        &mut self,
        axis: Axis,
        degrees: f64,
        pivot: Point3D,
    ) -> DocumentResult<()> {
        let names = self.selected_bodies()?;
        self.checkpoint();
        for name in &names {
            let body = self.body_mut(name)?;
            body.center = body.center.rotated(axis, degrees, pivot);
            body.rotations.push(Rotation { axis, degrees });
        }
        Ok(())
    }

    pub fn combine_selection(&mut self, operation: BooleanOp) -> DocumentResult<String> {
        let names = self.selected_bodies()?;
        let [target, tool] = names.as_slice() else {
            return Err(DocumentError::Selection(
                "exactly two bodies must be selected".into(),
            ));
        };
        let (target, tool) = (target.clone(), tool.clone());
        self.combine(&target, &tool, operation)?;
        Ok(target)
    }

    /// Merge `tool` into `target`; the tool body is consumed.
    pub fn combine(&mut self, target: &str, tool: &str, operation: BooleanOp) -> DocumentResult<()> {
        if target == tool {
            return Err(DocumentError::Selection(
                "target and tool must be different bodies".into(),
            ));
        }
        let tool_shape = self.body(tool)?.shape.clone();
        self.body(target)?;

        self.checkpoint();
        self.bodies.retain(|b| b.name != tool);
        let body = self.body_mut(target)?;
        let base = body.shape.clone();
        body.shape = Shape::Compound {
            operation,
            parts: vec![base, tool_shape],
        };
        self.selection = None;
        Ok(())
    }

    pub fn undo(&mut self) -> DocumentResult<()> {
        let previous = self.undo.pop_back().ok_or(DocumentError::NothingToUndo)?;
        self.redo.push(std::mem::replace(&mut self.bodies, previous));
        self.selection = None;
        Ok(())
    }

    pub fn redo(&mut self) -> DocumentResult<()> {
        let next = self.redo.pop().ok_or(DocumentError::NothingToRedo)?;
        let current = std::mem::replace(&mut self.bodies, next);
        self.remember(current);
        self.selection = None;
        Ok(())
    }

    fn checkpoint(&mut self) {
        self.remember(self.bodies.clone());
        self.redo.clear();
    }

    fn remember(&mut self, snapshot: Vec<Body>) {
        if self.undo.len() == MAX_UNDO_DEPTH {
            self.undo.pop_front();
        }
        self.undo.push_back(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube(doc: &mut Document, name: &str) -> String {
        doc.add_body(
            name,
            Shape::Box {
                width: 10.0,
                depth: 10.0,
                height: 10.0,
            },
            Plane::Xy,
            Point3D::ORIGIN,
        )
        .unwrap()
    }

    #[test]
    fn auto_names_skip_taken_names() {
        let mut doc = Document::new("Untitled");
        cube(&mut doc, "Body1");
        assert_eq!(cube(&mut doc, "none"), "Body2");
        assert_eq!(cube(&mut doc, ""), "Body3");
        assert_eq!(
            doc.add_body("Body2", Shape::Sphere { radius: 1.0 }, Plane::Xy, Point3D::ORIGIN),
            Err(DocumentError::DuplicateBody("Body2".into()))
        );
    }

    #[test]
    fn rejects_non_positive_dimensions() {
        let mut doc = Document::new("d");
        let err = doc
            .add_body("s", Shape::Sphere { radius: -1.0 }, Plane::Xy, Point3D::ORIGIN)
            .unwrap_err();
        assert!(matches!(err, DocumentError::InvalidDimension { what: "radius", .. }));
        assert!(doc.bodies().is_empty());
    }

    #[test]
    fn rotate_about_pivot() {
        let mut doc = Document::new("d");
        doc.add_body(
            "c",
            Shape::Cylinder {
                radius: 1.0,
                height: 2.0,
            },
            Plane::Xy,
            Point3D::new(10.0, 0.0, 0.0),
        )
        .unwrap();
        doc.select_body("c").unwrap();
        doc.rotate_selection(Axis::Z, 90.0, Point3D::ORIGIN).unwrap();
        let center = doc.body("c").unwrap().center;
        assert!(center.x.abs() < 1e-9);
        assert!((center.y - 10.0).abs() < 1e-9);
    }

    #[test]
    fn undo_history_keeps_only_the_newest_snapshots() {
        let mut doc = Document::new("d");
        for i in 0..MAX_UNDO_DEPTH + 20 {
            cube(&mut doc, &format!("c{i}"));
        }
        assert_eq!(doc.undo.len(), MAX_UNDO_DEPTH);

        for _ in 0..MAX_UNDO_DEPTH {
            doc.undo().unwrap();
        }
        assert_eq!(doc.undo(), Err(DocumentError::NothingToUndo));
        // The oldest reachable state still holds the first 20 bodies.
        assert_eq!(doc.bodies().len(), 20);

        for _ in 0..MAX_UNDO_DEPTH {
            doc.redo().unwrap();
        }
        assert_eq!(doc.bodies().len(), MAX_UNDO_DEPTH + 20);
        assert_eq!(doc.undo.len(), MAX_UNDO_DEPTH);
    }

    #[test]
    fn combine_consumes_tool_and_undo_restores_it() {
        let mut doc = Document::new("d");
        cube(&mut doc, "a");
        cube(&mut doc, "b");
        doc.select_bodies("a", "b").unwrap();
        assert_eq!(doc.combine_selection(BooleanOp::Cut).unwrap(), "a");
        assert_eq!(doc.bodies().len(), 1);
        assert!(matches!(doc.body("a").unwrap().shape, Shape::Compound { .. }));
        assert!(doc.selection().is_none());

        doc.undo().unwrap();
        assert_eq!(doc.bodies().len(), 2);
        doc.redo().unwrap();
        assert_eq!(doc.bodies().len(), 1);
        assert_eq!(doc.redo(), Err(DocumentError::NothingToRedo));
    }

    #[test]
    fn edge_selection_and_fillet() {
        let mut doc = Document::new("d");
        cube(&mut doc, "a");
        doc.add_body("ball", Shape::Sphere { radius: 2.0 }, Plane::Xy, Point3D::ORIGIN)
            .unwrap();

        assert_eq!(doc.select_edges("a", EdgeFilter::All).unwrap(), 12);
        assert!(matches!(
            doc.select_edges("a", EdgeFilter::Circular),
            Err(DocumentError::NoEdges { .. })
        ));
        assert!(doc.select_edges("ball", EdgeFilter::All).is_err());

        doc.select_edges("a", EdgeFilter::All).unwrap();
        doc.fillet_selection(1.5).unwrap();
        assert_eq!(doc.body("a").unwrap().fillets[0].edges, 12);
    }

    #[test]
    fn move_needs_body_selection() {
        let mut doc = Document::new("d");
        cube(&mut doc, "a");
        assert!(matches!(
            doc.move_selection(Vector3D::new(1.0, 0.0, 0.0)),
            Err(DocumentError::Selection(_))
        ));
        doc.select_body("a").unwrap();
        doc.move_selection(Vector3D::new(1.0, 2.0, 3.0)).unwrap();
        assert_eq!(doc.body("a").unwrap().center, Point3D::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn choices_parse_case_insensitively() {
        assert_eq!("XY".parse::<Plane>().unwrap(), Plane::Xy);
        assert_eq!("intersect".parse::<BooleanOp>().unwrap(), BooleanOp::Intersect);
        let err = "w".parse::<Axis>().unwrap_err();
        assert!(err.to_string().contains("x y z"));
    }
}
