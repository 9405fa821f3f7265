//! Canvas object model.
//!
//! A [`CanvasObject`] is the unit of collaboration: every operation targets
//! exactly one object by [`ObjectId`], and field-level patches address the
//! individual properties listed in [`Field`].
//!
//! ```text
//! CanvasObject
//! ├── id / kind / owner_site / version      (identity, never patched)
//! ├── geometry: x y width height rotation points
//! ├── style:    stroke fill stroke_width opacity
//! ├── text                                   (text objects)
//! ├── children                               (group objects)
//! └── layer_order                            (changed by Reorder only)
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique, immutable object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub Uuid);

impl ObjectId {
    /// Fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic identifier (tests, fixtures).
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an editing site (one per connected client).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SiteId(pub u64);

impl SiteId {
    /// Derive a site id from a peer UUID (low 64 bits).
    pub fn from_uuid(id: &Uuid) -> Self {
        Self((id.as_u128() & u128::from(u64::MAX)) as u64)
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "site-{}", self.0)
    }
}

/// Shape variant of a canvas object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShapeKind {
    Rectangle,
    Ellipse,
    Line,
    Text,
    Path,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// 8-bit RGBA color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const BLACK: Color = Color::rgb(0, 0, 0);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Geometry {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    /// Rotation in radians around the bounding-box center.
    pub rotation: f64,
    /// Vertices for lines and paths (object-local coordinates).
    pub points: Vec<Point>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Style {
    pub stroke: Color,
    pub fill: Option<Color>,
    pub stroke_width: f64,
    pub opacity: f64,
}

impl Default for Style {
    fn default() -> Self {
        Self {
            stroke: Color::BLACK,
            fill: None,
            stroke_width: 1.0,
            opacity: 1.0,
        }
    }
}

/// A vector object on the shared canvas.
///
/// Owned exclusively by the document store. `version` is bumped by every
/// committed operation that targets the object, including operations the
/// transform engine reduced to no-ops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasObject {
    pub id: ObjectId,
    pub kind: ShapeKind,
    pub geometry: Geometry,
    pub style: Style,
    pub text: Option<String>,
    pub children: Vec<ObjectId>,
    pub layer_order: i64,
    pub owner_site: SiteId,
    pub version: u64,
}

impl CanvasObject {
    pub fn new(id: ObjectId, kind: ShapeKind, owner_site: SiteId) -> Self {
        Self {
            id,
            kind,
            geometry: Geometry::default(),
            style: Style::default(),
            text: None,
            children: Vec::new(),
            layer_order: 0,
            owner_site,
            version: 0,
        }
    }

    /// Axis-aligned rectangle shorthand.
    pub fn rectangle(id: ObjectId, owner_site: SiteId, x: f64, y: f64, width: f64, height: f64) -> Self {
        let mut object = Self::new(id, ShapeKind::Rectangle, owner_site);
        object.geometry = Geometry {
            x,
            y,
            width,
            height,
            ..Geometry::default()
        };
        object
    }

    pub fn with_layer_order(mut self, layer_order: i64) -> Self {
        self.layer_order = layer_order;
        self
    }

    /// Current value of a patchable field.
    pub fn read(&self, field: Field) -> FieldValue {
        match field {
            Field::X => FieldValue::Number(self.geometry.x),
            Field::Y => FieldValue::Number(self.geometry.y),
            Field::Width => FieldValue::Number(self.geometry.width),
            Field::Height => FieldValue::Number(self.geometry.height),
            Field::Rotation => FieldValue::Number(self.geometry.rotation),
            Field::Points => FieldValue::Points(self.geometry.points.clone()),
            Field::Stroke => FieldValue::Color(Some(self.style.stroke)),
            Field::Fill => FieldValue::Color(self.style.fill),
            Field::StrokeWidth => FieldValue::Number(self.style.stroke_width),
            Field::Opacity => FieldValue::Number(self.style.opacity),
            Field::Text => FieldValue::Text(self.text.clone()),
            Field::Children => FieldValue::Ids(self.children.clone()),
        }
    }

    /// Overwrite a single field. Returns `false` when the value has the
    /// wrong shape for the field (the object is left untouched).
    pub fn write(&mut self, field: Field, value: &FieldValue) -> bool {
        match (field, value) {
            (Field::X, FieldValue::Number(v)) => self.geometry.x = *v,
            (Field::Y, FieldValue::Number(v)) => self.geometry.y = *v,
            (Field::Width, FieldValue::Number(v)) => self.geometry.width = *v,
            (Field::Height, FieldValue::Number(v)) => self.geometry.height = *v,
            (Field::Rotation, FieldValue::Number(v)) => self.geometry.rotation = *v,
            (Field::Points, FieldValue::Points(v)) => self.geometry.points = v.clone(),
            (Field::Stroke, FieldValue::Color(Some(c))) => self.style.stroke = *c,
            (Field::Fill, FieldValue::Color(c)) => self.style.fill = *c,
            (Field::StrokeWidth, FieldValue::Number(v)) => self.style.stroke_width = *v,
            (Field::Opacity, FieldValue::Number(v)) => self.style.opacity = *v,
            (Field::Text, FieldValue::Text(t)) => self.text = t.clone(),
            (Field::Children, FieldValue::Ids(ids)) => self.children = ids.clone(),
            _ => return false,
        }
        true
    }

    /// Fields whose values differ between `self` and `other`.
    pub fn diff(&self, other: &CanvasObject) -> Vec<Field> {
        Field::ALL
            .iter()
            .copied()
            .filter(|f| self.read(*f) != other.read(*f))
            .collect()
    }

    /// Check every field against its value constraints.
    pub fn validate(&self) -> Result<(), String> {
        for field in Field::ALL {
            field.check(&self.read(field))?;
        }
        if self.kind != ShapeKind::Group && !self.children.is_empty() {
            return Err(format!("{:?} object cannot have children", self.kind));
        }
        Ok(())
    }
}

/// Individually patchable property of a [`CanvasObject`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Field {
    X,
    Y,
    Width,
    Height,
    Rotation,
    Points,
    Stroke,
    Fill,
    StrokeWidth,
    Opacity,
    Text,
    Children,
}

impl Field {
    pub const ALL: [Field; 12] = [
        Field::X,
        Field::Y,
        Field::Width,
        Field::Height,
        Field::Rotation,
        Field::Points,
        Field::Stroke,
        Field::Fill,
        Field::StrokeWidth,
        Field::Opacity,
        Field::Text,
        Field::Children,
    ];

    /// Validate that `value` has the right shape and range for this field.
    pub fn check(self, value: &FieldValue) -> Result<(), String> {
        match (self, value) {
            (Field::X | Field::Y | Field::Rotation, FieldValue::Number(v)) => finite(self, *v),
            (Field::Width | Field::Height | Field::StrokeWidth, FieldValue::Number(v)) => {
                finite(self, *v)?;
                if *v < 0.0 {
                    return Err(format!("{self:?} must be non-negative, got {v}"));
                }
                Ok(())
            }
            (Field::Opacity, FieldValue::Number(v)) => {
                if !(0.0..=1.0).contains(v) {
                    return Err(format!("Opacity must be within [0, 1], got {v}"));
                }
                Ok(())
            }
            (Field::Points, FieldValue::Points(points)) => {
                if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
                    return Err("Points must be finite".to_string());
                }
                Ok(())
            }
            (Field::Stroke, FieldValue::Color(Some(_))) => Ok(()),
            (Field::Stroke, FieldValue::Color(None)) => Err("Stroke color cannot be cleared".to_string()),
            (Field::Fill, FieldValue::Color(_)) => Ok(()),
            (Field::Text, FieldValue::Text(_)) => Ok(()),
            (Field::Children, FieldValue::Ids(_)) => Ok(()),
            (field, value) => Err(format!("{field:?} cannot hold {value:?}")),
        }
    }
}

fn finite(field: Field, v: f64) -> Result<(), String> {
    if v.is_finite() {
        Ok(())
    } else {
        Err(format!("{field:?} must be finite, got {v}"))
    }
}

/// Value carried by a field patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Number(f64),
    Points(Vec<Point>),
    Color(Option<Color>),
    Text(Option<String>),
    Ids(Vec<ObjectId>),
}

/// Field-level patch: only the fields present are overwritten.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldPatch(BTreeMap<Field, FieldValue>);

impl FieldPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: Field, value: FieldValue) -> Self {
        self.0.insert(field, value);
        self
    }

    pub fn set(&mut self, field: Field, value: FieldValue) {
        self.0.insert(field, value);
    }

    pub fn get(&self, field: Field) -> Option<&FieldValue> {
        self.0.get(&field)
    }

    pub fn contains(&self, field: Field) -> bool {
        self.0.contains_key(&field)
    }

    pub fn remove(&mut self, field: Field) -> Option<FieldValue> {
        self.0.remove(&field)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(Field) -> bool) {
        self.0.retain(|field, _| keep(*field));
    }

    pub fn fields(&self) -> impl Iterator<Item = Field> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Field, &FieldValue)> {
        self.0.iter().map(|(f, v)| (*f, v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Patch that restores the current values of this patch's fields on `object`.
    pub fn capture(&self, object: &CanvasObject) -> FieldPatch {
        FieldPatch(self.0.keys().map(|f| (*f, object.read(*f))).collect())
    }
}
