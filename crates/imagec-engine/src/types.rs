//! Shared value types for the imagec engine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A 2D point in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position (pixels from left edge).
    pub x: f64,
    /// Vertical position (pixels from top edge).
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance to another point.
    ///
    /// Avoids the square root for comparison purposes.
    #[must_use]
    pub fn distance_squared(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx.mul_add(dx, dy * dy)
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        self.distance_squared(other).sqrt()
    }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total number of pixels.
    #[must_use]
    pub const fn pixel_count(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Axis-aligned rectangle in pixel coordinates.
///
/// The rectangle covers columns `x..x + width` and rows `y..y + height`
/// (right and bottom edges exclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    #[must_use]
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle anchored at the origin with the given size.
    #[must_use]
    pub const fn from_dimensions(dimensions: Dimensions) -> Self {
        Self::new(0, 0, dimensions.width, dimensions.height)
    }

    /// Exclusive right edge.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn right(self) -> i32 {
        self.x + self.width as i32
    }

    /// Exclusive bottom edge.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn bottom(self) -> i32 {
        self.y + self.height as i32
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    #[must_use]
    pub const fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    #[must_use]
    pub const fn dimensions(self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }

    /// Overlapping region of two rectangles, `None` when they do not overlap.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn intersection(self, other: Self) -> Option<Self> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Self::new(x0, y0, (x1 - x0) as u32, (y1 - y0) as u32))
    }

    /// Strict overlap test (touching edges do not overlap).
    #[must_use]
    pub const fn overlaps(self, other: Self) -> bool {
        self.right() > other.x
            && self.x < other.right()
            && self.bottom() > other.y
            && self.y < other.bottom()
    }

    /// `true` when `other` lies completely inside `self`.
    #[must_use]
    pub const fn contains_rect(self, other: Self) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    #[must_use]
    pub const fn contains(self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    /// `true` when the rectangle touches any edge of `bounds`.
    #[must_use]
    pub const fn touches_edge_of(self, bounds: Self) -> bool {
        self.x <= bounds.x
            || self.y <= bounds.y
            || self.right() >= bounds.right()
            || self.bottom() >= bounds.bottom()
    }

    /// Translate by `(dx, dy)`.
    #[must_use]
    pub const fn offset(self, dx: i32, dy: i32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.width, self.height)
    }
}

/// Engine-wide object class identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassId(pub u16);

impl ClassId {
    /// Sentinel for "no class".
    pub const NONE: Self = Self(0xFFFD);
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NONE {
            f.write_str("None")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Class reference as written in settings files.
///
/// `"$"` is the pipeline's default class, `"$N"` the N-th class of the
/// project classification list (1-based), `"None"` the absent class, and
/// a number (or numeric string) a concrete class id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ClassIdIn {
    #[default]
    Default,
    Indexed(u16),
    Id(ClassId),
    None,
}

impl fmt::Display for ClassIdIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("$"),
            Self::Indexed(n) => write!(f, "${n}"),
            Self::Id(id) => write!(f, "{id}"),
            Self::None => f.write_str("None"),
        }
    }
}

impl std::str::FromStr for ClassIdIn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "$" {
            return Ok(Self::Default);
        }
        if s.eq_ignore_ascii_case("none") {
            return Ok(Self::None);
        }
        if let Some(rest) = s.strip_prefix('$') {
            return rest
                .parse::<u16>()
                .ok()
                .filter(|n| *n > 0)
                .map(Self::Indexed)
                .ok_or_else(|| format!("invalid class slot reference {s:?}"));
        }
        s.parse::<u16>()
            .map(|id| Self::Id(ClassId(id)))
            .map_err(|_| format!("invalid class id {s:?}"))
    }
}

impl Serialize for ClassIdIn {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Serde-compatible proxy accepting either a string or a bare number.
#[derive(Deserialize)]
#[serde(untagged)]
enum ClassIdInProxy {
    Number(u16),
    Text(String),
}

impl<'de> Deserialize<'de> for ClassIdIn {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match ClassIdInProxy::deserialize(deserializer)? {
            ClassIdInProxy::Number(n) => Ok(Self::Id(ClassId(n))),
            ClassIdInProxy::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Image-cache memory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MemoryId(u8);

impl MemoryId {
    /// Highest addressable slot (`M10`).
    pub const MAX: u8 = 10;

    /// Slot `M{index}`, `None` when out of range.
    #[must_use]
    pub const fn new(index: u8) -> Option<Self> {
        if index <= Self::MAX {
            Some(Self(index))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn index(self) -> u8 {
        self.0
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M{}", self.0)
    }
}

impl Serialize for MemoryId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MemoryId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.strip_prefix('M')
            .and_then(|n| n.parse::<u8>().ok())
            .and_then(Self::new)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid memory slot {s:?}")))
    }
}

/// How a z-stack is collapsed into a single plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ZProjection {
    /// Use the selected z-plane as is.
    #[default]
    None,
    MaxIntensity,
    MinIntensity,
    AvgIntensity,
}

/// Lifetime of an image-cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheScope {
    /// Lives for one pipeline invocation on one tile.
    #[default]
    Pipeline,
    /// Lives for one tile iteration and is visible to every pipeline on it.
    Iteration,
}

/// Identifies a plane inside an image cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId {
    pub c_stack: i32,
    pub z_stack: i32,
    pub t_stack: i32,
    pub z_projection: ZProjection,
    pub memory_id: MemoryId,
}

/// Per-job unique object identifier. `0` means "no object".
pub type ObjectId = u64;

/// Object validity bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Validity(pub u32);

impl Validity {
    pub const VALID: Self = Self(0x00);
    pub const TOO_SMALL: Self = Self(0x02);
    pub const TOO_BIG: Self = Self(0x04);
    pub const TOO_LESS_CIRCULARITY: Self = Self(0x08);
    pub const TOO_LESS_OVERLAPPING: Self = Self(0x10);
    pub const REFERENCE_SPOT: Self = Self(0x20);
    pub const INVALID: Self = Self(0x40);
    pub const AT_THE_EDGE: Self = Self(0x80);

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub const fn insert(&mut self, flag: Self) {
        self.0 |= flag.0;
    }
}

/// Image-level validity bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageValidity(pub u32);

impl ImageValidity {
    pub const VALID: Self = Self(0x00);
    /// At least one tile failed.
    pub const PARTIAL: Self = Self(0x01);
    /// Processing stopped before the image completed.
    pub const CANCELLED: Self = Self(0x02);
    /// The applied threshold sits too close to the background peak.
    pub const POSSIBLE_WRONG_THRESHOLD: Self = Self(0x20);

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub const fn insert(&mut self, flag: Self) {
        self.0 |= flag.0;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // --- Point tests ---

    #[test]
    fn point_distance() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(3.0, 4.0);
        assert!((a.distance_squared(b) - 25.0).abs() < f64::EPSILON);
        assert!((a.distance(b) - 5.0).abs() < f64::EPSILON);
    }

    // --- Rect tests ---

    #[test]
    fn rect_intersection_overlapping() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(5, 5, 10, 10);
        assert_eq!(a.intersection(b), Some(Rect::new(5, 5, 5, 5)));
    }

    #[test]
    fn rect_touching_edges_do_not_overlap() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(10, 0, 10, 10);
        assert!(!a.overlaps(b));
        assert_eq!(a.intersection(b), None);
    }

    #[test]
    fn rect_touches_edge() {
        let bounds = Rect::new(0, 0, 100, 100);
        assert!(Rect::new(0, 10, 5, 5).touches_edge_of(bounds));
        assert!(Rect::new(90, 10, 10, 5).touches_edge_of(bounds));
        assert!(!Rect::new(10, 10, 5, 5).touches_edge_of(bounds));
    }

    #[test]
    fn rect_contains_rect() {
        let outer = Rect::new(0, 0, 100, 100);
        assert!(outer.contains_rect(Rect::new(0, 0, 100, 100)));
        assert!(!outer.contains_rect(Rect::new(-1, 0, 10, 10)));
    }

    // --- ClassIdIn tests ---

    #[test]
    fn class_id_in_parses_all_forms() {
        assert_eq!("$".parse::<ClassIdIn>().unwrap(), ClassIdIn::Default);
        assert_eq!("$3".parse::<ClassIdIn>().unwrap(), ClassIdIn::Indexed(3));
        assert_eq!("None".parse::<ClassIdIn>().unwrap(), ClassIdIn::None);
        assert_eq!(
            "12".parse::<ClassIdIn>().unwrap(),
            ClassIdIn::Id(ClassId(12))
        );
        assert!("$0".parse::<ClassIdIn>().is_err());
        assert!("abc".parse::<ClassIdIn>().is_err());
    }

    #[test]
    fn class_id_in_serde_accepts_numbers_and_strings() {
        let parsed: Vec<ClassIdIn> = serde_json::from_str(r#"[1, "2", "$", "$4"]"#).unwrap();
        assert_eq!(
            parsed,
            vec![
                ClassIdIn::Id(ClassId(1)),
                ClassIdIn::Id(ClassId(2)),
                ClassIdIn::Default,
                ClassIdIn::Indexed(4),
            ]
        );
        let json = serde_json::to_string(&parsed).unwrap();
        assert_eq!(json, r#"["1","2","$","$4"]"#);
    }

    // --- MemoryId tests ---

    #[test]
    fn memory_id_round_trip() {
        let slot: MemoryId = serde_json::from_str(r#""M7""#).unwrap();
        assert_eq!(slot.index(), 7);
        assert_eq!(serde_json::to_string(&slot).unwrap(), r#""M7""#);
        assert!(serde_json::from_str::<MemoryId>(r#""M11""#).is_err());
    }

    // --- Validity tests ---

    #[test]
    fn validity_flags_accumulate() {
        let mut v = Validity::VALID;
        assert!(v.is_valid());
        v.insert(Validity::TOO_SMALL);
        v.insert(Validity::AT_THE_EDGE);
        assert!(v.contains(Validity::TOO_SMALL));
        assert!(v.contains(Validity::AT_THE_EDGE));
        assert!(!v.contains(Validity::TOO_BIG));
        assert_eq!(v.0, 0x82);
    }
}
