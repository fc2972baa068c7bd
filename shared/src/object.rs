//! The movable object value type and its geometry
//!
//! An object's location is the centre of its footprint. Bounds checks use
//! the axis-aligned box whose half extents are the absolute value of the
//! half-size vector rotated by the object's angle. For diagonal rotations
//! this is not the true envelope of the rotated rectangle; clients and
//! servers must agree on the exact same test, so it is kept as is.

use crate::class::{ClassInfo, ClassRef};
use crate::codec::{dequantize, quantize};
use crate::ids::{ClientId, ObjectId};
use crate::protocol::ObjectRecord;
use std::ops::{Add, Sub};
use std::sync::Arc;

/// Coordinates are bounded to `[-TABLE_EXTENT, TABLE_EXTENT]` on both axes
pub const TABLE_EXTENT: f32 = 10000.0;

/// Rotations are whole multiples of 22.5 degrees
pub const ROTATION_STEPS: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Clamps both coordinates into the table range
    pub fn clamp_to_table(self) -> Self {
        let clamp = |v: f32| {
            if v.is_finite() {
                v.clamp(-TABLE_EXTENT, TABLE_EXTENT)
            } else {
                0.0
            }
        };
        Self::new(clamp(self.x), clamp(self.y))
    }

    /// The point a peer decodes after this one went over the wire
    ///
    /// The server stores locations in this form so that it and every mirror
    /// run overlap tests on identical coordinates.
    pub fn quantized(self) -> Self {
        let settle = |v: f32| dequantize(quantize(v));
        let clamped = self.clamp_to_table();
        Self::new(settle(clamped.x), settle(clamped.y))
    }
}

impl Add for Vec2 {
    type Output = Vec2;

    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Vec2 {
    type Output = Vec2;

    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// One object on the table
#[derive(Debug, Clone)]
pub struct Object {
    id: ObjectId,
    class: ClassRef,
    variant: u8,
    info: Arc<ClassInfo>,
    location: Vec2,
    rotation: u8,
    flipped: bool,
    selected_by: Option<ClientId>,
    owned_by: Option<ClientId>,
}

impl Object {
    pub fn new(
        id: ObjectId,
        class: ClassRef,
        variant: u8,
        info: Arc<ClassInfo>,
        location: Vec2,
    ) -> Self {
        Self {
            id,
            class,
            variant,
            info,
            location: location.clamp_to_table(),
            rotation: 0,
            flipped: false,
            selected_by: None,
            owned_by: None,
        }
    }

    /// Rebuilds an object from its wire record
    pub fn from_record(record: &ObjectRecord, info: Arc<ClassInfo>) -> Self {
        Self {
            id: record.id,
            class: record.class.clone(),
            variant: record.variant,
            info,
            location: record.location.clamp_to_table(),
            rotation: record.rotation % ROTATION_STEPS,
            flipped: record.flipped,
            selected_by: record.selected_by,
            owned_by: record.owned_by,
        }
    }

    /// The object's full state as sent in handshakes and creates
    pub fn to_record(&self) -> ObjectRecord {
        ObjectRecord {
            id: self.id,
            class: self.class.clone(),
            variant: self.variant,
            location: self.location,
            rotation: self.rotation,
            flipped: self.flipped,
            selected_by: self.selected_by,
            owned_by: self.owned_by,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn class(&self) -> &ClassRef {
        &self.class
    }

    pub fn variant(&self) -> u8 {
        self.variant
    }

    pub fn info(&self) -> &Arc<ClassInfo> {
        &self.info
    }

    pub fn location(&self) -> Vec2 {
        self.location
    }

    /// Rotation in steps of 22.5 degrees, always below [`ROTATION_STEPS`]
    pub fn rotation(&self) -> u8 {
        self.rotation
    }

    /// Current angle in radians
    pub fn angle(&self) -> f32 {
        f32::from(self.rotation) * std::f32::consts::TAU / f32::from(ROTATION_STEPS)
    }

    pub fn flipped(&self) -> bool {
        self.flipped
    }

    pub fn selected_by(&self) -> Option<ClientId> {
        self.selected_by
    }

    pub fn owned_by(&self) -> Option<ClientId> {
        self.owned_by
    }

    /// Swaps in new class metadata, e.g. once a missing class file arrives.
    /// Changes the footprint, so the owning table must restack.
    pub fn set_info(&mut self, info: Arc<ClassInfo>) {
        self.info = info;
    }

    /// Moves the centre, clamped into the table range
    pub fn set_location(&mut self, location: Vec2) {
        self.location = location.clamp_to_table();
    }

    /// Rounds the location to the class grid, if the class has one
    pub fn snap(&mut self) {
        if let Some(grid) = self.info.grid.filter(|g| *g > 0.0 && g.is_finite()) {
            let round = |v: f32| (v / grid).round() * grid;
            self.set_location(Vec2::new(round(self.location.x), round(self.location.y)));
        }
    }

    /// Adds `steps` increments of 22.5 degrees, wrapping around a full turn
    pub fn rotate(&mut self, steps: i8) {
        let turned = i16::from(self.rotation) + i16::from(steps);
        self.rotation = turned.rem_euclid(i16::from(ROTATION_STEPS)) as u8;
    }

    pub fn set_rotation(&mut self, rotation: u8) {
        self.rotation = rotation % ROTATION_STEPS;
    }

    pub fn toggle_flip(&mut self) {
        self.flipped = !self.flipped;
    }

    /// Marks the object as held by `client`; `None` releases it
    pub fn select(&mut self, client: Option<ClientId>) {
        self.selected_by = client;
    }

    /// Only objects with the same owner stack together
    pub fn own(&mut self, client: Option<ClientId>) {
        self.owned_by = client;
    }

    /// Absolute value of the half-size vector rotated by the current angle
    pub fn half_extents(&self) -> Vec2 {
        let hx = self.info.width / 2.0;
        let hy = self.info.height / 2.0;
        let (sin, cos) = self.angle().sin_cos();
        Vec2::new((hx * cos - hy * sin).abs(), (hx * sin + hy * cos).abs())
    }

    pub fn bounds(&self) -> Bounds {
        Bounds {
            centre: self.location,
            half: self.half_extents(),
        }
    }

    /// True when `point` lies inside or on the edge of the object's bounds
    pub fn hit_test(&self, point: Vec2) -> bool {
        self.bounds().contains(point)
    }

    /// True when the two bounds share interior area; touching edges do not count
    pub fn overlaps(&self, other: &Object) -> bool {
        self.bounds().overlaps(&other.bounds())
    }
}

/// Axis-aligned footprint of an object, see the module docs
///
/// Building one costs a `sin_cos`, so code that tests many pairs computes
/// each object's bounds once and compares those.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub centre: Vec2,
    pub half: Vec2,
}

impl Bounds {
    /// Inclusive of the edges
    pub fn contains(&self, point: Vec2) -> bool {
        (point.x - self.centre.x).abs() <= self.half.x
            && (point.y - self.centre.y).abs() <= self.half.y
    }

    /// Strict: boxes that only touch do not overlap
    pub fn overlaps(&self, other: &Bounds) -> bool {
        (self.centre.x - other.centre.x).abs() < self.half.x + other.half.x
            && (self.centre.y - other.centre.y).abs() < self.half.y + other.half.y
    }
}
