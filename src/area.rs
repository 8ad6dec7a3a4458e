//! Areas which affect the entities inside them.

use crate::collision::CollisionRectangle;
use crate::entity::EntityClass;
use crate::math::{flatten_vec, safe_normalize_2d, Orientation, Point3d, Vector3d};
use crate::{EntityId, ParkingSpaceId};
use cgmath::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashSet;
use std::ops::Add;

/// The size in cm of an area with unit scale.
const AREA_UNIT: f64 = 100.0;

/// Park areas are larger so that cars notice them before driving past.
const PARK_AREA_UNIT: f64 = 300.0;

/// Pedestrians and bicycles only stop for stop areas within 30 degrees of their heading.
const FACING_COS: f64 = 0.866_025_403_784_438_6;

/// Rules which apply within a regulation zone.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ZoneRules {
    /// When zones overlap, the zone with the lowest priority number wins.
    pub priority: i32,
    /// The speed limit in cm/s.
    pub speed_limit: f64,
    /// The keypoint rule flags applying within the zone.
    pub rules: u32,
}

impl Default for ZoneRules {
    fn default() -> Self {
        Self {
            priority: 0,
            speed_limit: 833.0,
            rules: 1,
        }
    }
}

impl Add for ZoneRules {
    type Output = ZoneRules;

    fn add(self, other: ZoneRules) -> ZoneRules {
        use std::cmp::Ordering::*;
        match self.priority.cmp(&other.priority) {
            Less => self,
            Greater => other,
            Equal => ZoneRules {
                priority: self.priority,
                speed_limit: self.speed_limit.max(other.speed_limit),
                rules: self.rules | other.rules,
            },
        }
    }
}

/// The behaviour of a [TrafficArea].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AreaKind {
    /// Entities inside stop while the area is active.
    Stop { active: bool },
    /// Entities inside give way to everyone else.
    Yield,
    /// Cars inside obey the zone's speed limit.
    Regulation(ZoneRules),
    /// Cars entering may park in the linked space, if the rules allow them to.
    Park {
        space: ParkingSpaceId,
        parking_rules: u32,
    },
    /// Trams slow down inside, stop once they leave, and wait `stop_time`
    /// seconds before setting off at `leave_speed`.
    TramStation { stop_time: f64, leave_speed: f64 },
    /// Trams inside turn the lights of a [crate::TramLight] red.
    TramLight,
}

/// A change in an entity's membership of an area.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AreaChange {
    Entered,
    Exited,
    /// The entity's predicted rectangle started overlapping the area.
    FutureEntered,
    /// The entity's predicted rectangle stopped overlapping the area.
    FutureExited,
}

/// A box-shaped region of the world.
#[derive(Clone, Debug)]
pub struct TrafficArea {
    rect: CollisionRectangle,
    kind: AreaKind,
    /// The entities whose rectangles overlap the area.
    members: HashSet<EntityId>,
    /// The entities whose predicted rectangles overlap the area.
    future_members: HashSet<EntityId>,
}

impl TrafficArea {
    /// Creates an area from a placement in the world.
    ///
    /// The area's box is `scale` times the unit size and rests on `location`.
    pub fn new(kind: AreaKind, location: Point3d, rotation: Orientation, scale: Vector3d) -> Self {
        let unit = match kind {
            AreaKind::Park { .. } => PARK_AREA_UNIT,
            _ => AREA_UNIT,
        };
        let centre = location + Vector3d::unit_z() * scale.z * 0.5 * AREA_UNIT;
        Self {
            rect: CollisionRectangle::new(scale * unit, centre, rotation),
            kind,
            members: HashSet::new(),
            future_members: HashSet::new(),
        }
    }

    pub fn rect(&self) -> &CollisionRectangle {
        &self.rect
    }

    pub fn kind(&self) -> &AreaKind {
        &self.kind
    }

    /// Whether this is an active stop area.
    pub fn active(&self) -> bool {
        matches!(self.kind, AreaKind::Stop { active: true })
    }

    /// Activates a stop area. Has no effect on other kinds of area.
    pub fn activate(&mut self) {
        self.set_active(true);
    }

    /// Deactivates a stop area. Has no effect on other kinds of area.
    pub fn deactivate(&mut self) {
        self.set_active(false);
    }

    pub fn set_active(&mut self, active: bool) {
        if let AreaKind::Stop { active: a } = &mut self.kind {
            *a = active;
        }
    }

    /// Whether an entity is inside the area.
    pub fn contains(&self, id: EntityId) -> bool {
        self.members.contains(&id)
    }

    pub fn members(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.members.iter().copied()
    }

    /// Whether the area affects entities of the given class.
    pub fn applies_to(&self, class: EntityClass) -> bool {
        match self.kind {
            AreaKind::Regulation(_) | AreaKind::Park { .. } => class == EntityClass::Car,
            AreaKind::TramStation { .. } | AreaKind::TramLight => class == EntityClass::Tram,
            AreaKind::Stop { .. } | AreaKind::Yield => true,
        }
    }

    /// Whether an entity heading in `direction` is facing the same way as the area.
    pub fn faces(&self, direction: Vector3d) -> bool {
        let area = safe_normalize_2d(flatten_vec(self.rect.forward()));
        let dir = safe_normalize_2d(flatten_vec(direction));
        area.dot(dir) > FACING_COS
    }

    /// Updates an entity's membership given its current and predicted rectangles.
    pub(crate) fn update(
        &mut self,
        id: EntityId,
        current: &CollisionRectangle,
        future: &CollisionRectangle,
    ) -> SmallVec<[AreaChange; 2]> {
        let mut changes = SmallVec::new();
        if self.rect.intersects(current) {
            if self.members.insert(id) {
                changes.push(AreaChange::Entered);
            }
        } else if self.members.remove(&id) {
            changes.push(AreaChange::Exited);
        }
        if let AreaKind::Stop { .. } = self.kind {
            if self.rect.intersects(future) {
                if self.future_members.insert(id) {
                    changes.push(AreaChange::FutureEntered);
                }
            } else if self.future_members.remove(&id) {
                changes.push(AreaChange::FutureExited);
            }
        }
        changes
    }

    /// Forgets an entity which no longer exists.
    pub(crate) fn forget(&mut self, id: EntityId) {
        self.members.remove(&id);
        self.future_members.remove(&id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::math::rotation_from_direction;
    use assert_approx_eq::assert_approx_eq;
    use slotmap::SlotMap;

    fn rect_at(x: f64) -> CollisionRectangle {
        CollisionRectangle::new(
            Vector3d::new(500.0, 200.0, 150.0),
            Point3d::new(x, 0.0, 75.0),
            rotation_from_direction(Vector3d::unit_x()),
        )
    }

    #[test]
    fn area_box_is_scaled() {
        let rot = rotation_from_direction(Vector3d::unit_x());
        let scale = Vector3d::new(2.0, 3.0, 4.0);
        let stop = TrafficArea::new(AreaKind::Stop { active: false }, Point3d::new(0.0, 0.0, 10.0), rot, scale);
        assert_approx_eq!(stop.rect().dimensions().x, 200.0);
        assert_approx_eq!(stop.rect().dimensions().y, 300.0);
        assert_approx_eq!(stop.rect().position().z, 210.0);

        let mut spaces = SlotMap::<ParkingSpaceId, ()>::with_key();
        let space = spaces.insert(());
        let park = TrafficArea::new(
            AreaKind::Park { space, parking_rules: 1 },
            Point3d::new(0.0, 0.0, 0.0),
            rot,
            scale,
        );
        assert_approx_eq!(park.rect().dimensions().x, 600.0);
        assert_approx_eq!(park.rect().position().z, 200.0);
    }

    #[test]
    fn zone_rules_merge() {
        let low = ZoneRules { priority: 0, speed_limit: 500.0, rules: 1 };
        let high = ZoneRules { priority: 1, speed_limit: 1000.0, rules: 2 };
        assert_eq!(low + high, low);
        assert_eq!(high + low, low);
        let other = ZoneRules { priority: 0, speed_limit: 700.0, rules: 4 };
        let merged = low + other;
        assert_approx_eq!(merged.speed_limit, 700.0);
        assert_eq!(merged.rules, 5);
    }

    #[test]
    fn membership_changes() {
        let mut ids = SlotMap::<EntityId, ()>::with_key();
        let id = ids.insert(());
        let rot = rotation_from_direction(Vector3d::unit_x());
        let mut area = TrafficArea::new(
            AreaKind::Stop { active: true },
            Point3d::new(1000.0, 0.0, 0.0),
            rot,
            Vector3d::new(2.0, 4.0, 2.0),
        );
        // Only the predicted rectangle reaches the area.
        let changes = area.update(id, &rect_at(0.0), &rect_at(800.0));
        assert_eq!(changes.as_slice(), &[AreaChange::FutureEntered]);
        let changes = area.update(id, &rect_at(800.0), &rect_at(1000.0));
        assert_eq!(changes.as_slice(), &[AreaChange::Entered]);
        assert!(area.update(id, &rect_at(800.0), &rect_at(1000.0)).is_empty());
        let changes = area.update(id, &rect_at(3000.0), &rect_at(3500.0));
        assert_eq!(changes.as_slice(), &[AreaChange::Exited, AreaChange::FutureExited]);
        assert!(!area.contains(id));
    }

    #[test]
    fn tram_areas_only_see_trams() {
        let rot = rotation_from_direction(Vector3d::unit_x());
        let scale = Vector3d::new(1.0, 1.0, 1.0);
        let station = TrafficArea::new(
            AreaKind::TramStation { stop_time: 10.0, leave_speed: 1000.0 },
            Point3d::new(0.0, 0.0, 0.0),
            rot,
            scale,
        );
        let light = TrafficArea::new(AreaKind::TramLight, Point3d::new(0.0, 0.0, 0.0), rot, scale);
        for area in [station, light] {
            assert!(area.applies_to(EntityClass::Tram));
            assert!(!area.applies_to(EntityClass::Car));
            assert!(!area.applies_to(EntityClass::Pedestrian));
            assert!(!area.active());
        }
    }

    #[test]
    fn facing_test() {
        let rot = rotation_from_direction(Vector3d::unit_y());
        let area = TrafficArea::new(AreaKind::Yield, Point3d::new(0.0, 0.0, 0.0), rot, Vector3d::new(1.0, 1.0, 1.0));
        assert!(area.faces(Vector3d::new(0.2, 1.0, 0.0)));
        assert!(!area.faces(Vector3d::new(1.0, 1.0, 0.0)));
        assert!(!area.faces(Vector3d::new(0.0, -1.0, 0.0)));
    }
}
