//! Traffic lights and the intersections which coordinate them.

use crate::{AreaSet, AreaId, IntersectionId, LightGroupId, LightGroupSet};
use log::{debug, trace, warn};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The state of a traffic light.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LightState {
    Red,
    RedYellow,
    Green,
    Yellow,
}

impl LightState {
    /// Whether traffic must stop at a light in this state.
    pub fn stops_traffic(self) -> bool {
        self != LightState::Green
    }

    /// The state which follows this one.
    pub fn next(self) -> LightState {
        use LightState::*;
        match self {
            Red => RedYellow,
            RedYellow => Green,
            Green => Yellow,
            Yellow => Red,
        }
    }
}

/// What decides the state of a light group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Control {
    /// Cycles on its own timer.
    Standalone,
    /// Cycled in turn with the other groups of an intersection.
    Intersection(IntersectionId),
    /// Set every tick by a [TramIntersectionController].
    Tram,
}

/// A set of traffic lights which always show the same state, controlling a set of stop areas.
///
/// A group on its own cycles forever, spending as long on red as on green. A group
/// belonging to an [IntersectionController] stays red until the intersection cycles it.
/// A group belonging to a [TramIntersectionController] stays green unless a tram is near.
#[derive(Clone, Debug)]
pub struct TrafficLightGroup {
    state: LightState,
    /// Seconds until the next state change.
    remaining: f64,
    /// The stop areas which are active unless the light is green.
    stop_areas: Vec<AreaId>,
    control: Control,
    yellow_duration: f64,
    green_duration: f64,
}

impl TrafficLightGroup {
    /// Creates a red light group with the default durations.
    pub fn new(stop_areas: Vec<AreaId>) -> Self {
        Self {
            state: LightState::Red,
            remaining: 12.0,
            stop_areas,
            control: Control::Standalone,
            yellow_duration: 2.0,
            green_duration: 12.0,
        }
    }

    /// Sets the durations of the yellow phases and the green phase in seconds.
    pub fn with_durations(mut self, yellow: f64, green: f64) -> Self {
        self.yellow_duration = yellow;
        self.green_duration = green;
        self.remaining = self.duration(self.state);
        self
    }

    pub fn state(&self) -> LightState {
        self.state
    }

    pub fn time_remaining(&self) -> f64 {
        self.remaining
    }

    pub fn stop_areas(&self) -> &[AreaId] {
        &self.stop_areas
    }

    pub fn intersection(&self) -> Option<IntersectionId> {
        match self.control {
            Control::Intersection(id) => Some(id),
            _ => None,
        }
    }

    /// Whether a tram intersection sets this group's state.
    pub fn tram_controlled(&self) -> bool {
        self.control == Control::Tram
    }

    pub fn green_duration(&self) -> f64 {
        self.green_duration
    }

    /// Changes how long the light stays green, from the next green phase on.
    pub(crate) fn set_green_duration(&mut self, seconds: f64) {
        self.green_duration = seconds.max(0.0);
    }

    fn duration(&self, state: LightState) -> f64 {
        match state {
            LightState::Red | LightState::Green => self.green_duration,
            LightState::RedYellow | LightState::Yellow => self.yellow_duration,
        }
    }

    /// Activates or deactivates the group's stop areas to match its state.
    pub(crate) fn apply(&self, areas: &mut AreaSet) {
        let active = self.state.stops_traffic();
        for id in &self.stop_areas {
            match areas.get_mut(*id) {
                Some(area) => area.set_active(active),
                None => warn!("Traffic light controls a stop area which does not exist"),
            }
        }
    }

    /// Changes the state and restarts the timer, unless already in that state.
    pub(crate) fn set_state(&mut self, state: LightState, areas: &mut AreaSet) {
        if state == self.state {
            return;
        }
        self.state = state;
        self.remaining = self.duration(state);
        self.apply(areas);
    }

    /// Starts the next cycle of a group belonging to an intersection.
    pub(crate) fn cycle(&mut self, areas: &mut AreaSet) {
        if self.intersection().is_some() {
            self.set_state(LightState::RedYellow, areas);
        }
    }

    /// Advances the timer by `dt` seconds.
    ///
    /// Returns true when a group belonging to an intersection has turned red,
    /// completing its cycle.
    pub(crate) fn step(&mut self, dt: f64, areas: &mut AreaSet) -> bool {
        let cycled = match self.control {
            Control::Standalone => false,
            Control::Intersection(_) => true,
            Control::Tram => return false,
        };
        if self.remaining <= 0.0 || (cycled && self.state == LightState::Red) {
            return false;
        }
        self.remaining -= dt;
        if self.remaining > 0.0 {
            return false;
        }
        let next = self.state.next();
        self.set_state(next, areas);
        next == LightState::Red && cycled
    }
}

/// Cycles a set of light groups in turn, so only one is ever not red.
#[derive(Clone, Debug)]
pub struct IntersectionController {
    groups: Vec<LightGroupId>,
    /// The index of the group currently cycling.
    cycling: usize,
}

impl IntersectionController {
    pub(crate) fn new(groups: Vec<LightGroupId>) -> Self {
        Self { groups, cycling: 0 }
    }

    pub fn groups(&self) -> &[LightGroupId] {
        &self.groups
    }

    /// The index of the group currently cycling.
    pub fn cycling_group(&self) -> usize {
        self.cycling
    }

    pub(crate) fn set_cycling_group(&mut self, index: usize) {
        if index < self.groups.len() {
            self.cycling = index;
        }
    }

    /// Takes control of the groups and starts the first cycle.
    pub(crate) fn connect(
        &self,
        id: IntersectionId,
        groups: &mut LightGroupSet,
        areas: &mut AreaSet,
    ) {
        for group_id in &self.groups {
            if let Some(group) = groups.get_mut(*group_id) {
                group.control = Control::Intersection(id);
                group.set_state(LightState::Red, areas);
                group.apply(areas);
            }
        }
        self.start_current(groups, areas);
    }

    /// Called when the cycling group turns red: starts the next group's cycle.
    pub(crate) fn cycle_finished(&mut self, groups: &mut LightGroupSet, areas: &mut AreaSet) {
        if self.groups.is_empty() {
            return;
        }
        self.cycling = (self.cycling + 1) % self.groups.len();
        debug!("Intersection cycles light group {}", self.cycling);
        self.start_current(groups, areas);
    }

    /// Turns every group red and restarts the current group's cycle.
    pub(crate) fn reset_lights(&self, groups: &mut LightGroupSet, areas: &mut AreaSet) {
        for group_id in &self.groups {
            if let Some(group) = groups.get_mut(*group_id) {
                group.set_state(LightState::Red, areas);
            }
        }
        self.start_current(groups, areas);
    }

    fn start_current(&self, groups: &mut LightGroupSet, areas: &mut AreaSet) {
        if let Some(group) = self.groups.get(self.cycling).and_then(|id| groups.get_mut(*id)) {
            group.cycle(areas);
        }
    }
}

/// What a tram light shows to the traffic crossing the tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TramSignal {
    /// No tram is near.
    Clear,
    /// A tram has just arrived, or the last one has just left.
    Changing,
    /// Trams are crossing.
    Stop,
}

impl TramSignal {
    fn light_state(self) -> LightState {
        match self {
            TramSignal::Clear => LightState::Green,
            TramSignal::Changing => LightState::Yellow,
            TramSignal::Stop => LightState::Red,
        }
    }
}

/// Turns light groups red while trams are inside an area.
#[derive(Clone, Debug)]
pub struct TramLight {
    /// The area trams are detected in.
    area: AreaId,
    /// Groups which turn red whenever a tram is inside the area.
    red: Vec<LightGroupId>,
    /// Groups which turn red only when no other tram light of the intersection is active.
    red_when_clear: Vec<LightGroupId>,
    yellow_duration: f64,
    signal: TramSignal,
    /// The signal shown once the yellow phase is over.
    next: TramSignal,
    remaining: f64,
    occupied: bool,
}

impl TramLight {
    pub fn new(area: AreaId, red: Vec<LightGroupId>, red_when_clear: Vec<LightGroupId>) -> Self {
        Self {
            area,
            red,
            red_when_clear,
            yellow_duration: 2.0,
            signal: TramSignal::Clear,
            next: TramSignal::Clear,
            remaining: 0.0,
            occupied: false,
        }
    }

    pub fn with_yellow_duration(mut self, seconds: f64) -> Self {
        self.yellow_duration = seconds.max(0.0);
        self
    }

    pub fn area(&self) -> AreaId {
        self.area
    }

    pub fn signal(&self) -> TramSignal {
        self.signal
    }

    fn step(&mut self, occupied: bool, dt: f64) {
        if occupied != self.occupied {
            trace!("Tram light area {:?} occupied: {}", self.area, occupied);
            self.occupied = occupied;
            self.signal = TramSignal::Changing;
            self.next = if occupied { TramSignal::Stop } else { TramSignal::Clear };
            self.remaining = self.yellow_duration;
        } else if self.signal != self.next {
            self.remaining -= dt;
            if self.remaining <= 0.0 {
                self.signal = self.next;
            }
        }
    }

    fn groups(&self) -> impl Iterator<Item = LightGroupId> + '_ {
        self.red.iter().chain(&self.red_when_clear).copied()
    }
}

/// Keeps the lights of a tram crossing green, except for those a tram is approaching.
#[derive(Clone, Debug)]
pub struct TramIntersectionController {
    lights: Vec<TramLight>,
}

impl TramIntersectionController {
    pub(crate) fn new(lights: Vec<TramLight>) -> Self {
        Self { lights }
    }

    pub fn lights(&self) -> &[TramLight] {
        &self.lights
    }

    /// Takes control of every group of the intersection's lights and turns them green.
    pub(crate) fn connect(&self, groups: &mut LightGroupSet, areas: &mut AreaSet) {
        for id in self.lights.iter().flat_map(TramLight::groups) {
            match groups.get_mut(id) {
                Some(group) => {
                    group.control = Control::Tram;
                    group.set_state(LightState::Green, areas);
                }
                None => warn!("Tram light controls a light group which does not exist"),
            }
        }
    }

    /// Updates each light from the trams inside its area, then sets every group
    /// to match. Groups of a light which isn't clear show its signal, other groups
    /// are green.
    pub(crate) fn step(&mut self, dt: f64, groups: &mut LightGroupSet, areas: &mut AreaSet) {
        for light in &mut self.lights {
            let occupied = areas.get(light.area).map_or(false, |a| a.members().next().is_some());
            light.step(occupied, dt);
        }

        let mut states = self
            .lights
            .iter()
            .flat_map(TramLight::groups)
            .map(|id| (id, LightState::Green))
            .collect::<Vec<_>>();
        let active = self.lights.iter().filter(|l| l.signal != TramSignal::Clear).count();
        for light in self.lights.iter().filter(|l| l.signal != TramSignal::Clear) {
            let state = light.signal.light_state();
            let when_clear: &[LightGroupId] = if active == 1 { &light.red_when_clear } else { &[] };
            for id in light.red.iter().chain(when_clear) {
                for entry in states.iter_mut().filter(|(group, _)| group == id) {
                    entry.1 = state;
                }
            }
        }
        for (id, state) in states {
            if let Some(group) = groups.get_mut(id) {
                group.set_state(state, areas);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::area::{AreaKind, TrafficArea};
    use crate::math::{rotation_from_direction, Point3d, Vector3d};
    use crate::collision::CollisionRectangle;
    use crate::{EntityId, IntersectionSet};
    use slotmap::SlotMap;

    fn stop_area(areas: &mut AreaSet) -> AreaId {
        areas.insert(TrafficArea::new(
            AreaKind::Stop { active: false },
            Point3d::new(0.0, 0.0, 0.0),
            rotation_from_direction(Vector3d::unit_x()),
            Vector3d::new(1.0, 1.0, 1.0),
        ))
    }

    #[test]
    fn standalone_group_cycles() {
        let mut areas = AreaSet::with_key();
        let area = stop_area(&mut areas);
        let mut group = TrafficLightGroup::new(vec![area]).with_durations(1.0, 3.0);
        group.apply(&mut areas);
        assert!(areas[area].active());

        let mut states = vec![];
        for _ in 0..90 {
            group.step(0.1, &mut areas);
            if states.last() != Some(&group.state()) {
                states.push(group.state());
            }
            assert_eq!(areas[area].active(), group.state().stops_traffic());
        }
        use LightState::*;
        assert_eq!(states, vec![Red, RedYellow, Green, Yellow, Red]);
    }

    #[test]
    fn intersection_cycles_groups_in_turn() {
        let mut areas = AreaSet::with_key();
        let mut groups = LightGroupSet::with_key();
        let mut intersections = IntersectionSet::with_key();
        let ids = (0..3)
            .map(|_| {
                let area = stop_area(&mut areas);
                groups.insert(TrafficLightGroup::new(vec![area]).with_durations(1.0, 2.0))
            })
            .collect::<Vec<_>>();
        let id = intersections.insert(IntersectionController::new(ids.clone()));
        intersections[id].connect(id, &mut groups, &mut areas);
        assert_eq!(groups[ids[0]].state(), LightState::RedYellow);

        let mut seen_green = vec![false; 3];
        for _ in 0..200 {
            let finished = groups
                .values_mut()
                .filter_map(|g| if g.step(0.1, &mut areas) { g.intersection() } else { None })
                .collect::<Vec<_>>();
            for i in finished {
                intersections[i].cycle_finished(&mut groups, &mut areas);
            }
            let not_red = ids.iter().filter(|g| groups[**g].state() != LightState::Red).count();
            assert!(not_red <= 1);
            for (i, g) in ids.iter().enumerate() {
                seen_green[i] |= groups[*g].state() == LightState::Green;
            }
        }
        assert!(seen_green.iter().all(|s| *s));
    }

    #[test]
    fn reset_restarts_current_group() {
        let mut areas = AreaSet::with_key();
        let mut groups = LightGroupSet::with_key();
        let mut intersections = IntersectionSet::with_key();
        let a = groups.insert(TrafficLightGroup::new(vec![stop_area(&mut areas)]));
        let b = groups.insert(TrafficLightGroup::new(vec![stop_area(&mut areas)]));
        let id = intersections.insert(IntersectionController::new(vec![a, b]));
        intersections[id].connect(id, &mut groups, &mut areas);
        intersections[id].set_cycling_group(1);
        intersections[id].reset_lights(&mut groups, &mut areas);
        assert_eq!(groups[a].state(), LightState::Red);
        assert_eq!(groups[b].state(), LightState::RedYellow);
    }

    struct Crossing {
        areas: AreaSet,
        groups: LightGroupSet,
        controller: TramIntersectionController,
        tram_areas: Vec<AreaId>,
        /// Red while its own track is occupied.
        road: LightGroupId,
        /// Red while exactly one track is occupied.
        turning: LightGroupId,
    }

    /// Two tracks crossing a road. Each track's light stops the road, and the
    /// turning lane only while a single tram is crossing.
    fn crossing() -> Crossing {
        let mut areas = AreaSet::with_key();
        let mut groups = LightGroupSet::with_key();
        let road = groups.insert(TrafficLightGroup::new(vec![stop_area(&mut areas)]));
        let turning = groups.insert(TrafficLightGroup::new(vec![stop_area(&mut areas)]));
        let tram_areas = [0.0, 5000.0]
            .into_iter()
            .map(|x| {
                areas.insert(TrafficArea::new(
                    AreaKind::TramLight,
                    Point3d::new(x, 0.0, 0.0),
                    rotation_from_direction(Vector3d::unit_x()),
                    Vector3d::new(10.0, 10.0, 1.0),
                ))
            })
            .collect::<Vec<_>>();
        let lights = tram_areas
            .iter()
            .map(|area| TramLight::new(*area, vec![road], vec![turning]).with_yellow_duration(1.0))
            .collect();
        let controller = TramIntersectionController::new(lights);
        controller.connect(&mut groups, &mut areas);
        Crossing { areas, groups, controller, tram_areas, road, turning }
    }

    impl Crossing {
        fn move_tram(&mut self, tram: EntityId, area: usize, inside: bool) {
            let x = if inside { self.areas[self.tram_areas[area]].rect().position().x } else { -1e5 };
            let rect = CollisionRectangle::new(
                Vector3d::new(3000.0, 250.0, 300.0),
                Point3d::new(x, 0.0, 150.0),
                rotation_from_direction(Vector3d::unit_x()),
            );
            self.areas[self.tram_areas[area]].update(tram, &rect, &rect);
        }

        fn run(&mut self, seconds: f64) {
            for _ in 0..(seconds * 10.0).round() as usize {
                self.controller.step(0.1, &mut self.groups, &mut self.areas);
            }
        }
    }

    fn tram_ids() -> (EntityId, EntityId) {
        let mut ids = SlotMap::<EntityId, ()>::with_key();
        (ids.insert(()), ids.insert(()))
    }

    #[test]
    fn tram_crossing_turns_red_while_occupied() {
        let mut crossing = crossing();
        let (tram, _) = tram_ids();
        assert_eq!(crossing.groups[crossing.road].state(), LightState::Green);
        assert!(crossing.groups[crossing.road].tram_controlled());
        assert!(!crossing.areas[crossing.groups[crossing.road].stop_areas()[0]].active());

        crossing.move_tram(tram, 0, true);
        crossing.run(0.5);
        assert_eq!(crossing.controller.lights()[0].signal(), TramSignal::Changing);
        assert_eq!(crossing.groups[crossing.road].state(), LightState::Yellow);
        crossing.run(1.0);
        assert_eq!(crossing.controller.lights()[0].signal(), TramSignal::Stop);
        assert_eq!(crossing.groups[crossing.road].state(), LightState::Red);
        assert!(crossing.areas[crossing.groups[crossing.road].stop_areas()[0]].active());

        crossing.move_tram(tram, 0, false);
        crossing.run(0.5);
        assert_eq!(crossing.groups[crossing.road].state(), LightState::Yellow);
        crossing.run(1.0);
        assert_eq!(crossing.controller.lights()[0].signal(), TramSignal::Clear);
        assert_eq!(crossing.groups[crossing.road].state(), LightState::Green);
    }

    #[test]
    fn red_when_clear_only_with_a_single_tram() {
        let mut crossing = crossing();
        let (first, second) = tram_ids();
        crossing.move_tram(first, 0, true);
        crossing.run(2.0);
        assert_eq!(crossing.groups[crossing.turning].state(), LightState::Red);

        crossing.move_tram(second, 1, true);
        crossing.run(2.0);
        assert_eq!(crossing.groups[crossing.road].state(), LightState::Red);
        assert_eq!(crossing.groups[crossing.turning].state(), LightState::Green);

        crossing.move_tram(first, 0, false);
        crossing.run(2.0);
        assert_eq!(crossing.groups[crossing.turning].state(), LightState::Red);
    }

    #[test]
    fn tram_controlled_groups_do_not_cycle() {
        let mut crossing = crossing();
        let road = crossing.road;
        for _ in 0..100 {
            assert!(!crossing.groups[road].step(0.1, &mut crossing.areas));
        }
        assert_eq!(crossing.groups[road].state(), LightState::Green);
    }
}
