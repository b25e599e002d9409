//! AI state machine driver
//!
//! One [`Ai`] record per controlled entity, stored in a slotmap arena and
//! advanced once per server tick. Each tick the driver evaluates the record's
//! transition rules, then issues at most one movement or combat command
//! through the owner's capabilities. Missing capabilities are skipped.
//!
//! Records are evaluated under the arena write lock; commands are issued
//! after the lock is released, so a capability that calls back into the
//! driver (a death callback calling [`AiDriver::remove_ai`]) cannot deadlock.

use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};
use tracing::{debug, trace, warn};

use crate::config::AiTuning;
use crate::game::constants::ai::*;
use crate::game::entity::{Entity, EntityId, EntityKind, MapId, Stat, World, NO_TARGET};
use crate::game::spatial::VisionService;
use crate::game::systems::patrol::parse_patrol_points;
use crate::game::tables::{AiTemplate, ConfigTables};
use crate::util::vec3::Vec3;

/// Which behavior family an AI runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiKind {
    Monster,
    /// Placeholder family; NPC AIs stay `Idle`
    Npc,
}

/// AI behavior state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AiBehavior {
    Idle,
    Patrolling,
    Chasing,
    Attacking,
    Fleeing,
}

impl AiBehavior {
    pub const ALL: [AiBehavior; 5] = [
        AiBehavior::Idle,
        AiBehavior::Patrolling,
        AiBehavior::Chasing,
        AiBehavior::Attacking,
        AiBehavior::Fleeing,
    ];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            AiBehavior::Idle => 0,
            AiBehavior::Patrolling => 1,
            AiBehavior::Chasing => 2,
            AiBehavior::Attacking => 3,
            AiBehavior::Fleeing => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AiBehavior::Idle => "idle",
            AiBehavior::Patrolling => "patrolling",
            AiBehavior::Chasing => "chasing",
            AiBehavior::Attacking => "attacking",
            AiBehavior::Fleeing => "fleeing",
        }
    }

    /// States that depend on a live target
    #[inline]
    fn is_engaged(self) -> bool {
        matches!(self, AiBehavior::Chasing | AiBehavior::Attacking | AiBehavior::Fleeing)
    }
}

/// Per-entity AI record
#[derive(Debug, Clone, PartialEq)]
pub struct Ai {
    pub owner: EntityId,
    pub kind: AiKind,
    pub behavior: AiBehavior,
    /// `NO_TARGET` when there is none
    pub target_id: EntityId,
    pub patrol_points: Vec<Vec3>,
    pub patrol_index: usize,
    pub detection_range: f32,
    pub attack_range: f32,
    pub chase_range: f32,
    /// 0 disables fleeing
    pub flee_health_ratio: f32,
    pub last_action: Option<Instant>,
}

impl Default for Ai {
    fn default() -> Self {
        Self {
            owner: NO_TARGET,
            kind: AiKind::Monster,
            behavior: AiBehavior::Idle,
            target_id: NO_TARGET,
            patrol_points: Vec::new(),
            patrol_index: 0,
            detection_range: DEFAULT_DETECTION_RANGE,
            attack_range: DEFAULT_ATTACK_RANGE,
            chase_range: DEFAULT_CHASE_RANGE,
            flee_health_ratio: 0.0,
            last_action: None,
        }
    }
}

impl Ai {
    /// Overwrite every field; recycled records keep only their patrol buffer
    fn reset(&mut self, owner: EntityId, params: AiParams) {
        self.owner = owner;
        self.kind = params.kind;
        self.target_id = NO_TARGET;
        self.patrol_points.clear();
        self.patrol_points.extend(params.patrol_points);
        self.patrol_index = 0;
        self.detection_range = params.detection_range;
        self.attack_range = params.attack_range;
        self.chase_range = params.chase_range;
        self.flee_health_ratio = params.flee_health_ratio;
        self.last_action = None;
        self.behavior = if self.kind == AiKind::Monster && !self.patrol_points.is_empty() {
            AiBehavior::Patrolling
        } else {
            AiBehavior::Idle
        };
    }
}

/// Parameters for attaching an AI to an entity
#[derive(Debug, Clone, PartialEq)]
pub struct AiParams {
    pub kind: AiKind,
    pub detection_range: f32,
    pub attack_range: f32,
    pub chase_range: f32,
    pub flee_health_ratio: f32,
    pub patrol_points: Vec<Vec3>,
}

impl Default for AiParams {
    fn default() -> Self {
        Self {
            kind: AiKind::Monster,
            detection_range: DEFAULT_DETECTION_RANGE,
            attack_range: DEFAULT_ATTACK_RANGE,
            chase_range: DEFAULT_CHASE_RANGE,
            flee_health_ratio: 0.0,
            patrol_points: Vec::new(),
        }
    }
}

impl From<&AiTemplate> for AiParams {
    fn from(template: &AiTemplate) -> Self {
        Self {
            kind: template.kind,
            detection_range: template.detection_range,
            attack_range: template.attack_range,
            chase_range: template.chase_range,
            flee_health_ratio: template.flee_health_ratio,
            patrol_points: parse_patrol_points(&template.patrol_points),
        }
    }
}

new_key_type! {
    /// Generation-checked handle to an arena slot
    pub struct AiHandle;
}

/// Arena slot tying an owner to its record
#[derive(Debug)]
pub struct AiState {
    pub owner: EntityId,
    pub ai: Ai,
}

#[derive(Default)]
struct AiArena {
    slots: SlotMap<AiHandle, AiState>,
    by_owner: HashMap<EntityId, AiHandle>,
    /// Released records kept for their patrol buffers
    spare: Vec<Ai>,
}

impl AiArena {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: SlotMap::with_capacity_and_key(capacity),
            by_owner: HashMap::with_capacity(capacity),
            spare: Vec::new(),
        }
    }

    fn get_mut(&mut self, owner: EntityId) -> Option<&mut Ai> {
        let handle = *self.by_owner.get(&owner)?;
        self.slots.get_mut(handle).map(|state| &mut state.ai)
    }

    fn get(&self, owner: EntityId) -> Option<&Ai> {
        let handle = *self.by_owner.get(&owner)?;
        self.slots.get(handle).map(|state| &state.ai)
    }
}

/// Command issued after the record lock is released
#[derive(Debug, Clone, Copy, PartialEq)]
enum Command {
    Move { destination: Vec3, speed: f32 },
    Attack(EntityId),
}

/// Result of advancing one AI by one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No record, or nothing to do without a resolvable owner
    Skipped,
    Unchanged(AiBehavior),
    Transitioned { from: AiBehavior, to: AiBehavior },
}

/// Summary of one driver tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub evaluated: usize,
    pub skipped: usize,
    pub transitions: usize,
}

/// Owns every AI record and advances them each tick
pub struct AiDriver {
    world: Arc<dyn World>,
    tables: Arc<ConfigTables>,
    tuning: AiTuning,
    vision: Option<Arc<VisionService>>,
    arena: RwLock<AiArena>,
}

impl AiDriver {
    pub fn new(world: Arc<dyn World>, tables: Arc<ConfigTables>, tuning: AiTuning) -> Self {
        Self {
            world,
            tables,
            tuning,
            vision: None,
            arena: RwLock::new(AiArena::with_capacity(INITIAL_CAPACITY)),
        }
    }

    /// Attach a vision service; used when `require_line_of_sight` is set
    pub fn with_vision(mut self, vision: Arc<VisionService>) -> Self {
        self.vision = Some(vision);
        self
    }

    pub fn tuning(&self) -> &AiTuning {
        &self.tuning
    }

    /// Attach (or fully re-initialize) an AI for `owner`
    pub fn init_ai(&self, owner: EntityId, params: AiParams) -> AiHandle {
        let mut arena = self.arena.write();
        if let Some(&handle) = arena.by_owner.get(&owner) {
            if let Some(state) = arena.slots.get_mut(handle) {
                state.ai.reset(owner, params);
                debug!("Re-initialized AI for entity {}", owner);
                return handle;
            }
        }

        let mut ai = arena.spare.pop().unwrap_or_default();
        ai.reset(owner, params);
        let handle = arena.slots.insert(AiState { owner, ai });
        arena.by_owner.insert(owner, handle);
        trace!("Attached AI to entity {}", owner);
        handle
    }

    /// Attach an AI from an AI template; unknown ids are logged and skipped
    pub fn init_ai_from_config(&self, owner: EntityId, ai_id: u32) -> Option<AiHandle> {
        let Some(template) = self.tables.ai(ai_id) else {
            warn!("Unknown AI config id {} for entity {}, no AI attached", ai_id, owner);
            return None;
        };
        Some(self.init_ai(owner, AiParams::from(template)))
    }

    /// Replace an AI's patrol route; an idle monster starts patrolling
    pub fn set_patrol_points(&self, owner: EntityId, points: Vec<Vec3>) -> bool {
        let mut arena = self.arena.write();
        let Some(ai) = arena.get_mut(owner) else {
            return false;
        };
        ai.patrol_points = points;
        ai.patrol_index = 0;
        if ai.kind == AiKind::Monster
            && ai.behavior == AiBehavior::Idle
            && !ai.patrol_points.is_empty()
        {
            ai.behavior = AiBehavior::Patrolling;
        }
        true
    }

    /// Same as [`Self::set_patrol_points`] with a `"x,y,z;x,y,z"` route
    pub fn set_patrol_points_str(&self, owner: EntityId, raw: &str) -> bool {
        self.set_patrol_points(owner, parse_patrol_points(raw))
    }

    /// Detach the AI from `owner`
    pub fn remove_ai(&self, owner: EntityId) -> bool {
        let mut arena = self.arena.write();
        let Some(handle) = arena.by_owner.remove(&owner) else {
            return false;
        };
        if let Some(state) = arena.slots.remove(handle) {
            if arena.spare.len() < INITIAL_CAPACITY {
                arena.spare.push(state.ai);
            }
        }
        trace!("Detached AI from entity {}", owner);
        true
    }

    /// Point an AI at a target; idle or patrolling monsters start chasing
    pub fn assign_target(&self, owner: EntityId, target: EntityId) -> bool {
        let mut arena = self.arena.write();
        let Some(ai) = arena.get_mut(owner) else {
            return false;
        };
        if ai.kind != AiKind::Monster {
            return false;
        }
        ai.target_id = target;
        if target != NO_TARGET
            && matches!(ai.behavior, AiBehavior::Idle | AiBehavior::Patrolling)
        {
            ai.behavior = AiBehavior::Chasing;
        }
        true
    }

    pub fn snapshot(&self, owner: EntityId) -> Option<Ai> {
        self.arena.read().get(owner).cloned()
    }

    pub fn behavior(&self, owner: EntityId) -> Option<AiBehavior> {
        self.arena.read().get(owner).map(|ai| ai.behavior)
    }

    pub fn contains(&self, owner: EntityId) -> bool {
        self.arena.read().by_owner.contains_key(&owner)
    }

    pub fn len(&self) -> usize {
        self.arena.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.read().slots.is_empty()
    }

    /// AI count per state, indexed by [`AiBehavior::index`]
    pub fn state_counts(&self) -> [usize; 5] {
        let mut counts = [0; 5];
        for state in self.arena.read().slots.values() {
            counts[state.ai.behavior.index()] += 1;
        }
        counts
    }

    /// Advance every AI by one tick
    pub fn update(&self, now: Instant) -> TickReport {
        let owners: Vec<EntityId> = self.arena.read().by_owner.keys().copied().collect();

        let mut report = TickReport::default();
        for owner in owners {
            match self.update_ai(owner, now) {
                TickOutcome::Skipped => report.skipped += 1,
                TickOutcome::Unchanged(_) => report.evaluated += 1,
                TickOutcome::Transitioned { .. } => {
                    report.evaluated += 1;
                    report.transitions += 1;
                }
            }
        }
        report
    }

    /// Advance one AI by one tick
    pub fn update_ai(&self, owner: EntityId, now: Instant) -> TickOutcome {
        let entity = self.world.entity(owner);

        let (outcome, command) = {
            let mut arena = self.arena.write();
            let Some(ai) = arena.get_mut(owner) else {
                return TickOutcome::Skipped;
            };
            let from = ai.behavior;

            let Some(entity) = entity.as_deref() else {
                if from.is_engaged() {
                    ai.behavior = AiBehavior::Idle;
                    ai.target_id = NO_TARGET;
                    debug!("AI {} lost its owner, {} -> idle", owner, from.as_str());
                    return TickOutcome::Transitioned { from, to: AiBehavior::Idle };
                }
                return TickOutcome::Skipped;
            };

            let command = match ai.kind {
                AiKind::Monster => self.step_monster(ai, entity),
                AiKind::Npc => {
                    ai.behavior = AiBehavior::Idle;
                    None
                }
            };
            ai.last_action = Some(now);

            let to = ai.behavior;
            let outcome = if from == to {
                TickOutcome::Unchanged(to)
            } else {
                trace!("AI {}: {} -> {}", owner, from.as_str(), to.as_str());
                TickOutcome::Transitioned { from, to }
            };
            (outcome, command)
        };

        if let (Some(command), Some(entity)) = (command, entity.as_deref()) {
            issue(entity, command);
        }
        outcome
    }

    fn step_monster(&self, ai: &mut Ai, owner: &dyn Entity) -> Option<Command> {
        match ai.behavior {
            AiBehavior::Idle => self.on_idle(ai, owner),
            AiBehavior::Patrolling => self.on_patrolling(ai, owner),
            AiBehavior::Chasing => self.on_chasing(ai, owner),
            AiBehavior::Attacking => self.on_attacking(ai, owner),
            AiBehavior::Fleeing => self.on_fleeing(ai, owner),
        }
    }

    fn on_idle(&self, ai: &mut Ai, owner: &dyn Entity) -> Option<Command> {
        if let Some(target) = self.find_target(owner, ai.detection_range) {
            ai.target_id = target;
            ai.behavior = AiBehavior::Chasing;
        } else if !ai.patrol_points.is_empty() {
            ai.behavior = AiBehavior::Patrolling;
        }
        None
    }

    fn on_patrolling(&self, ai: &mut Ai, owner: &dyn Entity) -> Option<Command> {
        if let Some(target) = self.find_target(owner, ai.detection_range) {
            ai.target_id = target;
            ai.behavior = AiBehavior::Chasing;
            return None;
        }
        if ai.patrol_points.is_empty() {
            ai.behavior = AiBehavior::Idle;
            return None;
        }

        let count = ai.patrol_points.len();
        let mut index = ai.patrol_index % count;
        if owner.position().distance_to(ai.patrol_points[index]) <= self.tuning.waypoint_radius {
            index = (index + 1) % count;
        }
        ai.patrol_index = index;

        Some(Command::Move {
            destination: ai.patrol_points[index],
            speed: self.tuning.patrol_speed,
        })
    }

    fn on_chasing(&self, ai: &mut Ai, owner: &dyn Entity) -> Option<Command> {
        let Some(target) = self.resolve_target(ai) else {
            lose_target(ai);
            return None;
        };
        let distance = owner.position().distance_to(target.position());
        if distance > ai.chase_range {
            lose_target(ai);
            return None;
        }
        if distance <= ai.attack_range {
            ai.behavior = AiBehavior::Attacking;
            return None;
        }
        Some(Command::Move {
            destination: target.position(),
            speed: self.tuning.chase_speed,
        })
    }

    fn on_attacking(&self, ai: &mut Ai, owner: &dyn Entity) -> Option<Command> {
        let Some(target) = self.resolve_target(ai) else {
            lose_target(ai);
            return None;
        };
        if owner.position().distance_to(target.position()) > ai.attack_range {
            ai.behavior = AiBehavior::Chasing;
            return None;
        }

        if ai.flee_health_ratio > 0.0 {
            if let Some(props) = owner.components().properties() {
                let max_hp = props.get(Stat::MaxHp);
                if max_hp > 0.0 && props.get(Stat::Hp) / max_hp < ai.flee_health_ratio {
                    ai.behavior = AiBehavior::Fleeing;
                }
            }
        }
        Some(Command::Attack(ai.target_id))
    }

    fn on_fleeing(&self, ai: &mut Ai, owner: &dyn Entity) -> Option<Command> {
        let origin = owner.position();
        let mut away = Vec3::ZERO;

        if ai.target_id != NO_TARGET {
            let Some(target) = self.resolve_target(ai) else {
                lose_target(ai);
                return None;
            };
            let threat = target.position();
            if origin.distance_to(threat) > ai.chase_range {
                lose_target(ai);
                return None;
            }
            away = Vec3::new(origin.x - threat.x, 0.0, origin.z - threat.z).normalize();
        }
        if away == Vec3::ZERO {
            away = Vec3::X;
        }

        Some(Command::Move {
            destination: origin + away * self.tuning.flee_distance,
            speed: self.tuning.flee_speed,
        })
    }

    fn resolve_target(&self, ai: &Ai) -> Option<Arc<dyn Entity>> {
        if ai.target_id == NO_TARGET {
            return None;
        }
        self.world.entity(ai.target_id)
    }

    /// First player within detection range of `owner`, in map order
    pub fn select_target(&self, owner: EntityId) -> Option<EntityId> {
        let range = self.arena.read().get(owner)?.detection_range;
        let entity = self.world.entity(owner)?;
        self.find_target(entity.as_ref(), range)
    }

    fn find_target(&self, owner: &dyn Entity, range: f32) -> Option<EntityId> {
        let map = self.world.map(owner.map_id())?;
        let origin = owner.position();
        let range_sq = range * range;

        map.objects_in_range(origin, range)
            .into_iter()
            .filter(|candidate| candidate.id() != owner.id())
            .filter(|candidate| candidate.kind() == EntityKind::Player)
            .filter(|candidate| origin.distance_sq_to(candidate.position()) <= range_sq)
            .find(|candidate| self.can_see(owner.map_id(), origin, candidate.position()))
            .map(|candidate| candidate.id())
    }

    fn can_see(&self, map_id: MapId, from: Vec3, to: Vec3) -> bool {
        match (&self.vision, self.tuning.require_line_of_sight) {
            (Some(vision), true) => vision.is_visible(map_id, from, to),
            _ => true,
        }
    }

    /// Distance to the nearest player within `owner`'s detection range
    pub fn nearest_player_distance(&self, owner: EntityId) -> Option<f32> {
        let range = self.arena.read().get(owner)?.detection_range;
        let entity = self.world.entity(owner)?;
        let map = self.world.map(entity.map_id())?;
        let origin = entity.position();

        map.objects_in_range(origin, range)
            .into_iter()
            .filter(|candidate| candidate.id() != owner && candidate.kind() == EntityKind::Player)
            .map(|candidate| origin.distance_to(candidate.position()))
            .filter(|distance| *distance <= range)
            .min_by(|a, b| a.total_cmp(b))
    }
}

fn lose_target(ai: &mut Ai) {
    ai.target_id = NO_TARGET;
    ai.behavior = AiBehavior::Idle;
}

fn issue(entity: &dyn Entity, command: Command) {
    let components = entity.components();
    match command {
        Command::Move { destination, speed } => {
            if let Some(movement) = components.movement() {
                movement.move_to(destination, speed);
            }
        }
        Command::Attack(target) => {
            if let Some(combat) = components.combat() {
                combat.start_combat(target);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::Capability;
    use crate::game::sim::{SimEntity, SimWorld};

    const MAP: u32 = 1;
    const MOB: EntityId = 10;
    const PLAYER: EntityId = 20;

    fn pos(x: f32, z: f32) -> Vec3 {
        Vec3::new(x, 0.0, z)
    }

    fn setup() -> (Arc<SimWorld>, AiDriver) {
        let world = Arc::new(SimWorld::new());
        world.add_map(MAP);
        let driver = AiDriver::new(world.clone(), Arc::new(ConfigTables::demo()), AiTuning::default());
        (world, driver)
    }

    fn spawn_mob(world: &SimWorld, at: Vec3) -> Arc<SimEntity> {
        world.spawn(SimEntity::new(MOB, EntityKind::Monster, MAP, at))
    }

    fn spawn_player(world: &SimWorld, at: Vec3) -> Arc<SimEntity> {
        world.spawn(SimEntity::new(PLAYER, EntityKind::Player, MAP, at))
    }

    #[test]
    fn test_init_starts_idle_or_patrolling() {
        let (_world, driver) = setup();
        driver.init_ai(1, AiParams::default());
        assert_eq!(driver.behavior(1), Some(AiBehavior::Idle));

        driver.init_ai(
            2,
            AiParams {
                patrol_points: vec![pos(0.0, 0.0), pos(5.0, 0.0)],
                ..Default::default()
            },
        );
        assert_eq!(driver.behavior(2), Some(AiBehavior::Patrolling));
        assert_eq!(driver.len(), 2);
    }

    #[test]
    fn test_reinit_resets_every_field() {
        let (_world, driver) = setup();
        let first = driver.init_ai(MOB, AiParams::default());
        driver.assign_target(MOB, PLAYER);
        assert_eq!(driver.behavior(MOB), Some(AiBehavior::Chasing));

        let second = driver.init_ai(MOB, AiParams::default());
        assert_eq!(first, second);
        let ai = driver.snapshot(MOB).unwrap();
        assert_eq!(ai.behavior, AiBehavior::Idle);
        assert_eq!(ai.target_id, NO_TARGET);
        assert_eq!(driver.len(), 1);
    }

    #[test]
    fn test_recycled_record_is_reinitialized() {
        let (_world, driver) = setup();
        driver.init_ai(
            1,
            AiParams {
                flee_health_ratio: 0.5,
                patrol_points: vec![pos(1.0, 1.0)],
                ..Default::default()
            },
        );
        driver.assign_target(1, 99);
        assert!(driver.remove_ai(1));
        assert!(!driver.remove_ai(1));

        driver.init_ai(2, AiParams::default());
        let ai = driver.snapshot(2).unwrap();
        assert_eq!(ai.owner, 2);
        assert_eq!(ai.target_id, NO_TARGET);
        assert!(ai.patrol_points.is_empty());
        assert_eq!(ai.flee_health_ratio, 0.0);
        assert_eq!(ai.behavior, AiBehavior::Idle);
    }

    #[test]
    fn test_init_from_config() {
        let (_world, driver) = setup();
        assert!(driver.init_ai_from_config(MOB, 2).is_some());
        let ai = driver.snapshot(MOB).unwrap();
        assert_eq!(ai.patrol_points.len(), 4);
        assert_eq!(ai.behavior, AiBehavior::Patrolling);

        assert!(driver.init_ai_from_config(MOB + 1, 999).is_none());
        assert!(!driver.contains(MOB + 1));
    }

    #[test]
    fn test_idle_detects_player() {
        let (world, driver) = setup();
        spawn_mob(&world, pos(0.0, 0.0));
        spawn_player(&world, pos(5.0, 0.0));
        driver.init_ai(MOB, AiParams::default());

        let outcome = driver.update_ai(MOB, Instant::now());
        assert_eq!(
            outcome,
            TickOutcome::Transitioned { from: AiBehavior::Idle, to: AiBehavior::Chasing }
        );
        assert_eq!(driver.snapshot(MOB).unwrap().target_id, PLAYER);
    }

    #[test]
    fn test_idle_ignores_non_players_and_far_players() {
        let (world, driver) = setup();
        spawn_mob(&world, pos(0.0, 0.0));
        world.spawn(SimEntity::new(30, EntityKind::Monster, MAP, pos(1.0, 0.0)));
        world.spawn(SimEntity::new(31, EntityKind::Npc, MAP, pos(0.0, 1.0)));
        spawn_player(&world, pos(15.0, 0.0));
        driver.init_ai(MOB, AiParams::default());

        driver.update_ai(MOB, Instant::now());
        assert_eq!(driver.behavior(MOB), Some(AiBehavior::Idle));
        assert_eq!(driver.select_target(MOB), None);
    }

    #[test]
    fn test_chase_moves_toward_target() {
        let (world, driver) = setup();
        let mob = spawn_mob(&world, pos(0.0, 0.0));
        spawn_player(&world, pos(8.0, 0.0));
        driver.init_ai(MOB, AiParams::default());
        driver.assign_target(MOB, PLAYER);

        driver.update_ai(MOB, Instant::now());
        assert_eq!(driver.behavior(MOB), Some(AiBehavior::Chasing));
        assert_eq!(mob.last_move(), Some((pos(8.0, 0.0), CHASE_SPEED)));
    }

    #[test]
    fn test_chase_beyond_range_goes_idle() {
        let (world, driver) = setup();
        spawn_mob(&world, pos(0.0, 0.0));
        let player = spawn_player(&world, pos(8.0, 0.0));
        driver.init_ai(
            MOB,
            AiParams {
                chase_range: 20.0,
                ..Default::default()
            },
        );
        driver.assign_target(MOB, PLAYER);

        player.set_position(pos(25.0, 0.0));
        driver.update_ai(MOB, Instant::now());

        let ai = driver.snapshot(MOB).unwrap();
        assert_eq!(ai.behavior, AiBehavior::Idle);
        assert_eq!(ai.target_id, NO_TARGET);
    }

    #[test]
    fn test_chase_lost_target_goes_idle() {
        let (world, driver) = setup();
        spawn_mob(&world, pos(0.0, 0.0));
        spawn_player(&world, pos(5.0, 0.0));
        driver.init_ai(MOB, AiParams::default());
        driver.assign_target(MOB, PLAYER);

        world.despawn(PLAYER);
        driver.update_ai(MOB, Instant::now());

        let ai = driver.snapshot(MOB).unwrap();
        assert_eq!(ai.behavior, AiBehavior::Idle);
        assert_eq!(ai.target_id, NO_TARGET);
    }

    #[test]
    fn test_chase_to_attack_and_back() {
        let (world, driver) = setup();
        let mob = spawn_mob(&world, pos(0.0, 0.0));
        let player = spawn_player(&world, pos(1.5, 0.0));
        driver.init_ai(MOB, AiParams::default());
        driver.assign_target(MOB, PLAYER);

        driver.update_ai(MOB, Instant::now());
        assert_eq!(driver.behavior(MOB), Some(AiBehavior::Attacking));

        driver.update_ai(MOB, Instant::now());
        assert_eq!(mob.attacks(), vec![PLAYER]);

        player.set_position(pos(6.0, 0.0));
        driver.update_ai(MOB, Instant::now());
        assert_eq!(driver.behavior(MOB), Some(AiBehavior::Chasing));
    }

    #[test]
    fn test_low_health_attacker_flees() {
        let (world, driver) = setup();
        let mob = spawn_mob(&world, pos(0.0, 0.0));
        spawn_player(&world, pos(1.0, 0.0));
        mob.set_stat(Stat::MaxHp, 100.0);
        mob.set_stat(Stat::Hp, 100.0);
        driver.init_ai(
            MOB,
            AiParams {
                flee_health_ratio: 0.3,
                ..Default::default()
            },
        );
        driver.assign_target(MOB, PLAYER);
        driver.update_ai(MOB, Instant::now());
        assert_eq!(driver.behavior(MOB), Some(AiBehavior::Attacking));

        mob.set_stat(Stat::Hp, 25.0);
        driver.update_ai(MOB, Instant::now());
        assert_eq!(driver.behavior(MOB), Some(AiBehavior::Fleeing));

        // Flee directly away from the player along -X
        driver.update_ai(MOB, Instant::now());
        let (destination, speed) = mob.last_move().unwrap();
        assert!(destination.approx_eq(pos(-FLEE_DISTANCE, 0.0), 1e-4));
        assert_eq!(speed, FLEE_SPEED);
    }

    #[test]
    fn test_flee_ends_beyond_chase_range() {
        let (world, driver) = setup();
        spawn_mob(&world, pos(0.0, 0.0));
        let player = spawn_player(&world, pos(1.0, 0.0));
        driver.init_ai(MOB, AiParams::default());
        driver.assign_target(MOB, PLAYER);
        {
            let mut arena = driver.arena.write();
            arena.get_mut(MOB).unwrap().behavior = AiBehavior::Fleeing;
        }

        player.set_position(pos(30.0, 0.0));
        driver.update_ai(MOB, Instant::now());
        let ai = driver.snapshot(MOB).unwrap();
        assert_eq!(ai.behavior, AiBehavior::Idle);
        assert_eq!(ai.target_id, NO_TARGET);
    }

    #[test]
    fn test_flee_without_target_uses_fixed_offset() {
        let (world, driver) = setup();
        let mob = spawn_mob(&world, pos(3.0, 4.0));
        driver.init_ai(MOB, AiParams::default());
        {
            let mut arena = driver.arena.write();
            arena.get_mut(MOB).unwrap().behavior = AiBehavior::Fleeing;
        }

        driver.update_ai(MOB, Instant::now());
        let (destination, _) = mob.last_move().unwrap();
        assert!(destination.approx_eq(pos(3.0 + FLEE_DISTANCE, 4.0), 1e-4));
    }

    #[test]
    fn test_patrol_cycles_waypoints() {
        let (world, driver) = setup();
        let mob = spawn_mob(&world, pos(0.0, 0.0));
        driver.init_ai(MOB, AiParams::default());
        assert!(driver.set_patrol_points_str(MOB, "0,0,0;5,0,0;5,0,5"));
        assert_eq!(driver.behavior(MOB), Some(AiBehavior::Patrolling));

        let route = [pos(0.0, 0.0), pos(5.0, 0.0), pos(5.0, 5.0)];
        let mut seen = Vec::new();
        for step in 0..6 {
            // Stand on the current waypoint so the next tick advances
            mob.set_position(route[step % 3]);
            driver.update_ai(MOB, Instant::now());
            let ai = driver.snapshot(MOB).unwrap();
            seen.push(ai.patrol_index);
            assert_eq!(mob.last_move(), Some((route[ai.patrol_index], PATROL_SPEED)));
        }
        assert_eq!(seen, vec![1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_patrol_holds_waypoint_until_reached() {
        let (world, driver) = setup();
        spawn_mob(&world, pos(-10.0, 0.0));
        driver.init_ai(
            MOB,
            AiParams {
                patrol_points: vec![pos(0.0, 0.0), pos(5.0, 0.0)],
                ..Default::default()
            },
        );
        driver.update_ai(MOB, Instant::now());
        assert_eq!(driver.snapshot(MOB).unwrap().patrol_index, 0);
    }

    #[test]
    fn test_empty_patrol_goes_idle() {
        let (world, driver) = setup();
        spawn_mob(&world, pos(0.0, 0.0));
        driver.init_ai(
            MOB,
            AiParams {
                patrol_points: vec![pos(4.0, 0.0)],
                ..Default::default()
            },
        );
        driver.set_patrol_points(MOB, Vec::new());
        driver.update_ai(MOB, Instant::now());
        assert_eq!(driver.behavior(MOB), Some(AiBehavior::Idle));
    }

    #[test]
    fn test_missing_capability_is_skipped() {
        let (world, driver) = setup();
        world.spawn(SimEntity::with_capabilities(
            MOB,
            EntityKind::Monster,
            MAP,
            pos(0.0, 0.0),
            &[Capability::Properties],
        ));
        spawn_player(&world, pos(8.0, 0.0));
        driver.init_ai(MOB, AiParams::default());
        driver.assign_target(MOB, PLAYER);

        let outcome = driver.update_ai(MOB, Instant::now());
        assert_eq!(outcome, TickOutcome::Unchanged(AiBehavior::Chasing));
        assert_eq!(world.get(MOB).unwrap().move_count(), 0);
    }

    #[test]
    fn test_npc_stays_idle() {
        let (world, driver) = setup();
        world.spawn(SimEntity::new(MOB, EntityKind::Npc, MAP, pos(0.0, 0.0)));
        spawn_player(&world, pos(1.0, 0.0));
        driver.init_ai(
            MOB,
            AiParams {
                kind: AiKind::Npc,
                patrol_points: vec![pos(3.0, 0.0)],
                ..Default::default()
            },
        );
        assert!(!driver.assign_target(MOB, PLAYER));

        for _ in 0..3 {
            driver.update_ai(MOB, Instant::now());
            assert_eq!(driver.behavior(MOB), Some(AiBehavior::Idle));
        }
    }

    #[test]
    fn test_unresolvable_owner() {
        let (_world, driver) = setup();
        driver.init_ai(MOB, AiParams::default());
        assert_eq!(driver.update_ai(MOB, Instant::now()), TickOutcome::Skipped);

        driver.assign_target(MOB, PLAYER);
        assert_eq!(
            driver.update_ai(MOB, Instant::now()),
            TickOutcome::Transitioned { from: AiBehavior::Chasing, to: AiBehavior::Idle }
        );
        assert_eq!(driver.snapshot(MOB).unwrap().target_id, NO_TARGET);
    }

    #[test]
    fn test_line_of_sight_gates_detection() {
        let world = Arc::new(SimWorld::new());
        world.add_map(MAP);
        let vision = Arc::new(VisionService::default());
        vision.set_blocked(MAP, pos(2.0, 0.0), true);
        let tuning = AiTuning {
            require_line_of_sight: true,
            ..Default::default()
        };
        let driver = AiDriver::new(world.clone(), Arc::new(ConfigTables::new()), tuning)
            .with_vision(vision.clone());

        spawn_mob(&world, pos(0.0, 0.0));
        spawn_player(&world, pos(5.0, 0.0));
        driver.init_ai(MOB, AiParams::default());

        driver.update_ai(MOB, Instant::now());
        assert_eq!(driver.behavior(MOB), Some(AiBehavior::Idle));

        vision.set_blocked(MAP, pos(2.0, 0.0), false);
        driver.update_ai(MOB, Instant::now());
        assert_eq!(driver.behavior(MOB), Some(AiBehavior::Chasing));
    }

    #[test]
    fn test_nearest_player_distance() {
        let (world, driver) = setup();
        spawn_mob(&world, pos(0.0, 0.0));
        world.spawn(SimEntity::new(21, EntityKind::Player, MAP, pos(6.0, 0.0)));
        world.spawn(SimEntity::new(22, EntityKind::Player, MAP, pos(0.0, 3.0)));
        driver.init_ai(MOB, AiParams::default());

        let nearest = driver.nearest_player_distance(MOB).unwrap();
        assert!((nearest - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_update_reports_and_state_counts() {
        let (world, driver) = setup();
        spawn_mob(&world, pos(0.0, 0.0));
        spawn_player(&world, pos(5.0, 0.0));
        driver.init_ai(MOB, AiParams::default());
        driver.init_ai(999, AiParams::default());

        let report = driver.update(Instant::now());
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.transitions, 1);

        let counts = driver.state_counts();
        assert_eq!(counts[AiBehavior::Idle.index()], 1);
        assert_eq!(counts[AiBehavior::Chasing.index()], 1);
        assert_eq!(counts.iter().sum::<usize>(), driver.len());
    }

    #[test]
    fn test_reinit_applies_new_params_in_place() {
        let (_world, driver) = setup();
        let handle = driver.init_ai(MOB, AiParams::default());

        let again = driver.init_ai(
            MOB,
            AiParams {
                detection_range: 4.0,
                patrol_points: vec![pos(1.0, 0.0), pos(2.0, 0.0)],
                ..Default::default()
            },
        );

        assert_eq!(handle, again);
        let ai = driver.snapshot(MOB).unwrap();
        assert_eq!(ai.detection_range, 4.0);
        assert_eq!(ai.patrol_points.len(), 2);
        assert_eq!(ai.behavior, AiBehavior::Patrolling);
        assert_eq!(driver.len(), 1);
    }

    #[test]
    fn test_patrol_detects_player() {
        let (world, driver) = setup();
        let mob = spawn_mob(&world, pos(0.0, 0.0));
        driver.init_ai(
            MOB,
            AiParams {
                patrol_points: vec![pos(0.0, 0.0), pos(-5.0, 0.0)],
                ..Default::default()
            },
        );
        driver.update_ai(MOB, Instant::now());
        assert_eq!(driver.behavior(MOB), Some(AiBehavior::Patrolling));
        let moves = mob.move_count();

        spawn_player(&world, pos(4.0, 0.0));
        let outcome = driver.update_ai(MOB, Instant::now());

        assert_eq!(
            outcome,
            TickOutcome::Transitioned { from: AiBehavior::Patrolling, to: AiBehavior::Chasing }
        );
        assert_eq!(driver.snapshot(MOB).unwrap().target_id, PLAYER);
        assert_eq!(mob.move_count(), moves, "no patrol step on the detection tick");
    }

    #[test]
    fn test_attack_lost_target_goes_idle() {
        let (world, driver) = setup();
        let mob = spawn_mob(&world, pos(0.0, 0.0));
        spawn_player(&world, pos(1.5, 0.0));
        driver.init_ai(MOB, AiParams::default());
        driver.assign_target(MOB, PLAYER);
        driver.update_ai(MOB, Instant::now());
        assert_eq!(driver.behavior(MOB), Some(AiBehavior::Attacking));

        world.despawn(PLAYER);
        let outcome = driver.update_ai(MOB, Instant::now());

        assert_eq!(
            outcome,
            TickOutcome::Transitioned { from: AiBehavior::Attacking, to: AiBehavior::Idle }
        );
        assert_eq!(driver.snapshot(MOB).unwrap().target_id, NO_TARGET);
        assert!(mob.attacks().is_empty());
    }

    #[test]
    fn test_flee_lost_target_goes_idle() {
        let (world, driver) = setup();
        let mob = spawn_mob(&world, pos(0.0, 0.0));
        spawn_player(&world, pos(1.0, 0.0));
        driver.init_ai(MOB, AiParams::default());
        driver.assign_target(MOB, PLAYER);
        {
            let mut arena = driver.arena.write();
            arena.get_mut(MOB).unwrap().behavior = AiBehavior::Fleeing;
        }

        world.despawn(PLAYER);
        let outcome = driver.update_ai(MOB, Instant::now());

        assert_eq!(
            outcome,
            TickOutcome::Transitioned { from: AiBehavior::Fleeing, to: AiBehavior::Idle }
        );
        assert_eq!(driver.snapshot(MOB).unwrap().target_id, NO_TARGET);
        assert_eq!(mob.move_count(), 0);
    }

    #[test]
    fn test_init_and_remove_race_with_update() {
        let (world, driver) = setup();
        spawn_player(&world, pos(0.0, 0.0));
        for id in 100..140 {
            world.spawn(SimEntity::new(id, EntityKind::Monster, MAP, pos(id as f32 - 120.0, 3.0)));
        }

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for round in 0..50 {
                    for id in 100..140 {
                        if (id + round) % 3 == 0 {
                            driver.remove_ai(id);
                        } else {
                            driver.init_ai(id, AiParams::default());
                        }
                    }
                }
            });
            scope.spawn(|| {
                for _ in 0..200 {
                    let report = driver.update(Instant::now());
                    assert!(report.evaluated + report.skipped <= 40);
                }
            });
        });

        for id in 100..140 {
            driver.init_ai(id, AiParams::default());
        }
        assert_eq!(driver.len(), 40);
        assert_eq!(driver.state_counts().iter().sum::<usize>(), 40);
        let report = driver.update(Instant::now());
        assert_eq!(report.evaluated, 40);
    }

    #[test]
    fn test_every_state_is_enumerated() {
        for (i, behavior) in AiBehavior::ALL.iter().enumerate() {
            assert_eq!(behavior.index(), i);
        }
    }
}
