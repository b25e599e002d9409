//! In-memory world
//!
//! A small implementation of the collaborator contracts in [`crate::game::entity`].
//! Movement and combat commands are recorded rather than simulated in full;
//! `advance` walks every body toward its last movement command. The demo
//! server, the benches and the unit tests all run against it.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::game::entity::{
    Capability, Combat, Components, DeathCallback, Entity, EntityId, EntityKind, GameMap, MapId,
    MonsterFactory, MonsterSpawn, Movement, Properties, Stat, World,
};
use crate::util::vec3::Vec3;

/// Shared state behind every capability of one sim entity
#[derive(Debug, Default)]
pub struct SimBody {
    position: RwLock<Vec3>,
    move_target: Mutex<Option<(Vec3, f32)>>,
    move_count: Mutex<u64>,
    attacks: Mutex<Vec<EntityId>>,
    stats: RwLock<HashMap<Stat, f32>>,
}

impl SimBody {
    fn at(position: Vec3) -> Self {
        Self {
            position: RwLock::new(position),
            ..Default::default()
        }
    }
}

impl Movement for SimBody {
    fn move_to(&self, target: Vec3, speed: f32) {
        *self.move_target.lock() = Some((target, speed));
        *self.move_count.lock() += 1;
    }
}

impl Combat for SimBody {
    fn start_combat(&self, target: EntityId) {
        self.attacks.lock().push(target);
    }
}

impl Properties for SimBody {
    fn get(&self, stat: Stat) -> f32 {
        self.stats.read().get(&stat).copied().unwrap_or(0.0)
    }

    fn set(&self, stat: Stat, value: f32) {
        self.stats.write().insert(stat, value);
    }
}

pub struct SimEntity {
    id: EntityId,
    kind: EntityKind,
    map_id: MapId,
    body: Arc<SimBody>,
    components: Components,
    on_death: Mutex<Option<DeathCallback>>,
}

impl SimEntity {
    /// Entity carrying every capability
    pub fn new(id: EntityId, kind: EntityKind, map_id: MapId, position: Vec3) -> Self {
        Self::with_capabilities(
            id,
            kind,
            map_id,
            position,
            &[Capability::Movement, Capability::Combat, Capability::Properties],
        )
    }

    /// Entity carrying only the listed capabilities
    pub fn with_capabilities(
        id: EntityId,
        kind: EntityKind,
        map_id: MapId,
        position: Vec3,
        capabilities: &[Capability],
    ) -> Self {
        let body = Arc::new(SimBody::at(position));
        let mut components = Components::new();
        for capability in capabilities {
            components = match capability {
                Capability::Movement => components.with_movement(body.clone()),
                Capability::Combat => components.with_combat(body.clone()),
                Capability::Properties => components.with_properties(body.clone()),
            };
        }
        Self {
            id,
            kind,
            map_id,
            body,
            components,
            on_death: Mutex::new(None),
        }
    }

    pub fn set_position(&self, position: Vec3) {
        *self.body.position.write() = position;
    }

    /// Most recent movement command, if any
    pub fn last_move(&self) -> Option<(Vec3, f32)> {
        *self.body.move_target.lock()
    }

    pub fn move_count(&self) -> u64 {
        *self.body.move_count.lock()
    }

    /// Targets passed to `start_combat`, oldest first
    pub fn attacks(&self) -> Vec<EntityId> {
        self.body.attacks.lock().clone()
    }

    /// Raw stat storage, independent of whether the properties capability is attached
    pub fn stat(&self, stat: Stat) -> f32 {
        self.body.get(stat)
    }

    pub fn set_stat(&self, stat: Stat, value: f32) {
        self.body.set(stat, value);
    }

    pub fn set_death_callback(&self, on_death: DeathCallback) {
        *self.on_death.lock() = Some(on_death);
    }

    /// Fire the death callback; returns false if it already fired or none was set
    pub fn kill(&self) -> bool {
        let callback = self.on_death.lock().take();
        match callback {
            Some(on_death) => {
                on_death(self.id);
                true
            }
            None => false,
        }
    }

    /// Step toward the last movement command
    pub fn advance(&self, dt: f32) {
        let Some((target, speed)) = self.last_move() else {
            return;
        };
        let mut position = self.body.position.write();
        *position = position.move_towards(target, speed * dt);
    }
}

impl Entity for SimEntity {
    fn id(&self) -> EntityId {
        self.id
    }

    fn kind(&self) -> EntityKind {
        self.kind
    }

    fn position(&self) -> Vec3 {
        *self.body.position.read()
    }

    fn map_id(&self) -> MapId {
        self.map_id
    }

    fn components(&self) -> &Components {
        &self.components
    }
}

/// Map object registry
pub struct SimMap {
    id: MapId,
    objects: RwLock<HashMap<EntityId, Arc<dyn Entity>>>,
}

impl SimMap {
    pub fn new(id: MapId) -> Self {
        Self {
            id,
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.objects.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl GameMap for SimMap {
    fn id(&self) -> MapId {
        self.id
    }

    fn add_object(&self, entity: Arc<dyn Entity>) {
        self.objects.write().insert(entity.id(), entity);
    }

    fn remove_object(&self, id: EntityId) -> Option<Arc<dyn Entity>> {
        self.objects.write().remove(&id)
    }

    fn objects_in_range(&self, center: Vec3, radius: f32) -> Vec<Arc<dyn Entity>> {
        let radius_sq = radius * radius;
        self.objects
            .read()
            .values()
            .filter(|entity| entity.position().distance_sq_to(center) <= radius_sq)
            .cloned()
            .collect()
    }
}

/// Entity directory and map registry
#[derive(Default)]
pub struct SimWorld {
    maps: RwLock<HashMap<MapId, Arc<SimMap>>>,
    entities: RwLock<HashMap<EntityId, Arc<SimEntity>>>,
}

impl SimWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a map, or return the existing one
    pub fn add_map(&self, id: MapId) -> Arc<SimMap> {
        self.maps
            .write()
            .entry(id)
            .or_insert_with(|| Arc::new(SimMap::new(id)))
            .clone()
    }

    pub fn sim_map(&self, id: MapId) -> Option<Arc<SimMap>> {
        self.maps.read().get(&id).cloned()
    }

    /// Register an entity in the directory without placing it on a map
    pub fn register(&self, entity: SimEntity) -> Arc<SimEntity> {
        let entity = Arc::new(entity);
        self.entities.write().insert(entity.id, entity.clone());
        entity
    }

    /// Register an entity and place it on its map, creating the map if needed
    pub fn spawn(&self, entity: SimEntity) -> Arc<SimEntity> {
        let entity = self.register(entity);
        self.add_map(entity.map_id).add_object(entity.clone());
        entity
    }

    pub fn get(&self, id: EntityId) -> Option<Arc<SimEntity>> {
        self.entities.read().get(&id).cloned()
    }

    /// Remove an entity from the directory and its map without firing callbacks
    pub fn despawn(&self, id: EntityId) -> bool {
        let Some(entity) = self.entities.write().remove(&id) else {
            return false;
        };
        if let Some(map) = self.sim_map(entity.map_id) {
            map.remove_object(id);
        }
        true
    }

    /// Remove an entity from the directory and fire its death callback
    pub fn kill(&self, id: EntityId) -> bool {
        let Some(entity) = self.entities.write().remove(&id) else {
            return false;
        };
        entity.kill();
        true
    }

    /// Move every body toward its last movement command
    pub fn advance(&self, dt: f32) {
        let bodies: Vec<Arc<SimEntity>> = self.entities.read().values().cloned().collect();
        for body in bodies {
            body.advance(dt);
        }
    }

    pub fn entity_count(&self) -> usize {
        self.entities.read().len()
    }
}

impl World for SimWorld {
    fn entity(&self, id: EntityId) -> Option<Arc<dyn Entity>> {
        self.get(id).map(|entity| entity as Arc<dyn Entity>)
    }

    fn map(&self, id: MapId) -> Option<Arc<dyn GameMap>> {
        self.sim_map(id).map(|map| map as Arc<dyn GameMap>)
    }
}

impl MonsterFactory for SimWorld {
    fn create_monster(&self, spawn: MonsterSpawn<'_>, on_death: DeathCallback) -> Arc<dyn Entity> {
        let monster = SimEntity::new(spawn.id, EntityKind::Monster, spawn.map_id, spawn.position);
        monster.set_death_callback(on_death);
        self.register(monster)
    }
}
