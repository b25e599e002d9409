//! Collaborator contracts consumed by the AI engine
//!
//! Entities, their capabilities, maps and the world directory are owned by
//! other subsystems. The engine only talks to them through these traits.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::game::tables::MonsterTemplate;
use crate::util::vec3::Vec3;

/// Entity identifier (0 is reserved for "no entity")
pub type EntityId = u64;

/// Map / dungeon instance identifier
pub type MapId = u32;

/// Sentinel for "no target"
pub const NO_TARGET: EntityId = 0;

/// What an entity is, as far as targeting is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Player,
    Monster,
    Npc,
}

/// Numeric stats stored by the property capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stat {
    Hp,
    MaxHp,
    Mp,
    MaxMp,
    Attack,
    Defense,
    Haste,
    Exp,
}

/// Capability tags, used for diagnostics and `Components::has`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Movement,
    Combat,
    Properties,
}

pub trait Movement: Send + Sync {
    fn move_to(&self, target: Vec3, speed: f32);
}

pub trait Combat: Send + Sync {
    fn start_combat(&self, target: EntityId);
}

pub trait Properties: Send + Sync {
    fn get(&self, stat: Stat) -> f32;
    fn set(&self, stat: Stat, value: f32);
}

/// Closed set of capabilities an entity may carry
///
/// A missing capability is `None`; callers skip the action instead of failing.
#[derive(Clone, Default)]
pub struct Components {
    movement: Option<Arc<dyn Movement>>,
    combat: Option<Arc<dyn Combat>>,
    properties: Option<Arc<dyn Properties>>,
}

impl Components {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_movement(mut self, movement: Arc<dyn Movement>) -> Self {
        self.movement = Some(movement);
        self
    }

    pub fn with_combat(mut self, combat: Arc<dyn Combat>) -> Self {
        self.combat = Some(combat);
        self
    }

    pub fn with_properties(mut self, properties: Arc<dyn Properties>) -> Self {
        self.properties = Some(properties);
        self
    }

    #[inline]
    pub fn movement(&self) -> Option<&dyn Movement> {
        self.movement.as_deref()
    }

    #[inline]
    pub fn combat(&self) -> Option<&dyn Combat> {
        self.combat.as_deref()
    }

    #[inline]
    pub fn properties(&self) -> Option<&dyn Properties> {
        self.properties.as_deref()
    }

    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::Movement => self.movement.is_some(),
            Capability::Combat => self.combat.is_some(),
            Capability::Properties => self.properties.is_some(),
        }
    }
}

impl fmt::Debug for Components {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Components")
            .field("movement", &self.movement.is_some())
            .field("combat", &self.combat.is_some())
            .field("properties", &self.properties.is_some())
            .finish()
    }
}

/// Minimal read contract every AI-controlled (or targetable) object satisfies
pub trait Entity: Send + Sync {
    fn id(&self) -> EntityId;
    fn kind(&self) -> EntityKind;
    fn position(&self) -> Vec3;
    fn map_id(&self) -> MapId;
    fn components(&self) -> &Components;
}

/// Per-map object registry with a range query
pub trait GameMap: Send + Sync {
    fn id(&self) -> MapId;
    fn add_object(&self, entity: Arc<dyn Entity>);
    fn remove_object(&self, id: EntityId) -> Option<Arc<dyn Entity>>;
    fn objects_in_range(&self, center: Vec3, radius: f32) -> Vec<Arc<dyn Entity>>;
}

/// Entity and map directory
pub trait World: Send + Sync {
    fn entity(&self, id: EntityId) -> Option<Arc<dyn Entity>>;
    fn map(&self, id: MapId) -> Option<Arc<dyn GameMap>>;
}

/// Invoked exactly once, with the dead entity's id, when a spawned monster dies
pub type DeathCallback = Box<dyn FnOnce(EntityId) + Send + 'static>;

/// Everything a factory needs to build one monster
#[derive(Debug, Clone, Copy)]
pub struct MonsterSpawn<'a> {
    pub id: EntityId,
    pub map_id: MapId,
    pub position: Vec3,
    pub template: &'a MonsterTemplate,
}

/// Builds monster entities for the spawn manager
///
/// The factory owns `on_death` and must call it when the monster dies.
pub trait MonsterFactory: Send + Sync {
    fn create_monster(&self, spawn: MonsterSpawn<'_>, on_death: DeathCallback) -> Arc<dyn Entity>;
}

/// Hands out process-unique entity ids
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new(first: EntityId) -> Self {
        Self {
            next: AtomicU64::new(first.max(1)),
        }
    }

    #[inline]
    pub fn next_id(&self) -> EntityId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new(crate::game::constants::spawn::FIRST_ENTITY_ID)
    }
}
