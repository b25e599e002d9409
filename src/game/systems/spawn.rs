//! Monster population per map
//!
//! A [`SpawnManager`] fills every spawn point of its map on init, then a
//! tokio task tops the points back up once per check interval. Live counts
//! only go down through the death callback handed to the monster factory.
//!
//! Cooldown rule: each check compares the time since a point's last spawn
//! stamp against its interval. Once the interval has elapsed the stamp is
//! reset to the check time whether or not a monster is spawned.
//!
//! Collaborators are never called with the point table locked. A spawn first
//! reserves a slot and an entity id under the lock, builds the monster
//! unlocked, then commits the instance. Reserved slots count toward the
//! point's max count.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::game::constants::spawn::CHECK_INTERVAL;
use crate::game::entity::{
    DeathCallback, EntityId, GameMap, IdAllocator, MapId, MonsterFactory, MonsterSpawn,
    Properties, Stat, World,
};
use crate::game::systems::ai::AiDriver;
use crate::game::tables::{ConfigTables, MonsterTemplate, SpawnPointConfig};
use crate::util::vec3::Vec3;

/// One live monster spawned from a spawn point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnInstance {
    pub entity_id: EntityId,
    pub spawn_point_id: u32,
    pub created: Instant,
}

struct SpawnPointState {
    config: SpawnPointConfig,
    live: Vec<SpawnInstance>,
    /// Ids reserved but not yet committed to `live`
    pending: Vec<EntityId>,
    last_spawn: Instant,
}

impl SpawnPointState {
    #[inline]
    fn occupied(&self) -> usize {
        self.live.len() + self.pending.len()
    }
}

/// A claimed slot at a spawn point, filled outside the point lock
struct Reservation<'a> {
    spawn_point_id: u32,
    entity_id: EntityId,
    position: Vec3,
    template: &'a MonsterTemplate,
}

/// Services shared by every spawn manager
#[derive(Clone)]
pub struct SpawnContext {
    pub tables: Arc<ConfigTables>,
    pub factory: Arc<dyn MonsterFactory>,
    pub driver: Arc<AiDriver>,
    pub ids: Arc<IdAllocator>,
    pub check_interval: Duration,
}

impl SpawnContext {
    pub fn new(
        tables: Arc<ConfigTables>,
        factory: Arc<dyn MonsterFactory>,
        driver: Arc<AiDriver>,
        ids: Arc<IdAllocator>,
    ) -> Self {
        Self {
            tables,
            factory,
            driver,
            ids,
            check_interval: CHECK_INTERVAL,
        }
    }

    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }
}

/// Lifetime counters for one manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpawnCounters {
    pub spawned: u64,
    pub respawned: u64,
    pub died: u64,
}

impl std::ops::Add for SpawnCounters {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            spawned: self.spawned + rhs.spawned,
            respawned: self.respawned + rhs.respawned,
            died: self.died + rhs.died,
        }
    }
}

pub struct SpawnManager {
    map: Arc<dyn GameMap>,
    ctx: SpawnContext,
    points: RwLock<Vec<SpawnPointState>>,
    populated: AtomicBool,
    started: AtomicBool,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    spawned: AtomicU64,
    respawned: AtomicU64,
    died: AtomicU64,
    this: Weak<SpawnManager>,
}

impl SpawnManager {
    pub fn new(map: Arc<dyn GameMap>, ctx: SpawnContext) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            map,
            ctx,
            points: RwLock::new(Vec::new()),
            populated: AtomicBool::new(false),
            started: AtomicBool::new(false),
            stop_tx: Mutex::new(None),
            task: Mutex::new(None),
            spawned: AtomicU64::new(0),
            respawned: AtomicU64::new(0),
            died: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    #[inline]
    pub fn map_id(&self) -> MapId {
        self.map.id()
    }

    /// Populate every spawn point and start the replenishment loop
    pub fn init(&self) -> Result<usize, SpawnError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SpawnError::NoRuntime)?;
        if self.started.load(Ordering::Acquire) {
            warn!("Spawn loop for map {} already running", self.map_id());
            return Err(SpawnError::AlreadyRunning(self.map_id()));
        }

        let spawned = self.populate(tokio::time::Instant::now().into_std())?;
        self.start_loop(&runtime)?;
        info!("Spawn manager for map {} initialized with {} monsters", self.map_id(), spawned);
        Ok(spawned)
    }

    /// Load the map's spawn points and fill each one to its max count
    pub fn populate(&self, now: Instant) -> Result<usize, SpawnError> {
        let map_id = self.map_id();
        let Some(configs) = self.ctx.tables.spawn_points(map_id) else {
            warn!("No spawn points configured for map {}", map_id);
            return Err(SpawnError::UnknownMap(map_id));
        };
        if self.populated.swap(true, Ordering::AcqRel) {
            return Err(SpawnError::AlreadyInitialized(map_id));
        }

        let mut reservations = Vec::new();
        {
            let mut points = self.points.write();
            for config in configs {
                let mut point = SpawnPointState {
                    config: config.clone(),
                    live: Vec::with_capacity(config.max_count),
                    pending: Vec::new(),
                    last_spawn: now,
                };
                while let Some(reservation) = self.reserve(&mut point) {
                    reservations.push(reservation);
                }
                points.push(point);
            }
        }

        let spawned = reservations
            .into_iter()
            .filter(|reservation| self.spawn_monster(reservation, now))
            .count();
        Ok(spawned)
    }

    /// One replenishment pass; returns how many monsters were spawned
    pub fn check_respawns(&self, now: Instant) -> usize {
        let reservations: Vec<Reservation<'_>> = {
            let mut points = self.points.write();
            points
                .iter_mut()
                .filter_map(|point| {
                    if now.saturating_duration_since(point.last_spawn) < point.config.spawn_interval() {
                        return None;
                    }
                    point.last_spawn = now;
                    self.reserve(point)
                })
                .collect()
        };

        let spawned = reservations
            .into_iter()
            .filter(|reservation| self.spawn_monster(reservation, now))
            .count();
        if spawned > 0 {
            self.respawned.fetch_add(spawned as u64, Ordering::Relaxed);
            debug!("Respawned {} monsters on map {}", spawned, self.map_id());
        }
        spawned
    }

    /// Claim a slot at `point` if it has room and a known monster
    fn reserve(&self, point: &mut SpawnPointState) -> Option<Reservation<'_>> {
        let config = &point.config;
        if point.occupied() >= config.max_count {
            return None;
        }
        let Some(template) = self.ctx.tables.monster(config.monster_id) else {
            warn!(
                "Unknown monster id {} at spawn point {}, skipping",
                config.monster_id, config.id
            );
            return None;
        };

        let entity_id = self.ctx.ids.next_id();
        point.pending.push(entity_id);
        Some(Reservation {
            spawn_point_id: config.id,
            entity_id,
            position: scatter(config.position, config.radius),
            template,
        })
    }

    /// Build the reserved monster and commit it; false if it died first
    fn spawn_monster(&self, reservation: &Reservation<'_>, now: Instant) -> bool {
        let id = reservation.entity_id;
        let template = reservation.template;
        let spawn = MonsterSpawn {
            id,
            map_id: self.map_id(),
            position: reservation.position,
            template,
        };
        let entity = self
            .ctx
            .factory
            .create_monster(spawn, self.death_callback(reservation.spawn_point_id));

        if let Some(props) = entity.components().properties() {
            apply_stats(props, template);
        }
        self.map.add_object(entity);
        if let Some(ai_id) = template.ai_id {
            self.ctx.driver.init_ai_from_config(id, ai_id);
        }

        let committed = {
            let mut points = self.points.write();
            points
                .iter_mut()
                .find(|point| point.config.id == reservation.spawn_point_id)
                .and_then(|point| {
                    let index = point.pending.iter().position(|pending| *pending == id)?;
                    point.pending.swap_remove(index);
                    point.live.push(SpawnInstance {
                        entity_id: id,
                        spawn_point_id: reservation.spawn_point_id,
                        created: now,
                    });
                    Some(())
                })
                .is_some()
        };
        if !committed {
            // The death callback already released the slot
            self.map.remove_object(id);
            self.ctx.driver.remove_ai(id);
            debug!("Monster {} died before spawning completed", id);
            return false;
        }

        self.spawned.fetch_add(1, Ordering::Relaxed);
        trace!("Spawned {} ({}) at point {}", template.name, id, reservation.spawn_point_id);
        true
    }

    fn death_callback(&self, spawn_point_id: u32) -> DeathCallback {
        let manager = self.this.clone();
        Box::new(move |entity_id| {
            if let Some(manager) = manager.upgrade() {
                manager.on_death(spawn_point_id, entity_id);
            }
        })
    }

    fn on_death(&self, spawn_point_id: u32, entity_id: EntityId) {
        self.map.remove_object(entity_id);
        let removed = {
            let mut points = self.points.write();
            points
                .iter_mut()
                .find(|point| point.config.id == spawn_point_id)
                .and_then(|point| {
                    if let Some(index) = point.live.iter().position(|i| i.entity_id == entity_id) {
                        return Some(point.live.swap_remove(index));
                    }
                    // Still being built; `spawn_monster` sees the released slot
                    let index = point.pending.iter().position(|pending| *pending == entity_id)?;
                    point.pending.swap_remove(index);
                    None
                })
        };
        self.ctx.driver.remove_ai(entity_id);

        if removed.is_some() {
            self.died.fetch_add(1, Ordering::Relaxed);
            debug!("Monster {} from spawn point {} died", entity_id, spawn_point_id);
        }
    }

    fn start_loop(&self, runtime: &tokio::runtime::Handle) -> Result<(), SpawnError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SpawnError::AlreadyRunning(self.map_id()));
        }

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let manager = self.this.clone();
        let period = self.ctx.check_interval;
        let map_id = self.map_id();

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        manager.check_respawns(tokio::time::Instant::now().into_std());
                    }
                    _ = &mut stop_rx => break,
                }
            }
            debug!("Spawn loop for map {} exited", map_id);
        });

        *self.stop_tx.lock() = Some(stop_tx);
        *self.task.lock() = Some(task);
        Ok(())
    }

    /// Stop the replenishment loop; safe to call more than once
    pub fn stop(&self) {
        let Some(stop_tx) = self.stop_tx.lock().take() else {
            return;
        };
        // The loop may already be gone
        let _ = stop_tx.send(());
        info!("Spawn manager for map {} stopped", self.map_id());
    }

    /// Wait for a stopped loop to exit
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Spawn loop for map {} ended abnormally: {}", self.map_id(), e);
            }
        }
    }

    /// Whether the replenishment loop is still alive
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Live monsters at one spawn point
    pub fn get_spawned_count(&self, spawn_point_id: u32) -> usize {
        self.points
            .read()
            .iter()
            .find(|point| point.config.id == spawn_point_id)
            .map_or(0, |point| point.live.len())
    }

    /// Live monsters across all spawn points of this map
    pub fn total_spawned(&self) -> usize {
        self.points.read().iter().map(|point| point.live.len()).sum()
    }

    pub fn instances(&self, spawn_point_id: u32) -> Vec<SpawnInstance> {
        self.points
            .read()
            .iter()
            .find(|point| point.config.id == spawn_point_id)
            .map(|point| point.live.clone())
            .unwrap_or_default()
    }

    /// Ids of every live monster on this map
    pub fn live_entities(&self) -> Vec<EntityId> {
        self.points
            .read()
            .iter()
            .flat_map(|point| point.live.iter().map(|i| i.entity_id))
            .collect()
    }

    pub fn counters(&self) -> SpawnCounters {
        SpawnCounters {
            spawned: self.spawned.load(Ordering::Relaxed),
            respawned: self.respawned.load(Ordering::Relaxed),
            died: self.died.load(Ordering::Relaxed),
        }
    }
}

impl Drop for SpawnManager {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.get_mut().take() {
            let _ = stop_tx.send(());
        }
    }
}

/// Uniform offset within `radius` on the ground plane
fn scatter(center: Vec3, radius: f32) -> Vec3 {
    if radius <= 0.0 {
        return center;
    }
    let mut rng = rand::thread_rng();
    Vec3::new(
        center.x + rng.gen_range(-radius..=radius),
        center.y,
        center.z + rng.gen_range(-radius..=radius),
    )
}

fn apply_stats(props: &dyn Properties, template: &MonsterTemplate) {
    props.set(Stat::Hp, template.hp);
    props.set(Stat::MaxHp, template.hp);
    props.set(Stat::Mp, template.mp);
    props.set(Stat::MaxMp, template.mp);
    props.set(Stat::Attack, template.attack);
    props.set(Stat::Defense, template.defense);
    props.set(Stat::Haste, template.haste);
    props.set(Stat::Exp, template.exp);
}

/// Owns one spawn manager per initialized map
pub struct SpawnDirector {
    world: Arc<dyn World>,
    ctx: SpawnContext,
    managers: RwLock<HashMap<MapId, Arc<SpawnManager>>>,
}

impl SpawnDirector {
    pub fn new(world: Arc<dyn World>, ctx: SpawnContext) -> Self {
        Self {
            world,
            ctx,
            managers: RwLock::new(HashMap::new()),
        }
    }

    /// Create, populate and start the manager for one map
    pub fn init_map(&self, map_id: MapId) -> Result<Arc<SpawnManager>, SpawnError> {
        let Some(map) = self.world.map(map_id) else {
            warn!("Map {} does not exist, no spawn manager started", map_id);
            return Err(SpawnError::UnknownMap(map_id));
        };
        // The entry stays locked until the manager is running or has failed
        let mut managers = self.managers.write();
        let slot = match managers.entry(map_id) {
            Entry::Occupied(_) => return Err(SpawnError::AlreadyRunning(map_id)),
            Entry::Vacant(slot) => slot,
        };

        let manager = SpawnManager::new(map, self.ctx.clone());
        manager.init()?;
        slot.insert(manager.clone());
        Ok(manager)
    }

    /// Initialize every map that has spawn points; failures are logged
    pub fn init_all(&self) -> usize {
        self.ctx
            .tables
            .map_ids()
            .into_iter()
            .filter(|map_id| match self.init_map(*map_id) {
                Ok(_) => true,
                Err(e) => {
                    warn!("Spawn init for map {} failed: {}", map_id, e);
                    false
                }
            })
            .count()
    }

    pub fn manager(&self, map_id: MapId) -> Option<Arc<SpawnManager>> {
        self.managers.read().get(&map_id).cloned()
    }

    pub fn stop_all(&self) {
        for manager in self.managers.read().values() {
            manager.stop();
        }
    }

    /// Live monsters across every map
    pub fn total_spawned(&self) -> usize {
        self.managers.read().values().map(|m| m.total_spawned()).sum()
    }

    pub fn counters(&self) -> SpawnCounters {
        self.managers
            .read()
            .values()
            .map(|m| m.counters())
            .fold(SpawnCounters::default(), |acc, c| acc + c)
    }

    pub fn map_count(&self) -> usize {
        self.managers.read().len()
    }
}

/// Spawn manager errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpawnError {
    #[error("no spawn points or map for map id {0}")]
    UnknownMap(MapId),
    #[error("spawn points for map {0} were already populated")]
    AlreadyInitialized(MapId),
    #[error("spawn loop for map {0} is already running")]
    AlreadyRunning(MapId),
    #[error("no tokio runtime available to run the spawn loop")]
    NoRuntime,
}
