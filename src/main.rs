use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use mob_director::config::EngineConfig;
use mob_director::game::entity::{Entity, EntityId, EntityKind, IdAllocator, MapId, Stat, World, NO_TARGET};
use mob_director::game::sim::{SimEntity, SimWorld};
use mob_director::game::spatial::{Pathfinder, VisionService};
use mob_director::game::systems::ai::AiDriver;
use mob_director::game::systems::group::{GroupBehavior, GroupCoordinator, GroupId};
use mob_director::game::systems::spawn::{SpawnContext, SpawnDirector};
use mob_director::game::tables::ConfigTables;
use mob_director::metrics::EngineMetrics;
use mob_director::util::vec3::Vec3;

const PLAYER_ID: EntityId = 1;
const PLAYER_SPEED: f32 = 3.0;
const PLAYER_REACH: f32 = 2.0;
const PLAYER_DAMAGE: f32 = 4.0;
const WANDER_RADIUS: f32 = 16.0;

/// A scripted player that wanders between random points and hits back
struct Wanderer {
    body: Arc<SimEntity>,
    map_id: MapId,
    route: VecDeque<Vec3>,
    rng: StdRng,
}

impl Wanderer {
    fn step(&mut self, pathfinder: &Pathfinder, vision: &VisionService, max_distance: f32) {
        let here = self.body.position();
        while let Some(next) = self.route.front() {
            if here.distance_xz(*next) > 0.5 {
                break;
            }
            self.route.pop_front();
        }

        if self.route.is_empty() {
            let goal = Vec3::new(
                self.rng.gen_range(-WANDER_RADIUS..=WANDER_RADIUS),
                0.0,
                self.rng.gen_range(-WANDER_RADIUS..=WANDER_RADIUS),
            );
            let map_id = self.map_id;
            let path = pathfinder.find_path_with(here, goal, max_distance, |p| {
                vision.is_walkable(map_id, p)
            });
            debug!("Player heading to {:?} via {} steps", goal, path.len());
            self.route.extend(path);
        }

        if let (Some(next), Some(movement)) = (self.route.front(), self.body.components().movement()) {
            movement.move_to(*next, PLAYER_SPEED);
        }
    }

    /// Damage monsters in reach; returns the ids that died
    fn strike(&self, world: &SimWorld) -> Vec<EntityId> {
        let Some(map) = world.map(self.map_id) else {
            return Vec::new();
        };
        let mut dead = Vec::new();
        for target in map.objects_in_range(self.body.position(), PLAYER_REACH) {
            if target.kind() != EntityKind::Monster {
                continue;
            }
            let Some(props) = target.components().properties() else {
                continue;
            };
            let hp = props.get(Stat::Hp) - PLAYER_DAMAGE;
            props.set(Stat::Hp, hp.max(0.0));
            if hp <= 0.0 {
                dead.push(target.id());
            }
        }
        dead
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Mob Director v{}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::load_or_default();
    config.validate()?;
    info!(
        "Configuration loaded: tick_rate={}Hz, spawn_check={:?}, path_max_distance={}",
        config.tick_rate_hz, config.spawn_check_interval, config.path_max_distance
    );

    let tables = match &config.tables_path {
        Some(path) => ConfigTables::load(path)
            .with_context(|| format!("loading tables from {}", path.display()))?,
        None => {
            info!("AI_TABLES_PATH not set, using built-in demo tables");
            ConfigTables::demo()
        }
    };
    let tables = Arc::new(tables);

    // Services, constructed once and shared explicitly
    let world = Arc::new(SimWorld::new());
    for map_id in tables.map_ids() {
        world.add_map(map_id);
    }
    let vision = Arc::new(VisionService::new(
        config.vision_cell_size,
        config.vision_refresh_interval,
        config.pool_capacity,
    ));
    let pathfinder = Pathfinder::new(config.pool_capacity);
    let driver = Arc::new(
        AiDriver::new(world.clone(), tables.clone(), config.ai).with_vision(vision.clone()),
    );
    let groups = GroupCoordinator::with_timing(
        driver.clone(),
        config.group_update_interval,
        config.group_idle_timeout,
        config.pool_capacity,
    );
    let spawn_ctx = SpawnContext::new(
        tables.clone(),
        world.clone(),
        driver.clone(),
        Arc::new(IdAllocator::default()),
    )
    .with_check_interval(config.spawn_check_interval);
    let director = SpawnDirector::new(world.clone(), spawn_ctx);

    let metrics = Arc::new(EngineMetrics::new());

    #[cfg(feature = "metrics_endpoint")]
    if config.metrics_port != 0 {
        let metrics = metrics.clone();
        let port = config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = mob_director::metrics::start_metrics_server(metrics, port).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let Some(home) = tables.map_ids().first().copied() else {
        warn!("No spawn points configured, nothing to run");
        return Ok(());
    };

    // A short wall between the player's start and the origin
    for z in -4..=4 {
        vision.set_blocked(home, Vec3::new(6.0, 0.0, z as f32), true);
    }

    let started = director.init_all();
    info!("Spawn managers running for {} maps", started);

    let mut player = Wanderer {
        body: world.spawn(SimEntity::new(PLAYER_ID, EntityKind::Player, home, Vec3::new(12.0, 0.0, 0.0))),
        map_id: home,
        route: VecDeque::new(),
        rng: StdRng::from_entropy(),
    };

    let mut pack: Option<GroupId> = director.manager(home).and_then(|manager| {
        let members = manager.live_entities();
        groups.create_group(&members, Instant::now()).ok()
    });

    let dt = config.tick_interval().as_secs_f32();
    let mut ticker = tokio::time::interval(config.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sweep = tokio::time::interval(config.group_sweep_interval);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("AI loop running at {}Hz", config.tick_rate_hz);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();

                player.step(&pathfinder, &vision, config.path_max_distance);
                for dead in player.strike(&world) {
                    world.kill(dead);
                    if let Some(group) = groups.group_of(dead) {
                        let _ = groups.remove_member(group, dead);
                    }
                }

                let report = driver.update(now);
                world.advance(dt);

                // The pack joins in once its leader has found the player
                if let Some(id) = pack {
                    let target = groups
                        .leader(id)
                        .and_then(|leader| driver.snapshot(leader))
                        .map(|ai| ai.target_id)
                        .filter(|target| *target != NO_TARGET);
                    match target {
                        Some(target) => {
                            let _ = groups.set_target(id, target);
                            let _ = groups.set_behavior(id, GroupBehavior::Attack);
                        }
                        None if groups.leader(id).is_none() => pack = None,
                        None => {}
                    }
                }
                groups.update_all(now);

                metrics.record_tick_time(now.elapsed());
                metrics.ai_transitions.fetch_add(report.transitions as u64, Ordering::Relaxed);
                metrics.record_ai_states(driver.state_counts());
                metrics.record_paths(pathfinder.stats());
                metrics.record_spawns(director.total_spawned(), director.counters());
                metrics.groups_live.store(groups.len() as u64, Ordering::Relaxed);
                metrics.visibility_queries.store(vision.query_count(), Ordering::Relaxed);
                metrics.vision_grids.store(vision.grid_count() as u64, Ordering::Relaxed);
                metrics.pool_allocations.store(
                    pathfinder.stats().pool.allocations
                        + vision.pool_stats().allocations
                        + groups.pool_stats().allocations,
                    Ordering::Relaxed,
                );
            }
            _ = sweep.tick() => {
                let removed = groups.sweep_idle(Instant::now());
                if removed > 0 {
                    info!("Swept {} idle groups", removed);
                }
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Shutdown signal received");
                break;
            }
        }
    }

    director.stop_all();
    info!(
        "Server stopped: {} monsters live, {} ticks",
        director.total_spawned(),
        metrics.tick_count.load(Ordering::Relaxed)
    );

    Ok(())
}
