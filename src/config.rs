use std::path::PathBuf;
use std::time::Duration;

use crate::game::constants::{ai, group, spatial, spawn};

/// Movement tuning for the AI driver
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AiTuning {
    pub chase_speed: f32,
    pub patrol_speed: f32,
    pub flee_speed: f32,
    /// Distance between a fleeing entity and its flee destination
    pub flee_distance: f32,
    /// A patrol waypoint counts as reached within this distance
    pub waypoint_radius: f32,
    /// Require an unobstructed vision-grid line before acquiring a target
    pub require_line_of_sight: bool,
}

impl Default for AiTuning {
    fn default() -> Self {
        Self {
            chase_speed: ai::CHASE_SPEED,
            patrol_speed: ai::PATROL_SPEED,
            flee_speed: ai::FLEE_SPEED,
            flee_distance: ai::FLEE_DISTANCE,
            waypoint_radius: ai::WAYPOINT_RADIUS,
            require_line_of_sight: false,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// AI ticks per second
    pub tick_rate_hz: u32,
    /// World units per vision grid cell
    pub vision_cell_size: f32,
    /// Vision grids older than this are refreshed on query
    pub vision_refresh_interval: Duration,
    /// Default A* search radius
    pub path_max_distance: f32,
    /// Replenishment loop period
    pub spawn_check_interval: Duration,
    /// Minimum time between group behavior dispatches
    pub group_update_interval: Duration,
    /// Groups idle longer than this are swept
    pub group_idle_timeout: Duration,
    /// How often the idle sweep runs
    pub group_sweep_interval: Duration,
    /// Metrics endpoint port, 0 disables it
    pub metrics_port: u16,
    /// JSON tables file; built-in demo tables when unset
    pub tables_path: Option<PathBuf>,
    /// Advisory capacity for the spatial pools
    pub pool_capacity: usize,
    pub ai: AiTuning,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: ai::TICK_RATE,
            vision_cell_size: spatial::VISION_CELL_SIZE,
            vision_refresh_interval: spatial::VISION_REFRESH_INTERVAL,
            path_max_distance: spatial::PATH_MAX_DISTANCE,
            spawn_check_interval: spawn::CHECK_INTERVAL,
            group_update_interval: group::UPDATE_INTERVAL,
            group_idle_timeout: group::IDLE_TIMEOUT,
            group_sweep_interval: group::SWEEP_INTERVAL,
            metrics_port: 9090,
            tables_path: None,
            pool_capacity: spatial::POOL_CAPACITY,
            ai: AiTuning::default(),
        }
    }
}

impl EngineConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(rate) = std::env::var("AI_TICK_RATE") {
            match rate.parse::<u32>() {
                Ok(parsed) if (1..=240).contains(&parsed) => config.tick_rate_hz = parsed,
                Ok(_) => tracing::warn!("AI_TICK_RATE must be 1-240, using default"),
                Err(_) => tracing::warn!("Invalid AI_TICK_RATE '{}', using default", rate),
            }
        }

        if let Ok(size) = std::env::var("VISION_CELL_SIZE") {
            match size.parse::<f32>() {
                Ok(parsed) if parsed > 0.0 && parsed.is_finite() => config.vision_cell_size = parsed,
                _ => tracing::warn!("Invalid VISION_CELL_SIZE '{}', using default", size),
            }
        }

        if let Ok(ms) = std::env::var("VISION_REFRESH_MS") {
            match ms.parse::<u64>() {
                Ok(parsed) => config.vision_refresh_interval = Duration::from_millis(parsed),
                Err(_) => tracing::warn!("Invalid VISION_REFRESH_MS '{}', using default", ms),
            }
        }

        if let Ok(dist) = std::env::var("PATH_MAX_DISTANCE") {
            match dist.parse::<f32>() {
                Ok(parsed) if parsed > 0.0 && parsed <= 256.0 => config.path_max_distance = parsed,
                Ok(_) => tracing::warn!("PATH_MAX_DISTANCE must be in (0, 256], using default"),
                Err(_) => tracing::warn!("Invalid PATH_MAX_DISTANCE '{}', using default", dist),
            }
        }

        if let Ok(ms) = std::env::var("SPAWN_CHECK_MS") {
            match ms.parse::<u64>() {
                Ok(parsed) if parsed > 0 => config.spawn_check_interval = Duration::from_millis(parsed),
                _ => tracing::warn!("Invalid SPAWN_CHECK_MS '{}', using default", ms),
            }
        }

        if let Ok(secs) = std::env::var("GROUP_IDLE_SECS") {
            match secs.parse::<u64>() {
                Ok(parsed) if parsed > 0 => config.group_idle_timeout = Duration::from_secs(parsed),
                _ => tracing::warn!("Invalid GROUP_IDLE_SECS '{}', using default", secs),
            }
        }

        if let Ok(port) = std::env::var("METRICS_PORT") {
            match port.parse::<u16>() {
                Ok(parsed) => config.metrics_port = parsed,
                Err(_) => tracing::warn!("Invalid METRICS_PORT '{}', using default", port),
            }
        }

        if let Ok(path) = std::env::var("AI_TABLES_PATH") {
            if !path.is_empty() {
                config.tables_path = Some(PathBuf::from(path));
            }
        }

        if let Ok(capacity) = std::env::var("POOL_CAPACITY") {
            match capacity.parse::<usize>() {
                Ok(parsed) => config.pool_capacity = parsed,
                Err(_) => tracing::warn!("Invalid POOL_CAPACITY '{}', using default", capacity),
            }
        }

        if let Ok(flag) = std::env::var("AI_REQUIRE_LOS") {
            config.ai.require_line_of_sight = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate_hz == 0 {
            return Err(ConfigError::Invalid("tick_rate_hz must be at least 1"));
        }
        if self.vision_cell_size <= 0.0 {
            return Err(ConfigError::Invalid("vision_cell_size must be positive"));
        }
        if self.path_max_distance <= 0.0 {
            return Err(ConfigError::Invalid("path_max_distance must be positive"));
        }
        if self.spawn_check_interval.is_zero() {
            return Err(ConfigError::Invalid("spawn_check_interval cannot be zero"));
        }
        if self.ai.waypoint_radius <= 0.0 {
            return Err(ConfigError::Invalid("waypoint_radius must be positive"));
        }
        Ok(())
    }

    /// Duration of one AI tick
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate_hz.max(1) as f64)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}
