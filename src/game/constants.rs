/// AI driver tuning
pub mod ai {
    /// Default AI tick rate in Hz
    pub const TICK_RATE: u32 = 10;
    /// Speed passed to `MoveTo` while chasing a target
    pub const CHASE_SPEED: f32 = 5.0;
    /// Speed passed to `MoveTo` while walking a patrol route
    pub const PATROL_SPEED: f32 = 2.0;
    /// Speed passed to `MoveTo` while fleeing
    pub const FLEE_SPEED: f32 = 6.0;
    /// How far ahead of the owner a flee destination is placed
    pub const FLEE_DISTANCE: f32 = 10.0;
    /// A waypoint counts as reached within this distance
    pub const WAYPOINT_RADIUS: f32 = 1.0;
    /// Default detection radius when an AI template does not set one
    pub const DEFAULT_DETECTION_RANGE: f32 = 10.0;
    /// Default melee reach
    pub const DEFAULT_ATTACK_RANGE: f32 = 2.0;
    /// Default leash distance
    pub const DEFAULT_CHASE_RANGE: f32 = 20.0;
    /// Initial capacity of the AI arena
    pub const INITIAL_CAPACITY: usize = 256;
}

/// Group coordinator timing
pub mod group {
    use std::time::Duration;

    /// Minimum time between two behavior dispatches for one group
    pub const UPDATE_INTERVAL: Duration = Duration::from_millis(100);
    /// Groups idle for longer than this are swept
    pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
    /// How often the server runs the idle sweep
    pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
}

/// Spawn manager timing
pub mod spawn {
    use std::time::Duration;

    /// Replenishment loop period
    pub const CHECK_INTERVAL: Duration = Duration::from_secs(1);
    /// First id handed out by the shared id allocator
    pub const FIRST_ENTITY_ID: u64 = 1_000_000;
}

/// Spatial services tuning
pub mod spatial {
    use std::time::Duration;

    /// World units per vision grid cell
    pub const VISION_CELL_SIZE: f32 = 1.0;
    /// A vision grid older than this is refreshed on the next query
    pub const VISION_REFRESH_INTERVAL: Duration = Duration::from_secs(1);
    /// A* step length (one grid unit)
    pub const PATH_STEP: f32 = 1.0;
    /// A* success radius around the goal
    pub const PATH_GOAL_RADIUS: f32 = 1.0;
    /// Default search radius around the start point
    pub const PATH_MAX_DISTANCE: f32 = 32.0;
    /// Advisory capacity for the spatial pools
    pub const POOL_CAPACITY: usize = 64;
    /// Initial node capacity of a pooled A* arena
    pub const NODE_ARENA_CAPACITY: usize = 512;
}
