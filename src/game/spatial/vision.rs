//! Vision grid line-of-sight
//!
//! Each map instance owns a sparse occupancy grid on the X/Z plane. A query
//! rasterizes the segment between two points into grid cells and fails on the
//! first blocked cell strictly between the endpoints.
//!
//! Grids are created lazily on first use and refreshed when older than their
//! refresh interval. Occupancy itself is written by collaborators through
//! `set_blocked`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::trace;

use crate::game::constants::spatial::{POOL_CAPACITY, VISION_CELL_SIZE, VISION_REFRESH_INTERVAL};
use crate::game::entity::MapId;
use crate::game::spatial::pool::{Pool, PoolStats, Poolable};
use crate::util::vec3::Vec3;

/// Grid cell key - (x, z) cell coordinates
pub type CellKey = (i32, i32);

/// Sparse occupancy grid for one map instance
#[derive(Debug, Default)]
pub struct VisionGrid {
    cell_size: f32,
    inv_cell_size: f32,
    /// Cells not present are open
    blocked: HashMap<CellKey, bool>,
    last_refresh: Option<Instant>,
    refresh_interval: Duration,
}

// Recycled grids keep their old cells until `reinit`
impl Poolable for VisionGrid {}

impl VisionGrid {
    pub fn new(cell_size: f32, refresh_interval: Duration, now: Instant) -> Self {
        let mut grid = Self::default();
        grid.reinit(cell_size, refresh_interval, now);
        grid
    }

    /// Set every field; required after taking a grid out of a pool
    pub fn reinit(&mut self, cell_size: f32, refresh_interval: Duration, now: Instant) {
        let cell_size = if cell_size > 0.0 { cell_size } else { VISION_CELL_SIZE };
        self.cell_size = cell_size;
        self.inv_cell_size = 1.0 / cell_size;
        self.blocked.clear();
        self.last_refresh = Some(now);
        self.refresh_interval = refresh_interval;
    }

    #[inline]
    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Convert world position to cell key
    #[inline]
    pub fn position_to_cell(&self, position: Vec3) -> CellKey {
        (
            (position.x * self.inv_cell_size).floor() as i32,
            (position.z * self.inv_cell_size).floor() as i32,
        )
    }

    pub fn set_blocked(&mut self, cell: CellKey, blocked: bool) {
        if blocked {
            self.blocked.insert(cell, true);
        } else {
            self.blocked.remove(&cell);
        }
    }

    #[inline]
    pub fn is_blocked(&self, cell: CellKey) -> bool {
        self.blocked.get(&cell).copied().unwrap_or(false)
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.values().filter(|&&b| b).count()
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        match self.last_refresh {
            Some(at) => now.saturating_duration_since(at) >= self.refresh_interval,
            None => true,
        }
    }

    /// Mark the grid fresh. Occupancy is recomputed by whoever owns the map.
    pub fn refresh(&mut self, now: Instant) {
        self.last_refresh = Some(now);
    }

    /// No blocked cell strictly between `from` and `to`
    pub fn line_clear(&self, from: CellKey, to: CellKey) -> bool {
        if from == to {
            return true;
        }
        GridLine::new(from, to)
            .filter(|&cell| cell != from && cell != to)
            .all(|cell| !self.is_blocked(cell))
    }

    pub fn is_visible(&self, start: Vec3, end: Vec3) -> bool {
        self.line_clear(self.position_to_cell(start), self.position_to_cell(end))
    }
}

/// Integer grid line between two cells, endpoints included (Bresenham)
#[derive(Debug, Clone)]
pub struct GridLine {
    x: i32,
    y: i32,
    x1: i32,
    y1: i32,
    dx: i32,
    dy: i32,
    sx: i32,
    sy: i32,
    err: i32,
    done: bool,
}

impl GridLine {
    pub fn new(from: CellKey, to: CellKey) -> Self {
        let dx = (to.0 - from.0).abs();
        let dy = -(to.1 - from.1).abs();
        Self {
            x: from.0,
            y: from.1,
            x1: to.0,
            y1: to.1,
            dx,
            dy,
            sx: if from.0 < to.0 { 1 } else { -1 },
            sy: if from.1 < to.1 { 1 } else { -1 },
            err: dx + dy,
            done: false,
        }
    }
}

impl Iterator for GridLine {
    type Item = CellKey;

    fn next(&mut self) -> Option<CellKey> {
        if self.done {
            return None;
        }
        let current = (self.x, self.y);
        if self.x == self.x1 && self.y == self.y1 {
            self.done = true;
            return Some(current);
        }
        let e2 = 2 * self.err;
        if e2 >= self.dy {
            self.err += self.dy;
            self.x += self.sx;
        }
        if e2 <= self.dx {
            self.err += self.dx;
            self.y += self.sy;
        }
        Some(current)
    }
}

/// Line-of-sight service over all map instances
pub struct VisionService {
    grids: RwLock<HashMap<MapId, VisionGrid>>,
    pool: Pool<VisionGrid>,
    cell_size: f32,
    refresh_interval: Duration,
    queries: AtomicU64,
    refreshes: AtomicU64,
}

impl VisionService {
    pub fn new(cell_size: f32, refresh_interval: Duration, pool_capacity: usize) -> Self {
        Self {
            grids: RwLock::new(HashMap::new()),
            pool: Pool::new(pool_capacity),
            cell_size,
            refresh_interval,
            queries: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Can something at `start` see `end` on this instance's grid
    pub fn is_visible(&self, instance: MapId, start: Vec3, end: Vec3) -> bool {
        self.is_visible_at(instance, start, end, Instant::now())
    }

    pub fn is_visible_at(&self, instance: MapId, start: Vec3, end: Vec3, now: Instant) -> bool {
        self.queries.fetch_add(1, Ordering::Relaxed);

        {
            let grids = self.grids.read();
            if let Some(grid) = grids.get(&instance) {
                if !grid.is_stale(now) {
                    return grid.is_visible(start, end);
                }
            }
        }

        // Another caller may refresh between the two locks; `is_stale` is rechecked
        let mut grids = self.grids.write();
        let grid = self.grid_entry(&mut grids, instance, now);
        if grid.is_stale(now) {
            grid.refresh(now);
            self.refreshes.fetch_add(1, Ordering::Relaxed);
            trace!("Refreshed vision grid for instance {}", instance);
        }
        grid.is_visible(start, end)
    }

    /// Mark the cell containing `position` as blocked or open
    pub fn set_blocked(&self, instance: MapId, position: Vec3, blocked: bool) {
        let now = Instant::now();
        let mut grids = self.grids.write();
        let grid = self.grid_entry(&mut grids, instance, now);
        let cell = grid.position_to_cell(position);
        grid.set_blocked(cell, blocked);
    }

    pub fn set_blocked_cell(&self, instance: MapId, cell: CellKey, blocked: bool) {
        let now = Instant::now();
        let mut grids = self.grids.write();
        self.grid_entry(&mut grids, instance, now).set_blocked(cell, blocked);
    }

    /// Open ground on this instance (instances without a grid are fully open)
    pub fn is_walkable(&self, instance: MapId, position: Vec3) -> bool {
        let grids = self.grids.read();
        match grids.get(&instance) {
            Some(grid) => !grid.is_blocked(grid.position_to_cell(position)),
            None => true,
        }
    }

    /// Drop an instance's grid and return it to the pool
    pub fn clear_instance(&self, instance: MapId) -> bool {
        let removed = self.grids.write().remove(&instance);
        match removed {
            Some(grid) => {
                self.pool.put(grid);
                true
            }
            None => false,
        }
    }

    pub fn grid_count(&self) -> usize {
        self.grids.read().len()
    }

    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn grid_entry<'g>(
        &self,
        grids: &'g mut HashMap<MapId, VisionGrid>,
        instance: MapId,
        now: Instant,
    ) -> &'g mut VisionGrid {
        grids.entry(instance).or_insert_with(|| {
            let mut grid = self.pool.get();
            grid.reinit(self.cell_size, self.refresh_interval, now);
            trace!("Created vision grid for instance {}", instance);
            grid
        })
    }
}

impl Default for VisionService {
    fn default() -> Self {
        Self::new(VISION_CELL_SIZE, VISION_REFRESH_INTERVAL, POOL_CAPACITY)
    }
}
