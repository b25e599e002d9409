//! Grid A* pathfinding
//!
//! Searches an implicit 8-connected grid of unit steps anchored at the start
//! position, on the X/Z plane. The search region is bounded by `max_distance`
//! around the start; there is no iteration cap, so a search always runs to
//! success or exhaustion. Callers bound `max_distance` to bound latency.
//!
//! Node storage comes from a pooled arena that is borrowed for exactly one
//! search and cleared when it goes back to the pool.

use std::f32::consts::SQRT_2;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::{FxHashMap, FxHashSet};
use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;
use tracing::trace;

use crate::game::constants::spatial::{NODE_ARENA_CAPACITY, PATH_GOAL_RADIUS, PATH_STEP, POOL_CAPACITY};
use crate::game::spatial::pool::{Pool, PoolStats, Poolable};
use crate::util::vec3::Vec3;

new_key_type! {
    /// Handle to a node inside one search's arena
    pub struct NodeKey;
}

/// Step offset from the start position, in whole steps
type StepOffset = (i32, i32);

/// Compass directions: N, NE, E, SE, S, SW, W, NW
const DIRECTIONS: [StepOffset; 8] = [
    (0, 1), (1, 1), (1, 0), (1, -1),
    (0, -1), (-1, -1), (-1, 0), (-1, 1),
];

/// Transient A* search node
#[derive(Debug, Clone, Copy)]
pub struct PathNode {
    pub position: Vec3,
    offset: StepOffset,
    pub parent: Option<NodeKey>,
    /// Cost from start
    pub g: f32,
    /// Straight-line estimate to goal
    pub h: f32,
    pub f: f32,
}

/// Working set for one search
#[derive(Default)]
pub struct NodeArena {
    nodes: SlotMap<NodeKey, PathNode>,
    open: Vec<NodeKey>,
    closed: FxHashSet<StepOffset>,
    best: FxHashMap<StepOffset, NodeKey>,
}

impl NodeArena {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Poolable for NodeArena {
    fn recycle(&mut self) {
        // Release every node touched by the search, open or closed
        self.nodes.clear();
        self.open.clear();
        self.closed.clear();
        self.best.clear();
    }
}

/// A* pathfinder with pooled node arenas
pub struct Pathfinder {
    pool: Pool<NodeArena>,
    searches: AtomicU64,
    successes: AtomicU64,
    expanded: AtomicU64,
}

impl Pathfinder {
    pub fn new(pool_capacity: usize) -> Self {
        Self {
            pool: Pool::new(pool_capacity),
            searches: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            expanded: AtomicU64::new(0),
        }
    }

    /// Path from `start` toward `end` over open ground
    ///
    /// Returns positions from start to a point within one unit of `end`, or
    /// an empty vector when no such point lies within `max_distance` of start.
    pub fn find_path(&self, start: Vec3, end: Vec3, max_distance: f32) -> Vec<Vec3> {
        self.find_path_with(start, end, max_distance, |_| true)
    }

    /// Same as `find_path`, but steps onto positions rejected by `walkable` are skipped
    pub fn find_path_with<F>(&self, start: Vec3, end: Vec3, max_distance: f32, walkable: F) -> Vec<Vec3>
    where
        F: Fn(Vec3) -> bool,
    {
        self.searches.fetch_add(1, Ordering::Relaxed);

        let mut arena = self.pool.borrow();
        if arena.nodes.capacity() == 0 {
            arena.nodes.reserve(NODE_ARENA_CAPACITY);
        }
        let NodeArena { nodes, open, closed, best } = &mut *arena;

        let h = start.distance_xz(end);
        let root = nodes.insert(PathNode {
            position: start,
            offset: (0, 0),
            parent: None,
            g: 0.0,
            h,
            f: h,
        });
        open.push(root);
        best.insert((0, 0), root);

        let mut expanded = 0u64;
        let mut path = Vec::new();

        while !open.is_empty() {
            // Linear scan; search regions are small
            let mut best_idx = 0;
            for (idx, key) in open.iter().enumerate().skip(1) {
                if nodes[*key].f < nodes[open[best_idx]].f {
                    best_idx = idx;
                }
            }
            let current_key = open.swap_remove(best_idx);
            let current = nodes[current_key];
            closed.insert(current.offset);
            expanded += 1;

            if current.position.distance_xz(end) <= PATH_GOAL_RADIUS {
                path = reconstruct(nodes, current_key);
                break;
            }

            let mut neighbors: SmallVec<[(StepOffset, Vec3, f32); 8]> = SmallVec::new();
            for &(dx, dz) in DIRECTIONS.iter() {
                let offset = (current.offset.0 + dx, current.offset.1 + dz);
                if closed.contains(&offset) {
                    continue;
                }
                let position = step_position(start, offset);
                if position.distance_xz(start) > max_distance || !walkable(position) {
                    continue;
                }
                let step_cost = (if dx != 0 && dz != 0 { SQRT_2 } else { 1.0 }) * PATH_STEP;
                neighbors.push((offset, position, current.g + step_cost));
            }

            for (offset, position, g) in neighbors {
                match best.get(&offset) {
                    Some(&key) => {
                        let node = &mut nodes[key];
                        if g >= node.g {
                            continue;
                        }
                        node.g = g;
                        node.f = g + node.h;
                        node.parent = Some(current_key);
                    }
                    None => {
                        let h = position.distance_xz(end);
                        let key = nodes.insert(PathNode {
                            position,
                            offset,
                            parent: Some(current_key),
                            g,
                            h,
                            f: g + h,
                        });
                        open.push(key);
                        best.insert(offset, key);
                    }
                }
            }
        }

        self.expanded.fetch_add(expanded, Ordering::Relaxed);
        if path.is_empty() {
            trace!("No path from {:?} to {:?} within {}", start, end, max_distance);
        } else {
            self.successes.fetch_add(1, Ordering::Relaxed);
        }
        path
    }

    pub fn stats(&self) -> PathfinderStats {
        PathfinderStats {
            searches: self.searches.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            nodes_expanded: self.expanded.load(Ordering::Relaxed),
            pool: self.pool.stats(),
        }
    }
}

impl Default for Pathfinder {
    fn default() -> Self {
        Self::new(POOL_CAPACITY)
    }
}

/// Pathfinder counters
#[derive(Debug, Clone, Copy)]
pub struct PathfinderStats {
    pub searches: u64,
    pub successes: u64,
    pub nodes_expanded: u64,
    pub pool: PoolStats,
}

#[inline]
fn step_position(start: Vec3, offset: StepOffset) -> Vec3 {
    Vec3::new(
        start.x + offset.0 as f32 * PATH_STEP,
        start.y,
        start.z + offset.1 as f32 * PATH_STEP,
    )
}

fn reconstruct(nodes: &SlotMap<NodeKey, PathNode>, goal: NodeKey) -> Vec<Vec3> {
    let mut path = Vec::new();
    let mut cursor = Some(goal);
    while let Some(key) = cursor {
        let node = &nodes[key];
        path.push(node.position);
        cursor = node.parent;
    }
    path.reverse();
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const EPSILON: f32 = 1e-3;

    fn assert_valid_path(path: &[Vec3], start: Vec3, end: Vec3) {
        assert!(!path.is_empty());
        assert!(path[0].distance_xz(start) <= 1.0 + EPSILON);
        assert!(path[path.len() - 1].distance_xz(end) <= 1.0 + EPSILON);
        for pair in path.windows(2) {
            let dx = pair[1].x - pair[0].x;
            let dz = pair[1].z - pair[0].z;
            let is_unit = |v: f32| (v.abs() - 1.0).abs() < EPSILON || v.abs() < EPSILON;
            assert!(is_unit(dx) && is_unit(dz), "bad step {:?} -> {:?}", pair[0], pair[1]);
            assert!(dx.abs() > EPSILON || dz.abs() > EPSILON, "zero-length step");
        }
    }

    #[test]
    fn test_straight_path() {
        let finder = Pathfinder::default();
        let start = Vec3::ZERO;
        let end = Vec3::new(5.0, 0.0, 0.0);

        let path = finder.find_path(start, end, 10.0);

        assert_valid_path(&path, start, end);
        // 4 steps along x brings us within one unit
        assert_eq!(path.len(), 5);
    }

    #[test]
    fn test_diagonal_path_uses_diagonal_steps() {
        let finder = Pathfinder::default();
        let start = Vec3::ZERO;
        let end = Vec3::new(4.0, 0.0, 4.0);

        let path = finder.find_path(start, end, 10.0);

        assert_valid_path(&path, start, end);
        assert!(path.len() <= 5, "expected diagonal shortcut, got {} nodes", path.len());
    }

    #[test]
    fn test_start_at_goal() {
        let finder = Pathfinder::default();
        let start = Vec3::new(2.0, 0.0, 2.0);
        let path = finder.find_path(start, Vec3::new(2.5, 0.0, 2.0), 5.0);
        assert_eq!(path, vec![start]);
    }

    #[test]
    fn test_goal_outside_region_returns_empty() {
        let finder = Pathfinder::default();
        let path = finder.find_path(Vec3::ZERO, Vec3::new(10.0, 0.0, 0.0), 3.0);
        assert!(path.is_empty());

        let stats = finder.stats();
        assert_eq!(stats.searches, 1);
        assert_eq!(stats.successes, 0);
        assert!(stats.nodes_expanded > 1);
    }

    #[test]
    fn test_arena_returned_after_every_search() {
        let finder = Pathfinder::new(2);
        finder.find_path(Vec3::ZERO, Vec3::new(6.0, 0.0, 3.0), 10.0);
        finder.find_path(Vec3::ZERO, Vec3::new(50.0, 0.0, 0.0), 4.0);

        let pool = finder.stats().pool;
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.allocations, 1, "second search reuses the first arena");
    }

    #[test]
    fn test_recycled_arena_is_empty() {
        let mut arena = NodeArena::default();
        arena.nodes.insert(PathNode {
            position: Vec3::ZERO,
            offset: (0, 0),
            parent: None,
            g: 0.0,
            h: 0.0,
            f: 0.0,
        });
        arena.open.push(NodeKey::default());
        arena.recycle();
        assert!(arena.is_empty());
        assert!(arena.open.is_empty());
    }

    #[test]
    fn test_walls_are_avoided() {
        let finder = Pathfinder::default();
        let start = Vec3::ZERO;
        let end = Vec3::new(6.0, 0.0, 0.0);
        // Wall at x=3 from z=-4 to z=4
        let walkable = |p: Vec3| !((p.x - 3.0).abs() < 0.5 && p.z.abs() <= 4.0);

        let path = finder.find_path_with(start, end, 12.0, walkable);

        assert_valid_path(&path, start, end);
        assert!(path.iter().all(|&p| walkable(p)));
        assert!(path.len() > 7, "path must detour around the wall");
    }

    #[test]
    fn test_fully_enclosed_goal_unreachable() {
        let finder = Pathfinder::default();
        let end = Vec3::new(6.0, 0.0, 0.0);
        // Ring around the goal
        let walkable = |p: Vec3| {
            let d = p.distance_xz(end);
            !(1.5..=3.5).contains(&d)
        };
        let path = finder.find_path_with(Vec3::ZERO, end, 10.0, walkable);
        assert!(path.is_empty());
        assert_eq!(finder.stats().pool.outstanding(), 0);
    }

    #[test]
    fn test_path_steps_randomized() {
        let finder = Pathfinder::default();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let start = Vec3::new(rng.gen_range(-20.0..20.0), 0.0, rng.gen_range(-20.0..20.0));
            let end = start + Vec3::new(rng.gen_range(-6.0..6.0), 0.0, rng.gen_range(-6.0..6.0));

            let path = finder.find_path(start, end, 10.0);
            assert_valid_path(&path, start, end);
        }
        assert_eq!(finder.stats().pool.outstanding(), 0);
    }
}
