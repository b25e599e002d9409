//! Spatial services: line-of-sight, pathfinding and the pools behind them

pub mod pathfinding;
pub mod pool;
pub mod vision;

pub use pathfinding::Pathfinder;
pub use vision::VisionService;
