pub mod ai;
pub mod group;
pub mod patrol;
pub mod spawn;
