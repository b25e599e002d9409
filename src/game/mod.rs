pub mod constants;
pub mod entity;
pub mod sim;
pub mod spatial;
pub mod systems;
pub mod tables;
