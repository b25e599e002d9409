//! Patrol route parsing
//!
//! Routes are written as `"x,y,z;x,y,z;..."`. Malformed waypoints are dropped
//! with a warning and parsing continues with the rest of the list.

use tracing::warn;

use crate::util::vec3::Vec3;

pub fn parse_patrol_points(raw: &str) -> Vec<Vec3> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match parse_waypoint(entry) {
            Some(point) => Some(point),
            None => {
                warn!("Dropping malformed patrol waypoint '{}'", entry);
                None
            }
        })
        .collect()
}

fn parse_waypoint(entry: &str) -> Option<Vec3> {
    let mut parts = entry.split(',').map(|p| p.trim().parse::<f32>());
    let x = parts.next()?.ok()?;
    let y = parts.next()?.ok()?;
    let z = parts.next()?.ok()?;
    if parts.next().is_some() || !(x.is_finite() && y.is_finite() && z.is_finite()) {
        return None;
    }
    Some(Vec3::new(x, y, z))
}
