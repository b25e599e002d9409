//! Read-only config tables
//!
//! AI behavior templates, monster stat blocks and spawn points, keyed by
//! integer id. Loaded once at startup (JSON) and shared behind an `Arc`.

use std::path::Path;
use std::time::Duration;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::game::constants::ai as ai_defaults;
use crate::game::entity::MapId;
use crate::game::systems::ai::AiKind;
use crate::util::vec3::Vec3;

/// AI behavior parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiTemplate {
    pub id: u32,
    pub kind: AiKind,
    #[serde(default = "default_detection_range")]
    pub detection_range: f32,
    #[serde(default = "default_attack_range")]
    pub attack_range: f32,
    #[serde(default = "default_chase_range")]
    pub chase_range: f32,
    /// 0 disables fleeing
    #[serde(default)]
    pub flee_health_ratio: f32,
    /// `"x,y,z;x,y,z;..."`, empty for no patrol
    #[serde(default)]
    pub patrol_points: String,
}

fn default_detection_range() -> f32 {
    ai_defaults::DEFAULT_DETECTION_RANGE
}

fn default_attack_range() -> f32 {
    ai_defaults::DEFAULT_ATTACK_RANGE
}

fn default_chase_range() -> f32 {
    ai_defaults::DEFAULT_CHASE_RANGE
}

/// Monster stat block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonsterTemplate {
    pub id: u32,
    pub name: String,
    pub hp: f32,
    #[serde(default)]
    pub mp: f32,
    #[serde(default)]
    pub attack: f32,
    #[serde(default)]
    pub defense: f32,
    #[serde(default)]
    pub haste: f32,
    #[serde(default)]
    pub exp: f32,
    /// AI template attached on spawn
    #[serde(default)]
    pub ai_id: Option<u32>,
}

/// Designer-placed spawn point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnPointConfig {
    pub id: u32,
    pub map_id: MapId,
    pub monster_id: u32,
    pub position: Vec3,
    pub max_count: usize,
    #[serde(default)]
    pub radius: f32,
    pub spawn_interval_ms: u64,
}

impl SpawnPointConfig {
    #[inline]
    pub fn spawn_interval(&self) -> Duration {
        Duration::from_millis(self.spawn_interval_ms)
    }
}

/// On-disk layout
#[derive(Debug, Default, Serialize, Deserialize)]
struct TablesFile {
    #[serde(default)]
    ai: Vec<AiTemplate>,
    #[serde(default)]
    monsters: Vec<MonsterTemplate>,
    #[serde(default)]
    spawn_points: Vec<SpawnPointConfig>,
}

/// All config tables the engine queries
#[derive(Debug, Default, Clone)]
pub struct ConfigTables {
    ai: HashMap<u32, AiTemplate>,
    monsters: HashMap<u32, MonsterTemplate>,
    spawn_points: HashMap<MapId, Vec<SpawnPointConfig>>,
}

impl ConfigTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load tables from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TablesError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, TablesError> {
        let file: TablesFile = serde_json::from_str(raw)?;
        Self::from_file(file)
    }

    fn from_file(file: TablesFile) -> Result<Self, TablesError> {
        let mut tables = Self::new();
        for template in file.ai {
            tables.insert_ai(template)?;
        }
        for template in file.monsters {
            tables.insert_monster(template)?;
        }
        for point in file.spawn_points {
            tables.insert_spawn_point(point)?;
        }
        Ok(tables)
    }

    pub fn insert_ai(&mut self, template: AiTemplate) -> Result<(), TablesError> {
        if self.ai.contains_key(&template.id) {
            return Err(TablesError::DuplicateId { table: "ai", id: template.id });
        }
        self.ai.insert(template.id, template);
        Ok(())
    }

    pub fn insert_monster(&mut self, template: MonsterTemplate) -> Result<(), TablesError> {
        if self.monsters.contains_key(&template.id) {
            return Err(TablesError::DuplicateId { table: "monsters", id: template.id });
        }
        self.monsters.insert(template.id, template);
        Ok(())
    }

    pub fn insert_spawn_point(&mut self, point: SpawnPointConfig) -> Result<(), TablesError> {
        let duplicate = self
            .spawn_points
            .values()
            .flatten()
            .any(|existing| existing.id == point.id);
        if duplicate {
            return Err(TablesError::DuplicateId { table: "spawn_points", id: point.id });
        }
        self.spawn_points.entry(point.map_id).or_default().push(point);
        Ok(())
    }

    pub fn ai(&self, id: u32) -> Option<&AiTemplate> {
        self.ai.get(&id)
    }

    pub fn monster(&self, id: u32) -> Option<&MonsterTemplate> {
        self.monsters.get(&id)
    }

    /// Spawn points placed on a map, `None` if the map has no entry at all
    pub fn spawn_points(&self, map_id: MapId) -> Option<&[SpawnPointConfig]> {
        self.spawn_points.get(&map_id).map(Vec::as_slice)
    }

    /// Every map that has at least one spawn point
    pub fn map_ids(&self) -> Vec<MapId> {
        let mut ids: Vec<MapId> = self.spawn_points.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Small built-in data set used when no tables file is configured
    pub fn demo() -> Self {
        let file = TablesFile {
            ai: vec![
                AiTemplate {
                    id: 1,
                    kind: AiKind::Monster,
                    detection_range: 12.0,
                    attack_range: 2.0,
                    chase_range: 24.0,
                    flee_health_ratio: 0.2,
                    patrol_points: String::new(),
                },
                AiTemplate {
                    id: 2,
                    kind: AiKind::Monster,
                    detection_range: 8.0,
                    attack_range: 1.5,
                    chase_range: 16.0,
                    flee_health_ratio: 0.0,
                    patrol_points: "0,0,0;8,0,0;8,0,8;0,0,8".to_string(),
                },
            ],
            monsters: vec![
                MonsterTemplate {
                    id: 100,
                    name: "Cave Wolf".to_string(),
                    hp: 120.0,
                    mp: 0.0,
                    attack: 14.0,
                    defense: 4.0,
                    haste: 1.2,
                    exp: 35.0,
                    ai_id: Some(1),
                },
                MonsterTemplate {
                    id: 101,
                    name: "Ruin Sentry".to_string(),
                    hp: 300.0,
                    mp: 50.0,
                    attack: 22.0,
                    defense: 12.0,
                    haste: 0.8,
                    exp: 90.0,
                    ai_id: Some(2),
                },
            ],
            spawn_points: vec![
                SpawnPointConfig {
                    id: 1,
                    map_id: 1,
                    monster_id: 100,
                    position: Vec3::new(20.0, 0.0, 20.0),
                    max_count: 3,
                    radius: 4.0,
                    spawn_interval_ms: 5_000,
                },
                SpawnPointConfig {
                    id: 2,
                    map_id: 1,
                    monster_id: 101,
                    position: Vec3::new(0.0, 0.0, 0.0),
                    max_count: 1,
                    radius: 0.0,
                    spawn_interval_ms: 15_000,
                },
            ],
        };

        Self::from_file(file).unwrap_or_else(|e| {
            tracing::warn!("Built-in demo tables rejected: {}", e);
            Self::new()
        })
    }
}

/// Table loading errors
#[derive(Debug, thiserror::Error)]
pub enum TablesError {
    #[error("failed to read tables: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse tables: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("duplicate id {id} in {table} table")]
    DuplicateId { table: &'static str, id: u32 },
}
