//! Prometheus-compatible metrics endpoint
//!
//! Exposes AI engine counters in Prometheus text format and JSON.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::game::spatial::pathfinding::PathfinderStats;
use crate::game::systems::ai::AiBehavior;
use crate::game::systems::spawn::SpawnCounters;

const TICK_HISTORY: usize = 1000;

/// Metrics registry for the AI engine
#[derive(Debug)]
pub struct EngineMetrics {
    // AI population
    pub ai_tracked: AtomicU64,
    ai_states: [AtomicU64; 5],
    pub ai_transitions: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    // Spatial services
    pub path_searches: AtomicU64,
    pub path_successes: AtomicU64,
    pub path_nodes_expanded: AtomicU64,
    pub visibility_queries: AtomicU64,
    pub vision_grids: AtomicU64,
    pub pool_allocations: AtomicU64,

    // Groups and spawns
    pub groups_live: AtomicU64,
    pub monsters_live: AtomicU64,
    pub monsters_spawned: AtomicU64,
    pub monsters_respawned: AtomicU64,
    pub monsters_died: AtomicU64,

    start_time: Instant,
    tick_history: RwLock<VecDeque<u64>>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            ai_tracked: AtomicU64::new(0),
            ai_states: Default::default(),
            ai_transitions: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            path_searches: AtomicU64::new(0),
            path_successes: AtomicU64::new(0),
            path_nodes_expanded: AtomicU64::new(0),
            visibility_queries: AtomicU64::new(0),
            vision_grids: AtomicU64::new(0),
            pool_allocations: AtomicU64::new(0),
            groups_live: AtomicU64::new(0),
            monsters_live: AtomicU64::new(0),
            monsters_spawned: AtomicU64::new(0),
            monsters_respawned: AtomicU64::new(0),
            monsters_died: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY)),
        }
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.tick_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Store per-state AI counts, indexed by [`AiBehavior::index`]
    pub fn record_ai_states(&self, counts: [usize; 5]) {
        let mut total = 0;
        for (slot, count) in self.ai_states.iter().zip(counts) {
            slot.store(count as u64, Ordering::Relaxed);
            total += count as u64;
        }
        self.ai_tracked.store(total, Ordering::Relaxed);
    }

    pub fn ai_state(&self, behavior: AiBehavior) -> u64 {
        self.ai_states[behavior.index()].load(Ordering::Relaxed)
    }

    pub fn record_paths(&self, stats: PathfinderStats) {
        self.path_searches.store(stats.searches, Ordering::Relaxed);
        self.path_successes.store(stats.successes, Ordering::Relaxed);
        self.path_nodes_expanded.store(stats.nodes_expanded, Ordering::Relaxed);
    }

    pub fn record_spawns(&self, live: usize, counters: SpawnCounters) {
        self.monsters_live.store(live as u64, Ordering::Relaxed);
        self.monsters_spawned.store(counters.spawned, Ordering::Relaxed);
        self.monsters_respawned.store(counters.respawned, Ordering::Relaxed);
        self.monsters_died.store(counters.died, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("mob_director_ai_tracked", "AI records attached to entities", "gauge",
            self.ai_tracked.load(Ordering::Relaxed));
        output.push_str("# HELP mob_director_ai_state AI records per behavior state\n");
        output.push_str("# TYPE mob_director_ai_state gauge\n");
        for behavior in AiBehavior::ALL {
            output.push_str(&format!(
                "mob_director_ai_state{{state=\"{}\"}} {}\n",
                behavior.as_str(),
                self.ai_state(behavior)
            ));
        }
        metric!("mob_director_ai_transitions_total", "State transitions across all ticks", "counter",
            self.ai_transitions.load(Ordering::Relaxed));

        metric!("mob_director_tick_time_microseconds", "Current AI tick time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("mob_director_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("mob_director_tick_time_p99_microseconds", "99th percentile tick time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("mob_director_tick_time_max_microseconds", "Maximum tick time", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("mob_director_tick_count", "Total AI ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));

        metric!("mob_director_path_searches_total", "A* searches run", "counter",
            self.path_searches.load(Ordering::Relaxed));
        metric!("mob_director_path_successes_total", "A* searches that reached the goal", "counter",
            self.path_successes.load(Ordering::Relaxed));
        metric!("mob_director_path_nodes_expanded_total", "A* nodes expanded", "counter",
            self.path_nodes_expanded.load(Ordering::Relaxed));
        metric!("mob_director_visibility_queries_total", "Line-of-sight queries", "counter",
            self.visibility_queries.load(Ordering::Relaxed));
        metric!("mob_director_vision_grids", "Live vision grids", "gauge",
            self.vision_grids.load(Ordering::Relaxed));
        metric!("mob_director_pool_allocations_total", "Objects allocated past the pools", "counter",
            self.pool_allocations.load(Ordering::Relaxed));

        metric!("mob_director_groups", "Live AI groups", "gauge",
            self.groups_live.load(Ordering::Relaxed));
        metric!("mob_director_monsters_live", "Live spawned monsters", "gauge",
            self.monsters_live.load(Ordering::Relaxed));
        metric!("mob_director_monsters_spawned_total", "Monsters spawned", "counter",
            self.monsters_spawned.load(Ordering::Relaxed));
        metric!("mob_director_monsters_respawned_total", "Monsters spawned by replenishment", "counter",
            self.monsters_respawned.load(Ordering::Relaxed));
        metric!("mob_director_monsters_died_total", "Spawned monsters that died", "counter",
            self.monsters_died.load(Ordering::Relaxed));
        metric!("mob_director_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics
    pub fn to_json(&self) -> String {
        let states: serde_json::Map<String, serde_json::Value> = AiBehavior::ALL
            .iter()
            .map(|b| (b.as_str().to_string(), json!(self.ai_state(*b))))
            .collect();

        json!({
            "ai": {
                "tracked": self.ai_tracked.load(Ordering::Relaxed),
                "states": states,
                "transitions": self.ai_transitions.load(Ordering::Relaxed),
            },
            "performance": {
                "tick_time_us": self.tick_time_us.load(Ordering::Relaxed),
                "tick_time_p95_us": self.tick_time_p95_us.load(Ordering::Relaxed),
                "tick_time_p99_us": self.tick_time_p99_us.load(Ordering::Relaxed),
                "tick_time_max_us": self.tick_time_max_us.load(Ordering::Relaxed),
                "tick_count": self.tick_count.load(Ordering::Relaxed),
            },
            "spatial": {
                "path_searches": self.path_searches.load(Ordering::Relaxed),
                "path_successes": self.path_successes.load(Ordering::Relaxed),
                "path_nodes_expanded": self.path_nodes_expanded.load(Ordering::Relaxed),
                "visibility_queries": self.visibility_queries.load(Ordering::Relaxed),
                "vision_grids": self.vision_grids.load(Ordering::Relaxed),
                "pool_allocations": self.pool_allocations.load(Ordering::Relaxed),
            },
            "population": {
                "groups": self.groups_live.load(Ordering::Relaxed),
                "monsters_live": self.monsters_live.load(Ordering::Relaxed),
                "monsters_spawned": self.monsters_spawned.load(Ordering::Relaxed),
                "monsters_respawned": self.monsters_respawned.load(Ordering::Relaxed),
                "monsters_died": self.monsters_died.load(Ordering::Relaxed),
            },
            "uptime_seconds": self.uptime_seconds(),
        })
        .to_string()
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn http_response(content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}

/// Route one request line to a full HTTP response
fn route(request: &str, metrics: &EngineMetrics) -> String {
    if request.starts_with("GET /metrics/json") {
        http_response("application/json", &metrics.to_json())
    } else if request.starts_with("GET /metrics") {
        http_response("text/plain; version=0.0.4", &metrics.to_prometheus())
    } else if request.starts_with("GET /health") || request.starts_with("GET / ") {
        http_response("text/plain", "OK")
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<EngineMetrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = route(&request, &metrics);
                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_tick_time() {
        let metrics = EngineMetrics::new();
        for i in 0..100 {
            metrics.record_tick_time(Duration::from_micros(100 + i * 10));
        }

        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 100);
        assert!(metrics.tick_time_p95_us.load(Ordering::Relaxed) > 0);
        assert_eq!(metrics.tick_time_max_us.load(Ordering::Relaxed), 1090);
    }

    #[test]
    fn test_ai_state_counts() {
        let metrics = EngineMetrics::new();
        metrics.record_ai_states([4, 1, 2, 0, 1]);

        assert_eq!(metrics.ai_tracked.load(Ordering::Relaxed), 8);
        assert_eq!(metrics.ai_state(AiBehavior::Chasing), 2);
        assert_eq!(metrics.ai_state(AiBehavior::Fleeing), 1);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = EngineMetrics::new();
        metrics.record_ai_states([3, 0, 1, 0, 0]);
        metrics.record_spawns(
            5,
            SpawnCounters {
                spawned: 9,
                respawned: 4,
                died: 4,
            },
        );

        let output = metrics.to_prometheus();
        assert!(output.contains("mob_director_ai_tracked 4"));
        assert!(output.contains("mob_director_ai_state{state=\"idle\"} 3"));
        assert!(output.contains("mob_director_monsters_live 5"));
        assert!(output.contains("mob_director_monsters_died_total 4"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_json_format() {
        let metrics = EngineMetrics::new();
        metrics.groups_live.store(2, Ordering::Relaxed);

        let parsed: serde_json::Value = serde_json::from_str(&metrics.to_json()).unwrap();
        assert_eq!(parsed["population"]["groups"], 2);
        assert_eq!(parsed["ai"]["states"]["patrolling"], 0);
    }

    #[test]
    fn test_routes() {
        let metrics = EngineMetrics::new();
        assert!(route("GET /metrics HTTP/1.1", &metrics).contains("mob_director_tick_count"));
        assert!(route("GET /metrics/json HTTP/1.1", &metrics).contains("application/json"));
        assert!(route("GET /health HTTP/1.1", &metrics).ends_with("OK"));
        assert!(route("GET /nope HTTP/1.1", &metrics).starts_with("HTTP/1.1 404"));
    }
}
