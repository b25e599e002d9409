//! Spatial service and AI tick benchmarks
//!
//! Run with: cargo bench --bench spatial

use std::sync::Arc;
use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mob_director::config::AiTuning;
use mob_director::game::entity::EntityKind;
use mob_director::game::sim::{SimEntity, SimWorld};
use mob_director::game::spatial::{Pathfinder, VisionService};
use mob_director::game::systems::ai::{AiDriver, AiParams};
use mob_director::game::tables::ConfigTables;
use mob_director::util::vec3::Vec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const MAP: u32 = 1;

fn bench_find_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_path");
    let pathfinder = Pathfinder::default();

    for distance in [4.0f32, 8.0, 16.0] {
        group.bench_with_input(BenchmarkId::new("open_field", distance), &distance, |b, &d| {
            b.iter(|| pathfinder.find_path(black_box(Vec3::ZERO), black_box(Vec3::new(d, 0.0, d)), 32.0))
        });
    }

    // Wall with a gap at one end
    let vision = VisionService::default();
    for z in -8..8 {
        vision.set_blocked(MAP, Vec3::new(4.0, 0.0, z as f32), true);
    }
    group.bench_function("around_wall", |b| {
        b.iter(|| {
            pathfinder.find_path_with(
                black_box(Vec3::ZERO),
                black_box(Vec3::new(8.0, 0.0, 0.0)),
                16.0,
                |p| vision.is_walkable(MAP, p),
            )
        })
    });

    group.finish();
}

fn bench_is_visible(c: &mut Criterion) {
    let mut group = c.benchmark_group("is_visible");
    let vision = VisionService::default();
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..400 {
        let cell = Vec3::new(rng.gen_range(-64.0..64.0), 0.0, rng.gen_range(-64.0..64.0));
        vision.set_blocked(MAP, cell, true);
    }

    for length in [8.0f32, 32.0, 96.0] {
        group.bench_with_input(BenchmarkId::new("line", length), &length, |b, &len| {
            b.iter(|| vision.is_visible(MAP, black_box(Vec3::new(-len / 2.0, 0.0, 1.5)), black_box(Vec3::new(len / 2.0, 0.0, -3.5))))
        });
    }

    group.finish();
}

fn build_population(count: usize) -> (Arc<SimWorld>, AiDriver) {
    let world = Arc::new(SimWorld::new());
    world.add_map(MAP);
    let driver = AiDriver::new(world.clone(), Arc::new(ConfigTables::new()), AiTuning::default());
    let mut rng = StdRng::seed_from_u64(42);

    for id in 1..=count as u64 {
        let position = Vec3::new(rng.gen_range(-100.0..100.0), 0.0, rng.gen_range(-100.0..100.0));
        world.spawn(SimEntity::new(id, EntityKind::Monster, MAP, position));
        driver.init_ai(
            id,
            AiParams {
                patrol_points: vec![position, position + Vec3::new(6.0, 0.0, 0.0)],
                ..Default::default()
            },
        );
    }
    for id in 0..(count / 20).max(1) as u64 {
        let position = Vec3::new(rng.gen_range(-100.0..100.0), 0.0, rng.gen_range(-100.0..100.0));
        world.spawn(SimEntity::new(1_000_000 + id, EntityKind::Player, MAP, position));
    }
    (world, driver)
}

fn bench_ai_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("ai_tick");

    for count in [100usize, 500, 1000] {
        let (world, driver) = build_population(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("entities", count), &count, |b, _| {
            b.iter(|| {
                let report = driver.update(Instant::now());
                world.advance(0.1);
                black_box(report)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_find_path, bench_is_visible, bench_ai_tick);
criterion_main!(benches);
