use residency::base::{MemoryBudget, TrackedMemoryBudget};
use residency::loader::{CacheConfiguration, Demand, ResourceCache, ResourceResult};
use std::path::PathBuf;
use std::sync::Arc;

mod demo_kinds;

const OBJECT_COUNT: usize = 64;
const RING_RADIUS: f32 = 100.0;
// Objects are requested inside this distance and released outside the larger one
const STREAM_IN_DISTANCE: f32 = 40.0;
const STREAM_OUT_DISTANCE: f32 = 60.0;
const FRAME_COUNT: u32 = 600;
const LOADS_PER_FRAME: f32 = 4.0;

pub fn config_search_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

struct StreamedObject {
    position: (f32, f32),
    demand: Demand,
    wanted: bool,
}

fn distance(
    a: (f32, f32),
    b: (f32, f32),
) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

fn create_objects(cache: &ResourceCache) -> ResourceResult<Vec<StreamedObject>> {
    let mut objects = Vec::with_capacity(OBJECT_COUNT);
    for i in 0..OBJECT_COUNT {
        let angle = (i as f32 / OBJECT_COUNT as f32) * std::f32::consts::TAU;
        let mut demand = cache.new_demand();
        demand.add_resource(&format!("props/prop_{}.mesh", i % 24))?;
        demand.add_resource(&format!("audio/ambient_{}.ogg", i % 4))?;
        if i % 16 == 0 {
            demand.add_resource("sky/day.envcube.tiff")?;
        }

        objects.push(StreamedObject {
            position: (angle.cos() * RING_RADIUS, angle.sin() * RING_RADIUS),
            demand,
            wanted: false,
        });
    }

    Ok(objects)
}

#[profiling::function]
fn update_objects(
    objects: &mut [StreamedObject],
    viewer: (f32, f32),
) {
    for object in objects {
        let distance = distance(object.position, viewer);
        if distance < STREAM_IN_DISTANCE || (object.wanted && distance < STREAM_OUT_DISTANCE) {
            // Also refreshes the priority of a demand that is still queued
            object.demand.request_load(distance);
            object.wanted = true;
        } else if object.wanted {
            object.demand.finished_with();
            object.wanted = false;
        }

        if object.wanted && object.demand.caused_error() {
            log::warn!("{:?} failed to load", object.demand);
        }
    }
}

fn main() {
    // Setup logging
    env_logger::Builder::default()
        .write_style(env_logger::WriteStyle::Always)
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = match CacheConfiguration::locate_config_file(&config_search_path()) {
        Ok(config) => config,
        Err(e) => {
            log::warn!("{}, using default cache configuration", e);
            CacheConfiguration::default()
        }
    };

    let host = Arc::new(TrackedMemoryBudget::new(config.host_ram_budget_bytes));
    let gpu = Arc::new(TrackedMemoryBudget::new(config.gpu_ram_budget_bytes));
    let cache = ResourceCache::with_budgets(config, host.clone(), gpu.clone()).unwrap();
    demo_kinds::register_demo_kinds(&cache, &host, &gpu);
    log::info!(
        "Streaming {:?} with resource kinds {:?}",
        cache.config(),
        cache.registry().registered_suffixes()
    );

    let mut objects = create_objects(&cache).unwrap();

    for frame in 0..FRAME_COUNT {
        profiling::scope!("frame");
        let angle = frame as f32 * 0.01;
        let viewer = (angle.cos() * RING_RADIUS, angle.sin() * RING_RADIUS);

        cache.loader().set_allowance(LOADS_PER_FRAME);
        update_objects(&mut objects, viewer);

        if frame % 30 == 0 {
            cache.loader().reconcile_orphans();

            let status = cache.loader().status();
            let resident = objects
                .iter()
                .filter(|x| x.wanted && x.demand.all_loaded())
                .count();
            log::info!(
                "frame {}: {} objects resident, {} resources loaded, host {} KB / {} KB, gpu {} KB / {} KB, {:?}",
                frame,
                resident,
                cache.registry().loaded_count(),
                host.used_bytes() / 1024,
                host.budget_bytes() / 1024,
                gpu.used_bytes() / 1024,
                gpu.budget_bytes() / 1024,
                status
            );
        }

        profiling::finish_frame!();
        std::thread::sleep(std::time::Duration::from_millis(15));
    }

    for info in cache.registry().resource_infos() {
        log::debug!("{:?}", info);
    }

    // Demands release their resources as they drop, then the cache shuts down the worker
    drop(objects);
    cache.loader().sync();
    log::info!("final status {:?}", cache.loader().status());
}
