use residency::base::TrackedMemoryBudget;
use residency::loader::{LoadContext, ResourceCache, ResourceKind, ResourceResult};
use std::sync::Arc;
use std::time::Duration;

const KB: u64 = 1024;

// Stands in for reading and decoding a file
fn simulate_io(name: &str) {
    let jitter = name.bytes().map(|b| b as u64).sum::<u64>() % 3;
    std::thread::sleep(Duration::from_millis(1 + jitter));
}

fn stem(name: &str) -> &str {
    let file_name = name.rsplit('/').next().unwrap_or(name);
    file_name.split('.').next().unwrap_or(file_name)
}

pub struct MeshKind {
    name: String,
    host: Arc<TrackedMemoryBudget>,
    vertex_bytes: u64,
}

impl ResourceKind for MeshKind {
    fn load_impl(
        &mut self,
        ctx: &mut LoadContext,
    ) -> ResourceResult<()> {
        simulate_io(&self.name);

        // Every mesh is drawn with a material texture of the same name
        ctx.add_dependency(&format!("textures/{}.tiff", stem(&self.name)))?;

        self.vertex_bytes = 96 * KB;
        self.host.allocate(self.vertex_bytes);
        Ok(())
    }

    fn unload_impl(&mut self) {
        self.host.free(self.vertex_bytes);
        self.vertex_bytes = 0;
    }
}

pub struct TextureKind {
    name: String,
    host: Arc<TrackedMemoryBudget>,
    gpu: Arc<TrackedMemoryBudget>,
    faces: u64,
    resident: bool,
}

impl TextureKind {
    fn face_bytes() -> u64 {
        64 * KB
    }
}

impl ResourceKind for TextureKind {
    fn load_impl(
        &mut self,
        _ctx: &mut LoadContext,
    ) -> ResourceResult<()> {
        simulate_io(&self.name);

        // Staging copy in host memory plus the uploaded copy on the GPU
        self.host.allocate(self.faces * Self::face_bytes());
        self.gpu.allocate(self.faces * Self::face_bytes());
        self.resident = true;
        Ok(())
    }

    fn unload_impl(&mut self) {
        if self.resident {
            self.host.free(self.faces * Self::face_bytes());
            self.gpu.free(self.faces * Self::face_bytes());
            self.resident = false;
        }
    }

    fn is_gpu_backed(&self) -> bool {
        true
    }
}

pub struct AudioKind {
    name: String,
    host: Arc<TrackedMemoryBudget>,
    sample_bytes: u64,
}

impl ResourceKind for AudioKind {
    fn load_impl(
        &mut self,
        _ctx: &mut LoadContext,
    ) -> ResourceResult<()> {
        simulate_io(&self.name);
        self.sample_bytes = 256 * KB;
        self.host.allocate(self.sample_bytes);
        Ok(())
    }

    fn unload_impl(&mut self) {
        self.host.free(self.sample_bytes);
        self.sample_bytes = 0;
    }
}

pub fn register_demo_kinds(
    cache: &ResourceCache,
    host: &Arc<TrackedMemoryBudget>,
    gpu: &Arc<TrackedMemoryBudget>,
) {
    let mesh_host = host.clone();
    cache.register_kind(".mesh", move |name, _| {
        Box::new(MeshKind {
            name: name.to_string(),
            host: mesh_host.clone(),
            vertex_bytes: 0,
        })
    });

    for (suffix, faces) in [(".tiff", 1), (".envcube.tiff", 6)] {
        let texture_host = host.clone();
        let texture_gpu = gpu.clone();
        cache.register_kind(suffix, move |name, _| {
            Box::new(TextureKind {
                name: name.to_string(),
                host: texture_host.clone(),
                gpu: texture_gpu.clone(),
                faces,
                resident: false,
            })
        });
    }

    let audio_host = host.clone();
    cache.register_kind(".ogg", move |name, _| {
        Box::new(AudioKind {
            name: name.to_string(),
            host: audio_host.clone(),
            sample_bytes: 0,
        })
    });
}
