//! External collaborator interfaces.
//!
//! The image/template catalogs and the private-disk service live outside
//! this engine; they are consulted through these traits so the daemon can
//! wire real clients and tests can wire in-memory fakes.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use deskplane_state::ResourceSpec;

/// Minimum resources an image requires to boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMinimums {
    pub min_cpu_cores: u32,
    pub min_memory_gb: u32,
    pub min_storage_gb: u64,
}

/// Read-only image catalog.
pub trait ImageCatalog: Send + Sync {
    fn image_minimums(&self, image_id: &str) -> Option<ImageMinimums>;
}

/// Read-only template catalog; defaults fill unspecified spec fields at
/// instance creation.
pub trait TemplateCatalog: Send + Sync {
    fn template_defaults(&self, template_id: &str) -> Option<ResourceSpec>;
}

/// Private-disk storage collaborator. Invoked best-effort after a
/// successful start; a failure must never unwind the start.
#[async_trait]
pub trait DiskAttacher: Send + Sync {
    async fn auto_attach(&self, instance_id: &str, user_id: &str) -> anyhow::Result<()>;
}

/// In-memory catalog, used by the daemon for statically-configured images
/// and templates and by tests as a fake.
#[derive(Default)]
pub struct StaticCatalog {
    images: HashMap<String, ImageMinimums>,
    templates: HashMap<String, ResourceSpec>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, image_id: &str, minimums: ImageMinimums) -> Self {
        self.images.insert(image_id.to_string(), minimums);
        self
    }

    pub fn with_template(mut self, template_id: &str, defaults: ResourceSpec) -> Self {
        self.templates.insert(template_id.to_string(), defaults);
        self
    }
}

impl ImageCatalog for StaticCatalog {
    fn image_minimums(&self, image_id: &str) -> Option<ImageMinimums> {
        self.images.get(image_id).copied()
    }
}

impl TemplateCatalog for StaticCatalog {
    fn template_defaults(&self, template_id: &str) -> Option<ResourceSpec> {
        self.templates.get(template_id).cloned()
    }
}

/// Disk attacher that does nothing. Stands in until a real storage
/// adapter is wired up.
pub struct NoopDiskAttacher;

#[async_trait]
impl DiskAttacher for NoopDiskAttacher {
    async fn auto_attach(&self, instance_id: &str, user_id: &str) -> anyhow::Result<()> {
        debug!(instance = instance_id, user = user_id, "no disk attacher configured");
        Ok(())
    }
}
