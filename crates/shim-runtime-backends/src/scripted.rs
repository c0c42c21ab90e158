//! Config-driven backend.
//!
//! A [`ScriptedBackend`] answers initialization according to its
//! [`BackendEntry`] (ready, fail or hang, after a delay) and echoes every
//! exec call it declares. It stands in for real browser backends in the CLI
//! and in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use shim_runtime_common::{BackendEntry, BackendError, InitBehavior, RuntimeKind};
use shim_runtime_core::{
    Backend, BackendDescriptor, BackendFactory, CapabilityTest, ComponentSet, ExecContext,
    ExecTable, RuntimeId, RuntimeOptions, ShimContainer,
};
use tracing::debug;

use crate::image::{ImageComponent, ImageInfo, ScriptedImage, image_exec_table};

/// Lifecycle counters shared by a factory and the backends it creates.
#[derive(Debug, Default)]
pub struct ScriptedStats {
    created: AtomicUsize,
    initialized: AtomicUsize,
    destroyed: AtomicUsize,
}

impl ScriptedStats {
    /// Backends created.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Backends that reported readiness.
    pub fn initialized(&self) -> usize {
        self.initialized.load(Ordering::Relaxed)
    }

    /// Backends destroyed.
    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::Relaxed)
    }
}

/// Factory for [`ScriptedBackend`]s.
#[derive(Debug)]
pub struct ScriptedFactory {
    entry: BackendEntry,
    image: Option<ImageInfo>,
    stats: Arc<ScriptedStats>,
}

impl ScriptedFactory {
    /// Create a factory from a config entry.
    pub fn new(entry: BackendEntry) -> Self {
        Self {
            entry,
            image: None,
            stats: Arc::new(ScriptedStats::default()),
        }
    }

    /// Give every created backend its own typed `Image` component.
    #[must_use]
    pub fn with_image(mut self, info: ImageInfo) -> Self {
        self.image = Some(info);
        self
    }

    /// Shared lifecycle counters.
    pub fn stats(&self) -> Arc<ScriptedStats> {
        self.stats.clone()
    }

    /// The entry this factory was built from.
    pub fn entry(&self) -> &BackendEntry {
        &self.entry
    }
}

impl BackendFactory for ScriptedFactory {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor::new(self.entry.kind.clone(), self.entry.priority)
    }

    fn capabilities(&self) -> Vec<(String, CapabilityTest)> {
        self.entry
            .capabilities
            .iter()
            .map(|(name, value)| (name.clone(), CapabilityTest::Value(value.clone())))
            .collect()
    }

    fn create(&self, uid: &RuntimeId) -> Result<Arc<dyn Backend>, BackendError> {
        self.stats.created.fetch_add(1, Ordering::Relaxed);
        debug!(uid = %uid, kind = %self.entry.kind, "Creating scripted backend");

        let image = self
            .image
            .clone()
            .map(|info| Arc::new(ScriptedImage::new(info)) as Arc<dyn ImageComponent>);

        Ok(Arc::new(ScriptedBackend {
            entry: self.entry.clone(),
            image,
            stats: self.stats.clone(),
        }))
    }
}

/// Backend whose behavior is read from a [`BackendEntry`].
#[derive(Debug)]
pub struct ScriptedBackend {
    entry: BackendEntry,
    image: Option<Arc<dyn ImageComponent>>,
    stats: Arc<ScriptedStats>,
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn kind(&self) -> RuntimeKind {
        self.entry.kind.clone()
    }

    async fn initialize(
        &self,
        container: &ShimContainer,
        _options: &RuntimeOptions,
    ) -> Result<(), BackendError> {
        if self.entry.init_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.entry.init_delay_ms)).await;
        }

        match self.entry.init {
            InitBehavior::Ready => {
                container.resize(1, 1);
                self.stats.initialized.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            InitBehavior::Fail => Err(BackendError::setup_failed(format!(
                "{} refused to start in {}",
                self.entry.kind,
                container.id()
            ))),
            InitBehavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    fn exec_table(&self) -> ExecTable {
        let mut table = ExecTable::new();
        for (component, methods) in &self.entry.components {
            for method in methods {
                let (c, m) = (component.clone(), method.clone());
                table.insert(
                    component,
                    method,
                    Arc::new(move |ctx: &ExecContext, args: &[Value]| {
                        Ok::<_, BackendError>(echo(ctx, &c, &m, args))
                    }),
                );
            }
        }
        match &self.image {
            Some(image) => table.merge(image_exec_table(image.clone())),
            None => table,
        }
    }

    fn components(&self) -> ComponentSet {
        let mut set = ComponentSet::new();
        if let Some(image) = &self.image {
            set.insert::<dyn ImageComponent>(image.clone());
        }
        set
    }

    fn destroy(&self) {
        self.stats.destroyed.fetch_add(1, Ordering::Relaxed);
    }
}

fn echo(ctx: &ExecContext, component: &str, method: &str, args: &[Value]) -> Value {
    json!({
        "runtime": ctx.runtime_uid(),
        "component": component,
        "method": method,
        "args": args,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shim_runtime_common::CapabilityValue;
    use shim_runtime_core::EventTarget;
    use std::collections::BTreeMap;

    fn entry(init: InitBehavior) -> BackendEntry {
        BackendEntry {
            kind: RuntimeKind::Flash,
            priority: 50,
            capabilities: BTreeMap::from([(
                "display_media".to_string(),
                CapabilityValue::Bool(true),
            )]),
            init,
            init_delay_ms: 20,
            components: BTreeMap::from([(
                "FileReader".to_string(),
                vec!["readAsText".to_string()],
            )]),
        }
    }

    fn container() -> ShimContainer {
        ShimContainer::new("shim_test", None)
    }

    #[test]
    fn test_descriptor_and_capabilities() {
        let factory = ScriptedFactory::new(entry(InitBehavior::Ready));
        assert_eq!(
            factory.descriptor(),
            BackendDescriptor::new(RuntimeKind::Flash, 50)
        );
        let caps = factory.capabilities();
        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].0, "display_media");
        assert!(caps[0].1.evaluate(&CapabilityValue::Bool(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_ready_after_delay() {
        let factory = ScriptedFactory::new(entry(InitBehavior::Ready));
        let backend = factory.create(&RuntimeId::from("rt_1")).unwrap();
        let container = container();

        let start = tokio::time::Instant::now();
        backend
            .initialize(&container, &RuntimeOptions::default())
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(container.size(), Some((1, 1)));
        assert_eq!(factory.stats().created(), 1);
        assert_eq!(factory.stats().initialized(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_fail() {
        let factory = ScriptedFactory::new(entry(InitBehavior::Fail));
        let backend = factory.create(&RuntimeId::from("rt_1")).unwrap();

        let err = backend
            .initialize(&container(), &RuntimeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Setup failed: flash refused to start in shim_test"
        );
        assert_eq!(factory.stats().initialized(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_hang_never_completes() {
        let factory = ScriptedFactory::new(entry(InitBehavior::Hang));
        let backend = factory.create(&RuntimeId::from("rt_1")).unwrap();
        let container = container();

        let res = tokio::time::timeout(
            Duration::from_secs(60),
            backend.initialize(&container, &RuntimeOptions::default()),
        )
        .await;
        assert!(res.is_err());
    }

    #[test]
    fn test_exec_table_echoes() {
        let factory = ScriptedFactory::new(entry(InitBehavior::Ready));
        let backend = factory.create(&RuntimeId::from("rt_1")).unwrap();
        let table = backend.exec_table();
        let ctx = ExecContext::new(RuntimeId::from("rt_1"), EventTarget::new());

        let out = table.get("FileReader", "readAsText").unwrap()(&ctx, &[json!("a.txt")]).unwrap();
        assert_eq!(
            out,
            json!({
                "runtime": "rt_1",
                "component": "FileReader",
                "method": "readAsText",
                "args": ["a.txt"],
            })
        );
        assert!(backend.components().is_empty());
    }

    #[test]
    fn test_image_component_per_backend() {
        let factory = ScriptedFactory::new(entry(InitBehavior::Ready))
            .with_image(ImageInfo::new(100, 50, "image/png"));
        let a = factory.create(&RuntimeId::from("rt_a")).unwrap();
        let b = factory.create(&RuntimeId::from("rt_b")).unwrap();

        let ctx = ExecContext::new(RuntimeId::from("rt_a"), EventTarget::new());
        let image_a = a.components().get::<dyn ImageComponent>().unwrap();
        image_a.resize(&ctx, 10, 10, true).unwrap();

        let image_b = b.components().get::<dyn ImageComponent>().unwrap();
        assert_eq!(image_b.info().width, 100);
        assert!(a.exec_table().contains("Image", "resize"));
        assert!(a.exec_table().contains("FileReader", "readAsText"));
    }

    #[test]
    fn test_destroy_counts() {
        let factory = ScriptedFactory::new(entry(InitBehavior::Ready));
        let backend = factory.create(&RuntimeId::from("rt_1")).unwrap();
        backend.destroy();
        assert_eq!(factory.stats().destroyed(), 1);
    }
}
