//! Tracing wrapper for backends.
//!
//! [`LoggingFactory`] wraps any [`BackendFactory`]. Each backend it creates
//! is a [`LoggingBackend`] that emits structured `tracing` events for
//! setup, every exec call and teardown, with timings.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use shim_runtime_common::{BackendError, RuntimeKind};
use shim_runtime_core::{
    Backend, BackendDescriptor, BackendFactory, CapabilityTest, ComponentSet, ExecContext, ExecFn,
    ExecTable, RuntimeId, RuntimeOptions, ShimContainer,
};
use tracing::{debug, info, warn};

/// Factory adapter that wraps every created backend in a [`LoggingBackend`].
#[derive(Debug)]
pub struct LoggingFactory {
    inner: Arc<dyn BackendFactory>,
}

impl LoggingFactory {
    /// Wrap a factory.
    pub fn new(inner: impl BackendFactory) -> Self {
        Self::shared(Arc::new(inner))
    }

    /// Wrap an already shared factory.
    pub fn shared(inner: Arc<dyn BackendFactory>) -> Self {
        Self { inner }
    }
}

impl BackendFactory for LoggingFactory {
    fn descriptor(&self) -> BackendDescriptor {
        self.inner.descriptor()
    }

    fn capabilities(&self) -> Vec<(String, CapabilityTest)> {
        self.inner.capabilities()
    }

    fn create(&self, uid: &RuntimeId) -> Result<Arc<dyn Backend>, BackendError> {
        let kind = self.inner.descriptor().kind;
        match self.inner.create(uid) {
            Ok(inner) => {
                debug!(uid = %uid, kind = %kind, "Backend created");
                Ok(Arc::new(LoggingBackend {
                    inner,
                    uid: uid.clone(),
                }))
            }
            Err(err) => {
                warn!(uid = %uid, kind = %kind, error = %err, "Backend creation failed");
                Err(err)
            }
        }
    }
}

/// Backend wrapper that logs every interaction with the inner backend.
#[derive(Debug)]
pub struct LoggingBackend {
    inner: Arc<dyn Backend>,
    uid: RuntimeId,
}

#[async_trait]
impl Backend for LoggingBackend {
    fn kind(&self) -> RuntimeKind {
        self.inner.kind()
    }

    async fn initialize(
        &self,
        container: &ShimContainer,
        options: &RuntimeOptions,
    ) -> Result<(), BackendError> {
        debug!(
            uid = %self.uid,
            kind = %self.inner.kind(),
            container = container.id(),
            parent = ?container.parent(),
            "Backend setup started"
        );

        let start = Instant::now();
        let result = self.inner.initialize(container, options).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(()) => info!(
                uid = %self.uid,
                kind = %self.inner.kind(),
                duration_ms = elapsed.as_millis(),
                "Backend setup completed"
            ),
            Err(err) => warn!(
                uid = %self.uid,
                kind = %self.inner.kind(),
                duration_ms = elapsed.as_millis(),
                error = %err,
                "Backend setup failed"
            ),
        }
        result
    }

    fn exec_table(&self) -> ExecTable {
        let uid = self.uid.clone();
        self.inner
            .exec_table()
            .map(|component, method, f| traced(&uid, component, method, f))
    }

    fn components(&self) -> ComponentSet {
        self.inner.components()
    }

    fn destroy(&self) {
        debug!(uid = %self.uid, kind = %self.inner.kind(), "Backend destroyed");
        self.inner.destroy();
    }
}

fn traced(uid: &RuntimeId, component: &str, method: &str, f: ExecFn) -> ExecFn {
    let uid = uid.clone();
    let (component, method) = (component.to_string(), method.to_string());
    Arc::new(move |ctx: &ExecContext, args: &[Value]| {
        let start = Instant::now();
        let result = f(ctx, args);
        let elapsed = start.elapsed();

        match &result {
            Ok(_) => debug!(
                uid = %uid,
                caller = ctx.caller().uid(),
                component = %component,
                method = %method,
                args = args.len(),
                duration_us = elapsed.as_micros(),
                "Exec completed"
            ),
            Err(err) => warn!(
                uid = %uid,
                caller = ctx.caller().uid(),
                component = %component,
                method = %method,
                error = %err,
                "Exec failed"
            ),
        }
        result
    })
}
