//! Process-wide codec and container registry.
//!
//! [`init`] builds the registry once; pipelines are handed an
//! `Arc<Registry>` and never consult the global themselves.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::codec::CodecRegistry;
use crate::container::ContainerRegistry;
use crate::error::{PipelineError, Result};

/// Codecs and containers available to pipelines.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    pub codecs: CodecRegistry,
    pub containers: ContainerRegistry,
}

impl Registry {
    /// Registry with the built-in codecs and containers.
    pub fn builtin() -> Self {
        Self {
            codecs: CodecRegistry::with_builtin(),
            containers: ContainerRegistry::with_builtin(),
        }
    }
}

static REGISTRY: RwLock<Option<Arc<Registry>>> = parking_lot::const_rwlock(None);

/// Initialize the runtime with the built-in registry.
pub fn init() -> Result<Arc<Registry>> {
    init_with(Registry::builtin())
}

/// Initialize the runtime with a custom registry.
///
/// Fails if the runtime is already initialized.
pub fn init_with(registry: Registry) -> Result<Arc<Registry>> {
    let mut slot = REGISTRY.write();
    if slot.is_some() {
        return Err(PipelineError::Configuration(
            "runtime already initialized".into(),
        ));
    }
    let registry = Arc::new(registry);
    info!(
        "Runtime initialized: encoders {:?}, outputs {:?}",
        registry.codecs.encoder_names(),
        registry.containers.output_names()
    );
    *slot = Some(registry.clone());
    Ok(registry)
}

/// The registry installed by [`init`].
pub fn registry() -> Result<Arc<Registry>> {
    REGISTRY
        .read()
        .clone()
        .ok_or_else(|| PipelineError::Configuration("runtime not initialized".into()))
}

pub fn is_initialized() -> bool {
    REGISTRY.read().is_some()
}

/// Release the global registry. Pipelines holding it keep their copy.
///
/// Returns whether the runtime was initialized.
pub fn shutdown() -> bool {
    let released = REGISTRY.write().take().is_some();
    if released {
        info!("Runtime shut down");
    }
    released
}
