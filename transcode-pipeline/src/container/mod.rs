//! Container format registry and the built-in packet stream container.

pub mod tps;

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::demux::Demuxer;
use crate::error::{PipelineError, Result};
use crate::mux::Muxer;

pub use tps::{TpsDemuxer, TpsFormat, TpsMuxer};

/// Bytes read from the start of an input for content detection.
const PROBE_SIZE: usize = 64;

/// A readable container format.
pub trait InputFormat: Send + Sync {
    fn name(&self) -> &str;

    /// File extensions, lower case, without the dot.
    fn extensions(&self) -> &[&str];

    /// Whether `header` looks like this format.
    fn probe(&self, header: &[u8]) -> bool;

    fn open(&self, path: &Path) -> transcode_core::Result<Box<dyn Demuxer>>;
}

/// A writable container format.
pub trait OutputFormat: Send + Sync {
    fn name(&self) -> &str;

    /// File extensions, lower case, without the dot.
    fn extensions(&self) -> &[&str];

    fn create(&self, path: &Path) -> transcode_core::Result<Box<dyn Muxer>>;
}

/// Registry of container formats.
#[derive(Default, Clone)]
pub struct ContainerRegistry {
    inputs: Vec<Arc<dyn InputFormat>>,
    outputs: Vec<Arc<dyn OutputFormat>>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in `tps` container.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register_input(Arc::new(TpsFormat));
        registry.register_output(Arc::new(TpsFormat));
        registry
    }

    /// Register a readable format. Later registrations take precedence.
    pub fn register_input(&mut self, format: Arc<dyn InputFormat>) {
        self.inputs.insert(0, format);
    }

    /// Register a writable format. Later registrations take precedence.
    pub fn register_output(&mut self, format: Arc<dyn OutputFormat>) {
        self.outputs.insert(0, format);
    }

    /// Open `path`, probing content first and falling back to the extension.
    pub fn open_input(&self, path: &Path) -> Result<Box<dyn Demuxer>> {
        let locator = path.display();
        let mut header = Vec::with_capacity(PROBE_SIZE);
        File::open(path)
            .and_then(|f| f.take(PROBE_SIZE as u64).read_to_end(&mut header))
            .map_err(|e| PipelineError::open(&locator, e))?;

        let extension = extension_of(path);
        let format = self
            .inputs
            .iter()
            .find(|f| f.probe(&header))
            .or_else(|| {
                let ext = extension.as_deref()?;
                self.inputs.iter().find(|f| f.extensions().contains(&ext))
            })
            .ok_or_else(|| PipelineError::open(&locator, "no container format recognized"))?;

        debug!("Detected {} for {}", format.name(), locator);
        format
            .open(path)
            .map_err(|e| PipelineError::probe(&locator, e))
    }

    /// Create `path` as the container named by `hint`, or by its extension.
    pub fn create_output(&self, path: &Path, hint: Option<&str>) -> Result<Box<dyn Muxer>> {
        let format = match hint {
            Some(hint) => self.find_output(hint).ok_or_else(|| {
                PipelineError::UnsupportedContainer(format!("no muxer for '{}'", hint))
            })?,
            None => {
                let ext = extension_of(path).ok_or_else(|| {
                    PipelineError::UnsupportedContainer(format!(
                        "cannot derive a container from '{}'",
                        path.display()
                    ))
                })?;
                self.find_output(&ext).ok_or_else(|| {
                    PipelineError::UnsupportedContainer(format!("no muxer for '.{}'", ext))
                })?
            }
        };
        debug!("Creating {} as {}", path.display(), format.name());
        format.create(path).map_err(|e| {
            PipelineError::Mux(format!("cannot create '{}': {}", path.display(), e))
        })
    }

    /// Names of the readable formats.
    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.iter().map(|f| f.name()).collect()
    }

    /// Names of the writable formats.
    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|f| f.name()).collect()
    }

    fn find_output(&self, name: &str) -> Option<&Arc<dyn OutputFormat>> {
        let name = name.trim_start_matches('.').to_ascii_lowercase();
        self.outputs
            .iter()
            .find(|f| f.name() == name || f.extensions().contains(&name.as_str()))
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

impl fmt::Debug for ContainerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerRegistry")
            .field("inputs", &self.input_names())
            .field("outputs", &self.output_names())
            .finish()
    }
}
