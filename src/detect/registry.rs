use std::collections::HashMap;

use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::backends::{ReplayBackend, StubBackend};
use crate::detect::result::ClassMap;
use crate::error::PipelineError;
use crate::CameraId;

/// Arguments handed to a backend factory for one camera.
#[derive(Clone, Debug)]
pub struct BackendRequest<'a> {
    pub camera_id: CameraId,
    /// Text after the `scheme:` prefix of the model reference, if any.
    pub argument: Option<&'a str>,
}

pub type BackendFactory =
    Box<dyn Fn(&BackendRequest<'_>) -> Result<Box<dyn DetectorBackend>> + Send + Sync>;

/// Registry of detector factories keyed by model-reference scheme.
///
/// Every camera worker owns its own backend instance, so the registry hands
/// out fresh backends rather than sharing one behind a lock.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            default_name: None,
        }
    }

    /// Registry with the built-in `stub` and `replay` backends.
    pub fn with_builtin(classes: ClassMap) -> Self {
        let mut registry = Self::new();
        registry.register("stub", |_req| Ok(Box::new(StubBackend::new())));
        registry.register("replay", move |req| {
            let path = req.argument.ok_or_else(|| {
                PipelineError::config("replay detector needs a path: replay:<file.jsonl>")
            })?;
            Ok(Box::new(ReplayBackend::open(path, req.camera_id, &classes)?))
        });
        registry
    }

    /// Register a factory. The first registered factory becomes the default.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&BackendRequest<'_>) -> Result<Box<dyn DetectorBackend>> + Send + Sync + 'static,
    {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Set default factory by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.factories.contains_key(name) {
            return Err(PipelineError::config(format!(
                "detector backend '{}' not registered",
                name
            )));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// List registered factories.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, model_ref: &str) -> bool {
        let (scheme, _) = split_model_ref(model_ref);
        self.factories.contains_key(scheme)
    }

    /// Build a backend for `camera_id` from a model reference such as
    /// `stub` or `replay:/var/lib/sentinel/cam0.jsonl`. An empty reference
    /// selects the default backend.
    pub fn create(&self, model_ref: &str, camera_id: CameraId) -> Result<Box<dyn DetectorBackend>> {
        let (scheme, argument) = if model_ref.trim().is_empty() {
            let name = self
                .default_name
                .as_deref()
                .ok_or_else(|| PipelineError::config("no detector backends registered"))?;
            (name, None)
        } else {
            split_model_ref(model_ref)
        };
        let factory = self.factories.get(scheme).ok_or_else(|| {
            PipelineError::config(format!(
                "unknown detector backend '{}' (registered: {})",
                scheme,
                self.list().join(", ")
            ))
        })?;
        let mut backend = factory(&BackendRequest {
            camera_id,
            argument,
        })?;
        backend.warm_up()?;
        log::info!(
            "camera {}: detector backend '{}' ready",
            camera_id,
            backend.name()
        );
        Ok(backend)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtin(ClassMap::default())
    }
}

fn split_model_ref(model_ref: &str) -> (&str, Option<&str>) {
    let model_ref = model_ref.trim();
    match model_ref.split_once(':') {
        Some((scheme, arg)) if !arg.is_empty() => (scheme, Some(arg)),
        Some((scheme, _)) => (scheme, None),
        None => (model_ref, None),
    }
}
