//! Task index: the seam between the CLI and user-defined task classes.
//!
//! Task discovery (projects, extensions) is the embedding application's
//! business; it registers each task class here as a name, a declared
//! parameter list and a build function. The registry performs argument
//! defaulting: parameters the caller did not supply are looked up by name
//! in the task's configuration section before the factory ever sees them,
//! exactly once per construction.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::config::Config;
use crate::context;
use crate::error::AqueductError;
use crate::task::bind::{bind_args, Param};
use crate::task::ArcTask;

/// Builds a task instance from fully-bound arguments.
pub type BuildFn =
    dyn Fn(&Map<String, Value>) -> Result<ArcTask, AqueductError> + Send + Sync;

/// One registered task class.
#[derive(Clone)]
pub struct TaskFactory {
    pub name: String,
    /// Declared constructor parameters, with defaults where they exist.
    pub params: Vec<Param>,
    /// Configuration section consulted for absent parameters; the class
    /// name when `None`.
    pub config_section: Option<String>,
    pub build: Arc<BuildFn>,
}

impl TaskFactory {
    pub fn new(
        name: impl Into<String>,
        params: Vec<Param>,
        build: impl Fn(&Map<String, Value>) -> Result<ArcTask, AqueductError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            params,
            config_section: None,
            build: Arc::new(build),
        }
    }

    pub fn with_config_section(mut self, section: impl Into<String>) -> Self {
        self.config_section = Some(section.into());
        self
    }

    /// Render `Name(param, param=default, …)` for `ls --signature`.
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| match &p.default {
                Some(default) => format!("{}={}", p.name, default),
                None => p.name.to_string(),
            })
            .collect();
        format!("{}({})", self.name, params.join(", "))
    }
}

/// Name-keyed collection of task factories.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    factories: IndexMap<String, TaskFactory>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: TaskFactory) {
        self.factories.insert(factory.name.clone(), factory);
    }

    pub fn get(&self, name: &str) -> Option<&TaskFactory> {
        self.factories.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn factories(&self) -> impl Iterator<Item = &TaskFactory> {
        self.factories.values()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// The config section a task class reads its defaults from.
    pub fn config_section_of(&self, factory: &TaskFactory) -> Config {
        let section = factory
            .config_section
            .clone()
            .unwrap_or_else(|| factory.name.clone());
        context::current_config().section(&section)
    }

    /// Construct a task: bind supplied arguments against the declared
    /// parameters, default the rest from config, then build.
    pub fn build(
        &self,
        name: &str,
        supplied: Map<String, Value>,
    ) -> Result<ArcTask, AqueductError> {
        let factory = self
            .get(name)
            .ok_or_else(|| AqueductError::UnknownTask(name.to_string()))?;
        let section = self.config_section_of(factory);
        let bound = bind_args(&factory.name, &factory.params, supplied, &section)?;
        (factory.build)(&bound)
    }
}
