use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::EnvError;
use crate::error_page::ErrorRenderer;
use crate::module::ModuleLoader;
use crate::runner::{EnvironmentRunner, RunnerOptions, RunnerSnapshot};

/// Environments owned by this process, by name. Entries are never removed.
pub struct EnvironmentRegistry {
    loader: Arc<dyn ModuleLoader>,
    options: RunnerOptions,
    renderer: ErrorRenderer,
    runners: RwLock<HashMap<String, Arc<EnvironmentRunner>>>,
}

/// Result of a registration request.
pub enum Registration {
    Created(Arc<EnvironmentRunner>),
    Existing(Arc<EnvironmentRunner>),
}

impl Registration {
    pub fn runner(&self) -> &Arc<EnvironmentRunner> {
        match self {
            Registration::Created(runner) | Registration::Existing(runner) => runner,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Registration::Created(_))
    }
}

impl EnvironmentRegistry {
    pub fn new(
        loader: Arc<dyn ModuleLoader>,
        options: RunnerOptions,
        renderer: ErrorRenderer,
    ) -> Self {
        Self {
            loader,
            options,
            renderer,
            runners: RwLock::new(HashMap::new()),
        }
    }

    pub fn renderer(&self) -> &ErrorRenderer {
        &self.renderer
    }

    /// Create the environment if the name is new. The first load is
    /// started in the background; requests arriving before it settles
    /// wait on the runner's readiness backoff.
    ///
    /// A second registration under the same name keeps the existing runner.
    pub fn register(&self, name: &str, entry: &str) -> Registration {
        let runner = {
            let mut runners = self.runners.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = runners.get(name) {
                if existing.entry() != entry {
                    tracing::warn!(
                        "environment {} already registered with entry {} (ignoring {})",
                        name,
                        existing.entry(),
                        entry
                    );
                }
                return Registration::Existing(Arc::clone(existing));
            }
            let runner = Arc::new(
                EnvironmentRunner::new(name, entry, Arc::clone(&self.loader), self.options)
                    .with_renderer(self.renderer.clone()),
            );
            runners.insert(name.to_string(), Arc::clone(&runner));
            runner
        };

        tracing::debug!("registered environment {} ({})", name, entry);
        let loading = Arc::clone(&runner);
        tokio::spawn(async move {
            loading.reload().await;
        });
        Registration::Created(runner)
    }

    pub fn get(&self, name: &str) -> Option<Arc<EnvironmentRunner>> {
        self.runners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<EnvironmentRunner>, EnvError> {
        self.get(name)
            .ok_or_else(|| EnvError::UnknownEnvironment(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.runners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .runners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn runners(&self) -> Vec<Arc<EnvironmentRunner>> {
        let mut runners: Vec<Arc<EnvironmentRunner>> = self
            .runners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        runners.sort_by(|a, b| a.name().cmp(b.name()));
        runners
    }

    pub fn snapshots(&self) -> Vec<RunnerSnapshot> {
        self.runners().iter().map(|runner| runner.snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.runners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{MapLoader, Module};
    use crate::runner::RunnerState;

    fn registry() -> EnvironmentRegistry {
        let loader = MapLoader::new()
            .entry("./api.js", || async { Ok(Module::new()) })
            .entry("./other.js", || async { Ok(Module::new()) });
        EnvironmentRegistry::new(
            Arc::new(loader),
            RunnerOptions::default(),
            ErrorRenderer::production(),
        )
    }

    #[tokio::test]
    async fn register_starts_first_load() {
        let registry = registry();
        let registration = registry.register("api", "./api.js");
        assert!(registration.is_created());
        let runner = Arc::clone(registration.runner());
        for _ in 0..10 {
            if runner.state() == RunnerState::Ready {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(runner.state(), RunnerState::Ready);
        assert_eq!(registry.names(), vec!["api".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_registration_keeps_existing_runner() {
        let registry = registry();
        let first = registry.register("api", "./api.js");
        let second = registry.register("api", "./other.js");
        assert!(!second.is_created());
        assert!(Arc::ptr_eq(first.runner(), second.runner()));
        assert_eq!(second.runner().entry(), "./api.js");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn unknown_names_are_configuration_errors() {
        let registry = registry();
        let err = registry.require("nope").err().expect("error");
        assert!(err.is_configuration());
        assert!(!registry.contains("nope"));
    }
}
