// src/actions/registry.rs

//! Registry of installation actions
//!
//! The registry maps action names to implementations. It is written once
//! at startup and read concurrently afterwards, so lookups take a shared
//! read lock and registration takes the write lock. Registering a name that
//! already exists replaces the previous action; tests rely on this to
//! inject fakes. Actions are never removed.

use super::{Action, archive, download, ecosystem, fs_actions, patch, system};
use crate::error::Error;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use tracing::debug;

/// Maximum number of "did you mean" suggestions for an unknown action
const MAX_SUGGESTIONS: usize = 3;

pub struct Registry {
    actions: RwLock<HashMap<String, Arc<dyn Action>>>,
}

impl Registry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            actions: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry with every built-in action
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_builtins();
        registry
    }

    fn register_builtins(&self) {
        // Composites
        self.register(Arc::new(download::DownloadAction));
        self.register(Arc::new(archive::DownloadArchiveAction));
        self.register(Arc::new(archive::GitHubArchiveAction));
        self.register(Arc::new(archive::FossilArchiveAction));
        self.register(Arc::new(patch::ApplyPatchAction));

        // Core primitives
        self.register(Arc::new(download::DownloadFileAction));
        self.register(Arc::new(archive::ExtractAction));
        self.register(Arc::new(fs_actions::ChmodAction));
        self.register(Arc::new(fs_actions::InstallBinariesAction));
        self.register(Arc::new(fs_actions::InstallLibrariesAction));
        self.register(Arc::new(fs_actions::LinkDependenciesAction));
        self.register(Arc::new(fs_actions::TextReplaceAction));
        self.register(Arc::new(fs_actions::SetEnvAction));
        self.register(Arc::new(patch::ApplyPatchFileAction));

        // Ecosystem installers
        for action in ecosystem::builtins() {
            self.register(action);
        }

        // System checks and package managers
        self.register(Arc::new(system::RequireCommandAction));
        self.register(Arc::new(system::SystemDependencyAction));
        for action in system::package_manager_actions() {
            self.register(action);
        }
    }

    /// Insert or replace an action under its declared name
    pub fn register(&self, action: Arc<dyn Action>) {
        let name = action.name().to_string();
        let mut actions = match self.actions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if actions.insert(name.clone(), action).is_some() {
            debug!("Replaced registered action '{}'", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        let actions = match self.actions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        actions.get(name).cloned()
    }

    /// Look up an action, producing an error with suggestions when unknown
    pub fn require(&self, name: &str) -> Result<Arc<dyn Action>, Error> {
        self.get(name).ok_or_else(|| Error::UnknownAction {
            name: name.to_string(),
            suggestions: self.suggest(name),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// All registered names, sorted
    pub fn registered_names(&self) -> Vec<String> {
        let actions = match self.actions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut names: Vec<String> = actions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_decomposable(&self, name: &str) -> bool {
        self.get(name)
            .is_some_and(|action| action.as_decomposable().is_some())
    }

    /// Registered and not decomposable
    pub fn is_primitive(&self, name: &str) -> bool {
        self.get(name)
            .is_some_and(|action| action.as_decomposable().is_none())
    }

    /// Names of all registered primitives, sorted
    pub fn primitives(&self) -> Vec<String> {
        self.registered_names()
            .into_iter()
            .filter(|name| self.is_primitive(name))
            .collect()
    }

    /// Unknown actions are treated as non-deterministic
    pub fn is_deterministic(&self, name: &str) -> bool {
        self.get(name).is_some_and(|action| action.is_deterministic())
    }

    /// Registered names sharing the longest prefix with `name`
    fn suggest(&self, name: &str) -> Vec<String> {
        let shared = |candidate: &str| {
            candidate
                .chars()
                .zip(name.chars())
                .take_while(|(a, b)| a == b)
                .count()
        };

        let mut scored: Vec<(usize, String)> = self
            .registered_names()
            .into_iter()
            .map(|candidate| (shared(&candidate), candidate))
            .filter(|(score, _)| *score >= 3)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        scored
            .into_iter()
            .take(MAX_SUGGESTIONS)
            .map(|(_, candidate)| candidate)
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Process-wide registry with all built-ins, created on first use
///
/// Production wiring uses this; tests construct their own [`Registry`].
pub fn default_registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::with_builtins)
}
