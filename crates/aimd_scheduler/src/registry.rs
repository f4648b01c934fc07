//! One live [`Scheduler`] per credential.
//!
//! A credential identifies one rate-limited quota on the backend, so every caller using it must
//! share one scheduler. Switching credentials starts from fresh adaptive state: limits learned
//! for one quota say nothing about another.

use std::sync::{LazyLock, Mutex, MutexGuard};

use crate::scheduler::{Scheduler, SchedulerSettings, SettingsError};

static GLOBAL: LazyLock<Registry> = LazyLock::new(Registry::new);

/// The process-wide registry.
pub fn global() -> &'static Registry {
    &GLOBAL
}

struct Entry {
    credential: String,
    scheduler: Scheduler,
}

/// Caches the scheduler for the most recently used credential.
pub struct Registry {
    settings: SchedulerSettings,
    slot: Mutex<Option<Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            settings: SchedulerSettings::default(),
            slot: Mutex::new(None),
        }
    }

    /// A registry that builds its schedulers with `settings` instead of the defaults.
    pub fn with_settings(settings: SchedulerSettings) -> Result<Self, SettingsError> {
        settings.validate()?;
        Ok(Self {
            settings,
            slot: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<Entry>> {
        self.slot.lock().expect("registry mutex is poisoned")
    }

    /// Returns the scheduler for `credential`, replacing the cached one if the credential
    /// changed.
    ///
    /// Tasks already submitted to a replaced scheduler still run to completion on it.
    pub fn get(&self, credential: &str) -> Scheduler {
        let mut slot = self.lock();
        if let Some(entry) = slot.as_ref().filter(|entry| entry.credential == credential) {
            return entry.scheduler.clone();
        }

        if slot.is_some() {
            info!(message = "Credential changed; starting a fresh scheduler.");
        }
        // Settings were validated on construction.
        let scheduler = match Scheduler::new(self.settings) {
            Ok(scheduler) => scheduler,
            Err(error) => unreachable!("registry settings failed validation: {error}"),
        };
        *slot = Some(Entry {
            credential: credential.to_owned(),
            scheduler: scheduler.clone(),
        });
        scheduler
    }

    /// Drops the cached scheduler.
    pub fn reset(&self) {
        self.lock().take();
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
