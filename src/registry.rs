//! In-memory registry of experiments, feature flags and sticky assignments.
//!
//! Every mutation is written through to [`KeyValueStorage`]. Each logical store is a single JSON
//! document: experiments and flags keyed by id, assignments keyed by experiment id, then user id.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::Utc;
use serde::Deserialize;

use crate::{
    models::{
        ExperimentAssignment, ExperimentConfig, ExperimentStatus, ExperimentUpdate, FeatureFlag,
        FeatureFlagUpdate,
    },
    storage::{load_json, remove_key, save_json, KeyValueStorage, TryParse},
    Error, Result,
};

/// Storage key of the experiments document.
pub const EXPERIMENTS_KEY: &str = "ab_test_experiments";
/// Storage key of the assignments document.
pub const ASSIGNMENTS_KEY: &str = "ab_test_assignments";
/// Storage key of the feature flags document.
pub const FLAGS_KEY: &str = "feature_flags";

/// `(experiment_id, user_id)`
type AssignmentKey = (String, String);

/// Persisted form of assignments: `experiment_id -> user_id -> assignment`.
type AssignmentsDocument<T> = HashMap<String, HashMap<String, T>>;

#[derive(Debug, Default)]
pub(crate) struct RegistryState {
    pub(crate) experiments: HashMap<String, ExperimentConfig>,
    pub(crate) flags: HashMap<String, FeatureFlag>,
    pub(crate) assignments: HashMap<AssignmentKey, ExperimentAssignment>,
}

/// Store of experiment and flag definitions plus per-user assignments.
///
/// `Registry` is `Sync`; share it between [`Client`](crate::Client)s with an `Arc`. All operations
/// take the internal lock for their whole duration, so a check-then-assign sequence is atomic
/// within the process.
pub struct Registry {
    storage: Arc<dyn KeyValueStorage>,
    state: Mutex<RegistryState>,
}

impl Registry {
    /// Create a registry backed by `storage`, loading previously persisted state.
    ///
    /// Missing or corrupted documents are treated as empty. Individual entries that fail to
    /// parse or validate are skipped with a warning.
    pub fn load(storage: Arc<dyn KeyValueStorage>) -> Registry {
        let state = RegistryState {
            experiments: load_entries(&*storage, EXPERIMENTS_KEY, id_of_experiment)
                .into_iter()
                .filter(|(id, experiment): &(String, ExperimentConfig)| {
                    keep_valid(id, experiment.validate())
                })
                .collect(),
            flags: load_entries(&*storage, FLAGS_KEY, id_of_flag)
                .into_iter()
                .filter(|(id, flag): &(String, FeatureFlag)| keep_valid(id, flag.validate()))
                .collect(),
            assignments: load_assignments(&*storage),
        };

        log::debug!(target: "splitkit",
                    experiments = state.experiments.len(),
                    flags = state.flags.len(),
                    assignments = state.assignments.len();
                    "loaded registry");

        Registry {
            storage,
            state: Mutex::new(state),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // A panic while holding the lock cannot leave the maps half-updated (all updates are
        // single inserts/removes), so a poisoned lock is safe to reuse.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new experiment.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidExperiment`] if the configuration violates an invariant (e.g., variant
    ///   allocations don't sum to 100 or there is no control variant).
    /// - [`Error::DuplicateExperiment`] if an experiment with this id already exists.
    pub fn create_experiment(&self, mut experiment: ExperimentConfig) -> Result<ExperimentConfig> {
        experiment.validate().map_err(Error::InvalidExperiment)?;

        let mut state = self.lock();
        if state.experiments.contains_key(&experiment.id) {
            return Err(Error::DuplicateExperiment(experiment.id));
        }

        let now = Utc::now();
        experiment.created_at = now;
        experiment.updated_at = now;

        log::debug!(target: "splitkit", experiment_id:display = experiment.id; "created experiment");
        state
            .experiments
            .insert(experiment.id.clone(), experiment.clone());
        self.persist_experiments(&state);
        Ok(experiment)
    }

    /// Merge `update` into an existing experiment.
    ///
    /// The stored experiment is left untouched if the merged result is invalid.
    ///
    /// # Errors
    ///
    /// - [`Error::ExperimentNotFound`] if there is no experiment with this id.
    /// - [`Error::InvalidExperiment`] if the merged configuration violates an invariant.
    pub fn update_experiment(
        &self,
        experiment_id: &str,
        update: ExperimentUpdate,
    ) -> Result<ExperimentConfig> {
        let mut state = self.lock();
        let mut experiment = state
            .experiments
            .get(experiment_id)
            .cloned()
            .ok_or_else(|| Error::ExperimentNotFound(experiment_id.to_owned()))?;

        experiment.apply(update);
        experiment.validate().map_err(Error::InvalidExperiment)?;
        experiment.updated_at = Utc::now();

        state
            .experiments
            .insert(experiment.id.clone(), experiment.clone());
        self.persist_experiments(&state);
        Ok(experiment)
    }

    /// Change experiment status (start, pause, complete).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExperimentNotFound`] if there is no experiment with this id.
    pub fn set_experiment_status(
        &self,
        experiment_id: &str,
        status: ExperimentStatus,
    ) -> Result<ExperimentConfig> {
        self.update_experiment(
            experiment_id,
            ExperimentUpdate {
                status: Some(status),
                ..Default::default()
            },
        )
    }

    /// Delete an experiment and every assignment referencing it. Returns `false` if there was no
    /// such experiment.
    pub fn delete_experiment(&self, experiment_id: &str) -> bool {
        let mut state = self.lock();
        let existed = state.experiments.remove(experiment_id).is_some();

        let before = state.assignments.len();
        state
            .assignments
            .retain(|(experiment, _user), _| experiment != experiment_id);
        let purged = before - state.assignments.len();

        if existed {
            self.persist_experiments(&state);
        }
        if purged > 0 {
            self.persist_assignments(&state);
        }

        log::debug!(target: "splitkit", experiment_id, existed, purged; "deleted experiment");
        existed
    }

    #[allow(missing_docs)]
    pub fn get_experiment(&self, experiment_id: &str) -> Option<ExperimentConfig> {
        self.lock().experiments.get(experiment_id).cloned()
    }

    /// All experiments, ordered by id.
    pub fn experiments(&self) -> Vec<ExperimentConfig> {
        let mut experiments: Vec<_> = self.lock().experiments.values().cloned().collect();
        experiments.sort_by(|a, b| a.id.cmp(&b.id));
        experiments
    }

    /// Register a new feature flag.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidFlag`] if the flag violates an invariant.
    /// - [`Error::DuplicateFlag`] if a flag with this id already exists.
    pub fn create_flag(&self, mut flag: FeatureFlag) -> Result<FeatureFlag> {
        flag.validate().map_err(Error::InvalidFlag)?;

        let mut state = self.lock();
        if state.flags.contains_key(&flag.id) {
            return Err(Error::DuplicateFlag(flag.id));
        }

        let now = Utc::now();
        flag.created_at = now;
        flag.updated_at = now;

        state.flags.insert(flag.id.clone(), flag.clone());
        self.persist_flags(&state);
        Ok(flag)
    }

    /// Merge `update` into an existing flag.
    ///
    /// # Errors
    ///
    /// - [`Error::FlagNotFound`] if there is no flag with this id.
    /// - [`Error::InvalidFlag`] if the merged flag violates an invariant.
    pub fn update_flag(&self, flag_id: &str, update: FeatureFlagUpdate) -> Result<FeatureFlag> {
        let mut state = self.lock();
        let mut flag = state
            .flags
            .get(flag_id)
            .cloned()
            .ok_or_else(|| Error::FlagNotFound(flag_id.to_owned()))?;

        flag.apply(update);
        flag.validate().map_err(Error::InvalidFlag)?;
        flag.updated_at = Utc::now();

        state.flags.insert(flag.id.clone(), flag.clone());
        self.persist_flags(&state);
        Ok(flag)
    }

    /// Delete a flag. Returns `false` if there was no such flag.
    pub fn delete_flag(&self, flag_id: &str) -> bool {
        let mut state = self.lock();
        let existed = state.flags.remove(flag_id).is_some();
        if existed {
            self.persist_flags(&state);
        }
        existed
    }

    #[allow(missing_docs)]
    pub fn get_flag(&self, flag_id: &str) -> Option<FeatureFlag> {
        self.lock().flags.get(flag_id).cloned()
    }

    /// All flags, ordered by id.
    pub fn flags(&self) -> Vec<FeatureFlag> {
        let mut flags: Vec<_> = self.lock().flags.values().cloned().collect();
        flags.sort_by(|a, b| a.id.cmp(&b.id));
        flags
    }

    /// Persisted assignment of `user_id` in `experiment_id`.
    pub fn get_assignment(
        &self,
        experiment_id: &str,
        user_id: &str,
    ) -> Option<ExperimentAssignment> {
        self.lock()
            .assignments
            .get(&assignment_key(experiment_id, user_id))
            .cloned()
    }

    /// All assignments of `user_id`, ordered by experiment id.
    pub fn assignments_for_user(&self, user_id: &str) -> Vec<ExperimentAssignment> {
        let mut assignments: Vec<_> = self
            .lock()
            .assignments
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        assignments.sort_by(|a, b| a.experiment_id.cmp(&b.experiment_id));
        assignments
    }

    /// Forget the assignment of `user_id` in `experiment_id`, so the next request re-buckets the
    /// user. Returns `false` if there was none.
    pub fn reset_assignment(&self, experiment_id: &str, user_id: &str) -> bool {
        let mut state = self.lock();
        let existed = state
            .assignments
            .remove(&assignment_key(experiment_id, user_id))
            .is_some();
        if existed {
            self.persist_assignments(&state);
        }
        existed
    }

    /// Forget every assignment in `experiment_id`. Returns the number of removed assignments.
    pub fn reset_assignments_for_experiment(&self, experiment_id: &str) -> usize {
        let mut state = self.lock();
        let before = state.assignments.len();
        state
            .assignments
            .retain(|(experiment, _user), _| experiment != experiment_id);
        let removed = before - state.assignments.len();
        if removed > 0 {
            self.persist_assignments(&state);
        }
        removed
    }

    /// Clear everything, in memory and in storage.
    pub fn reset(&self) {
        let mut state = self.lock();
        *state = RegistryState::default();
        for key in [EXPERIMENTS_KEY, FLAGS_KEY, ASSIGNMENTS_KEY] {
            remove_key(&*self.storage, key);
        }
    }

    fn persist_experiments(&self, state: &RegistryState) {
        save_json(&*self.storage, EXPERIMENTS_KEY, &state.experiments);
    }

    fn persist_flags(&self, state: &RegistryState) {
        save_json(&*self.storage, FLAGS_KEY, &state.flags);
    }

    pub(crate) fn persist_assignments(&self, state: &RegistryState) {
        let mut document: AssignmentsDocument<&ExperimentAssignment> = HashMap::new();
        for a in state.assignments.values() {
            document
                .entry(a.experiment_id.clone())
                .or_default()
                .insert(a.user_id.clone(), a);
        }
        save_json(&*self.storage, ASSIGNMENTS_KEY, &document);
    }
}

pub(crate) fn assignment_key(experiment_id: &str, user_id: &str) -> AssignmentKey {
    (experiment_id.to_owned(), user_id.to_owned())
}

fn load_entries<T>(
    storage: &dyn KeyValueStorage,
    key: &str,
    id_of: fn(&T) -> &str,
) -> HashMap<String, T>
where
    T: for<'de> Deserialize<'de>,
{
    let Some(document) = load_json::<HashMap<String, TryParse<T>>>(storage, key) else {
        return HashMap::new();
    };

    // Entries are re-keyed by their own id, so lookups and updates agree with the record.
    document
        .into_iter()
        .filter_map(|(entry, value)| value.ok_or_log(key, &entry))
        .map(|value| (id_of(&value).to_owned(), value))
        .collect()
}

fn load_assignments(
    storage: &dyn KeyValueStorage,
) -> HashMap<AssignmentKey, ExperimentAssignment> {
    let document: Option<AssignmentsDocument<TryParse<ExperimentAssignment>>> =
        load_json(storage, ASSIGNMENTS_KEY);
    let Some(document) = document else {
        return HashMap::new();
    };

    // Keys are rebuilt from the records themselves, not from the document layout.
    document
        .into_iter()
        .flat_map(|(experiment_id, users)| {
            users.into_iter().filter_map(move |(user_id, assignment)| {
                assignment.ok_or_log(ASSIGNMENTS_KEY, &format!("{experiment_id}/{user_id}"))
            })
        })
        .map(|a| (assignment_key(&a.experiment_id, &a.user_id), a))
        .collect()
}

fn id_of_experiment(experiment: &ExperimentConfig) -> &str {
    &experiment.id
}

fn id_of_flag(flag: &FeatureFlag) -> &str {
    &flag.id
}

fn keep_valid(id: &str, validation: std::result::Result<(), crate::ValidationError>) -> bool {
    match validation {
        Ok(()) => true,
        Err(err) => {
            log::warn!(target: "splitkit", id; "skipping invalid stored definition: {err}");
            false
        }
    }
}
