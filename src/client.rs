use std::sync::Arc;

use chrono::Utc;

use crate::{
    context::{load_or_create_user_id, UserContext},
    events::{
        AnalyticsEvent, EventTracker, AB_TEST_CATEGORY, ASSIGNMENT_EVENT, CONVERSION_EVENT,
        EXPOSURE_EVENT,
    },
    models::{select_variant, ExperimentAssignment, VariantConfig},
    registry::assignment_key,
    sharder::{bucket, Sharder},
    ClientConfig, Registry,
};

/// Assigns users to experiment variants and evaluates feature flags.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// Lookups never fail: an unknown, inactive or misconfigured experiment simply yields `None` (or
/// `false` for flags). Errors are only returned when editing the [`Registry`].
///
/// # Examples
/// ```
/// # use splitkit::{Client, ClientConfig, ExperimentConfig, ExperimentStatus, ExperimentVariant};
/// let client = Client::new(ClientConfig::in_memory());
/// client
///     .registry()
///     .create_experiment(
///         ExperimentConfig::new(
///             "checkout",
///             "Checkout button",
///             vec![
///                 ExperimentVariant::control("control", 50.0),
///                 ExperimentVariant::new("green", 50.0),
///             ],
///         )
///         .with_status(ExperimentStatus::Running),
///     )
///     .unwrap();
///
/// let context = client.user_context();
/// let variant = client.get_variant("checkout", &context);
/// assert!(variant.is_some());
/// ```
pub struct Client {
    registry: Arc<Registry>,
    tracker: EventTracker,
    sharder: Box<dyn Sharder + Send + Sync>,
    user_id: String,
}

impl Client {
    /// Create a new `Client` using the specified configuration.
    ///
    /// Loads the registry from the configured storage (unless one was passed with
    /// [`ClientConfig::registry`]) and the persisted user id, creating one if needed.
    pub fn new(config: ClientConfig) -> Self {
        let ClientConfig {
            storage,
            sharder,
            sinks,
            registry,
            tracker,
        } = config;

        let registry = registry.unwrap_or_else(|| Arc::new(Registry::load(storage.clone())));
        let user_id = load_or_create_user_id(&*storage);
        let tracker = EventTracker::new(tracker, storage, sinks);
        tracker.set_user_id(user_id.clone());

        Client {
            registry,
            tracker,
            sharder,
            user_id,
        }
    }

    /// Create a client sharing `registry` with other clients.
    pub fn new_with_registry(mut config: ClientConfig, registry: Arc<Registry>) -> Self {
        config.registry(registry);
        Client::new(config)
    }

    /// Experiment and flag definitions together with persisted assignments.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The analytics event tracker.
    pub fn tracker(&self) -> &EventTracker {
        &self.tracker
    }

    /// Persisted (or newly generated) anonymous user id.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Context of the persisted user in the current analytics session.
    pub fn user_context(&self) -> UserContext {
        UserContext::new(self.user_id.clone(), self.tracker.session_id())
    }

    /// Get the variant assigned to the user in `experiment_id`, assigning one if needed.
    ///
    /// Returns `None` if the experiment does not exist or is not active, or if the user falls
    /// outside the traffic allocation or does not match targeting. Exclusions are not persisted,
    /// so a user may become eligible later (e.g., once traffic allocation is increased).
    ///
    /// Once assigned, the variant is sticky: it is returned as-is without re-checking traffic or
    /// targeting, until the assignment is reset through the registry.
    pub fn get_variant(&self, experiment_id: &str, context: &UserContext) -> Option<String> {
        let user_id = self.subject(context);

        let (assignment, experiment_name, variant_name) = {
            let mut guard = self.registry.lock();
            let state = &mut *guard;

            let Some(experiment) = state.experiments.get(experiment_id) else {
                log::trace!(target: "splitkit", experiment_id, user_id; "unknown experiment");
                return None;
            };

            if !experiment.is_active(Utc::now()) {
                log::trace!(target: "splitkit",
                            experiment_id,
                            user_id,
                            status:debug = experiment.status;
                            "experiment is not active");
                return None;
            }

            let key = assignment_key(experiment_id, user_id);
            if let Some(existing) = state.assignments.get(&key) {
                log::trace!(target: "splitkit",
                            experiment_id,
                            user_id,
                            variant_id = existing.variant_id.as_str();
                            "returning persisted assignment");
                return Some(existing.variant_id.clone());
            }

            let traffic_bucket = bucket(&*self.sharder, user_id, experiment_id);
            if traffic_bucket as f64 >= experiment.traffic_allocation {
                log::trace!(target: "splitkit",
                            experiment_id,
                            user_id,
                            traffic_bucket;
                            "user is outside of traffic allocation");
                return None;
            }

            if !experiment.targeting.eval(context) {
                log::trace!(target: "splitkit", experiment_id, user_id; "user does not match targeting");
                return None;
            }

            let variant_bucket = bucket(
                &*self.sharder,
                user_id,
                &format!("{experiment_id}_variant"),
            );
            let Some(variant) = select_variant(&experiment.variants, variant_bucket) else {
                log::warn!(target: "splitkit", experiment_id; "experiment has no variants");
                return None;
            };

            let assignment = ExperimentAssignment {
                user_id: user_id.to_owned(),
                experiment_id: experiment_id.to_owned(),
                variant_id: variant.id.clone(),
                assigned_at: Utc::now(),
                session_id: context.session_id.clone(),
            };
            let names = (experiment.name.clone(), variant.name.clone());

            state.assignments.insert(key, assignment.clone());
            self.registry.persist_assignments(state);

            (assignment, names.0, names.1)
        };

        log::trace!(target: "splitkit",
                    experiment_id,
                    user_id,
                    variant_id = assignment.variant_id.as_str();
                    "assigned variant");

        self.tracker.track(
            AnalyticsEvent::new(ASSIGNMENT_EVENT, AB_TEST_CATEGORY)
                .with_property("experiment_id", experiment_id)
                .with_property("experiment_name", experiment_name)
                .with_property("variant_id", assignment.variant_id.as_str())
                .with_property("variant_name", variant_name)
                .with_user_id(user_id)
                .with_session_id(context.session_id.as_str()),
        );

        Some(assignment.variant_id)
    }

    /// Get the configuration of the variant assigned to the user, assigning one if needed.
    pub fn get_variant_config(
        &self,
        experiment_id: &str,
        context: &UserContext,
    ) -> Option<VariantConfig> {
        let variant_id = self.get_variant(experiment_id, context)?;
        let state = self.registry.lock();
        let config = state
            .experiments
            .get(experiment_id)?
            .variant(&variant_id)
            .map(|variant| variant.config.clone());
        if config.is_none() {
            log::warn!(target: "splitkit",
                       experiment_id,
                       variant_id = variant_id.as_str();
                       "assigned variant no longer exists in experiment");
        }
        config
    }

    /// Returns `true` if the flag is enabled, the user falls within its rollout and matches its
    /// targeting. Unknown flags are disabled.
    ///
    /// Flag evaluation is stateless: nothing is persisted or tracked.
    pub fn is_feature_enabled(&self, flag_id: &str, context: &UserContext) -> bool {
        let Some(flag) = self.registry.get_flag(flag_id) else {
            log::trace!(target: "splitkit", flag_id; "unknown feature flag");
            return false;
        };

        let user_id = self.subject(context);
        let rollout_bucket = bucket(&*self.sharder, user_id, flag_id);
        let enabled = flag.enabled
            && (rollout_bucket as f64) < flag.rollout_percentage
            && flag.targeting.eval(context);

        log::trace!(target: "splitkit",
                    flag_id,
                    user_id,
                    rollout_bucket,
                    enabled;
                    "evaluated feature flag");
        enabled
    }

    /// Variant of a multivariate flag for the user, or `None` if the flag is off for them or has
    /// no variants.
    pub fn get_flag_variant(&self, flag_id: &str, context: &UserContext) -> Option<String> {
        if !self.is_feature_enabled(flag_id, context) {
            return None;
        }
        let flag = self.registry.get_flag(flag_id)?;
        let variant_bucket = bucket(
            &*self.sharder,
            self.subject(context),
            &format!("{flag_id}_variant"),
        );
        select_variant(&flag.variants, variant_bucket).map(|variant| variant.id.clone())
    }

    /// Record that the user saw `experiment_id`. Only tracked if the user has been assigned a
    /// variant; returns whether an event was emitted.
    pub fn track_exposure(&self, experiment_id: &str, context: &UserContext) -> bool {
        let user_id = self.subject(context);
        let Some(assignment) = self.registry.get_assignment(experiment_id, user_id) else {
            return false;
        };

        self.tracker.track(
            AnalyticsEvent::new(EXPOSURE_EVENT, AB_TEST_CATEGORY)
                .with_property("experiment_id", experiment_id)
                .with_property("variant_id", assignment.variant_id)
                .with_user_id(user_id)
                .with_session_id(context.session_id.as_str()),
        );
        true
    }

    /// Record a conversion on `metric` for the user's variant of `experiment_id`. Only tracked if
    /// the user has been assigned a variant; returns whether an event was emitted.
    pub fn track_conversion(
        &self,
        experiment_id: &str,
        metric: &str,
        value: Option<f64>,
        context: &UserContext,
    ) -> bool {
        let user_id = self.subject(context);
        let Some(assignment) = self.registry.get_assignment(experiment_id, user_id) else {
            return false;
        };

        let mut event = AnalyticsEvent::new(CONVERSION_EVENT, AB_TEST_CATEGORY)
            .with_property("experiment_id", experiment_id)
            .with_property("variant_id", assignment.variant_id)
            .with_property("metric", metric)
            .with_user_id(user_id)
            .with_session_id(context.session_id.as_str());
        if let Some(value) = value {
            event = event.with_value(value);
        }
        self.tracker.track(event);
        true
    }

    /// User id to bucket on. Contexts without one fall back to the persisted anonymous id.
    fn subject<'a>(&'a self, context: &'a UserContext) -> &'a str {
        if context.user_id.is_empty() {
            &self.user_id
        } else {
            &context.user_id
        }
    }

    /// Record an arbitrary analytics event.
    pub fn track(&self, event: AnalyticsEvent) {
        self.tracker.track(event);
    }
}
