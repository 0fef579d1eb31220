//! Pending state: per-resource request coalescing and the final bundle
//! assembly.
//!
//! Every action, relation hop or dependency that reaches a resource folds
//! into one [`PendingResult`], keeping the strongest request seen so far
//! (max expand depth, max load modes, union of observables). The executor
//! drains entries until no result has missing work; the set of
//! `(uri, outstanding observables, remaining depth)` strictly decreases on
//! every iteration, which guarantees termination.

use std::collections::BTreeMap;

use crate::action::{LoadMode, QueryAction, max_load_mode};
use crate::bundle::{
    Bundle, ObservationError, ObservationOrError, Resource, ResourceError, ResourceOrError,
    Resources,
};
use crate::connector::KnowledgeContext;
use crate::error::ErrorInfo;
use crate::history::Locator;
use crate::label::ResourceLabels;
use crate::metadata::ResourceInfo;
use crate::relation::Relation;
use crate::sorted::{OnConflict, sorted_insert};
use crate::uri::{Reference, ResourceUri, Suffix};

/// Why a dependency entry exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    /// A collection child.
    Collection,
    /// An embedded observable.
    Embed,
    /// A linked resource.
    Link,
}

/// What caused a resource to become pending.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingReason {
    /// An explicit action targeted the resource.
    Action(QueryAction),
    /// A relation (by unique id) reached the resource during expansion.
    Relation(String),
    /// A bundle of `origin` depends on the resource.
    Dependency {
        /// How the dependency was recorded.
        kind: DependencyKind,
        /// The resource whose bundle carries the dependency.
        origin: ResourceUri,
    },
}

/// The resolved resource metadata, or the error that replaced it.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceOutcome {
    /// The resource resolved.
    Info(ResourceInfo),
    /// Resolution failed; no observation is attempted.
    Error(ErrorInfo),
}

/// An observed bundle, or the error that replaced it.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedOutcome {
    /// The observable produced a bundle.
    Bundle(Bundle),
    /// The observable failed; others proceed.
    Error(ObservationError),
}

impl ObservedOutcome {
    /// The suffix the outcome covers.
    #[must_use]
    pub fn suffix(&self) -> &Suffix {
        match self {
            Self::Bundle(bundle) => bundle.uri().suffix(),
            Self::Error(error) => error.uri.suffix(),
        }
    }
}

/// A requested change to a pending result; unset fields leave the current
/// request untouched.
#[derive(Debug, Clone, Default)]
pub struct PendingUpdate {
    /// Why the update happened.
    pub reason: Option<PendingReason>,
    /// Relation hops still to expand from this resource.
    pub request_expand_depth: u32,
    /// Load mode propagated to expanded relations.
    pub request_expand_mode: LoadMode,
    /// Load mode for the resource itself.
    pub request_load_mode: LoadMode,
    /// Observables to read.
    pub request_observe: Vec<Suffix>,
}

/// The accumulated request and results for one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingResult {
    /// How to reach the resource.
    pub locator: Locator,
    /// Everything that caused this entry.
    pub reason: Vec<PendingReason>,
    /// The strongest requested expansion depth.
    pub request_expand_depth: u32,
    /// The strongest requested expansion mode.
    pub request_expand_mode: LoadMode,
    /// The strongest requested load mode.
    pub request_load_mode: LoadMode,
    /// The union of requested root observables, sorted.
    pub request_observe: Vec<Suffix>,
    /// The resolved metadata or resolution error.
    pub resource: Option<ResourceOutcome>,
    /// The expansion depth already performed.
    pub relations_depth: u32,
    /// Observed bundles and observation errors.
    pub observed: Vec<ObservedOutcome>,
    /// Labels accumulated for the resource.
    pub labels: ResourceLabels,
}

impl PendingResult {
    /// An empty entry for a locator.
    #[must_use]
    pub fn new(locator: Locator) -> Self {
        Self {
            locator,
            reason: Vec::new(),
            request_expand_depth: 0,
            request_expand_mode: LoadMode::None,
            request_load_mode: LoadMode::None,
            request_observe: Vec::new(),
            resource: None,
            relations_depth: 0,
            observed: Vec::new(),
            labels: ResourceLabels::new(),
        }
    }

    /// Fold an update into the entry, keeping the strongest request.
    pub fn update(&mut self, update: PendingUpdate) {
        if let Some(reason) = update.reason {
            self.reason.push(reason);
        }
        self.request_expand_depth = self.request_expand_depth.max(update.request_expand_depth);
        self.request_expand_mode =
            max_load_mode(self.request_expand_mode, update.request_expand_mode);
        self.request_load_mode = max_load_mode(self.request_load_mode, update.request_load_mode);
        for observable in update.request_observe {
            sorted_insert(
                &mut self.request_observe,
                observable.root(),
                Suffix::as_suffix,
                OnConflict::Keep,
            );
        }
    }

    /// Fold an action into the entry.
    pub fn add_action(&mut self, action: &QueryAction) {
        let update = match action {
            QueryAction::Attachment(_) => PendingUpdate {
                reason: Some(PendingReason::Action(action.clone())),
                ..PendingUpdate::default()
            },
            QueryAction::Load(load) => PendingUpdate {
                reason: Some(PendingReason::Action(action.clone())),
                request_expand_depth: load.expand_depth,
                request_expand_mode: load.expand_mode,
                request_load_mode: load.load_mode,
                request_observe: load.observe.clone(),
            },
            QueryAction::Observe(observe) => PendingUpdate {
                reason: Some(PendingReason::Action(action.clone())),
                request_load_mode: LoadMode::Auto,
                request_observe: vec![observe.uri.suffix().clone()],
                ..PendingUpdate::default()
            },
        };
        self.update(update);
    }

    /// The requested observables still missing.
    ///
    /// `None` means the entry needs no further work. `Some(empty)` means the
    /// metadata or relation expansion is still outstanding even though every
    /// observable was covered.
    #[must_use]
    pub fn missing_observe(&self) -> Option<Vec<Suffix>> {
        if matches!(self.resource, Some(ResourceOutcome::Error(_))) {
            return None;
        }

        // Observed bundles carry affordance suffixes while observation
        // errors carry observable suffixes, so check both.
        let missing: Vec<Suffix> = self
            .request_observe
            .iter()
            .filter(|requested| {
                let affordance = requested.affordance();
                !self.observed.iter().any(|outcome| {
                    *outcome.suffix() == **requested || *outcome.suffix() == affordance
                })
            })
            .cloned()
            .collect();

        if !missing.is_empty() {
            Some(missing)
        } else if self.resource.is_none() || self.relations_depth < self.request_expand_depth {
            Some(Vec::new())
        } else {
            None
        }
    }

    /// The batch ordering key; batches take the GREATEST keys first.
    ///
    /// The graph expands breadth-first by depth before reading leaf
    /// content, then refresh-capable entries come first; the URI tiebreak
    /// exists only for determinism.
    #[must_use]
    pub fn sort_key(&self) -> (u32, bool, String) {
        (
            self.request_expand_depth,
            self.request_load_mode != LoadMode::None,
            self.locator.resource_uri.to_string(),
        )
    }
}

///
/// State
///

/// The executor's working state.
#[derive(Default)]
pub struct PendingState {
    /// One entry per reached resource.
    pub results: BTreeMap<ResourceUri, PendingResult>,
    /// Relations recorded during expansion, sorted by unique id.
    pub relations: Vec<Relation>,
    /// References no connector could resolve.
    pub unavailable: Vec<Reference>,
}

impl PendingState {
    /// An empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry for a locator, created on first touch.
    pub fn result(&mut self, locator: &Locator) -> &mut PendingResult {
        self.results
            .entry(locator.resource_uri.clone())
            .or_insert_with(|| PendingResult::new(locator.clone()))
    }

    /// Fold an action into the entry for its locator.
    pub fn add_action(&mut self, locator: &Locator, action: &QueryAction) {
        self.result(locator).add_action(action);
    }

    /// Record a resource-level failure.
    pub fn add_error(&mut self, locator: &Locator, error: ErrorInfo) {
        self.result(locator).resource = Some(ResourceOutcome::Error(error));
    }

    /// Record an unresolvable reference.
    pub fn add_unavailable(&mut self, reference: Reference) {
        sorted_insert(
            &mut self.unavailable,
            reference,
            ToString::to_string,
            OnConflict::Keep,
        );
    }

    /// Record a relation, deduplicated by unique id.
    pub fn add_relation(&mut self, relation: Relation) {
        sorted_insert(
            &mut self.relations,
            relation,
            Relation::unique_id,
            OnConflict::Keep,
        );
    }

    /// The next batch of resources with outstanding work, strongest first.
    #[must_use]
    pub fn next_batch(&self, batch_size: usize) -> Vec<ResourceUri> {
        let mut candidates: Vec<(&ResourceUri, &PendingResult)> = self
            .results
            .iter()
            .filter(|(_, pending)| pending.missing_observe().is_some())
            .collect();
        candidates.sort_by_key(|(_, pending)| std::cmp::Reverse(pending.sort_key()));
        candidates
            .into_iter()
            .take(batch_size)
            .map(|(uri, _)| uri.clone())
            .collect()
    }

    /// Build the final record for one resource, when it passes the filters.
    #[must_use]
    pub fn build_one(
        &self,
        context: &KnowledgeContext,
        resource_uri: &ResourceUri,
    ) -> Option<(ResourceOrError, Vec<Bundle>, Vec<ObservationError>)> {
        let pending = self.results.get(resource_uri)?;
        let outcome = pending.resource.as_ref()?;
        if !context.filters.matches(resource_uri)
            || !context.filters.satisfied_by(&pending.labels.as_list())
        {
            return None;
        }

        let info = match outcome {
            ResourceOutcome::Error(error) => {
                return Some((
                    ResourceOrError::Error(ResourceError {
                        uri: resource_uri.clone(),
                        error: error.clone(),
                    }),
                    Vec::new(),
                    Vec::new(),
                ));
            },
            ResourceOutcome::Info(info) => info,
        };

        // External URIs that reached this resource through actions become
        // aliases of it.
        let mut aliases = info.aliases.clone();
        for reason in &pending.reason {
            if let PendingReason::Action(action) = reason {
                if let Reference::External(url) = action.reference() {
                    sorted_insert(&mut aliases, url, ToString::to_string, OnConflict::Keep);
                }
            }
        }

        let relations = (pending.request_expand_depth > 0).then(|| {
            self.relations
                .iter()
                .filter(|relation| relation.touches(resource_uri))
                .cloned()
                .collect::<Vec<_>>()
        });

        let resource = Resource::new(
            resource_uri.clone(),
            "svc-knowledge",
            info.attributes.clone(),
            aliases,
            info.affordances.clone(),
            &pending.labels,
            relations,
        );

        let mut bundles: Vec<Bundle> = Vec::new();
        let mut errors: Vec<ObservationError> = Vec::new();
        for outcome in &pending.observed {
            if !pending
                .request_observe
                .iter()
                .any(|requested| requested == outcome.suffix() || requested.affordance() == *outcome.suffix())
            {
                continue;
            }
            match outcome {
                ObservedOutcome::Bundle(bundle) => bundles.push(bundle.clone()),
                ObservedOutcome::Error(error) => errors.push(error.clone()),
            }
        }

        Some((ResourceOrError::Resource(resource), bundles, errors))
    }

    /// Assemble the final bundle from every passing entry.
    #[must_use]
    pub fn into_resources(self, context: &KnowledgeContext) -> Resources {
        let mut result = Resources::new();

        for resource_uri in self.results.keys() {
            let Some((resource, bundles, errors)) = self.build_one(context, resource_uri) else {
                continue;
            };

            let labels = match &resource {
                ResourceOrError::Resource(resource) => {
                    ResourceLabels::from_list(resource.labels.clone())
                },
                ResourceOrError::Error(_) => {
                    result.update(vec![resource], Vec::new());
                    continue;
                },
            };

            let mut observations: Vec<ObservationOrError> = errors
                .into_iter()
                .map(ObservationOrError::Error)
                .collect();
            observations.extend(
                bundles
                    .iter()
                    .flat_map(Bundle::observations)
                    .map(|observation| {
                        ObservationOrError::Observation(observation.with_labels(&labels))
                    }),
            );

            result.update(vec![resource], observations);
        }

        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::action::{ResourcesLoadAction, ResourcesObserveAction};
    use crate::content::{ContentText, Sep};
    use crate::bundle::BundleBody;

    fn uri(value: &str) -> ResourceUri {
        ResourceUri::decode(value).unwrap()
    }

    fn locator(value: &str) -> Locator {
        Locator::for_uri(&uri(value))
    }

    fn load_action(value: &str, depth: u32, load_mode: LoadMode) -> QueryAction {
        QueryAction::Load(ResourcesLoadAction {
            uri: Reference::decode(value).unwrap(),
            expand_depth: depth,
            expand_mode: LoadMode::None,
            load_mode,
            observe: vec![Suffix::body()],
        })
    }

    #[test]
    fn test_update_keeps_strongest_request() {
        let mut state = PendingState::new();
        let locator = locator("ndk://stub/-/dir/example");

        state.add_action(&locator, &load_action("ndk://stub/-/dir/example", 1, LoadMode::None));
        state.add_action(&locator, &load_action("ndk://stub/-/dir/example", 0, LoadMode::Force));

        let pending = state.results.get(&uri("ndk://stub/-/dir/example")).unwrap();
        assert_eq!(pending.request_expand_depth, 1);
        assert_eq!(pending.request_load_mode, LoadMode::Force);
        assert_eq!(pending.reason.len(), 2);
    }

    #[test]
    fn test_observe_action_requests_root() {
        let mut state = PendingState::new();
        let locator = locator("ndk://stub/-/dir/example");
        state.add_action(
            &locator,
            &QueryAction::Observe(ResourcesObserveAction {
                uri: uri("ndk://stub/-/dir/example")
                    .child_observable(Suffix::chunk(&[1, 2])),
            }),
        );

        // The chunk's root ($body) is requested, not the chunk itself.
        let pending = state.results.get(&uri("ndk://stub/-/dir/example")).unwrap();
        assert_eq!(pending.request_observe, vec![Suffix::body()]);
    }

    #[test]
    fn test_missing_observe_progression() {
        let mut pending = PendingResult::new(locator("ndk://stub/-/dir/example"));
        pending.update(PendingUpdate {
            request_observe: vec![Suffix::body()],
            ..PendingUpdate::default()
        });

        // Initially the body is missing.
        assert_eq!(pending.missing_observe(), Some(vec![Suffix::body()]));

        // Once observed, the metadata is still outstanding.
        pending.observed.push(ObservedOutcome::Bundle(Bundle::Body(
            BundleBody::make_single(
                &uri("ndk://stub/-/dir/example"),
                ContentText::new_plain("text", Sep::Newline),
                Vec::new(),
                None,
            ),
        )));
        assert_eq!(pending.missing_observe(), Some(Vec::new()));

        // With the resource resolved, nothing remains.
        pending.resource = Some(ResourceOutcome::Info(ResourceInfo {
            uri: uri("ndk://stub/-/dir/example"),
            attributes: crate::metadata::ResourceAttrs::named("doc"),
            aliases: Vec::new(),
            affordances: Vec::new(),
        }));
        assert_eq!(pending.missing_observe(), None);
    }

    #[test]
    fn test_missing_observe_none_after_error() {
        let mut pending = PendingResult::new(locator("ndk://stub/-/dir/example"));
        pending.update(PendingUpdate {
            request_observe: vec![Suffix::body()],
            ..PendingUpdate::default()
        });
        pending.resource = Some(ResourceOutcome::Error(ErrorInfo::new(
            "unavailable",
            "gone",
        )));
        assert_eq!(pending.missing_observe(), None);
    }

    #[test]
    fn test_missing_observe_tracks_expansion() {
        let mut pending = PendingResult::new(locator("ndk://stub/-/dir/example"));
        pending.update(PendingUpdate {
            request_expand_depth: 1,
            ..PendingUpdate::default()
        });
        pending.resource = Some(ResourceOutcome::Info(ResourceInfo {
            uri: uri("ndk://stub/-/dir/example"),
            attributes: crate::metadata::ResourceAttrs::named("doc"),
            aliases: Vec::new(),
            affordances: Vec::new(),
        }));

        // Relations not expanded yet: still pending.
        assert_eq!(pending.missing_observe(), Some(Vec::new()));
        pending.relations_depth = 1;
        assert_eq!(pending.missing_observe(), None);
    }

    #[test]
    fn test_next_batch_orders_by_depth_then_mode() {
        let mut state = PendingState::new();

        state.add_action(
            &locator("ndk://stub/-/dir/shallow"),
            &load_action("ndk://stub/-/dir/shallow", 0, LoadMode::Auto),
        );
        state.add_action(
            &locator("ndk://stub/-/dir/deep"),
            &load_action("ndk://stub/-/dir/deep", 2, LoadMode::Auto),
        );
        state.add_action(
            &locator("ndk://stub/-/dir/cached"),
            &QueryAction::Load(ResourcesLoadAction {
                uri: Reference::decode("ndk://stub/-/dir/cached").unwrap(),
                expand_depth: 0,
                expand_mode: LoadMode::None,
                load_mode: LoadMode::None,
                observe: vec![Suffix::body()],
            }),
        );

        let batch = state.next_batch(10);
        // Deepest first, then refresh-capable, then cache-only.
        assert_eq!(batch[0], uri("ndk://stub/-/dir/deep"));
        assert_eq!(batch[1], uri("ndk://stub/-/dir/shallow"));
        assert_eq!(batch[2], uri("ndk://stub/-/dir/cached"));

        // The batch size caps the result.
        assert_eq!(state.next_batch(2).len(), 2);
    }

    #[test]
    fn test_relations_deduplicated() {
        let mut state = PendingState::new();
        let relation = Relation::link(
            uri("ndk://stub/-/dir/a"),
            uri("ndk://stub/-/dir/b"),
        );
        state.add_relation(relation.clone());
        state.add_relation(relation.clone());
        assert_eq!(state.relations, vec![relation]);
    }
}
