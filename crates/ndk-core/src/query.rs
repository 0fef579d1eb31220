//! The query executor: breadth-first, depth-bounded expansion across
//! resources.
//!
//! Actions fold into pending state; the executor repeatedly takes the next
//! batch of entries with outstanding work, resolves and observes them in
//! parallel, ingests the results, persists the journal, and expands
//! relations and dependencies — until no entry has missing work, then it
//! assembles the final bundle.
//!
//! Scheduling is single-threaded cooperative with structured parallelism at
//! batch boundaries: tasks in a batch are joined before any pending-state
//! mutation, so task bodies never race with it. Cancellation is checked
//! between batches; in-flight batches complete best-effort, and the final
//! bundle is not emitted.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::action::{LoadMode, QueryAction, ResourcesAttachmentAction};
use crate::bundle::{Bundle, ObservationError, Resources};
use crate::connector::{Connector, KnowledgeContext, ObservedContent, ObservedResult};
use crate::error::{Error, ErrorInfo, Result};
use crate::history::{
    Locator, MetadataDelta, ObservedDelta, ResourceDelta, ResourceHistory, ResourceView,
};
use crate::ingestion::{IngestedResult, ingest_attachment, ingest_observe_result};
use crate::metadata::{AffordanceInfo, ResourceAttrsUpdate, ResourceInfo};
use crate::pending::{
    DependencyKind, ObservedOutcome, PendingReason, PendingState, PendingUpdate, ResourceOutcome,
};
use crate::relation::Relation;
use crate::sorted::{OnConflict, sorted_insert, sorted_make, sorted_union};
use crate::uri::{KnowledgeUri, Reference, ResourceUri, Suffix};

/// A cancellation signal; the executor checks it between batches.
pub type CancelSignal = watch::Receiver<bool>;

/// Execute a list of actions to completion and assemble the result bundle.
pub async fn execute_query_all(
    context: &KnowledgeContext,
    actions: &[QueryAction],
) -> Result<Resources> {
    execute_query_all_cancellable(context, actions, None).await
}

/// Execute actions with an optional cancellation signal.
pub async fn execute_query_all_cancellable(
    context: &KnowledgeContext,
    actions: &[QueryAction],
    cancel: Option<CancelSignal>,
) -> Result<Resources> {
    let mut state = PendingState::new();

    let write_actions = convert_query_actions(context, &mut state, actions).await;
    for action in &write_actions {
        execute_write(context, &mut state, action)?;
    }

    loop {
        if cancel.as_ref().is_some_and(|signal| *signal.borrow()) {
            return Err(Error::Cancelled);
        }
        let batch = state.next_batch(context.tunables.batch_size);
        if batch.is_empty() {
            break;
        }
        debug!(batch_size = batch.len(), "executing read batch");
        execute_reads(context, &mut state, &batch).await;
    }

    Ok(state.into_resources(context))
}

///
/// Action intake
///

/// Convert actions into pending entries through the connector chain.
///
/// External references no connector resolves go to the unavailable list; a
/// connector reporting the resource unavailable produces an entry that emits
/// a resource error in the final bundle. Write actions are returned for
/// synchronous execution.
async fn convert_query_actions(
    context: &KnowledgeContext,
    state: &mut PendingState,
    actions: &[QueryAction],
) -> Vec<ResourcesAttachmentAction> {
    let mut write_actions: Vec<ResourcesAttachmentAction> = Vec::new();

    for action in actions {
        let reference = action.reference();
        let root_reference = match &reference {
            Reference::Knowledge(uri) => Reference::Knowledge(KnowledgeUri::Resource(
                uri.resource_uri(),
            )),
            Reference::External(_) => reference.clone(),
        };

        match context.try_infer_locator(&root_reference).await {
            Ok(Some(locator)) => {
                state.add_action(&locator, action);
                if let QueryAction::Attachment(attachment) = action {
                    write_actions.push(attachment.clone());
                }
            },
            Ok(None) => state.add_unavailable(root_reference),
            Err(error) => match root_reference {
                // A matching realm that cannot serve the resource still
                // yields an entry, so the caller sees the error.
                Reference::Knowledge(uri) => {
                    let locator = Locator::for_uri(&uri.resource_uri());
                    state.add_action(&locator, action);
                    state.add_error(&locator, error.as_info());
                },
                Reference::External(_) => state.add_unavailable(root_reference),
            },
        }
    }

    write_actions
}

///
/// Writes
///

/// Execute one attachment synchronously, before any read batch.
fn execute_write(
    context: &KnowledgeContext,
    state: &mut PendingState,
    action: &ResourcesAttachmentAction,
) -> Result<()> {
    let Some(resource_uri) = resolve_pending_uri(state, &action.uri) else {
        return Ok(());
    };

    let bundles = ingest_attachment(&resource_uri, action.description.as_deref(), &action.attachment);

    let affordances: Vec<AffordanceInfo> = bundles.iter().map(Bundle::info).collect();
    let delta = ResourceDelta {
        refreshed_at: Utc::now(),
        locator: None,
        metadata: MetadataDelta {
            attributes: ResourceAttrsUpdate {
                name: action.name.clone(),
                description: action.description.clone(),
                ..ResourceAttrsUpdate::default()
            },
            affordances: Some(affordances),
            ..MetadataDelta::default()
        },
        expired: Vec::new(),
        observed: bundles
            .iter()
            .map(|bundle| {
                let info = bundle.info();
                ObservedDelta {
                    suffix: bundle.uri().suffix().clone(),
                    mime_type: info.mime_type,
                    description: info.description,
                    sections: Some(info.sections),
                    observations: Some(info.observations),
                    relations: None,
                }
            })
            .collect(),
    };

    // Persist under the per-URI lock, journal first, bundles second.
    {
        let lock = context.storage.uri_lock(&resource_uri);
        let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut history = context
            .storage
            .load_resource_history(&resource_uri)?
            .unwrap_or_default();
        if history.update(delta) {
            context
                .storage
                .save_resource_history(&resource_uri, &history)?;
        }
        for bundle in &bundles {
            context.storage.save_bundle(bundle)?;
        }
    }

    let pending = state
        .results
        .get_mut(&resource_uri)
        .ok_or_else(|| Error::Internal("attachment entry missing from state".into()))?;
    for bundle in bundles {
        pending.observed.push(ObservedOutcome::Bundle(bundle));
    }
    Ok(())
}

fn resolve_pending_uri(state: &PendingState, reference: &Reference) -> Option<ResourceUri> {
    match reference {
        Reference::Knowledge(uri) => Some(uri.resource_uri()),
        Reference::External(_) => state
            .results
            .iter()
            .find(|(_, pending)| {
                pending.reason.iter().any(|reason| {
                    matches!(
                        reason,
                        PendingReason::Action(action) if action.reference() == *reference
                    )
                })
            })
            .map(|(uri, _)| uri.clone()),
    }
}

///
/// Reads
///

/// Everything one read produced for a resource.
struct QueryResult {
    metadata: MetadataDelta,
    observed: Vec<IngestedResult>,
    expired: Vec<Suffix>,
    errors: Vec<ObservationError>,
    cached_bundles: Vec<Bundle>,
    should_cache: bool,
}

/// Resolve, observe and ingest a batch in parallel; merge results back into
/// the state sequentially after the join.
async fn execute_reads(context: &KnowledgeContext, state: &mut PendingState, batch: &[ResourceUri]) {
    let subtasks = batch.iter().filter_map(|uri| {
        let pending = state.results.get(uri)?;
        Some(execute_query(
            context,
            pending.locator.clone(),
            pending.request_load_mode,
            pending.missing_observe().unwrap_or_default(),
        ))
    });

    let refreshed_at = Utc::now();
    for (locator, result) in join_all(subtasks).await {
        match result {
            Ok(result) => {
                if let Err(error) =
                    handle_query_result(context, state, &locator, refreshed_at, result).await
                {
                    warn!(uri = %locator.resource_uri, error = %error, "failed to persist query result");
                    state.add_error(&locator, error.as_info());
                }
            },
            Err(error) => {
                debug!(uri = %locator.resource_uri, error = %error, "query failed");
                state.add_error(&locator, error.as_info());
            },
        }
    }
}

/// One resource's resolve + observe + ingest pipeline.
async fn execute_query(
    context: &KnowledgeContext,
    locator: Locator,
    load_mode: LoadMode,
    observe: Vec<Suffix>,
) -> (Locator, Result<QueryResult>) {
    let result = execute_query_inner(context, &locator, load_mode, observe).await;
    (locator, result)
}

async fn execute_query_inner(
    context: &KnowledgeContext,
    locator: &Locator,
    load_mode: LoadMode,
    observe: Vec<Suffix>,
) -> Result<QueryResult> {
    let connector = context.find_connector(locator)?;
    let resource_uri = &locator.resource_uri;
    let cached = context
        .storage
        .load_resource_history(resource_uri)?
        .and_then(|history| history.merged());

    let resolved = connector.resolve(locator, cached.as_ref()).await?;

    let (observed, errors, cached_bundles) = execute_query_observe(
        context,
        connector.as_ref(),
        locator,
        load_mode,
        &observe,
        cached.as_ref(),
        &resolved,
    )
    .await?;

    execute_query_ingest(
        context,
        locator,
        cached.as_ref(),
        &resolved,
        observed,
        errors,
        cached_bundles,
    )
    .await
}

/// Read cached bundles, auto-refresh supported roots, and observe the rest.
async fn execute_query_observe(
    context: &KnowledgeContext,
    connector: &dyn Connector,
    locator: &Locator,
    load_mode: LoadMode,
    observe: &[Suffix],
    cached: Option<&ResourceView>,
    resolved: &crate::connector::ResolveResult,
) -> Result<(Vec<ObservedResult>, Vec<ObservationError>, Vec<Bundle>)> {
    let resource_uri = &locator.resource_uri;

    // Merge the resolve delta into the cached metadata.
    let (metadata, expired) = match cached {
        Some(cached) => (
            cached.metadata.with_update(&resolved.metadata),
            sorted_union(
                &sorted_make(cached.expired(), Suffix::as_suffix),
                resolved.expired.clone(),
                Suffix::as_suffix,
                OnConflict::Keep,
            ),
        ),
        None => (
            resolved.metadata.clone(),
            sorted_make(resolved.expired.iter().cloned(), Suffix::as_suffix),
        ),
    };

    // Serve from the cache where possible.
    let mut cached_bundles: Vec<Bundle> = Vec::new();
    let mut missing_observe: Vec<Suffix> = Vec::new();
    for observable in observe {
        let bundle = if load_mode == LoadMode::Force || expired.contains(observable) {
            None
        } else {
            context
                .storage
                .load_bundle(resource_uri, &observable.affordance())?
        };
        match bundle {
            Some(bundle) => {
                sorted_insert(
                    &mut cached_bundles,
                    bundle,
                    |b| b.uri().suffix().as_suffix(),
                    OnConflict::Keep,
                );
            },
            None => {
                sorted_insert(
                    &mut missing_observe,
                    observable.clone(),
                    Suffix::as_suffix,
                    OnConflict::Keep,
                );
            },
        }
    }

    let supported: Vec<Suffix> = metadata
        .affordances
        .iter()
        .flatten()
        .map(|aff| aff.suffix.clone())
        .collect();
    let already_observed: Vec<Suffix> = cached
        .map(|view| view.observed.iter().map(|o| o.suffix.clone()).collect())
        .unwrap_or_default();

    // Supported bodies and collections refresh even when not requested:
    // bodies feed descriptions and link relations, collections feed parent
    // relations.
    for auto in [Suffix::body(), Suffix::collection()] {
        if load_mode != LoadMode::None
            && supported.contains(&auto)
            && (expired.contains(&auto) || !already_observed.contains(&auto))
        {
            sorted_insert(
                &mut missing_observe,
                auto,
                Suffix::as_suffix,
                OnConflict::Keep,
            );
        }
    }

    let mut observe_results: Vec<ObservedResult> = Vec::new();
    let mut observe_errors: Vec<ObservationError> = Vec::new();
    for observable in missing_observe {
        if !supported.contains(&observable.affordance()) {
            // A requested observable the resource does not support would
            // stay missing forever; record the failure so the executor
            // converges.
            observe_errors.push(ObservationError {
                uri: resource_uri.child_observable(observable.clone()),
                error: ErrorInfo::new("bad_request", "unsupported affordance"),
            });
            continue;
        }

        match connector.observe(locator, &observable, &metadata).await {
            Ok(result) => observe_results.push(result),
            Err(error) => {
                debug!(uri = %resource_uri, observable = %observable, error = %error, "observe failed");
                observe_errors.push(ObservationError {
                    uri: resource_uri.child_observable(observable.clone()),
                    error: error.as_info(),
                });
            },
        }
    }

    Ok((observe_results, observe_errors, cached_bundles))
}

/// Ingest observe results, tracking which expirations were not refreshed.
async fn execute_query_ingest(
    context: &KnowledgeContext,
    locator: &Locator,
    cached: Option<&ResourceView>,
    resolved: &crate::connector::ResolveResult,
    observed: Vec<ObservedResult>,
    mut errors: Vec<ObservationError>,
    cached_bundles: Vec<Bundle>,
) -> Result<QueryResult> {
    let resource_uri = &locator.resource_uri;
    let mut new_expired: Vec<Suffix> =
        sorted_make(resolved.expired.iter().cloned(), Suffix::as_suffix);
    let mut metadata = cached
        .map(|view| view.metadata.clone())
        .unwrap_or_default()
        .with_update(&resolved.metadata);
    let mut ingested: Vec<IngestedResult> = Vec::new();

    for observed_result in observed {
        let observable = match &observed_result.content {
            ObservedContent::Bundle(bundle) => bundle.uri().suffix().clone(),
            ObservedContent::Fragment(_) => Suffix::body(),
        };
        new_expired.retain(|suffix| *suffix != observable);
        metadata = metadata.with_update(&observed_result.metadata);

        match ingest_observe_result(context, resource_uri, cached, &metadata, &observed_result)
            .await
        {
            Ok(result) => {
                metadata = metadata.with_update(&result.metadata);
                sorted_insert(
                    &mut ingested,
                    result,
                    |r| r.bundle.uri().to_string(),
                    OnConflict::Replace,
                );
            },
            Err(error) => {
                debug!(uri = %resource_uri, observable = %observable, error = %error, "ingestion failed");
                sorted_insert(
                    &mut errors,
                    ObservationError {
                        uri: resource_uri.child_observable(observable),
                        error: error.as_info(),
                    },
                    |e| e.uri.to_string(),
                    OnConflict::Keep,
                );
            },
        }
    }

    Ok(QueryResult {
        metadata,
        observed: ingested,
        expired: new_expired,
        errors,
        cached_bundles,
        should_cache: resolved.should_cache,
    })
}

///
/// Result handling
///

/// Persist the result, update the pending entry, then expand relations and
/// dependencies.
async fn handle_query_result(
    context: &KnowledgeContext,
    state: &mut PendingState,
    locator: &Locator,
    refreshed_at: DateTime<Utc>,
    result: QueryResult,
) -> Result<()> {
    let new_view = save_resource(context, locator, refreshed_at, &result)?;

    let resource_uri = locator.resource_uri.clone();
    let pending = state.result(locator);
    pending.resource = Some(ResourceOutcome::Info(ResourceInfo {
        uri: resource_uri.clone(),
        attributes: new_view.attributes(),
        aliases: new_view.aliases(),
        affordances: new_view.affordances(),
    }));
    for ingest in &result.observed {
        pending
            .observed
            .push(ObservedOutcome::Bundle(ingest.bundle.clone()));
        pending.labels.extend(ingest.labels.clone());
    }
    for bundle in &result.cached_bundles {
        pending.observed.push(ObservedOutcome::Bundle(bundle.clone()));
    }
    for error in &result.errors {
        pending.observed.push(ObservedOutcome::Error(error.clone()));
    }

    expand_relations(context, state, &resource_uri).await?;

    let mut bundles: Vec<Bundle> = result.cached_bundles.clone();
    bundles.extend(result.observed.iter().map(|ingest| ingest.bundle.clone()));
    for bundle in &bundles {
        expand_dependencies(context, state, &resource_uri, bundle).await;
    }

    Ok(())
}

/// Append the delta to the journal and reconcile aliases and relations.
fn save_resource(
    context: &KnowledgeContext,
    locator: &Locator,
    refreshed_at: DateTime<Utc>,
    result: &QueryResult,
) -> Result<ResourceView> {
    let resource_uri = &locator.resource_uri;
    let delta = ResourceDelta {
        refreshed_at,
        locator: Some(locator.clone()),
        metadata: result.metadata.clone(),
        expired: result.expired.clone(),
        observed: result
            .observed
            .iter()
            .map(|ingest| ingest.observed.clone())
            .collect(),
    };

    let lock = context.storage.uri_lock(resource_uri);
    let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

    let old_history = context.storage.load_resource_history(resource_uri)?;
    let old_view = old_history.as_ref().and_then(ResourceHistory::merged);
    let should_persist = old_history.is_some()
        || result.should_cache
        || result.observed.iter().any(|ingest| ingest.should_cache);

    let mut new_history = old_history.unwrap_or_default();
    let changed = new_history.update(delta);
    let new_view = new_history
        .merged()
        .ok_or_else(|| Error::Internal("merged view missing after update".into()))?;

    if should_persist {
        if changed {
            context
                .storage
                .save_resource_history(resource_uri, &new_history)?;
        }
        // The locator can now be read from the cached metadata.
        context.storage.remove_alias(&resource_uri.to_string())?;
    } else {
        // Nothing cached: keep only an alias from the URI to the locator.
        context
            .storage
            .save_alias(&resource_uri.to_string(), locator)?;
        return Ok(new_view);
    }

    // Persist the bundles marked cacheable, plus their derived files.
    for ingest in &result.observed {
        if ingest.should_cache {
            context.storage.save_bundle(&ingest.bundle)?;
            for file in &ingest.derived {
                context.storage.save_bundle(&Bundle::File(file.clone()))?;
            }
        }
    }

    // Reconcile aliases.
    let old_aliases: Vec<String> = old_view
        .as_ref()
        .map(|view| view.aliases().iter().map(ToString::to_string).collect())
        .unwrap_or_default();
    let new_aliases: Vec<String> = new_view.aliases().iter().map(ToString::to_string).collect();
    for alias in &new_aliases {
        context.storage.save_alias(alias, locator)?;
    }
    for alias in &old_aliases {
        if !new_aliases.contains(alias) {
            context.storage.remove_alias(alias)?;
        }
    }

    // Reconcile relations by unique id.
    let old_relations = old_view.map(|view| view.relations()).unwrap_or_default();
    let new_relations = new_view.relations();
    let new_ids: Vec<String> = new_relations.iter().map(Relation::unique_id).collect();
    for relation in &old_relations {
        if !new_ids.contains(&relation.unique_id()) {
            context.storage.remove_relation(relation)?;
        }
    }
    let old_ids: Vec<String> = old_relations.iter().map(Relation::unique_id).collect();
    for relation in &new_relations {
        if !old_ids.contains(&relation.unique_id()) {
            context.storage.save_relation(relation)?;
        }
    }

    Ok(new_view)
}

///
/// Expansion
///

/// Load the metadata of related resources, one hop shallower.
async fn expand_relations(
    context: &KnowledgeContext,
    state: &mut PendingState,
    resource_uri: &ResourceUri,
) -> Result<()> {
    let (request_expand_depth, request_expand_mode, relations_depth) = {
        let Some(pending) = state.results.get(resource_uri) else {
            return Ok(());
        };
        (
            pending.request_expand_depth,
            pending.request_expand_mode,
            pending.relations_depth,
        )
    };
    if request_expand_depth == 0 || relations_depth >= request_expand_depth {
        return Ok(());
    }

    let relations = context.storage.list_relations(resource_uri)?;
    for relation in relations {
        let relation_id = relation.unique_id();

        // Only relations whose far end resolves are recorded; silently
        // discarding the rest avoids leaking inaccessible resources.
        let mut resolved_any = false;
        for node in relation.nodes() {
            if node == *resource_uri {
                continue;
            }
            let reference = Reference::from(node);
            match context.try_infer_locator(&reference).await {
                Ok(Some(locator)) => {
                    resolved_any = true;
                    let dep_pending = state.result(&locator);
                    dep_pending.update(PendingUpdate {
                        reason: Some(PendingReason::Relation(relation_id.clone())),
                        request_expand_depth: request_expand_depth.saturating_sub(1),
                        request_expand_mode,
                        request_load_mode: request_expand_mode,
                        request_observe: Vec::new(),
                    });
                },
                Ok(None) => {},
                Err(error) => {
                    debug!(reference = %reference, error = %error, "relation target unavailable");
                },
            }
        }
        if resolved_any {
            state.add_relation(relation);
        }
    }

    if let Some(pending) = state.results.get_mut(resource_uri) {
        pending.relations_depth = request_expand_depth;
    }
    Ok(())
}

/// Queue follow-up reads for a bundle's links and embeds.
///
/// Collection children expand recursively like relations; other links are
/// only resolved (there is usually a reason they are not relations); embeds
/// observe their body with the inherited load mode.
async fn expand_dependencies(
    context: &KnowledgeContext,
    state: &mut PendingState,
    resource_uri: &ResourceUri,
    bundle: &Bundle,
) {
    let (request_expand_depth, request_expand_mode, request_load_mode) = {
        let Some(pending) = state.results.get(resource_uri) else {
            return;
        };
        (
            pending.request_expand_depth,
            pending.request_expand_mode,
            pending.request_load_mode,
        )
    };

    let observations = bundle.observations();
    let dependencies: Vec<Reference> = observations
        .iter()
        .flat_map(crate::observation::Observation::dependencies)
        .map(|reference| root_reference(&reference))
        .collect();
    let embeds: Vec<Reference> = observations
        .iter()
        .flat_map(crate::observation::Observation::embeds)
        .map(|reference| root_reference(&reference))
        .collect();

    let all: Vec<Reference> = sorted_make(
        dependencies.iter().chain(&embeds).cloned(),
        ToString::to_string,
    );
    let locators = context.try_infer_locators(&all).await;

    let origin = bundle.uri().resource_uri().clone();
    let is_collection = matches!(bundle, Bundle::Collection(_));

    for dependency in dependencies {
        let Some(locator) = locators.get(&dependency.to_string()) else {
            continue;
        };
        let dep_pending = state.result(locator);
        if is_collection {
            dep_pending.update(PendingUpdate {
                reason: Some(PendingReason::Dependency {
                    kind: DependencyKind::Collection,
                    origin: origin.clone(),
                }),
                request_expand_depth: request_expand_depth.saturating_sub(1),
                request_expand_mode,
                request_load_mode: request_expand_mode,
                request_observe: vec![Suffix::collection()],
            });
        } else {
            dep_pending.update(PendingUpdate {
                reason: Some(PendingReason::Dependency {
                    kind: DependencyKind::Link,
                    origin: origin.clone(),
                }),
                ..PendingUpdate::default()
            });
        }
    }

    for embed in embeds {
        let Some(locator) = locators.get(&embed.to_string()) else {
            continue;
        };
        // Skip embeds pointing back into the origin, e.g. a body's own
        // chunks.
        if locator.resource_uri == origin {
            continue;
        }
        let dep_pending = state.result(locator);
        dep_pending.update(PendingUpdate {
            reason: Some(PendingReason::Dependency {
                kind: DependencyKind::Embed,
                origin: origin.clone(),
            }),
            request_expand_depth: 0,
            request_expand_mode,
            request_load_mode,
            request_observe: vec![Suffix::body()],
        });
    }
}

/// Collapse an observable reference to its root (`$chunk/01` → `$body`).
fn root_reference(reference: &Reference) -> Reference {
    match reference {
        Reference::Knowledge(KnowledgeUri::Observable(uri)) => {
            Reference::Knowledge(KnowledgeUri::Observable(uri.root_uri()))
        },
        other => other.clone(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_root_reference_collapses_observables() {
        let chunk = Reference::decode("ndk://stub/-/dir/example/$chunk/01").unwrap();
        assert_eq!(
            root_reference(&chunk).to_string(),
            "ndk://stub/-/dir/example/$body"
        );

        let resource = Reference::decode("ndk://stub/-/dir/example").unwrap();
        assert_eq!(root_reference(&resource), resource);

        let external = Reference::decode("https://example.com/x").unwrap();
        assert_eq!(root_reference(&external), external);
    }
}
