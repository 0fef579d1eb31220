//! Resource history: an append-only journal of deltas per resource, plus
//! the merged view derived from it.
//!
//! Every refresh appends a complete [`ResourceDelta`]; nothing is ever
//! rewritten in place, so partial persisted state stays consistent. The
//! merged view is a left fold: each delta's metadata update overwrites only
//! its set fields, aliases accumulate, affordance and relation lists are
//! replaced whole when supplied, and observed sub-records overlay by
//! observable suffix.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::{
    AffordanceInfo, ObservationInfo, ObservationSection, ResourceAttrs, ResourceAttrsUpdate,
};
use crate::data::MimeType;
use crate::relation::Relation;
use crate::sorted::{OnConflict, sorted_insert, sorted_make};
use crate::uri::{Realm, ResourceUri, Suffix, WebUrl};

///
/// Locator
///

/// A connector-specific handle identifying how to fetch a resource.
///
/// Distinct from the resource URI, which is the stable identity: the locator
/// carries whatever the owning connector needs to reach the source system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Locator {
    /// The realm whose connector owns this locator.
    pub realm: Realm,
    /// The stable identity the locator resolves for.
    pub resource_uri: ResourceUri,
    /// Connector-specific parameters.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl Locator {
    /// A locator with no connector parameters.
    #[must_use]
    pub fn new(realm: Realm, resource_uri: ResourceUri) -> Self {
        Self {
            realm,
            resource_uri,
            params: serde_json::Map::new(),
        }
    }

    /// A locator for a resource URI, using the URI's realm.
    #[must_use]
    pub fn for_uri(resource_uri: &ResourceUri) -> Self {
        Self::new(resource_uri.realm().clone(), resource_uri.clone())
    }
}

///
/// Deltas
///

/// The metadata fields changed by a resolve or observe call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataDelta {
    /// Attribute changes; only set fields overwrite.
    #[serde(flatten)]
    pub attributes: ResourceAttrsUpdate,
    /// External aliases; accumulated across deltas.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<WebUrl>>,
    /// Supported affordances; replaced whole when supplied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affordances: Option<Vec<AffordanceInfo>>,
    /// Relations; replaced whole when supplied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relations: Option<Vec<Relation>>,
}

impl MetadataDelta {
    /// Merge another delta on top of this one; the other's set fields win,
    /// except aliases which accumulate.
    #[must_use]
    pub fn with_update(&self, other: &Self) -> Self {
        Self {
            attributes: ResourceAttrsUpdate {
                name: other.attributes.name.clone().or_else(|| self.attributes.name.clone()),
                mime_type: other
                    .attributes
                    .mime_type
                    .clone()
                    .or_else(|| self.attributes.mime_type.clone()),
                description: other
                    .attributes
                    .description
                    .clone()
                    .or_else(|| self.attributes.description.clone()),
                citation_url: other
                    .attributes
                    .citation_url
                    .clone()
                    .or_else(|| self.attributes.citation_url.clone()),
                created_at: other.attributes.created_at.or(self.attributes.created_at),
                updated_at: other.attributes.updated_at.or(self.attributes.updated_at),
                revision_data: other
                    .attributes
                    .revision_data
                    .clone()
                    .or_else(|| self.attributes.revision_data.clone()),
                revision_meta: other
                    .attributes
                    .revision_meta
                    .clone()
                    .or_else(|| self.attributes.revision_meta.clone()),
            },
            aliases: match (&self.aliases, &other.aliases) {
                (Some(mine), Some(theirs)) => Some(sorted_make(
                    mine.iter().chain(theirs).cloned(),
                    ToString::to_string,
                )),
                (mine, theirs) => theirs.clone().or_else(|| mine.clone()),
            },
            affordances: other
                .affordances
                .clone()
                .or_else(|| self.affordances.clone()),
            relations: other.relations.clone().or_else(|| self.relations.clone()),
        }
    }

    /// Whether the delta carries no change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
            && self.aliases.is_none()
            && self.affordances.is_none()
            && self.relations.is_none()
    }
}

/// What a single observe call recorded about one root observable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedDelta {
    /// The observed root observable.
    pub suffix: Suffix,
    /// MIME type of the observed content, when binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<MimeType>,
    /// Description of the observed content, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Table-of-contents sections, when the observation has children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sections: Option<Vec<ObservationSection>>,
    /// Child observation summaries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observations: Option<Vec<ObservationInfo>>,
    /// Relations recorded during this observation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relations: Option<Vec<Relation>>,
}

impl ObservedDelta {
    /// A bare record that the suffix was observed.
    #[must_use]
    pub const fn bare(suffix: Suffix) -> Self {
        Self {
            suffix,
            mime_type: None,
            description: None,
            sections: None,
            observations: None,
            relations: None,
        }
    }
}

/// One append-only journal entry for a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDelta {
    /// When the refresh producing this delta ran.
    pub refreshed_at: DateTime<Utc>,
    /// The locator, typically set when the resource is first resolved;
    /// changes for the same resource URI are supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<Locator>,
    /// The metadata fields that changed.
    #[serde(default, skip_serializing_if = "MetadataDelta::is_empty")]
    pub metadata: MetadataDelta,
    /// Root observations whose cache expired and were not refreshed in this
    /// request; they should be read again on the next one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expired: Vec<Suffix>,
    /// Root observations refreshed in this request.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub observed: Vec<ObservedDelta>,
}

impl ResourceDelta {
    /// Whether the delta changes anything worth journaling.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locator.is_none()
            && self.metadata.is_empty()
            && self.expired.is_empty()
            && self.observed.is_empty()
    }
}

///
/// History and merged view
///

/// The journal of deltas for one resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceHistory {
    /// The deltas, oldest first.
    pub history: Vec<ResourceDelta>,
}

impl ResourceHistory {
    /// A journal holding one delta.
    #[must_use]
    pub fn new(delta: ResourceDelta) -> Self {
        Self {
            history: vec![delta],
        }
    }

    /// Append a delta; returns whether the journal changed.
    pub fn update(&mut self, delta: ResourceDelta) -> bool {
        if delta.is_empty() {
            return false;
        }
        self.history.push(delta);
        true
    }

    /// The merged view: a left fold over the journal.
    #[must_use]
    pub fn merged(&self) -> Option<ResourceView> {
        let mut locator: Option<Locator> = None;
        let mut metadata = MetadataDelta::default();
        let mut observed: Vec<ObservedView> = Vec::new();

        for delta in &self.history {
            if let Some(delta_locator) = &delta.locator {
                locator = Some(delta_locator.clone());
            }
            metadata = metadata.with_update(&delta.metadata);

            for suffix in &delta.expired {
                let view = observed_entry(&mut observed, suffix);
                view.expired = true;
            }
            for observed_delta in &delta.observed {
                let view = observed_entry(&mut observed, &observed_delta.suffix);
                view.expired = false;
                if let Some(mime_type) = &observed_delta.mime_type {
                    view.mime_type = Some(mime_type.clone());
                }
                if let Some(description) = &observed_delta.description {
                    view.description = Some(description.clone());
                }
                if let Some(sections) = &observed_delta.sections {
                    view.sections.clone_from(sections);
                }
                if let Some(observations) = &observed_delta.observations {
                    view.observations.clone_from(observations);
                }
                if let Some(relations) = &observed_delta.relations {
                    view.relations.clone_from(relations);
                }
            }
        }

        Some(ResourceView {
            locator: locator?,
            metadata,
            observed,
        })
    }
}

fn observed_entry<'a>(observed: &'a mut Vec<ObservedView>, suffix: &Suffix) -> &'a mut ObservedView {
    if let Some(index) = observed.iter().position(|view| view.suffix == *suffix) {
        return &mut observed[index];
    }
    let view = ObservedView {
        suffix: suffix.clone(),
        expired: false,
        mime_type: None,
        description: None,
        sections: Vec::new(),
        observations: Vec::new(),
        relations: Vec::new(),
    };
    sorted_insert(observed, view, |v| v.suffix.as_suffix(), OnConflict::Keep);
    let index = observed
        .iter()
        .position(|view| view.suffix == *suffix)
        .unwrap_or_else(|| unreachable!("just inserted"));
    &mut observed[index]
}

/// The merged record for one observed root observable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedView {
    /// The observed root observable.
    pub suffix: Suffix,
    /// Whether the cached bundle is stale and must be re-read.
    pub expired: bool,
    /// MIME type of the observed content, when binary.
    pub mime_type: Option<MimeType>,
    /// Description of the observed content, when known.
    pub description: Option<String>,
    /// Table-of-contents sections.
    pub sections: Vec<ObservationSection>,
    /// Child observation summaries.
    pub observations: Vec<ObservationInfo>,
    /// Relations recorded by observations of this root.
    pub relations: Vec<Relation>,
}

/// The merged state of a resource, derived from its history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceView {
    /// The most recent locator.
    pub locator: Locator,
    /// The folded metadata.
    pub metadata: MetadataDelta,
    /// Per-root observed records, sorted by suffix.
    pub observed: Vec<ObservedView>,
}

impl ResourceView {
    /// The resource identity.
    #[must_use]
    pub const fn resource_uri(&self) -> &ResourceUri {
        &self.locator.resource_uri
    }

    /// The folded attributes; the name falls back to the last path
    /// component of the resource URI.
    #[must_use]
    pub fn attributes(&self) -> ResourceAttrs {
        let fallback_name = self
            .locator
            .resource_uri
            .guess_filename()
            .map_or_else(|| self.locator.resource_uri.to_string(), |f| f.to_string());
        self.metadata
            .attributes
            .apply(&ResourceAttrs::named(&fallback_name))
    }

    /// The accumulated aliases, sorted.
    #[must_use]
    pub fn aliases(&self) -> Vec<WebUrl> {
        self.metadata.aliases.clone().unwrap_or_default()
    }

    /// The supported affordances, enriched with the observed descriptions,
    /// sections and observation summaries.
    #[must_use]
    pub fn affordances(&self) -> Vec<AffordanceInfo> {
        let mut affordances: Vec<AffordanceInfo> = self
            .metadata
            .affordances
            .clone()
            .unwrap_or_default();

        for view in &self.observed {
            let suffix = view.suffix.affordance();
            let index = match affordances.iter().position(|aff| aff.suffix == suffix) {
                Some(index) => index,
                None => {
                    affordances.push(AffordanceInfo::bare(suffix));
                    affordances.len() - 1
                },
            };
            let affordance = &mut affordances[index];
            if affordance.mime_type.is_none() {
                affordance.mime_type.clone_from(&view.mime_type);
            }
            if affordance.description.is_none() {
                affordance.description.clone_from(&view.description);
            }
            if !view.sections.is_empty() {
                affordance.sections.clone_from(&view.sections);
            }
            if !view.observations.is_empty() {
                affordance.observations.clone_from(&view.observations);
            }
        }

        affordances.sort_by_key(|aff| aff.suffix.as_suffix());
        affordances
    }

    /// All relations, deduplicated by unique id and sorted.
    #[must_use]
    pub fn relations(&self) -> Vec<Relation> {
        sorted_make(
            self.metadata
                .relations
                .iter()
                .flatten()
                .chain(self.observed.iter().flat_map(|view| view.relations.iter()))
                .cloned(),
            Relation::unique_id,
        )
    }

    /// The observables currently flagged expired.
    #[must_use]
    pub fn expired(&self) -> Vec<Suffix> {
        self.observed
            .iter()
            .filter(|view| view.expired)
            .map(|view| view.suffix.clone())
            .collect()
    }

    /// The observed record for a suffix, when any.
    #[must_use]
    pub fn observed_view(&self, suffix: &Suffix) -> Option<&ObservedView> {
        self.observed.iter().find(|view| view.suffix == *suffix)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn uri() -> ResourceUri {
        ResourceUri::decode("ndk://stub/-/dir/example").unwrap()
    }

    fn delta_at(minute: u32) -> ResourceDelta {
        ResourceDelta {
            refreshed_at: chrono::DateTime::parse_from_rfc3339(&format!(
                "2024-01-01T00:{minute:02}:00Z"
            ))
            .unwrap()
            .with_timezone(&Utc),
            locator: None,
            metadata: MetadataDelta::default(),
            expired: Vec::new(),
            observed: Vec::new(),
        }
    }

    fn alias(value: &str) -> WebUrl {
        WebUrl::decode(value).unwrap()
    }

    #[test]
    fn test_merge_overwrites_only_set_fields() {
        let mut history = ResourceHistory::default();
        history.update(ResourceDelta {
            locator: Some(Locator::for_uri(&uri())),
            metadata: MetadataDelta {
                attributes: ResourceAttrsUpdate {
                    name: Some("first".into()),
                    description: Some("original description".into()),
                    ..ResourceAttrsUpdate::default()
                },
                ..MetadataDelta::default()
            },
            ..delta_at(0)
        });
        history.update(ResourceDelta {
            metadata: MetadataDelta {
                attributes: ResourceAttrsUpdate {
                    name: Some("renamed".into()),
                    ..ResourceAttrsUpdate::default()
                },
                ..MetadataDelta::default()
            },
            ..delta_at(1)
        });

        let view = history.merged().unwrap();
        let attrs = view.attributes();
        assert_eq!(attrs.name, "renamed");
        assert_eq!(attrs.description.as_deref(), Some("original description"));
    }

    #[test]
    fn test_merge_accumulates_aliases() {
        let mut history = ResourceHistory::default();
        history.update(ResourceDelta {
            locator: Some(Locator::for_uri(&uri())),
            metadata: MetadataDelta {
                aliases: Some(vec![alias("https://example.com/a")]),
                ..MetadataDelta::default()
            },
            ..delta_at(0)
        });
        history.update(ResourceDelta {
            metadata: MetadataDelta {
                aliases: Some(vec![alias("https://example.com/b")]),
                ..MetadataDelta::default()
            },
            ..delta_at(1)
        });

        let aliases = history.merged().unwrap().aliases();
        assert_eq!(aliases.len(), 2);
    }

    #[test]
    fn test_merge_replaces_affordances_whole() {
        let mut history = ResourceHistory::default();
        history.update(ResourceDelta {
            locator: Some(Locator::for_uri(&uri())),
            metadata: MetadataDelta {
                affordances: Some(vec![
                    AffordanceInfo::bare(Suffix::body()),
                    AffordanceInfo::bare(Suffix::plain()),
                ]),
                ..MetadataDelta::default()
            },
            ..delta_at(0)
        });
        history.update(ResourceDelta {
            metadata: MetadataDelta {
                affordances: Some(vec![AffordanceInfo::bare(Suffix::body())]),
                ..MetadataDelta::default()
            },
            ..delta_at(1)
        });

        let affordances = history.merged().unwrap().affordances();
        assert_eq!(affordances.len(), 1);
        assert_eq!(affordances[0].suffix, Suffix::body());
    }

    #[test]
    fn test_expired_cleared_by_later_observation() {
        let mut history = ResourceHistory::default();
        history.update(ResourceDelta {
            locator: Some(Locator::for_uri(&uri())),
            expired: vec![Suffix::body()],
            ..delta_at(0)
        });

        let view = history.merged().unwrap();
        assert_eq!(view.expired(), vec![Suffix::body()]);

        history.update(ResourceDelta {
            observed: vec![ObservedDelta::bare(Suffix::body())],
            ..delta_at(1)
        });
        let view = history.merged().unwrap();
        assert!(view.expired().is_empty());
        assert!(view.observed_view(&Suffix::body()).is_some());
    }

    #[test]
    fn test_observed_overlay_by_suffix() {
        let mut history = ResourceHistory::default();
        history.update(ResourceDelta {
            locator: Some(Locator::for_uri(&uri())),
            observed: vec![ObservedDelta {
                description: Some("first".into()),
                sections: Some(vec![ObservationSection::new_body(&[0], Some("A"))]),
                ..ObservedDelta::bare(Suffix::body())
            }],
            ..delta_at(0)
        });
        history.update(ResourceDelta {
            observed: vec![ObservedDelta {
                description: Some("second".into()),
                ..ObservedDelta::bare(Suffix::body())
            }],
            ..delta_at(1)
        });

        let view = history.merged().unwrap();
        let observed = view.observed_view(&Suffix::body()).unwrap();
        // The description was overlaid, the sections kept.
        assert_eq!(observed.description.as_deref(), Some("second"));
        assert_eq!(observed.sections.len(), 1);
    }

    #[test]
    fn test_relations_deduplicated_by_unique_id() {
        let other = ResourceUri::decode("ndk://stub/-/dir/other").unwrap();
        let relation = Relation::link(uri(), other);

        let mut history = ResourceHistory::default();
        history.update(ResourceDelta {
            locator: Some(Locator::for_uri(&uri())),
            metadata: MetadataDelta {
                relations: Some(vec![relation.clone()]),
                ..MetadataDelta::default()
            },
            observed: vec![ObservedDelta {
                relations: Some(vec![relation.clone()]),
                ..ObservedDelta::bare(Suffix::body())
            }],
            ..delta_at(0)
        });

        assert_eq!(history.merged().unwrap().relations(), vec![relation]);
    }

    #[test]
    fn test_empty_delta_not_journaled() {
        let mut history = ResourceHistory::default();
        assert!(!history.update(delta_at(0)));
        assert!(history.history.is_empty());
        assert!(history.merged().is_none());
    }

    #[test]
    fn test_history_yaml_round_trip() {
        let mut history = ResourceHistory::default();
        history.update(ResourceDelta {
            locator: Some(Locator::for_uri(&uri())),
            metadata: MetadataDelta {
                attributes: ResourceAttrsUpdate {
                    name: Some("doc".into()),
                    ..ResourceAttrsUpdate::default()
                },
                aliases: Some(vec![alias("https://example.com/doc")]),
                ..MetadataDelta::default()
            },
            expired: vec![Suffix::collection()],
            observed: vec![ObservedDelta::bare(Suffix::body())],
            ..delta_at(0)
        });

        let yaml = serde_yaml::to_string(&history).unwrap();
        let back: ResourceHistory = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, history);
    }
}
