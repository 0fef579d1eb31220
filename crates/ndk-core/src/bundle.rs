//! Bundles: the persisted content of one affordance, and the assembled
//! `Resources` response returned to agents.
//!
//! ## Invariants
//!
//! - A body bundle's chunks and sections are sorted by index path (radix
//!   order on two-digit components).
//! - A body bundle's media list is restricted to media referenced by at
//!   least one chunk's embed dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::{ContentBlob, ContentText, LinkMode, TextPart};
use crate::data::{FileName, MimeType};
use crate::error::ErrorInfo;
use crate::label::{ResourceLabel, ResourceLabels};
use crate::metadata::{
    AffordanceInfo, ObservationInfo, ObservationSection, ResourceAttrs, ResourceAttrsUpdate,
    ResourceInfo,
};
use crate::observation::{
    BodyContent, DownloadUrl, ObsBody, ObsBodyChunk, ObsBodySection, ObsChunk, ObsCollection,
    ObsFile, ObsMedia, ObsPlain, Observation,
};
use crate::relation::Relation;
use crate::sorted::{OnConflict, sorted_find, sorted_insert, sorted_make};
use crate::uri::{
    AffordanceUri, KnowledgeUri, ObservableUri, Reference, ResourceUri, Suffix, SuffixKind,
    WebUrl,
};

///
/// Body bundle
///

/// The persisted `$body` of a resource: chunks, sections and media.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleBody {
    /// The affordance URI (`…/$body`).
    pub uri: AffordanceUri,
    /// Generated or provided description.
    pub description: Option<String>,
    /// Table-of-contents sections, sorted by index path.
    pub sections: Vec<ObsBodySection>,
    /// The chunks, sorted by index path.
    pub chunks: Vec<ObsChunk>,
    /// Media referenced by the chunks, sorted by suffix.
    pub media: Vec<ObsMedia>,
}

impl BundleBody {
    /// Build a body bundle, enforcing the sorting and media invariants.
    #[must_use]
    pub fn new(
        resource_uri: &ResourceUri,
        description: Option<String>,
        sections: Vec<ObsBodySection>,
        chunks: Vec<ObsChunk>,
        media: Vec<ObsMedia>,
    ) -> Self {
        // Keep only media that some chunk embeds.
        let media = if media.is_empty() {
            media
        } else {
            let used_media: Vec<String> = chunks
                .iter()
                .flat_map(|chunk| chunk.text.dep_embeds())
                .filter_map(|reference| match reference {
                    Reference::Knowledge(uri) => match (uri.resource_uri(), uri.suffix()) {
                        (resource, Some(suffix))
                            if resource == *resource_uri
                                && suffix.kind() == SuffixKind::Media =>
                        {
                            Some(suffix.path_str())
                        },
                        _ => None,
                    },
                    Reference::External(_) => None,
                })
                .collect();
            let mut kept: Vec<ObsMedia> = media
                .into_iter()
                .filter(|m| used_media.contains(&m.uri.suffix().path_str()))
                .collect();
            kept.sort_by_key(|m| m.uri.suffix().as_suffix());
            kept
        };

        let mut sections = sections;
        sections.sort_by_key(ObsBodySection::indexes_str);
        let mut chunks = chunks;
        chunks.sort_by_key(|chunk| chunk.uri.suffix().as_suffix());

        Self {
            uri: resource_uri.child_affordance(Suffix::body()),
            description,
            sections,
            chunks,
            media,
        }
    }

    /// A body holding one root chunk.
    #[must_use]
    pub fn make_single(
        resource_uri: &ResourceUri,
        text: ContentText,
        media: Vec<ObsMedia>,
        description: Option<String>,
    ) -> Self {
        Self::new(
            resource_uri,
            None,
            Vec::new(),
            vec![ObsChunk::new(resource_uri, &[], text, description)],
            media,
        )
    }

    /// A body that is a single embedded media.
    #[must_use]
    pub fn make_media(
        resource_uri: &ResourceUri,
        mime_type: MimeType,
        blob: String,
        description: Option<String>,
        placeholder: Option<String>,
    ) -> Self {
        let media = ObsMedia::new(
            resource_uri,
            Vec::new(),
            mime_type,
            blob,
            description,
            placeholder,
        );
        let body_text = ContentText::new(vec![TextPart::link(
            LinkMode::Embed,
            None,
            media.uri.clone().into(),
        )]);
        Self {
            uri: resource_uri.child_affordance(Suffix::body()),
            description: None,
            sections: Vec::new(),
            chunks: vec![ObsChunk::new(resource_uri, &[], body_text, None)],
            media: vec![media],
        }
    }

    /// Sorted embeds pointing outside this resource.
    #[must_use]
    pub fn dep_embeds(&self) -> Vec<Reference> {
        sorted_make(
            self.chunks.iter().flat_map(ObsChunk::embeds),
            ToString::to_string,
        )
    }

    /// Sorted non-embed links pointing outside this resource.
    #[must_use]
    pub fn dep_links(&self) -> Vec<Reference> {
        sorted_make(
            self.chunks.iter().flat_map(ObsChunk::dependencies),
            ToString::to_string,
        )
    }

    /// Whether the body is one chunk embedding exactly its one media.
    fn is_pure_media(&self) -> bool {
        self.sections.is_empty()
            && self.chunks.len() == 1
            && self.media.len() == 1
            && self.chunks[0]
                .text
                .only_embed()
                .is_some_and(|embed| *embed == Reference::from(self.media[0].uri.clone()))
    }

    /// The affordance summary.
    ///
    /// Includes the chunk list so agents can consult chunks directly, but
    /// omits media. Given a single chunk, its description is reused; given a
    /// pure-media body, the media's MIME type and description are preferred.
    #[must_use]
    pub fn info(&self) -> AffordanceInfo {
        if self.sections.is_empty() && self.chunks.len() == 1 {
            let mut mime_type: Option<MimeType> = None;
            let mut description = self
                .description
                .clone()
                .or_else(|| self.chunks[0].description.clone());

            if self.is_pure_media() {
                mime_type = Some(self.media[0].mime_type.clone());
                if description.is_none() {
                    description.clone_from(&self.media[0].description);
                }
            }

            return AffordanceInfo {
                suffix: self.uri.suffix().clone(),
                mime_type,
                description,
                sections: Vec::new(),
                observations: Vec::new(),
            };
        }

        AffordanceInfo {
            suffix: self.uri.suffix().clone(),
            mime_type: None,
            description: self.description.clone(),
            sections: self
                .sections
                .iter()
                .map(|section| {
                    ObservationSection::new_body(&section.indexes, section.heading.as_deref())
                })
                .collect(),
            observations: self
                .chunks
                .iter()
                .map(|chunk| ObservationInfo {
                    suffix: chunk.uri.suffix().clone(),
                    num_tokens: Some(chunk.num_tokens()),
                    mime_type: None,
                    description: chunk.description.clone(),
                })
                .collect(),
        }
    }

    /// Project the bundle into agent-facing observations.
    ///
    /// A pure-media body becomes one blob-content body; a single-chunk body
    /// becomes one text-content body; otherwise the body is a table of
    /// contents plus one observation per chunk and media.
    #[must_use]
    pub fn observations(&self) -> Vec<Observation> {
        let body_uri = self
            .uri
            .resource_uri()
            .child_observable(self.uri.suffix().clone());

        if self.is_pure_media() {
            let media = &self.media[0];
            return vec![Observation::Body(ObsBody {
                uri: body_uri.clone(),
                description: media
                    .description
                    .clone()
                    .or_else(|| self.chunks[0].description.clone())
                    .or_else(|| self.description.clone()),
                content: Some(BodyContent::Blob(ContentBlob {
                    uri: body_uri.into(),
                    placeholder: media.placeholder.clone(),
                    mime_type: media.mime_type.clone(),
                    blob: media.blob.clone(),
                })),
                sections: Vec::new(),
                chunks: Vec::new(),
            })];
        }

        let obs_media: Vec<Observation> = self
            .media
            .iter()
            .cloned()
            .map(Observation::Media)
            .collect();

        if self.sections.is_empty() && self.chunks.len() == 1 {
            let mut result = vec![Observation::Body(ObsBody {
                uri: body_uri,
                description: self.chunks[0]
                    .description
                    .clone()
                    .or_else(|| self.description.clone()),
                content: Some(BodyContent::Text(self.chunks[0].text.clone())),
                sections: Vec::new(),
                chunks: Vec::new(),
            })];
            result.extend(obs_media);
            return result;
        }

        let obs_body = Observation::Body(ObsBody {
            uri: body_uri,
            description: self.description.clone(),
            content: None,
            sections: self.sections.clone(),
            chunks: self
                .chunks
                .iter()
                .map(|chunk| ObsBodyChunk {
                    indexes: chunk.uri.suffix().chunk_indexes(),
                    description: chunk.description.clone(),
                    num_tokens: chunk.num_tokens(),
                })
                .collect(),
        });
        let obs_chunks = self.chunks.iter().cloned().map(Observation::Chunk);

        std::iter::once(obs_body)
            .chain(obs_chunks)
            .chain(obs_media)
            .collect()
    }
}

///
/// Other bundles
///

/// The persisted `$collection` of a resource: its children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleCollection {
    /// The affordance URI (`…/$collection`).
    pub uri: AffordanceUri,
    /// Child resource URIs.
    pub results: Vec<ResourceUri>,
}

impl BundleCollection {
    /// Build a collection bundle.
    #[must_use]
    pub fn new(resource_uri: &ResourceUri, results: Vec<ResourceUri>) -> Self {
        Self {
            uri: resource_uri.child_affordance(Suffix::collection()),
            results,
        }
    }

    /// Project into the collection observation.
    #[must_use]
    pub fn observations(&self) -> Vec<Observation> {
        vec![Observation::Collection(ObsCollection {
            uri: self
                .uri
                .resource_uri()
                .child_observable(self.uri.suffix().clone()),
            description: None,
            results: self.results.clone(),
        })]
    }
}

/// The persisted `$file` of a resource: a downloadable payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleFile {
    /// The affordance URI (`…/$file` or `…/$file/<path>`).
    pub uri: AffordanceUri,
    /// Generated or provided description.
    pub description: Option<String>,
    /// MIME type of the file, when known.
    pub mime_type: Option<MimeType>,
    /// When the download URL stops working, for signed URLs.
    pub expiry: Option<DateTime<Utc>>,
    /// Where to fetch the bytes.
    pub download_url: DownloadUrl,
}

impl BundleFile {
    /// Project into the file observation.
    #[must_use]
    pub fn observations(&self) -> Vec<Observation> {
        vec![Observation::File(ObsFile {
            uri: self
                .uri
                .resource_uri()
                .child_observable(self.uri.suffix().clone()),
            description: self.description.clone(),
            mime_type: self.mime_type.clone(),
            expiry: self.expiry,
            download_url: self.download_url.clone(),
        })]
    }
}

/// The persisted `$plain` of a resource: the raw text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundlePlain {
    /// The affordance URI (`…/$plain`).
    pub uri: AffordanceUri,
    /// MIME type of the text, when known.
    pub mime_type: Option<MimeType>,
    /// The raw text.
    pub text: String,
}

impl BundlePlain {
    /// Project into the plain observation.
    #[must_use]
    pub fn observations(&self) -> Vec<Observation> {
        vec![Observation::Plain(ObsPlain {
            uri: self
                .uri
                .resource_uri()
                .child_observable(self.uri.suffix().clone()),
            description: None,
            mime_type: self.mime_type.clone(),
            text: self.text.clone(),
        })]
    }
}

/// Any persisted bundle, discriminated by its affordance kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Bundle {
    /// A `$body` bundle.
    Body(BundleBody),
    /// A `$collection` bundle.
    Collection(BundleCollection),
    /// A `$file` bundle.
    File(BundleFile),
    /// A `$plain` bundle.
    Plain(BundlePlain),
}

impl Bundle {
    /// The bundle's affordance URI.
    #[must_use]
    pub const fn uri(&self) -> &AffordanceUri {
        match self {
            Self::Body(b) => &b.uri,
            Self::Collection(b) => &b.uri,
            Self::File(b) => &b.uri,
            Self::Plain(b) => &b.uri,
        }
    }

    /// The affordance summary.
    #[must_use]
    pub fn info(&self) -> AffordanceInfo {
        match self {
            Self::Body(b) => b.info(),
            Self::Collection(b) => AffordanceInfo::bare(b.uri.suffix().clone()),
            Self::File(b) => AffordanceInfo {
                suffix: b.uri.suffix().clone(),
                mime_type: b.mime_type.clone(),
                description: b.description.clone(),
                sections: Vec::new(),
                observations: Vec::new(),
            },
            Self::Plain(b) => AffordanceInfo {
                suffix: b.uri.suffix().clone(),
                mime_type: b.mime_type.clone(),
                description: None,
                sections: Vec::new(),
                observations: Vec::new(),
            },
        }
    }

    /// Project into agent-facing observations.
    #[must_use]
    pub fn observations(&self) -> Vec<Observation> {
        match self {
            Self::Body(b) => b.observations(),
            Self::Collection(b) => b.observations(),
            Self::File(b) => b.observations(),
            Self::Plain(b) => b.observations(),
        }
    }

    /// Sorted non-embed links pointing outside the resource.
    #[must_use]
    pub fn dep_links(&self) -> Vec<Reference> {
        match self {
            Self::Body(b) => b.dep_links(),
            Self::Collection(b) => b.results.iter().cloned().map(Reference::from).collect(),
            Self::File(_) | Self::Plain(_) => Vec::new(),
        }
    }

    /// Sorted embeds pointing outside the resource.
    #[must_use]
    pub fn dep_embeds(&self) -> Vec<Reference> {
        match self {
            Self::Body(b) => b.dep_embeds(),
            _ => Vec::new(),
        }
    }
}

///
/// Resources
///

/// A resolved resource in the final bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// The resource identity.
    pub uri: ResourceUri,
    /// The service that owns the resource.
    pub owner: String,
    /// Descriptive attributes.
    pub attributes: ResourceAttrs,
    /// External URLs resolving to this resource.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<WebUrl>,
    /// The affordances the resource supports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affordances: Vec<AffordanceInfo>,
    /// Generated and provided labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<ResourceLabel>,
    /// Relations touching this resource; `None` when expansion was not
    /// requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relations: Option<Vec<Relation>>,
}

impl Resource {
    /// Assemble a resource, filling missing descriptions from labels.
    #[must_use]
    pub fn new(
        uri: ResourceUri,
        owner: &str,
        attributes: ResourceAttrs,
        aliases: Vec<WebUrl>,
        affordances: Vec<AffordanceInfo>,
        labels: &ResourceLabels,
        relations: Option<Vec<Relation>>,
    ) -> Self {
        let mut attributes = attributes;
        if attributes.description.is_none() {
            if let Some(value) = labels.get_str("description", &[Suffix::body()]) {
                attributes.description = Some(value.to_string());
            }
        }

        Self {
            uri,
            owner: owner.to_string(),
            attributes,
            aliases,
            affordances: affordances
                .iter()
                .map(|aff| aff.with_labels(labels))
                .collect(),
            labels: labels.as_list(),
            relations,
        }
    }

    /// The metadata projection of this resource.
    #[must_use]
    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            uri: self.uri.clone(),
            attributes: self.attributes.clone(),
            aliases: self.aliases.clone(),
            affordances: self.affordances.clone(),
        }
    }
}

/// A resource that failed to resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceError {
    /// The failed resource.
    pub uri: ResourceUri,
    /// What went wrong.
    pub error: ErrorInfo,
}

/// An observable that failed to observe or ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationError {
    /// The failed observable.
    pub uri: ObservableUri,
    /// What went wrong.
    pub error: ErrorInfo,
}

/// A resource or its failure, tagged for the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceOrError {
    /// The resource resolved.
    Resource(Resource),
    /// The resource failed.
    Error(ResourceError),
}

impl ResourceOrError {
    /// The resource identity either way.
    #[must_use]
    pub const fn uri(&self) -> &ResourceUri {
        match self {
            Self::Resource(resource) => &resource.uri,
            Self::Error(error) => &error.uri,
        }
    }
}

/// An observation or its failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObservationOrError {
    /// The observation succeeded.
    Observation(Observation),
    /// The observable failed.
    Error(ObservationError),
}

impl ObservationOrError {
    /// The observable URI either way.
    #[must_use]
    pub const fn uri(&self) -> &ObservableUri {
        match self {
            Self::Observation(observation) => observation.uri(),
            Self::Error(error) => &error.uri,
        }
    }
}

/// The assembled response: resolved resources plus their observations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// Resolved resources and resource-level failures, sorted by URI.
    #[serde(default)]
    pub resources: Vec<ResourceOrError>,
    /// Observations and observation-level failures, sorted by URI.
    #[serde(default)]
    pub observations: Vec<ObservationOrError>,
}

impl Resources {
    /// An empty response.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add resources and observations.
    ///
    /// An already-present resource has its metadata merged (aliases union,
    /// affordances replaced). When observations arrive for a root that
    /// already has children, the existing children are discarded first, in
    /// case the structure of the body changed.
    pub fn update(
        &mut self,
        resources: Vec<ResourceOrError>,
        observations: Vec<ObservationOrError>,
    ) {
        for resource in resources {
            let merged = match (&resource, self.get_resource(resource.uri())) {
                (ResourceOrError::Resource(new), Some(existing)) => {
                    ResourceOrError::Resource(Resource {
                        uri: new.uri.clone(),
                        owner: new.owner.clone(),
                        attributes: ResourceAttrsUpdate::full(&new.attributes)
                            .apply(&existing.attributes),
                        aliases: sorted_make(
                            existing.aliases.iter().chain(&new.aliases).cloned(),
                            ToString::to_string,
                        ),
                        affordances: new.affordances.clone(),
                        labels: sorted_make(
                            existing.labels.iter().chain(&new.labels).cloned(),
                            ResourceLabel::sort_key,
                        ),
                        relations: new
                            .relations
                            .clone()
                            .or_else(|| existing.relations.clone()),
                    })
                },
                _ => resource,
            };
            sorted_insert(
                &mut self.resources,
                merged,
                |r| r.uri().to_string(),
                OnConflict::Replace,
            );
        }

        if !observations.is_empty() {
            let replaced_roots: Vec<String> = observations
                .iter()
                .map(|obs| obs.uri().root_uri().to_string())
                .collect();
            self.observations
                .retain(|obs| !replaced_roots.contains(&obs.uri().root_uri().to_string()));
            for observation in observations {
                sorted_insert(
                    &mut self.observations,
                    observation,
                    |obs| obs.uri().to_string(),
                    OnConflict::Replace,
                );
            }
        }
    }

    /// Resolve a reference into a resource identity, using aliases for
    /// external URLs.
    #[must_use]
    pub fn infer_resource_uri(&self, reference: &Reference) -> Option<ResourceUri> {
        match reference {
            Reference::Knowledge(uri) => Some(uri.resource_uri()),
            Reference::External(url) => self.get_alias(url),
        }
    }

    /// The resource a known external alias resolves to.
    #[must_use]
    pub fn get_alias(&self, reference: &WebUrl) -> Option<ResourceUri> {
        let key = reference.to_string();
        self.resources.iter().find_map(|resource| match resource {
            ResourceOrError::Resource(r)
                if sorted_find(&r.aliases, &key, ToString::to_string).is_some() =>
            {
                Some(r.uri.clone())
            },
            _ => None,
        })
    }

    /// The error recorded for a reference, when any.
    #[must_use]
    pub fn get_error(&self, reference: &Reference) -> Option<ErrorInfo> {
        let uri = match reference {
            Reference::Knowledge(uri) => uri.clone(),
            Reference::External(url) => KnowledgeUri::Resource(self.get_alias(url)?),
        };

        match self.get_resource_or_error(&uri.resource_uri())? {
            ResourceOrError::Error(error) => Some(error.error.clone()),
            ResourceOrError::Resource(_) => match &uri {
                KnowledgeUri::Resource(_) => None,
                KnowledgeUri::Affordance(aff) => {
                    self.get_observation_error(&aff.as_observable())
                },
                KnowledgeUri::Observable(obs) => self.get_observation_error(obs),
            },
        }
    }

    fn get_observation_error(&self, uri: &ObservableUri) -> Option<ErrorInfo> {
        let key = uri.to_string();
        match sorted_find(&self.observations, &key, |obs| obs.uri().to_string())? {
            ObservationOrError::Error(error) => Some(error.error.clone()),
            ObservationOrError::Observation(_) => None,
        }
    }

    /// The resolved resource for a URI, when present and not an error.
    #[must_use]
    pub fn get_resource(&self, uri: &ResourceUri) -> Option<&Resource> {
        match self.get_resource_or_error(uri)? {
            ResourceOrError::Resource(resource) => Some(resource),
            ResourceOrError::Error(_) => None,
        }
    }

    /// The resource record or its failure.
    #[must_use]
    pub fn get_resource_or_error(&self, uri: &ResourceUri) -> Option<&ResourceOrError> {
        sorted_find(&self.resources, &uri.to_string(), |r| r.uri().to_string())
    }

    /// The observation for a knowledge URI.
    ///
    /// A bare resource URI picks the preferred default: `$body`, then
    /// `$plain`, then `$collection` — but only among affordances the
    /// resource actually supports.
    #[must_use]
    pub fn get_observation(&self, uri: &KnowledgeUri) -> Option<&Observation> {
        let observable = match uri {
            KnowledgeUri::Affordance(aff) => aff.as_observable(),
            KnowledgeUri::Observable(obs) => obs.clone(),
            KnowledgeUri::Resource(resource_uri) => {
                let resource = self.get_resource(resource_uri)?;
                let defaults = [Suffix::body(), Suffix::plain(), Suffix::collection()];
                let suffix = defaults.into_iter().find(|suffix| {
                    resource
                        .affordances
                        .iter()
                        .any(|aff| aff.suffix == *suffix)
                })?;
                resource_uri.child_observable(suffix)
            },
        };

        let key = observable.to_string();
        match sorted_find(&self.observations, &key, |obs| obs.uri().to_string())? {
            ObservationOrError::Observation(observation) => Some(observation),
            ObservationOrError::Error(_) => None,
        }
    }
}
