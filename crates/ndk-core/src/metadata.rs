//! Resource metadata: attributes, affordance summaries and citations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::label::ResourceLabels;
use crate::sorted::{OnConflict, sorted_insert, sorted_make};
use crate::uri::{KnowledgeUri, ResourceUri, Suffix, SuffixKind, WebUrl};
use crate::data::MimeType;
use crate::content::TextPart;

///
/// Attributes
///

/// The descriptive attributes of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAttrs {
    /// The human-readable name: the document title, or the file name when no
    /// title is inferred.
    pub name: String,

    /// The MIME type of the original file, which is often different from the
    /// format consumed by agents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<MimeType>,

    /// What the resource contains, read by the connector or generated by an
    /// LLM. Helps agents decide whether to navigate into it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// A link humans can follow to consult the original document.
    ///
    /// Never a signed URL: protected resources should require the user to
    /// log in when they click the link.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citation_url: Option<WebUrl>,

    /// When the original document was created, if the connector knows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// When the original document was last modified, as of the last
    /// ingestion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    /// Identifier that changes when the content changes (e.g. a commit
    /// hash); preferred over `updated_at` for refresh checks when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision_data: Option<String>,

    /// Identifier that changes when the metadata changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision_meta: Option<String>,
}

impl ResourceAttrs {
    /// Attributes holding only a name.
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mime_type: None,
            description: None,
            citation_url: None,
            created_at: None,
            updated_at: None,
            revision_data: None,
            revision_meta: None,
        }
    }
}

/// A partial update of [`ResourceAttrs`]: only set fields overwrite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceAttrsUpdate {
    /// New name, when changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New MIME type, when changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<MimeType>,
    /// New description, when changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// New citation URL, when changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citation_url: Option<WebUrl>,
    /// New creation timestamp, when changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// New modification timestamp, when changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// New content revision, when changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision_data: Option<String>,
    /// New metadata revision, when changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision_meta: Option<String>,
}

impl ResourceAttrsUpdate {
    /// An update setting every field from `after`.
    #[must_use]
    pub fn full(after: &ResourceAttrs) -> Self {
        Self {
            name: Some(after.name.clone()),
            mime_type: after.mime_type.clone(),
            description: after.description.clone(),
            citation_url: after.citation_url.clone(),
            created_at: after.created_at,
            updated_at: after.updated_at,
            revision_data: after.revision_data.clone(),
            revision_meta: after.revision_meta.clone(),
        }
    }

    /// An update setting only the fields that differ from `before`.
    #[must_use]
    pub fn diff(after: &ResourceAttrs, before: &ResourceAttrs) -> Self {
        fn changed<T: Clone + PartialEq>(after: &Option<T>, before: &Option<T>) -> Option<T> {
            after
                .as_ref()
                .filter(|value| Some(*value) != before.as_ref())
                .cloned()
        }

        Self {
            name: (after.name != before.name).then(|| after.name.clone()),
            mime_type: changed(&after.mime_type, &before.mime_type),
            description: changed(&after.description, &before.description),
            citation_url: changed(&after.citation_url, &before.citation_url),
            created_at: changed(&after.created_at, &before.created_at),
            updated_at: changed(&after.updated_at, &before.updated_at),
            revision_data: changed(&after.revision_data, &before.revision_data),
            revision_meta: changed(&after.revision_meta, &before.revision_meta),
        }
    }

    /// Apply the update to existing attributes, keeping unset fields.
    #[must_use]
    pub fn apply(&self, value: &ResourceAttrs) -> ResourceAttrs {
        ResourceAttrs {
            name: self.name.clone().unwrap_or_else(|| value.name.clone()),
            mime_type: self.mime_type.clone().or_else(|| value.mime_type.clone()),
            description: self
                .description
                .clone()
                .or_else(|| value.description.clone()),
            citation_url: self
                .citation_url
                .clone()
                .or_else(|| value.citation_url.clone()),
            created_at: self.created_at.or(value.created_at),
            updated_at: self.updated_at.or(value.updated_at),
            revision_data: self
                .revision_data
                .clone()
                .or_else(|| value.revision_data.clone()),
            revision_meta: self
                .revision_meta
                .clone()
                .or_else(|| value.revision_meta.clone()),
        }
    }

    /// Whether no field is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.mime_type.is_none()
            && self.description.is_none()
            && self.citation_url.is_none()
            && self.created_at.is_none()
            && self.updated_at.is_none()
            && self.revision_data.is_none()
            && self.revision_meta.is_none()
    }
}

///
/// Affordance summaries
///

/// Summary of a single observation within an affordance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationInfo {
    /// The observable suffix.
    pub suffix: Suffix,
    /// Estimated token cost of reading the observation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_tokens: Option<usize>,
    /// MIME type, when the observation is binary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<MimeType>,
    /// Generated or provided description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A section grouping observations into a table of contents. When a heading
/// is present, it is displayed above the section's children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationSection {
    /// The suffix kind of the grouped observations (e.g. "chunk").
    #[serde(rename = "type")]
    pub section_type: String,
    /// The index path prefix shared by the section's children.
    pub path: Vec<String>,
    /// The heading introduced by the section, when any.
    pub heading: Option<String>,
}

impl ObservationSection {
    /// A chunk section at the given index path.
    #[must_use]
    pub fn new_body(indexes: &[u32], heading: Option<&str>) -> Self {
        Self {
            section_type: "chunk".to_string(),
            path: indexes.iter().map(|index| format!("{index:02}")).collect(),
            heading: heading.map(str::to_string),
        }
    }

    /// Whether the section is an ancestor of the given observable.
    #[must_use]
    pub fn is_parent(&self, suffix: &Suffix) -> bool {
        let suffix_str = suffix.as_suffix();
        let mut prefix = format!("${}", self.section_type);
        for part in &self.path {
            prefix.push('/');
            prefix.push_str(part);
        }
        suffix_str == prefix || suffix_str.starts_with(&format!("{prefix}/"))
    }
}

/// Summary of one affordance of a resource: its sections, observations and
/// top-level description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffordanceInfo {
    /// The affordance suffix.
    pub suffix: Suffix,
    /// MIME type of the affordance content, when binary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<MimeType>,
    /// Generated or provided description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Table-of-contents sections over the observations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<ObservationSection>,
    /// The observations within the affordance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub observations: Vec<ObservationInfo>,
}

impl AffordanceInfo {
    /// A bare affordance with no metadata.
    #[must_use]
    pub fn bare(suffix: Suffix) -> Self {
        Self {
            suffix,
            mime_type: None,
            description: None,
            sections: Vec::new(),
            observations: Vec::new(),
        }
    }

    /// Fill missing descriptions from labels; only applies to `$body`.
    #[must_use]
    pub fn with_labels(&self, labels: &ResourceLabels) -> Self {
        if self.suffix != Suffix::body() {
            return self.clone();
        }

        let mut result = self.clone();
        if result.description.is_none() {
            if let Some(value) = labels.get_str("description", &[Suffix::body()]) {
                result.description = Some(value.to_string());
            }
        }
        for obs in &mut result.observations {
            if obs.description.is_none() {
                if let Some(value) = labels.get_str("description", &[obs.suffix.clone()]) {
                    obs.description = Some(value.to_string());
                }
            }
        }
        result
    }

    /// Headings for the sections containing the observable, outermost first.
    #[must_use]
    pub fn breadcrumbs_sections(&self, suffix: &Suffix) -> Vec<TextPart> {
        self.sections
            .iter()
            .filter(|section| section.is_parent(suffix))
            .filter_map(|section| {
                section.heading.as_ref().map(|heading| {
                    #[allow(clippy::cast_possible_truncation)]
                    TextPart::heading((section.path.len() + 1) as u8, heading.clone())
                })
            })
            .collect()
    }

    /// The "part i/n" heading for a chunk with siblings in its section.
    ///
    /// Only meaningful for `$chunk` observations.
    #[must_use]
    pub fn breadcrumbs_index(&self, suffix: &Suffix) -> Option<TextPart> {
        if suffix.kind() != SuffixKind::Chunk
            || suffix.path().is_empty()
            || self.get_observation_info(suffix).is_none()
        {
            return None;
        }

        let parent_path = &suffix.path()[..suffix.path().len() - 1];
        let siblings: Vec<String> = self
            .observations
            .iter()
            .filter(|obs| {
                obs.suffix.kind() == SuffixKind::Chunk
                    && !obs.suffix.path().is_empty()
                    && &obs.suffix.path()[..obs.suffix.path().len() - 1] == parent_path
                    && obs.suffix.path().last() != suffix.path().last()
            })
            .map(|obs| obs.suffix.as_suffix())
            .collect();
        if siblings.is_empty() {
            return None;
        }

        let mut item_suffixes = siblings;
        item_suffixes.push(suffix.as_suffix());
        item_suffixes.sort();
        let item_index = item_suffixes
            .iter()
            .position(|s| *s == suffix.as_suffix())?
            + 1;

        #[allow(clippy::cast_possible_truncation)]
        Some(TextPart::heading(
            (suffix.path().len() + 1) as u8,
            format!("{item_index}/{}", item_suffixes.len()),
        ))
    }

    /// The info record for an observable, falling back to the affordance's
    /// own metadata when the suffix names the affordance itself.
    #[must_use]
    pub fn get_observation_info(&self, suffix: &Suffix) -> Option<ObservationInfo> {
        if let Some(observation) = self.observations.iter().find(|o| o.suffix == *suffix) {
            return Some(observation.clone());
        }
        (*suffix == self.suffix).then(|| ObservationInfo {
            suffix: suffix.clone(),
            num_tokens: None,
            mime_type: self.mime_type.clone(),
            description: self.description.clone(),
        })
    }
}

///
/// Resource info
///

/// The resolved metadata of a resource: attributes, external aliases and
/// supported affordances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    /// The resource identity.
    pub uri: ResourceUri,
    /// Descriptive attributes.
    pub attributes: ResourceAttrs,
    /// External URLs that resolve to this resource.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<WebUrl>,
    /// The affordances the resource supports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affordances: Vec<AffordanceInfo>,
}

impl ResourceInfo {
    /// The affordance summary for a suffix, when supported.
    #[must_use]
    pub fn get_affordance(&self, suffix: &Suffix) -> Option<&AffordanceInfo> {
        self.affordances.iter().find(|aff| aff.suffix == *suffix)
    }

    /// The observation info for an observable, when known.
    #[must_use]
    pub fn get_observation_info(&self, suffix: &Suffix) -> Option<ObservationInfo> {
        self.get_affordance(&suffix.affordance())?
            .get_observation_info(suffix)
    }

    /// Combine resource attributes and observable metadata into a citation.
    ///
    /// Examples of breadcrumbs + name given an observable suffix:
    /// - "name / heading1 / heading2 / chunk 2/3" (chunk with siblings)
    /// - "name / heading1 / heading2" (chunk without siblings)
    /// - "name / image.png" (`$media/figures/image.png`)
    /// - "name" (`$body`, root chunk without siblings)
    #[must_use]
    pub fn cited(&self, suffix: Option<&Suffix>, excerpt: Option<&str>) -> Option<CitedResource> {
        let Some(suffix) = suffix else {
            return Some(self.cited_root(KnowledgeUri::Resource(self.uri.clone()), excerpt));
        };

        let affordance = self.get_affordance(&suffix.affordance())?;
        let observation = affordance.get_observation_info(suffix)?;

        let suffix_name = suffix.kind().as_str();
        let mut breadcrumbs = affordance.breadcrumbs_sections(suffix);
        let breadcrumbs_index = affordance.breadcrumbs_index(suffix);
        let name_heading = TextPart::heading(1, self.attributes.name.clone());

        let name: String;
        if let Some(index) = breadcrumbs_index {
            name = format!("{suffix_name} {}", index.as_str().trim_start_matches(['#', ' ']));
            breadcrumbs.insert(0, name_heading);
        } else if let Some(last) = breadcrumbs.pop() {
            name = last.as_str().trim_start_matches(['#', ' ']).to_string();
            breadcrumbs.insert(0, name_heading);
        } else if !suffix.path().is_empty() && suffix.kind() != SuffixKind::Chunk {
            name = suffix
                .path()
                .last()
                .map(ToString::to_string)
                .unwrap_or_default();
            breadcrumbs = vec![name_heading];
        } else {
            name = self.attributes.name.clone();
            breadcrumbs = Vec::new();
        }

        Some(CitedResource {
            uri: KnowledgeUri::Observable(self.uri.child_observable(suffix.clone())),
            breadcrumbs: breadcrumbs
                .iter()
                .map(|part| part.as_str().trim_start_matches(['#', ' ']).to_string())
                .collect(),
            name,
            mime_type: observation.mime_type,
            description: observation.description,
            citation_url: self.attributes.citation_url.clone(),
            created_at: self.attributes.created_at,
            updated_at: self.attributes.updated_at,
            excerpt: excerpt.map(str::to_string),
        })
    }

    fn cited_root(&self, uri: KnowledgeUri, excerpt: Option<&str>) -> CitedResource {
        CitedResource {
            uri,
            breadcrumbs: Vec::new(),
            name: self.attributes.name.clone(),
            mime_type: self.attributes.mime_type.clone(),
            description: self.attributes.description.clone(),
            citation_url: self.attributes.citation_url.clone(),
            created_at: self.attributes.created_at,
            updated_at: self.attributes.updated_at,
            excerpt: excerpt.map(str::to_string),
        }
    }
}

/// A partial update of [`ResourceInfo`].
///
/// - `attributes` replace only the affected fields.
/// - `aliases` are added (union), preserving ordering.
/// - `affordances` overlay by suffix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceInfoUpdate {
    /// Attribute changes.
    pub attributes: ResourceAttrsUpdate,
    /// Aliases to add.
    pub aliases: Vec<WebUrl>,
    /// Affordance summaries to overlay.
    pub affordances: Vec<AffordanceInfo>,
}

impl ResourceInfoUpdate {
    /// Apply the update to a resource info.
    #[must_use]
    pub fn apply(&self, value: &ResourceInfo) -> ResourceInfo {
        let mut affordances: Vec<AffordanceInfo> = Vec::new();
        for affordance in value.affordances.iter().chain(&self.affordances) {
            sorted_insert(
                &mut affordances,
                affordance.clone(),
                |aff| aff.suffix.as_suffix(),
                OnConflict::Replace,
            );
        }

        ResourceInfo {
            uri: value.uri.clone(),
            attributes: self.attributes.apply(&value.attributes),
            aliases: sorted_make(
                self.aliases.iter().chain(&value.aliases).cloned(),
                ToString::to_string,
            ),
            affordances,
        }
    }

    /// Whether the update carries no change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.aliases.is_empty() && self.affordances.is_empty()
    }
}

///
/// Citation
///

/// The combined resource and observable metadata used to render citations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitedResource {
    /// The cited URI.
    pub uri: KnowledgeUri,
    /// Breadcrumb trail above the cited name.
    pub breadcrumbs: Vec<String>,
    /// Display name.
    pub name: String,
    /// MIME type, when binary.
    pub mime_type: Option<MimeType>,
    /// Description, when known.
    pub description: Option<String>,
    /// Link to the original document.
    pub citation_url: Option<WebUrl>,
    /// Creation timestamp, when known.
    pub created_at: Option<DateTime<Utc>>,
    /// Modification timestamp, when known.
    pub updated_at: Option<DateTime<Utc>>,
    /// Supporting excerpt, when provided by the caller.
    pub excerpt: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::label::{LabelName, ResourceLabel};

    fn uri(value: &str) -> ResourceUri {
        ResourceUri::decode(value).unwrap()
    }

    fn chunk_info(indexes: &[u32], description: Option<&str>) -> ObservationInfo {
        ObservationInfo {
            suffix: Suffix::chunk(indexes),
            num_tokens: Some(100),
            mime_type: None,
            description: description.map(str::to_string),
        }
    }

    #[test]
    fn test_attrs_update_overwrites_only_set_fields() {
        let base = ResourceAttrs {
            description: Some("old".into()),
            ..ResourceAttrs::named("doc")
        };
        let update = ResourceAttrsUpdate {
            name: Some("renamed".into()),
            ..ResourceAttrsUpdate::default()
        };

        let applied = update.apply(&base);
        assert_eq!(applied.name, "renamed");
        assert_eq!(applied.description.as_deref(), Some("old"));
    }

    #[test]
    fn test_attrs_diff_only_changes() {
        let before = ResourceAttrs::named("doc");
        let after = ResourceAttrs {
            description: Some("new".into()),
            ..ResourceAttrs::named("doc")
        };

        let diff = ResourceAttrsUpdate::diff(&after, &before);
        assert_eq!(diff.name, None);
        assert_eq!(diff.description.as_deref(), Some("new"));
        assert!(ResourceAttrsUpdate::diff(&before, &before).is_empty());
    }

    #[test]
    fn test_section_is_parent() {
        let section = ObservationSection::new_body(&[3], Some("Experiments"));
        assert!(section.is_parent(&Suffix::chunk(&[3, 1])));
        assert!(section.is_parent(&Suffix::chunk(&[3])));
        assert!(!section.is_parent(&Suffix::chunk(&[4, 1])));
        assert!(!section.is_parent(&Suffix::body()));
    }

    #[test]
    fn test_affordance_with_labels_fills_descriptions() {
        let affordance = AffordanceInfo {
            observations: vec![chunk_info(&[0], None), chunk_info(&[1], Some("kept"))],
            ..AffordanceInfo::bare(Suffix::body())
        };
        let mut labels = ResourceLabels::new();
        labels.add(ResourceLabel::text(
            LabelName::decode("description").unwrap(),
            Suffix::body(),
            "root description",
        ));
        labels.add(ResourceLabel::text(
            LabelName::decode("description").unwrap(),
            Suffix::chunk(&[0]),
            "chunk description",
        ));
        labels.add(ResourceLabel::text(
            LabelName::decode("description").unwrap(),
            Suffix::chunk(&[1]),
            "ignored",
        ));

        let updated = affordance.with_labels(&labels);
        assert_eq!(updated.description.as_deref(), Some("root description"));
        assert_eq!(
            updated.observations[0].description.as_deref(),
            Some("chunk description")
        );
        // Existing descriptions are never overwritten.
        assert_eq!(updated.observations[1].description.as_deref(), Some("kept"));
    }

    #[test]
    fn test_breadcrumbs_index_requires_siblings() {
        let affordance = AffordanceInfo {
            sections: vec![ObservationSection::new_body(&[0], Some("Intro"))],
            observations: vec![
                chunk_info(&[0, 0], None),
                chunk_info(&[0, 1], None),
                chunk_info(&[1], None),
            ],
            ..AffordanceInfo::bare(Suffix::body())
        };

        // A chunk with a sibling gets "i/n".
        let index = affordance.breadcrumbs_index(&Suffix::chunk(&[0, 1])).unwrap();
        assert_eq!(index.as_str(), "### 2/2");

        // A chunk without siblings gets none.
        assert!(affordance.breadcrumbs_index(&Suffix::chunk(&[1])).is_none());
    }

    #[test]
    fn test_cited_chunk_with_siblings() {
        let info = ResourceInfo {
            uri: uri("ndk://stub/-/dir/example"),
            attributes: ResourceAttrs::named("Example Doc"),
            aliases: Vec::new(),
            affordances: vec![AffordanceInfo {
                sections: vec![ObservationSection::new_body(&[0], Some("Intro"))],
                observations: vec![chunk_info(&[0, 0], None), chunk_info(&[0, 1], None)],
                ..AffordanceInfo::bare(Suffix::body())
            }],
        };

        let cited = info.cited(Some(&Suffix::chunk(&[0, 1])), None).unwrap();
        assert_eq!(cited.name, "chunk 2/2");
        assert_eq!(cited.breadcrumbs, vec!["Example Doc", "Intro"]);
        assert_eq!(
            cited.uri.to_string(),
            "ndk://stub/-/dir/example/$chunk/00/01"
        );
    }

    #[test]
    fn test_cited_media_uses_filename() {
        let media_suffix =
            Suffix::parse_suffix("$media/figures/image.png").unwrap();
        let info = ResourceInfo {
            uri: uri("ndk://stub/-/dir/example"),
            attributes: ResourceAttrs::named("Example Doc"),
            aliases: Vec::new(),
            affordances: vec![AffordanceInfo {
                observations: vec![ObservationInfo {
                    suffix: media_suffix.clone(),
                    num_tokens: None,
                    mime_type: None,
                    description: None,
                }],
                ..AffordanceInfo::bare(Suffix::body())
            }],
        };

        let cited = info.cited(Some(&media_suffix), None).unwrap();
        assert_eq!(cited.name, "image.png");
        assert_eq!(cited.breadcrumbs, vec!["Example Doc"]);
    }

    #[test]
    fn test_resource_info_update_overlays_affordances() {
        let base = ResourceInfo {
            uri: uri("ndk://stub/-/dir/example"),
            attributes: ResourceAttrs::named("doc"),
            aliases: vec![WebUrl::decode("https://example.com/a").unwrap()],
            affordances: vec![AffordanceInfo::bare(Suffix::body())],
        };
        let update = ResourceInfoUpdate {
            attributes: ResourceAttrsUpdate::default(),
            aliases: vec![WebUrl::decode("https://example.com/b").unwrap()],
            affordances: vec![AffordanceInfo {
                description: Some("described".into()),
                ..AffordanceInfo::bare(Suffix::body())
            }],
        };

        let applied = update.apply(&base);
        assert_eq!(applied.aliases.len(), 2);
        assert_eq!(applied.affordances.len(), 1);
        assert_eq!(
            applied.affordances[0].description.as_deref(),
            Some("described")
        );
    }
}
