//! Labels: generated or connector-provided metadata attached to observables.
//!
//! A label is a named value targeting an observable of a resource, in either
//! relative form (suffix within a known resource) or absolute form (full
//! observable URI). Filters restrict which resources participate in a request
//! and which labels must match for a resource to be returned.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sorted::{OnConflict, sorted_find, sorted_insert, sorted_make};
use crate::uri::{ObservableUri, ResourceUri, Suffix, SuffixKind};

static RE_LABEL_NAME: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[a-z0-9]+(?:_[a-z0-9]+)*$").unwrap()
});

/// A validated snake_case label name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LabelName(String);

impl LabelName {
    /// Parse a label name, validating the snake_case pattern.
    pub fn decode(value: &str) -> Result<Self> {
        if RE_LABEL_NAME.is_match(value) {
            Ok(Self(value.to_string()))
        } else {
            Err(Error::bad_uri("LabelName", "expected pattern", value))
        }
    }

    /// Generate a label name from an arbitrary string, replacing separators
    /// with underscores and dropping everything else; `None` when nothing
    /// survives (e.g. a fully non-ASCII title).
    #[must_use]
    pub fn try_normalize(value: &str) -> Option<Self> {
        let mut normalized = String::new();
        let mut last_underscore = true;
        for c in value.to_lowercase().chars() {
            if c.is_ascii_alphanumeric() {
                normalized.push(c);
                last_underscore = false;
            } else if !last_underscore {
                normalized.push('_');
                last_underscore = true;
            }
        }
        let normalized = normalized.trim_matches('_');
        (!normalized.is_empty()).then(|| Self(normalized.to_string()))
    }

    /// The validated string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The JSON property name used for `target` in inference schemas.
    #[must_use]
    pub fn as_property(&self, target: &str) -> String {
        let target = target
            .strip_prefix("ndk://")
            .unwrap_or(target)
            .strip_prefix("self://")
            .unwrap_or(target);
        match Self::try_normalize(target) {
            Some(suffix) => format!("{}_{}", self.0, suffix.0),
            None => self.0.clone(),
        }
    }
}

impl std::fmt::Display for LabelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for LabelName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::decode(&value)
    }
}

impl From<LabelName> for String {
    fn from(value: LabelName) -> Self {
        value.0
    }
}

///
/// Values
///

/// A label with a target relative to its resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLabel {
    /// The label name.
    pub name: LabelName,
    /// The observable the value describes.
    pub target: Suffix,
    /// The label value.
    pub value: serde_json::Value,
}

impl ResourceLabel {
    /// A string-valued label.
    #[must_use]
    pub fn text(name: LabelName, target: Suffix, value: &str) -> Self {
        Self {
            name,
            target,
            value: serde_json::Value::String(value.to_string()),
        }
    }

    /// The deterministic ordering key.
    #[must_use]
    pub fn sort_key(&self) -> String {
        format!("{}/{}", self.name, self.target)
    }

    /// The absolute form within a resource.
    #[must_use]
    pub fn as_absolute(&self, resource_uri: &ResourceUri) -> LabelValue {
        LabelValue {
            name: self.name.clone(),
            target: resource_uri.child_observable(self.target.clone()),
            value: self.value.clone(),
        }
    }
}

/// A label with an absolute observable URI target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelValue {
    /// The label name.
    pub name: LabelName,
    /// The observable the value describes.
    pub target: ObservableUri,
    /// The label value.
    pub value: serde_json::Value,
}

impl LabelValue {
    /// The deterministic ordering key.
    #[must_use]
    pub fn sort_key(&self) -> String {
        format!("{}/{}", self.name, self.target)
    }

    /// The relative form, dropping the resource identity.
    #[must_use]
    pub fn as_relative(&self) -> ResourceLabel {
        ResourceLabel {
            name: self.name.clone(),
            target: self.target.suffix().clone(),
            value: self.value.clone(),
        }
    }
}

/// A sorted, deduplicated collection of relative labels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceLabels {
    values: Vec<ResourceLabel>,
}

impl ResourceLabels {
    /// An empty collection.
    #[must_use]
    pub const fn new() -> Self {
        Self { values: Vec::new() }
    }

    /// Build from labels, sorting and deduplicating by key.
    #[must_use]
    pub fn from_list(labels: Vec<ResourceLabel>) -> Self {
        Self {
            values: sorted_make(labels, ResourceLabel::sort_key),
        }
    }

    /// Add one label, replacing any previous value for the same key.
    pub fn add(&mut self, label: ResourceLabel) {
        sorted_insert(
            &mut self.values,
            label,
            ResourceLabel::sort_key,
            OnConflict::Replace,
        );
    }

    /// Add many labels.
    pub fn extend(&mut self, labels: Vec<ResourceLabel>) {
        for label in labels {
            self.add(label);
        }
    }

    /// The labels as a list, in key order.
    #[must_use]
    pub fn as_list(&self) -> Vec<ResourceLabel> {
        self.values.clone()
    }

    /// The first matching label among the given targets.
    #[must_use]
    pub fn get(&self, name: &str, targets: &[Suffix]) -> Option<&ResourceLabel> {
        targets.iter().find_map(|target| {
            sorted_find(
                &self.values,
                &format!("{name}/{target}"),
                ResourceLabel::sort_key,
            )
        })
    }

    /// The first matching string value among the given targets.
    #[must_use]
    pub fn get_str(&self, name: &str, targets: &[Suffix]) -> Option<&str> {
        self.get(name, targets).and_then(|label| label.value.as_str())
    }
}

///
/// Filters
///

/// An allow/block rule matched by URI prefix; the longest matching prefix
/// wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowRule {
    /// Whether matching URIs are allowed or blocked.
    pub action: AllowAction,
    /// The URI prefix the rule applies to.
    pub prefix: String,
}

/// Allow or block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllowAction {
    /// The resource may be used.
    Allow,
    /// The resource is hidden from the request.
    Block,
}

impl AllowRule {
    fn find_best<'a>(uri: &ResourceUri, allowlist: &'a [Self]) -> Option<&'a Self> {
        let uri_str = uri.to_string();
        allowlist
            .iter()
            .filter(|rule| uri_str.starts_with(&rule.prefix))
            .max_by_key(|rule| rule.prefix.len())
    }
}

/// A constraint on existing labels: at least one value must match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelFilter {
    /// The label name the filter applies to.
    pub name: LabelName,
    /// Accepted values; `None` means any value satisfies the filter.
    pub one_of: Option<Vec<String>>,
}

impl LabelFilter {
    /// Whether the labels satisfy this filter.
    #[must_use]
    pub fn satisfied_by(&self, labels: &[ResourceLabel]) -> bool {
        let Some(one_of) = &self.one_of else {
            return true;
        };
        labels
            .iter()
            .filter(|label| label.name == self.name)
            .any(|label| {
                label
                    .value
                    .as_str()
                    .is_some_and(|value| one_of.iter().any(|v| v == value))
            })
    }
}

/// URI allowlist and label constraints applied when assembling the final
/// bundle.
///
/// The allowlist is a privacy mechanism: it restricts which resources can be
/// used within a request when the access tokens have broader access than the
/// scope the results will be displayed in. Label filters are a search
/// mechanism: only resources whose labels match are returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceFilters {
    /// Behaviour when no allowlist rule matches the URI.
    pub default: AllowAction,
    /// Prefix rules; empty means all URIs are valid.
    pub allowlist: Vec<AllowRule>,
    /// Labels that must match for the resource to be used.
    pub labels: Vec<LabelFilter>,
}

impl Default for ResourceFilters {
    fn default() -> Self {
        Self {
            default: AllowAction::Allow,
            allowlist: Vec::new(),
            labels: Vec::new(),
        }
    }
}

impl ResourceFilters {
    /// Whether the URI passes the allowlist.
    #[must_use]
    pub fn matches(&self, uri: &ResourceUri) -> bool {
        let action = AllowRule::find_best(uri, &self.allowlist)
            .map_or(self.default, |rule| rule.action);
        action == AllowAction::Allow
    }

    /// Whether the labels satisfy every label filter.
    #[must_use]
    pub fn satisfied_by(&self, labels: &[ResourceLabel]) -> bool {
        self.labels.iter().all(|filter| filter.satisfied_by(labels))
    }
}

///
/// Definitions
///

/// Which observation kinds a label definition generates values for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelTarget {
    /// The whole body observation.
    Body,
    /// Each chunk observation.
    Chunk,
    /// Each media observation.
    Media,
}

impl LabelTarget {
    /// Whether an observable of the given kind matches this target.
    #[must_use]
    pub const fn matches(self, kind: SuffixKind) -> bool {
        matches!(
            (self, kind),
            (Self::Body, SuffixKind::Body)
                | (Self::Chunk, SuffixKind::Chunk)
                | (Self::Media, SuffixKind::Media)
        )
    }
}

/// The name, targets and prompt of a generated label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelInfo {
    /// The label name.
    pub name: LabelName,
    /// Generates a value for each observation of these kinds.
    pub forall: Vec<LabelTarget>,
    /// The prompt used by the LLM to generate this label.
    pub prompt: String,
}

impl LabelInfo {
    /// Whether an observable kind is covered by this definition.
    #[must_use]
    pub fn matches_forall(&self, kind: SuffixKind) -> bool {
        self.forall.iter().any(|target| target.matches(kind))
    }
}

/// A label definition plus the resources it applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelDefinition {
    /// What to generate.
    pub info: LabelInfo,
    /// Which resources to generate it for.
    #[serde(default)]
    pub filters: ResourceFilters,
}

impl LabelDefinition {
    /// The deterministic ordering key.
    #[must_use]
    pub fn sort_key(&self) -> String {
        self.info.name.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn name(value: &str) -> LabelName {
        LabelName::decode(value).unwrap()
    }

    #[test]
    fn test_label_name_validation() {
        assert!(LabelName::decode("description").is_ok());
        assert!(LabelName::decode("some_property").is_ok());
        assert!(LabelName::decode("Some-Property").is_err());
        assert!(LabelName::decode("").is_err());
    }

    #[test]
    fn test_label_name_normalize() {
        assert_eq!(
            LabelName::try_normalize("Loyalty Program/2024").unwrap().as_str(),
            "loyalty_program_2024"
        );
        assert!(LabelName::try_normalize("日本語").is_none());
    }

    #[test]
    fn test_label_name_as_property() {
        let property = name("description").as_property("ndk://stub/-/a/b/$chunk/01");
        assert_eq!(property, "description_stub_a_b_chunk_01");
    }

    #[test]
    fn test_resource_labels_sorted_and_replaced() {
        let mut labels = ResourceLabels::new();
        labels.add(ResourceLabel::text(name("description"), Suffix::chunk(&[1]), "one"));
        labels.add(ResourceLabel::text(name("description"), Suffix::body(), "root"));
        labels.add(ResourceLabel::text(name("description"), Suffix::chunk(&[1]), "two"));

        let list = labels.as_list();
        assert_eq!(list.len(), 2);
        assert_eq!(
            labels.get_str("description", &[Suffix::chunk(&[1])]),
            Some("two")
        );
        // First matching target wins.
        assert_eq!(
            labels.get_str("description", &[Suffix::chunk(&[2]), Suffix::body()]),
            Some("root")
        );
        assert_eq!(labels.get_str("placeholder", &[Suffix::body()]), None);
    }

    #[test]
    fn test_label_relative_absolute_round_trip() {
        let uri = ResourceUri::decode("ndk://stub/-/a/b").unwrap();
        let label = ResourceLabel::text(name("description"), Suffix::chunk(&[0, 1]), "v");
        let absolute = label.as_absolute(&uri);
        assert_eq!(absolute.target.to_string(), "ndk://stub/-/a/b/$chunk/00/01");
        assert_eq!(absolute.as_relative(), label);
    }

    #[test]
    fn test_filters_longest_prefix_wins() {
        let filters = ResourceFilters {
            default: AllowAction::Block,
            allowlist: vec![
                AllowRule {
                    action: AllowAction::Allow,
                    prefix: "ndk://stub/".into(),
                },
                AllowRule {
                    action: AllowAction::Block,
                    prefix: "ndk://stub/-/secret".into(),
                },
            ],
            labels: Vec::new(),
        };

        let open = ResourceUri::decode("ndk://stub/-/dir/example").unwrap();
        let secret = ResourceUri::decode("ndk://stub/-/secret/file").unwrap();
        let other = ResourceUri::decode("ndk://jira/issue/PROJ-123").unwrap();
        assert!(filters.matches(&open));
        assert!(!filters.matches(&secret));
        assert!(!filters.matches(&other));
    }

    #[test]
    fn test_label_filter_one_of() {
        let filter = LabelFilter {
            name: name("team"),
            one_of: Some(vec!["platform".into()]),
        };
        let matching = vec![ResourceLabel::text(name("team"), Suffix::body(), "platform")];
        let wrong = vec![ResourceLabel::text(name("team"), Suffix::body(), "mobile")];
        assert!(filter.satisfied_by(&matching));
        assert!(!filter.satisfied_by(&wrong));
        assert!(!filter.satisfied_by(&[]));

        let any = LabelFilter {
            name: name("team"),
            one_of: None,
        };
        assert!(any.satisfied_by(&[]));
    }

    #[test]
    fn test_label_target_matching() {
        assert!(LabelTarget::Body.matches(SuffixKind::Body));
        assert!(LabelTarget::Chunk.matches(SuffixKind::Chunk));
        assert!(!LabelTarget::Body.matches(SuffixKind::Chunk));
        assert!(!LabelTarget::Media.matches(SuffixKind::File));
    }
}
