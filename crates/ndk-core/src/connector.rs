//! Collaborator interfaces: connectors, inference, downloading and image
//! processing, plus the context bag the executor threads through.
//!
//! The core owns histories and bundles keyed by URI; connectors own their
//! locators; inference, downloading and storage are reached through the
//! injected handles here. All traits are object-safe so contexts can hold a
//! heterogeneous chain.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bundle::Bundle;
use crate::config::Tunables;
use crate::data::{DataUri, FileName};
use crate::error::Result;
use crate::history::{Locator, MetadataDelta, ResourceView};
use crate::label::{LabelDefinition, ResourceFilters};
use crate::relation::Relation;
use crate::render::LlmPiece;
use crate::storage::Storage;
use crate::uri::{Reference, ResourceUri, Suffix, WebUrl};

///
/// Fragments
///

/// How the downloader extracted a fragment's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentMode {
    /// Raw text; never parsed for structure.
    Plain,
    /// Structured data (JSON, CSV, …); references extracted, no markdown.
    Data,
    /// Markdown-convertible prose.
    Markdown,
}

/// The downloader's output: extracted text plus referenced binary blobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    /// The extracted text, with blob keys appearing as link targets.
    pub text: String,
    /// The referenced binaries, keyed by the link target in the text.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub blobs: BTreeMap<String, DataUri>,
    /// How the text should be parsed.
    pub mode: FragmentMode,
}

impl Fragment {
    /// A markdown fragment without blobs.
    #[must_use]
    pub fn markdown(text: &str) -> Self {
        Self {
            text: text.to_string(),
            blobs: BTreeMap::new(),
            mode: FragmentMode::Markdown,
        }
    }
}

/// The media suffix path for a blob key: the part after the scheme, split
/// into filename components (invalid components are dropped).
#[must_use]
pub fn blob_key_path(key: &str) -> Vec<FileName> {
    let path = key.split_once("://").map_or(key, |(_, rest)| rest);
    path.split('/')
        .filter_map(FileName::try_decode)
        .collect()
}

///
/// Connector results
///

/// The outcome of resolving a locator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolveResult {
    /// The new metadata, when it changed since the last ingestion or the
    /// resource is seen for the first time.
    #[serde(default)]
    pub metadata: MetadataDelta,
    /// Cached observations that expired and should be read again.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expired: Vec<Suffix>,
    /// Whether to cache the resource metadata. When `false`, only an alias
    /// from the resource URI to the locator is kept and `resolve` re-runs on
    /// every access.
    #[serde(default)]
    pub should_cache: bool,
}

/// The content returned by an observe call.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedContent {
    /// An already-shaped bundle.
    Bundle(Bundle),
    /// A raw fragment to be ingested.
    Fragment(Fragment),
}

/// The outcome of observing one observable.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedResult {
    /// The observed content.
    pub content: ObservedContent,
    /// Metadata learned during the observation.
    pub metadata: MetadataDelta,
    /// Relations the connector discovered.
    pub relations: Vec<Relation>,
    /// Whether to cache the ingested bundle until it expires.
    pub should_cache: bool,
    /// Whether to generate descriptions for body chunks and media.
    pub option_labels: bool,
    /// Whether to record `link` relations from body chunks.
    pub option_relations_link: bool,
    /// Whether to record `parent` relations from collection results.
    pub option_relations_parent: bool,
}

impl ObservedResult {
    /// Wrap content with every option disabled.
    #[must_use]
    pub fn content(content: ObservedContent) -> Self {
        Self {
            content,
            metadata: MetadataDelta::default(),
            relations: Vec::new(),
            should_cache: false,
            option_labels: false,
            option_relations_link: false,
            option_relations_parent: false,
        }
    }
}

///
/// Traits
///

/// A realm-specific source of resources.
#[async_trait]
pub trait Connector: Send + Sync {
    /// The realm this connector serves; locators route on it.
    fn realm(&self) -> crate::uri::Realm;

    /// Resolve a reference into a locator.
    ///
    /// Return `Ok(None)` when this connector is not responsible for the
    /// reference, pushing it to the next connector in the chain. Return
    /// [`crate::error::Error::Unavailable`] when the connector is
    /// responsible but the resource cannot be located or the client may not
    /// view it.
    ///
    /// Since this is not invoked for resource URIs already cached in
    /// storage, responsibility for access control ultimately rests with
    /// [`Connector::resolve`].
    async fn locator(&self, reference: &Reference) -> Result<Option<Locator>>;

    /// Check access, refresh the cheap metadata, report supported
    /// affordances and flag expired observations.
    ///
    /// Return an empty delta when the metadata is unchanged or cannot be
    /// inferred (e.g. a public web page). Expensive metadata can be
    /// delegated to [`Connector::observe`].
    async fn resolve(
        &self,
        locator: &Locator,
        cached: Option<&ResourceView>,
    ) -> Result<ResolveResult>;

    /// Perform a (possibly expensive) observation of the resource.
    ///
    /// `resolved` carries the cached metadata merged with the resolve delta.
    /// The result goes through ingestion: chunking, media processing, link
    /// resolution and relation extraction.
    async fn observe(
        &self,
        locator: &Locator,
        observable: &Suffix,
        resolved: &MetadataDelta,
    ) -> Result<ObservedResult>;
}

/// The LLM inference collaborator.
///
/// Assumed internally thread-safe; requests obey the retry schedule in
/// [`Tunables::retry_delay_secs`] on rate-limit and overload signals.
#[async_trait]
pub trait Inference: Send + Sync {
    /// Request a completion constrained to a JSON schema; returns the raw
    /// JSON text.
    async fn completion_json(
        &self,
        system: Option<&str>,
        response_schema: &serde_json::Value,
        prompt: &[LlmPiece],
    ) -> Result<String>;

    /// Embed content into a unit-length vector, when the model supports it.
    async fn embedding(&self, content: &str) -> Result<Option<Vec<f32>>>;
}

/// The URL downloader collaborator.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetch a URL and extract a fragment with its referenced blobs.
    async fn fetch(&self, url: &WebUrl) -> Result<Fragment>;
}

/// Image inspection and rescaling, injected since the codec itself is
/// outside the core.
pub trait ImageCodec: Send + Sync {
    /// The pixel dimensions of an image, when decodable.
    fn dimensions(&self, data: &DataUri) -> Option<(u32, u32)>;

    /// Downscale to fit within `max_side` preserving aspect ratio, encoding
    /// to the canonical image type.
    fn downscale(&self, data: &DataUri, max_side: u32) -> Result<DataUri>;

    /// Re-encode to the canonical image type without resizing.
    fn reencode(&self, data: &DataUri) -> Result<DataUri>;
}

/// A codec that performs no image work: dimensions are unknown, payloads
/// pass through unchanged. Suitable for deployments without image support.
pub struct PassthroughImageCodec;

impl ImageCodec for PassthroughImageCodec {
    fn dimensions(&self, _data: &DataUri) -> Option<(u32, u32)> {
        None
    }

    fn downscale(&self, data: &DataUri, _max_side: u32) -> Result<DataUri> {
        Ok(data.clone())
    }

    fn reencode(&self, data: &DataUri) -> Result<DataUri> {
        Ok(data.clone())
    }
}

///
/// Context
///

/// The dependency bag threaded through the executor, ingestion and label
/// generation.
#[derive(Clone)]
pub struct KnowledgeContext {
    /// The connector chain, consulted in order.
    pub connectors: Vec<Arc<dyn Connector>>,
    /// The persistence layer.
    pub storage: Arc<Storage>,
    /// The inference collaborator.
    pub inference: Arc<dyn Inference>,
    /// The image codec.
    pub image_codec: Arc<dyn ImageCodec>,
    /// Budgets and limits.
    pub tunables: Tunables,
    /// URI allowlist and label constraints for the current request.
    pub filters: ResourceFilters,
    /// The label definitions to generate.
    pub label_definitions: Vec<LabelDefinition>,
}

impl KnowledgeContext {
    /// Resolve a reference into a locator through the connector chain.
    ///
    /// `Ok(None)` means no connector claims the reference.
    /// [`crate::error::Error::Unavailable`] surfaces from the owning
    /// connector.
    pub async fn try_infer_locator(&self, reference: &Reference) -> Result<Option<Locator>> {
        for connector in &self.connectors {
            if let Some(locator) = connector.locator(reference).await? {
                return Ok(Some(locator));
            }
        }
        Ok(None)
    }

    /// Resolve many references, silently dropping the unavailable ones.
    pub async fn try_infer_locators(
        &self,
        references: &[Reference],
    ) -> BTreeMap<String, Locator> {
        let mut locators = BTreeMap::new();
        for reference in references {
            match self.try_infer_locator(reference).await {
                Ok(Some(locator)) => {
                    locators.insert(reference.to_string(), locator);
                },
                Ok(None) => {},
                Err(error) => {
                    tracing::debug!(reference = %reference, error = %error, "locator unavailable");
                },
            }
        }
        locators
    }

    /// Whether a `link` relation may be recorded towards this resource.
    #[must_use]
    pub fn should_backlink(&self, uri: &ResourceUri) -> bool {
        self.filters.matches(uri)
    }

    /// The connector serving a locator's realm.
    pub fn find_connector(&self, locator: &Locator) -> Result<Arc<dyn Connector>> {
        self.connectors
            .iter()
            .find(|connector| connector.realm() == locator.realm)
            .cloned()
            .ok_or_else(|| {
                crate::error::Error::Unavailable(format!(
                    "no connector for realm '{}'",
                    locator.realm
                ))
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_key_path_strips_scheme() {
        let path = blob_key_path("blob://figures/image.png");
        let parts: Vec<&str> = path.iter().map(FileName::as_str).collect();
        assert_eq!(parts, vec!["figures", "image.png"]);

        let path = blob_key_path("a");
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].as_str(), "a");
    }

    #[test]
    fn test_fragment_serde_round_trip() {
        let mut blobs = BTreeMap::new();
        blobs.insert(
            "blob://a".to_string(),
            DataUri::new(crate::data::MimeType::decode("image/png").unwrap(), b"x"),
        );
        let fragment = Fragment {
            text: "![](blob://a)".into(),
            blobs,
            mode: FragmentMode::Markdown,
        };

        let json = serde_json::to_string(&fragment).unwrap();
        let back: Fragment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fragment);
    }

    #[test]
    fn test_passthrough_codec() {
        let codec = PassthroughImageCodec;
        let data = DataUri::new(crate::data::MimeType::decode("image/png").unwrap(), b"img");
        assert!(codec.dimensions(&data).is_none());
        assert_eq!(codec.downscale(&data, 10).unwrap(), data);
        assert_eq!(codec.reencode(&data).unwrap(), data);
    }
}
