//! # ndk-core
//!
//! Core library for ndk: a knowledge-graph ingestion and retrieval engine
//! that turns heterogeneous external resources (documents, web pages,
//! spreadsheets, images, code repositories) into a uniform representation
//! for LLM-driven agents.
//!
//! Agents request resources by `ndk://` URI and receive structured
//! observations: bodies broken into bounded chunks, embedded media with
//! placeholders, file references and collections. Resources reference each
//! other, forming a graph the executor expands breadth-first under a depth
//! bound.
//!
//! ## Architecture
//!
//! - **URI algebra** ([`uri`]): canonical identities for resources,
//!   affordances and observables, plus restricted external URLs.
//! - **Content model** ([`content`]): a typed stream of markdown-aware parts
//!   with lossless parsing and idempotent merging.
//! - **Chunking** ([`chunking`]): deterministic, hierarchy-preserving
//!   packing of a body into bounded chunks with a table of contents.
//! - **Rendering** ([`render`]): embed resolution against an observation
//!   pool, with split text/blob output for LLM APIs and a media cap.
//! - **Storage** ([`storage`], [`history`]): an append-only delta journal
//!   per resource with a derived merged view, persisted as YAML.
//! - **Executor** ([`query`], [`pending`]): action intake, batched
//!   expansion, cache policy and final bundle assembly.
//!
//! ## Quick start
//!
//! ```rust
//! use ndk_core::{ContentText, Reference};
//!
//! // Parse a reference and round-trip it.
//! let reference = Reference::decode("ndk://jira/issue/PROJ-123")?;
//! assert_eq!(reference.to_string(), "ndk://jira/issue/PROJ-123");
//!
//! // Parse markdown content and inspect its links.
//! let content = ContentText::parse_markdown("See <https://example.com> for details.");
//! assert_eq!(content.dep_links().len(), 1);
//! # Ok::<(), ndk_core::Error>(())
//! ```
//!
//! Pure operations (URI parsing, content merge, chunking, rendering) are
//! synchronous; everything touching the injected collaborators is async on
//! tokio. Outputs are deterministic given the same inputs: every collection
//! yielded to callers is sorted by a documented key.

/// Action wire format and load modes
pub mod action;
/// Bundles, resources and the assembled response
pub mod bundle;
/// The chunking engine
pub mod chunking;
/// Tunable budgets and limits
pub mod config;
/// Collaborator traits and the request context
pub mod connector;
/// The markdown-aware content representation
pub mod content;
/// Validated MIME types, data URIs and filename components
pub mod data;
/// Error types and result alias
pub mod error;
/// The per-resource delta journal and merged view
pub mod history;
/// Fragment ingestion: blobs, trimming, links, spreadsheets
pub mod ingestion;
/// Labels, allow/block filters and label definitions
pub mod label;
/// Label generation glue around the inference collaborator
pub mod labels;
/// Resource metadata and citations
pub mod metadata;
/// Agent-facing observations
pub mod observation;
/// Per-resource request coalescing
pub mod pending;
/// The query executor
pub mod query;
/// Embed resolution and LLM-ready output
pub mod render;
/// Typed relations between resources
pub mod relation;
/// JSON-schema emission for external consumers
pub mod schema;
/// Ordered-list primitives for deterministic output
pub mod sorted;
/// Local filesystem persistence
pub mod storage;
/// Token estimation heuristic
pub mod tokens;
/// The URI algebra
pub mod uri;

// Re-export commonly used types
pub use action::{LoadMode, QueryAction, ResourcesLoadAction, ResourcesObserveAction};
pub use bundle::{Bundle, BundleBody, Resource, ResourceError, Resources};
pub use chunking::{chunk_body, chunk_body_sync};
pub use config::Tunables;
pub use connector::{
    Connector, Downloader, Fragment, FragmentMode, ImageCodec, Inference, KnowledgeContext,
    ObservedContent, ObservedResult, ResolveResult,
};
pub use content::{ContentBlob, ContentText, LinkMode, ParseMode, Sep, TextPart};
pub use data::{DataUri, FileName, MimeType};
pub use error::{Error, ErrorInfo, Result};
pub use history::{Locator, MetadataDelta, ResourceDelta, ResourceHistory, ResourceView};
pub use label::{LabelDefinition, LabelName, ResourceFilters, ResourceLabel};
pub use metadata::{AffordanceInfo, ResourceAttrs, ResourceInfo};
pub use observation::{ObsBody, ObsChunk, ObsMedia, Observation};
pub use pending::{PendingResult, PendingState};
pub use query::{execute_query_all, execute_query_all_cancellable};
pub use relation::Relation;
pub use render::Rendered;
pub use storage::Storage;
pub use uri::{
    AffordanceUri, KnowledgeUri, ObservableUri, Realm, Reference, ResourceUri, Suffix,
    SuffixKind, WebUrl,
};
