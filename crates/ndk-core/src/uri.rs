//! The URI algebra: canonical identifiers for resources, affordances and
//! observables, plus restricted external web URLs.
//!
//! A resource URI has the form `ndk://<realm>/<subrealm>/<path>+` and acts as
//! the stable identity of a resource. Think of these as IDs rather than true
//! URIs: their purpose is to provide a unified view on all resources and to
//! deduplicate among equivalent ways of expressing a location (e.g. multiple
//! web URLs to the same file). Resources reference each other with these URIs,
//! forming the knowledge graph agents traverse.
//!
//! Every suffix begins with `$<kind>`:
//!
//! | kind | category | path form |
//! |------|----------|-----------|
//! | `body` | affordance + observable | empty |
//! | `chunk` | observable | two-digit indices |
//! | `media` | observable | filename components |
//! | `collection` | affordance + observable | empty |
//! | `file` | affordance + observable | filename components |
//! | `plain` | affordance + observable | empty |
//!
//! Holding a URI guarantees neither that the resource exists nor that the
//! client may access it.
//!
//! ## Invariants
//!
//! - Parsing never returns partial values; failures are [`Error::BadUri`]
//!   with a short reason.
//! - Every parsed URI round-trips to the identical string.
//! - The regex identities exported here are part of the wire contract.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::data::{FileName, MimeType, REGEX_FILENAME};
use crate::error::{Error, Result};

/// Realm pattern: routes a resource to the connector that owns it.
pub const REGEX_REALM: &str = r"[a-z][a-z0-9]+(?:-[a-z0-9]+)*";

/// Web domain pattern for external URLs.
pub const REGEX_WEB_DOMAIN: &str = r"[a-zA-Z0-9][a-zA-Z0-9\-.]+\.[a-zA-Z]{2,}";

/// Restricted character class for external URLs (no `" * < > [ \ ]`).
pub const REGEX_WEB_URL_CHAR: &str =
    r"(?:[a-zA-Z0-9]|[!$&\(\)+,\-./:=@_~]|(?:%[0-9a-fA-F][0-9a-fA-F]))";

/// Resource URI pattern: `ndk://<realm>` plus at least two more components.
#[must_use]
pub fn regex_resource_uri() -> String {
    format!(r"ndk://{REGEX_REALM}(?:/{REGEX_FILENAME}){{2,}}")
}

/// Knowledge-suffix pattern: `$<kind>` plus optional path components.
#[must_use]
pub fn regex_suffix() -> String {
    format!(r"\$[a-z]+(?:/{REGEX_FILENAME})*")
}

/// Knowledge URI pattern: a resource URI with an optional suffix.
#[must_use]
pub fn regex_knowledge_uri() -> String {
    format!("{}(?:/{})?", regex_resource_uri(), regex_suffix())
}

/// External URL pattern: restricted HTTPS URL.
#[must_use]
pub fn regex_web_url() -> String {
    format!(
        r"https?://{REGEX_WEB_DOMAIN}(?::\d+)?(?:/{c}*)?(?:\?{c}*)?(?:#{c}*)?",
        c = REGEX_WEB_URL_CHAR
    )
}

/// Reference pattern: a knowledge URI or an external URL.
#[must_use]
pub fn regex_reference() -> String {
    format!("{}|{}", regex_knowledge_uri(), regex_web_url())
}

/// Canonical example external URLs, used in schemas and tests.
#[must_use]
pub fn external_uri_examples() -> Vec<&'static str> {
    vec![
        "https://example.com",
        "https://example.com/mypage.html?queryParam=42#fragment",
        "https://mycompany.atlassian.net/browse/PROJ-123",
    ]
}

static RE_REALM: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(&format!("^{REGEX_REALM}$")).unwrap()
});

static RE_WEB_URL: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(&format!("^(?:{})$", regex_web_url())).unwrap()
});

static RE_CHUNK_INDEX: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[0-9]{2,}$").unwrap()
});

static RE_QUERY_PATH: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(&format!(r"^(?:/{REGEX_FILENAME})+/?$")).unwrap()
});

static RE_QUERY_PATH_PREFIX: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(&format!(r"^(?:/{REGEX_FILENAME})+/?&")).unwrap()
});

/// URL path prefixes stripped during parsing and restored on serialization.
const WEB_URL_PATH_PREFIXES: &[&str] = &[":f:/r/", ":u:/r/"];

///
/// Realm
///

/// The realm of a resource: the prefix that routes actions to the connector
/// (or backend service) that owns the resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Realm(String);

impl Realm {
    /// Parse a realm, validating the lowercase-dashed pattern.
    pub fn decode(value: &str) -> Result<Self> {
        if RE_REALM.is_match(value) {
            Ok(Self(value.to_string()))
        } else {
            Err(Error::bad_uri("Realm", "expected pattern", value))
        }
    }

    /// Parse a realm, returning `None` on mismatch.
    #[must_use]
    pub fn try_decode(value: &str) -> Option<Self> {
        Self::decode(value).ok()
    }

    /// The validated string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Realm {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::decode(&value)
    }
}

impl From<Realm> for String {
    fn from(value: Realm) -> Self {
        value.0
    }
}

///
/// Knowledge suffix
///

/// The closed set of suffix kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SuffixKind {
    /// The LLM-consumable representation, broken into chunks and media.
    Body,
    /// A bounded slice of a body, addressed by two-digit indices.
    Chunk,
    /// An embedded binary within a body.
    Media,
    /// The children of a container resource.
    Collection,
    /// The raw file, downloadable for tools.
    File,
    /// The raw text without markup conversion.
    Plain,
}

impl SuffixKind {
    /// Case-sensitive dispatch on the kind name.
    #[must_use]
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "body" => Some(Self::Body),
            "chunk" => Some(Self::Chunk),
            "media" => Some(Self::Media),
            "collection" => Some(Self::Collection),
            "file" => Some(Self::File),
            "plain" => Some(Self::Plain),
            _ => None,
        }
    }

    /// The kind name used in the `$<kind>` prefix.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Body => "body",
            Self::Chunk => "chunk",
            Self::Media => "media",
            Self::Collection => "collection",
            Self::File => "file",
            Self::Plain => "plain",
        }
    }

    /// Whether this kind identifies a perspective of its own.
    ///
    /// `chunk` and `media` only exist inside a `body`.
    #[must_use]
    pub const fn is_affordance(self) -> bool {
        !matches!(self, Self::Chunk | Self::Media)
    }

    /// The affordance kind this kind is rooted in.
    #[must_use]
    pub const fn affordance_root(self) -> Self {
        match self {
            Self::Chunk | Self::Media => Self::Body,
            other => other,
        }
    }
}

impl fmt::Display for SuffixKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A knowledge suffix: a kind plus an optional path within it.
///
/// An "affordance" suffix identifies a perspective that can be taken on a
/// resource; an "observable" suffix identifies an addressable sub-part of a
/// perspective (e.g. a `chunk` inside a `body`). All suffix kinds can appear
/// in observable position; only [`SuffixKind::is_affordance`] kinds can key a
/// bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Suffix {
    kind: SuffixKind,
    path: Vec<FileName>,
}

impl Suffix {
    /// The `$body` suffix.
    #[must_use]
    pub const fn body() -> Self {
        Self {
            kind: SuffixKind::Body,
            path: Vec::new(),
        }
    }

    /// The `$collection` suffix.
    #[must_use]
    pub const fn collection() -> Self {
        Self {
            kind: SuffixKind::Collection,
            path: Vec::new(),
        }
    }

    /// The `$plain` suffix.
    #[must_use]
    pub const fn plain() -> Self {
        Self {
            kind: SuffixKind::Plain,
            path: Vec::new(),
        }
    }

    /// A `$file` suffix with the given path.
    #[must_use]
    pub fn file(path: Vec<FileName>) -> Self {
        Self {
            kind: SuffixKind::File,
            path,
        }
    }

    /// A `$media` suffix with the given path.
    #[must_use]
    pub fn media(path: Vec<FileName>) -> Self {
        Self {
            kind: SuffixKind::Media,
            path,
        }
    }

    /// A `$chunk` suffix addressing the given index path.
    ///
    /// Components are zero-padded to two digits; wider indices keep their
    /// natural width, which preserves radix ordering within a section.
    #[must_use]
    pub fn chunk(indexes: &[u32]) -> Self {
        Self {
            kind: SuffixKind::Chunk,
            path: indexes
                .iter()
                .map(|index| {
                    // The formatted component always matches the filename class.
                    #[allow(clippy::unwrap_used)]
                    FileName::decode(&format!("{index:02}")).unwrap()
                })
                .collect(),
        }
    }

    /// Parse a `$<kind>(/<component>)*` suffix string.
    pub fn parse_suffix(suffix: &str) -> Result<Self> {
        let body = suffix
            .strip_prefix('$')
            .ok_or_else(|| Error::bad_uri("Suffix", "expected '$' prefix", suffix))?;

        let mut segments = body.split('/');
        let kind_str = segments.next().unwrap_or_default();
        let kind = SuffixKind::from_kind(kind_str)
            .ok_or_else(|| Error::bad_uri("Suffix", "unknown suffix kind", suffix))?;

        let path = segments
            .map(FileName::decode)
            .collect::<Result<Vec<_>>>()
            .map_err(|_| Error::bad_uri("Suffix", "invalid path component", suffix))?;

        Self::validated(kind, path)
            .ok_or_else(|| Error::bad_uri("Suffix", "invalid path for kind", suffix))
    }

    /// Validate the path form for a kind, returning the suffix when legal.
    #[must_use]
    pub fn validated(kind: SuffixKind, path: Vec<FileName>) -> Option<Self> {
        let path_ok = match kind {
            SuffixKind::Body | SuffixKind::Collection | SuffixKind::Plain => path.is_empty(),
            SuffixKind::Chunk => path.iter().all(|p| RE_CHUNK_INDEX.is_match(p.as_str())),
            SuffixKind::Media | SuffixKind::File => true,
        };
        path_ok.then_some(Self { kind, path })
    }

    /// The suffix kind.
    #[must_use]
    pub const fn kind(&self) -> SuffixKind {
        self.kind
    }

    /// The path components within the suffix.
    #[must_use]
    pub fn path(&self) -> &[FileName] {
        &self.path
    }

    /// The path joined with `/`, e.g. `figures/image.png`.
    #[must_use]
    pub fn path_str(&self) -> String {
        self.path
            .iter()
            .map(FileName::as_str)
            .collect::<Vec<_>>()
            .join("/")
    }

    /// The serialized `$<kind>(/<component>)*` form.
    #[must_use]
    pub fn as_suffix(&self) -> String {
        let mut out = format!("${}", self.kind);
        for part in &self.path {
            out.push('/');
            out.push_str(part.as_str());
        }
        out
    }

    /// The affordance this suffix belongs to.
    ///
    /// Chunks and media resolve to `$body`; a `$file` path keeps its path
    /// since each file variant is its own perspective.
    #[must_use]
    pub fn affordance(&self) -> Self {
        match self.kind {
            SuffixKind::Chunk | SuffixKind::Media => Self::body(),
            _ => self.clone(),
        }
    }

    /// The root observable covering this suffix (`$chunk/01` → `$body`).
    #[must_use]
    pub fn root(&self) -> Self {
        match self.kind {
            SuffixKind::Chunk | SuffixKind::Media => Self::body(),
            _ => self.clone(),
        }
    }

    /// The numeric index path of a `$chunk` suffix; empty for the root chunk.
    #[must_use]
    pub fn chunk_indexes(&self) -> Vec<u32> {
        self.path
            .iter()
            .filter_map(|part| part.as_str().parse::<u32>().ok())
            .collect()
    }
}

impl fmt::Display for Suffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_suffix())
    }
}

impl TryFrom<String> for Suffix {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse_suffix(&value)
    }
}

impl From<Suffix> for String {
    fn from(value: Suffix) -> Self {
        value.as_suffix()
    }
}

impl PartialOrd for Suffix {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Suffix {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_suffix().cmp(&other.as_suffix())
    }
}

///
/// Resource URI
///

/// The unique identifier of a resource.
///
/// Includes the `realm` (which connector handles it), the `subrealm` (where
/// the resource lives within the realm) and the `path` (its unique ID within
/// the subrealm). The resource URI never mentions an affordance: it is used
/// to load metadata, while affordance/observable URIs read content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceUri {
    realm: Realm,
    subrealm: FileName,
    path: Vec<FileName>,
}

impl ResourceUri {
    /// Parse a `ndk://<realm>/<subrealm>/<path>+` string.
    pub fn decode(value: &str) -> Result<Self> {
        let rest = value
            .strip_prefix("ndk://")
            .ok_or_else(|| Error::bad_uri("ResourceUri", "invalid scheme", value))?;

        let mut segments = rest.splitn(3, '/');
        let realm_str = segments.next().unwrap_or_default();
        let subrealm_str = segments.next().unwrap_or_default();
        let path_str = segments.next().unwrap_or_default();

        let realm = Realm::try_decode(realm_str)
            .ok_or_else(|| Error::bad_uri("ResourceUri", "invalid realm", value))?;
        let subrealm = FileName::try_decode(subrealm_str)
            .ok_or_else(|| Error::bad_uri("ResourceUri", "invalid subrealm", value))?;
        if path_str.is_empty() {
            return Err(Error::bad_uri("ResourceUri", "missing path", value));
        }
        let path = path_str
            .split('/')
            .map(FileName::decode)
            .collect::<Result<Vec<_>>>()
            .map_err(|_| Error::bad_uri("ResourceUri", "invalid path", value))?;

        Ok(Self {
            realm,
            subrealm,
            path,
        })
    }

    /// Parse a resource URI, returning `None` on mismatch.
    #[must_use]
    pub fn try_decode(value: &str) -> Option<Self> {
        Self::decode(value).ok()
    }

    /// The realm routing this resource to its connector.
    #[must_use]
    pub const fn realm(&self) -> &Realm {
        &self.realm
    }

    /// The subrealm within the realm.
    #[must_use]
    pub const fn subrealm(&self) -> &FileName {
        &self.subrealm
    }

    /// The path components identifying the resource in the subrealm.
    #[must_use]
    pub fn path(&self) -> &[FileName] {
        &self.path
    }

    /// A child resource with extra path components appended.
    #[must_use]
    pub fn child(&self, child_path: Vec<FileName>) -> Self {
        let mut path = self.path.clone();
        path.extend(child_path);
        Self {
            realm: self.realm.clone(),
            subrealm: self.subrealm.clone(),
            path,
        }
    }

    /// The affordance URI for a perspective on this resource.
    ///
    /// Callers must pass an affordance-kind suffix; see
    /// [`SuffixKind::is_affordance`].
    #[must_use]
    pub fn child_affordance(&self, suffix: Suffix) -> AffordanceUri {
        debug_assert!(suffix.kind().is_affordance());
        AffordanceUri {
            resource: self.clone(),
            suffix,
        }
    }

    /// The observable URI for a sub-part of this resource.
    #[must_use]
    pub fn child_observable(&self, suffix: Suffix) -> ObservableUri {
        ObservableUri {
            resource: self.clone(),
            suffix,
        }
    }

    /// The filename to use when one is required (e.g. uploading a file):
    /// the last component of the resource path.
    #[must_use]
    pub fn guess_filename(&self) -> Option<FileName> {
        self.path.last().cloned()
    }
}

impl fmt::Display for ResourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ndk://{}/{}", self.realm, self.subrealm)?;
        for part in &self.path {
            write!(f, "/{part}")?;
        }
        Ok(())
    }
}

impl FromStr for ResourceUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

impl TryFrom<String> for ResourceUri {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::decode(&value)
    }
}

impl From<ResourceUri> for String {
    fn from(value: ResourceUri) -> Self {
        value.to_string()
    }
}

impl PartialOrd for ResourceUri {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourceUri {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Ordering is lexicographic on the serialized form.
        self.to_string().cmp(&other.to_string())
    }
}

///
/// Affordance and observable URIs
///

macro_rules! suffixed_uri {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name {
            resource: ResourceUri,
            suffix: Suffix,
        }

        impl $name {
            /// The resource this URI belongs to.
            #[must_use]
            pub const fn resource_uri(&self) -> &ResourceUri {
                &self.resource
            }

            /// The suffix identifying the perspective or sub-part.
            #[must_use]
            pub const fn suffix(&self) -> &Suffix {
                &self.suffix
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}/{}", self.resource, self.suffix.as_suffix())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::decode(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(value: String) -> Result<Self> {
                Self::decode(&value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.to_string()
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.to_string().cmp(&other.to_string())
            }
        }
    };
}

suffixed_uri!(
    AffordanceUri,
    "A resource URI plus an affordance suffix, identifying a perspective."
);
suffixed_uri!(
    ObservableUri,
    "A resource URI plus an observable suffix, identifying a sub-part."
);

fn split_suffixed(value: &str) -> Result<(ResourceUri, Suffix)> {
    let Some((resource_str, suffix_str)) = value.split_once("/$") else {
        return Err(Error::bad_uri("KnowledgeUri", "missing suffix", value));
    };
    if suffix_str.contains("/$") {
        return Err(Error::bad_uri("KnowledgeUri", "multiple suffixes", value));
    }
    let resource = ResourceUri::decode(resource_str)
        .map_err(|_| Error::bad_uri("KnowledgeUri", "invalid resource", value))?;
    let suffix = Suffix::parse_suffix(&format!("${suffix_str}"))
        .map_err(|_| Error::bad_uri("KnowledgeUri", "invalid suffix", value))?;
    Ok((resource, suffix))
}

impl AffordanceUri {
    /// Parse an affordance URI, requiring an affordance-kind suffix.
    pub fn decode(value: &str) -> Result<Self> {
        let (resource, suffix) = split_suffixed(value)?;
        if !suffix.kind().is_affordance() {
            return Err(Error::bad_uri("AffordanceUri", "observable suffix", value));
        }
        Ok(Self { resource, suffix })
    }

    /// The same location in observable position.
    #[must_use]
    pub fn as_observable(&self) -> ObservableUri {
        ObservableUri {
            resource: self.resource.clone(),
            suffix: self.suffix.clone(),
        }
    }
}

impl ObservableUri {
    /// Parse an observable URI; any suffix kind is accepted.
    pub fn decode(value: &str) -> Result<Self> {
        let (resource, suffix) = split_suffixed(value)?;
        Ok(Self { resource, suffix })
    }

    /// Parse an observable URI, returning `None` on mismatch.
    #[must_use]
    pub fn try_decode(value: &str) -> Option<Self> {
        Self::decode(value).ok()
    }

    /// The affordance URI this observable lives under.
    #[must_use]
    pub fn affordance_uri(&self) -> AffordanceUri {
        AffordanceUri {
            resource: self.resource.clone(),
            suffix: self.suffix.affordance(),
        }
    }

    /// The root observable URI (`$chunk/01/02` → `$body`).
    #[must_use]
    pub fn root_uri(&self) -> Self {
        let root = self.suffix.root();
        if root == self.suffix {
            self.clone()
        } else {
            Self {
                resource: self.resource.clone(),
                suffix: root,
            }
        }
    }
}

///
/// Knowledge URI
///

/// Any URI under the `ndk://` scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KnowledgeUri {
    /// A bare resource identity.
    Resource(ResourceUri),
    /// A perspective on a resource.
    Affordance(AffordanceUri),
    /// A sub-part of a perspective.
    Observable(ObservableUri),
}

impl KnowledgeUri {
    /// Parse any `ndk://` URI.
    ///
    /// A suffixed URI parses to the observable variant; affordance URIs are
    /// produced by constructors and typed conversion, since both serialize
    /// identically.
    pub fn decode(value: &str) -> Result<Self> {
        if value.contains("/$") {
            Ok(Self::Observable(ObservableUri::decode(value)?))
        } else {
            Ok(Self::Resource(ResourceUri::decode(value)?))
        }
    }

    /// Parse a knowledge URI, returning `None` on mismatch.
    #[must_use]
    pub fn try_decode(value: &str) -> Option<Self> {
        Self::decode(value).ok()
    }

    /// The resource identity, with any suffix stripped.
    #[must_use]
    pub fn resource_uri(&self) -> ResourceUri {
        match self {
            Self::Resource(uri) => uri.clone(),
            Self::Affordance(uri) => uri.resource_uri().clone(),
            Self::Observable(uri) => uri.resource_uri().clone(),
        }
    }

    /// The suffix, when present.
    #[must_use]
    pub fn suffix(&self) -> Option<&Suffix> {
        match self {
            Self::Resource(_) => None,
            Self::Affordance(uri) => Some(uri.suffix()),
            Self::Observable(uri) => Some(uri.suffix()),
        }
    }

    /// Containment test: `true` when `parent_or_self` equals this URI or
    /// this URI lies under it.
    ///
    /// - Under a resource URI: any URI of the same resource, or a resource
    ///   whose serialized form extends it with `/`.
    /// - Under an affordance URI: observables whose affordance matches.
    #[must_use]
    pub fn is_child_or(&self, parent_or_self: &Self) -> bool {
        if self == parent_or_self {
            return true;
        }

        match parent_or_self {
            Self::Resource(parent) => match self {
                Self::Resource(child) => child
                    .to_string()
                    .starts_with(&format!("{parent}/")),
                _ => self.resource_uri() == *parent,
            },
            Self::Affordance(parent) => {
                if self.resource_uri() != *parent.resource_uri() {
                    return false;
                }
                match self {
                    Self::Observable(child) => child.suffix().affordance() == *parent.suffix(),
                    _ => false,
                }
            },
            Self::Observable(_) => false,
        }
    }
}

impl fmt::Display for KnowledgeUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource(uri) => uri.fmt(f),
            Self::Affordance(uri) => uri.fmt(f),
            Self::Observable(uri) => uri.fmt(f),
        }
    }
}

impl TryFrom<String> for KnowledgeUri {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::decode(&value)
    }
}

impl From<KnowledgeUri> for String {
    fn from(value: KnowledgeUri) -> Self {
        value.to_string()
    }
}

impl From<ResourceUri> for KnowledgeUri {
    fn from(value: ResourceUri) -> Self {
        Self::Resource(value)
    }
}

impl From<AffordanceUri> for KnowledgeUri {
    fn from(value: AffordanceUri) -> Self {
        Self::Affordance(value)
    }
}

impl From<ObservableUri> for KnowledgeUri {
    fn from(value: ObservableUri) -> Self {
        Self::Observable(value)
    }
}

impl PartialOrd for KnowledgeUri {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KnowledgeUri {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

///
/// External URI
///

/// An external reference; currently always a restricted web URL.
pub type ExternalUri = WebUrl;

/// A restricted HTTPS URL.
///
/// Used as an alias for a resource, a citation URL or a download URL. Not
/// all valid URLs are supported: the disallowed characters are `" * < > [ \ ]`,
/// the port is normalized away when default, and [`WebUrl::clean`] produces a
/// canonical form with sorted query parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WebUrl {
    domain: String,
    port: u16,
    path: String,
    path_prefix: Option<String>,
    query_path: Option<String>,
    query: Vec<(String, String)>,
    fragment: String,
}

impl WebUrl {
    /// Parse a restricted HTTPS URL.
    pub fn decode(value: &str) -> Result<Self> {
        if !RE_WEB_URL.is_match(value) {
            return Err(Error::bad_uri("WebUrl", "expected pattern", value));
        }
        let rest = value
            .strip_prefix("https://")
            .ok_or_else(|| Error::bad_uri("WebUrl", "invalid scheme", value))?;

        let (rest, fragment) = match rest.split_once('#') {
            Some((head, frag)) => (head, frag.to_string()),
            None => (rest, String::new()),
        };
        let (rest, query_str) = match rest.split_once('?') {
            Some((head, query)) => (head, query.to_string()),
            None => (rest, String::new()),
        };
        let (netloc, path_str) = match rest.split_once('/') {
            Some((netloc, path)) => (netloc, path.to_string()),
            None => (rest, String::new()),
        };

        let netloc = netloc.to_ascii_lowercase();
        let (domain, port) = match netloc.split_once(':') {
            Some((domain, port_str)) => {
                let port: u16 = port_str
                    .parse()
                    .map_err(|_| Error::bad_uri("WebUrl", "bad port", value))?;
                (domain.to_string(), port)
            },
            None => (netloc, 443),
        };
        if domain.is_empty() {
            return Err(Error::bad_uri("WebUrl", "missing domain", value));
        }

        // Special case for query strings of the form
        // "?/suites/view/4252" or "?/suites/view/4252&group_by=...".
        let (query_path, query_params) = if RE_QUERY_PATH.is_match(&query_str) {
            (Some(query_str.clone()), String::new())
        } else if RE_QUERY_PATH_PREFIX.is_match(&query_str) {
            match query_str.split_once('&') {
                Some((qpath, params)) => (Some(qpath.to_string()), params.to_string()),
                None => (None, query_str.clone()),
            }
        } else {
            (None, query_str)
        };

        let mut path = path_str;
        let mut path_prefix = None;
        for prefix in WEB_URL_PATH_PREFIXES {
            if let Some(stripped) = path.strip_prefix(prefix) {
                path_prefix = Some((*prefix).to_string());
                path = stripped.to_string();
                break;
            }
        }

        let query = query_params
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((key, val)) => (key.to_string(), val.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();

        Ok(Self {
            domain,
            port,
            path,
            path_prefix,
            query_path,
            query,
            fragment,
        })
    }

    /// Parse a web URL, returning `None` on mismatch.
    #[must_use]
    pub fn try_decode(value: &str) -> Option<Self> {
        Self::decode(value).ok()
    }

    /// The lowercase domain.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The port (443 when unspecified).
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// The path without leading slash and without the stripped prefix.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The query-path special case (`index.php?/suites/view/4252`).
    #[must_use]
    pub fn query_path(&self) -> Option<&str> {
        self.query_path.as_deref()
    }

    /// The query parameters in appearance order.
    #[must_use]
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// The fragment without `#`.
    #[must_use]
    pub fn fragment(&self) -> &str {
        &self.fragment
    }

    /// The first value of a query parameter, when present.
    #[must_use]
    pub fn get_query(&self, param: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == param)
            .map(|(_, value)| value.as_str())
    }

    /// The canonical form: sorted query parameters.
    #[must_use]
    pub fn clean(&self) -> Self {
        let mut query = self.query.clone();
        query.sort();
        Self {
            query,
            ..self.clone()
        }
    }

    /// Infer a default filename from the last URL path component.
    ///
    /// When there is no extension, assume a web page and append the extension
    /// of `default_mime`; a `Content-Disposition` header should override this
    /// when incorrect.
    #[must_use]
    pub fn guess_filename(&self, default_mime: Option<&MimeType>) -> Option<FileName> {
        let last_component = self
            .path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        let filename = FileName::try_decode(last_component)?;
        if !filename.as_str().contains('.') {
            if let Some(ext) = default_mime.and_then(MimeType::guess_extension) {
                return Some(filename.with_ext(ext));
            }
        }
        Some(filename)
    }

    /// Given an `href` found on this page, build the corresponding URL.
    ///
    /// Full URLs are returned as-is; absolute paths resolve on the same
    /// domain; relative paths join onto the current path.
    #[must_use]
    pub fn try_join_href(&self, link_href: &str) -> Option<Self> {
        if link_href.starts_with("https://") {
            return Self::try_decode(link_href);
        }
        let base = url::Url::parse(&self.to_string()).ok()?;
        let joined = base.join(link_href).ok()?;
        Self::try_decode(joined.as_str())
    }
}

impl fmt::Display for WebUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "https://{}", self.domain)?;
        if self.port != 443 && self.port != 80 {
            write!(f, ":{}", self.port)?;
        }

        let url_path = format!("{}{}", self.path_prefix.as_deref().unwrap_or(""), self.path);
        if !url_path.is_empty() {
            write!(f, "/{url_path}")?;
        }

        let params = self
            .query
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("&");
        match (&self.query_path, params.is_empty()) {
            (Some(query_path), true) => write!(f, "?{query_path}")?,
            (Some(query_path), false) => write!(f, "?{query_path}&{params}")?,
            (None, false) => write!(f, "?{params}")?,
            (None, true) => {},
        }

        if !self.fragment.is_empty() {
            write!(f, "#{}", self.fragment)?;
        }
        Ok(())
    }
}

impl FromStr for WebUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

impl TryFrom<String> for WebUrl {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::decode(&value)
    }
}

impl From<WebUrl> for String {
    fn from(value: WebUrl) -> Self {
        value.to_string()
    }
}

impl PartialOrd for WebUrl {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WebUrl {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

///
/// Reference
///

/// Any reference that can appear in content: a knowledge URI or an external
/// web URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Reference {
    /// An `ndk://` URI.
    Knowledge(KnowledgeUri),
    /// An `https://` URL.
    External(WebUrl),
}

impl Reference {
    /// Parse a reference, dispatching on the scheme.
    pub fn decode(value: &str) -> Result<Self> {
        if value.starts_with("ndk://") {
            Ok(Self::Knowledge(KnowledgeUri::decode(value)?))
        } else if value.starts_with("https://") {
            Ok(Self::External(WebUrl::decode(value)?))
        } else {
            Err(Error::bad_uri("Reference", "invalid scheme", value))
        }
    }

    /// Parse a reference, returning `None` on mismatch.
    #[must_use]
    pub fn try_decode(value: &str) -> Option<Self> {
        Self::decode(value).ok()
    }

    /// The resource identity for knowledge references; `None` for external.
    #[must_use]
    pub fn resource_uri(&self) -> Option<ResourceUri> {
        match self {
            Self::Knowledge(uri) => Some(uri.resource_uri()),
            Self::External(_) => None,
        }
    }

    /// The knowledge URI when this is an `ndk://` reference.
    #[must_use]
    pub const fn knowledge_uri(&self) -> Option<&KnowledgeUri> {
        match self {
            Self::Knowledge(uri) => Some(uri),
            Self::External(_) => None,
        }
    }

    /// Infer a default filename for the referenced content.
    #[must_use]
    pub fn guess_filename(&self, default_mime: Option<&MimeType>) -> Option<FileName> {
        match self {
            Self::Knowledge(uri) => uri.resource_uri().guess_filename(),
            Self::External(url) => url.guess_filename(default_mime),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Knowledge(uri) => uri.fmt(f),
            Self::External(url) => url.fmt(f),
        }
    }
}

impl FromStr for Reference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

impl TryFrom<String> for Reference {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::decode(&value)
    }
}

impl From<Reference> for String {
    fn from(value: Reference) -> Self {
        value.to_string()
    }
}

impl From<ObservableUri> for Reference {
    fn from(value: ObservableUri) -> Self {
        Self::Knowledge(KnowledgeUri::Observable(value))
    }
}

impl From<ResourceUri> for Reference {
    fn from(value: ResourceUri) -> Self {
        Self::Knowledge(KnowledgeUri::Resource(value))
    }
}

impl From<WebUrl> for Reference {
    fn from(value: WebUrl) -> Self {
        Self::External(value)
    }
}

impl PartialOrd for Reference {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Reference {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ROUND_TRIP_URIS: &[&str] = &[
        "ndk://jira/issue/PROJ-123",
        "ndk://stub/-/dir/example",
        "ndk://stub/-/dir/example/$body",
        "ndk://stub/-/dir/example/$chunk",
        "ndk://stub/-/dir/example/$chunk/01/02",
        "ndk://stub/-/dir/example/$collection",
        "ndk://stub/-/dir/example/$file",
        "ndk://stub/-/dir/example/$file/figures/image.png",
        "ndk://stub/-/dir/example/$file/main.tex",
        "ndk://stub/-/dir/example/$media",
        "ndk://stub/-/dir/example/$media/figure.png",
        "ndk://stub/-/dir/example/$media/figures/image.png",
        "ndk://stub/-/dir/example/$plain",
        "https://example.com",
        "https://example.com/mypage.html?queryParam=42#fragment",
        "https://mycompany.atlassian.net/browse/PROJ-123",
    ];

    #[test]
    fn test_reference_round_trip_examples() {
        // Given: representative URIs of every variant
        for value in ROUND_TRIP_URIS {
            // When: parsing and serializing
            let reference = Reference::decode(value).unwrap();

            // Then: the serialized form is byte-identical
            assert_eq!(reference.to_string(), *value, "round trip failed");
        }
    }

    #[test]
    fn test_reference_variant_dispatch() {
        assert!(matches!(
            Reference::decode("ndk://jira/issue/PROJ-123").unwrap(),
            Reference::Knowledge(KnowledgeUri::Resource(_))
        ));
        assert!(matches!(
            Reference::decode("ndk://stub/-/dir/example/$body").unwrap(),
            Reference::Knowledge(KnowledgeUri::Observable(_))
        ));
        assert!(matches!(
            Reference::decode("https://example.com").unwrap(),
            Reference::External(_)
        ));
    }

    #[test]
    fn test_reference_rejects_unknown_scheme() {
        for value in ["ftp://example.com", "example.com", "", "ndk:/jira/a/b"] {
            assert!(Reference::decode(value).is_err(), "accepted '{value}'");
        }
    }

    #[test]
    fn test_resource_uri_requires_three_components() {
        assert!(ResourceUri::decode("ndk://jira").is_err());
        assert!(ResourceUri::decode("ndk://jira/issue").is_err());
        assert!(ResourceUri::decode("ndk://jira/issue/PROJ-123").is_ok());
    }

    #[test]
    fn test_resource_uri_validates_realm() {
        // Realm must be lowercase with at least two characters.
        assert!(ResourceUri::decode("ndk://Jira/issue/PROJ-123").is_err());
        assert!(ResourceUri::decode("ndk://j/issue/PROJ-123").is_err());
        assert!(ResourceUri::decode("ndk://my-realm/issue/PROJ-123").is_ok());
    }

    #[test]
    fn test_suffix_kind_dispatch_is_case_sensitive() {
        assert_eq!(SuffixKind::from_kind("body"), Some(SuffixKind::Body));
        assert_eq!(SuffixKind::from_kind("Body"), None);
        assert_eq!(SuffixKind::from_kind("schema"), None);
    }

    #[test]
    fn test_suffix_path_forms() {
        // Body, collection, plain: no path.
        assert!(Suffix::parse_suffix("$body/extra").is_err());
        assert!(Suffix::parse_suffix("$plain/extra").is_err());
        // Chunk: two-digit (or wider) indices only.
        assert!(Suffix::parse_suffix("$chunk/01/02").is_ok());
        assert!(Suffix::parse_suffix("$chunk/1").is_err());
        assert!(Suffix::parse_suffix("$chunk/abc").is_err());
        assert!(Suffix::parse_suffix("$chunk/123").is_ok());
        // Media, file: filename components.
        assert!(Suffix::parse_suffix("$media/figures/image.png").is_ok());
        assert!(Suffix::parse_suffix("$file/main.tex").is_ok());
    }

    #[test]
    fn test_chunk_suffix_index_round_trip() {
        let suffix = Suffix::chunk(&[3, 12]);
        assert_eq!(suffix.as_suffix(), "$chunk/03/12");
        assert_eq!(suffix.chunk_indexes(), vec![3, 12]);

        let parsed = Suffix::parse_suffix("$chunk/03/12").unwrap();
        assert_eq!(parsed, suffix);
    }

    #[test]
    fn test_suffix_affordance_and_root() {
        assert_eq!(Suffix::chunk(&[1]).affordance(), Suffix::body());
        assert_eq!(
            Suffix::media(vec![FileName::decode("a.png").unwrap()]).root(),
            Suffix::body()
        );
        let file = Suffix::file(vec![FileName::decode("a.png").unwrap()]);
        assert_eq!(file.affordance(), file);
        assert_eq!(file.root(), file);
    }

    #[test]
    fn test_is_child_or() {
        let parent = KnowledgeUri::decode("ndk://stub/-/dir/example").unwrap();
        let child_resource = KnowledgeUri::decode("ndk://stub/-/dir/example/sub").unwrap();
        let sibling = KnowledgeUri::decode("ndk://stub/-/dir/example2").unwrap();
        let body = KnowledgeUri::decode("ndk://stub/-/dir/example/$body").unwrap();
        let chunk = KnowledgeUri::decode("ndk://stub/-/dir/example/$chunk/01").unwrap();
        let plain = KnowledgeUri::decode("ndk://stub/-/dir/example/$plain").unwrap();

        // Identity.
        assert!(parent.is_child_or(&parent));
        // Resource parents contain sub-resources and their suffixes.
        assert!(child_resource.is_child_or(&parent));
        assert!(body.is_child_or(&parent));
        assert!(!sibling.is_child_or(&parent));

        // Affordance parents contain their observables.
        let body_aff = KnowledgeUri::Affordance(
            ResourceUri::decode("ndk://stub/-/dir/example")
                .unwrap()
                .child_affordance(Suffix::body()),
        );
        assert!(chunk.is_child_or(&body_aff));
        assert!(!plain.is_child_or(&body_aff));
    }

    #[test]
    fn test_observable_uri_navigation() {
        let chunk = ObservableUri::decode("ndk://stub/-/dir/example/$chunk/01/02").unwrap();
        assert_eq!(
            chunk.affordance_uri().to_string(),
            "ndk://stub/-/dir/example/$body"
        );
        assert_eq!(
            chunk.root_uri().to_string(),
            "ndk://stub/-/dir/example/$body"
        );

        let plain = ObservableUri::decode("ndk://stub/-/dir/example/$plain").unwrap();
        assert_eq!(plain.root_uri(), plain);
    }

    #[test]
    fn test_affordance_uri_rejects_observable_kinds() {
        assert!(AffordanceUri::decode("ndk://stub/-/dir/example/$chunk/01").is_err());
        assert!(AffordanceUri::decode("ndk://stub/-/dir/example/$media/a.png").is_err());
        assert!(AffordanceUri::decode("ndk://stub/-/dir/example/$body").is_ok());
    }

    #[test]
    fn test_web_url_normalizes_default_port() {
        let url = WebUrl::decode("https://example.com:443/page.html").unwrap();
        assert_eq!(url.to_string(), "https://example.com/page.html");

        let url = WebUrl::decode("https://example.com:8443/page.html").unwrap();
        assert_eq!(url.to_string(), "https://example.com:8443/page.html");
    }

    #[test]
    fn test_web_url_lowercases_domain() {
        let url = WebUrl::decode("https://Example.COM/Page.html").unwrap();
        assert_eq!(url.domain(), "example.com");
        assert_eq!(url.to_string(), "https://example.com/Page.html");
    }

    #[test]
    fn test_web_url_rejects_disallowed_chars() {
        for value in [
            "https://example.com/a\"b",
            "https://example.com/a<b>",
            "https://example.com/[a]",
            "https://example.com/a*b",
        ] {
            assert!(WebUrl::decode(value).is_err(), "accepted '{value}'");
        }
    }

    #[test]
    fn test_web_url_query_path_special_case() {
        let value = "https://testrail.mycompany.com/index.php?/suites/view/4252";
        let url = WebUrl::decode(value).unwrap();
        assert_eq!(url.to_string(), value);
        assert_eq!(url.path(), "index.php");
        assert_eq!(url.query_path(), Some("/suites/view/4252"));
        assert!(url.query().is_empty());

        let value =
            "https://testrail.mycompany.com/index.php?/suites/view/4252&group_by=cases:section_id";
        let url = WebUrl::decode(value).unwrap();
        assert_eq!(url.to_string(), value);
        assert_eq!(url.query_path(), Some("/suites/view/4252"));
        assert_eq!(url.get_query("group_by"), Some("cases:section_id"));
    }

    #[test]
    fn test_web_url_clean_sorts_query() {
        let url = WebUrl::decode("https://example.com/p?b=2&a=1").unwrap();
        assert_eq!(url.clean().to_string(), "https://example.com/p?a=1&b=2");
    }

    #[test]
    fn test_web_url_guess_filename() {
        let mime_html = MimeType::decode("text/html").unwrap();
        let url = WebUrl::decode("https://example.com/docs/guide").unwrap();
        assert_eq!(
            url.guess_filename(Some(&mime_html)).unwrap().as_str(),
            "guide.html"
        );

        let url = WebUrl::decode("https://example.com/docs/file1.txt").unwrap();
        assert_eq!(url.guess_filename(None).unwrap().as_str(), "file1.txt");
    }

    #[test]
    fn test_web_url_join_href() {
        let base = WebUrl::decode("https://example.com/docs/guide.html").unwrap();
        assert_eq!(
            base.try_join_href("/other.html").unwrap().to_string(),
            "https://example.com/other.html"
        );
        assert_eq!(
            base.try_join_href("sibling.html").unwrap().to_string(),
            "https://example.com/docs/sibling.html"
        );
        assert_eq!(
            base.try_join_href("https://other.org/x").unwrap().to_string(),
            "https://other.org/x"
        );
    }

    #[test]
    fn test_reference_ordering_is_lexicographic() {
        let mut refs = vec![
            Reference::decode("ndk://stub/-/b").unwrap(),
            Reference::decode("https://example.com").unwrap(),
            Reference::decode("ndk://stub/-/a").unwrap(),
        ];
        refs.sort();
        let strings: Vec<String> = refs.iter().map(ToString::to_string).collect();
        let mut expected = strings.clone();
        expected.sort();
        assert_eq!(strings, expected);
    }

    #[test]
    fn test_serde_uses_string_form() {
        let uri: ResourceUri = serde_json::from_str("\"ndk://jira/issue/PROJ-123\"").unwrap();
        assert_eq!(
            serde_json::to_string(&uri).unwrap(),
            "\"ndk://jira/issue/PROJ-123\""
        );

        let reference: Reference =
            serde_json::from_str("\"https://example.com/p?x=1\"").unwrap();
        assert_eq!(
            serde_json::to_string(&reference).unwrap(),
            "\"https://example.com/p?x=1\""
        );
    }

    proptest::proptest! {
        #[test]
        fn test_resource_uri_round_trip_generated(
            realm in "[a-z][a-z0-9]{1,8}",
            subrealm in "[a-zA-Z0-9][a-zA-Z0-9.-]{0,8}",
            parts in proptest::collection::vec("[a-zA-Z0-9][a-zA-Z0-9.-]{0,8}", 1..4),
        ) {
            let value = format!("ndk://{realm}/{subrealm}/{}", parts.join("/"));
            let parsed = ResourceUri::decode(&value).unwrap();
            proptest::prop_assert_eq!(parsed.to_string(), value);
        }
    }
}
