//! The action wire format consumed by the query executor.
//!
//! Actions are serialized as a tagged union on the `method` field:
//! `resources/attachment`, `resources/load` and `resources/observe`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::MimeType;
use crate::uri::{ObservableUri, Reference, Suffix, WebUrl};

/// How eagerly a resource should be refreshed.
///
/// Ordered `none < auto < force`; coalescing requests keeps the strongest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Never read from the connector; use the cache only.
    #[default]
    None,
    /// Read when the cache is missing or expired.
    Auto,
    /// Always re-read from the connector.
    Force,
}

/// The stronger of two load modes.
#[must_use]
pub fn max_load_mode(a: LoadMode, b: LoadMode) -> LoadMode {
    a.max(b)
}

///
/// Attachment
///

/// The payload of an attachment action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AttachmentData {
    /// Inline binary content.
    Blob {
        /// MIME type of the payload.
        mime_type: MimeType,
        /// Base64 payload.
        blob: String,
    },
    /// Inline text content.
    Plain {
        /// MIME type, defaulting to plain text.
        #[serde(default = "mime_plain")]
        mime_type: MimeType,
        /// The text.
        text: String,
    },
    /// Content hosted at a URL.
    Url {
        /// MIME type, when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<MimeType>,
        /// When the URL stops working, for signed URLs.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expiry: Option<DateTime<Utc>>,
        /// Where to fetch the bytes.
        download_url: WebUrl,
    },
}

fn mime_plain() -> MimeType {
    #[allow(clippy::unwrap_used)]
    MimeType::decode("text/plain").unwrap()
}

/// Upload a file (binary or text) into the knowledge graph.
///
/// Attachments serve as a "default" when the connector cannot read the
/// content of an affordance: services can upload files from a conversation
/// without overriding the real resource. An attached file is automatically
/// ingested as `body` and/or `plain` when its format supports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcesAttachmentAction {
    /// The resource (or alias URL) the attachment belongs to.
    pub uri: Reference,
    /// Display name, when provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Description, when provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The payload.
    pub attachment: AttachmentData,
}

///
/// Load and observe
///

/// Return the resource metadata, refreshing and ingesting as needed.
///
/// When `expand_depth > 0`, related resources are also returned; unless
/// `expand_mode` overrides it, related items are only resolved, not
/// refreshed. When `observe` is provided, the listed observations are also
/// returned, along with embedded observations and referenced resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcesLoadAction {
    /// The resource (or alias URL) to load.
    pub uri: Reference,
    /// How many relation hops to expand.
    #[serde(default)]
    pub expand_depth: u32,
    /// Load mode applied to expanded relations.
    #[serde(default)]
    pub expand_mode: LoadMode,
    /// Load mode applied to the resource itself.
    #[serde(default = "default_load_mode")]
    pub load_mode: LoadMode,
    /// The observables to return.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub observe: Vec<Suffix>,
}

const fn default_load_mode() -> LoadMode {
    LoadMode::Auto
}

/// Return one observation (along with its embeds), refreshing the cache
/// when updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcesObserveAction {
    /// The observable to read.
    pub uri: ObservableUri,
}

/// Any action accepted by the executor, tagged on `method`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum QueryAction {
    /// `resources/attachment`.
    #[serde(rename = "resources/attachment")]
    Attachment(ResourcesAttachmentAction),
    /// `resources/load`.
    #[serde(rename = "resources/load")]
    Load(ResourcesLoadAction),
    /// `resources/observe`.
    #[serde(rename = "resources/observe")]
    Observe(ResourcesObserveAction),
}

impl QueryAction {
    /// The reference the action targets.
    #[must_use]
    pub fn reference(&self) -> Reference {
        match self {
            Self::Attachment(action) => action.uri.clone(),
            Self::Load(action) => action.uri.clone(),
            Self::Observe(action) => action.uri.clone().into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_load_mode_ordering() {
        assert_eq!(max_load_mode(LoadMode::None, LoadMode::Auto), LoadMode::Auto);
        assert_eq!(max_load_mode(LoadMode::Auto, LoadMode::Force), LoadMode::Force);
        assert_eq!(max_load_mode(LoadMode::None, LoadMode::None), LoadMode::None);
        assert!(LoadMode::Force > LoadMode::Auto);
    }

    #[test]
    fn test_load_action_wire_format() {
        let json = r#"{
            "method": "resources/load",
            "uri": "ndk://stub/-/dir/example",
            "expand_depth": 1,
            "expand_mode": "auto",
            "load_mode": "force",
            "observe": ["$body", "$collection"]
        }"#;
        let action: QueryAction = serde_json::from_str(json).unwrap();

        let QueryAction::Load(load) = &action else {
            panic!("expected a load action");
        };
        assert_eq!(load.expand_depth, 1);
        assert_eq!(load.expand_mode, LoadMode::Auto);
        assert_eq!(load.load_mode, LoadMode::Force);
        assert_eq!(load.observe, vec![Suffix::body(), Suffix::collection()]);

        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["method"], "resources/load");
        let back: QueryAction = serde_json::from_value(value).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn test_load_action_defaults() {
        let json = r#"{"method": "resources/load", "uri": "https://example.com/page"}"#;
        let QueryAction::Load(load) = serde_json::from_str::<QueryAction>(json).unwrap() else {
            panic!("expected a load action");
        };
        assert_eq!(load.expand_depth, 0);
        assert_eq!(load.expand_mode, LoadMode::None);
        assert_eq!(load.load_mode, LoadMode::Auto);
        assert!(load.observe.is_empty());
    }

    #[test]
    fn test_observe_action_requires_observable_uri() {
        let json = r#"{"method": "resources/observe", "uri": "ndk://stub/-/dir/example/$chunk/01"}"#;
        let action: QueryAction = serde_json::from_str(json).unwrap();
        assert!(matches!(action, QueryAction::Observe(_)));

        // A bare resource URI is not observable.
        let json = r#"{"method": "resources/observe", "uri": "ndk://stub/-/dir/example"}"#;
        assert!(serde_json::from_str::<QueryAction>(json).is_err());
    }

    #[test]
    fn test_attachment_action_wire_format() {
        let json = r#"{
            "method": "resources/attachment",
            "uri": "ndk://stub/-/dir/example",
            "name": "notes.txt",
            "attachment": {"type": "plain", "text": "hello"}
        }"#;
        let QueryAction::Attachment(attachment) =
            serde_json::from_str::<QueryAction>(json).unwrap()
        else {
            panic!("expected an attachment action");
        };
        assert_eq!(attachment.name.as_deref(), Some("notes.txt"));
        assert!(matches!(
            &attachment.attachment,
            AttachmentData::Plain { mime_type, text }
                if mime_type.as_str() == "text/plain" && text == "hello"
        ));
    }
}
