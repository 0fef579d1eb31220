//! Typed relations between resources.
//!
//! Relations form the edges of the knowledge graph. Each relation has a
//! stable `unique_id` derived from its variant and node URIs, which is the
//! key for deduplication, persistence and deterministic ordering.

use serde::{Deserialize, Serialize};

use crate::uri::{KnowledgeUri, ResourceUri};

/// A typed edge between two resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Relation {
    /// The source's body embeds the target's content in place.
    Embed {
        /// The embedding document.
        source: KnowledgeUri,
        /// The embedded content.
        target: KnowledgeUri,
    },
    /// The source's body links to the target.
    Link {
        /// The linking document.
        source: KnowledgeUri,
        /// The linked resource.
        target: KnowledgeUri,
    },
    /// The parent's collection contains the child.
    Parent {
        /// The container resource.
        parent: ResourceUri,
        /// The contained resource.
        child: ResourceUri,
    },
    /// Connector-specific relation identified by a subkind.
    Misc {
        /// Connector-defined relation name, e.g. "duplicate".
        subkind: String,
        /// The origin resource.
        source: ResourceUri,
        /// The destination resource.
        target: ResourceUri,
    },
}

impl Relation {
    /// A link relation between resource identities.
    #[must_use]
    pub fn link(source: ResourceUri, target: ResourceUri) -> Self {
        Self::Link {
            source: KnowledgeUri::Resource(source),
            target: KnowledgeUri::Resource(target),
        }
    }

    /// An embed relation between resource identities.
    #[must_use]
    pub fn embed(source: ResourceUri, target: ResourceUri) -> Self {
        Self::Embed {
            source: KnowledgeUri::Resource(source),
            target: KnowledgeUri::Resource(target),
        }
    }

    /// The stable identifier of this relation.
    ///
    /// Derived from the variant and the node URIs, so the same edge always
    /// maps to the same id regardless of where it was recorded.
    #[must_use]
    pub fn unique_id(&self) -> String {
        match self {
            Self::Embed { source, target } => format!("embed:{source}:{target}"),
            Self::Link { source, target } => format!("link:{source}:{target}"),
            Self::Parent { parent, child } => format!("parent:{parent}:{child}"),
            Self::Misc {
                subkind,
                source,
                target,
            } => format!("misc/{subkind}:{source}:{target}"),
        }
    }

    /// The resource identities at both endpoints.
    #[must_use]
    pub fn nodes(&self) -> Vec<ResourceUri> {
        match self {
            Self::Embed { source, target } | Self::Link { source, target } => {
                vec![source.resource_uri(), target.resource_uri()]
            },
            Self::Parent { parent, child } => vec![parent.clone(), child.clone()],
            Self::Misc { source, target, .. } => vec![source.clone(), target.clone()],
        }
    }

    /// Whether `uri` is one of the relation's endpoints.
    #[must_use]
    pub fn touches(&self, uri: &ResourceUri) -> bool {
        self.nodes().contains(uri)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn uri(value: &str) -> ResourceUri {
        ResourceUri::decode(value).unwrap()
    }

    #[test]
    fn test_unique_id_is_stable_and_distinct() {
        let a = uri("ndk://jira/issue/PROJ-123");
        let b = uri("ndk://jira/issue/PROJ-456");

        let link = Relation::link(a.clone(), b.clone());
        let embed = Relation::embed(a.clone(), b.clone());
        let parent = Relation::Parent {
            parent: a.clone(),
            child: b.clone(),
        };
        let misc = Relation::Misc {
            subkind: "duplicate".into(),
            source: a.clone(),
            target: b.clone(),
        };

        let ids: Vec<String> = [&link, &embed, &parent, &misc]
            .iter()
            .map(|r| r.unique_id())
            .collect();
        // All distinct.
        for (i, id) in ids.iter().enumerate() {
            for other in &ids[i + 1..] {
                assert_ne!(id, other);
            }
        }
        // Stable across clones.
        assert_eq!(link.clone().unique_id(), link.unique_id());
    }

    #[test]
    fn test_nodes_and_touches() {
        let a = uri("ndk://jira/issue/PROJ-123");
        let b = uri("ndk://jira/issue/PROJ-456");
        let c = uri("ndk://jira/issue/PROJ-789");

        let relation = Relation::Parent {
            parent: a.clone(),
            child: b.clone(),
        };
        assert_eq!(relation.nodes(), vec![a.clone(), b.clone()]);
        assert!(relation.touches(&a));
        assert!(relation.touches(&b));
        assert!(!relation.touches(&c));
    }

    #[test]
    fn test_relation_serde_tagged_on_kind() {
        let relation = Relation::link(
            uri("ndk://jira/issue/PROJ-123"),
            uri("ndk://jira/issue/PROJ-456"),
        );
        let json = serde_json::to_value(&relation).unwrap();
        assert_eq!(json["kind"], "link");
        assert_eq!(json["source"], "ndk://jira/issue/PROJ-123");

        let back: Relation = serde_json::from_value(json).unwrap();
        assert_eq!(back, relation);
    }
}
