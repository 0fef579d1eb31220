//! Observations: the agent-facing projection of bundles.
//!
//! An observation knows how to render itself for an LLM, either as content
//! (`render_body`) or as a placeholder/table-of-contents (`render_info`), and
//! exposes its outgoing links and embeds so the executor can expand the
//! graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::{
    ContentBlob, ContentText, LinkMode, Sep, TextPart, xml_close, xml_open,
};
use crate::data::{DataUri, MimeType};
use crate::error::{Error, Result};
use crate::label::ResourceLabels;
use crate::metadata::ObservationInfo;
use crate::tokens::{IMAGE_TOKENS_ESTIMATE, estimate_tokens};
use crate::uri::{ObservableUri, Reference, ResourceUri, Suffix, WebUrl};

/// Token overhead of a multi-chunk body's surrounding document tags.
const BUFFER_TOKENS_BODY: usize = 40;

/// Token overhead per rendered section heading.
const BUFFER_TOKENS_SECTION: usize = 10;

///
/// Supporting types
///

/// Where a file's bytes can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DownloadUrl {
    /// Inline payload as a data URI.
    Data(DataUri),
    /// A web URL to download from.
    Web(WebUrl),
}

impl DownloadUrl {
    /// Parse either a `data:` URI or an `https://` URL.
    pub fn decode(value: &str) -> Result<Self> {
        if value.starts_with("data:") {
            Ok(Self::Data(DataUri::decode(value)?))
        } else if value.starts_with("https://") {
            Ok(Self::Web(WebUrl::decode(value)?))
        } else {
            Err(Error::bad_uri("DownloadUrl", "invalid scheme", value))
        }
    }
}

impl std::fmt::Display for DownloadUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data(uri) => uri.fmt(f),
            Self::Web(url) => url.fmt(f),
        }
    }
}

impl TryFrom<String> for DownloadUrl {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::decode(&value)
    }
}

impl From<DownloadUrl> for String {
    fn from(value: DownloadUrl) -> Self {
        value.to_string()
    }
}

/// The directly-held content of a body observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BodyContent {
    /// Parsed textual content.
    Text(ContentText),
    /// A single binary payload.
    Blob(ContentBlob),
}

/// The result of rendering an observation for the LLM.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderedBody {
    /// Textual parts.
    Text(ContentText),
    /// A binary block.
    Blob(ContentBlob),
}

/// Summary of one chunk in a body's table of contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsBodyChunk {
    /// The chunk's index path.
    pub indexes: Vec<u32>,
    /// Generated or provided description.
    pub description: Option<String>,
    /// Estimated token cost of reading the chunk.
    pub num_tokens: usize,
}

impl ObsBodyChunk {
    /// The chunk's observable URI under a resource.
    #[must_use]
    pub fn uri(&self, resource: &ResourceUri) -> ObservableUri {
        resource.child_observable(Suffix::chunk(&self.indexes))
    }
}

/// A section heading over a body's chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsBodySection {
    /// The section's index path.
    pub indexes: Vec<u32>,
    /// The heading text, when the section introduces one.
    pub heading: Option<String>,
}

impl ObsBodySection {
    /// The radix ordering key on two-digit components.
    #[must_use]
    pub fn indexes_str(&self) -> String {
        self.indexes
            .iter()
            .map(|index| format!("{index:02}"))
            .collect::<Vec<_>>()
            .join("/")
    }
}

///
/// Variants
///

/// The `$body` observation: content text, a blob, or a table of contents
/// over the child chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsBody {
    /// The observation's URI.
    pub uri: ObservableUri,
    /// Generated or provided description.
    pub description: Option<String>,
    /// Direct content; `None` when the body is split into chunks.
    pub content: Option<BodyContent>,
    /// Table-of-contents sections, sorted by index path.
    pub sections: Vec<ObsBodySection>,
    /// Chunk summaries, sorted by index path.
    pub chunks: Vec<ObsBodyChunk>,
}

/// A `$chunk` observation: one bounded slice of a body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsChunk {
    /// The observation's URI.
    pub uri: ObservableUri,
    /// Generated or provided description.
    pub description: Option<String>,
    /// The chunk's content.
    pub text: ContentText,
}

/// A `$media` observation: an embedded binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsMedia {
    /// The observation's URI.
    pub uri: ObservableUri,
    /// Generated or provided description.
    pub description: Option<String>,
    /// Textual drop-in used when the media cannot be viewed natively.
    pub placeholder: Option<String>,
    /// MIME type of the payload.
    pub mime_type: MimeType,
    /// Base64 payload, or an `https://` download URL.
    pub blob: String,
}

/// A `$collection` observation: the resource's children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsCollection {
    /// The observation's URI.
    pub uri: ObservableUri,
    /// Generated or provided description.
    pub description: Option<String>,
    /// Child resource URIs.
    pub results: Vec<ResourceUri>,
}

/// A `$file` observation: the raw downloadable file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsFile {
    /// The observation's URI.
    pub uri: ObservableUri,
    /// Generated or provided description.
    pub description: Option<String>,
    /// MIME type of the file, when known.
    pub mime_type: Option<MimeType>,
    /// When the download URL stops working, for signed URLs.
    pub expiry: Option<DateTime<Utc>>,
    /// Where to fetch the bytes.
    pub download_url: DownloadUrl,
}

/// A `$plain` observation: the raw text without conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsPlain {
    /// The observation's URI.
    pub uri: ObservableUri,
    /// Generated or provided description.
    pub description: Option<String>,
    /// MIME type of the text, when known.
    pub mime_type: Option<MimeType>,
    /// The raw text.
    pub text: String,
}

/// Any observation, discriminated by its suffix kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Observation {
    /// A `$body`.
    Body(ObsBody),
    /// A `$chunk`.
    Chunk(ObsChunk),
    /// A `$media`.
    Media(ObsMedia),
    /// A `$collection`.
    Collection(ObsCollection),
    /// A `$file`.
    File(ObsFile),
    /// A `$plain`.
    Plain(ObsPlain),
}

impl Observation {
    /// The observation's URI.
    #[must_use]
    pub const fn uri(&self) -> &ObservableUri {
        match self {
            Self::Body(o) => &o.uri,
            Self::Chunk(o) => &o.uri,
            Self::Media(o) => &o.uri,
            Self::Collection(o) => &o.uri,
            Self::File(o) => &o.uri,
            Self::Plain(o) => &o.uri,
        }
    }

    /// The observation's description, when any.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        match self {
            Self::Body(o) => o.description.as_deref(),
            Self::Chunk(o) => o.description.as_deref(),
            Self::Media(o) => o.description.as_deref(),
            Self::Collection(o) => o.description.as_deref(),
            Self::File(o) => o.description.as_deref(),
            Self::Plain(o) => o.description.as_deref(),
        }
    }

    /// Non-embed references this observation points at.
    #[must_use]
    pub fn dependencies(&self) -> Vec<Reference> {
        match self {
            Self::Body(o) => o.dependencies(),
            Self::Chunk(o) => o.dependencies(),
            Self::Collection(o) => {
                let mut results: Vec<Reference> =
                    o.results.iter().cloned().map(Reference::from).collect();
                results.sort();
                results
            },
            Self::Media(_) | Self::File(_) | Self::Plain(_) => Vec::new(),
        }
    }

    /// Embedded references this observation pulls in when rendered.
    #[must_use]
    pub fn embeds(&self) -> Vec<Reference> {
        match self {
            Self::Body(o) => o.embeds(),
            Self::Chunk(o) => o.embeds(),
            _ => Vec::new(),
        }
    }

    /// The summary record for tables of contents.
    #[must_use]
    pub fn info(&self) -> ObservationInfo {
        match self {
            Self::File(o) => ObservationInfo {
                suffix: o.uri.suffix().clone(),
                num_tokens: None,
                mime_type: o.mime_type.clone(),
                description: o.description.clone(),
            },
            other => ObservationInfo {
                suffix: other.uri().suffix().clone(),
                num_tokens: None,
                mime_type: None,
                description: None,
            },
        }
    }

    /// XML attributes for the observation's placeholder tag.
    #[must_use]
    pub fn info_attributes(&self) -> Vec<(String, String)> {
        let mut attributes: Vec<(String, String)> = Vec::new();
        let info = self.info();
        if let Some(mime_type) = info.mime_type {
            attributes.push(("mimetype".into(), mime_type.to_string()));
        }
        if let Some(description) = info.description {
            attributes.push(("description".into(), description));
        }

        match self {
            Self::Body(o) => {
                if let Some(BodyContent::Blob(blob)) = &o.content {
                    attributes.push(("mimetype".into(), blob.mime_type.to_string()));
                }
            },
            Self::Media(o) => {
                attributes.push(("mimetype".into(), o.mime_type.to_string()));
            },
            Self::Plain(o) => {
                if let Some(mime_type) = &o.mime_type {
                    attributes.push(("mimetype".into(), mime_type.to_string()));
                }
            },
            Self::Collection(o) => {
                if !o.results.is_empty() {
                    attributes.push(("size".into(), o.results.len().to_string()));
                }
            },
            Self::File(o) => {
                if let Some(expiry) = o.expiry {
                    attributes.push(("expiry".into(), expiry.to_rfc3339()));
                }
            },
            Self::Chunk(_) => {},
        }
        attributes
    }

    /// Render a self-closing placeholder tag for the observation.
    #[must_use]
    pub fn render_info(&self) -> Vec<TextPart> {
        match self {
            Self::Body(o) => o.render_info(),
            Self::Chunk(o) => xml_open(
                o.infer_tag(),
                Some(&o.uri.clone().into()),
                &self.info_attributes(),
                true,
            ),
            other => xml_open(
                other.uri().suffix().kind().as_str(),
                Some(&other.uri().clone().into()),
                &self.info_attributes(),
                true,
            ),
        }
    }

    /// Render the observation's content for the LLM.
    #[must_use]
    pub fn render_body(&self) -> RenderedBody {
        match self {
            Self::Body(o) => o.render_body(),
            Self::Chunk(o) => RenderedBody::Text(o.render_body()),
            Self::Media(o) => RenderedBody::Blob(o.as_blob()),
            Self::Collection(o) => RenderedBody::Text(o.render_body()),
            Self::Plain(o) => RenderedBody::Text(o.render_body()),
            Self::File(_) => RenderedBody::Text(ContentText::new(self.render_info())),
        }
    }

    /// Estimated token cost of rendering the observation.
    #[must_use]
    pub fn num_tokens(&self) -> usize {
        match self {
            Self::Body(o) => o.num_tokens(),
            Self::Chunk(o) => o.num_tokens(),
            Self::Media(_) => IMAGE_TOKENS_ESTIMATE,
            Self::Collection(o) => estimate_tokens(&o.render_body().as_str(true), 0),
            Self::Plain(o) => estimate_tokens(&o.text, 0),
            Self::File(_) => 0,
        }
    }

    /// Fill missing descriptions from generated labels.
    #[must_use]
    pub fn with_labels(&self, labels: &ResourceLabels) -> Self {
        match self {
            Self::Body(o) => Self::Body(o.with_labels(labels)),
            Self::Chunk(o) => {
                if o.description.is_none() {
                    if let Some(value) =
                        labels.get_str("description", &[o.uri.suffix().clone()])
                    {
                        return Self::Chunk(ObsChunk {
                            description: Some(value.to_string()),
                            ..o.clone()
                        });
                    }
                }
                self.clone()
            },
            Self::Media(o) => {
                let description = o.description.clone().or_else(|| {
                    labels
                        .get_str("description", &[o.uri.suffix().clone()])
                        .map(str::to_string)
                });
                let placeholder = o.placeholder.clone().or_else(|| {
                    labels
                        .get_str("placeholder", &[o.uri.suffix().clone()])
                        .map(str::to_string)
                });
                if description == o.description && placeholder == o.placeholder {
                    self.clone()
                } else {
                    Self::Media(ObsMedia {
                        description,
                        placeholder,
                        ..o.clone()
                    })
                }
            },
            _ => self.clone(),
        }
    }
}

///
/// Body
///

impl ObsBody {
    /// Non-embed links of the held content; a chunked body has none of its
    /// own.
    #[must_use]
    pub fn dependencies(&self) -> Vec<Reference> {
        match &self.content {
            Some(BodyContent::Text(text)) => text.dep_links(),
            _ => Vec::new(),
        }
    }

    /// Embeds of the held content, or the chunk URIs of a chunked body.
    #[must_use]
    pub fn embeds(&self) -> Vec<Reference> {
        match &self.content {
            Some(BodyContent::Text(text)) => text.dep_embeds(),
            Some(BodyContent::Blob(_)) => Vec::new(),
            None => self
                .chunks
                .iter()
                .map(|chunk| Reference::from(chunk.uri(self.uri.resource_uri())))
                .collect(),
        }
    }

    /// Estimated token cost: content tokens, or the summed chunk and section
    /// overheads of the table of contents.
    #[must_use]
    pub fn num_tokens(&self) -> usize {
        match &self.content {
            Some(BodyContent::Blob(_)) => IMAGE_TOKENS_ESTIMATE,
            Some(BodyContent::Text(text)) => {
                estimate_tokens(&text.as_str(false), text.dep_embeds().len())
            },
            None => {
                BUFFER_TOKENS_BODY
                    + self.chunks.iter().map(|chunk| chunk.num_tokens).sum::<usize>()
                    + self
                        .sections
                        .iter()
                        .filter_map(|section| section.heading.as_ref())
                        .map(|heading| estimate_tokens(heading, 0) + BUFFER_TOKENS_SECTION)
                        .sum::<usize>()
            },
        }
    }

    /// In placeholder mode, render the document as a table of contents:
    /// sections and chunk stubs with descriptions, but no chunk content.
    #[must_use]
    pub fn render_info(&self) -> Vec<TextPart> {
        match &self.content {
            Some(BodyContent::Text(_)) => {
                let mut attributes: Vec<(String, String)> = Vec::new();
                if let Some(description) = &self.description {
                    attributes.push(("description".into(), description.clone()));
                }
                xml_open("document", Some(&self.uri.clone().into()), &attributes, true)
            },
            Some(BodyContent::Blob(blob)) => {
                let mut attributes: Vec<(String, String)> = Vec::new();
                if let Some(description) = &self.description {
                    attributes.push(("description".into(), description.clone()));
                }
                attributes.push(("mimetype".into(), blob.mime_type.to_string()));
                xml_open("media", Some(&self.uri.clone().into()), &attributes, true)
            },
            None => self.render_toc(TocMode::Info),
        }
    }

    /// Render the body content, or the chunked table of contents with embed
    /// links.
    #[must_use]
    pub fn render_body(&self) -> RenderedBody {
        match &self.content {
            Some(BodyContent::Text(text)) => {
                let mut parts = xml_open("document", Some(&self.uri.clone().into()), &[], false);
                parts.extend(text.parts.clone());
                parts.push(xml_close("document"));
                RenderedBody::Text(ContentText::new(parts))
            },
            Some(BodyContent::Blob(blob)) => RenderedBody::Blob(blob.clone()),
            None => RenderedBody::Text(ContentText::new(self.render_toc(TocMode::Body))),
        }
    }

    fn render_toc(&self, mode: TocMode) -> Vec<TextPart> {
        let mut result: Vec<TextPart> = Vec::new();
        let attributes: Vec<(String, String)> = match (mode, &self.description) {
            (TocMode::Info, Some(description)) => {
                vec![("description".into(), description.clone())]
            },
            _ => Vec::new(),
        };
        result.extend(xml_open(
            "document",
            Some(&self.uri.clone().into()),
            &attributes,
            false,
        ));

        let resource_uri = self.uri.resource_uri().clone();
        let mut included_sections: Vec<Vec<u32>> = Vec::new();
        for chunk in &self.chunks {
            let (headings, rendered) =
                self.render_headings(&chunk.indexes, &included_sections);
            result.extend(headings);
            included_sections.extend(rendered);

            match mode {
                TocMode::Body => result.push(TextPart::link(
                    LinkMode::Embed,
                    None,
                    chunk.uri(&resource_uri).into(),
                )),
                TocMode::Info => {
                    let attributes: Vec<(String, String)> = chunk
                        .description
                        .as_ref()
                        .map(|description| {
                            vec![("description".to_string(), description.clone())]
                        })
                        .unwrap_or_default();
                    result.extend(xml_open(
                        "document-chunk",
                        Some(&chunk.uri(&resource_uri).into()),
                        &attributes,
                        true,
                    ));
                },
            }
        }

        result.push(xml_close("document"));
        result
    }

    /// The section headings to insert before a chunk, skipping sections that
    /// were already emitted at the enclosing level.
    ///
    /// Returns the heading parts and the section index paths now covered.
    #[must_use]
    pub fn render_headings(
        &self,
        chunk_indexes: &[u32],
        previous_sections: &[Vec<u32>],
    ) -> (Vec<TextPart>, Vec<Vec<u32>>) {
        let mut result: Vec<TextPart> = Vec::new();
        let mut rendered_sections: Vec<Vec<u32>> = Vec::new();

        for section in &self.sections {
            if previous_sections.contains(&section.indexes) {
                continue;
            }
            let num_indexes = section.indexes.len();
            if chunk_indexes.len() >= num_indexes
                && chunk_indexes[..num_indexes] == section.indexes[..]
            {
                rendered_sections.push(section.indexes.clone());
                if let Some(heading) = &section.heading {
                    #[allow(clippy::cast_possible_truncation)]
                    result.push(TextPart::heading(num_indexes as u8, heading.clone()));
                }
            }
        }

        (result, rendered_sections)
    }

    /// Fill missing descriptions from labels.
    #[must_use]
    pub fn with_labels(&self, labels: &ResourceLabels) -> Self {
        let description = self.description.clone().or_else(|| {
            let mut targets = vec![Suffix::body()];
            if self.content.is_none() {
                targets.push(Suffix::chunk(&[]));
            }
            labels
                .get_str("description", &targets)
                .map(str::to_string)
        });

        let chunks = self
            .chunks
            .iter()
            .map(|chunk| {
                if chunk.description.is_some() {
                    return chunk.clone();
                }
                let target = Suffix::chunk(&chunk.indexes);
                match labels.get_str("description", &[target]) {
                    Some(value) => ObsBodyChunk {
                        description: Some(value.to_string()),
                        ..chunk.clone()
                    },
                    None => chunk.clone(),
                }
            })
            .collect();

        Self {
            description,
            chunks,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TocMode {
    Body,
    Info,
}

///
/// Chunk
///

impl ObsChunk {
    /// A chunk observation at the given index path.
    #[must_use]
    pub fn new(
        resource_uri: &ResourceUri,
        indexes: &[u32],
        text: ContentText,
        description: Option<String>,
    ) -> Self {
        Self {
            uri: resource_uri.child_observable(Suffix::chunk(indexes)),
            description,
            text,
        }
    }

    fn external_refs(&self, refs: Vec<Reference>) -> Vec<Reference> {
        let own_resource = self.uri.resource_uri();
        refs.into_iter()
            .filter(|href| match href {
                Reference::Knowledge(uri) => uri.resource_uri() != *own_resource,
                Reference::External(_) => true,
            })
            .collect()
    }

    /// Non-embed links pointing outside the chunk's own resource.
    #[must_use]
    pub fn dependencies(&self) -> Vec<Reference> {
        self.external_refs(self.text.dep_links())
    }

    /// Embeds pointing outside the chunk's own resource.
    #[must_use]
    pub fn embeds(&self) -> Vec<Reference> {
        self.external_refs(self.text.dep_embeds())
    }

    /// Estimated token cost, counting embedded media.
    #[must_use]
    pub fn num_tokens(&self) -> usize {
        estimate_tokens(&self.text.as_str(false), self.text.dep_embeds().len())
    }

    /// Whether this is the whole document or a chunk of one.
    #[must_use]
    pub fn infer_tag(&self) -> &'static str {
        if self.uri.suffix().path().is_empty() {
            "document"
        } else {
            "document-chunk"
        }
    }

    /// Render the chunk's content wrapped in its document tag.
    #[must_use]
    pub fn render_body(&self) -> ContentText {
        let tag = self.infer_tag();
        let mut parts = xml_open(tag, Some(&self.uri.clone().into()), &[], false);
        parts.extend(self.text.parts.clone());
        parts.push(xml_close(tag));
        ContentText::new(parts)
    }
}

///
/// Media
///

impl ObsMedia {
    /// A media observation at the given suffix path.
    #[must_use]
    pub fn new(
        resource_uri: &ResourceUri,
        path: Vec<crate::data::FileName>,
        mime_type: MimeType,
        blob: String,
        description: Option<String>,
        placeholder: Option<String>,
    ) -> Self {
        Self {
            uri: resource_uri.child_observable(Suffix::media(path)),
            description,
            placeholder,
            mime_type,
            blob,
        }
    }

    /// Where the payload can be fetched from.
    #[must_use]
    pub fn download_url(&self) -> DownloadUrl {
        if self.blob.starts_with("https://") {
            match WebUrl::decode(&self.blob) {
                Ok(url) => DownloadUrl::Web(url),
                Err(_) => DownloadUrl::Data(DataUri::from_encoded(
                    self.mime_type.clone(),
                    self.blob.clone(),
                )),
            }
        } else {
            DownloadUrl::Data(DataUri::from_encoded(
                self.mime_type.clone(),
                self.blob.clone(),
            ))
        }
    }

    /// The blob block, using the description when no placeholder exists.
    #[must_use]
    pub fn as_blob(&self) -> ContentBlob {
        ContentBlob {
            uri: self.uri.clone().into(),
            placeholder: self.placeholder.clone().or_else(|| self.description.clone()),
            mime_type: self.mime_type.clone(),
            blob: self.blob.clone(),
        }
    }

    /// An embed link to this media.
    #[must_use]
    pub fn as_link(&self) -> TextPart {
        TextPart::link(
            LinkMode::Embed,
            self.description.as_deref(),
            self.uri.clone().into(),
        )
    }
}

///
/// Collection
///

impl ObsCollection {
    /// Render the child list.
    #[must_use]
    pub fn render_body(&self) -> ContentText {
        let mut parts: Vec<TextPart> = Vec::new();
        parts.extend(xml_open("collection", Some(&self.uri.clone().into()), &[], false));
        if self.results.is_empty() {
            parts.push(TextPart::text("empty", Sep::Newline));
        } else {
            for result in &self.results {
                parts.push(TextPart::text_sep("- ", Sep::Newline, Sep::None));
                parts.push(TextPart::link(
                    LinkMode::Markdown,
                    None,
                    Reference::from(result.clone()),
                ));
            }
        }
        parts.push(xml_close("collection"));
        ContentText::new(parts)
    }
}

///
/// Plain
///

impl ObsPlain {
    /// Render the raw text inside a fenced code block.
    #[must_use]
    pub fn render_body(&self) -> ContentText {
        let mut attributes: Vec<(String, String)> = Vec::new();
        if let Some(mime_type) = &self.mime_type {
            attributes.push(("mimetype".into(), mime_type.to_string()));
        }
        let mut parts = xml_open("plain", Some(&self.uri.clone().into()), &attributes, false);
        parts.push(self.as_code());
        parts.push(xml_close("plain"));
        ContentText::new(parts)
    }

    /// The text as a code part, with the language inferred from the MIME
    /// type.
    #[must_use]
    pub fn as_code(&self) -> TextPart {
        let language = match self.mime_type.as_ref().map(MimeType::as_str) {
            Some("text/markdown" | "text/x-markdown") => Some("markdown"),
            _ => None,
        };
        TextPart::code(&self.text, language, None).unwrap_or_else(|_| {
            // Both fences collide; fall back to the raw text.
            TextPart::text(self.text.clone(), Sep::Newline)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::content::ParseMode;

    fn resource() -> ResourceUri {
        ResourceUri::decode("ndk://stub/-/dir/example").unwrap()
    }

    fn toc_body() -> ObsBody {
        ObsBody {
            uri: resource().child_observable(Suffix::body()),
            description: Some("A sample".into()),
            content: None,
            sections: vec![
                ObsBodySection {
                    indexes: vec![1],
                    heading: Some("Methods".into()),
                },
                ObsBodySection {
                    indexes: vec![1, 0],
                    heading: Some("Setup".into()),
                },
            ],
            chunks: vec![
                ObsBodyChunk {
                    indexes: vec![0],
                    description: None,
                    num_tokens: 100,
                },
                ObsBodyChunk {
                    indexes: vec![1, 0, 0],
                    description: Some("setup details".into()),
                    num_tokens: 200,
                },
                ObsBodyChunk {
                    indexes: vec![1, 1],
                    description: None,
                    num_tokens: 300,
                },
            ],
        }
    }

    #[test]
    fn test_body_toc_embeds_are_chunk_uris() {
        let body = toc_body();
        let embeds: Vec<String> = body.embeds().iter().map(ToString::to_string).collect();
        assert_eq!(
            embeds,
            vec![
                "ndk://stub/-/dir/example/$chunk/00",
                "ndk://stub/-/dir/example/$chunk/01/00/00",
                "ndk://stub/-/dir/example/$chunk/01/01",
            ]
        );
    }

    #[test]
    fn test_body_render_headings_skips_emitted() {
        let body = toc_body();

        // First chunk under section [1]: both nested headings fire.
        let (headings, rendered) = body.render_headings(&[1, 0, 0], &[]);
        let texts: Vec<String> = headings.iter().map(TextPart::as_str).collect();
        assert_eq!(texts, vec!["# Methods", "## Setup"]);
        assert_eq!(rendered, vec![vec![1], vec![1, 0]]);

        // Sibling chunk: section [1] already rendered, nothing new fires.
        let (headings, rendered) = body.render_headings(&[1, 1], &rendered);
        assert!(headings.is_empty());
        assert!(rendered.is_empty());
    }

    #[test]
    fn test_body_render_toc_includes_headings_and_embeds() {
        let body = toc_body();
        let RenderedBody::Text(text) = body.render_body() else {
            panic!("expected text");
        };
        let rendered = text.as_str(true);
        assert!(rendered.starts_with("<document uri=\"ndk://stub/-/dir/example/$body\">"));
        assert!(rendered.contains("![](ndk://stub/-/dir/example/$chunk/00)"));
        assert!(rendered.contains("# Methods"));
        assert!(rendered.contains("## Setup"));
        assert!(rendered.ends_with("</document>"));
    }

    #[test]
    fn test_body_num_tokens_sums_chunks_and_sections() {
        let body = toc_body();
        let expected = BUFFER_TOKENS_BODY
            + 600
            + (estimate_tokens("Methods", 0) + BUFFER_TOKENS_SECTION)
            + (estimate_tokens("Setup", 0) + BUFFER_TOKENS_SECTION);
        assert_eq!(body.num_tokens(), expected);
    }

    #[test]
    fn test_chunk_dependencies_exclude_own_resource() {
        let text = ContentText::parse(
            "See ndk://stub/-/dir/example/$media/x.png and ndk://other/team/doc and https://example.com/x",
            ParseMode::Data,
            LinkMode::Plain,
        );
        let chunk = ObsChunk::new(&resource(), &[0], text, None);

        let deps: Vec<String> = chunk.dependencies().iter().map(ToString::to_string).collect();
        assert_eq!(deps, vec!["https://example.com/x", "ndk://other/team/doc"]);
    }

    #[test]
    fn test_chunk_infer_tag() {
        let root = ObsChunk::new(&resource(), &[], ContentText::default(), None);
        assert_eq!(root.infer_tag(), "document");

        let nested = ObsChunk::new(&resource(), &[0, 1], ContentText::default(), None);
        assert_eq!(nested.infer_tag(), "document-chunk");
    }

    #[test]
    fn test_chunk_render_body_wraps_in_tag() {
        let chunk = ObsChunk::new(
            &resource(),
            &[2],
            ContentText::new_plain("chunk text", Sep::Newline),
            None,
        );
        let rendered = chunk.render_body().as_str(true);
        assert!(rendered.starts_with("<document-chunk uri=\"ndk://stub/-/dir/example/$chunk/02\">"));
        assert!(rendered.contains("chunk text"));
        assert!(rendered.ends_with("</document-chunk>"));
    }

    #[test]
    fn test_media_as_blob_falls_back_to_description() {
        let media = ObsMedia::new(
            &resource(),
            vec![crate::data::FileName::decode("x.png").unwrap()],
            MimeType::decode("image/webp").unwrap(),
            "AAAA".into(),
            Some("a description".into()),
            None,
        );
        assert_eq!(media.as_blob().placeholder.as_deref(), Some("a description"));
        assert!(matches!(media.download_url(), DownloadUrl::Data(_)));

        let remote = ObsMedia {
            blob: "https://example.com/x.png".into(),
            ..media
        };
        assert!(matches!(remote.download_url(), DownloadUrl::Web(_)));
    }

    #[test]
    fn test_collection_render_body() {
        let collection = ObsCollection {
            uri: resource().child_observable(Suffix::collection()),
            description: None,
            results: vec![
                ResourceUri::decode("ndk://stub/-/dir/a").unwrap(),
                ResourceUri::decode("ndk://stub/-/dir/b").unwrap(),
            ],
        };
        let rendered = collection.render_body().as_str(true);
        assert!(rendered.contains("- <ndk://stub/-/dir/a>"));
        assert!(rendered.contains("- <ndk://stub/-/dir/b>"));

        let empty = ObsCollection {
            results: Vec::new(),
            ..collection
        };
        assert!(empty.render_body().as_str(true).contains("empty"));
    }

    #[test]
    fn test_plain_renders_as_fenced_code() {
        let plain = ObsPlain {
            uri: resource().child_observable(Suffix::plain()),
            description: None,
            mime_type: Some(MimeType::decode("text/markdown").unwrap()),
            text: "# raw".into(),
        };
        let rendered = plain.render_body().as_str(true);
        assert!(rendered.contains("```markdown\n# raw\n```"));
    }

    #[test]
    fn test_with_labels_fills_missing_only() {
        use crate::label::{LabelName, ResourceLabel};

        let mut labels = ResourceLabels::new();
        labels.add(ResourceLabel::text(
            LabelName::decode("description").unwrap(),
            Suffix::chunk(&[0]),
            "generated",
        ));

        let body = toc_body();
        let updated = body.with_labels(&labels);
        assert_eq!(updated.chunks[0].description.as_deref(), Some("generated"));
        // The body description is kept.
        assert_eq!(updated.description, body.description);
    }

    #[test]
    fn test_observation_serde_round_trip() {
        let observation = Observation::Chunk(ObsChunk::new(
            &resource(),
            &[0],
            ContentText::new_plain("text", Sep::Newline),
            Some("described".into()),
        ));
        let json = serde_json::to_string(&observation).unwrap();
        let back: Observation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, observation);
    }
}
