//! The rendering engine: resolve embed links against an observation pool and
//! produce LLM-ready output.
//!
//! Rendering walks a content stream, replacing each embed link whose target
//! is available with the rendered observation: blobs become blob blocks,
//! text is injected wrapped in `<document>` tags, and chunks get their
//! section-heading breadcrumbs re-inserted. The output can then be flattened
//! for an LLM API as an alternation of strings and blobs, or split into one
//! string plus a deduplicated blob list, honoring a media-count cap.

use serde::{Deserialize, Serialize};

use crate::content::{
    ContentBlob, ContentText, LinkMode, Sep, TextPart, strip_keep_indent, xml_close, xml_open,
};
use crate::data::MimeType;
use crate::error::{Error, Result};
use crate::observation::{ObsBody, Observation, RenderedBody};
use crate::sorted::{OnConflict, sorted_insert, sorted_make};
use crate::uri::{ObservableUri, Reference, Suffix, SuffixKind};

/// One piece of a rendered document: flattened text or a blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentPiece {
    /// Flattened text.
    Text(String),
    /// An embedded binary.
    Blob(ContentBlob),
}

/// A document rendered from an embedded observation.
///
/// Documents do not nest: embedded documents are flattened into text
/// interleaved with blobs, while dependency tracking stays at the
/// [`Rendered`] level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedDocument {
    /// The rendered observation's URI.
    pub uri: ObservableUri,
    /// Display name, when known.
    pub name: String,
    /// The embed link's label, when any.
    pub label: Option<String>,
    /// The flattened contents.
    pub content: Vec<DocumentPiece>,
}

impl RenderedDocument {
    /// Serialize the document with its wrapper tag.
    #[must_use]
    pub fn as_str(&self) -> String {
        let mut open = format!("<document uri=\"{}\"", self.uri);
        if !self.name.is_empty() {
            open.push_str(&format!(" name=\"{}\"", self.name));
        }
        if let Some(label) = &self.label {
            open.push_str(&format!(" label=\"{label}\""));
        }
        open.push('>');

        let body = self
            .content
            .iter()
            .map(|piece| match piece {
                DocumentPiece::Text(text) => text.clone(),
                DocumentPiece::Blob(blob) => format!("![]({})", blob.uri),
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        format!("{open}\n{body}\n</document>")
    }
}

/// One block of rendered output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RenderedBlock {
    /// An embedded binary.
    Blob(ContentBlob),
    /// Textual content.
    Text(ContentText),
    /// An embedded document.
    Document(RenderedDocument),
}

/// A piece of flattened LLM input.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmPiece {
    /// A text segment.
    Text(String),
    /// A binary segment.
    Blob(ContentBlob),
}

/// The result of rendering content against an observation pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rendered {
    /// The rendered blocks in order.
    pub blocks: Vec<RenderedBlock>,
    /// The observables that were embedded, sorted.
    pub embeds: Vec<ObservableUri>,
}

impl Rendered {
    /// Wrap already-parsed content without resolving embeds.
    #[must_use]
    pub fn text(content: ContentText) -> Self {
        Self {
            blocks: vec![RenderedBlock::Text(content)],
            embeds: Vec::new(),
        }
    }

    /// Wrap plain text without parsing.
    #[must_use]
    pub fn plain(text: &str) -> Self {
        Self::text(ContentText::new_plain(text, Sep::Newline))
    }

    /// Render content, replacing available embeds in place.
    #[must_use]
    pub fn render(content: &ContentText, observations: &[Observation]) -> Self {
        Self::render_parts(&content.parts, observations, Vec::new())
    }

    /// Render a list of observable URIs as embeds.
    ///
    /// When a body is broken into chunks, pass only the chunk URIs but
    /// include the body in the pool: consecutive chunks of the same body are
    /// wrapped in a shared `<document>` tag, with section-heading breadcrumbs
    /// re-inserted before each chunk.
    #[must_use]
    pub fn render_embeds(uris: &[ObservableUri], observations: &[Observation]) -> Self {
        let mut parts: Vec<TextPart> = Vec::new();
        let mut extra_embedded: Vec<ObservableUri> = Vec::new();

        let mut parent_body: Option<&ObsBody> = None;
        let mut parent_sections: Vec<Vec<u32>> = Vec::new();

        for uri in uris {
            let observation = observations.iter().find(|obs| obs.uri() == uri);

            // When the embedded observation is missing, keep the link as-is.
            let Some(observation) = observation else {
                parts.push(TextPart::link(LinkMode::Embed, None, uri.clone().into()));
                continue;
            };

            // Maintain the `<document>` wrapper around runs of chunks.
            let new_parent_uri = (uri.suffix().kind() == SuffixKind::Chunk)
                .then(|| uri.resource_uri().child_observable(Suffix::body()));
            if new_parent_uri.as_ref() != parent_body.map(|body| &body.uri) {
                if parent_body.is_some() {
                    parts.push(xml_close("document"));
                    parent_body = None;
                    parent_sections.clear();
                }

                if let Some(new_parent_uri) = new_parent_uri {
                    let found = observations.iter().find_map(|obs| match obs {
                        Observation::Body(body) if body.uri == new_parent_uri => Some(body),
                        _ => None,
                    });
                    if let Some(body) = found {
                        parent_body = Some(body);
                        parts.extend(xml_open(
                            "document",
                            Some(&new_parent_uri.clone().into()),
                            &[],
                            false,
                        ));
                        extra_embedded.push(new_parent_uri);
                    }
                }
            }

            // Re-insert the section headings from the body before a chunk.
            if let Some(body) = parent_body {
                if uri.suffix().kind() == SuffixKind::Chunk {
                    let (headings, rendered) =
                        body.render_headings(&uri.suffix().chunk_indexes(), &parent_sections);
                    parts.extend(headings);
                    parent_sections.extend(rendered);
                }
            }

            parts.push(TextPart::link(LinkMode::Embed, None, uri.clone().into()));
        }

        if parent_body.is_some() {
            parts.push(xml_close("document"));
        }

        Self::render_parts(&parts, observations, extra_embedded)
    }

    /// Pack URIs greedily into groups whose observation tokens fit the
    /// budget, rendering each group with [`Rendered::render_embeds`].
    pub fn render_groups(
        uris: &[ObservableUri],
        observations: &[Observation],
        group_threshold_tokens: usize,
    ) -> Result<Vec<Self>> {
        let uris = sorted_make(uris.iter().cloned(), ToString::to_string);

        let mut groups: Vec<Vec<ObservableUri>> = Vec::new();
        let mut current_uris: Vec<ObservableUri> = Vec::new();
        let mut current_tokens: usize = 0;

        for uri in uris {
            let observation = observations
                .iter()
                .find(|obs| *obs.uri() == uri)
                .ok_or_else(|| {
                    Error::BadRequest(format!("content group URI without observation: {uri}"))
                })?;
            if !matches!(
                observation,
                Observation::Body(_) | Observation::Chunk(_) | Observation::Media(_)
            ) {
                return Err(Error::BadRequest(format!(
                    "content group URI with unsupported observation: {uri}"
                )));
            }

            let num_tokens = observation.num_tokens();
            if current_tokens + num_tokens > group_threshold_tokens && !current_uris.is_empty() {
                groups.push(std::mem::take(&mut current_uris));
                current_tokens = 0;
            }
            current_uris.push(uri);
            current_tokens += num_tokens;
        }
        if !current_uris.is_empty() {
            groups.push(current_uris);
        }

        Ok(groups
            .iter()
            .map(|group| Self::render_embeds(group, observations))
            .collect())
    }

    /// Render a part stream, replacing available embeds.
    #[must_use]
    pub fn render_parts(
        parts: &[TextPart],
        observations: &[Observation],
        extra_embedded: Vec<ObservableUri>,
    ) -> Self {
        let mut partial = PartialRendered {
            blocks: Vec::new(),
            embeds: sorted_make(extra_embedded, ToString::to_string),
            available: observations,
        };
        for part in parts {
            partial.render_part(part);
        }
        partial.build()
    }

    /// Flatten into an alternation of strings and blobs for an LLM API.
    ///
    /// Blobs whose MIME type is unsupported are replaced by their textual
    /// placeholder. Once `limit_media` blobs were yielded, further blobs are
    /// demoted to placeholders as well, keeping their URIs visible. Adjacent
    /// strings are joined with a blank line. Embeds are not deduplicated.
    #[must_use]
    pub fn as_llm_inline(
        &self,
        supports_media: &[MimeType],
        limit_media: usize,
    ) -> Vec<LlmPiece> {
        let mut flattened: Vec<LlmPiece> = Vec::new();
        let mut num_blobs: usize = 0;

        let push_blob = |flattened: &mut Vec<LlmPiece>, num_blobs: &mut usize, blob: &ContentBlob| {
            if supports_media.contains(&blob.mime_type) && *num_blobs < limit_media {
                *num_blobs += 1;
                flattened.push(LlmPiece::Blob(blob.clone()));
            } else {
                let placeholder = ContentText::new(blob.render_placeholder());
                flattened.push(LlmPiece::Text(placeholder.as_str(true)));
            }
        };

        for block in &self.blocks {
            match block {
                RenderedBlock::Blob(blob) => push_blob(&mut flattened, &mut num_blobs, blob),
                RenderedBlock::Text(text) => {
                    flattened.push(LlmPiece::Text(text.as_str(false)));
                },
                RenderedBlock::Document(document) => {
                    for piece in &document.content {
                        match piece {
                            DocumentPiece::Blob(blob) => {
                                push_blob(&mut flattened, &mut num_blobs, blob);
                            },
                            DocumentPiece::Text(text) => {
                                flattened.push(LlmPiece::Text(text.clone()));
                            },
                        }
                    }
                },
            }
        }

        // Join adjacent strings with a blank line.
        let mut result: Vec<LlmPiece> = Vec::new();
        let mut partial_text: Vec<String> = Vec::new();
        for piece in flattened {
            match piece {
                LlmPiece::Blob(blob) => {
                    if !partial_text.is_empty() {
                        result.push(LlmPiece::Text(join_stripped(&partial_text)));
                        partial_text.clear();
                    }
                    result.push(LlmPiece::Blob(blob));
                },
                LlmPiece::Text(text) => partial_text.push(text),
            }
        }
        if !partial_text.is_empty() {
            result.push(LlmPiece::Text(join_stripped(&partial_text)));
        }
        result
    }

    /// Flatten into one string plus a deduplicated, sorted blob list.
    ///
    /// Each blob is replaced in the text by `![](<uri>)`.
    #[must_use]
    pub fn as_llm_split(
        &self,
        supports_media: &[MimeType],
        limit_media: usize,
    ) -> (String, Vec<ContentBlob>) {
        let mut result_text: Vec<String> = Vec::new();
        let mut result_blobs: Vec<ContentBlob> = Vec::new();

        for piece in self.as_llm_inline(supports_media, limit_media) {
            match piece {
                LlmPiece::Blob(blob) => {
                    result_text.push(format!("![]({})", blob.uri));
                    sorted_insert(
                        &mut result_blobs,
                        blob,
                        |b| b.uri.to_string(),
                        OnConflict::Keep,
                    );
                },
                LlmPiece::Text(text) => result_text.push(text),
            }
        }

        (result_text.join("\n\n"), result_blobs)
    }

    /// Serialize all blocks, blobs shown as embed links.
    #[must_use]
    pub fn as_str(&self) -> String {
        self.blocks
            .iter()
            .map(|block| match block {
                RenderedBlock::Blob(blob) => format!("![]({})", blob.uri),
                RenderedBlock::Text(text) => text.as_str(false),
                RenderedBlock::Document(document) => document.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn join_stripped(texts: &[String]) -> String {
    texts
        .iter()
        .map(|text| strip_keep_indent(text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

///
/// Intermediate representation
///

struct PartialRendered<'a> {
    blocks: Vec<PartialBlock>,
    embeds: Vec<ObservableUri>,
    available: &'a [Observation],
}

enum PartialBlock {
    Blob(ContentBlob),
    Document(RenderedDocument),
    Text(Vec<TextPart>),
}

impl PartialRendered<'_> {
    fn build(self) -> Rendered {
        Rendered {
            blocks: self
                .blocks
                .into_iter()
                .map(|block| match block {
                    PartialBlock::Blob(blob) => RenderedBlock::Blob(blob),
                    PartialBlock::Document(document) => RenderedBlock::Document(document),
                    PartialBlock::Text(parts) => RenderedBlock::Text(ContentText::new(parts)),
                })
                .collect(),
            embeds: self.embeds,
        }
    }

    fn render_part(&mut self, part: &TextPart) {
        if let TextPart::Link {
            mode: LinkMode::Embed,
            label,
            href,
        } = part
        {
            if let Some(observation) = self.take_embed(href) {
                let block = self.render_embed(&observation, label.as_deref());
                self.blocks.push(block);
                return;
            }
        }

        match self.blocks.last_mut() {
            Some(PartialBlock::Text(parts)) => parts.push(part.clone()),
            _ => self.blocks.push(PartialBlock::Text(vec![part.clone()])),
        }
    }

    fn render_embed(&mut self, observation: &Observation, label: Option<&str>) -> PartialBlock {
        match observation.render_body() {
            RenderedBody::Blob(blob) => PartialBlock::Blob(blob),
            RenderedBody::Text(text) => {
                let mut content: Vec<DocumentPiece> = Vec::new();
                let mut partial: Vec<TextPart> = Vec::new();
                for part in &text.parts {
                    self.render_document_part(&mut content, &mut partial, part);
                }
                if !partial.is_empty() {
                    content.push(DocumentPiece::Text(ContentText::new(partial).as_str(true)));
                }

                PartialBlock::Document(RenderedDocument {
                    uri: observation.uri().clone(),
                    name: String::new(),
                    label: label.map(str::to_string),
                    content,
                })
            },
        }
    }

    /// Documents do not support nested documents: embedded bodies flatten
    /// into text interleaved with blobs, while dependency tracking stays at
    /// the root level.
    fn render_document_part(
        &mut self,
        content: &mut Vec<DocumentPiece>,
        partial: &mut Vec<TextPart>,
        part: &TextPart,
    ) {
        if let TextPart::Link {
            mode: LinkMode::Embed,
            href,
            ..
        } = part
        {
            if let Some(observation) = self.take_embed(href) {
                match observation.render_body() {
                    RenderedBody::Blob(blob) => {
                        if !partial.is_empty() {
                            content.push(DocumentPiece::Text(
                                ContentText::new(std::mem::take(partial)).as_str(true),
                            ));
                        }
                        content.push(DocumentPiece::Blob(blob));
                    },
                    RenderedBody::Text(text) => {
                        for sub_part in &text.parts {
                            self.render_document_part(content, partial, sub_part);
                        }
                    },
                }
                return;
            }
        }

        partial.push(part.clone());
    }

    fn take_embed(&mut self, href: &Reference) -> Option<Observation> {
        let href = href.to_string();
        let observation = self
            .available
            .iter()
            .find(|obs| obs.uri().to_string() == href)?
            .clone();
        sorted_insert(
            &mut self.embeds,
            observation.uri().clone(),
            ToString::to_string,
            OnConflict::Keep,
        );
        Some(observation)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::content::ParseMode;
    use crate::observation::{ObsBodyChunk, ObsBodySection, ObsChunk, ObsMedia};
    use crate::uri::ResourceUri;

    fn resource() -> ResourceUri {
        ResourceUri::decode("ndk://stub/-/dir/example").unwrap()
    }

    fn webp() -> MimeType {
        MimeType::decode("image/webp").unwrap()
    }

    fn media_obs(name: &str, placeholder: Option<&str>) -> Observation {
        Observation::Media(ObsMedia::new(
            &resource(),
            vec![crate::data::FileName::decode(name).unwrap()],
            webp(),
            "AAAA".into(),
            Some(format!("image {name}")),
            placeholder.map(str::to_string),
        ))
    }

    fn chunk_obs(indexes: &[u32], text: &str) -> Observation {
        Observation::Chunk(ObsChunk::new(
            &resource(),
            indexes,
            ContentText::parse(text, ParseMode::Markdown, LinkMode::Plain),
            None,
        ))
    }

    #[test]
    fn test_render_replaces_available_embed() {
        let observations = vec![media_obs("x.png", None)];
        let content = ContentText::parse_markdown(
            "before\n\n![](ndk://stub/-/dir/example/$media/x.png)\n\nafter",
        );

        let rendered = Rendered::render(&content, &observations);
        assert_eq!(rendered.blocks.len(), 3);
        assert!(matches!(rendered.blocks[1], RenderedBlock::Blob(_)));
        assert_eq!(rendered.embeds.len(), 1);
        assert_eq!(
            rendered.embeds[0].to_string(),
            "ndk://stub/-/dir/example/$media/x.png"
        );
    }

    #[test]
    fn test_render_keeps_missing_embed_as_link() {
        let content = ContentText::parse_markdown("![](ndk://stub/-/dir/example/$media/gone.png)");
        let rendered = Rendered::render(&content, &[]);

        assert_eq!(rendered.blocks.len(), 1);
        let RenderedBlock::Text(text) = &rendered.blocks[0] else {
            panic!("expected text block");
        };
        assert!(text.as_str(true).contains("$media/gone.png"));
        assert!(rendered.embeds.is_empty());
    }

    #[test]
    fn test_render_embedded_text_becomes_document() {
        let observations = vec![chunk_obs(&[0], "chunk content")];
        let content = ContentText::new(vec![TextPart::link(
            LinkMode::Embed,
            Some("the chunk"),
            Reference::decode("ndk://stub/-/dir/example/$chunk/00").unwrap(),
        )]);

        let rendered = Rendered::render(&content, &observations);
        assert_eq!(rendered.blocks.len(), 1);
        let RenderedBlock::Document(document) = &rendered.blocks[0] else {
            panic!("expected document block");
        };
        assert_eq!(document.label.as_deref(), Some("the chunk"));
        assert!(document.as_str().contains("chunk content"));
    }

    #[test]
    fn test_render_embeds_wraps_chunks_with_breadcrumbs() {
        let body = Observation::Body(ObsBody {
            uri: resource().child_observable(Suffix::body()),
            description: None,
            content: None,
            sections: vec![ObsBodySection {
                indexes: vec![0],
                heading: Some("Intro".into()),
            }],
            chunks: vec![
                ObsBodyChunk {
                    indexes: vec![0, 0],
                    description: None,
                    num_tokens: 10,
                },
                ObsBodyChunk {
                    indexes: vec![0, 1],
                    description: None,
                    num_tokens: 10,
                },
            ],
        });
        let observations = vec![
            body,
            chunk_obs(&[0, 0], "first"),
            chunk_obs(&[0, 1], "second"),
        ];

        let uris = vec![
            resource().child_observable(Suffix::chunk(&[0, 0])),
            resource().child_observable(Suffix::chunk(&[0, 1])),
        ];
        let rendered = Rendered::render_embeds(&uris, &observations);
        let output = rendered.as_str();

        // One wrapping document for the shared parent body.
        assert!(output.contains("<document uri=\"ndk://stub/-/dir/example/$body\">"));
        // The section heading appears once, before the first chunk.
        assert_eq!(output.matches("# Intro").count(), 1);
        assert!(output.contains("first"));
        assert!(output.contains("second"));
        // The parent body is recorded as embedded.
        assert!(
            rendered
                .embeds
                .iter()
                .any(|uri| uri.to_string() == "ndk://stub/-/dir/example/$body")
        );
    }

    #[test]
    fn test_media_cap_demotes_further_blobs() {
        // S6: two supported embeds with a cap of one.
        let observations = vec![
            media_obs("a.png", Some("placeholder a")),
            media_obs("b.png", Some("placeholder b")),
        ];
        let content = ContentText::parse_markdown(
            "![](ndk://stub/-/dir/example/$media/a.png)\n\n![](ndk://stub/-/dir/example/$media/b.png)",
        );

        let rendered = Rendered::render(&content, &observations);
        let pieces = rendered.as_llm_inline(&[webp()], 1);

        let blobs: Vec<&LlmPiece> = pieces
            .iter()
            .filter(|p| matches!(p, LlmPiece::Blob(_)))
            .collect();
        assert_eq!(blobs.len(), 1);

        // The demoted blob keeps its URI visible in the placeholder text.
        let texts: Vec<&str> = pieces
            .iter()
            .filter_map(|p| match p {
                LlmPiece::Text(text) => Some(text.as_str()),
                LlmPiece::Blob(_) => None,
            })
            .collect();
        assert!(
            texts
                .iter()
                .any(|t| t.contains("ndk://stub/-/dir/example/$media/b.png"))
        );
    }

    #[test]
    fn test_unsupported_mime_becomes_placeholder() {
        let observations = vec![media_obs("a.png", Some("described image"))];
        let content =
            ContentText::parse_markdown("![](ndk://stub/-/dir/example/$media/a.png)");
        let rendered = Rendered::render(&content, &observations);

        let pieces =
            rendered.as_llm_inline(&[MimeType::decode("image/png").unwrap()], 10);
        assert!(pieces.iter().all(|p| matches!(p, LlmPiece::Text(_))));
        assert!(matches!(
            &pieces[0],
            LlmPiece::Text(text) if text.contains("described image")
        ));
    }

    #[test]
    fn test_as_llm_split_dedups_blobs() {
        let observations = vec![media_obs("a.png", None)];
        let content = ContentText::parse_markdown(
            "![](ndk://stub/-/dir/example/$media/a.png)\n\ntext\n\n![](ndk://stub/-/dir/example/$media/a.png)",
        );
        let rendered = Rendered::render(&content, &observations);

        let (text, blobs) = rendered.as_llm_split(&[webp()], 10);
        assert_eq!(blobs.len(), 1);
        assert_eq!(
            text.matches("![](ndk://stub/-/dir/example/$media/a.png)")
                .count(),
            2
        );
    }

    #[test]
    fn test_render_groups_respects_budget() {
        let observations = vec![
            chunk_obs(&[0], &"a".repeat(400)),
            chunk_obs(&[1], &"b".repeat(400)),
            chunk_obs(&[2], &"c".repeat(400)),
        ];
        let uris: Vec<ObservableUri> = (0..3)
            .map(|i| resource().child_observable(Suffix::chunk(&[i])))
            .collect();

        // Each chunk is ~100 tokens; a 150-token budget forces one per group.
        let groups = Rendered::render_groups(&uris, &observations, 150).unwrap();
        assert_eq!(groups.len(), 3);

        // A large budget fits all three.
        let groups = Rendered::render_groups(&uris, &observations, 10_000).unwrap();
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn test_render_groups_rejects_unknown_uri() {
        let uris = vec![resource().child_observable(Suffix::chunk(&[9]))];
        assert!(Rendered::render_groups(&uris, &[], 100).is_err());
    }

    #[test]
    fn test_adjacent_strings_joined_with_blank_line() {
        let rendered = Rendered {
            blocks: vec![
                RenderedBlock::Text(ContentText::new_plain("first", Sep::Newline)),
                RenderedBlock::Text(ContentText::new_plain("second", Sep::Newline)),
            ],
            embeds: Vec::new(),
        };
        let pieces = rendered.as_llm_inline(&[], 10);
        assert_eq!(pieces.len(), 1);
        assert!(matches!(
            &pieces[0],
            LlmPiece::Text(text) if text == "first\n\nsecond"
        ));
    }
}
