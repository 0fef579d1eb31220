//! The chunking engine: deterministic, hierarchy-preserving packing of a
//! parsed body into bounded chunks with a table of contents.
//!
//! The pipeline is: atomize the part stream, build a heading hierarchy,
//! optimize it by flattening small groups and packing neighbours, then emit
//! chunks and sections with contiguous index paths. Tie-breaks use insertion
//! order, which is the source reading order, so identical inputs always
//! produce identical chunk layouts.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::bundle::BundleBody;
use crate::config::Tunables;
use crate::content::{ContentText, LinkMode, Sep, TextPart};
use crate::error::Result;
use crate::observation::{ObsBodySection, ObsChunk, ObsMedia};
use crate::tokens::estimate_tokens;
use crate::uri::ResourceUri;

/// Token overhead of a heading's `#` prefix and trailing newlines.
const BUFFER_HEADING: usize = 3;

/// Token overhead of the newlines after a paragraph.
const BUFFER_PARAGRAPH: usize = 1;

static RE_PARAGRAPH: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\n(?:[ \t]*\n)+").unwrap()
});

/// Chunk a body, offloading to a blocking thread.
///
/// Chunking is CPU-intensive on large documents; callers inside the executor
/// must not block the async runtime with it.
pub async fn chunk_body(
    tunables: &Tunables,
    resource_uri: ResourceUri,
    text: ContentText,
    media: Vec<ObsMedia>,
) -> Result<BundleBody> {
    let tunables = tunables.clone();
    tokio::task::spawn_blocking(move || chunk_body_sync(&tunables, &resource_uri, text, media))
        .await
        .map_err(|e| crate::error::Error::Internal(format!("chunking task failed: {e}")))
}

/// Chunk a body synchronously.
#[must_use]
pub fn chunk_body_sync(
    tunables: &Tunables,
    resource_uri: &ResourceUri,
    text: ContentText,
    media: Vec<ObsMedia>,
) -> BundleBody {
    // Documents under the threshold (excluding images) remain a single chunk.
    if estimate_tokens(&text.as_str(false), 0) <= tunables.chunking_threshold {
        return BundleBody::make_single(resource_uri, text, media, None);
    }

    // Break the content into a hierarchy of headings and group the sections
    // into chunks typically smaller than `max_chunk`.
    let parts = split_chunk_parts(&text);
    let root_group = ChunkGroup::make_hierarchy(None, parts, tunables.max_chunk);
    let root_optimized = optimize_chunk_group(root_group, tunables.max_chunk);

    let mut sections: Vec<ObsBodySection> = Vec::new();
    let mut chunks: Vec<ObsChunk> = Vec::new();
    emit_group(
        resource_uri,
        &mut sections,
        &mut chunks,
        &root_optimized,
        &[],
        0,
    );

    BundleBody::new(resource_uri, None, sections, chunks, media)
}

///
/// Atoms
///

/// A heading atom kept alongside a group.
#[derive(Debug, Clone, PartialEq)]
struct HeadingAtom {
    level: u8,
    text: String,
}

impl HeadingAtom {
    fn num_tokens(&self) -> usize {
        estimate_tokens(&self.text, 0) + BUFFER_HEADING
    }

    fn as_part(&self) -> TextPart {
        TextPart::heading(self.level, self.text.clone())
    }

    fn as_chunk_part(&self) -> ChunkPart {
        ChunkPart {
            parts: vec![self.as_part()],
            num_tokens: self.num_tokens(),
        }
    }
}

/// An indivisible run of parts with its token cost.
#[derive(Debug, Clone, PartialEq)]
struct ChunkPart {
    parts: Vec<TextPart>,
    num_tokens: usize,
}

impl ChunkPart {
    fn as_heading(&self) -> Option<HeadingAtom> {
        match self.parts.as_slice() {
            [TextPart::Heading { level, text }] => Some(HeadingAtom {
                level: *level,
                text: text.clone(),
            }),
            _ => None,
        }
    }
}

/// Atomize the part stream.
///
/// Code blocks, headings, page markers and embed links are each their own
/// atom; non-embed links attach to the current text atom; plain text splits
/// at blank-line paragraph boundaries. Embeds contribute zero tokens to the
/// optimizer (they are counted later in observations).
fn split_chunk_parts(text: &ContentText) -> Vec<ChunkPart> {
    let mut result: Vec<ChunkPart> = Vec::new();
    let mut partial_parts: Vec<TextPart> = Vec::new();
    let mut partial_tokens: usize = 0;

    fn flush(result: &mut Vec<ChunkPart>, parts: &mut Vec<TextPart>, tokens: &mut usize) {
        if !parts.is_empty() {
            result.push(ChunkPart {
                parts: std::mem::take(parts),
                num_tokens: *tokens + BUFFER_PARAGRAPH,
            });
            *tokens = 0;
        }
    }

    for part in &text.parts {
        let is_embed = matches!(
            part,
            TextPart::Link {
                mode: LinkMode::Embed,
                ..
            }
        );
        match part {
            TextPart::Code { .. } | TextPart::Heading { .. } | TextPart::PageNumber { .. } => {
                flush(&mut result, &mut partial_parts, &mut partial_tokens);
                result.push(ChunkPart {
                    parts: vec![part.clone()],
                    num_tokens: estimate_tokens(&part.as_str(), 0) + BUFFER_PARAGRAPH,
                });
            },
            TextPart::Link { .. } if is_embed => {
                flush(&mut result, &mut partial_parts, &mut partial_tokens);
                result.push(ChunkPart {
                    parts: vec![part.clone()],
                    num_tokens: 0,
                });
            },
            TextPart::Link { .. } => {
                partial_parts.push(part.clone());
                partial_tokens += estimate_tokens(&part.as_str(), 0);
            },
            TextPart::Text { text, lsep, rsep } => {
                if lsep.is_blank() {
                    flush(&mut result, &mut partial_parts, &mut partial_tokens);
                }

                let paragraphs: Vec<&str> = RE_PARAGRAPH
                    .split(text)
                    .filter(|p| !p.trim().is_empty())
                    .collect();
                if paragraphs.len() < 2 {
                    // Skip whitespace between embeds; otherwise keep the part
                    // as-is, preserving whitespace between links.
                    if paragraphs.is_empty() && text.trim().is_empty() {
                        continue;
                    }
                    partial_parts.push(part.clone());
                    partial_tokens += estimate_tokens(&part.as_str(), 0);
                } else {
                    let first = paragraphs[0];
                    partial_parts.push(TextPart::text_sep(first, *lsep, Sep::Blank));
                    partial_tokens += estimate_tokens(first, 0);
                    flush(&mut result, &mut partial_parts, &mut partial_tokens);

                    for middle in &paragraphs[1..paragraphs.len() - 1] {
                        result.push(ChunkPart {
                            parts: vec![TextPart::text(*middle, Sep::Blank)],
                            num_tokens: estimate_tokens(middle, 0) + BUFFER_PARAGRAPH,
                        });
                    }

                    let last = paragraphs[paragraphs.len() - 1];
                    partial_parts.push(TextPart::text_sep(last, Sep::Blank, *rsep));
                    partial_tokens += estimate_tokens(last, 0);
                }

                if rsep.is_blank() && !partial_parts.is_empty() {
                    flush(&mut result, &mut partial_parts, &mut partial_tokens);
                }
            },
        }
    }

    flush(&mut result, &mut partial_parts, &mut partial_tokens);
    result
}

///
/// Hierarchy
///

/// A group of chunk parts and sub-groups. A group holds EITHER sub-groups OR
/// chunk parts, never both, which lets the optimizer reason about combining
/// chunks at a higher level.
#[derive(Debug, Clone, PartialEq)]
struct ChunkGroup {
    heading: Option<HeadingAtom>,
    groups: Vec<ChunkGroup>,
    chunks: Vec<ChunkPart>,
}

impl ChunkGroup {
    fn from_groups(heading: Option<HeadingAtom>, groups: Vec<Self>) -> Self {
        Self {
            heading,
            groups,
            chunks: Vec::new(),
        }
    }

    fn from_chunks(heading: Option<HeadingAtom>, chunks: Vec<ChunkPart>) -> Self {
        Self {
            heading,
            groups: Vec::new(),
            chunks,
        }
    }

    fn num_tokens(&self) -> usize {
        self.heading.as_ref().map_or(0, HeadingAtom::num_tokens)
            + self.groups.iter().map(Self::num_tokens).sum::<usize>()
            + self.chunks.iter().map(|c| c.num_tokens).sum::<usize>()
    }

    /// Pack heading-free parts into contiguous buckets of at most
    /// `max_chunk` tokens (first-fit).
    fn from_parts_bounded(
        heading: Option<HeadingAtom>,
        chunks: Vec<ChunkPart>,
        max_chunk: usize,
    ) -> Self {
        if chunks.iter().map(|c| c.num_tokens).sum::<usize>() < max_chunk {
            return Self::from_chunks(heading, chunks);
        }

        let mut subgroups: Vec<Self> = Vec::new();
        let mut partial_chunks: Vec<ChunkPart> = Vec::new();
        let mut partial_tokens: usize = 0;

        for part in chunks {
            if partial_tokens > 0 && partial_tokens + part.num_tokens > max_chunk {
                subgroups.push(Self::from_chunks(None, std::mem::take(&mut partial_chunks)));
                partial_tokens = 0;
            }
            partial_tokens += part.num_tokens;
            partial_chunks.push(part);
        }
        if !partial_chunks.is_empty() {
            subgroups.push(Self::from_chunks(None, partial_chunks));
        }

        // A single bucket needs no wrapper level.
        if subgroups.len() == 1 {
            let only = subgroups
                .pop()
                .unwrap_or_else(|| unreachable!("checked len above"));
            return Self::from_chunks(heading, only.chunks);
        }
        Self::from_groups(heading, subgroups)
    }

    /// Group siblings under the minimum heading level present, recursing
    /// into each section's children.
    fn make_hierarchy(
        heading: Option<HeadingAtom>,
        chunks: Vec<ChunkPart>,
        max_chunk: usize,
    ) -> Self {
        let heading_level = chunks
            .iter()
            .filter_map(|chunk| chunk.as_heading().map(|h| h.level))
            .min();
        let Some(heading_level) = heading_level else {
            return Self::from_parts_bounded(heading, chunks, max_chunk);
        };

        let mut group_children: Vec<Self> = Vec::new();
        let mut section_heading: Option<HeadingAtom> = None;
        let mut section_parts: Vec<ChunkPart> = Vec::new();

        fn flush_section(
            children: &mut Vec<ChunkGroup>,
            heading: &mut Option<HeadingAtom>,
            parts: &mut Vec<ChunkPart>,
            max_chunk: usize,
        ) {
            if !parts.is_empty() {
                children.push(ChunkGroup::make_hierarchy(
                    heading.take(),
                    std::mem::take(parts),
                    max_chunk,
                ));
            } else if let Some(heading) = heading.take() {
                children.push(ChunkGroup::from_chunks(Some(heading), Vec::new()));
            }
        }

        for chunk in chunks {
            match chunk.as_heading() {
                Some(h) if h.level == heading_level => {
                    flush_section(
                        &mut group_children,
                        &mut section_heading,
                        &mut section_parts,
                        max_chunk,
                    );
                    section_heading = Some(h);
                },
                _ => section_parts.push(chunk),
            }
        }
        flush_section(
            &mut group_children,
            &mut section_heading,
            &mut section_parts,
            max_chunk,
        );

        Self::from_groups(heading, group_children)
    }

    /// Merge several groups into one flat chunk group.
    fn join(mut groups: Vec<Self>) -> Self {
        if groups.len() == 1 {
            groups
                .pop()
                .unwrap_or_else(|| unreachable!("checked len above"))
        } else {
            Self::from_chunks(
                None,
                groups
                    .into_iter()
                    .flat_map(|group| group.flatten(false))
                    .collect(),
            )
        }
    }

    fn render(&self) -> ContentText {
        let parts: Vec<TextPart> = self
            .flatten(false)
            .into_iter()
            .flat_map(|chunk| chunk.parts)
            .collect();
        ContentText::new(parts)
    }

    fn flatten(&self, omit_heading: bool) -> Vec<ChunkPart> {
        let mut flattened: Vec<ChunkPart> = Vec::new();
        if let Some(heading) = &self.heading {
            if !omit_heading {
                flattened.push(heading.as_chunk_part());
            }
        }
        for group in &self.groups {
            flattened.extend(group.flatten(false));
        }
        flattened.extend(self.chunks.iter().cloned());
        flattened
    }

    fn contains_section(&self) -> bool {
        self.heading.is_some() || self.groups.iter().any(Self::contains_section)
    }
}

///
/// Optimization
///

/// Reorganize chunk groups to minimize chunks while preserving meaningful
/// structure.
///
/// After optimization, a group is in one of two states:
/// - Flat chunk: `num_tokens <= max_chunk`, all content in `chunks`.
/// - Section: `num_tokens > max_chunk`, children in `groups`.
fn optimize_chunk_group(group: ChunkGroup, max_chunk: usize) -> ChunkGroup {
    // Fits in one chunk: flatten everything, the heading moving into the
    // chunk content.
    if group.num_tokens() <= max_chunk {
        let flattened = group.flatten(true);
        return ChunkGroup::from_chunks(group.heading, flattened);
    }

    // Already flat or no sections to reorganize.
    if !group.chunks.is_empty() || !group.contains_section() {
        return group;
    }

    // Recursively optimize all subgroups, then pack small neighbours.
    let optimized: Vec<ChunkGroup> = group
        .groups
        .into_iter()
        .map(|g| optimize_chunk_group(g, max_chunk))
        .collect();
    let packed = pack_neighboring_chunks(optimized, max_chunk);

    ChunkGroup::from_groups(group.heading, packed)
}

/// Bin-pack neighbouring small groups into combined chunks.
///
/// Small neighbours merge until they would exceed `max_chunk`; a group whose
/// own tokens exceed the bound acts as a barrier and is emitted alone.
fn pack_neighboring_chunks(groups: Vec<ChunkGroup>, max_chunk: usize) -> Vec<ChunkGroup> {
    let mut result: Vec<ChunkGroup> = Vec::new();
    let mut pending: Vec<ChunkGroup> = Vec::new();
    let mut pending_tokens: usize = 0;

    fn flush(result: &mut Vec<ChunkGroup>, pending: &mut Vec<ChunkGroup>, tokens: &mut usize) {
        if !pending.is_empty() {
            result.push(ChunkGroup::join(std::mem::take(pending)));
            *tokens = 0;
        }
    }

    for group in groups {
        let num_tokens = group.num_tokens();
        if num_tokens > max_chunk {
            flush(&mut result, &mut pending, &mut pending_tokens);
            result.push(group);
        } else if pending_tokens + num_tokens > max_chunk {
            flush(&mut result, &mut pending, &mut pending_tokens);
            pending_tokens = num_tokens;
            pending.push(group);
        } else {
            pending_tokens += num_tokens;
            pending.push(group);
        }
    }

    flush(&mut result, &mut pending, &mut pending_tokens);
    result
}

///
/// Emission
///

/// DFS the optimized tree, numbering children contiguously from zero at each
/// level. A section with two or more subgroups emits a section record; a
/// leaf emits a chunk whose indexes are the path from the root.
fn emit_group(
    resource_uri: &ResourceUri,
    out_sections: &mut Vec<ObsBodySection>,
    out_chunks: &mut Vec<ObsChunk>,
    group: &ChunkGroup,
    parent_indexes: &[u32],
    self_index: u32,
) -> u32 {
    // A transparent list of sub-groups: children share the parent level.
    if !group.groups.is_empty() && group.heading.is_none() {
        let mut num_children = 0;
        let mut child_index = self_index;
        for child_group in &group.groups {
            let emitted = emit_group(
                resource_uri,
                out_sections,
                out_chunks,
                child_group,
                parent_indexes,
                child_index,
            );
            num_children += emitted;
            child_index += emitted;
        }
        return num_children;
    }

    // A section with multiple subgroups: emit a section record, children one
    // level deeper.
    if group.heading.is_some() && group.groups.len() > 1 {
        let mut section_indexes = parent_indexes.to_vec();
        section_indexes.push(self_index);

        let mut child_index = 0;
        for child_group in &group.groups {
            child_index += emit_group(
                resource_uri,
                out_sections,
                out_chunks,
                child_group,
                &section_indexes,
                child_index,
            );
        }

        out_sections.push(ObsBodySection {
            indexes: section_indexes,
            heading: group.heading.as_ref().map(|h| h.text.clone()),
        });
        return 1;
    }

    // A section with a single subgroup: no section record; the heading
    // becomes its own chunk ahead of the child's content.
    if let (Some(heading), [only_child]) = (&group.heading, group.groups.as_slice()) {
        let wrapped = ChunkGroup::from_groups(
            None,
            vec![
                ChunkGroup::from_chunks(None, vec![heading.as_chunk_part()]),
                only_child.clone(),
            ],
        );
        return emit_group(
            resource_uri,
            out_sections,
            out_chunks,
            &wrapped,
            parent_indexes,
            self_index,
        );
    }

    // A leaf: emit one chunk.
    if !group.chunks.is_empty() || group.heading.is_some() {
        let mut indexes = parent_indexes.to_vec();
        indexes.push(self_index);
        out_chunks.push(ObsChunk::new(resource_uri, &indexes, group.render(), None));
        return 1;
    }

    0
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::content::ParseMode;

    fn resource() -> ResourceUri {
        ResourceUri::decode("ndk://stub/-/dir/example").unwrap()
    }

    fn parse(text: &str) -> ContentText {
        ContentText::parse(text, ParseMode::Markdown, LinkMode::Plain)
    }

    fn tunables(threshold: usize, max_chunk: usize) -> Tunables {
        Tunables {
            chunking_threshold: threshold,
            max_chunk,
            ..Tunables::for_tests()
        }
    }

    /// A paragraph of roughly `tokens` estimated tokens.
    fn paragraph(word: &str, tokens: usize) -> String {
        let mut out = String::new();
        while estimate_tokens(&out, 0) < tokens {
            out.push_str(word);
            out.push(' ');
        }
        out.trim_end().to_string()
    }

    #[test]
    fn test_fast_path_small_body() {
        // S3: a small markdown body with headings stays a single chunk.
        let text = parse("# One\n\nshort intro\n\n# Two\n\nshort outro");
        let bundle = chunk_body_sync(&tunables(20_000, 8_000), &resource(), text, Vec::new());

        assert_eq!(bundle.chunks.len(), 1);
        assert!(bundle.sections.is_empty());
        assert_eq!(bundle.chunks[0].uri.suffix().as_suffix(), "$chunk");
    }

    #[test]
    fn test_atomize_splits_paragraphs_and_headings() {
        let text = parse("# Title\n\npara one\n\npara two\n\n```\ncode\n```");
        let parts = split_chunk_parts(&text);

        // Heading, two paragraphs, code block.
        assert_eq!(parts.len(), 4);
        assert!(parts[0].as_heading().is_some());
        assert!(matches!(parts[3].parts[0], TextPart::Code { .. }));
    }

    #[test]
    fn test_atomize_embeds_cost_zero() {
        let text = parse("![](ndk://stub/-/dir/example/$media/x.png)");
        let parts = split_chunk_parts(&text);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].num_tokens, 0);
    }

    #[test]
    fn test_atomize_discards_blank_between_embeds() {
        let text = ContentText::new(vec![
            TextPart::link(
                LinkMode::Embed,
                None,
                crate::uri::Reference::decode("ndk://stub/-/a/b/$media/1.png").unwrap(),
            ),
            TextPart::text("  \n  ", Sep::None),
            TextPart::link(
                LinkMode::Embed,
                None,
                crate::uri::Reference::decode("ndk://stub/-/a/b/$media/2.png").unwrap(),
            ),
        ]);
        let parts = split_chunk_parts(&text);
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn test_hierarchical_chunking_emits_sections() {
        // Two top-level sections, each too large to merge with the other;
        // each section has two oversized subsections, forcing section
        // records.
        let mut body = String::new();
        for section in ["Alpha", "Beta"] {
            body.push_str(&format!("# {section}\n\n"));
            for sub in ["One", "Two"] {
                body.push_str(&format!("## {sub}\n\n"));
                body.push_str(&paragraph("lorem ipsum", 900));
                body.push_str("\n\n");
            }
        }

        let bundle = chunk_body_sync(&tunables(100, 1_000), &resource(), parse(&body), Vec::new());

        // Two sections at the top level.
        let section_headings: Vec<Option<&str>> = bundle
            .sections
            .iter()
            .map(|s| s.heading.as_deref())
            .collect();
        assert!(section_headings.contains(&Some("Alpha")));
        assert!(section_headings.contains(&Some("Beta")));

        // Chunk indexes are contiguous per level and radix-sorted.
        let suffixes: Vec<String> = bundle
            .chunks
            .iter()
            .map(|c| c.uri.suffix().as_suffix())
            .collect();
        let mut sorted = suffixes.clone();
        sorted.sort();
        assert_eq!(suffixes, sorted);
        assert!(suffixes.iter().any(|s| s.starts_with("$chunk/00/")));
        assert!(suffixes.iter().any(|s| s.starts_with("$chunk/01/")));
    }

    #[test]
    fn test_chunks_respect_max_tokens_except_atoms() {
        let mut body = String::new();
        for i in 0..12 {
            body.push_str(&paragraph(&format!("word{i}"), 300));
            body.push_str("\n\n");
        }
        let max_chunk = 1_000;
        let bundle =
            chunk_body_sync(&tunables(100, max_chunk), &resource(), parse(&body), Vec::new());

        assert!(bundle.chunks.len() > 1);
        for chunk in &bundle.chunks {
            // Each chunk is within the bound: all atoms here are small.
            assert!(
                chunk.num_tokens() <= max_chunk + BUFFER_PARAGRAPH,
                "chunk exceeds budget: {}",
                chunk.num_tokens()
            );
        }
    }

    #[test]
    fn test_oversized_atom_emitted_alone() {
        // One paragraph larger than the budget acts as a barrier.
        let body = format!(
            "{}\n\n{}\n\n{}",
            paragraph("small", 100),
            paragraph("huge", 3_000),
            paragraph("tiny", 100),
        );
        let bundle = chunk_body_sync(&tunables(100, 1_000), &resource(), parse(&body), Vec::new());

        assert!(bundle.chunks.iter().any(|c| c.num_tokens() > 1_000));
    }

    #[test]
    fn test_chunking_preserves_content() {
        // Concatenating chunk texts in index order, with section headings
        // re-inserted at section boundaries, preserves the input text.
        let mut body = String::new();
        for section in ["Alpha", "Beta"] {
            body.push_str(&format!("# {section}\n\n"));
            for i in 0..4 {
                body.push_str(&paragraph(&format!("{section}{i}"), 400));
                body.push_str("\n\n");
            }
        }
        let bundle = chunk_body_sync(&tunables(100, 1_000), &resource(), parse(&body), Vec::new());

        let mut reassembled = String::new();
        let mut emitted_sections: Vec<Vec<u32>> = Vec::new();
        for chunk in &bundle.chunks {
            let indexes = chunk.uri.suffix().chunk_indexes();
            for section in &bundle.sections {
                if emitted_sections.contains(&section.indexes) {
                    continue;
                }
                let n = section.indexes.len();
                if indexes.len() >= n && indexes[..n] == section.indexes[..] {
                    emitted_sections.push(section.indexes.clone());
                    if let Some(heading) = &section.heading {
                        reassembled.push_str(&format!(
                            "{} {heading}\n\n",
                            "#".repeat(section.indexes.len())
                        ));
                    }
                }
            }
            reassembled.push_str(&chunk.text.as_str(true));
            reassembled.push_str("\n\n");
        }

        let normalize = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
        assert_eq!(normalize(&reassembled), normalize(&body));
    }

    #[test]
    fn test_heading_with_single_oversized_child_is_not_dropped() {
        // A heading followed by one oversized paragraph: the heading and the
        // content must both survive even though no section is recorded.
        let body = format!("# Lonely\n\n{}", paragraph("big", 3_000));
        let bundle = chunk_body_sync(&tunables(100, 1_000), &resource(), parse(&body), Vec::new());

        let all_text: String = bundle
            .chunks
            .iter()
            .map(|c| c.text.as_str(true))
            .collect::<Vec<_>>()
            .join("\n");
        assert!(all_text.contains("Lonely"));
        assert!(all_text.contains("big"));
        assert!(bundle.sections.is_empty());
    }

    #[test]
    fn test_determinism() {
        let mut body = String::new();
        for i in 0..6 {
            body.push_str(&format!("# S{i}\n\n{}\n\n", paragraph("text", 500)));
        }
        let first =
            chunk_body_sync(&tunables(100, 1_000), &resource(), parse(&body), Vec::new());
        let second =
            chunk_body_sync(&tunables(100, 1_000), &resource(), parse(&body), Vec::new());
        assert_eq!(first, second);
    }
}
