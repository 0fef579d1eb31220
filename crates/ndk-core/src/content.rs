//! The markdown-aware content representation.
//!
//! Textual content is a typed stream of parts: plain text with separator
//! hints, headings, fenced code, page markers and typed links. Parsing is
//! lossless (the original text is kept as a `plain` cache) and appending
//! parts merges adjacent text deterministically.
//!
//! References inside fenced code blocks and inline code are left as text,
//! allowing code to act as an escape in documents, prompts and completions.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::data::MimeType;
use crate::error::{Error, Result};
use crate::sorted::sorted_make;
use crate::uri::{Reference, regex_reference};

///
/// Separators
///

/// Desired whitespace on one side of a part.
///
/// The two `-force` variants collapse adjacent whitespace but guarantee
/// exactly the indicated break; they outrank the plain separators when two
/// neighbours disagree. A merged text node keeps the forced rank in its
/// separators, but rendering always emits the plain break, so re-merging does
/// not force the break twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sep {
    /// No separator; whitespace between parts is preserved as-is.
    #[default]
    None,
    /// A single newline.
    Newline,
    /// A blank line.
    Blank,
    /// Exactly one newline, collapsing adjacent whitespace.
    NewlineForce,
    /// Exactly one blank line, collapsing adjacent whitespace.
    BlankForce,
}

impl Sep {
    /// The serialized literal.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Newline => "\n",
            Self::Blank => "\n\n",
            Self::NewlineForce => "\n-force",
            Self::BlankForce => "\n\n-force",
        }
    }

    /// Parse the serialized literal.
    #[must_use]
    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "" => Some(Self::None),
            "\n" => Some(Self::Newline),
            "\n\n" => Some(Self::Blank),
            "\n-force" => Some(Self::NewlineForce),
            "\n\n-force" => Some(Self::BlankForce),
            _ => None,
        }
    }

    /// Precedence when two neighbours disagree; forced breaks outrank plain
    /// ones.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Newline => 1,
            Self::Blank => 2,
            Self::NewlineForce => 3,
            Self::BlankForce => 4,
        }
    }

    /// The stronger of two separators.
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        if other.rank() > self.rank() { other } else { self }
    }

    /// The whitespace actually emitted between parts.
    #[must_use]
    pub const fn effective(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Newline | Self::NewlineForce => "\n",
            Self::Blank | Self::BlankForce => "\n\n",
        }
    }

    /// Whether this separator opens a new paragraph.
    #[must_use]
    pub const fn is_blank(self) -> bool {
        matches!(self, Self::Blank | Self::BlankForce)
    }
}

impl Serialize for Sep {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Sep {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::from_str_opt(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid separator: '{value}'")))
    }
}

///
/// Parts
///

/// How a link is written in markdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// `[^ref]` or `[^ref|label]`.
    Citation,
    /// `![label](ref)`.
    Embed,
    /// `[label](ref)` or `<ref>`.
    Markdown,
    /// A bare reference.
    Plain,
}

/// Code fence marker, auto-selected to avoid collision with the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fence {
    /// Three backticks.
    Backticks,
    /// Four backticks, for content containing triple backticks.
    BackticksWide,
    /// Three tildes.
    Tildes,
}

impl Fence {
    /// The fence characters.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backticks => "```",
            Self::BackticksWide => "````",
            Self::Tildes => "~~~",
        }
    }
}

impl Serialize for Fence {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Fence {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match String::deserialize(deserializer)?.as_str() {
            "```" => Ok(Self::Backticks),
            "````" => Ok(Self::BackticksWide),
            "~~~" => Ok(Self::Tildes),
            other => Err(serde::de::Error::custom(format!("invalid fence: '{other}'"))),
        }
    }
}

/// One element of a content stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TextPart {
    /// A fenced code block, passed through verbatim.
    Code {
        /// The fence marker used when rendering.
        fence: Fence,
        /// The info string after the opening fence.
        language: Option<String>,
        /// The code body without fences.
        code: String,
    },
    /// A markdown heading.
    Heading {
        /// Heading level, 1 through 6.
        level: u8,
        /// Heading text without the `#` marker.
        text: String,
    },
    /// A typed link to another resource or URL.
    Link {
        /// The markdown shape the link renders as.
        mode: LinkMode,
        /// Optional display label.
        label: Option<String>,
        /// The referenced URI.
        href: Reference,
    },
    /// A page marker, rendered as `{n}` followed by 48 dashes.
    #[serde(rename = "pagenumber")]
    PageNumber {
        /// The 1-based page number.
        page_number: u32,
    },
    /// Plain text with desired surrounding whitespace.
    Text {
        /// The text content.
        text: String,
        /// Desired separator before the text.
        lsep: Sep,
        /// Desired separator after the text.
        rsep: Sep,
    },
}

/// Page markers render as `{n}` plus this many dashes.
const PAGE_MARKER_DASHES: usize = 48;

impl TextPart {
    /// A text part with symmetric separators.
    #[must_use]
    pub fn text(text: impl Into<String>, sep: Sep) -> Self {
        Self::Text {
            text: text.into(),
            lsep: sep,
            rsep: sep,
        }
    }

    /// A text part with explicit separators.
    #[must_use]
    pub fn text_sep(text: impl Into<String>, lsep: Sep, rsep: Sep) -> Self {
        Self::Text {
            text: text.into(),
            lsep,
            rsep,
        }
    }

    /// A heading part.
    #[must_use]
    pub fn heading(level: u8, text: impl Into<String>) -> Self {
        Self::Heading {
            level,
            text: text.into(),
        }
    }

    /// A link part; the label is cleaned of brackets and collapsed.
    #[must_use]
    pub fn link(mode: LinkMode, label: Option<&str>, href: Reference) -> Self {
        let label = label
            .map(|l| {
                l.replace(['[', ']'], " ")
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .filter(|l| !l.is_empty());
        Self::Link { mode, label, href }
    }

    /// A code part, picking a fence that does not appear in the content.
    pub fn code(code: &str, language: Option<&str>, fence: Option<Fence>) -> Result<Self> {
        let fence = match fence {
            Some(fence) => fence,
            None if !code.contains("\n```") && !code.starts_with("```") => Fence::Backticks,
            None if !code.contains("\n~~~") && !code.starts_with("~~~") => Fence::Tildes,
            None => return Err(Error::Internal("cannot pick a valid code fence".into())),
        };
        Ok(Self::Code {
            fence,
            language: language.map(str::to_string).filter(|l| !l.is_empty()),
            code: strip_keep_indent(code).to_string(),
        })
    }

    /// Parse a fenced code block; `None` when the fences do not match.
    #[must_use]
    pub fn parse_code(value: &str) -> Option<Self> {
        let value = strip_keep_indent(value);
        let fence = if value.starts_with("````") && value.ends_with("\n````") {
            Fence::BackticksWide
        } else if value.starts_with("```") && value.ends_with("\n```") {
            Fence::Backticks
        } else if value.starts_with("~~~") && value.ends_with("\n~~~") {
            Fence::Tildes
        } else {
            return None;
        };

        let inner = value
            .strip_prefix(fence.as_str())?
            .strip_suffix(fence.as_str())?;
        let (language, code) = inner.split_once('\n')?;
        let language = language.trim();
        Some(Self::Code {
            fence,
            language: (!language.is_empty()).then(|| language.to_string()),
            code: strip_keep_indent(code).to_string(),
        })
    }

    /// Parse a `# Heading` line; `None` when malformed.
    #[must_use]
    pub fn parse_heading(value: &str) -> Option<Self> {
        let (marker, text) = value.split_once(' ')?;
        let level = marker.len();
        if marker.chars().all(|c| c == '#') && (1..=6).contains(&level) {
            #[allow(clippy::cast_possible_truncation)]
            Some(Self::Heading {
                level: level as u8,
                text: text.trim().to_string(),
            })
        } else {
            None
        }
    }

    /// Parse a `{n}----…` page marker line; `None` when malformed.
    #[must_use]
    pub fn parse_page_number(value: &str) -> Option<Self> {
        let rest = value.strip_prefix('{')?;
        let (number, _) = rest.split_once('}')?;
        Some(Self::PageNumber {
            page_number: number.parse().ok()?,
        })
    }

    /// Try to parse one of the link shapes; `None` when the candidate is not
    /// a well-formed reference.
    #[must_use]
    pub fn try_parse_link(value: &str) -> Option<Self> {
        let value = value.trim();
        let (mode, label, href): (LinkMode, &str, &str) = if let Some(inner) = value
            .strip_prefix("[^")
            .and_then(|v| v.strip_suffix(']'))
        {
            match inner.split_once('|') {
                Some((href, label)) => (LinkMode::Citation, label, href),
                None => (LinkMode::Citation, "", inner),
            }
        } else if value.starts_with("![") && value.ends_with(')') && value.contains("](") {
            let inner = &value[2..value.len() - 1];
            let (label, href) = inner.rsplit_once("](")?;
            (LinkMode::Embed, label, href)
        } else if let Some(inner) = value.strip_prefix('<').and_then(|v| v.strip_suffix('>')) {
            (LinkMode::Markdown, "", inner)
        } else if value.starts_with('[') && value.ends_with(')') && value.contains("](") {
            let inner = &value[1..value.len() - 1];
            let (label, href) = inner.split_once("](")?;
            (LinkMode::Markdown, label, href)
        } else {
            (LinkMode::Plain, "", value)
        };

        let reference = Reference::try_decode(href)?;
        Some(Self::link(
            mode,
            (!label.is_empty()).then_some(label),
            reference,
        ))
    }

    /// The separator hints on each side of the part.
    #[must_use]
    pub fn separators(&self) -> (Sep, Sep) {
        match self {
            Self::Code { .. } => (Sep::Blank, Sep::Blank),
            Self::Heading { .. } => (Sep::Blank, Sep::BlankForce),
            Self::Link { mode, .. } => {
                if *mode == LinkMode::Embed {
                    (Sep::Blank, Sep::Blank)
                } else {
                    (Sep::None, Sep::None)
                }
            },
            Self::PageNumber { .. } => (Sep::BlankForce, Sep::BlankForce),
            Self::Text { lsep, rsep, .. } => (*lsep, *rsep),
        }
    }

    /// Render the part to its markdown form.
    #[must_use]
    pub fn as_str(&self) -> String {
        match self {
            Self::Code {
                language, code, ..
            } => {
                let language = language.as_deref().unwrap_or("");
                format!("```{language}\n{code}\n```")
            },
            Self::Heading { level, text } => {
                format!("{} {}", "#".repeat(usize::from(*level)), text)
            },
            Self::Link { mode, label, href } => match mode {
                LinkMode::Citation => match label {
                    Some(label) => format!("[^{href}|{label}]"),
                    None => format!("[^{href}]"),
                },
                LinkMode::Embed => {
                    format!("![{}]({href})", label.as_deref().unwrap_or(""))
                },
                LinkMode::Markdown => match label {
                    Some(label) => format!("[{label}]({href})"),
                    None => format!("<{href}>"),
                },
                LinkMode::Plain => href.to_string(),
            },
            Self::PageNumber { page_number } => {
                format!("{{{page_number}}}{}", "-".repeat(PAGE_MARKER_DASHES))
            },
            Self::Text { text, .. } => text.clone(),
        }
    }

    /// The link href when this part is a link.
    #[must_use]
    pub const fn link_href(&self) -> Option<&Reference> {
        match self {
            Self::Link { href, .. } => Some(href),
            _ => None,
        }
    }
}

///
/// XML tag helpers
///

/// Open an XML-style tag, optionally carrying a `uri="…"` attribute whose
/// value stays a typed link part.
#[must_use]
pub fn xml_open(
    tag: &str,
    uri: Option<&Reference>,
    attributes: &[(String, String)],
    self_closing: bool,
) -> Vec<TextPart> {
    let attributes_str = attributes
        .iter()
        .filter_map(|(key, value)| {
            let clean_value = if value.contains('\n') {
                value.split_whitespace().collect::<Vec<_>>().join(" ")
            } else {
                value.clone()
            };
            (!clean_value.is_empty()).then(|| format!("{key}=\"{clean_value}\""))
        })
        .collect::<Vec<_>>()
        .join(" ");
    let attributes_str = if attributes_str.is_empty() {
        attributes_str
    } else {
        format!(" {attributes_str}")
    };
    let close = if self_closing { " />" } else { ">" };

    match uri {
        Some(uri) => vec![
            TextPart::text_sep(format!("<{tag} uri=\""), Sep::Newline, Sep::None),
            TextPart::Link {
                mode: LinkMode::Plain,
                label: None,
                href: uri.clone(),
            },
            TextPart::text_sep(format!("\"{attributes_str}{close}"), Sep::None, Sep::NewlineForce),
        ],
        None => vec![TextPart::text_sep(
            format!("<{tag}{attributes_str}{close}"),
            Sep::Newline,
            Sep::NewlineForce,
        )],
    }
}

/// Close an XML-style tag.
#[must_use]
pub fn xml_close(tag: &str) -> TextPart {
    TextPart::text_sep(format!("</{tag}>"), Sep::NewlineForce, Sep::Newline)
}

///
/// Blob
///

/// Binary content (images, audio, …) referenced from a body.
///
/// When the format cannot be consumed by the LLM, or the media cap was
/// reached, the `placeholder` is rendered instead: an alternative textual
/// representation such as an audio transcript or a detailed description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlob {
    /// The URI the blob is addressed by.
    pub uri: Reference,
    /// Textual stand-in used when the blob itself cannot be shown.
    pub placeholder: Option<String>,
    /// MIME type of the payload.
    pub mime_type: MimeType,
    /// Base64 payload, or an `https://` download URL.
    pub blob: String,
}

impl ContentBlob {
    /// Render the textual placeholder parts for this blob.
    #[must_use]
    pub fn render_placeholder(&self) -> Vec<TextPart> {
        let attributes = vec![("mimetype".to_string(), self.mime_type.to_string())];

        match &self.placeholder {
            None => xml_open("blob", Some(&self.uri), &attributes, true),
            Some(placeholder) => {
                let mut parts = xml_open("blob", Some(&self.uri), &attributes, false);
                parts.push(TextPart::text(placeholder.clone(), Sep::Newline));
                parts.push(xml_close("blob"));
                parts
            },
        }
    }

    /// The payload bytes, when inline; `None` when the blob is a URL.
    #[must_use]
    pub fn as_bytes(&self) -> Option<Vec<u8>> {
        if self.blob.starts_with("https://") {
            None
        } else {
            BASE64.decode(&self.blob).ok()
        }
    }

    /// A URL the payload can be fetched from: either the stored URL or a
    /// data URI.
    #[must_use]
    pub fn download_url(&self) -> String {
        if self.blob.starts_with("https://") {
            self.blob.clone()
        } else {
            format!("data:{};base64,{}", self.mime_type, self.blob)
        }
    }
}

///
/// Content text
///

/// Parse mode for [`ContentText::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Non-markdown textual content (JSON, CSV, …): extract plain references
    /// and keep the rest as text.
    Data,
    /// The full markdown grammar.
    Markdown,
}

/// An ordered sequence of parts plus an optional cache of the original text.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContentText {
    /// The typed parts.
    pub parts: Vec<TextPart>,
    /// The original text, when parsed from one.
    pub plain: Option<String>,
}

impl ContentText {
    /// Build from parts, applying the merge rule between neighbours.
    #[must_use]
    pub fn new(parts: Vec<TextPart>) -> Self {
        let mut merged: Vec<TextPart> = Vec::with_capacity(parts.len());
        for part in parts {
            append_part(&mut merged, part);
        }
        Self {
            parts: merged,
            plain: None,
        }
    }

    /// A single plain-text part carrying the original text.
    #[must_use]
    pub fn new_plain(text: &str, sep: Sep) -> Self {
        Self {
            parts: vec![TextPart::text(text, sep)],
            plain: Some(text.to_string()),
        }
    }

    /// A single embed link.
    #[must_use]
    pub fn new_embed(uri: Reference, label: Option<&str>) -> Self {
        let plain = format!("![{}]({uri})", label.unwrap_or(""));
        Self {
            parts: vec![TextPart::link(LinkMode::Embed, label, uri)],
            plain: Some(plain),
        }
    }

    /// Whether the content has no visible parts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self.parts.as_slice() {
            [] => true,
            [TextPart::Text { text, .. }] => text.is_empty(),
            _ => false,
        }
    }

    /// Join several contents with a separator between each.
    #[must_use]
    pub fn join(contents: &[Self], sep: Sep) -> Self {
        let mut parts: Vec<TextPart> = Vec::new();
        let mut first = true;
        for content in contents {
            if !first && sep != Sep::None {
                append_part(&mut parts, TextPart::text(String::new(), sep));
            }
            first = false;
            for part in &content.parts {
                append_part(&mut parts, part.clone());
            }
        }
        Self { parts, plain: None }
    }

    /// Parse text into content.
    ///
    /// `ParseMode::Data` bypasses markdown: it extracts plain references and
    /// preserves the rest as text. `default_link` is the mode given to bare
    /// references found in prose.
    #[must_use]
    pub fn parse(value: &str, mode: ParseMode, default_link: LinkMode) -> Self {
        let value = value.replace("\r\n", "\n");
        let parts = match mode {
            ParseMode::Data => parse_plain_links(&value, default_link),
            ParseMode::Markdown => parse_markdown(&value, default_link),
        };
        let mut content = Self::new(parts);
        content.plain = Some(value);
        content
    }

    /// Parse markdown with plain default links.
    #[must_use]
    pub fn parse_markdown(value: &str) -> Self {
        Self::parse(value, ParseMode::Markdown, LinkMode::Plain)
    }

    /// Serialize parts by interleaving effective separators.
    ///
    /// Returns the `plain` cache when present, unless `ignore_plain`.
    #[must_use]
    pub fn as_str(&self, ignore_plain: bool) -> String {
        if !ignore_plain {
            if let Some(plain) = &self.plain {
                return plain.clone();
            }
        }

        let mut content = String::new();
        let mut prev_sep = Sep::None;
        for part in &self.parts {
            let (lsep, rsep) = part.separators();
            let sep = prev_sep.max(lsep);
            if !content.is_empty() {
                content.push_str(sep.effective());
            }
            content.push_str(&part.as_str());
            prev_sep = rsep;
        }
        content
    }

    /// Sorted, deduplicated hrefs of non-embed links.
    #[must_use]
    pub fn dep_links(&self) -> Vec<Reference> {
        sorted_make(
            self.parts.iter().filter_map(|part| match part {
                TextPart::Link { mode, href, .. } if *mode != LinkMode::Embed => {
                    Some(href.clone())
                },
                _ => None,
            }),
            ToString::to_string,
        )
    }

    /// Sorted, deduplicated hrefs of embed links.
    #[must_use]
    pub fn dep_embeds(&self) -> Vec<Reference> {
        sorted_make(
            self.parts.iter().filter_map(|part| match part {
                TextPart::Link { mode, href, .. } if *mode == LinkMode::Embed => {
                    Some(href.clone())
                },
                _ => None,
            }),
            ToString::to_string,
        )
    }

    /// The sole embed href when the content is a single embed link.
    #[must_use]
    pub fn only_embed(&self) -> Option<&Reference> {
        match self.parts.as_slice() {
            [TextPart::Link {
                mode: LinkMode::Embed,
                href,
                ..
            }] => Some(href),
            _ => None,
        }
    }

    /// All link parts in order of appearance.
    #[must_use]
    pub fn parts_link(&self) -> Vec<&TextPart> {
        self.parts
            .iter()
            .filter(|part| matches!(part, TextPart::Link { .. }))
            .collect()
    }

    /// Rewrite link hrefs through `replace`, dropping the plain cache when
    /// anything changed.
    #[must_use]
    pub fn map_links(&self, replace: impl Fn(&Reference) -> Option<Reference>) -> Self {
        let mut changed = false;
        let parts = self
            .parts
            .iter()
            .map(|part| match part {
                TextPart::Link { mode, label, href } => match replace(href) {
                    Some(new_href) => {
                        changed = true;
                        TextPart::Link {
                            mode: *mode,
                            label: label.clone(),
                            href: new_href,
                        }
                    },
                    None => part.clone(),
                },
                _ => part.clone(),
            })
            .collect();
        if changed {
            Self { parts, plain: None }
        } else {
            self.clone()
        }
    }
}

impl fmt::Display for ContentText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str(false))
    }
}

///
/// Merge rule
///

/// Append a part, merging adjacent text nodes.
///
/// The effective separator is the stronger of `prev.rsep` and `next.lsep`.
/// With no separator, whitespace is preserved; otherwise trailing whitespace
/// of the previous text and leading newlines of the next are stripped, which
/// keeps first-line indentation intact.
pub fn append_part(parts: &mut Vec<TextPart>, part: TextPart) {
    let Some(prev_part) = parts.last() else {
        parts.push(part);
        return;
    };

    let sep = prev_part.separators().1.max(part.separators().0);

    // Merge consecutive text parts using their separators.
    if let (
        TextPart::Text {
            text: prev_text,
            lsep: prev_lsep,
            ..
        },
        TextPart::Text {
            text: next_text,
            rsep: next_rsep,
            ..
        },
    ) = (prev_part, &part)
    {
        let (prev_stripped, next_stripped) = if sep == Sep::None {
            (prev_text.as_str(), next_text.as_str())
        } else {
            (prev_text.trim_end(), lstrip_newlines(next_text))
        };
        let actual_sep = sep.effective();
        let merged = TextPart::text_sep(
            format!("{prev_stripped}{actual_sep}{next_stripped}"),
            *prev_lsep,
            *next_rsep,
        );
        *parts
            .last_mut()
            .unwrap_or_else(|| unreachable!("checked non-empty above")) = merged;
        return;
    }

    if sep != Sep::None {
        if let TextPart::Text {
            text,
            lsep,
            rsep,
        } = prev_part
        {
            let trimmed = TextPart::text_sep(text.trim_end().to_string(), *lsep, *rsep);
            *parts
                .last_mut()
                .unwrap_or_else(|| unreachable!("checked non-empty above")) = trimmed;
        }
    }

    let part = match part {
        TextPart::Text { text, lsep, rsep } if sep != Sep::None => {
            TextPart::text_sep(lstrip_newlines(&text).to_string(), lsep, rsep)
        },
        other => other,
    };
    parts.push(part);
}

///
/// Parsing helpers
///

static RE_MARKDOWN_HEADING: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\n(#+ .+|\{\d+\}\-{48})\n").unwrap()
});

static RE_MARKDOWN_LINK: Lazy<Regex> = Lazy::new(|| {
    let reference = regex_reference();
    #[allow(clippy::unwrap_used)]
    Regex::new(&format!(
        "(\"(?:{reference})\"|<(?:{reference})>|!?\\[[^\\]]*\\]\\((?:{reference})\\)|\\[\\^(?:{reference})(?:\\|[^\\]]+)?\\])"
    ))
    .unwrap()
});

static RE_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(&regex_reference()).unwrap()
});

/// Strip leading blank lines and all trailing whitespace, preserving the
/// indentation of the first content line.
#[must_use]
pub fn strip_keep_indent(value: &str) -> &str {
    let mut start = 0;
    for line in value.split_inclusive('\n') {
        if line.trim().is_empty() {
            start += line.len();
        } else {
            break;
        }
    }
    value[start..].trim_end()
}

/// Strip leading newline characters only, preserving spaces.
#[must_use]
pub fn lstrip_newlines(value: &str) -> &str {
    value.trim_start_matches('\n')
}

/// Which class a span of markdown belongs to after code splitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodeSplit {
    Text,
    CodeBlock,
    CodeExpr,
}

/// Split markdown into fenced code blocks, inline code expressions and the
/// remaining text, in document order.
fn markdown_split_code(value: &str) -> Vec<(CodeSplit, String)> {
    let mut result: Vec<(CodeSplit, String)> = Vec::new();
    let mut partial = String::new();
    let mut block: Option<(String, String)> = None; // (fence, accumulated)

    for line in value.split_inclusive('\n') {
        match &mut block {
            Some((fence, accumulated)) => {
                accumulated.push_str(line);
                if line.trim_end() == fence.as_str() {
                    result.push((CodeSplit::CodeBlock, std::mem::take(accumulated)));
                    block = None;
                }
            },
            None => {
                let trimmed = line.trim_end();
                let fence = if trimmed.starts_with("````") {
                    Some("````")
                } else if trimmed.starts_with("```") {
                    Some("```")
                } else if trimmed.starts_with("~~~") {
                    Some("~~~")
                } else {
                    None
                };
                if let Some(fence) = fence {
                    if !partial.is_empty() {
                        split_inline_code(&partial, &mut result);
                        partial.clear();
                    }
                    block = Some((fence.to_string(), line.to_string()));
                } else {
                    partial.push_str(line);
                }
            },
        }
    }

    // An unterminated fence falls back to plain text.
    if let Some((_, accumulated)) = block {
        partial.push_str(&accumulated);
    }
    if !partial.is_empty() {
        split_inline_code(&partial, &mut result);
    }
    result
}

/// Split `\`inline code\`` spans out of a text run.
fn split_inline_code(value: &str, result: &mut Vec<(CodeSplit, String)>) {
    let mut rest = value;
    while let Some(open) = rest.find('`') {
        let after_open = &rest[open + 1..];
        let Some(close_rel) = after_open.find('`') else {
            break;
        };
        // Inline code never spans lines.
        if after_open[..close_rel].contains('\n') {
            break;
        }
        let (before, span) = (
            &rest[..open],
            &rest[open..open + close_rel + 2],
        );
        if !before.is_empty() {
            result.push((CodeSplit::Text, before.to_string()));
        }
        result.push((CodeSplit::CodeExpr, span.to_string()));
        rest = &rest[open + close_rel + 2..];
    }
    if !rest.is_empty() {
        result.push((CodeSplit::Text, rest.to_string()));
    }
}

/// Parse markdown into parts, escaping references within code.
fn parse_markdown(value: &str, default_link: LinkMode) -> Vec<TextPart> {
    let mut parts: Vec<TextPart> = Vec::new();
    let mut partial_text = String::new();

    for (kind, text) in markdown_split_code(value) {
        match kind {
            // Insert code blocks as-is, escaping references.
            CodeSplit::CodeBlock => {
                parts.extend(parse_markdown_text(partial_text.trim_end(), default_link));
                partial_text.clear();

                match TextPart::parse_code(&text) {
                    Some(code) => parts.push(code),
                    None => parts.push(TextPart::text(text, Sep::None)),
                }
            },
            // Inline code containing a reference is flushed as text so the
            // reference stays escaped; otherwise it joins the surrounding
            // prose, supporting links whose label contains code.
            CodeSplit::CodeExpr => {
                if find_plain_references(&text).is_empty() {
                    partial_text.push_str(&text);
                } else {
                    if !partial_text.is_empty() {
                        parts.extend(parse_markdown_text(&partial_text, default_link));
                        partial_text.clear();
                    }
                    parts.push(TextPart::text(text, Sep::None));
                }
            },
            CodeSplit::Text => partial_text.push_str(&text),
        }
    }

    parts.extend(parse_markdown_text(partial_text.trim_end(), default_link));
    parts
}

/// Parse a code-free markdown chunk: headings, page markers, links, text.
fn parse_markdown_text(chunk_markdown: &str, default_link: LinkMode) -> Vec<TextPart> {
    if chunk_markdown.is_empty() || strip_keep_indent(chunk_markdown).is_empty() {
        return Vec::new();
    }

    let mut result: Vec<TextPart> = Vec::new();
    let wrapped = format!("\n\n{chunk_markdown}\n\n");

    // Split such that even items are markdown and odd items are headings or
    // page markers.
    let segments = split_with_captures(&RE_MARKDOWN_HEADING, &wrapped);
    let num_segments = segments.len();
    for (i, segment) in segments.into_iter().enumerate() {
        if i % 2 == 1 {
            let parsed = if segment.starts_with('{') {
                TextPart::parse_page_number(&segment)
            } else if segment.starts_with('#') {
                TextPart::parse_heading(&segment)
            } else {
                None
            };
            result.push(parsed.unwrap_or_else(|| TextPart::text(segment, Sep::Newline)));
            continue;
        }

        let mut section_text = segment.as_str();
        if i == 0 {
            section_text = lstrip_newlines(section_text);
        }
        if i == num_segments - 1 {
            section_text = section_text.trim_end_matches('\n');
        }
        if section_text.trim().is_empty() {
            continue;
        }

        for (j, segment) in split_with_captures(&RE_MARKDOWN_LINK, section_text)
            .into_iter()
            .enumerate()
        {
            if j % 2 == 1 {
                result.extend(parse_markdown_link(&segment));
                continue;
            }
            // Keep whitespace around markdown links; only discard blocks that
            // are entirely blank.
            if strip_keep_indent(&segment).is_empty() {
                continue;
            }
            result.extend(parse_plain_links(&segment, default_link));
        }
    }

    result
}

/// Split `value` by `regex`, alternating unmatched text and the match text,
/// starting and ending with (possibly empty) unmatched text.
fn split_with_captures(regex: &Regex, value: &str) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();
    let mut last = 0;
    for m in regex.find_iter(value) {
        result.push(value[last..m.start()].to_string());
        let matched = m.as_str();
        // The heading pattern consumes the surrounding newlines; keep only
        // the captured line.
        result.push(matched.trim_matches('\n').to_string());
        last = m.end();
    }
    result.push(value[last..].to_string());
    result
}

/// Parse a link candidate matched by the link regex.
fn parse_markdown_link(part: &str) -> Vec<TextPart> {
    if let Some(parsed) = TextPart::try_parse_link(part) {
        // Edge case: a web link inside parentheses, e.g. "(see [l](href))",
        // where the regex swallowed the closing parenthesis.
        if let TextPart::Link {
            mode,
            label,
            href: Reference::External(url),
        } = &parsed
        {
            let href = url.to_string();
            let clean_href = clean_reference_str(&href);
            if clean_href.len() < href.len() {
                let suffix = href[clean_href.len()..].to_string();
                if let Some(clean_url) = crate::uri::WebUrl::try_decode(clean_href) {
                    return vec![
                        TextPart::Link {
                            mode: *mode,
                            label: label.clone(),
                            href: Reference::External(clean_url),
                        },
                        TextPart::text(suffix, Sep::None),
                    ];
                }
                return vec![TextPart::text(part, Sep::None)];
            }
        }
        return vec![parsed];
    }

    // Quoted references usually appear as HTML attributes; keep the quotes
    // as text around a plain link.
    if part.starts_with('"') && part.ends_with('"') && part.len() >= 2 {
        if let Some(reference) = Reference::try_decode(&part[1..part.len() - 1]) {
            return vec![
                TextPart::text("\"", Sep::None),
                TextPart::Link {
                    mode: LinkMode::Plain,
                    label: None,
                    href: reference,
                },
                TextPart::text("\"", Sep::None),
            ];
        }
    }

    vec![TextPart::text(part, Sep::None)]
}

/// Extract plain references from a text run, splitting it into alternating
/// text and link parts.
fn parse_plain_links(value: &str, default_link: LinkMode) -> Vec<TextPart> {
    let mut parts: Vec<TextPart> = Vec::new();
    let mut remaining = value;

    for reference in find_plain_references(value) {
        let reference_str = reference.to_string();
        let Some((text_part, rest)) = remaining.split_once(&reference_str) else {
            continue;
        };
        if !text_part.is_empty() {
            parts.push(TextPart::text(text_part, Sep::None));
        }
        parts.push(TextPart::Link {
            mode: default_link,
            label: None,
            href: reference,
        });
        remaining = rest;
    }

    if !remaining.is_empty() {
        parts.push(TextPart::text(remaining, Sep::None));
    }
    parts
}

/// All well-formed references appearing in the text, in order, duplicates
/// preserved. Matches are cleaned of trailing punctuation before parsing.
#[must_use]
pub fn find_plain_references(text: &str) -> Vec<Reference> {
    RE_REFERENCE
        .find_iter(text)
        .filter_map(|m| Reference::try_decode(clean_reference_str(m.as_str())))
        .collect()
}

/// Remove trailing characters, such as commas or periods, from a reference
/// candidate (these naturally occur in prose). For `ndk://` URIs only a
/// trailing `.` is stripped; for URLs, trailing `)` is dropped only while the
/// `)` count exceeds the `(` count.
#[must_use]
pub fn clean_reference_str(reference: &str) -> &str {
    if reference.starts_with("ndk://") {
        return reference.trim_end_matches('.');
    }

    let mut cleaned = reference.trim_end_matches(['!', '$', '&', '(', '+', ',', '.', ':', '<', '>', '?']);
    let max_closing = cleaned.matches('(').count();
    while cleaned.matches(')').count() > max_closing && cleaned.ends_with(')') {
        cleaned = &cleaned[..cleaned.len() - 1];
    }
    cleaned
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn plain_ref(value: &str) -> Reference {
        Reference::decode(value).unwrap()
    }

    #[test]
    fn test_sep_ranks_force_over_blank() {
        // A forced newline outranks a plain blank line.
        assert_eq!(Sep::Blank.max(Sep::NewlineForce), Sep::NewlineForce);
        assert_eq!(Sep::NewlineForce.effective(), "\n");
        assert_eq!(Sep::BlankForce.effective(), "\n\n");
    }

    #[test]
    fn test_sep_serde_literals() {
        for sep in [Sep::None, Sep::Newline, Sep::Blank, Sep::NewlineForce, Sep::BlankForce] {
            let json = serde_json::to_string(&sep).unwrap();
            let back: Sep = serde_json::from_str(&json).unwrap();
            assert_eq!(back, sep);
        }
        assert_eq!(serde_json::to_string(&Sep::NewlineForce).unwrap(), "\"\\n-force\"");
    }

    #[test]
    fn test_part_round_trips() {
        let heading = TextPart::heading(2, "Usage");
        assert_eq!(heading.as_str(), "## Usage");
        assert_eq!(TextPart::parse_heading("## Usage").unwrap(), heading);

        let marker = TextPart::PageNumber { page_number: 3 };
        let rendered = marker.as_str();
        assert_eq!(rendered, format!("{{3}}{}", "-".repeat(48)));
        assert_eq!(TextPart::parse_page_number(&rendered).unwrap(), marker);
    }

    #[test]
    fn test_code_fence_selection_avoids_collision() {
        let code = TextPart::code("plain code", None, None).unwrap();
        assert!(matches!(code, TextPart::Code { fence: Fence::Backticks, .. }));

        let nested = TextPart::code("a\n```\nb\n```", None, None).unwrap();
        assert!(matches!(nested, TextPart::Code { fence: Fence::Tildes, .. }));

        assert!(TextPart::code("```\na\n```\n~~~\nb\n~~~", None, None).is_err());
    }

    #[test]
    fn test_link_shapes_render() {
        let href = plain_ref("ndk://stub/-/dir/example");
        assert_eq!(
            TextPart::link(LinkMode::Citation, None, href.clone()).as_str(),
            "[^ndk://stub/-/dir/example]"
        );
        assert_eq!(
            TextPart::link(LinkMode::Citation, Some("note"), href.clone()).as_str(),
            "[^ndk://stub/-/dir/example|note]"
        );
        assert_eq!(
            TextPart::link(LinkMode::Embed, None, href.clone()).as_str(),
            "![](ndk://stub/-/dir/example)"
        );
        assert_eq!(
            TextPart::link(LinkMode::Markdown, Some("see"), href.clone()).as_str(),
            "[see](ndk://stub/-/dir/example)"
        );
        assert_eq!(
            TextPart::link(LinkMode::Markdown, None, href.clone()).as_str(),
            "<ndk://stub/-/dir/example>"
        );
        assert_eq!(
            TextPart::link(LinkMode::Plain, None, href).as_str(),
            "ndk://stub/-/dir/example"
        );
    }

    #[test]
    fn test_link_label_is_cleaned() {
        let href = plain_ref("https://example.com");
        let link = TextPart::link(LinkMode::Markdown, Some("[a]  label "), href);
        assert!(matches!(
            link,
            TextPart::Link { label: Some(ref l), .. } if l == "a label"
        ));
    }

    #[test]
    fn test_try_parse_link_shapes() {
        let cases = [
            ("[^ndk://stub/-/a/b]", LinkMode::Citation),
            ("[^ndk://stub/-/a/b|label]", LinkMode::Citation),
            ("![img](ndk://stub/-/a/b/$media/x.png)", LinkMode::Embed),
            ("<https://example.com>", LinkMode::Markdown),
            ("[label](https://example.com)", LinkMode::Markdown),
            ("ndk://stub/-/a/b", LinkMode::Plain),
        ];
        for (value, expected) in cases {
            let parsed = TextPart::try_parse_link(value).unwrap();
            assert!(
                matches!(parsed, TextPart::Link { mode, .. } if mode == expected),
                "wrong mode for '{value}'"
            );
        }
        assert!(TextPart::try_parse_link("[label](not-a-ref)").is_none());
    }

    #[test]
    fn test_merge_adjacent_text_parts() {
        // Given: two text parts separated by a blank line hint
        let content = ContentText::new(vec![
            TextPart::text_sep("first  ", Sep::None, Sep::Blank),
            TextPart::text_sep("\nsecond", Sep::None, Sep::None),
        ]);

        // Then: one merged part with trailing/leading whitespace stripped
        assert_eq!(content.parts.len(), 1);
        assert_eq!(content.as_str(true), "first\n\nsecond");
    }

    #[test]
    fn test_merge_preserves_whitespace_without_separator() {
        let content = ContentText::new(vec![
            TextPart::text("first  ", Sep::None),
            TextPart::text(" second", Sep::None),
        ]);
        assert_eq!(content.as_str(true), "first   second");
    }

    #[test]
    fn test_merge_force_newline_collapses() {
        let content = ContentText::new(vec![
            TextPart::text_sep("</tag>", Sep::None, Sep::NewlineForce),
            TextPart::text_sep("\n\n\nafter", Sep::None, Sep::None),
        ]);
        assert_eq!(content.as_str(true), "</tag>\nafter");
    }

    #[test]
    fn test_serialization_uses_max_separator() {
        let content = ContentText::new(vec![
            TextPart::heading(1, "Title"),
            TextPart::text("body", Sep::Newline),
        ]);
        // Heading's rsep is a forced blank line, which beats the newline.
        assert_eq!(content.as_str(true), "# Title\n\nbody");
    }

    #[test]
    fn test_parse_extracts_headings_and_markers() {
        let text = format!("# Title\n\nIntro.\n\n{{2}}{}\n\nMore.", "-".repeat(48));
        let content = ContentText::parse_markdown(&text);

        let kinds: Vec<&str> = content
            .parts
            .iter()
            .map(|p| match p {
                TextPart::Heading { .. } => "heading",
                TextPart::PageNumber { .. } => "page",
                TextPart::Text { .. } => "text",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["heading", "text", "page", "text"]);
    }

    #[test]
    fn test_parse_code_fence_escapes_references() {
        // The S2 scenario: references inside fences are escaped, prose
        // references are extracted.
        let text = "This is <https://example.com>:\n```lang\nBut this ndk://x/y/z is omitted!\n```\nHowever, ndk://sharepoint/SiteName/Documents/file1.txt is extracted.";
        let content = ContentText::parse_markdown(text);

        let links: Vec<(&LinkMode, String)> = content
            .parts
            .iter()
            .filter_map(|p| match p {
                TextPart::Link { mode, href, .. } => Some((mode, href.to_string())),
                _ => None,
            })
            .collect();
        assert_eq!(links.len(), 2);
        assert_eq!(*links[0].0, LinkMode::Markdown);
        assert_eq!(links[0].1, "https://example.com");
        assert_eq!(*links[1].0, LinkMode::Plain);
        assert_eq!(links[1].1, "ndk://sharepoint/SiteName/Documents/file1.txt");

        // The fenced code is preserved verbatim as a single Code part.
        let codes: Vec<&TextPart> = content
            .parts
            .iter()
            .filter(|p| matches!(p, TextPart::Code { .. }))
            .collect();
        assert_eq!(codes.len(), 1);
        assert!(matches!(
            codes[0],
            TextPart::Code { language: Some(l), code, .. }
                if l == "lang" && code == "But this ndk://x/y/z is omitted!"
        ));
    }

    #[test]
    fn test_parse_inline_code_with_reference_is_flushed_as_text() {
        let text = "See `ndk://stub/-/a/b` for details.";
        let content = ContentText::parse_markdown(text);
        assert!(
            content.parts.iter().all(|p| !matches!(p, TextPart::Link { .. })),
            "reference inside inline code must stay escaped"
        );
        assert!(content.as_str(true).contains("`ndk://stub/-/a/b`"));
    }

    #[test]
    fn test_parse_quoted_reference_is_plain_link() {
        let text = "<img src=\"https://example.com/img.png\" />";
        let content = ContentText::parse_markdown(text);
        let link = content
            .parts
            .iter()
            .find(|p| matches!(p, TextPart::Link { .. }))
            .unwrap();
        assert!(matches!(
            link,
            TextPart::Link { mode: LinkMode::Plain, href, .. }
                if href.to_string() == "https://example.com/img.png"
        ));
    }

    #[test]
    fn test_parse_data_mode_extracts_plain_references() {
        let text = "{\"url\": \"https://example.com/data\", \"next\": \"ndk://stub/-/a/b\"}";
        let content = ContentText::parse(text, ParseMode::Data, LinkMode::Plain);
        let links = content.parts_link();
        assert_eq!(links.len(), 2);
        // Data mode keeps the full text reproducible.
        assert_eq!(content.as_str(false), text);
    }

    #[test]
    fn test_clean_reference_trailing_punctuation() {
        assert_eq!(
            clean_reference_str("https://example.com/page."),
            "https://example.com/page"
        );
        assert_eq!(
            clean_reference_str("https://example.com/page),"),
            "https://example.com/page"
        );
        // Balanced parentheses are kept.
        assert_eq!(
            clean_reference_str("https://example.com/page_(disambiguation)"),
            "https://example.com/page_(disambiguation)"
        );
        assert_eq!(clean_reference_str("ndk://stub/-/a/b."), "ndk://stub/-/a/b");
        // Only '.' is stripped from ndk URIs.
        assert_eq!(clean_reference_str("ndk://stub/-/a/b,"), "ndk://stub/-/a/b,");
    }

    #[test]
    fn test_references_preserved_in_order_with_duplicates() {
        let text = "a https://example.com/x b https://example.com/x c";
        let refs = find_plain_references(text);
        assert_eq!(refs.len(), 2);

        let content = ContentText::parse(text, ParseMode::Data, LinkMode::Plain);
        assert_eq!(content.parts_link().len(), 2);
        assert_eq!(content.as_str(false), text);
    }

    #[test]
    fn test_dep_links_and_embeds_sorted() {
        let content = ContentText::new(vec![
            TextPart::link(LinkMode::Embed, None, plain_ref("ndk://stub/-/a/b/$media/z.png")),
            TextPart::link(LinkMode::Plain, None, plain_ref("ndk://stub/-/a/c")),
            TextPart::link(LinkMode::Embed, None, plain_ref("ndk://stub/-/a/b/$media/a.png")),
            TextPart::link(LinkMode::Markdown, None, plain_ref("https://example.com")),
        ]);

        let embeds: Vec<String> = content.dep_embeds().iter().map(ToString::to_string).collect();
        assert_eq!(
            embeds,
            vec![
                "ndk://stub/-/a/b/$media/a.png",
                "ndk://stub/-/a/b/$media/z.png"
            ]
        );

        let links: Vec<String> = content.dep_links().iter().map(ToString::to_string).collect();
        assert_eq!(links, vec!["https://example.com", "ndk://stub/-/a/c"]);
    }

    #[test]
    fn test_only_embed() {
        let embed = ContentText::new_embed(plain_ref("ndk://stub/-/a/b/$media/x.png"), None);
        assert!(embed.only_embed().is_some());

        let mixed = ContentText::new(vec![
            TextPart::text("intro", Sep::None),
            TextPart::link(LinkMode::Embed, None, plain_ref("ndk://stub/-/a/b/$media/x.png")),
        ]);
        assert!(mixed.only_embed().is_none());
    }

    #[test]
    fn test_blob_placeholder_rendering() {
        let blob = ContentBlob {
            uri: plain_ref("ndk://stub/-/a/b/$media/x.png"),
            placeholder: Some("A chart of quarterly sales.".into()),
            mime_type: MimeType::decode("image/webp").unwrap(),
            blob: BASE64.encode(b"data"),
        };
        let text = ContentText::new(blob.render_placeholder()).as_str(true);
        assert!(text.starts_with("<blob uri=\"ndk://stub/-/a/b/$media/x.png\""));
        assert!(text.contains("A chart of quarterly sales."));
        assert!(text.ends_with("</blob>"));

        assert_eq!(blob.as_bytes().unwrap(), b"data");
    }

    #[test]
    fn test_xml_open_wraps_uri_as_link_part() {
        let parts = xml_open(
            "document",
            Some(&plain_ref("ndk://stub/-/a/b/$body")),
            &[],
            false,
        );
        assert_eq!(parts.len(), 3);
        assert!(matches!(parts[1], TextPart::Link { .. }));
        let text = ContentText::new(parts).as_str(true);
        assert_eq!(text, "<document uri=\"ndk://stub/-/a/b/$body\">");
    }

    #[test]
    fn test_content_serde_round_trip() {
        let content = ContentText::parse_markdown("# T\n\nbody <https://example.com> end");
        let json = serde_json::to_string(&content).unwrap();
        let back: ContentText = serde_json::from_str(&json).unwrap();
        assert_eq!(back, content);
    }

    proptest::proptest! {
        #[test]
        fn test_parse_preserves_references_in_order(
            words in proptest::collection::vec("[a-z]{1,6}", 1..6),
        ) {
            // Interleave prose words with references; extraction must keep
            // their order.
            let mut text = String::new();
            for (i, word) in words.iter().enumerate() {
                text.push_str(word);
                text.push(' ');
                text.push_str(&format!("https://example.com/p{i} "));
            }
            let content = ContentText::parse_markdown(&text);
            let links: Vec<String> = content
                .parts
                .iter()
                .filter_map(|p| p.link_href().map(ToString::to_string))
                .collect();
            let expected: Vec<String> = (0..words.len())
                .map(|i| format!("https://example.com/p{i}"))
                .collect();
            proptest::prop_assert_eq!(links, expected);
        }
    }
}
