//! Ingestion: turning raw observed content into bundles.
//!
//! A fragment goes through mode-specific processing (plain, data,
//! spreadsheet, markdown), blob selection and rescaling, link resolution and
//! chunking, producing a body bundle plus any derived original-resolution
//! file bundles.

use std::collections::BTreeMap;

use tracing::debug;

use crate::bundle::{Bundle, BundleBody, BundleCollection, BundleFile, BundlePlain};
use crate::chunking::chunk_body;
use crate::config::Tunables;
use crate::connector::{
    Fragment, FragmentMode, ImageCodec, KnowledgeContext, ObservedContent, ObservedResult,
    blob_key_path,
};
use crate::content::{ContentText, LinkMode, ParseMode, Sep};
use crate::data::{DataUri, MimeType, image_mime_types, image_preferred_type};
use crate::error::{Error, Result};
use crate::history::{MetadataDelta, ObservedDelta, ResourceView};
use crate::label::ResourceLabel;
use crate::labels::generate_standard_labels;
use crate::observation::{ObsBodySection, ObsChunk, ObsMedia};
use crate::relation::Relation;
use crate::sorted::sorted_make;
use crate::tokens::estimate_tokens;
use crate::uri::{Reference, ResourceUri, Suffix};

/// The outcome of ingesting one observation.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestedResult {
    /// Metadata after the ingestion's own updates.
    pub metadata: MetadataDelta,
    /// The produced bundle.
    pub bundle: Bundle,
    /// Labels generated for the bundle.
    pub labels: Vec<ResourceLabel>,
    /// The journal record describing what was observed.
    pub observed: ObservedDelta,
    /// Derived bundles, e.g. original-resolution files for downscaled
    /// images, sorted by URI.
    pub derived: Vec<BundleFile>,
    /// Whether the bundle should be persisted.
    pub should_cache: bool,
}

/// Ingest the result of one observe call.
pub async fn ingest_observe_result(
    context: &KnowledgeContext,
    resource_uri: &ResourceUri,
    cached: Option<&ResourceView>,
    metadata: &MetadataDelta,
    observed: &ObservedResult,
) -> Result<IngestedResult> {
    let (bundle, derived) = match &observed.content {
        ObservedContent::Fragment(fragment) => {
            let (body, files) = ingest_fragment(
                context,
                resource_uri,
                metadata.attributes.mime_type.as_ref(),
                fragment,
                observed.should_cache,
            )
            .await?;
            (Bundle::Body(body), files)
        },
        ObservedContent::Bundle(bundle) => (bundle.clone(), Vec::new()),
    };

    // Generate the standard labels for body bundles when the connector asked
    // for them. Descriptions within the bundle count as forced by the
    // connector; generated ones flow in through the history instead, so they
    // can be refreshed independently.
    let labels: Vec<ResourceLabel> = match (&bundle, observed.option_labels) {
        (Bundle::Body(body), true) => {
            let cached_labels = cached.map(cached_labels).unwrap_or_default();
            generate_standard_labels(context, &cached_labels, body).await
        },
        _ => Vec::new(),
    };

    let bundle_info = bundle.info();
    let observed_delta = ObservedDelta {
        suffix: bundle.uri().suffix().clone(),
        mime_type: bundle_info.mime_type,
        description: bundle_info.description,
        sections: Some(bundle_info.sections),
        observations: Some(bundle_info.observations),
        relations: Some(ingest_observe_relations(
            context,
            &bundle,
            &observed.relations,
            observed.option_relations_parent,
            observed.option_relations_link,
        )),
    };

    let mut derived = derived;
    derived.sort_by_key(|file| file.uri.to_string());

    Ok(IngestedResult {
        metadata: metadata.with_update(&observed.metadata),
        bundle,
        labels,
        observed: observed_delta,
        derived,
        should_cache: observed.should_cache,
    })
}

/// The labels previously generated for a resource, reconstructed from the
/// merged view's observation summaries.
fn cached_labels(view: &ResourceView) -> Vec<ResourceLabel> {
    let mut labels: Vec<ResourceLabel> = Vec::new();
    for observed in &view.observed {
        if let Some(description) = &observed.description {
            labels.push(ResourceLabel::text(
                label_name_description(),
                observed.suffix.clone(),
                description,
            ));
        }
        for info in &observed.observations {
            if let Some(description) = &info.description {
                labels.push(ResourceLabel::text(
                    label_name_description(),
                    info.suffix.clone(),
                    description,
                ));
            }
        }
    }
    labels
}

fn label_name_description() -> crate::label::LabelName {
    #[allow(clippy::unwrap_used)]
    crate::label::LabelName::decode("description").unwrap()
}

/// Record implicit relations from a bundle: collection children as `parent`
/// relations and document links as `link` relations, skipping targets
/// already covered by another relation. Deduplicated by unique id.
fn ingest_observe_relations(
    context: &KnowledgeContext,
    bundle: &Bundle,
    observed_relations: &[Relation],
    option_relations_parent: bool,
    option_relations_link: bool,
) -> Vec<Relation> {
    let resource_uri = bundle.uri().resource_uri().clone();
    let mut relations: Vec<Relation> = observed_relations.to_vec();

    if option_relations_parent {
        if let Bundle::Collection(collection) = bundle {
            let child_uris = sorted_make(collection.results.iter().cloned(), ToString::to_string);
            for child in child_uris {
                if relations.iter().any(|r| r.touches(&child)) {
                    continue;
                }
                relations.push(Relation::Parent {
                    parent: resource_uri.clone(),
                    child,
                });
            }
        }
    }

    if option_relations_link {
        if let Bundle::Body(body) = bundle {
            let targets = sorted_make(
                body.chunks
                    .iter()
                    .flat_map(|chunk| chunk.text.dep_links())
                    .filter_map(|href| match href {
                        Reference::Knowledge(uri) => Some(uri.resource_uri()),
                        Reference::External(_) => None,
                    })
                    .filter(|target| context.should_backlink(target)),
                ToString::to_string,
            );
            for target in targets {
                if relations.iter().any(|r| r.touches(&target)) {
                    continue;
                }
                relations.push(Relation::Link {
                    source: resource_uri.clone().into(),
                    target: target.into(),
                });
            }
        }
    }

    sorted_make(relations, Relation::unique_id)
}

///
/// Fragments
///

/// Ingest a fragment into a body bundle plus derived file bundles.
pub async fn ingest_fragment(
    context: &KnowledgeContext,
    resource_uri: &ResourceUri,
    mime_type: Option<&MimeType>,
    fragment: &Fragment,
    should_cache: bool,
) -> Result<(BundleBody, Vec<BundleFile>)> {
    let tunables = &context.tunables;

    if fragment.mode == FragmentMode::Plain {
        let text = shorten_text(
            &fragment.text,
            tunables.fragment_threshold,
            tunables.fragment_trimmed,
        )?;
        let bundle = BundleBody::make_single(
            resource_uri,
            ContentText::new_plain(&text, Sep::Newline),
            Vec::new(),
            None,
        );
        return Ok((bundle, Vec::new()));
    }

    if mime_type.is_some_and(|m| m.mode() == crate::data::MimeMode::Spreadsheet) {
        let bundle = ingest_spreadsheet(tunables, resource_uri, &fragment.text)?;
        return Ok((bundle, Vec::new()));
    }

    if fragment.mode == FragmentMode::Data {
        let trimmed = shorten_text(
            &fragment.text,
            tunables.fragment_threshold,
            tunables.fragment_trimmed,
        )?;
        let text = ContentText::parse(&trimmed, ParseMode::Data, LinkMode::Plain);
        let text = ingest_links(context, text).await;
        let bundle = BundleBody::make_single(resource_uri, text, Vec::new(), None);
        return Ok((bundle, Vec::new()));
    }

    // Markdown: only keep the full text and chunk when caching is enabled.
    let markdown = if should_cache {
        fragment.text.clone()
    } else {
        shorten_text(
            &fragment.text,
            tunables.fragment_threshold,
            tunables.fragment_trimmed,
        )?
    };

    let (text, media, mut files) = if fragment.blobs.is_empty() {
        (ContentText::parse_markdown(&markdown), Vec::new(), Vec::new())
    } else {
        ingest_fragment_blobs(context, resource_uri, markdown, fragment.blobs.clone()).await?
    };
    if !should_cache {
        files.clear();
    }

    let text = ingest_links(context, text).await;
    let bundle = if should_cache {
        chunk_body(tunables, resource_uri.clone(), text, media).await?
    } else {
        BundleBody::make_single(resource_uri, text, media, None)
    };
    Ok((bundle, files))
}

/// Process a fragment's blobs on a blocking thread.
async fn ingest_fragment_blobs(
    context: &KnowledgeContext,
    resource_uri: &ResourceUri,
    text: String,
    blobs: BTreeMap<String, DataUri>,
) -> Result<(ContentText, Vec<ObsMedia>, Vec<BundleFile>)> {
    let codec = context.image_codec.clone();
    let tunables = context.tunables.clone();
    let resource_uri = resource_uri.clone();
    tokio::task::spawn_blocking(move || {
        ingest_fragment_blobs_sync(codec.as_ref(), &tunables, &resource_uri, &text, &blobs)
    })
    .await
    .map_err(|e| Error::Internal(format!("blob ingestion task failed: {e}")))?
}

/// Select, rescale and substitute a fragment's blobs.
///
/// Unused blobs (referenced nowhere in the text) and repeated blobs (same
/// key appearing many times, or the same data reused under many keys) are
/// discarded as likely thumbnails or letterhead. Kept blobs replace their
/// key with the absolute media URI; discarded ones become anchor fragments
/// so the LLM still sees the filename and original caption.
fn ingest_fragment_blobs_sync(
    codec: &dyn ImageCodec,
    tunables: &Tunables,
    resource_uri: &ResourceUri,
    text: &str,
    blobs: &BTreeMap<String, DataUri>,
) -> Result<(ContentText, Vec<ObsMedia>, Vec<BundleFile>)> {
    let mut unused_keys: Vec<&String> = Vec::new();
    let mut repeated_keys: Vec<&String> = Vec::new();
    let mut seen_data: Vec<&DataUri> = Vec::new();
    let mut repeated_data: Vec<&DataUri> = Vec::new();

    for (key, data) in blobs {
        let num_occurrences = text.matches(&format!("]({key})")).count();
        if num_occurrences == 0 {
            unused_keys.push(key);
        } else if num_occurrences > 1 {
            repeated_keys.push(key);
        }
        if repeated_data.contains(&data) {
            continue;
        }
        if seen_data.contains(&data) {
            repeated_data.push(data);
        } else {
            seen_data.push(data);
        }
    }

    // Do not discard small images when the whole fragment is one image.
    let image_fragment = !text.contains('\n') && blobs.len() == 1;

    let mut selected: BTreeMap<&String, DataUri> = BTreeMap::new();
    let mut files: Vec<BundleFile> = Vec::new();
    for (key, data) in blobs {
        if unused_keys.contains(&key)
            || repeated_keys.contains(&key)
            || repeated_data.contains(&data)
        {
            continue;
        }
        let (kept, original) =
            ingest_fragment_blob(codec, tunables, resource_uri, key, data, image_fragment)?;
        if let Some(kept) = kept {
            selected.insert(key, kept);
        }
        files.extend(original);
    }

    let mut new_text = text.to_string();
    let mut media: Vec<ObsMedia> = Vec::new();
    for key in blobs.keys() {
        let path = blob_key_path(key);
        if let Some(data) = selected.get(key) {
            let (mime_type, blob) = data.parts();
            let absolute = resource_uri.child_observable(Suffix::media(path));
            new_text = new_text.replace(&format!("]({key})"), &format!("]({absolute})"));
            media.push(ObsMedia {
                uri: absolute,
                description: None,
                placeholder: None,
                mime_type,
                blob,
            });
        } else {
            let anchor = path
                .iter()
                .map(crate::data::FileName::as_str)
                .collect::<Vec<_>>()
                .join("/");
            new_text = new_text.replace(&format!("]({key})"), &format!("](#{anchor})"));
        }
    }
    media.sort_by_key(|m| m.uri.to_string());

    Ok((ContentText::parse_markdown(&new_text), media, files))
}

/// Decide one blob's fate: discard, keep, or downscale with an
/// original-resolution file kept alongside.
///
/// Unsupported MIME types are discarded. Images below the minimum side are
/// discarded unless the fragment is a single image. Oversized images are
/// downscaled to fit while preserving aspect ratio, and the original bytes
/// become a derived file bundle. Kept images are re-encoded to the canonical
/// type; when the codec cannot read dimensions, the blob passes through
/// unchanged.
fn ingest_fragment_blob(
    codec: &dyn ImageCodec,
    tunables: &Tunables,
    resource_uri: &ResourceUri,
    key: &str,
    data: &DataUri,
    image_fragment: bool,
) -> Result<(Option<DataUri>, Option<BundleFile>)> {
    let mime_type = data.mime_type().clone();
    if !image_mime_types().contains(&mime_type) {
        return Ok((None, None));
    }

    let Some((width, height)) = codec.dimensions(data) else {
        debug!(key, "image dimensions unknown, keeping blob unchanged");
        return Ok((Some(data.clone()), None));
    };

    if !image_fragment
        && (width < tunables.image_min_side_px || height < tunables.image_min_side_px)
    {
        return Ok((None, None));
    }

    let max_side = tunables.image_max_side_px;
    let oversized = width > max_side || height > max_side;
    let original_file = oversized.then(|| BundleFile {
        uri: resource_uri.child_affordance(Suffix::file(blob_key_path(key))),
        description: None,
        mime_type: Some(mime_type.clone()),
        expiry: None,
        download_url: crate::observation::DownloadUrl::Data(data.clone()),
    });

    if mime_type == image_preferred_type() && !oversized {
        return Ok((Some(data.clone()), None));
    }

    let processed = if oversized {
        codec.downscale(data, max_side)?
    } else {
        codec.reencode(data)?
    };
    Ok((Some(processed), original_file))
}

///
/// Links
///

/// Resolve external link references into resource URIs where the connector
/// chain recognises them.
pub async fn ingest_links(context: &KnowledgeContext, text: ContentText) -> ContentText {
    let hrefs = sorted_make(
        text.parts_link()
            .iter()
            .filter_map(|part| part.link_href())
            .filter(|href| matches!(href, Reference::External(_)))
            .cloned(),
        ToString::to_string,
    );
    if hrefs.is_empty() {
        return text;
    }

    let locators = context.try_infer_locators(&hrefs).await;
    if locators.is_empty() {
        return text;
    }

    text.map_links(|href| {
        locators
            .get(&href.to_string())
            .map(|locator| Reference::from(locator.resource_uri.clone()))
    })
}

///
/// Spreadsheets
///

/// Ingest a spreadsheet's CSV-style document representation.
///
/// Multiple sheets are identified by markdown `## ` headers: one section and
/// one chunk per sheet, each trimmed individually. Spreadsheets are mostly
/// consulted for their format and columns, so aggressive trimming keeps the
/// context window free; full analysis happens through code tools instead.
fn ingest_spreadsheet(
    tunables: &Tunables,
    resource_uri: &ResourceUri,
    text: &str,
) -> Result<BundleBody> {
    // A small or single-sheet spreadsheet stays a single chunk.
    let is_single_sheet = !text.starts_with("## ") && !text.contains("\n\n## ");
    if estimate_tokens(text, 0) <= tunables.spreadsheet_threshold || is_single_sheet {
        let trimmed = shorten_text(
            text,
            tunables.spreadsheet_threshold,
            tunables.spreadsheet_chunk_trimmed,
        )?;
        return Ok(BundleBody::make_single(
            resource_uri,
            ContentText::parse(&trimmed, ParseMode::Data, LinkMode::Plain),
            Vec::new(),
            None,
        ));
    }

    let mut sections: Vec<ObsBodySection> = Vec::new();
    let mut chunks: Vec<ObsChunk> = Vec::new();

    let wrapped = format!("\n\n{text}");
    for (index, sheet) in wrapped.split("\n\n## ").skip(1).enumerate() {
        let (heading, sheet_text) = sheet.split_once('\n').unwrap_or((sheet, ""));
        #[allow(clippy::cast_possible_truncation)]
        let index = index as u32;
        sections.push(ObsBodySection {
            indexes: vec![index],
            heading: Some(heading.trim().to_string()),
        });
        let sheet_text = shorten_text(
            sheet_text.trim(),
            tunables.spreadsheet_chunk_trimmed,
            tunables.spreadsheet_chunk_trimmed,
        )?;
        chunks.push(ObsChunk::new(
            resource_uri,
            &[index],
            ContentText::parse(&sheet_text, ParseMode::Data, LinkMode::Plain),
            None,
        ));
    }

    Ok(BundleBody::new(
        resource_uri,
        None,
        sections,
        chunks,
        Vec::new(),
    ))
}

///
/// Trimming
///

/// Trim text exceeding `threshold_tokens` down to `trimmed_max_tokens`,
/// appending a `… (N lines omitted)` marker.
///
/// Fails when even the first line exceeds the budget (e.g. a one-line JSON
/// blob): there is no natural place to split.
pub fn shorten_text(
    text: &str,
    threshold_tokens: usize,
    trimmed_max_tokens: usize,
) -> Result<String> {
    let trimmed_max_tokens = if trimmed_max_tokens == 0 {
        threshold_tokens
    } else {
        trimmed_max_tokens
    };
    if estimate_tokens(text, 0) <= threshold_tokens {
        return Ok(text.to_string());
    }

    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let mut selected: Vec<&str> = Vec::new();
    let mut selected_tokens: usize = 0;
    for line in &lines {
        let line_tokens = estimate_tokens(line, 0);
        if selected_tokens + line_tokens > trimmed_max_tokens {
            break;
        }
        selected.push(line);
        selected_tokens += line_tokens;
    }

    if selected.is_empty() {
        return Err(Error::Ingestion("file too large".into()));
    }

    let omitted = lines.len() - selected.len();
    Ok(format!(
        "{}\n\n... ({omitted} lines omitted)",
        selected.concat().trim_end()
    ))
}

///
/// Attachments
///

/// Ingest an attachment payload into bundles for its resource.
///
/// Text payloads produce a `plain` bundle plus a single-chunk `body`; binary
/// image payloads produce a media `body` plus the raw `file`; URL payloads
/// produce a `file` bundle only.
pub fn ingest_attachment(
    resource_uri: &ResourceUri,
    description: Option<&str>,
    attachment: &crate::action::AttachmentData,
) -> Vec<Bundle> {
    use crate::action::AttachmentData;

    match attachment {
        AttachmentData::Plain { mime_type, text } => vec![
            Bundle::Plain(BundlePlain {
                uri: resource_uri.child_affordance(Suffix::plain()),
                mime_type: Some(mime_type.clone()),
                text: text.clone(),
            }),
            Bundle::Body(BundleBody::make_single(
                resource_uri,
                ContentText::new_plain(text, Sep::Newline),
                Vec::new(),
                description.map(str::to_string),
            )),
        ],
        AttachmentData::Blob { mime_type, blob } => {
            let mut bundles = vec![Bundle::File(BundleFile {
                uri: resource_uri.child_affordance(Suffix::file(Vec::new())),
                description: description.map(str::to_string),
                mime_type: Some(mime_type.clone()),
                expiry: None,
                download_url: crate::observation::DownloadUrl::Data(DataUri::from_encoded(
                    mime_type.clone(),
                    blob.clone(),
                )),
            })];
            if mime_type.mode() == crate::data::MimeMode::Image {
                bundles.push(Bundle::Body(BundleBody::make_media(
                    resource_uri,
                    mime_type.clone(),
                    blob.clone(),
                    description.map(str::to_string),
                    None,
                )));
            }
            bundles
        },
        AttachmentData::Url {
            mime_type,
            expiry,
            download_url,
        } => vec![Bundle::File(BundleFile {
            uri: resource_uri.child_affordance(Suffix::file(Vec::new())),
            description: description.map(str::to_string),
            mime_type: mime_type.clone(),
            expiry: *expiry,
            download_url: crate::observation::DownloadUrl::Web(download_url.clone()),
        })],
    }
}
