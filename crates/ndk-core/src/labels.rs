//! Label generation glue: batch observations by tokens, call the inference
//! collaborator with a JSON response schema, and parse the typed response.
//!
//! Inference failures are logged and yield an empty label list for the
//! affected group; they never fail the request.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::bundle::BundleBody;
use crate::connector::KnowledgeContext;
use crate::content::{ContentText, LinkMode, Sep, TextPart};
use crate::data::MimeType;
use crate::error::Result;
use crate::label::{LabelDefinition, LabelInfo, LabelName, LabelTarget, LabelValue, ResourceLabel};
use crate::observation::Observation;
use crate::render::{LlmPiece, Rendered};
use crate::sorted::{OnConflict, sorted_insert};
use crate::uri::ObservableUri;

/// The image types the inference models can view natively.
#[must_use]
pub fn supported_image_types() -> Vec<MimeType> {
    ["image/png", "image/jpeg", "image/webp", "image/heic", "image/heif"]
        .iter()
        .filter_map(|s| MimeType::try_decode(s))
        .collect()
}

/// The built-in label definitions used when the context supplies none:
/// a `description` for bodies, chunks and media, and a `placeholder` for
/// media.
#[must_use]
pub fn default_label_definitions() -> Vec<LabelDefinition> {
    let name = |value: &str| {
        #[allow(clippy::unwrap_used)]
        LabelName::decode(value).unwrap()
    };
    vec![
        LabelDefinition {
            info: LabelInfo {
                name: name("description"),
                forall: vec![LabelTarget::Body, LabelTarget::Chunk, LabelTarget::Media],
                prompt: "Generate a concise, dense description of the target observation, \
                         2-3 sentences and at most 50 words. It must be self-contained and \
                         let the reader infer what QUESTIONS the source can answer, not \
                         give answers. It is used by humans and tools to decide whether to \
                         consult this source, so make every word count and keep it valid \
                         when dynamic data changes but the structure stays the same."
                    .into(),
            },
            filters: crate::label::ResourceFilters::default(),
        },
        LabelDefinition {
            info: LabelInfo {
                name: name("placeholder"),
                forall: vec![LabelTarget::Media],
                prompt: "Generate a dense, highly detailed textual placeholder for the \
                         media. It replaces the raw data when an agent cannot view it \
                         natively, so it must be a drop-in representation carrying ALL of \
                         the information in the original, e.g. an equivalent MermaidJS \
                         diagram for a whiteboard photo."
                    .into(),
            },
            filters: crate::label::ResourceFilters::default(),
        },
    ]
}

/// Generate labels for a single body bundle using the context's definitions
/// (or the defaults), converting between relative and absolute targets.
pub async fn generate_standard_labels(
    context: &KnowledgeContext,
    cached: &[ResourceLabel],
    bundle: &BundleBody,
) -> Vec<ResourceLabel> {
    let resource_uri = bundle.uri.resource_uri().clone();

    let cached_values: Vec<LabelValue> = cached
        .iter()
        .map(|label| label.as_absolute(&resource_uri))
        .collect();

    let definitions = if context.label_definitions.is_empty() {
        default_label_definitions()
    } else {
        context.label_definitions.clone()
    };

    let values =
        generate_labels(context, &cached_values, std::slice::from_ref(bundle), &definitions).await;

    values
        .into_iter()
        .filter(|value| *value.target.resource_uri() == resource_uri)
        .map(|value| value.as_relative())
        .collect()
}

/// Generate label values for multiple bundles based on label definitions.
///
/// Each definition targets observation kinds (body, chunk, media); one value
/// is generated per matching, not-yet-cached observation.
pub async fn generate_labels(
    context: &KnowledgeContext,
    cached: &[LabelValue],
    bundles: &[BundleBody],
    definitions: &[LabelDefinition],
) -> Vec<LabelValue> {
    if definitions.is_empty() || bundles.is_empty() {
        return Vec::new();
    }

    let observations: Vec<Observation> = bundles
        .iter()
        .flat_map(BundleBody::observations)
        .collect();
    if observations.is_empty() {
        return Vec::new();
    }

    let cached_keys: Vec<String> = cached
        .iter()
        .map(|value| format!("{}/{}", value.name, value.target))
        .collect();

    let items = explode_definitions(&cached_keys, &observations, definitions);
    if items.is_empty() {
        return Vec::new();
    }

    run_inference(context, &observations, &items)
        .await
        .into_iter()
        .map(|inferred| LabelValue {
            name: inferred.name,
            target: inferred.target,
            value: serde_json::Value::String(inferred.value),
        })
        .collect()
}

///
/// Definition expansion
///

/// A label to generate, grouping all targets under one name so the LLM can
/// fill them in a single call.
#[derive(Debug, Clone)]
struct LabelItem {
    name: LabelName,
    description: String,
    targets: Vec<ObservableUri>,
}

impl LabelItem {
    /// The system-message section and `(property, description)` pairs for
    /// this label.
    fn make_system(&self) -> (String, Vec<(String, String)>) {
        let mapping: Vec<(String, String)> = self
            .targets
            .iter()
            .map(|target| {
                (
                    self.name.as_property(&target.to_string()),
                    format!("The {} label for {target}", self.name),
                )
            })
            .collect();

        let mapping_lines = self
            .targets
            .iter()
            .zip(&mapping)
            .map(|(target, (property, _))| format!("- {target} -> {property}"))
            .collect::<Vec<_>>()
            .join("\n");

        let section = format!(
            "## {}\n\n{}\n\nGenerate for each observation and place in the corresponding property:\n{}\n",
            self.name, self.description, mapping_lines
        );
        (section, mapping)
    }
}

/// Expand definitions into items: one per label name, collecting every
/// matching observation that is not already cached.
fn explode_definitions(
    cached_keys: &[String],
    observations: &[Observation],
    definitions: &[LabelDefinition],
) -> Vec<LabelItem> {
    let mut items: Vec<LabelItem> = Vec::new();

    for definition in definitions {
        let info = &definition.info;
        if info.forall.is_empty() {
            continue;
        }

        for observation in observations {
            let uri = observation.uri();
            if cached_keys.contains(&format!("{}/{}", info.name, uri)) {
                continue;
            }
            if !definition.filters.matches(uri.resource_uri()) {
                continue;
            }
            if !info.matches_forall(uri.suffix().kind()) {
                continue;
            }

            match items.iter_mut().find(|item| item.name == info.name) {
                Some(item) => {
                    sorted_insert(
                        &mut item.targets,
                        uri.clone(),
                        ToString::to_string,
                        OnConflict::Keep,
                    );
                },
                None => items.push(LabelItem {
                    name: info.name.clone(),
                    description: info.prompt.clone(),
                    targets: vec![uri.clone()],
                }),
            }
        }
    }

    items.sort_by(|a, b| a.name.cmp(&b.name));
    items
}

///
/// Inference
///

#[derive(Debug, Clone)]
struct InferredLabel {
    name: LabelName,
    target: ObservableUri,
    value: String,
}

async fn run_inference(
    context: &KnowledgeContext,
    observations: &[Observation],
    items: &[LabelItem],
) -> Vec<InferredLabel> {
    let groups = group_observations_by_tokens(observations, context.tunables.group_threshold);
    let mut results: Vec<InferredLabel> = Vec::new();

    for group in groups {
        let group_uris: Vec<String> = group.iter().map(|obs| obs.uri().to_string()).collect();
        let group_items = filter_items_for_group(items, &group_uris);
        if group_items.is_empty() {
            continue;
        }

        let (system, response_schema, mapping) = build_inference_params(&group_items);
        let prompt = render_prompt(&group, context.tunables.limit_media);

        match completion_with_retry(context, &system, &response_schema, &prompt).await {
            Ok(response_json) => results.extend(parse_response(&response_json, &mapping)),
            Err(error) => {
                warn!(error = %error, "failed to generate labels for observation group");
            },
        }
    }

    results
}

/// Call the inference collaborator, retrying recoverable failures on the
/// configured delay schedule.
async fn completion_with_retry(
    context: &KnowledgeContext,
    system: &str,
    response_schema: &serde_json::Value,
    prompt: &[LlmPiece],
) -> Result<String> {
    let mut attempt = 0;
    loop {
        match context
            .inference
            .completion_json(Some(system), response_schema, prompt)
            .await
        {
            Ok(response) => return Ok(response),
            Err(error)
                if error.is_recoverable()
                    && attempt < context.tunables.retry_delay_secs.len() =>
            {
                let delay = context.tunables.retry_delay_secs[attempt];
                debug!(attempt, delay, error = %error, "retrying inference call");
                tokio::time::sleep(Duration::from_secs(delay)).await;
                attempt += 1;
            },
            Err(error) => return Err(error),
        }
    }
}

/// Batch observations so each group fits the token threshold.
fn group_observations_by_tokens(
    observations: &[Observation],
    group_threshold: usize,
) -> Vec<Vec<Observation>> {
    let mut groups: Vec<Vec<Observation>> = Vec::new();
    let mut current: Vec<Observation> = Vec::new();
    let mut current_tokens: usize = 0;

    for observation in observations {
        let num_tokens = observation.num_tokens();
        if current_tokens + num_tokens > group_threshold && !current.is_empty() {
            groups.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current.push(observation.clone());
        current_tokens += num_tokens;
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Restrict items to the targets present in a group.
fn filter_items_for_group(items: &[LabelItem], group_uris: &[String]) -> Vec<LabelItem> {
    items
        .iter()
        .filter_map(|item| {
            let targets: Vec<ObservableUri> = item
                .targets
                .iter()
                .filter(|target| group_uris.contains(&target.to_string()))
                .cloned()
                .collect();
            (!targets.is_empty()).then(|| LabelItem {
                name: item.name.clone(),
                description: item.description.clone(),
                targets,
            })
        })
        .collect()
}

type PropertyMapping = Vec<(String, LabelName, ObservableUri)>;

/// Build the system message, response schema and property mapping for a set
/// of items.
fn build_inference_params(items: &[LabelItem]) -> (String, serde_json::Value, PropertyMapping) {
    let mut system_parts: Vec<String> = vec![
        "You are a knowledge extraction assistant. Generate metadata labels for the provided observations.".into(),
        String::new(),
        "For each property in the response schema, generate an appropriate value based on the label description and observation content. Return null if the label cannot be inferred.".into(),
        String::new(),
    ];

    let mut properties = serde_json::Map::new();
    let mut mapping: PropertyMapping = Vec::new();

    for item in items {
        let (section, item_properties) = item.make_system();
        system_parts.push(section);

        for (target, (property, description)) in item.targets.iter().zip(&item_properties) {
            mapping.push((property.clone(), item.name.clone(), target.clone()));
            properties.insert(
                property.clone(),
                json!({
                    "type": ["string", "null"],
                    "description": description,
                }),
            );
        }
    }

    let required: Vec<String> = properties.keys().cloned().collect();
    let response_schema = json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    });

    (system_parts.join("\n"), response_schema, mapping)
}

/// Render the grouped observations into the inference prompt.
fn render_prompt(observations: &[Observation], limit_media: usize) -> Vec<LlmPiece> {
    let mut parts: Vec<TextPart> = vec![TextPart::text(
        "Generate label values for the following observations. Analyze each observation \
         carefully and provide appropriate values for the requested labels.",
        Sep::Blank,
    )];
    parts.extend(observations.iter().map(|obs| {
        TextPart::link(
            LinkMode::Embed,
            obs.description(),
            obs.uri().clone().into(),
        )
    }));

    let prompt = ContentText::new(parts);
    let rendered = Rendered::render(&prompt, observations);
    rendered.as_llm_inline(&supported_image_types(), limit_media)
}

/// Parse the schema-typed JSON response leniently: unknown properties and
/// null or blank values are skipped.
fn parse_response(response_json: &str, mapping: &PropertyMapping) -> Vec<InferredLabel> {
    let Ok(serde_json::Value::Object(response)) =
        serde_json::from_str::<serde_json::Value>(response_json)
    else {
        warn!("failed to parse label response as a JSON object");
        return Vec::new();
    };

    let mut results: Vec<InferredLabel> = Vec::new();
    for (property, value) in response {
        let Some(value) = value.as_str().map(str::trim).filter(|v| !v.is_empty()) else {
            continue;
        };
        let Some((_, name, target)) = mapping.iter().find(|(p, _, _)| *p == property) else {
            continue;
        };
        results.push(InferredLabel {
            name: name.clone(),
            target: target.clone(),
            value: value.to_string(),
        });
    }
    results
}
