//! Built-in dimension collectors shipped with the gateway.
//!
//! Grouped by api_format; adding a metered dimension for a new family is
//! additive here, no DB seeding required. `apply_presets` materializes the
//! set into the `dimension_collectors` table for admin editing.

use aether_storage::{CollectorInput, Storage};

use crate::collector::{CollectorSource, CollectorSpec, CollectorValueType};

struct Def {
    api_format: &'static str,
    task_type: &'static str,
    dimension_name: &'static str,
    source: CollectorSource,
    source_path: &'static str,
    value_type: CollectorValueType,
    priority: i32,
}

const fn response_int(
    api_format: &'static str,
    dimension_name: &'static str,
    source_path: &'static str,
) -> Def {
    Def {
        api_format,
        task_type: "chat",
        dimension_name,
        source: CollectorSource::Response,
        source_path,
        value_type: CollectorValueType::Int,
        priority: 10,
    }
}

const fn video_meta(
    api_format: &'static str,
    dimension_name: &'static str,
    source_path: &'static str,
    value_type: CollectorValueType,
    priority: i32,
) -> Def {
    Def {
        api_format,
        task_type: "video",
        dimension_name,
        source: CollectorSource::Metadata,
        source_path,
        value_type,
        priority,
    }
}

const DEFS: &[Def] = &[
    // OpenAI chat completions
    response_int("openai:chat", "input_tokens", "usage.prompt_tokens"),
    response_int("openai:chat", "output_tokens", "usage.completion_tokens"),
    // Anthropic messages
    response_int("claude:chat", "input_tokens", "usage.input_tokens"),
    response_int("claude:chat", "output_tokens", "usage.output_tokens"),
    // Gemini generateContent
    response_int("gemini:chat", "input_tokens", "usageMetadata.promptTokenCount"),
    response_int(
        "gemini:chat",
        "output_tokens",
        "usageMetadata.candidatesTokenCount",
    ),
    // Async video settlement: extra dims from task metadata. These live under
    // the chat format key; the video formats reach them via the base-format
    // fallback in DimensionCollectorService.
    video_meta("openai:chat", "video_resolution_key", "task.size", CollectorValueType::Str, 10),
    video_meta("openai:chat", "video_resolution_key", "task.resolution", CollectorValueType::Str, 0),
    video_meta("openai:chat", "video_size_bytes", "task.video_size_bytes", CollectorValueType::Int, 0),
    video_meta(
        "openai:chat",
        "video_duration_seconds",
        "task.video_duration_seconds",
        CollectorValueType::Float,
        10,
    ),
    video_meta("openai:chat", "video_duration_seconds", "task.duration_seconds", CollectorValueType::Int, 0),
    video_meta("gemini:chat", "video_resolution_key", "task.size", CollectorValueType::Str, 10),
    video_meta("gemini:chat", "video_resolution_key", "task.resolution", CollectorValueType::Str, 0),
    video_meta("gemini:chat", "video_size_bytes", "task.video_size_bytes", CollectorValueType::Int, 0),
    video_meta(
        "gemini:chat",
        "video_duration_seconds",
        "task.video_duration_seconds",
        CollectorValueType::Float,
        10,
    ),
    video_meta("gemini:chat", "video_duration_seconds", "task.duration_seconds", CollectorValueType::Int, 0),
];

pub fn builtin_collectors() -> Vec<CollectorSpec> {
    DEFS.iter()
        .map(|def| CollectorSpec {
            api_format: def.api_format.to_string(),
            task_type: def.task_type.to_string(),
            dimension_name: def.dimension_name.to_string(),
            source: def.source,
            source_path: Some(def.source_path.to_string()),
            value_type: def.value_type,
            transform_expression: None,
            default_value: None,
            priority: def.priority,
            is_enabled: true,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresetApplyMode {
    /// Keep existing rows, only add missing ones.
    Merge,
    /// Update existing rows in place.
    Overwrite,
}

#[derive(Debug, Default)]
pub struct PresetApplyResult {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

pub async fn apply_presets(
    storage: &dyn Storage,
    mode: PresetApplyMode,
) -> PresetApplyResult {
    let mut result = PresetApplyResult::default();

    for spec in builtin_collectors() {
        let input = CollectorInput {
            api_format: spec.api_format.clone(),
            task_type: spec.task_type.clone(),
            dimension_name: spec.dimension_name.clone(),
            source_type: spec.source.as_str().to_string(),
            source_path: spec.source_path.clone(),
            value_type: spec.value_type.as_str().to_string(),
            transform_expression: spec.transform_expression.clone(),
            default_value: spec.default_value.clone(),
            priority: spec.priority,
            is_enabled: spec.is_enabled,
        };

        let existing = match storage
            .find_collector(
                &spec.api_format,
                &spec.task_type,
                &spec.dimension_name,
                spec.priority,
            )
            .await
        {
            Ok(existing) => existing,
            Err(err) => {
                result.errors.push(format!(
                    "query failed for {}/{}/{}: {err}",
                    spec.api_format, spec.task_type, spec.dimension_name
                ));
                continue;
            }
        };

        match existing {
            Some(row) => match mode {
                PresetApplyMode::Merge => result.skipped += 1,
                PresetApplyMode::Overwrite => {
                    match storage.update_collector(row.id, input).await {
                        Ok(()) => result.updated += 1,
                        Err(err) => result.errors.push(format!(
                            "update failed for collector {}: {err}",
                            row.id
                        )),
                    }
                }
            },
            None => match storage.insert_collector(input).await {
                Ok(()) => result.created += 1,
                Err(err) => result.errors.push(format!(
                    "insert failed for {}/{}/{}: {err}",
                    spec.api_format, spec.task_type, spec.dimension_name
                )),
            },
        }
    }

    result
}
