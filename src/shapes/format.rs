//! Pluggable export formatters. An export row stores the rendered file
//! content; the destination decides how to hand it to the user.

use anyhow::Result;
use serde_json::json;

use crate::request::ExportFormat;

use super::client::ShapesExportData;

pub(crate) trait ExportFormatter: Send + Sync {
    fn file_extension(&self) -> &'static str;

    fn render(&self, data: &ShapesExportData) -> Result<String>;
}

pub(crate) struct JsonFormatter;

impl ExportFormatter for JsonFormatter {
    fn file_extension(&self) -> &'static str {
        "json"
    }

    fn render(&self, data: &ShapesExportData) -> Result<String> {
        let document = json!({
            "profile": {
                "slug": data.profile.slug,
                "displayName": data.profile.display_name,
                "systemPrompt": data.profile.system_prompt,
                "model": data.profile.model,
                "visionModel": data.profile.vision_model,
                "temperature": data.profile.temperature,
                "frequencyPenalty": data.profile.frequency_penalty,
                "maxTokens": data.profile.max_tokens,
            },
            "memories": data.memories,
            "stories": data.stories,
            "personalization": data.personalization,
        });
        Ok(serde_json::to_string_pretty(&document)?)
    }
}

pub(crate) struct MarkdownFormatter;

impl ExportFormatter for MarkdownFormatter {
    fn file_extension(&self) -> &'static str {
        "md"
    }

    fn render(&self, data: &ShapesExportData) -> Result<String> {
        let mut out = String::new();
        out.push_str(&format!("# {}\n\n", data.profile.display_name));
        out.push_str(&format!("Slug: `{}`\n\n", data.profile.slug));
        out.push_str(&format!("Model: `{}`\n\n", data.profile.model));

        out.push_str("## System prompt\n\n");
        out.push_str(&data.profile.system_prompt);
        out.push_str("\n\n");

        out.push_str(&format!("## Memories ({})\n\n", data.memories.len()));
        for memory in &data.memories {
            out.push_str(&format!("- {memory}\n"));
        }
        out.push('\n');

        out.push_str(&format!("## Stories ({})\n\n", data.stories.len()));
        for story in &data.stories {
            out.push_str(&format!("- {story}\n"));
        }

        Ok(out)
    }
}

pub(crate) fn formatter_for(format: ExportFormat) -> Box<dyn ExportFormatter> {
    match format {
        ExportFormat::Json => Box::new(JsonFormatter),
        ExportFormat::Markdown => Box::new(MarkdownFormatter),
    }
}
