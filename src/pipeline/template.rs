//! Base pipeline template: parsing into text segments and block slots.
//!
//! A block slot marker (`<perform_tests>`, ...) must sit alone on its line.
//! The line's leading whitespace is recorded with the slot and prepended to
//! every emitted command line. Value placeholders (`<test_id>`, ...) may
//! appear anywhere in the template text and are resolved while filling.
//! Block contents are emitted verbatim and never scanned for markers.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::Context;
use regex::Regex;
use thiserror::Error;

const BUILTIN: &str = include_str!("base_pipeline.groovy");

/// Named block slots of the base template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Slot {
    SetupEnvironment,
    ObtainMetricsEnvironment,
    ObtainMetricsCollectionFiles,
    StartMetricsCollection,
    ObtainTestsEnvironment,
    ObtainTests,
    PerformTests,
    EndMetricsCollection,
    PublishResultsEnvironment,
    PublishResults,
    CleanupEnvironment,
}

impl Slot {
    pub const ALL: [Slot; 11] = [
        Slot::SetupEnvironment,
        Slot::ObtainMetricsEnvironment,
        Slot::ObtainMetricsCollectionFiles,
        Slot::StartMetricsCollection,
        Slot::ObtainTestsEnvironment,
        Slot::ObtainTests,
        Slot::PerformTests,
        Slot::EndMetricsCollection,
        Slot::PublishResultsEnvironment,
        Slot::PublishResults,
        Slot::CleanupEnvironment,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Slot::SetupEnvironment => "setup_environment",
            Slot::ObtainMetricsEnvironment => "obtain_metrics_environment",
            Slot::ObtainMetricsCollectionFiles => "obtain_metrics_collection_files",
            Slot::StartMetricsCollection => "start_metrics_collection",
            Slot::ObtainTestsEnvironment => "obtain_tests_environment",
            Slot::ObtainTests => "obtain_tests",
            Slot::PerformTests => "perform_tests",
            Slot::EndMetricsCollection => "end_metrics_collection",
            Slot::PublishResultsEnvironment => "publish_results_environment",
            Slot::PublishResults => "publish_results",
            Slot::CleanupEnvironment => "cleanup_environment",
        }
    }

    pub fn marker(&self) -> String {
        format!("<{}>", self.name())
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}>", self.name())
    }
}

/// Inline placeholders resolved by value while filling.
pub const VALUE_PLACEHOLDERS: [&str; 4] = [
    "test_id",
    "communication_token_credential",
    "ci_cd_manager_url_test_status_url",
    "ci_cd_manager_url_publish_test_results",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("line {line}: unknown marker <{marker}>")]
    UnknownMarker { marker: String, line: usize },

    #[error("line {line}: block marker {slot} must be alone on its line")]
    InlineSlot { slot: Slot, line: usize },

    #[error("line {line}: block marker {slot} appears more than once")]
    DuplicateSlot { slot: Slot, line: usize },

    #[error("template has no {0} block marker")]
    MissingSlot(Slot),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FillError {
    #[error("no commands for block {0}")]
    EmptySlot(Slot),

    #[error("no value for placeholder <{0}>")]
    MissingValue(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Slot {
        slot: Slot,
        indent: String,
        eol: &'static str,
    },
}

/// A parsed base template.
#[derive(Debug, Clone)]
pub struct PipelineTemplate {
    segments: Vec<Segment>,
}

fn marker_regex() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| Regex::new(r"<([a-z][a-z0-9_]*)>").expect("marker pattern is valid"))
}

impl PipelineTemplate {
    /// The template compiled into the binary.
    pub fn builtin() -> Result<Self, TemplateError> {
        Self::parse(BUILTIN)
    }

    /// Load and validate a custom template file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline template: {}", path.display()))?;
        let template = Self::parse(&text)
            .with_context(|| format!("invalid pipeline template: {}", path.display()))?;
        tracing::info!(path = %path.display(), "loaded custom pipeline template");
        Ok(template)
    }

    pub fn parse(text: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut text_run = String::new();
        let mut seen: BTreeMap<Slot, usize> = BTreeMap::new();

        for (index, raw_line) in text.split_inclusive('\n').enumerate() {
            let line_no = index + 1;
            let (line, eol) = match raw_line.strip_suffix('\n') {
                Some(l) => (l, "\n"),
                None => (raw_line, ""),
            };

            let mut block = None;
            for cap in marker_regex().captures_iter(line) {
                let name = &cap[1];
                if let Some(slot) = Slot::from_name(name) {
                    if line.trim() != slot.marker() {
                        return Err(TemplateError::InlineSlot { slot, line: line_no });
                    }
                    block = Some(slot);
                } else if !VALUE_PLACEHOLDERS.contains(&name) {
                    return Err(TemplateError::UnknownMarker {
                        marker: name.to_string(),
                        line: line_no,
                    });
                }
            }

            match block {
                Some(slot) => {
                    if seen.insert(slot, line_no).is_some() {
                        return Err(TemplateError::DuplicateSlot { slot, line: line_no });
                    }
                    if !text_run.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text_run)));
                    }
                    let indent_len = line.len() - line.trim_start().len();
                    segments.push(Segment::Slot {
                        slot,
                        indent: line[..indent_len].to_string(),
                        eol,
                    });
                }
                None => text_run.push_str(raw_line),
            }
        }
        if !text_run.is_empty() {
            segments.push(Segment::Text(text_run));
        }

        if let Some(missing) = Slot::ALL.into_iter().find(|s| !seen.contains_key(s)) {
            return Err(TemplateError::MissingSlot(missing));
        }
        Ok(Self { segments })
    }

    /// Indentation recorded for `slot`.
    pub fn indent_of(&self, slot: Slot) -> Option<&str> {
        self.segments.iter().find_map(|s| match s {
            Segment::Slot { slot: sl, indent, .. } if *sl == slot => Some(indent.as_str()),
            _ => None,
        })
    }

    /// Replace every block slot with its command lines and every value
    /// placeholder of the template text with its value.
    ///
    /// Multi-line commands have each of their lines indented. A slot with no
    /// commands, or a placeholder with no value, fails the whole fill.
    pub fn fill(
        &self,
        blocks: &BTreeMap<Slot, Vec<String>>,
        values: &BTreeMap<&str, String>,
    ) -> Result<String, FillError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => substitute(text, values, &mut out)?,
                Segment::Slot { slot, indent, eol } => {
                    let commands = match blocks.get(slot) {
                        Some(c) if !c.is_empty() => c,
                        _ => return Err(FillError::EmptySlot(*slot)),
                    };
                    let lines: Vec<String> = commands
                        .iter()
                        .flat_map(|c| c.lines())
                        .map(|l| format!("{indent}{l}"))
                        .collect();
                    out.push_str(&lines.join("\n"));
                    out.push_str(eol);
                }
            }
        }
        Ok(out)
    }
}

/// Copy `text` into `out`, resolving its value placeholders. Parsing
/// guarantees text segments hold no other markers.
fn substitute(text: &str, values: &BTreeMap<&str, String>, out: &mut String) -> Result<(), FillError> {
    let mut last = 0;
    for cap in marker_regex().captures_iter(text) {
        let Some(whole) = cap.get(0) else { continue };
        let value = values
            .get(&cap[1])
            .ok_or_else(|| FillError::MissingValue(cap[1].to_string()))?;
        out.push_str(&text[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(())
}
