//! capibara_promptproc
//!
//! Pure transformation from a raw prompt (+ optional context) into the
//! text actually submitted to a provider: whitespace/charset cleanup,
//! keyword classification, template wrapping, context decoration, and a
//! fixed safety preamble. No I/O, no async - deterministic for a given
//! (prompt, context) pair.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptClass {
    DataProcessing,
    FileOperations,
    ApiIntegration,
    DataAnalysis,
    WebScraping,
    Automation,
    General,
}

impl PromptClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptClass::DataProcessing => "data_processing",
            PromptClass::FileOperations => "file_operations",
            PromptClass::ApiIntegration => "api_integration",
            PromptClass::DataAnalysis => "data_analysis",
            PromptClass::WebScraping => "web_scraping",
            PromptClass::Automation => "automation",
            PromptClass::General => "general",
        }
    }
}

const DATA_PROCESSING_KEYWORDS: &[&str] =
    &["process", "parse", "transform", "convert", "csv", "json", "data"];
const FILE_OPERATIONS_KEYWORDS: &[&str] = &[
    "file", "read", "write", "create", "delete", "move", "copy", "directory", "folder",
];
const API_INTEGRATION_KEYWORDS: &[&str] = &[
    "api", "http", "request", "endpoint", "rest", "graphql", "fetch", "post", "get",
];
const DATA_ANALYSIS_KEYWORDS: &[&str] =
    &["analyze", "statistics", "correlation", "aggregate", "summary_stats"];
const WEB_SCRAPING_KEYWORDS: &[&str] = &["scrape", "crawl", "extract", "html", "website", "url"];
const AUTOMATION_KEYWORDS: &[&str] = &["automate", "schedule", "batch", "loop", "repeat", "workflow"];

/// Collapse runs of whitespace to a single space and drop characters
/// outside a permissive printable set. Grounded on the original
/// `_clean_prompt`'s regex passes, reimplemented as a single char scan.
pub fn clean_prompt(prompt: &str) -> String {
    let collapsed = collapse_whitespace(prompt.trim());
    collapsed.chars().filter(|c| is_permissive_printable(*c)).collect()
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_space = false;
    for c in s.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out
}

fn is_permissive_printable(c: char) -> bool {
    c.is_alphanumeric() || " .,!?;:()[]{}\"'`~@#$%^&*+=|\\/<>-_".contains(c)
}

/// Classify a cleaned prompt into one of the seven buckets. First
/// matching keyword set wins, in the fixed order spec.md §4.3 lists.
pub fn classify(prompt: &str) -> PromptClass {
    let lower = prompt.to_lowercase();
    let has_any = |kws: &[&str]| kws.iter().any(|k| lower.contains(k));

    if has_any(DATA_PROCESSING_KEYWORDS) {
        PromptClass::DataProcessing
    } else if has_any(FILE_OPERATIONS_KEYWORDS) {
        PromptClass::FileOperations
    } else if has_any(API_INTEGRATION_KEYWORDS) {
        PromptClass::ApiIntegration
    } else if has_any(DATA_ANALYSIS_KEYWORDS) {
        PromptClass::DataAnalysis
    } else if has_any(WEB_SCRAPING_KEYWORDS) {
        PromptClass::WebScraping
    } else if has_any(AUTOMATION_KEYWORDS) {
        PromptClass::Automation
    } else {
        PromptClass::General
    }
}

fn wrap_with_template(class: PromptClass, prompt: &str) -> String {
    match class {
        PromptClass::DataProcessing => format!("Process the following data: {prompt}"),
        PromptClass::FileOperations => format!("Perform file operations: {prompt}"),
        PromptClass::ApiIntegration => format!("Create API integration: {prompt}"),
        PromptClass::DataAnalysis => format!("Analyze data: {prompt}"),
        PromptClass::WebScraping => format!("Scrape web data: {prompt}"),
        PromptClass::Automation => format!("Automate task: {prompt}"),
        PromptClass::General => prompt.to_string(),
    }
}

/// Append context decorations: file list, data description, environment
/// description, and a type signature for `inputs` - never input values.
fn decorate_with_context(prompt: &str, context: Option<&Value>) -> String {
    let Some(context) = context else {
        return prompt.to_string();
    };
    let mut out = prompt.to_string();

    if let Some(files) = context.get("files").and_then(|v| v.as_array()) {
        let names: Vec<String> = files
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect();
        if !names.is_empty() {
            out = format!("Given files: {}. {out}", names.join(", "));
        }
    }
    if let Some(data) = context.get("data").and_then(|v| v.as_str()) {
        out = format!("{out}\n\nContext: Data: {data}");
    }
    if let Some(environment) = context.get("environment").and_then(|v| v.as_str()) {
        out = format!("{out}\n\nEnvironment: {environment}");
    }
    if let Some(inputs) = context.get("inputs") {
        if let Some(signature) = inputs_type_signature(inputs) {
            out = format!("{out}\n\n{signature}");
        }
    }
    out
}

/// Collapse an `inputs` value into "accepts N parameters of types {...}",
/// never surfacing the underlying values.
fn inputs_type_signature(inputs: &Value) -> Option<String> {
    let values: Vec<&Value> = match inputs {
        Value::Array(items) if !items.is_empty() => items.iter().collect(),
        Value::Object(map) if !map.is_empty() => map.values().collect(),
        _ => return None,
    };
    let mut types: Vec<&'static str> = values.iter().map(|v| classify_input_type(v)).collect();
    types.sort_unstable();
    types.dedup();
    Some(format!(
        "The function should accept {} parameters of types: {}",
        values.len(),
        types.join(", ")
    ))
}

fn classify_input_type(v: &Value) -> &'static str {
    match v {
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::String(s) => {
            if s.parse::<f64>().map(|f| f.is_finite()).unwrap_or(false) {
                "number"
            } else {
                "string"
            }
        }
        _ => "string",
    }
}

const SAFETY_PREAMBLE: &str = "\n\nSAFETY REQUIREMENTS:\n\
- Produce validated, error-handled code, not a proof-of-concept sketch.\n\
- Follow secure coding practice for the target language.\n\
- Do not perform disallowed filesystem, network, or subprocess operations.\n\
- Validate all inputs before they are used.\n\
- Surface failures through explicit error handling, not silent truncation.";

#[derive(Debug, Clone)]
pub struct ProcessedPrompt {
    pub class: PromptClass,
    pub text: String,
}

/// Run the full pipeline: clean, classify, template, decorate, and add
/// the fixed safety preamble. Deterministic for a given (prompt, context).
pub fn process(prompt: &str, context: Option<&Value>) -> ProcessedPrompt {
    let cleaned = clean_prompt(prompt);
    let class = classify(&cleaned);
    let templated = wrap_with_template(class, &cleaned);
    let decorated = decorate_with_context(&templated, context);
    let text = format!("{decorated}{SAFETY_PREAMBLE}");
    ProcessedPrompt { class, text }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collapses_whitespace_and_strips_control_chars() {
        let cleaned = clean_prompt("  read   a\tcsv\nfile \u{0007} please  ");
        assert_eq!(cleaned, "read a csv file please");
    }

    #[test]
    fn classifies_file_operations_over_general() {
        assert_eq!(classify("please read this file"), PromptClass::FileOperations);
    }

    #[test]
    fn classifies_data_processing_before_file_operations() {
        // "process" matches data_processing; "file" would also match
        // file_operations, but data_processing is checked first.
        assert_eq!(classify("process this data file"), PromptClass::DataProcessing);
    }

    #[test]
    fn classifies_data_analysis_distinct_from_data_processing() {
        assert_eq!(classify("compute summary_stats over the series"), PromptClass::DataAnalysis);
    }

    #[test]
    fn falls_back_to_general() {
        assert_eq!(classify("say hello"), PromptClass::General);
    }

    #[test]
    fn decoration_includes_type_signature_not_values() {
        let ctx = json!({"inputs": [1, "two", true]});
        let out = process("add numbers", Some(&ctx));
        assert!(out.text.contains("accept 3 parameters"));
        assert!(out.text.contains("number"));
        assert!(out.text.contains("boolean"));
        assert!(!out.text.contains('2') || out.text.contains("accept 3")); // no raw "two"/"1" leak beyond counts
        assert!(!out.text.contains("\"two\""));
    }

    #[test]
    fn decoration_includes_files_data_and_environment() {
        let ctx = json!({
            "files": ["b.csv", "a.csv"],
            "data": "quarterly sales",
            "environment": "linux, python 3.11",
        });
        let out = process("process the files", Some(&ctx));
        assert!(out.text.contains("Given files: b.csv, a.csv"));
        assert!(out.text.contains("Data: quarterly sales"));
        assert!(out.text.contains("Environment: linux, python 3.11"));
    }

    #[test]
    fn safety_preamble_is_always_appended() {
        let out = process("say hi", None);
        assert!(out.text.contains("SAFETY REQUIREMENTS"));
    }

    #[test]
    fn process_is_deterministic() {
        let ctx = json!({"files": ["x"], "inputs": [1, 2]});
        let a = process("process data", Some(&ctx));
        let b = process("process data", Some(&ctx));
        assert_eq!(a.text, b.text);
    }
}
