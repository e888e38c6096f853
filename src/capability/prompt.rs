//! Prompt templates and their rendering.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::sync::OnceLock;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex is valid")
    })
}

/// Fill `{name}` placeholders from `vars`.
///
/// Strings are inserted verbatim, other values as compact JSON. `{{` and `}}`
/// produce literal braces. Placeholders with no matching variable are left
/// as written so example JSON inside prompts survives.
pub fn render_template(template: &str, vars: &Map<String, Value>) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let Some(name) = caps.get(1) else {
                return caps[0][..1].to_string();
            };
            match vars.get(name.as_str()) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Flatten arbitrary YAML prompt content into text.
///
/// Mappings become `**key** : value` lines and sequences become one line per
/// item, so prompt authors can structure long examples as YAML.
pub fn flatten_yaml(value: &serde_yaml::Value) -> String {
    let mut lines = Vec::new();
    flatten_into(value, &mut lines);
    lines.join("\n")
}

fn flatten_into(value: &serde_yaml::Value, lines: &mut Vec<String>) {
    use serde_yaml::Value as Y;
    match value {
        Y::Null => {}
        Y::String(s) => lines.push(s.trim_end().to_string()),
        Y::Bool(b) => lines.push(b.to_string()),
        Y::Number(n) => lines.push(n.to_string()),
        Y::Sequence(items) => items.iter().for_each(|item| flatten_into(item, lines)),
        Y::Mapping(map) => {
            for (key, item) in map {
                let key = match key {
                    Y::String(s) => s.clone(),
                    other => serde_yaml::to_string(other)
                        .unwrap_or_default()
                        .trim()
                        .to_string(),
                };
                match item {
                    Y::String(_) | Y::Bool(_) | Y::Number(_) => {
                        let mut inner = Vec::new();
                        flatten_into(item, &mut inner);
                        lines.push(format!("**{}** : {}", key, inner.join(" ")));
                    }
                    _ => {
                        lines.push(format!("**{}** :", key));
                        flatten_into(item, lines);
                    }
                }
            }
        }
        Y::Tagged(tagged) => flatten_into(&tagged.value, lines),
    }
}

fn prompt_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    Ok(flatten_yaml(&value))
}

/// The four prompt sections of a capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptSet {
    #[serde(default, deserialize_with = "prompt_text")]
    pub system: String,
    #[serde(default, deserialize_with = "prompt_text")]
    pub schema: String,
    #[serde(default, deserialize_with = "prompt_text")]
    pub example: String,
    #[serde(default, deserialize_with = "prompt_text")]
    pub start: String,
}

/// Per-user replacement of individual prompt sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
}

impl PromptSet {
    pub fn apply(&mut self, overrides: &PromptOverride) {
        let sections = [
            (&mut self.system, &overrides.system),
            (&mut self.schema, &overrides.schema),
            (&mut self.example, &overrides.example),
            (&mut self.start, &overrides.start),
        ];
        for (section, replacement) in sections {
            if let Some(text) = replacement {
                *section = text.clone();
            }
        }
    }

    /// Render every section and assemble the final prompt text.
    pub fn render(&self, vars: &Map<String, Value>) -> String {
        let mut out = String::new();
        for (heading, template) in [
            ("System", &self.system),
            ("Schema", &self.schema),
            ("Example", &self.example),
            ("Start", &self.start),
        ] {
            if template.trim().is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(&format!("## {}:\n{}", heading, render_template(template, vars)));
        }
        out
    }
}
