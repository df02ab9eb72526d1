//! `%(name)s` argument templates
//!
//! Templates are parsed when the config is loaded, so a malformed template
//! or an unknown placeholder is reported before any suite runs. Rendering a
//! parsed template against a complete context cannot fail.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Template parse errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),

    #[error("placeholder `{name}` must end in `)s`")]
    BadConversion { name: String },

    #[error("empty placeholder name at byte {0}")]
    EmptyName(usize),

    #[error("stray `%` at byte {0} (use `%%` for a literal percent sign)")]
    StrayPercent(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A parsed argument template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let bytes = source.as_bytes();
        let mut i = 0;

        while i < source.len() {
            let Some(offset) = source[i..].find('%') else {
                literal.push_str(&source[i..]);
                break;
            };
            literal.push_str(&source[i..i + offset]);
            let at = i + offset;

            match bytes.get(at + 1) {
                Some(b'%') => {
                    literal.push('%');
                    i = at + 2;
                }
                Some(b'(') => {
                    let close = source[at..].find(')').ok_or(TemplateError::Unterminated(at))? + at;
                    let name = &source[at + 2..close];
                    if name.is_empty() {
                        return Err(TemplateError::EmptyName(at));
                    }
                    if bytes.get(close + 1) != Some(&b's') {
                        return Err(TemplateError::BadConversion { name: name.to_string() });
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(name.to_string()));
                    i = close + 2;
                }
                _ => return Err(TemplateError::StrayPercent(at)),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// A template with no placeholders
    pub fn literal(text: &str) -> Self {
        Self {
            source: text.replace('%', "%%"),
            segments: vec![Segment::Literal(text.to_string())],
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Placeholder names in order of appearance
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Placeholders not present in `known`
    pub fn unknown_placeholders(&self, known: impl Fn(&str) -> bool) -> Vec<&str> {
        self.placeholders().filter(|name| !known(*name)).collect()
    }

    /// Substitute placeholders. Names missing from `values` render as empty;
    /// load-time validation keeps that from happening for configured
    /// templates.
    pub fn render(&self, values: &BTreeMap<String, String>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    if let Some(value) = values.get(name) {
                        out.push_str(value);
                    }
                }
            }
        }
        out
    }
}

impl TryFrom<String> for Template {
    type Error = TemplateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Template::parse(&value)
    }
}

impl From<Template> for String {
    fn from(template: Template) -> Self {
        template.source
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
