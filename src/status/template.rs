use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Answers keyed by template item id. Multi-select items keep all selected
/// values, in selection order.
pub type TemplateAnswers = HashMap<String, Vec<String>>;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetKind {
    Text,
    Paragraph,
    RadioList,
    CheckboxList,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct TemplateItem {
    pub id: String,
    pub title: String,
    pub widget_type: WidgetKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub choices: Vec<String>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub help_text: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct TemplateSection {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub items: Vec<TemplateItem>,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub recording_name_format: Option<String>,
    #[serde(default)]
    pub sections: Vec<TemplateSection>,
}
impl Template {
    pub fn items(&self) -> impl Iterator<Item = &TemplateItem> {
        self.sections.iter().flat_map(|section| &section.items)
    }

    pub fn item_by_id(
        &self,
        id: &str,
    ) -> Option<&TemplateItem> {
        self.items().find(|item| item.id == id)
    }

    /// Validates answers the way the device does, returning the full
    /// per-item error list instead of failing on the first violation.
    pub fn validate(
        &self,
        answers: &TemplateAnswers,
    ) -> Result<(), InvalidTemplateAnswers> {
        let mut errors = BTreeMap::<String, Vec<String>>::new();
        let mut item_error = |id: &str, message: String| {
            errors.entry(id.to_owned()).or_default().push(message);
        };

        for item in self.items() {
            if item.hidden {
                continue;
            }

            static EMPTY: Vec<String> = Vec::new();
            let values = answers.get(&item.id).unwrap_or(&EMPTY);
            let filled = values
                .iter()
                .filter(|value| !value.trim().is_empty())
                .collect::<Vec<_>>();

            if item.required && filled.is_empty() {
                item_error(&item.id, "required answer is missing".to_owned());
                continue;
            }

            match item.widget_type {
                WidgetKind::RadioList => {
                    if filled.len() > 1 {
                        item_error(&item.id, "expects a single value".to_owned());
                    }
                    for value in &filled {
                        if !item.choices.iter().any(|choice| choice == *value) {
                            item_error(&item.id, format!("value not allowed: {value}"));
                        }
                    }
                }
                WidgetKind::CheckboxList => {
                    for value in &filled {
                        if !item.choices.iter().any(|choice| choice == *value) {
                            item_error(&item.id, format!("value not allowed: {value}"));
                        }
                    }
                }
                WidgetKind::Text | WidgetKind::Paragraph => {
                    if let Some(pattern) = &item.pattern {
                        match Regex::new(pattern) {
                            Ok(pattern) => {
                                for value in &filled {
                                    if !pattern.is_match(value) {
                                        item_error(
                                            &item.id,
                                            format!("value does not match pattern: {value}"),
                                        );
                                    }
                                }
                            }
                            Err(_) => {
                                item_error(&item.id, "item pattern is not a valid regex".to_owned());
                            }
                        }
                    }
                }
            }
        }

        for id in answers.keys() {
            if self.item_by_id(id).is_none() {
                item_error(id, "answer for unknown item".to_owned());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(InvalidTemplateAnswers { errors })
        }
    }
}

#[derive(Clone, PartialEq, Debug, Error, Serialize, Deserialize)]
#[error("template answers invalid for {} item(s)", errors.len())]
pub struct InvalidTemplateAnswers {
    pub errors: BTreeMap<String, Vec<String>>,
}
