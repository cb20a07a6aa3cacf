//! Templates and template data.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{TemplateId, UserId};

/// Per-field template data (`{{key}}` → value).
pub type TemplateData = BTreeMap<String, String>;

/// A stored email template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub user_id: UserId,
    pub name: String,
    pub subject_part: String,
    pub html_part: String,
    pub text_part: String,
}

impl Template {
    /// Placeholder names referenced by any part of the template.
    pub fn variables(&self) -> BTreeSet<String> {
        let mut vars = BTreeSet::new();
        for part in [&self.subject_part, &self.html_part, &self.text_part] {
            collect_placeholders(part, &mut vars);
        }
        vars
    }

    /// Every placeholder must have a default value in `data`.
    pub fn validate_data(&self, data: &TemplateData) -> DomainResult<()> {
        let missing: Vec<String> = self
            .variables()
            .into_iter()
            .filter(|v| !data.contains_key(v))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(DomainError::MissingTemplateData {
                template: self.name.clone(),
                keys: missing,
            })
        }
    }

    pub fn parts(&self) -> RenderedTemplate {
        RenderedTemplate {
            html_part: self.html_part.clone(),
            text_part: self.text_part.clone(),
            subject_part: self.subject_part.clone(),
        }
    }
}

/// Output of the template service for one campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedTemplate {
    pub html_part: String,
    pub text_part: String,
    pub subject_part: String,
}

fn collect_placeholders(text: &str, out: &mut BTreeSet<String>) {
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            break;
        };
        let name = after[..end].trim().trim_start_matches('.');
        if !name.is_empty() {
            out.insert(name.to_string());
        }
        rest = &after[end + 2..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> Template {
        Template {
            id: TemplateId::new(1),
            user_id: UserId::new(1),
            name: "welcome".into(),
            subject_part: "Hi {{name}}".into(),
            html_part: "<p>{{ .name }} - {{discount}}</p>".into(),
            text_part: "{{discount}} off".into(),
        }
    }

    #[test]
    fn extracts_placeholders_from_all_parts() {
        let vars: Vec<_> = template().variables().into_iter().collect();
        assert_eq!(vars, vec!["discount".to_string(), "name".to_string()]);
    }

    #[test]
    fn validation_reports_missing_keys() {
        let mut data = TemplateData::new();
        data.insert("name".into(), "friend".into());

        let err = template().validate_data(&data).unwrap_err();
        assert_eq!(
            err,
            DomainError::MissingTemplateData {
                template: "welcome".into(),
                keys: vec!["discount".into()],
            }
        );
        assert_eq!(err.to_string(), "template 'welcome' is missing data for: discount");

        data.insert("discount".into(), "10%".into());
        assert!(template().validate_data(&data).is_ok());
    }

    #[test]
    fn unterminated_placeholder_is_ignored() {
        let mut vars = BTreeSet::new();
        collect_placeholders("hello {{name", &mut vars);
        assert!(vars.is_empty());
    }
}
