//! Handoff processing: project a producer's output through a field mapping,
//! apply transformation rules in declaration order, then run validation
//! checks. All of it is pure; storing the result is up to the scheduler.

use crate::error::{Result, WorkflowError};
use crate::types::{HandoffSpec, Payload, Step, TransformRule, ValidationCheck};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Named custom predicate over a handoff payload
pub type CheckFn = Arc<dyn Fn(&Payload) -> bool + Send + Sync>;

/// Named custom rewrite of a handoff payload
pub type TransformFn = Arc<dyn Fn(Payload) -> Payload + Send + Sync>;

/// Table of custom checks and transformations referenced by name
#[derive(Clone, Default)]
pub struct HandoffRules {
    checks: HashMap<String, CheckFn>,
    transforms: HashMap<String, TransformFn>,
}

impl HandoffRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check<F>(mut self, name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Payload) -> bool + Send + Sync + 'static,
    {
        self.checks.insert(name.into(), Arc::new(check));
        self
    }

    pub fn with_transform<F>(mut self, name: impl Into<String>, transform: F) -> Self
    where
        F: Fn(Payload) -> Payload + Send + Sync + 'static,
    {
        self.transforms.insert(name.into(), Arc::new(transform));
        self
    }

    pub fn has_check(&self, name: &str) -> bool {
        self.checks.contains_key(name)
    }

    pub fn has_transform(&self, name: &str) -> bool {
        self.transforms.contains_key(name)
    }

    /// Reject handoffs on `step` that name unregistered custom rules
    pub fn check_step(&self, step: &Step) -> Result<()> {
        for handoff in &step.handoffs {
            let unknown_check = handoff.validations.iter().find_map(|check| match check {
                ValidationCheck::Custom { name } if !self.has_check(name) => Some(name),
                _ => None,
            });
            let unknown_transform =
                handoff
                    .transformations
                    .iter()
                    .find_map(|rule| match rule {
                        TransformRule::Custom { name } if !self.has_transform(name) => Some(name),
                        _ => None,
                    });
            if let Some(rule) = unknown_check.or(unknown_transform) {
                return Err(WorkflowError::UnknownRule {
                    producer: step.id.clone(),
                    rule: rule.clone(),
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for HandoffRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffRules")
            .field("checks", &self.checks.keys().collect::<Vec<_>>())
            .field("transforms", &self.transforms.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Result of preparing one handoff
#[derive(Debug, Clone, PartialEq)]
pub enum HandoffOutcome {
    Accepted(Payload),
    Rejected { failed_checks: Vec<String> },
}

impl HandoffOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

pub struct HandoffProcessor {
    rules: Arc<HandoffRules>,
}

impl HandoffProcessor {
    pub fn new(rules: Arc<HandoffRules>) -> Self {
        Self { rules }
    }

    /// Project, transform and validate a producer's output for one spec
    pub fn prepare(&self, spec: &HandoffSpec, output: &Payload) -> HandoffOutcome {
        let mut payload = project(&spec.field_mapping, output);
        for rule in &spec.transformations {
            payload = self.apply_rule(rule, payload);
        }

        let failed_checks: Vec<String> = spec
            .validations
            .iter()
            .filter(|check| !self.passes(check, &payload))
            .map(|check| check.to_string())
            .collect();

        if failed_checks.is_empty() {
            HandoffOutcome::Accepted(payload)
        } else {
            HandoffOutcome::Rejected { failed_checks }
        }
    }

    fn apply_rule(&self, rule: &TransformRule, mut payload: Payload) -> Payload {
        match rule {
            TransformRule::SortBy {
                field,
                key,
                descending,
            } => {
                if let Some(Value::Array(items)) = payload.get_mut(field) {
                    // Stable sort; items missing the key go last either way
                    items.sort_by(|a, b| {
                        match (a.get(key), b.get(key)) {
                            (Some(x), Some(y)) => {
                                let ord = compare_values(x, y);
                                if *descending {
                                    ord.reverse()
                                } else {
                                    ord
                                }
                            }
                            (Some(_), None) => Ordering::Less,
                            (None, Some(_)) => Ordering::Greater,
                            (None, None) => Ordering::Equal,
                        }
                    });
                }
                payload
            }
            TransformRule::Partition {
                field,
                key,
                value,
                matched_into,
                rest_into,
            } => {
                if !matches!(payload.get(field), Some(Value::Array(_))) {
                    return payload;
                }
                let Some(Value::Array(items)) = payload.remove(field) else {
                    return payload;
                };
                let (matched, rest): (Vec<Value>, Vec<Value>) = items
                    .into_iter()
                    .partition(|item| item.get(key) == Some(value));
                payload.insert(matched_into.clone(), Value::Array(matched));
                payload.insert(rest_into.clone(), Value::Array(rest));
                payload
            }
            TransformRule::Rename { from, to } => {
                if let Some(v) = payload.remove(from) {
                    payload.insert(to.clone(), v);
                }
                payload
            }
            TransformRule::Custom { name } => match self.rules.transforms.get(name) {
                Some(transform) => transform(payload),
                None => {
                    tracing::warn!(rule = %name, "unknown transformation rule, payload left unchanged");
                    payload
                }
            },
        }
    }

    fn passes(&self, check: &ValidationCheck, payload: &Payload) -> bool {
        match check {
            ValidationCheck::Present { field } => payload.contains_key(field),
            ValidationCheck::NonEmpty { field } => payload.get(field).is_some_and(is_non_empty),
            ValidationCheck::IsNumber { field } => payload.get(field).is_some_and(Value::is_number),
            ValidationCheck::InRange { field, min, max } => payload
                .get(field)
                .and_then(Value::as_f64)
                .is_some_and(|n| n >= *min && n <= *max),
            // Unregistered names are rejected at submit; treat as failing here
            ValidationCheck::Custom { name } => self
                .rules
                .checks
                .get(name)
                .is_some_and(|check| check(payload)),
        }
    }
}

/// Copy only mapped fields, renaming producer keys to consumer keys
fn project(mapping: &HashMap<String, String>, output: &Payload) -> Payload {
    let mut entries: Vec<(&String, &String)> = mapping.iter().collect();
    entries.sort();
    entries
        .into_iter()
        .filter_map(|(from, to)| output.get(from).map(|v| (to.clone(), v.clone())))
        .collect()
}

fn is_non_empty(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => match (a.as_str(), b.as_str()) {
            (Some(x), Some(y)) => x.cmp(y),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HandoffTarget;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn processor() -> HandoffProcessor {
        HandoffProcessor::new(Arc::new(HandoffRules::new()))
    }

    #[test]
    fn test_projection_copies_only_mapped_fields() {
        let spec = HandoffSpec::to_step("tailor").map("score", "match_score");
        let output = payload(json!({"score": 87, "debug": "ignored"}));

        let outcome = processor().prepare(&spec, &output);
        assert_eq!(
            outcome,
            HandoffOutcome::Accepted(payload(json!({"match_score": 87})))
        );
    }

    #[test]
    fn test_missing_mapped_field_fails_non_empty() {
        let spec = HandoffSpec::to_step("tailor")
            .map("skills", "candidate_skills")
            .validate(ValidationCheck::NonEmpty {
                field: "candidate_skills".into(),
            })
            .validate(ValidationCheck::Present {
                field: "candidate_skills".into(),
            });

        let outcome = processor().prepare(&spec, &payload(json!({"skills": []})));
        assert_eq!(
            outcome,
            HandoffOutcome::Rejected {
                failed_checks: vec!["non_empty(candidate_skills)".to_string()]
            }
        );

        let outcome = processor().prepare(&spec, &Payload::new());
        assert!(!outcome.is_accepted());
    }

    #[test]
    fn test_sort_by_priority_descending() {
        let spec = HandoffSpec::to_step("writer")
            .map("requirements", "requirements")
            .transform(TransformRule::SortBy {
                field: "requirements".into(),
                key: "priority".into(),
                descending: true,
            });
        let output = payload(json!({"requirements": [
            {"name": "docker", "priority": 2},
            {"name": "no-priority"},
            {"name": "rust", "priority": 9},
            {"name": "sql", "priority": 5}
        ]}));

        let HandoffOutcome::Accepted(result) = processor().prepare(&spec, &output) else {
            panic!("expected accepted handoff");
        };
        let names: Vec<&str> = result["requirements"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["rust", "sql", "docker", "no-priority"]);
    }

    #[test]
    fn test_partition_then_validate() {
        let spec = HandoffSpec::to_step("writer")
            .map("skills", "skills")
            .transform(TransformRule::Partition {
                field: "skills".into(),
                key: "tag".into(),
                value: json!("required"),
                matched_into: "required_skills".into(),
                rest_into: "optional_skills".into(),
            })
            .validate(ValidationCheck::NonEmpty {
                field: "required_skills".into(),
            });
        let output = payload(json!({"skills": [
            {"name": "rust", "tag": "required"},
            {"name": "go", "tag": "nice"},
            {"name": "sql", "tag": "required"}
        ]}));

        let HandoffOutcome::Accepted(result) = processor().prepare(&spec, &output) else {
            panic!("expected accepted handoff");
        };
        assert!(!result.contains_key("skills"));
        assert_eq!(result["required_skills"].as_array().unwrap().len(), 2);
        assert_eq!(result["optional_skills"][0]["name"], "go");
    }

    #[test]
    fn test_rules_apply_in_declaration_order() {
        let spec = HandoffSpec::to_step("writer")
            .map("a", "a")
            .transform(TransformRule::Rename {
                from: "a".into(),
                to: "b".into(),
            })
            .transform(TransformRule::Rename {
                from: "b".into(),
                to: "c".into(),
            })
            .validate(ValidationCheck::Present { field: "c".into() });

        let outcome = processor().prepare(&spec, &payload(json!({"a": 1})));
        assert_eq!(outcome, HandoffOutcome::Accepted(payload(json!({"c": 1}))));
    }

    #[test]
    fn test_numeric_checks() {
        let spec = HandoffSpec::to_step("c")
            .map("score", "score")
            .validate(ValidationCheck::IsNumber {
                field: "score".into(),
            })
            .validate(ValidationCheck::InRange {
                field: "score".into(),
                min: 0.0,
                max: 100.0,
            });

        assert!(processor().prepare(&spec, &payload(json!({"score": 87}))).is_accepted());
        assert!(!processor().prepare(&spec, &payload(json!({"score": 187}))).is_accepted());
        assert!(!processor().prepare(&spec, &payload(json!({"score": "87"}))).is_accepted());
    }

    #[test]
    fn test_custom_rules() {
        let rules = HandoffRules::new()
            .with_check("has_email", |p: &Payload| {
                p.get("email")
                    .and_then(Value::as_str)
                    .is_some_and(|e| e.contains('@'))
            })
            .with_transform("lowercase_email", |mut p: Payload| {
                if let Some(Value::String(email)) = p.get_mut("email") {
                    *email = email.to_lowercase();
                }
                p
            });
        let processor = HandoffProcessor::new(Arc::new(rules));

        let spec = HandoffSpec::to_step("mailer")
            .map("contact", "email")
            .transform(TransformRule::Custom {
                name: "lowercase_email".into(),
            })
            .validate(ValidationCheck::Custom {
                name: "has_email".into(),
            });

        let outcome = processor.prepare(&spec, &payload(json!({"contact": "Jo@Example.COM"})));
        assert_eq!(
            outcome,
            HandoffOutcome::Accepted(payload(json!({"email": "jo@example.com"})))
        );
        assert!(!processor
            .prepare(&spec, &payload(json!({"contact": "nobody"})))
            .is_accepted());
    }

    #[test]
    fn test_check_step_rejects_unknown_rules() {
        let step = Step::new("a", "x", "y").with_handoff(
            HandoffSpec::to_step("b").validate(ValidationCheck::Custom {
                name: "unregistered".into(),
            }),
        );
        let err = HandoffRules::new().check_step(&step).unwrap_err();
        assert_eq!(
            err,
            WorkflowError::UnknownRule {
                producer: "a".into(),
                rule: "unregistered".into()
            }
        );

        let known = HandoffRules::new().with_check("unregistered", |_: &Payload| true);
        assert!(known.check_step(&step).is_ok());
        assert_eq!(step.handoffs[0].consumer, HandoffTarget::Step("b".into()));
    }
}
