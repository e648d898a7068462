//! `{{name}}` template parsing and binding (§4.2).

use std::collections::BTreeSet;

use crate::error::{BrokerError, Result};

/// Returns the deduplicated set of variable names referenced by `{{name}}`
/// placeholders in `template`, sorted lexicographically.
pub fn parse_variables(template: &str) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let bytes = template.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'{' && bytes[i + 1] == b'{' {
            if let Some(end) = template[i + 2..].find("}}") {
                let candidate = &template[i + 2..i + 2 + end];
                if is_valid_name(candidate) {
                    names.insert(candidate.to_string());
                }
                i += 2 + end + 2;
                continue;
            }
        }
        i += 1;
    }
    names
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validates that a type's declared variables are a subset of the
/// template's parsed variable set. Rejected at type creation.
pub fn validate_declared_subset(declared: &[String], template: &str) -> Result<()> {
    let parsed = parse_variables(template);
    for name in declared {
        if !parsed.contains(name) {
            return Err(BrokerError::ValidationError {
                field: "variables",
                reason: format!("declared variable `{name}` does not appear in the template"),
            });
        }
    }
    Ok(())
}

/// Binds `variables` into `template`, replacing every `{{name}}`
/// occurrence with its string value. Variables referenced by the template
/// but absent from the map are a create-time error; extra map entries are
/// permitted and ignored.
pub fn bind(template: &str, variables: &std::collections::HashMap<String, String>) -> Result<String> {
    let required = parse_variables(template);
    let missing: Vec<String> = required
        .iter()
        .filter(|name| !variables.contains_key(*name))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(BrokerError::MissingTemplateVariables { names: missing });
    }

    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if i + 1 < bytes.len() && bytes[i] == b'{' && bytes[i + 1] == b'{' {
            if let Some(end) = template[i + 2..].find("}}") {
                let candidate = &template[i + 2..i + 2 + end];
                if is_valid_name(candidate) {
                    if let Some(value) = variables.get(candidate) {
                        out.push_str(value);
                        i += 2 + end + 2;
                        continue;
                    }
                }
            }
        }
        out.push(template[i..].chars().next().unwrap());
        i += template[i..].chars().next().unwrap().len_utf8();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn parse_variables_finds_all_distinct_names() {
        let vars = parse_variables("hello {{who}}, you are {{age}} and {{who}} again");
        assert_eq!(vars.len(), 2);
        assert!(vars.contains("who"));
        assert!(vars.contains("age"));
    }

    #[test]
    fn parse_variables_ignores_invalid_names() {
        let vars = parse_variables("{{1bad}} {{also-bad}} {{good_one}}");
        assert_eq!(vars, BTreeSet::from(["good_one".to_string()]));
    }

    #[test]
    fn bind_replaces_every_occurrence() {
        let mut vars = HashMap::new();
        vars.insert("who".to_string(), "world".to_string());
        let bound = bind("hello {{who}}, goodbye {{who}}", &vars).unwrap();
        assert_eq!(bound, "hello world, goodbye world");
    }

    #[test]
    fn bind_permits_extra_unused_variables() {
        let mut vars = HashMap::new();
        vars.insert("who".to_string(), "world".to_string());
        vars.insert("unused".to_string(), "ignored".to_string());
        assert_eq!(bind("hi {{who}}", &vars).unwrap(), "hi world");
    }

    #[test]
    fn bind_rejects_missing_variables() {
        let vars = HashMap::new();
        let err = bind("hello {{who}}", &vars).unwrap_err();
        match err {
            BrokerError::MissingTemplateVariables { names } => {
                assert_eq!(names, vec!["who".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn bind_leaves_no_placeholder_for_bound_names() {
        let mut vars = HashMap::new();
        vars.insert("a".to_string(), "1".to_string());
        vars.insert("b".to_string(), "2".to_string());
        let bound = bind("{{a}}-{{b}}", &vars).unwrap();
        assert!(!bound.contains("{{"));
    }

    #[test]
    fn validate_declared_subset_rejects_unknown_declared_variable() {
        let err = validate_declared_subset(&["ghost".to_string()], "hello {{who}}").unwrap_err();
        assert!(matches!(err, BrokerError::ValidationError { .. }));
    }

    #[test]
    fn validate_declared_subset_accepts_subset() {
        assert!(validate_declared_subset(&["who".to_string()], "hello {{who}} {{extra}}").is_ok());
    }
}
