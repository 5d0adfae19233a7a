//! Placeholder substitution
//!
//! Substitution runs over the raw YAML tree before it is deserialized into
//! [`crate::compose::config::ComposeConfig`], so every string value in the
//! descriptor (ports, commands, environment, image names) is covered. Mapping
//! keys are never substituted.

use super::env::Environment;
use crate::error::{Result, StevedoreError};
use serde_yaml::Value;
use std::collections::BTreeSet;

/// Substitute placeholders in every string of a YAML tree
///
/// All undefined variables are collected and reported together as
/// [`StevedoreError::UndefinedVariables`]; malformed placeholders and
/// `${VAR:?message}` failures are reported as
/// [`StevedoreError::Configuration`].
pub fn interpolate_value(value: &mut Value, env: &Environment) -> Result<()> {
    let mut interpolator = Interpolator::new(env);
    interpolator.walk(value);
    interpolator.finish()
}

/// Substitute placeholders in a single string
pub fn interpolate_str(input: &str, env: &Environment) -> Result<String> {
    let mut interpolator = Interpolator::new(env);
    let out = interpolator.substitute(input);
    interpolator.finish()?;
    Ok(out)
}

/// Names referenced by placeholders in a YAML tree, whether defined or not
pub fn referenced_variables(value: &Value) -> BTreeSet<String> {
    let empty = Environment::new();
    let mut interpolator = Interpolator::new(&empty);
    interpolator.collect_all = true;
    let mut copy = value.clone();
    interpolator.walk(&mut copy);
    interpolator.referenced
}

struct Interpolator<'a> {
    env: &'a Environment,
    missing: BTreeSet<String>,
    referenced: BTreeSet<String>,
    errors: Vec<String>,
    /// Also descend into defaults and alternates that would not be used
    collect_all: bool,
}

impl<'a> Interpolator<'a> {
    fn new(env: &'a Environment) -> Self {
        Self {
            env,
            missing: BTreeSet::new(),
            referenced: BTreeSet::new(),
            errors: Vec::new(),
            collect_all: false,
        }
    }

    fn finish(self) -> Result<()> {
        if !self.errors.is_empty() {
            return Err(StevedoreError::Configuration(self.errors.join("; ")));
        }
        if !self.missing.is_empty() {
            return Err(StevedoreError::UndefinedVariables(
                self.missing.into_iter().collect(),
            ));
        }
        Ok(())
    }

    fn walk(&mut self, value: &mut Value) {
        match value {
            Value::String(s) => {
                if s.contains('$') {
                    *s = self.substitute(s);
                }
            }
            Value::Sequence(items) => {
                for item in items.iter_mut() {
                    self.walk(item);
                }
            }
            Value::Mapping(map) => {
                for (_, v) in map.iter_mut() {
                    self.walk(v);
                }
            }
            Value::Tagged(tagged) => self.walk(&mut tagged.value),
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
    }

    fn substitute(&mut self, input: &str) -> String {
        let bytes = input.as_bytes();
        let mut out = String::with_capacity(input.len());
        let mut i = 0;
        let mut literal_start = 0;

        while i < bytes.len() {
            if bytes[i] != b'$' {
                i += 1;
                continue;
            }

            out.push_str(&input[literal_start..i]);

            match bytes.get(i + 1) {
                Some(b'$') => {
                    out.push('$');
                    i += 2;
                }
                Some(b'{') => match find_closing_brace(input, i + 2) {
                    Some(end) => {
                        let inner = &input[i + 2..end];
                        let expanded = self.expand_braced(inner);
                        out.push_str(&expanded);
                        i = end + 1;
                    }
                    None => {
                        self.errors
                            .push(format!("unterminated placeholder in '{}'", input));
                        out.push_str(&input[i..]);
                        return out;
                    }
                },
                Some(c) if c.is_ascii_alphabetic() || *c == b'_' => {
                    let start = i + 1;
                    let mut end = start;
                    while end < bytes.len()
                        && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_')
                    {
                        end += 1;
                    }
                    let name = &input[start..end];
                    out.push_str(&self.lookup_required(name));
                    i = end;
                }
                _ => {
                    out.push('$');
                    i += 1;
                }
            }

            literal_start = i;
        }

        out.push_str(&input[literal_start..]);
        out
    }

    fn expand_braced(&mut self, inner: &str) -> String {
        let name_len = inner
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
            .count();
        let name = &inner[..name_len];
        let rest = &inner[name_len..];

        if name.is_empty() || name.as_bytes()[0].is_ascii_digit() {
            self.errors
                .push(format!("invalid interpolation format for '${{{}}}'", inner));
            return String::new();
        }

        self.referenced.insert(name.to_string());
        let value = self.env.get(name);
        let non_empty = value.filter(|v| !v.is_empty());

        if rest.is_empty() {
            return self.lookup_required(name);
        }

        if let Some(default) = rest.strip_prefix(":-") {
            return self.choose(non_empty, default);
        }
        if let Some(default) = rest.strip_prefix('-') {
            return self.choose(value, default);
        }
        if let Some(message) = rest.strip_prefix(":?") {
            return self.require(name, non_empty, message);
        }
        if let Some(message) = rest.strip_prefix('?') {
            return self.require(name, value, message);
        }
        if let Some(alternate) = rest.strip_prefix(":+") {
            return self.alternate(non_empty.is_some(), alternate);
        }
        if let Some(alternate) = rest.strip_prefix('+') {
            return self.alternate(value.is_some(), alternate);
        }

        self.errors
            .push(format!("invalid interpolation format for '${{{}}}'", inner));
        String::new()
    }

    fn lookup_required(&mut self, name: &str) -> String {
        self.referenced.insert(name.to_string());
        match self.env.get(name) {
            Some(v) => v.to_string(),
            None => {
                self.missing.insert(name.to_string());
                String::new()
            }
        }
    }

    fn choose(&mut self, value: Option<&str>, default: &str) -> String {
        match value {
            Some(v) => {
                if self.collect_all {
                    self.substitute(default);
                }
                v.to_string()
            }
            None => self.substitute(default),
        }
    }

    fn require(&mut self, name: &str, value: Option<&str>, message: &str) -> String {
        match value {
            Some(v) => {
                if self.collect_all {
                    self.substitute(message);
                }
                v.to_string()
            }
            None if self.collect_all => {
                self.substitute(message);
                String::new()
            }
            None => {
                let message = self.substitute(message);
                if message.is_empty() {
                    self.errors
                        .push(format!("required variable {} is missing a value", name));
                } else {
                    self.errors.push(format!(
                        "required variable {} is missing a value: {}",
                        name, message
                    ));
                }
                String::new()
            }
        }
    }

    fn alternate(&mut self, is_set: bool, alternate: &str) -> String {
        if is_set {
            self.substitute(alternate)
        } else {
            if self.collect_all {
                self.substitute(alternate);
            }
            String::new()
        }
    }
}

/// Index of the `}` closing a placeholder whose body starts at `start`
fn find_closing_brace(input: &str, start: usize) -> Option<usize> {
    let bytes = input.as_bytes();
    let mut depth = 1;
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b'$' if bytes.get(i + 1) == Some(&b'{') => {
                depth += 1;
                i += 2;
                continue;
            }
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Environment {
        Environment::new()
            .with("DB_USER", "alice")
            .with("DB_PASSWORD", "secret")
            .with("DB_NAME", "quickdish")
            .with("DB_PORT", "5432")
            .with("EMPTY", "")
    }

    #[test]
    fn test_braced_and_bare() {
        let out = interpolate_str(
            "postgresql://${DB_USER}:${DB_PASSWORD}@db:$DB_PORT/${DB_NAME}",
            &env(),
        )
        .unwrap();
        assert_eq!(out, "postgresql://alice:secret@db:5432/quickdish");
    }

    #[test]
    fn test_escaped_dollar() {
        let out = interpolate_str("echo $$HOME costs $$5", &env()).unwrap();
        assert_eq!(out, "echo $HOME costs $5");
    }

    #[test]
    fn test_defaults() {
        let env = env();
        assert_eq!(interpolate_str("${MISSING:-fallback}", &env).unwrap(), "fallback");
        assert_eq!(interpolate_str("${EMPTY:-fallback}", &env).unwrap(), "fallback");
        assert_eq!(interpolate_str("${EMPTY-fallback}", &env).unwrap(), "");
        assert_eq!(interpolate_str("${MISSING-${DB_PORT}}", &env).unwrap(), "5432");
        assert_eq!(interpolate_str("${DB_USER:-${MISSING}}", &env).unwrap(), "alice");
    }

    #[test]
    fn test_alternates() {
        let env = env();
        assert_eq!(interpolate_str("${DB_USER:+set}", &env).unwrap(), "set");
        assert_eq!(interpolate_str("${EMPTY:+set}", &env).unwrap(), "");
        assert_eq!(interpolate_str("${EMPTY+set}", &env).unwrap(), "set");
        assert_eq!(interpolate_str("${MISSING+set}", &env).unwrap(), "");
    }

    #[test]
    fn test_required_with_message() {
        let err = interpolate_str("${JWT_SECRET:?signing secret required}", &env()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: required variable JWT_SECRET is missing a value: signing secret required"
        );

        let err = interpolate_str("${EMPTY:?}", &env()).unwrap_err();
        assert!(err.to_string().contains("EMPTY"));
        assert_eq!(interpolate_str("${EMPTY?}", &env()).unwrap(), "");
    }

    #[test]
    fn test_required_when_unset() {
        let err = interpolate_str("${JWT_SECRET?set it in .env}", &env()).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(
            err.to_string(),
            "Configuration error: required variable JWT_SECRET is missing a value: set it in .env"
        );

        let err = interpolate_str("${JWT_SECRET?}", &env()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: required variable JWT_SECRET is missing a value"
        );

        let err = interpolate_str("${JWT_SECRET?missing for ${DB_NAME}}", &env()).unwrap_err();
        assert!(err.to_string().ends_with("missing for quickdish"));
    }

    #[test]
    fn test_missing_variables_are_collected() {
        let mut value: Value = serde_yaml::from_str(
            r#"
ports:
  - "${FORWARD_PORT}:${CONTAINER_PORT}"
environment:
  JWT_SECRET: ${JWT_SECRET}
  DB: ${DB_NAME}
"#,
        )
        .unwrap();

        let err = interpolate_value(&mut value, &env()).unwrap_err();
        match err {
            StevedoreError::UndefinedVariables(names) => {
                assert_eq!(names, vec!["CONTAINER_PORT", "FORWARD_PORT", "JWT_SECRET"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_keys_are_not_substituted() {
        let mut value: Value = serde_yaml::from_str("${DB_NAME}: $DB_USER").unwrap();
        interpolate_value(&mut value, &env()).unwrap();
        let map = value.as_mapping().unwrap();
        assert_eq!(
            map.get("${DB_NAME}"),
            Some(&Value::String("alice".to_string()))
        );
    }

    #[test]
    fn test_malformed_placeholders() {
        assert!(interpolate_str("${DB_USER", &env()).unwrap_err().is_configuration());
        assert!(interpolate_str("${}", &env()).unwrap_err().is_configuration());
        assert!(interpolate_str("${1ABC}", &env()).unwrap_err().is_configuration());
        assert!(interpolate_str("${DB_USER%x}", &env()).unwrap_err().is_configuration());
    }

    #[test]
    fn test_lone_dollar_is_literal() {
        assert_eq!(interpolate_str("cost: $ 5", &env()).unwrap(), "cost: $ 5");
        assert_eq!(interpolate_str("trailing $", &env()).unwrap(), "trailing $");
    }

    #[test]
    fn test_referenced_variables() {
        let value: Value = serde_yaml::from_str(
            r#"
a: ${ONE}
b: [ "$TWO", "${THREE:-${FOUR}}" ]
c: "$$NOT_A_VAR"
d: "${FIVE:?needs ${SIX}}"
e: "${SEVEN:+${EIGHT}}"
"#,
        )
        .unwrap();
        let names: Vec<String> = referenced_variables(&value).into_iter().collect();
        assert_eq!(
            names,
            vec!["EIGHT", "FIVE", "FOUR", "ONE", "SEVEN", "SIX", "THREE", "TWO"]
        );
    }
}
