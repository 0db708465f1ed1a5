//! Command template parsing.
//!
//! Task commands are templates over positional factory
//! parameters (`{}`, `{0}`, `{1}`, ...) and, for file factories,
//! named file attributes (`{file_path}` etc). Templates parse
//! once into tokens; binding problems are caught at validation
//! time rather than at submission.

use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, anyhow};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateToken {
  Literal(String),
  /// Positional parameter. Bare `{}` parses as index 0.
  Placeholder(usize),
  /// Named parameter, bound by file factories.
  Named(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
  tokens: Vec<TemplateToken>,
  /// Highest referenced positional index.
  max_index: Option<usize>,
  named: BTreeSet<String>,
}

impl CommandTemplate {
  pub fn parse(template: &str) -> anyhow::Result<CommandTemplate> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut max_index = None;
    let mut named = BTreeSet::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
      match c {
        '{' if chars.peek() == Some(&'{') => {
          chars.next();
          literal.push('{');
        }
        '}' if chars.peek() == Some(&'}') => {
          chars.next();
          literal.push('}');
        }
        '}' => {
          return Err(anyhow!(
            "unmatched '}}' in template: {template}"
          ));
        }
        '{' => {
          let mut body = String::new();
          loop {
            match chars.next() {
              Some('}') => break,
              Some('{') => {
                return Err(anyhow!(
                  "nested '{{' in template: {template}"
                ));
              }
              Some(c) => body.push(c),
              None => {
                return Err(anyhow!(
                  "unterminated placeholder in template: {template}"
                ));
              }
            }
          }
          if !literal.is_empty() {
            tokens
              .push(TemplateToken::Literal(std::mem::take(
                &mut literal,
              )));
          }
          if body.is_empty() {
            max_index = Some(max_index.unwrap_or(0).max(0));
            tokens.push(TemplateToken::Placeholder(0));
          } else if body.chars().all(|c| c.is_ascii_digit()) {
            let index = body.parse::<usize>().with_context(|| {
              format!("invalid placeholder index {{{body}}}")
            })?;
            max_index = Some(max_index.unwrap_or(0).max(index));
            tokens.push(TemplateToken::Placeholder(index));
          } else {
            named.insert(body.clone());
            tokens.push(TemplateToken::Named(body));
          }
        }
        c => literal.push(c),
      }
    }
    if !literal.is_empty() {
      tokens.push(TemplateToken::Literal(literal));
    }

    Ok(CommandTemplate {
      tokens,
      max_index,
      named,
    })
  }

  /// Indices referenced, as `0..=max`. None when the template
  /// has no positional placeholders.
  pub fn max_index(&self) -> Option<usize> {
    self.max_index
  }

  pub fn named(&self) -> &BTreeSet<String> {
    &self.named
  }

  /// Checks the template against a factory arity: every
  /// provided parameter must be referenced and every referenced
  /// index must be provided.
  pub fn validate_arity(&self, arity: usize) -> anyhow::Result<()> {
    let referenced: BTreeSet<usize> = self
      .tokens
      .iter()
      .filter_map(|token| match token {
        TemplateToken::Placeholder(index) => Some(*index),
        _ => None,
      })
      .collect();
    if let Some(missing) =
      referenced.iter().find(|&&index| index >= arity)
    {
      return Err(anyhow!(
        "template references {{{missing}}} but the factory provides {arity} parameter(s)"
      ));
    }
    if let Some(unused) =
      (0..arity).find(|index| !referenced.contains(index))
    {
      return Err(anyhow!(
        "factory parameter {unused} is never referenced by the template"
      ));
    }
    Ok(())
  }

  /// Substitute positional and named parameters. Total: every
  /// referenced binding must be present.
  pub fn render(
    &self,
    positional: &[String],
    named: &HashMap<String, String>,
  ) -> anyhow::Result<String> {
    let mut out = String::new();
    for token in &self.tokens {
      match token {
        TemplateToken::Literal(literal) => out.push_str(literal),
        TemplateToken::Placeholder(index) => {
          let value = positional.get(*index).with_context(|| {
            format!("no value bound for placeholder {{{index}}}")
          })?;
          out.push_str(value);
        }
        TemplateToken::Named(name) => {
          let value = named.get(name).with_context(|| {
            format!("no value bound for placeholder {{{name}}}")
          })?;
          out.push_str(value);
        }
      }
    }
    Ok(out)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn render(
    template: &str,
    positional: &[&str],
  ) -> anyhow::Result<String> {
    CommandTemplate::parse(template)?.render(
      &positional
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>(),
      &HashMap::new(),
    )
  }

  #[test]
  fn bare_braces_are_index_zero() {
    assert_eq!(render("echo {}", &["a"]).unwrap(), "echo a");
    assert_eq!(render("echo {0}", &["a"]).unwrap(), "echo a");
  }

  #[test]
  fn indexed_placeholders() {
    assert_eq!(
      render("echo {0} {1}", &["a", "b"]).unwrap(),
      "echo a b"
    );
    assert_eq!(
      render("echo {1} {0}", &["a", "b"]).unwrap(),
      "echo b a"
    );
  }

  #[test]
  fn literal_brace_escapes() {
    assert_eq!(
      render("echo {{literal}}", &[]).unwrap(),
      "echo {literal}"
    );
  }

  #[test]
  fn named_placeholders_bind_from_map() {
    let template =
      CommandTemplate::parse("cat {file_path}").unwrap();
    let named = HashMap::from([(
      "file_path".to_string(),
      "/data/x.txt".to_string(),
    )]);
    assert_eq!(
      template.render(&[], &named).unwrap(),
      "cat /data/x.txt"
    );
  }

  #[test]
  fn unterminated_placeholder_is_fatal() {
    assert!(CommandTemplate::parse("echo {0").is_err());
    assert!(CommandTemplate::parse("echo }").is_err());
  }

  #[test]
  fn arity_validation_rejects_missing_and_unused() {
    let template = CommandTemplate::parse("echo {0} {2}").unwrap();
    // {2} out of bounds for arity 2.
    assert!(template.validate_arity(2).is_err());
    // Index 1 provided but unused for arity 3.
    assert!(template.validate_arity(3).is_err());

    let template = CommandTemplate::parse("echo {0} {1}").unwrap();
    assert!(template.validate_arity(2).is_ok());
  }

  #[test]
  fn missing_binding_at_render_is_fatal() {
    assert!(render("echo {1}", &["only-zero"]).is_err());
  }
}
