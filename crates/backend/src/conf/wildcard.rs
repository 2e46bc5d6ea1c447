use std::{fmt, str::FromStr};

use super::ConfError;

/// Glob with at most one `*`, at the start or the end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WildcardPattern {
  Any,
  Exact(String),
  /// `abc*`
  Prefix(String),
  /// `*abc`
  Suffix(String),
}

impl WildcardPattern {
  pub fn light_match(&self, value: &str) -> bool {
    match self {
      Self::Any => true,
      Self::Exact(exact) => value == exact,
      Self::Prefix(prefix) => value.starts_with(prefix.as_str()),
      Self::Suffix(suffix) => value.ends_with(suffix.as_str()),
    }
  }
}

impl FromStr for WildcardPattern {
  type Err = ConfError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if s == "*" {
      return Ok(Self::Any);
    }
    match s.matches('*').count() {
      0 => Ok(Self::Exact(s.to_string())),
      1 if s.ends_with('*') => Ok(Self::Prefix(s.trim_end_matches('*').to_string())),
      1 if s.starts_with('*') => Ok(Self::Suffix(s.trim_start_matches('*').to_string())),
      _ => Err(ConfError::Pattern(s.to_string())),
    }
  }
}

impl fmt::Display for WildcardPattern {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Any => write!(f, "*"),
      Self::Exact(exact) => write!(f, "{}", exact),
      Self::Prefix(prefix) => write!(f, "{}*", prefix),
      Self::Suffix(suffix) => write!(f, "*{}", suffix),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pattern(s: &str) -> WildcardPattern {
    s.parse().unwrap()
  }

  #[test]
  fn test_forms() {
    assert!(pattern("*").light_match("anything"));
    assert!(pattern("org.books").light_match("org.books"));
    assert!(!pattern("org.books").light_match("org.books.extra"));
    assert!(pattern("org.*").light_match("org.books"));
    assert!(!pattern("org.*").light_match("com.books"));
    assert!(pattern("*Book").light_match("PaperBook"));
    assert!(!pattern("*Book").light_match("Booklet"));
  }

  #[test]
  fn test_rejects_inner_or_double_star() {
    assert!("a*b".parse::<WildcardPattern>().is_err());
    assert!("*a*".parse::<WildcardPattern>().is_err());
  }

  #[test]
  fn test_display() {
    for s in ["*", "abc", "abc*", "*abc"] {
      assert_eq!(pattern(s).to_string(), s);
    }
  }
}
