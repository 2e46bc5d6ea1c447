//! Record identity and shape as seen by the indexing pipeline.
//!
//! Records are owned by the record store; the pipeline only reads them. A
//! record id is a master id plus an ordered set of variant properties
//! (language, branch, ...). Sibling variants share the master id.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Separates the master id from the variant properties in the string form.
const VARIANT_SEPARATOR: char = '!';

// ============================================================================
// RecordId
// ============================================================================

/// Identity of a record: master id plus variant dimensions.
///
/// The string form is `master` for master records and
/// `master!key=value,key2=value2` for variants (keys in sorted order).
/// `!`, `,`, `=` and `\` inside ids are escaped with a backslash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
  master: String,
  variant: BTreeMap<String, String>,
}

impl RecordId {
  /// Create a master record id.
  pub fn new(master: impl Into<String>) -> Self {
    Self {
      master: master.into(),
      variant: BTreeMap::new(),
    }
  }

  /// Add a variant dimension.
  pub fn with_variant(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.variant.insert(key.into(), value.into());
    self
  }

  pub fn master(&self) -> &str {
    &self.master
  }

  /// The variant dimensions of this record (empty for master records).
  pub fn variant_properties(&self) -> &BTreeMap<String, String> {
    &self.variant
  }

  pub fn is_master(&self) -> bool {
    self.variant.is_empty()
  }

  /// The id of the master record this variant belongs to.
  pub fn master_record_id(&self) -> RecordId {
    RecordId::new(self.master.clone())
  }

  /// Row key used in the message log.
  pub fn to_row_key(&self) -> Vec<u8> {
    self.to_string().into_bytes()
  }

  /// Parse a message log row key back into a record id.
  pub fn from_row_key(bytes: &[u8]) -> Result<Self, RecordIdError> {
    let s = std::str::from_utf8(bytes).map_err(|_| RecordIdError::NotUtf8)?;
    s.parse()
  }
}

impl fmt::Display for RecordId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write_escaped(f, &self.master)?;
    if !self.variant.is_empty() {
      write!(f, "{}", VARIANT_SEPARATOR)?;
      let mut first = true;
      for (key, value) in &self.variant {
        if !first {
          write!(f, ",")?;
        }
        write_escaped(f, key)?;
        write!(f, "=")?;
        write_escaped(f, value)?;
        first = false;
      }
    }
    Ok(())
  }
}

impl FromStr for RecordId {
  type Err = RecordIdError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let parts = split_unescaped(s, VARIANT_SEPARATOR);
    if parts.len() > 2 {
      return Err(RecordIdError::InvalidVariant(s.to_string()));
    }

    let master = unescape(parts[0])?;
    if master.is_empty() {
      return Err(RecordIdError::EmptyMaster);
    }

    let mut id = RecordId::new(master);
    if let Some(props) = parts.get(1) {
      for pair in split_unescaped(props, ',') {
        let invalid = || RecordIdError::InvalidVariant(pair.to_string());
        let kv = split_unescaped(pair, '=');
        let [key, value] = kv.as_slice() else {
          return Err(invalid());
        };
        if key.is_empty() {
          return Err(invalid());
        }
        id.variant.insert(unescape(key)?, unescape(value)?);
      }
    }

    Ok(id)
  }
}

/// Characters with a meaning in the string form, escaped with a backslash.
fn is_reserved(c: char) -> bool {
  matches!(c, '\\' | VARIANT_SEPARATOR | ',' | '=')
}

fn write_escaped(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
  for c in s.chars() {
    if is_reserved(c) {
      write!(f, "\\")?;
    }
    write!(f, "{}", c)?;
  }
  Ok(())
}

/// Split on `sep` where it is not escaped. Segments keep their escapes.
fn split_unescaped(s: &str, sep: char) -> Vec<&str> {
  let mut parts = Vec::new();
  let mut start = 0;
  let mut escaped = false;
  for (i, c) in s.char_indices() {
    if escaped {
      escaped = false;
    } else if c == '\\' {
      escaped = true;
    } else if c == sep {
      parts.push(&s[start..i]);
      start = i + c.len_utf8();
    }
  }
  parts.push(&s[start..]);
  parts
}

fn unescape(s: &str) -> Result<String, RecordIdError> {
  let mut out = String::with_capacity(s.len());
  let mut chars = s.chars();
  while let Some(c) = chars.next() {
    if c == '\\' {
      let next = chars.next().ok_or_else(|| RecordIdError::DanglingEscape(s.to_string()))?;
      out.push(next);
    } else {
      out.push(c);
    }
  }
  Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordIdError {
  #[error("Record id is not valid UTF-8")]
  NotUtf8,
  #[error("Record id has an empty master id")]
  EmptyMaster,
  #[error("Invalid variant property: {0}")]
  InvalidVariant(String),
  #[error("Trailing escape character in '{0}'")]
  DanglingEscape(String),
}

// ============================================================================
// QName
// ============================================================================

/// Qualified record type name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QName {
  pub namespace: String,
  pub name: String,
}

impl QName {
  pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      namespace: namespace.into(),
      name: name.into(),
    }
  }
}

impl fmt::Display for QName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{{{}}}{}", self.namespace, self.name)
  }
}

impl FromStr for QName {
  type Err = String;

  /// Accepts `{namespace}name` or `namespace:name`.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if let Some(rest) = s.strip_prefix('{') {
      let (namespace, name) = rest.split_once('}').ok_or_else(|| format!("Unterminated namespace in '{}'", s))?;
      return Ok(QName::new(namespace, name));
    }
    match s.rsplit_once(':') {
      Some((namespace, name)) => Ok(QName::new(namespace, name)),
      None => Ok(QName::new("", s)),
    }
  }
}

// ============================================================================
// Record
// ============================================================================

/// A record version as read from the record store.
///
/// `version_tags` maps a version tag name (e.g. `live`) to the version number
/// it points at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub id: RecordId,
  pub record_type: QName,
  pub version: u64,
  #[serde(default)]
  pub fields: BTreeMap<String, serde_json::Value>,
  #[serde(default)]
  pub version_tags: BTreeMap<String, u64>,
}

impl Record {
  pub fn new(id: RecordId, record_type: QName) -> Self {
    Self {
      id,
      record_type,
      version: 0,
      fields: BTreeMap::new(),
      version_tags: BTreeMap::new(),
    }
  }

  pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
    self.fields.insert(name.into(), value);
    self
  }

  pub fn with_version_tag(mut self, tag: impl Into<String>, version: u64) -> Self {
    self.version_tags.insert(tag.into(), version);
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_master_id_roundtrip() {
    let id: RecordId = "USER.doc1".parse().unwrap();
    assert!(id.is_master());
    assert_eq!(id.to_string(), "USER.doc1");
  }

  #[test]
  fn test_variant_id_is_sorted() {
    let id = RecordId::new("doc").with_variant("lang", "en").with_variant("branch", "dev");
    assert_eq!(id.to_string(), "doc!branch=dev,lang=en");

    let parsed: RecordId = "doc!lang=en,branch=dev".parse().unwrap();
    assert_eq!(parsed, id);
    assert_eq!(parsed.master_record_id(), RecordId::new("doc"));
  }

  #[test]
  fn test_row_key_roundtrip() {
    let id = RecordId::new("doc").with_variant("lang", "nl");
    assert_eq!(RecordId::from_row_key(&id.to_row_key()).unwrap(), id);
    assert_eq!(RecordId::from_row_key(&[0xff, 0xfe]), Err(RecordIdError::NotUtf8));
  }

  #[test]
  fn test_reserved_characters_survive_row_key() {
    let ids = [
      RecordId::new("a!b"),
      RecordId::new(r"back\slash"),
      RecordId::new("doc!x").with_variant("k=1", "v,2").with_variant("lang", "a!b=c"),
    ];
    for id in ids {
      assert_eq!(RecordId::from_row_key(&id.to_row_key()).unwrap(), id);
    }
    assert_eq!(RecordId::new("a!b").to_string(), r"a\!b");
    assert_eq!(
      RecordId::new("d").with_variant("k", "v,w").to_string(),
      r"d!k=v\,w"
    );
  }

  #[test]
  fn test_invalid_ids() {
    assert_eq!("".parse::<RecordId>(), Err(RecordIdError::EmptyMaster));
    assert!(matches!(
      "doc!lang".parse::<RecordId>(),
      Err(RecordIdError::InvalidVariant(_))
    ));
    assert!(matches!(
      "doc!a=b!c=d".parse::<RecordId>(),
      Err(RecordIdError::InvalidVariant(_))
    ));
    assert_eq!(
      r"doc\".parse::<RecordId>(),
      Err(RecordIdError::DanglingEscape(r"doc\".to_string()))
    );
  }

  #[test]
  fn test_qname_forms() {
    assert_eq!("{org.books}Book".parse::<QName>().unwrap(), QName::new("org.books", "Book"));
    assert_eq!("org.books:Book".parse::<QName>().unwrap(), QName::new("org.books", "Book"));
    assert_eq!(QName::new("ns", "T").to_string(), "{ns}T");
  }
}
