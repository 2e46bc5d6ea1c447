use serde_json::Value;

use super::IndexError;
use crate::{
  conf::IndexField,
  domain::record::{Record, RecordId},
  search::IndexDocument,
};

/// Document fields every document carries; index fields may not reuse them.
pub const SYSTEM_FIELDS: &[&str] = &["id", "vtag", "version", "recordType"];

/// Id of the document for one version tag of a record.
pub fn document_id(record_id: &RecordId, vtag: &str) -> String {
  format!("{}-{}", record_id, vtag)
}

pub struct DocumentBuilder;

impl DocumentBuilder {
  /// Build the document for `record` (already at the tagged version).
  ///
  /// Scalars and arrays of scalars flatten to string values; objects cannot
  /// be indexed.
  pub fn build(record: &Record, vtag: &str, fields: &[IndexField]) -> Result<IndexDocument, IndexError> {
    let mut document = IndexDocument::new(document_id(&record.id, vtag))
      .with_value("id", record.id.to_string())
      .with_value("vtag", vtag)
      .with_value("version", record.version.to_string())
      .with_value("recordType", record.record_type.to_string());

    for field in fields {
      let Some(value) = record.fields.get(&field.source) else {
        continue;
      };
      let mut values = Vec::new();
      flatten(value, &mut values).map_err(|reason| IndexError::Unindexable {
        record_id: record.id.to_string(),
        reason: format!("field '{}': {}", field.source, reason),
      })?;
      for value in values {
        document.add_value(&field.name, value);
      }
    }

    Ok(document)
  }
}

fn flatten(value: &Value, out: &mut Vec<String>) -> Result<(), &'static str> {
  match value {
    Value::Null => Ok(()),
    Value::Bool(b) => {
      out.push(b.to_string());
      Ok(())
    }
    Value::Number(n) => {
      out.push(n.to_string());
      Ok(())
    }
    Value::String(s) => {
      out.push(s.clone());
      Ok(())
    }
    Value::Array(items) => items.iter().try_for_each(|item| flatten(item, out)),
    Value::Object(_) => Err("nested objects cannot be indexed"),
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::domain::record::QName;

  fn field(name: &str, source: &str) -> IndexField {
    IndexField {
      name: name.to_string(),
      source: source.to_string(),
    }
  }

  #[test]
  fn test_build() {
    let mut record = Record::new(
      RecordId::new("b1").with_variant("lang", "en"),
      QName::new("org.books", "Book"),
    )
    .with_field("title", json!("Dune"))
    .with_field("author", json!(["Herbert", null, 1965, true]));
    record.version = 3;

    let doc = DocumentBuilder::build(
      &record,
      "live",
      &[field("title", "title"), field("authors", "author"), field("isbn", "isbn")],
    )
    .unwrap();

    assert_eq!(doc.id, "b1!lang=en-live");
    assert_eq!(doc.value("recordType"), Some("{org.books}Book"));
    assert_eq!(doc.value("version"), Some("3"));
    assert_eq!(doc.value("title"), Some("Dune"));
    assert_eq!(doc.fields["authors"], vec!["Herbert", "1965", "true"]);
    assert!(!doc.fields.contains_key("isbn"));
  }

  #[test]
  fn test_objects_are_unindexable() {
    let record = Record::new(RecordId::new("b1"), QName::new("ns", "T")).with_field("meta", json!([{"a": 1}]));
    let err = DocumentBuilder::build(&record, "live", &[field("meta", "meta")]).unwrap_err();
    assert!(matches!(err, IndexError::Unindexable { .. }));
    assert!(!err.is_transient());
  }
}
