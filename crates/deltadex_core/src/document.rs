//! Document assembly.
//!
//! Turns records of an entity's table (plus rows of associated tables) into
//! the field/text documents handed to the indexer.

use crate::config::{EntityIndexConfig, FieldSource};
use crate::store::{Record, Snapshot};
use crate::types::{RecordId, SequenceNumber};
use std::collections::{BTreeMap, HashMap};

/// A document ready for indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Record ID.
    pub id: RecordId,
    /// Record revision at snapshot time.
    pub revision: SequenceNumber,
    /// Field name to text.
    pub fields: BTreeMap<String, String>,
}

/// Builds documents for one entity from a snapshot.
///
/// Association fields are resolved through a per-table index from owner ID
/// to associated rows, built once per assembler.
pub struct DocumentAssembler<'a> {
    config: &'a EntityIndexConfig,
    snapshot: &'a Snapshot,
    associations: HashMap<(&'a str, &'a str), BTreeMap<RecordId, Vec<&'a Record>>>,
}

impl<'a> DocumentAssembler<'a> {
    /// Creates an assembler. The snapshot must contain the entity's
    /// [`EntityIndexConfig::source_tables`].
    pub fn new(config: &'a EntityIndexConfig, snapshot: &'a Snapshot) -> Self {
        let mut associations = HashMap::new();
        for field in &config.fields {
            let FieldSource::Association {
                table, foreign_key, ..
            } = &field.source
            else {
                continue;
            };
            associations
                .entry((table.as_str(), foreign_key.as_str()))
                .or_insert_with(|| {
                    let mut owners: BTreeMap<RecordId, Vec<&'a Record>> = BTreeMap::new();
                    for row in snapshot.table(table).records.values() {
                        if let Some(owner) = row.get(foreign_key).and_then(RecordId::parse) {
                            owners.entry(owner).or_default().push(row);
                        }
                    }
                    owners
                });
        }
        Self {
            config,
            snapshot,
            associations,
        }
    }

    /// Assembles the document for a record.
    #[must_use]
    pub fn assemble(&self, record: &Record) -> Document {
        let mut fields = BTreeMap::new();
        for field in &self.config.fields {
            let text = match &field.source {
                FieldSource::Column { column } => record.get(column).unwrap_or("").to_string(),
                FieldSource::Association {
                    table,
                    foreign_key,
                    column,
                } => self
                    .associations
                    .get(&(table.as_str(), foreign_key.as_str()))
                    .and_then(|owners| owners.get(&record.id))
                    .map(|rows| {
                        rows.iter()
                            .filter_map(|row| row.get(column))
                            .collect::<Vec<_>>()
                            .join(" ")
                    })
                    .unwrap_or_default(),
            };
            fields.insert(field.name.clone(), text);
        }
        Document {
            id: record.id,
            revision: record.revision,
            fields,
        }
    }

    /// Assembles documents for every live record of the entity.
    #[must_use]
    pub fn assemble_all(&self) -> Vec<Document> {
        self.snapshot
            .table(&self.config.name)
            .records
            .values()
            .map(|record| self.assemble(record))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldSpec;
    use crate::store::{RecordStore, TableSchema};

    fn cols(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn joins_association_rows_in_id_order() {
        let store = RecordStore::new();
        store
            .ensure_table(&TableSchema::new("articles", &["title"]))
            .unwrap();
        store
            .ensure_table(&TableSchema::new("comments", &["article_id", "body"]))
            .unwrap();
        store
            .insert("articles", RecordId::new(1), cols(&[("title", "Hello")]), None)
            .unwrap();
        store
            .insert(
                "comments",
                RecordId::new(11),
                cols(&[("article_id", "1"), ("body", "first")]),
                None,
            )
            .unwrap();
        store
            .insert(
                "comments",
                RecordId::new(10),
                cols(&[("article_id", "1"), ("body", "zeroth")]),
                None,
            )
            .unwrap();
        store
            .insert(
                "comments",
                RecordId::new(12),
                cols(&[("article_id", "2"), ("body", "elsewhere")]),
                None,
            )
            .unwrap();

        let config = EntityIndexConfig::new("articles")
            .field(FieldSpec::column("title"))
            .field(FieldSpec::association("comments", "comments", "article_id", "body"));
        let snapshot = store.snapshot(&config.source_tables()).unwrap();
        let docs = DocumentAssembler::new(&config, &snapshot).assemble_all();

        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].fields["title"], "Hello");
        assert_eq!(docs[0].fields["comments"], "zeroth first");
    }

    #[test]
    fn missing_columns_become_empty_text() {
        let store = RecordStore::new();
        store
            .ensure_table(&TableSchema::new("articles", &["title", "body"]))
            .unwrap();
        store
            .insert("articles", RecordId::new(1), cols(&[("title", "x")]), None)
            .unwrap();

        let config = EntityIndexConfig::new("articles").field(FieldSpec::column("body"));
        let snapshot = store.snapshot(&["articles"]).unwrap();
        let docs = DocumentAssembler::new(&config, &snapshot).assemble_all();
        assert_eq!(docs[0].fields["body"], "");
    }
}
