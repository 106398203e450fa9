//! Annotation schema and the tab-block metadata file.
//!
//! The metadata file (`struct.out` by default) groups attributes under
//! their accession: a line starting at column one opens a block, each
//! following `\tkey\tvalue` line adds one attribute. Empty values are
//! stored as `"None"`. List-valued attributes hold comma-delimited items
//! and are emitted as repeated sub-elements by the network writer.

use anyhow::{Context, Result};
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

/// How an attribute is typed in the network output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    Str,
    Int,
    Real,
    List,
}

impl AttrKind {
    pub fn xgmml_type(&self) -> &'static str {
        match self {
            AttrKind::Str => "string",
            AttrKind::Int => "integer",
            AttrKind::Real => "real",
            AttrKind::List => "list",
        }
    }
}

/// Canonical display order and typing of the known attribute keys.
/// Unknown keys keep their value as strings and sort after these.
const SCHEMA: &[(&str, AttrKind)] = &[
    ("Description", AttrKind::Str),
    ("Organism", AttrKind::Str),
    ("Taxonomy_ID", AttrKind::Int),
    ("Superkingdom", AttrKind::Str),
    ("Sequence_Length", AttrKind::Int),
    ("Sequence_Source", AttrKind::Str),
    ("Query_IDs", AttrKind::List),
    ("Other_IDs", AttrKind::List),
    ("Cluster_Size", AttrKind::Int),
    ("IPRO", AttrKind::List),
    ("PFAM", AttrKind::List),
    ("GENE3D", AttrKind::List),
    ("SSF", AttrKind::List),
    ("GO", AttrKind::List),
    ("PDB", AttrKind::List),
];

pub fn attr_kind(key: &str) -> AttrKind {
    SCHEMA
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, kind)| *kind)
        .unwrap_or(AttrKind::Str)
}

fn schema_rank(key: &str) -> usize {
    SCHEMA
        .iter()
        .position(|(k, _)| *k == key)
        .unwrap_or(SCHEMA.len())
}

/// Order attributes by the schema's display order; unknown keys keep
/// their relative order after the known ones.
pub fn sort_attrs(attrs: &mut [(String, String)]) {
    attrs.sort_by_key(|(key, _)| schema_rank(key));
}

/// Split a list-valued attribute into trimmed items.
pub fn list_items(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "None")
        .map(str::to_string)
        .collect()
}

/// Annotations loaded from a metadata file, accession order preserved.
#[derive(Debug, Default)]
pub struct AnnotTable {
    pub order: Vec<String>,
    pub attrs: FxHashMap<String, Vec<(String, String)>>,
}

impl AnnotTable {
    pub fn get(&self, accession: &str) -> &[(String, String)] {
        self.attrs.get(accession).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Drop every block whose accession is not in `keep`.
    pub fn retain<F: Fn(&str) -> bool>(&mut self, keep: F) {
        self.order.retain(|acc| keep(acc));
        self.attrs.retain(|acc, _| keep(acc));
    }
}

/// Read a metadata file back into memory.
pub fn read_annotations(path: &Path) -> Result<AnnotTable> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open metadata file: {}", path.display()))?;
    let reader = BufReader::with_capacity(1024 * 1024, file);

    let mut table = AnnotTable::default();
    let mut current: Option<String> = None;

    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix('\t') {
            let accession = current
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("Attribute line before any accession: {}", rest))?;
            let (key, value) = match rest.split_once('\t') {
                Some((k, v)) => (k, v),
                None => (rest, ""),
            };
            let value = if value.trim().is_empty() {
                "None".to_string()
            } else {
                value.trim().to_string()
            };
            table
                .attrs
                .entry(accession.clone())
                .or_default()
                .push((key.to_string(), value));
        } else {
            let accession = line
                .split_whitespace()
                .next()
                .unwrap_or(&line)
                .to_string();
            if !table.attrs.contains_key(&accession) {
                table.order.push(accession.clone());
                table.attrs.insert(accession.clone(), Vec::new());
            }
            current = Some(accession);
        }
    }

    for attrs in table.attrs.values_mut() {
        sort_attrs(attrs);
    }

    Ok(table)
}

/// Write a whole table back out, block order preserved.
pub fn write_annotations(path: &Path, table: &AnnotTable) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create metadata file: {}", path.display()))?;
    let mut out = std::io::BufWriter::new(file);
    for accession in &table.order {
        write_block(&mut out, accession, table.get(accession))?;
    }
    out.flush()?;
    Ok(())
}

/// Write one accession block.
pub fn write_block<W: Write>(
    out: &mut W,
    accession: &str,
    attrs: &[(String, String)],
) -> Result<()> {
    writeln!(out, "{}", accession)?;
    for (key, value) in attrs {
        let value = if value.trim().is_empty() { "None" } else { value.trim() };
        writeln!(out, "\t{}\t{}", key, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_attr_kinds() {
        assert_eq!(attr_kind("Sequence_Length"), AttrKind::Int);
        assert_eq!(attr_kind("Query_IDs"), AttrKind::List);
        assert_eq!(attr_kind("SomethingElse"), AttrKind::Str);
    }

    #[test]
    fn test_schema_ordering_with_unknown_keys() {
        let mut attrs = vec![
            ("Zebra_Key".to_string(), "x".to_string()),
            ("Sequence_Length".to_string(), "120".to_string()),
            ("Description".to_string(), "protein".to_string()),
        ];
        sort_attrs(&mut attrs);
        assert_eq!(attrs[0].0, "Description");
        assert_eq!(attrs[1].0, "Sequence_Length");
        assert_eq!(attrs[2].0, "Zebra_Key");
    }

    #[test]
    fn test_list_items() {
        assert_eq!(list_items("a, b ,c"), vec!["a", "b", "c"]);
        assert!(list_items("None").is_empty());
        assert!(list_items("").is_empty());
    }

    #[test]
    fn test_roundtrip_preserves_values_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("struct.out");

        {
            let mut f = File::create(&path).unwrap();
            write_block(
                &mut f,
                "A0A001",
                &[
                    ("Description".to_string(), "test protein".to_string()),
                    ("Sequence_Length".to_string(), "120".to_string()),
                    ("Query_IDs".to_string(), "gi123,NP_1".to_string()),
                    ("Empty_Key".to_string(), "".to_string()),
                ],
            )
            .unwrap();
            write_block(&mut f, "zzzzz1", &[("Description".to_string(), "user".to_string())])
                .unwrap();
        }

        let table = read_annotations(&path).unwrap();
        assert_eq!(table.order, vec!["A0A001", "zzzzz1"]);

        let attrs = table.get("A0A001");
        assert_eq!(
            attrs.iter().find(|(k, _)| k == "Query_IDs").unwrap().1,
            "gi123,NP_1"
        );
        assert_eq!(
            attrs.iter().find(|(k, _)| k == "Empty_Key").unwrap().1,
            "None"
        );
        // Unknown key lands after schema keys.
        assert_eq!(attrs.last().unwrap().0, "Empty_Key");
    }

    #[test]
    fn test_retain_filters_blocks() {
        let mut table = AnnotTable::default();
        table.order = vec!["A".to_string(), "B".to_string()];
        table.attrs.insert("A".to_string(), vec![]);
        table.attrs.insert("B".to_string(), vec![]);

        table.retain(|acc| acc == "A");
        assert_eq!(table.order, vec!["A"]);
        assert!(!table.attrs.contains_key("B"));
    }
}
