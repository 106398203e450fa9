//! XGMML network writer.
//!
//! Merges the node list, reduced edges and per-node annotations into a
//! single `<graph>` document. Attribute typing follows the annotation
//! schema; list attributes become nested `<att>` containers. A run whose
//! edge count exceeds `maxfull` gets a plain-text notice file in place of
//! the network, and the caller tells the two apart by inspecting it.

use anyhow::{Context, Result};
use rustc_hash::FxHashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::annot::{attr_kind, list_items, AnnotTable, AttrKind};
use crate::reduce::Edge;

const XGMML_NS: &str = "http://www.cs.rpi.edu/XGMML";

/// What the writer produced.
#[derive(Debug, PartialEq, Eq)]
pub enum NetworkOutcome {
    Written { nodes: usize, edges: usize },
    TooLarge { edges: usize },
}

/// Strip non-printable control characters that would corrupt the XML.
fn strip_control(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(*c, '\x00'..='\x08' | '\x0b' | '\x0c' | '\x0e'..='\x1f'))
        .collect()
}

fn escape_xml(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn clean(value: &str) -> String {
    escape_xml(&strip_control(value))
}

/// Split a domain node ID of the form `ACC:start:end`.
pub fn parse_domain_id(id: &str) -> Option<(&str, u64, u64)> {
    let mut parts = id.split(':');
    let base = parts.next()?;
    let start: u64 = parts.next()?.parse().ok()?;
    let end: u64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || base.is_empty() || end < start {
        return None;
    }
    Some((base, start, end))
}

/// Domain nodes report the window length, everything else the stored one.
pub fn node_sequence_length(id: &str, stored: &str) -> String {
    match parse_domain_id(id) {
        Some((_, start, end)) => (end - start + 1).to_string(),
        None => stored.to_string(),
    }
}

fn write_att<W: Write>(out: &mut W, id: &str, key: &str, value: &str) -> Result<()> {
    let kind = attr_kind(key);

    let value = if key == "Sequence_Length" {
        node_sequence_length(id, value)
    } else {
        value.to_string()
    };

    match kind {
        AttrKind::List => {
            let items = list_items(&value);
            if items.is_empty() {
                return Ok(());
            }
            writeln!(out, "    <att type=\"list\" name=\"{}\">", clean(key))?;
            for item in items {
                writeln!(
                    out,
                    "      <att type=\"string\" name=\"{}\" value=\"{}\" />",
                    clean(key),
                    clean(&item)
                )?;
            }
            writeln!(out, "    </att>")?;
        }
        AttrKind::Int => {
            // Empty integers are elided rather than written as None.
            if value.trim().is_empty() || value == "None" {
                return Ok(());
            }
            writeln!(
                out,
                "    <att name=\"{}\" type=\"integer\" value=\"{}\" />",
                clean(key),
                clean(&value)
            )?;
        }
        AttrKind::Real => {
            writeln!(
                out,
                "    <att name=\"{}\" type=\"real\" value=\"{}\" />",
                clean(key),
                clean(&value)
            )?;
        }
        AttrKind::Str => {
            let value = if value.trim().is_empty() { "None".to_string() } else { value };
            writeln!(
                out,
                "    <att name=\"{}\" type=\"string\" value=\"{}\" />",
                clean(key),
                clean(&value)
            )?;
        }
    }
    Ok(())
}

/// Write the network, or the size notice when it would be too large.
pub fn write_network(
    path: &Path,
    label: &str,
    db_version: Option<&str>,
    nodes: &[String],
    annotations: &AnnotTable,
    edges: &[Edge],
    maxfull: usize,
) -> Result<NetworkOutcome> {
    let mut out = BufWriter::with_capacity(
        4 * 1024 * 1024,
        File::create(path)
            .with_context(|| format!("Failed to create network file: {}", path.display()))?,
    );

    if maxfull > 0 && edges.len() > maxfull {
        writeln!(
            out,
            "Too many edges ({}) to write the full network; the limit for this run was {}.",
            edges.len(),
            maxfull
        )?;
        writeln!(out, "Re-run with a smaller input or a higher edge limit.")?;
        out.flush()?;
        return Ok(NetworkOutcome::TooLarge { edges: edges.len() });
    }

    let node_set: FxHashSet<&str> = nodes.iter().map(String::as_str).collect();
    for edge in edges {
        if !node_set.contains(edge.a.as_str()) || !node_set.contains(edge.b.as_str()) {
            anyhow::bail!(
                "Edge ({}, {}) references a sequence missing from the node set",
                edge.a,
                edge.b
            );
        }
    }

    writeln!(out, "<?xml version=\"1.0\"?>")?;
    if let Some(version) = db_version {
        writeln!(out, "<!-- Database: {} -->", clean(version))?;
    }
    writeln!(
        out,
        "<graph label=\"{}\" xmlns=\"{}\">",
        clean(label),
        XGMML_NS
    )?;

    for id in nodes {
        writeln!(
            out,
            "  <node id=\"{}\" label=\"{}\">",
            clean(id),
            clean(id)
        )?;
        // Domain nodes carry their base accession's annotations.
        let mut attrs = annotations.get(id);
        if attrs.is_empty() {
            if let Some((base, _, _)) = parse_domain_id(id) {
                attrs = annotations.get(base);
            }
        }
        for (key, value) in attrs {
            write_att(&mut out, id, key, value)?;
        }
        writeln!(out, "  </node>")?;
    }

    for edge in edges {
        writeln!(
            out,
            "  <edge source=\"{}\" target=\"{}\" label=\"{},{}\">",
            clean(&edge.a),
            clean(&edge.b),
            clean(&edge.a),
            clean(&edge.b)
        )?;
        writeln!(
            out,
            "    <att name=\"%id\" type=\"real\" value=\"{}\" />",
            edge.pident
        )?;
        writeln!(
            out,
            "    <att name=\"alignment_score\" type=\"real\" value=\"{}\" />",
            edge.alignment_score()
        )?;
        writeln!(
            out,
            "    <att name=\"alignment_len\" type=\"integer\" value=\"{}\" />",
            edge.align_len
        )?;
        writeln!(out, "  </edge>")?;
    }

    writeln!(out, "</graph>")?;
    out.flush()?;

    Ok(NetworkOutcome::Written {
        nodes: nodes.len(),
        edges: edges.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(a: &str, b: &str) -> Edge {
        Edge {
            a: a.to_string(),
            b: b.to_string(),
            pident: 90.0,
            align_len: 50,
            bitscore: 100.0,
            qlen: 100,
            slen: 100,
        }
    }

    fn table_with(acc: &str, attrs: Vec<(&str, &str)>) -> AnnotTable {
        let mut table = AnnotTable::default();
        table.order.push(acc.to_string());
        table.attrs.insert(
            acc.to_string(),
            attrs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        table
    }

    #[test]
    fn test_domain_id_parse() {
        assert_eq!(parse_domain_id("A0A001:10:50"), Some(("A0A001", 10, 50)));
        assert_eq!(parse_domain_id("A0A001"), None);
        assert_eq!(parse_domain_id("A0A001:50:10"), None);
        assert_eq!(parse_domain_id("A0A001:1:2:3"), None);
    }

    #[test]
    fn test_domain_length_override() {
        assert_eq!(node_sequence_length("A0A001:10:50", "500"), "41");
        assert_eq!(node_sequence_length("A0A001", "500"), "500");
    }

    #[test]
    fn test_write_small_network() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssn.xgmml");

        let nodes = vec!["A0A001".to_string(), "B0B002".to_string()];
        let mut table = table_with(
            "A0A001",
            vec![
                ("Description", "test <protein>"),
                ("Sequence_Length", "120"),
                ("Query_IDs", "gi123,NP_1"),
            ],
        );
        table.order.push("B0B002".to_string());
        table.attrs.insert("B0B002".to_string(), vec![]);

        let edges = vec![edge("A0A001", "B0B002")];
        let outcome = write_network(
            &path,
            "test-network",
            Some("uniprot_2024_03"),
            &nodes,
            &table,
            &edges,
            1000,
        )
        .unwrap();
        assert_eq!(outcome, NetworkOutcome::Written { nodes: 2, edges: 1 });

        let xml = std::fs::read_to_string(&path).unwrap();
        assert!(xml.contains("<!-- Database: uniprot_2024_03 -->"));
        assert!(xml.contains("<graph label=\"test-network\""));
        assert!(xml.contains("value=\"test &lt;protein&gt;\""));
        assert!(xml.contains("<att type=\"list\" name=\"Query_IDs\">"));
        assert!(xml.contains("value=\"gi123\""));
        assert!(xml.contains("<edge source=\"A0A001\" target=\"B0B002\""));
        assert!(xml.contains("<att name=\"alignment_score\" type=\"real\" value=\"26\""));
    }

    #[test]
    fn test_size_guard_writes_notice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssn.xgmml");

        let nodes = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let table = AnnotTable::default();
        let edges = vec![edge("A", "B"), edge("A", "C"), edge("B", "C")];

        let outcome =
            write_network(&path, "big", None, &nodes, &table, &edges, 2).unwrap();
        assert_eq!(outcome, NetworkOutcome::TooLarge { edges: 3 });

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("Too many edges"));
        assert!(!text.contains("<graph"));
    }

    #[test]
    fn test_edge_endpoint_closure_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssn.xgmml");

        let nodes = vec!["A".to_string()];
        let table = AnnotTable::default();
        let edges = vec![edge("A", "MISSING")];

        assert!(write_network(&path, "bad", None, &nodes, &table, &edges, 0).is_err());
    }

    #[test]
    fn test_control_characters_stripped() {
        assert_eq!(strip_control("ab\x07cd\x1fef"), "abcdef");
        assert_eq!(strip_control("tab\tok"), "tab\tok");
    }

    #[test]
    fn test_domain_node_sequence_length_in_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssn.xgmml");

        let nodes = vec!["A0A001:10:50".to_string()];
        let table = table_with("A0A001:10:50", vec![("Sequence_Length", "500")]);

        write_network(&path, "domain", None, &nodes, &table, &[], 0).unwrap();
        let xml = std::fs::read_to_string(&path).unwrap();
        assert!(xml.contains("<att name=\"Sequence_Length\" type=\"integer\" value=\"41\""));
    }
}
