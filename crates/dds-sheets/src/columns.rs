//! Header-row detection and semantic column mapping.

use std::collections::HashMap;

use strsim::jaro_winkler;

use crate::workbook::CellValue;

/// How many leading rows are scanned for a recognizable header.
pub const HEADER_SCAN_ROWS: usize = 5;

/// Minimum Jaro-Winkler similarity before a misspelled header is accepted.
const FUZZY_THRESHOLD: f64 = 0.93;

/// One semantic field the mapper should locate. Tables are declared in
/// priority order: specific fields first, so "Production Goal" is claimed
/// before the looser "production" pattern can take it.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub variants: &'static [&'static str],
    pub required: bool,
}

/// Semantic field name → zero-based column index. Built once per tab from
/// its header row, immutable thereafter.
#[derive(Debug, Clone, Default)]
pub struct ColumnMapping {
    indices: HashMap<&'static str, usize>,
}

impl ColumnMapping {
    pub fn index_of(&self, field: &str) -> Option<usize> {
        self.indices.get(field).copied()
    }

    pub fn cell<'r>(&self, field: &str, row: &'r [CellValue]) -> Option<&'r CellValue> {
        self.index_of(field).and_then(|i| row.get(i))
    }

    /// Required fields that found no column; non-empty means the whole tab
    /// is unprocessable.
    pub fn missing_required(&self, fields: &[FieldSpec]) -> Vec<&'static str> {
        fields
            .iter()
            .filter(|f| f.required && !self.indices.contains_key(f.name))
            .map(|f| f.name)
            .collect()
    }
}

/// Assign each field the first unclaimed header column matching one of its
/// accepted variants: exact matches win over substring matches, which win
/// over the fuzzy fallback. A claimed column is never re-claimed.
pub fn map_columns(header: &[CellValue], fields: &[FieldSpec]) -> ColumnMapping {
    let cells: Vec<Option<String>> = header
        .iter()
        .map(|c| {
            c.as_text()
                .map(|t| t.to_lowercase())
                .filter(|t| !t.is_empty())
        })
        .collect();
    let mut claimed = vec![false; cells.len()];
    let mut mapping = ColumnMapping::default();

    for field in fields {
        if let Some(index) = find_column(&cells, &claimed, field.variants) {
            claimed[index] = true;
            mapping.indices.insert(field.name, index);
        }
    }
    mapping
}

fn find_column(
    cells: &[Option<String>],
    claimed: &[bool],
    variants: &[&str],
) -> Option<usize> {
    let candidates: Vec<(usize, &str)> = cells
        .iter()
        .enumerate()
        .filter(|(i, _)| !claimed[*i])
        .filter_map(|(i, c)| c.as_deref().map(|c| (i, c)))
        .collect();

    for variant in variants {
        if let Some((i, _)) = candidates.iter().find(|(_, c)| c == variant) {
            return Some(*i);
        }
    }
    for variant in variants {
        if let Some((i, _)) = candidates.iter().find(|(_, c)| c.contains(variant)) {
            return Some(*i);
        }
    }
    for variant in variants {
        if let Some((i, _)) = candidates
            .iter()
            .find(|(_, c)| jaro_winkler(c, variant) >= FUZZY_THRESHOLD)
        {
            return Some(*i);
        }
    }
    None
}

/// Scan the first few rows for a cell bearing a "date"/"day" token and
/// treat that row as the header; fall back to the first row.
pub fn find_header_row(rows: &[Vec<CellValue>]) -> usize {
    for (i, row) in rows.iter().take(HEADER_SCAN_ROWS).enumerate() {
        if row.iter().any(is_header_marker) {
            return i;
        }
    }
    0
}

fn is_header_marker(cell: &CellValue) -> bool {
    cell.as_text()
        .map(|t| {
            let t = t.to_lowercase();
            t.contains("date") || t.contains("day")
        })
        .unwrap_or(false)
}
