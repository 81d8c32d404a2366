//! Spreadsheet ingestion for the dental dashboard sync: workbook loading,
//! semantic column mapping, row transformation, and per-tab processing.

pub mod columns;
pub mod domain;
pub mod process;
pub mod transform;
pub mod workbook;

pub use columns::{find_header_row, map_columns, ColumnMapping, FieldSpec, HEADER_SCAN_ROWS};
pub use domain::{FinancialDomain, HygieneDomain, SheetDomain};
pub use process::{process_workbook, ProcessOutcome, TabReport};
pub use transform::{
    NumericCell, RowError, RowOutcome, RowReader, TransformContext, TransformedRow,
};
pub use workbook::{CellValue, Sheet, Workbook};
