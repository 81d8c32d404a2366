//! End-to-end ingestion scenarios over real files on disk.

use chrono::NaiveDate;
use dds_sheets::{process_workbook, FinancialDomain, TransformContext, Workbook};

fn ctx() -> TransformContext {
    TransformContext {
        today: NaiveDate::from_ymd_opt(2024, 6, 15).expect("valid date"),
    }
}

#[test]
fn csv_export_flows_through_to_records() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("Jan 2024.csv");
    std::fs::write(
        &path,
        "Bayview Dental,,\n\
         Date,Production,Adjustments\n\
         2024-01-05,\"$100.00\",($5.00)\n\
         ,$50.00,\n\
         2024-01-06,\"$1,250.25\",\n",
    )
    .expect("write csv");

    let workbook = Workbook::open(&path).expect("open");
    let outcome = process_workbook(&workbook, &FinancialDomain::new("BV"), &ctx());

    assert_eq!(outcome.tabs.len(), 1);
    assert_eq!(outcome.records.len(), 2);
    assert_eq!(outcome.records[0].production, Some(100.0));
    assert_eq!(outcome.records[0].adjustments, Some(-5.0));
    assert_eq!(outcome.records[1].production, Some(1250.25));
    assert_eq!(outcome.tabs[0].skips.missing_date, 1);
    // Every record needed a minted id; the caller is told which rows.
    assert_eq!(outcome.generated_ids(), 2);
}

#[test]
fn title_rows_above_the_header_are_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("2024-03.csv");
    std::fs::write(
        &path,
        "Quarterly rollup,,\n\
         Prepared by front office,,\n\
         Date,Production,Collections\n\
         2024-03-01,$900.00,$450.00\n",
    )
    .expect("write csv");

    let workbook = Workbook::open(&path).expect("open");
    let outcome = process_workbook(&workbook, &FinancialDomain::new("BV"), &ctx());

    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.records[0].collections, Some(450.0));
    assert!(outcome.tabs[0].error.is_none());
}
