//! Spreadsheet report for a finished job.
//!
//! [`ReportTable`] is the pure, deterministic layout step; [`write_xlsx`]
//! renders it. Rows are always sorted by PIN regardless of completion order.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use rust_xlsxwriter::{Format, FormatAlign, FormatBorder, Workbook, XlsxError};
use tracing::info;

use crate::jobs::{compare_pins, JobId, PinOutcome, ResultRecord};

/// Columns before the per-subject groups.
const LEADING_COLUMNS: [&str; 3] = ["SI.NO", "PINNUMBERS", "NAME"];
const TRAILING_COLUMNS: [&str; 2] = ["TOTAL", "OVERALL_RESULT"];
const SUBJECT_SUFFIXES: [&str; 4] = ["EXT", "INT", "TOT", "RES"];

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to prepare artifact directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to write spreadsheet: {0}")]
    Xlsx(#[from] XlsxError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Number(f64),
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

impl From<u32> for Cell {
    fn from(value: u32) -> Self {
        Cell::Number(f64::from(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedPin {
    pub pin: String,
    pub reason: String,
    pub note: String,
}

/// Layout of the report, independent of the file format.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportTable {
    /// Sorted subject codes; each spans four columns.
    pub subjects: Vec<String>,
    pub columns: Vec<String>,
    /// One row per successful PIN, sorted by PIN.
    pub rows: Vec<Vec<Cell>>,
    /// Failed PINs, sorted by PIN.
    pub failed: Vec<FailedPin>,
}

impl ReportTable {
    pub fn from_records(records: &[ResultRecord]) -> Self {
        let mut sorted: Vec<&ResultRecord> = records.iter().collect();
        sorted.sort_by(|a, b| compare_pins(&a.pin, &b.pin));

        let successes: Vec<_> = sorted
            .iter()
            .filter_map(|r| match &r.outcome {
                PinOutcome::Success { result } => Some(result),
                PinOutcome::Failed { .. } => None,
            })
            .collect();

        let subjects: Vec<String> = successes
            .iter()
            .flat_map(|r| r.subjects.iter().map(|s| s.code.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut columns: Vec<String> = LEADING_COLUMNS.iter().map(|c| c.to_string()).collect();
        for code in &subjects {
            columns.extend(SUBJECT_SUFFIXES.iter().map(|suffix| format!("{code}_{suffix}")));
        }
        columns.extend(TRAILING_COLUMNS.iter().map(|c| c.to_string()));

        let rows = successes
            .iter()
            .enumerate()
            .map(|(i, result)| {
                let mut row = vec![
                    Cell::Number((i + 1) as f64),
                    Cell::from(result.pin.as_str()),
                    Cell::from(result.name.as_str()),
                ];
                for code in &subjects {
                    match result.subject(code) {
                        Some(mark) => row.extend([
                            Cell::from(mark.external),
                            Cell::from(mark.internal),
                            Cell::from(mark.total),
                            Cell::from(mark.result.as_str()),
                        ]),
                        None => row.extend([
                            Cell::from(0),
                            Cell::from(0),
                            Cell::from(0),
                            Cell::from("AB"),
                        ]),
                    }
                }
                row.push(Cell::from(result.total));
                row.push(Cell::from(result.overall.as_str()));
                row
            })
            .collect();

        let failed = sorted
            .iter()
            .filter_map(|r| match &r.outcome {
                PinOutcome::Failed { failure } => Some(FailedPin {
                    pin: r.pin.clone(),
                    reason: failure.code().to_string(),
                    note: failure.to_string(),
                }),
                PinOutcome::Success { .. } => None,
            })
            .collect();

        Self {
            subjects,
            columns,
            rows,
            failed,
        }
    }
}

/// Render `table` as an `.xlsx` workbook at `path`.
pub fn write_xlsx(table: &ReportTable, path: &Path) -> Result<(), ReportError> {
    let mut workbook = Workbook::new();
    let cell_format = Format::new().set_border(FormatBorder::Thin);
    let header_format = Format::new()
        .set_border(FormatBorder::Thin)
        .set_bold()
        .set_align(FormatAlign::Center);

    {
        let sheet = workbook.add_worksheet();
        sheet.set_name("Results")?;

        // Row 0: subject codes merged over their four columns.
        let trailing_start = LEADING_COLUMNS.len() + table.subjects.len() * SUBJECT_SUFFIXES.len();
        for col in (0..LEADING_COLUMNS.len()).chain(trailing_start..table.columns.len()) {
            sheet.write_blank(0, col as u16, &header_format)?;
        }
        for (i, code) in table.subjects.iter().enumerate() {
            let first = (LEADING_COLUMNS.len() + i * SUBJECT_SUFFIXES.len()) as u16;
            let last = first + SUBJECT_SUFFIXES.len() as u16 - 1;
            sheet.merge_range(0, first, 0, last, code, &header_format)?;
        }

        // Row 1: column headers.
        for (col, name) in table.columns.iter().enumerate() {
            sheet.write_string_with_format(1, col as u16, name, &header_format)?;
        }

        for (i, row) in table.rows.iter().enumerate() {
            let row_num = (i + 2) as u32;
            for (col, cell) in row.iter().enumerate() {
                match cell {
                    Cell::Text(text) => {
                        sheet.write_string_with_format(row_num, col as u16, text, &cell_format)?
                    }
                    Cell::Number(n) => {
                        sheet.write_number_with_format(row_num, col as u16, *n, &cell_format)?
                    }
                };
            }
        }
        sheet.set_column_width(2, 28)?;
    }

    {
        let sheet = workbook.add_worksheet();
        sheet.set_name("Failed PINs")?;
        for (col, name) in ["PIN", "REASON", "NOTE"].iter().enumerate() {
            sheet.write_string_with_format(0, col as u16, *name, &header_format)?;
        }
        for (i, failed) in table.failed.iter().enumerate() {
            let row_num = (i + 1) as u32;
            sheet.write_string_with_format(row_num, 0, &failed.pin, &cell_format)?;
            sheet.write_string_with_format(row_num, 1, &failed.reason, &cell_format)?;
            sheet.write_string_with_format(row_num, 2, &failed.note, &cell_format)?;
        }
        sheet.set_column_width(2, 48)?;
    }

    workbook.save(path)?;
    Ok(())
}

/// Writes job reports into a fixed directory.
#[derive(Debug, Clone)]
pub struct ReportBuilder {
    output_dir: PathBuf,
}

impl ReportBuilder {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn artifact_path(&self, job_id: JobId) -> PathBuf {
        self.output_dir.join(format!("{job_id}.xlsx"))
    }

    /// Build the report for `job_id`. Blocking; call from a blocking task.
    pub fn build(&self, job_id: JobId, records: &[ResultRecord]) -> Result<PathBuf, ReportError> {
        std::fs::create_dir_all(&self.output_dir)?;
        let table = ReportTable::from_records(records);
        let path = self.artifact_path(job_id);
        write_xlsx(&table, &path)?;
        info!(
            %job_id,
            students = table.rows.len(),
            failed = table.failed.len(),
            path = %path.display(),
            "Excel file created"
        );
        Ok(path)
    }
}
