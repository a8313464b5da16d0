use std::fs;
use std::mem;
use std::path::Path;

use anyhow::{Context, Result};

use crate::error::ReportFormatError;
use crate::model::{BuildingGroup, OrganizationRecord, ReportRow, Tags};
use crate::util::write_text_file;

pub const COLUMN_ID: &str = "id";
pub const COLUMN_KIND: &str = "type";
pub const COLUMN_INFO: &str = "info";
pub const COLUMN_ORG_COUNT: &str = "orgs_count";
pub const COLUMN_ORGS: &str = "orgs";

const REPORT_COLUMNS: [&str; 5] = [
    COLUMN_ID,
    COLUMN_KIND,
    COLUMN_INFO,
    COLUMN_ORG_COUNT,
    COLUMN_ORGS,
];

/// One row per group, in group order.
pub fn build_report(groups: Vec<BuildingGroup>) -> Vec<ReportRow> {
    groups
        .into_iter()
        .map(|group| ReportRow {
            id: group.id,
            kind: group.kind.as_str().to_string(),
            tags: group.tags,
            org_count: group.organizations.len(),
            organizations: group.organizations,
        })
        .collect()
}

pub fn write_report(path: &Path, rows: &[ReportRow]) -> Result<()> {
    let text = render_report_csv(rows)
        .with_context(|| format!("failed to render report: {}", path.display()))?;
    write_text_file(path, &text)
}

pub fn read_report(path: &Path) -> Result<Vec<ReportRow>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read report: {}", path.display()))?;
    parse_report_csv(&text).with_context(|| format!("failed to parse report: {}", path.display()))
}

/// Tags are written as one compact JSON object, organizations as one compact
/// JSON object per line inside a single quoted cell.
pub fn render_report_csv(rows: &[ReportRow]) -> Result<String, serde_json::Error> {
    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(REPORT_COLUMNS.join(","));

    for row in rows {
        let info = serde_json::to_string(&row.tags)?;
        let orgs = row
            .organizations
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<String>, _>>()?
            .join("\n");

        let cells = [
            row.id.to_string(),
            row.kind.clone(),
            info,
            row.org_count.to_string(),
            orgs,
        ];
        lines.push(
            cells
                .iter()
                .map(|cell| escape_csv_cell(cell))
                .collect::<Vec<String>>()
                .join(","),
        );
    }

    let mut text = lines.join("\n");
    text.push('\n');
    Ok(text)
}

/// Decodes a report, locating columns by header name.
pub fn parse_report_csv(text: &str) -> Result<Vec<ReportRow>, ReportFormatError> {
    let mut records = split_csv_records(text.trim_start_matches('\u{feff}'))?.into_iter();
    let header = records.next().ok_or(ReportFormatError::MissingHeader)?;
    let columns = ColumnPositions::from_header(&header)?;

    records
        .enumerate()
        .map(|(offset, record)| columns.decode(offset + 1, &record))
        .collect()
}

struct ColumnPositions {
    id: usize,
    kind: usize,
    info: usize,
    org_count: usize,
    orgs: usize,
}

impl ColumnPositions {
    fn from_header(header: &[String]) -> Result<Self, ReportFormatError> {
        let find = |name: &'static str| {
            header
                .iter()
                .position(|cell| cell.trim() == name)
                .ok_or(ReportFormatError::MissingColumn(name))
        };

        Ok(Self {
            id: find(COLUMN_ID)?,
            kind: find(COLUMN_KIND)?,
            info: find(COLUMN_INFO)?,
            org_count: find(COLUMN_ORG_COUNT)?,
            orgs: find(COLUMN_ORGS)?,
        })
    }

    fn decode(&self, record: usize, cells: &[String]) -> Result<ReportRow, ReportFormatError> {
        let fail = |reason: String| ReportFormatError::Record { record, reason };
        let cell = |index: usize, name: &str| {
            cells
                .get(index)
                .map(String::as_str)
                .ok_or_else(|| fail(format!("missing `{name}` cell")))
        };

        let id_raw = cell(self.id, COLUMN_ID)?;
        let id = id_raw
            .trim()
            .parse::<i64>()
            .map_err(|_| fail(format!("identifier `{id_raw}` is not an integer")))?;

        let kind = cell(self.kind, COLUMN_KIND)?.to_string();

        let info_raw = cell(self.info, COLUMN_INFO)?;
        let tags = if info_raw.trim().is_empty() {
            Tags::new()
        } else {
            serde_json::from_str::<Tags>(info_raw)
                .map_err(|err| fail(format!("invalid tag info: {err}")))?
        };

        let count_raw = cell(self.org_count, COLUMN_ORG_COUNT)?;
        let org_count = count_raw
            .trim()
            .parse::<usize>()
            .map_err(|_| fail(format!("organization count `{count_raw}` is not a number")))?;

        let organizations = cell(self.orgs, COLUMN_ORGS)?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                serde_json::from_str::<OrganizationRecord>(line)
                    .map_err(|err| fail(format!("invalid organization entry: {err}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ReportRow {
            id,
            kind,
            tags,
            org_count,
            organizations,
        })
    }
}

fn escape_csv_cell(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r')
    {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Splits delimited text into records, honoring quoted cells that span lines.
/// Blank lines are skipped.
fn split_csv_records(text: &str) -> Result<Vec<Vec<String>>, ReportFormatError> {
    let mut records = Vec::<Vec<String>>::new();
    let mut record = Vec::<String>::new();
    let mut cell = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    let mut finish_record = |record: &mut Vec<String>, cell: &mut String| {
        record.push(mem::take(cell));
        let done = mem::take(record);
        if !(done.len() == 1 && done[0].is_empty()) {
            records.push(done);
        }
    };

    while let Some(character) = chars.next() {
        if in_quotes {
            if character == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    cell.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                cell.push(character);
            }
            continue;
        }

        match character {
            '"' => in_quotes = true,
            ',' => record.push(mem::take(&mut cell)),
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                finish_record(&mut record, &mut cell);
            }
            '\n' => finish_record(&mut record, &mut cell),
            other => cell.push(other),
        }
    }

    if in_quotes {
        return Err(ReportFormatError::UnterminatedQuote);
    }
    if !record.is_empty() || !cell.is_empty() {
        finish_record(&mut record, &mut cell);
    }

    Ok(records)
}
