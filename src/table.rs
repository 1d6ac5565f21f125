//! Directive tables: delimited text (CSV / semicolon separated) or JSON.
//!
//! Bad rows are collected as [`ShadeError::MalformedRow`] and the remaining
//! rows still load; only an unusable header fails the whole table.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::directive::{Directive, GroupKey};
use crate::error::{Result, ShadeError};

/// Header names of the four directive columns, matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableColumns {
    pub name: String,
    pub bearing: String,
    pub altitude: String,
    pub severity: String,
}

impl Default for TableColumns {
    fn default() -> Self {
        Self {
            name: "Bez".into(),
            bearing: "Azimut".into(),
            altitude: "Altitude".into(),
            severity: "Constant".into(),
        }
    }
}

/// Parsed directives plus the rows that were rejected.
#[derive(Debug, Default)]
pub struct DirectiveTable {
    pub directives: Vec<Directive>,
    pub rejected: Vec<ShadeError>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct JsonRow {
    label: String,
    bearing_deg: f64,
    altitude_deg: f64,
    severity_class: f64,
    #[serde(default)]
    group_key: Option<GroupKey>,
}

impl DirectiveTable {
    /// Parses delimited text with a header line.
    ///
    /// The delimiter is `;` unless the header holds more `,` than `;`. With
    /// `;` as delimiter a decimal comma is accepted in numeric cells. Cells
    /// may be double-quoted to hold the delimiter; `""` inside quotes is a
    /// literal quote. Rejected rows carry their 1-based line number.
    pub fn parse_delimited(text: &str, columns: &TableColumns) -> Result<Self> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line))
            .filter(|(_, line)| !line.trim().is_empty());

        let Some((_, header)) = lines.next() else {
            return Err(ShadeError::MalformedRow {
                row: 0,
                reason: "table is empty".into(),
            });
        };

        let delim = if header.matches(',').count() > header.matches(';').count() {
            ','
        } else {
            ';'
        };
        let headers: Vec<String> = split_row(header, delim)
            .into_iter()
            .map(|h| h.to_lowercase())
            .collect();
        let find = |name: &str| -> Result<usize> {
            let wanted = name.trim().to_lowercase();
            headers
                .iter()
                .position(|h| *h == wanted)
                .ok_or_else(|| ShadeError::MalformedRow {
                    row: 0,
                    reason: format!("missing column '{name}'"),
                })
        };
        let i_name = find(&columns.name)?;
        let i_bearing = find(&columns.bearing)?;
        let i_alt = find(&columns.altitude)?;
        let i_sev = find(&columns.severity)?;

        let mut table = DirectiveTable::default();
        for (line_no, line) in lines {
            let cells = split_row(line, delim);
            let cell = |i: usize| cells.get(i).map(String::as_str).unwrap_or("");

            let parsed = parse_row(
                cell(i_name),
                cell(i_bearing),
                cell(i_alt),
                cell(i_sev),
                columns,
            )
            .and_then(|(label, bearing, alt, class)| {
                Directive::new(label, bearing, alt, class).map_err(|e| e.to_string())
            });

            match parsed {
                Ok(d) => table.directives.push(d),
                Err(reason) => table.reject(line_no, reason),
            }
        }
        Ok(table)
    }

    /// Parses a JSON array of row objects:
    /// `{"label", "bearing_deg", "altitude_deg", "severity_class", "group_key"?}`.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let rows: Vec<serde_json::Value> = serde_json::from_str(text)?;
        let mut table = DirectiveTable::default();
        for (i, value) in rows.into_iter().enumerate() {
            let row = i + 1;
            let parsed = serde_json::from_value::<JsonRow>(value)
                .map_err(|e| e.to_string())
                .and_then(|r| {
                    let class = severity_from_f64(r.severity_class)?;
                    let key = r
                        .group_key
                        .unwrap_or_else(|| crate::directive::group_key_from_label(&r.label));
                    Directive::with_group_key(r.label, r.bearing_deg, r.altitude_deg, class, key)
                        .map_err(|e| e.to_string())
                });
            match parsed {
                Ok(d) => table.directives.push(d),
                Err(reason) => table.reject(row, reason),
            }
        }
        Ok(table)
    }

    pub fn bearings(&self) -> Vec<f64> {
        self.directives.iter().map(Directive::bearing_deg).collect()
    }

    fn reject(&mut self, row: usize, reason: String) {
        warn!(row, %reason, "rejected directive table row");
        self.rejected.push(ShadeError::MalformedRow { row, reason });
    }
}

/// Splits one line into trimmed cells, honouring double quotes.
fn split_row(line: &str, delim: char) -> Vec<String> {
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if quoted && chars.peek() == Some(&'"') => {
                cell.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            c if c == delim && !quoted => cells.push(std::mem::take(&mut cell).trim().to_string()),
            c => cell.push(c),
        }
    }
    cells.push(cell.trim().to_string());
    cells
}

fn parse_number(raw: &str, column: &str) -> std::result::Result<f64, String> {
    if raw.is_empty() {
        return Err(format!("missing value in column '{column}'"));
    }
    raw.replace(',', ".")
        .parse::<f64>()
        .map_err(|_| format!("column '{column}': '{raw}' is not a number"))
}

fn severity_from_f64(v: f64) -> std::result::Result<u32, String> {
    if v.is_finite() && v >= 1.0 && v.fract() == 0.0 && v <= f64::from(u32::MAX) {
        Ok(v as u32)
    } else {
        Err(format!("severity class must be a positive integer, got {v}"))
    }
}

fn parse_row(
    name: &str,
    bearing: &str,
    altitude: &str,
    severity: &str,
    columns: &TableColumns,
) -> std::result::Result<(String, f64, f64, u32), String> {
    if name.is_empty() {
        return Err(format!("missing value in column '{}'", columns.name));
    }
    let bearing = parse_number(bearing, &columns.bearing)?;
    let altitude = parse_number(altitude, &columns.altitude)?;
    let class = severity_from_f64(parse_number(severity, &columns.severity)?)?;
    Ok((name.to_string(), bearing, altitude, class))
}
