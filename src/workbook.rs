use calamine::{open_workbook, Data, Reader, SheetVisible, Xlsx};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::Command;

use crate::error::CoreError;
use crate::rubric::RangeCheck;

const SHEET_XML_MAX_BYTES: u64 = 8 * 1024 * 1024;

/// Coarse per-workbook summary, cheap enough for the interactive path.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub sheets: Vec<SheetSummary>,
    pub total_formula_count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetSummary {
    pub name: String,
    pub formula_count: usize,
}

/// Full structural extraction for one workbook. Serialized into the
/// formula_analysis cache and replaced wholesale on re-analysis.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkbookMap {
    pub sheets: Vec<SheetMap>,
    pub total_formula_count: usize,
    pub hidden_sheets: Vec<String>,
    pub has_pivot: bool,
    pub has_charts: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetMap {
    pub name: String,
    pub visible: bool,
    pub used_range: Option<String>,
    pub formula_count: usize,
    pub functions_used: Vec<String>,
    pub cells: Vec<FormulaCell>,
    /// Addresses of non-empty cells carrying a literal instead of a formula.
    pub hardcoded: Vec<String>,
    pub hidden_rows: Vec<u32>,
    pub hidden_cols: Vec<String>,
    /// Set when this sheet failed to parse; the rest of the map is still valid.
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FormulaCell {
    pub address: String,
    pub formula: String,
    pub value: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub pass: bool,
    pub detail: String,
}

/// Coarse pass: sheet names and formula counts only.
pub fn analyze(path: &Path) -> Result<Analysis, CoreError> {
    let mut wb: Xlsx<_> =
        open_workbook(path).map_err(|e: calamine::XlsxError| CoreError::WorkbookParse(e.to_string()))?;
    let names = wb.sheet_names().to_vec();
    let mut sheets = Vec::with_capacity(names.len());
    let mut total = 0usize;
    for name in names {
        let count = match wb.worksheet_formula(&name) {
            Ok(range) => range.rows().flatten().filter(|f| !f.is_empty()).count(),
            Err(_) => 0,
        };
        total += count;
        sheets.push(SheetSummary {
            name,
            formula_count: count,
        });
    }
    Ok(Analysis {
        sheets,
        total_formula_count: total,
    })
}

/// Full pass: formula cells, function sets, hidden structure, used
/// ranges, pivot/chart presence. Per-sheet failures are recorded on the
/// sheet entry; only a workbook that cannot be opened at all is an error.
pub fn formula_map(path: &Path) -> Result<WorkbookMap, CoreError> {
    let mut wb: Xlsx<_> =
        open_workbook(path).map_err(|e: calamine::XlsxError| CoreError::WorkbookParse(e.to_string()))?;

    let meta: Vec<(String, bool)> = wb
        .sheets_metadata()
        .iter()
        .map(|s| (s.name.clone(), s.visible == SheetVisible::Visible))
        .collect();
    let probe = probe_package(path);

    let fn_re = Regex::new(r"([A-Za-z][A-Za-z0-9.]*)\s*\(").expect("function regex");

    let mut sheets = Vec::with_capacity(meta.len());
    let mut hidden_sheets = Vec::new();
    let mut total = 0usize;

    for (name, visible) in meta {
        if !visible {
            hidden_sheets.push(name.clone());
        }

        let formulas = match wb.worksheet_formula(&name) {
            Ok(r) => r,
            Err(e) => {
                sheets.push(SheetMap {
                    name,
                    visible,
                    used_range: None,
                    formula_count: 0,
                    functions_used: Vec::new(),
                    cells: Vec::new(),
                    hardcoded: Vec::new(),
                    hidden_rows: Vec::new(),
                    hidden_cols: Vec::new(),
                    error: Some(e.to_string()),
                });
                continue;
            }
        };
        // A value-range failure degrades the map (no displayed values or
        // hardcoded detection) without dropping the sheet.
        let values = wb.worksheet_range(&name).ok();

        let mut cells = Vec::new();
        let mut formula_positions: BTreeSet<(u32, u32)> = BTreeSet::new();
        let mut functions: BTreeSet<String> = BTreeSet::new();
        if let Some((start_row, start_col)) = formulas.start() {
            for (r, row) in formulas.rows().enumerate() {
                for (c, formula) in row.iter().enumerate() {
                    if formula.is_empty() {
                        continue;
                    }
                    let abs_row = start_row + r as u32;
                    let abs_col = start_col + c as u32;
                    formula_positions.insert((abs_row, abs_col));
                    for cap in fn_re.captures_iter(formula) {
                        functions.insert(cap[1].to_ascii_uppercase());
                    }
                    let value = values
                        .as_ref()
                        .and_then(|v| v.get_value((abs_row, abs_col)))
                        .filter(|d| !matches!(d, Data::Empty))
                        .map(|d| d.to_string());
                    cells.push(FormulaCell {
                        address: cell_address(abs_row, abs_col),
                        formula: formula.clone(),
                        value,
                    });
                }
            }
        }

        let mut hardcoded = Vec::new();
        let used_range = values.as_ref().and_then(|v| {
            let (sr, sc) = v.start()?;
            let (er, ec) = v.end()?;
            Some(format!(
                "{}:{}",
                cell_address(sr, sc),
                cell_address(er, ec)
            ))
        });
        if let Some(v) = &values {
            if let Some((sr, sc)) = v.start() {
                for (r, row) in v.rows().enumerate() {
                    for (c, data) in row.iter().enumerate() {
                        if matches!(data, Data::Empty) {
                            continue;
                        }
                        let pos = (sr + r as u32, sc + c as u32);
                        if !formula_positions.contains(&pos) {
                            hardcoded.push(cell_address(pos.0, pos.1));
                        }
                    }
                }
            }
        }

        let formula_count = cells.len();
        total += formula_count;
        let (hidden_rows, hidden_cols) = probe
            .as_ref()
            .map(|p| p.hidden_for(&name))
            .unwrap_or_default();
        sheets.push(SheetMap {
            name,
            visible,
            used_range,
            formula_count,
            functions_used: functions.into_iter().collect(),
            cells,
            hardcoded,
            hidden_rows,
            hidden_cols,
            error: None,
        });
    }

    let (has_pivot, has_charts) = probe
        .as_ref()
        .map(|p| (p.has_pivot, p.has_charts))
        .unwrap_or((false, false));

    Ok(WorkbookMap {
        sheets,
        total_formula_count: total,
        hidden_sheets,
        has_pivot,
        has_charts,
    })
}

/// Evaluate rubric range checks against an extracted map. Pure read.
pub fn run_checks(map: &WorkbookMap, checks: &[RangeCheck]) -> Vec<CheckResult> {
    checks.iter().map(|c| run_check(map, c)).collect()
}

fn run_check(map: &WorkbookMap, check: &RangeCheck) -> CheckResult {
    match check {
        RangeCheck::MustContainFormulas { sheet, range } => {
            with_sheet(map, sheet.as_deref(), |s| {
                let ((r1, c1), (r2, c2)) = match parse_range(range) {
                    Ok(v) => v,
                    Err(e) => return fail(format!("bad range {}: {}", range, e)),
                };
                let have: BTreeSet<(u32, u32)> = s
                    .cells
                    .iter()
                    .filter_map(|cell| parse_cell(&cell.address).ok())
                    .collect();
                let mut missing = Vec::new();
                for row in r1..=r2 {
                    for col in c1..=c2 {
                        if !have.contains(&(row, col)) {
                            missing.push(cell_address(row, col));
                        }
                    }
                }
                if missing.is_empty() {
                    pass(format!("{}!{} contains formulas throughout", s.name, range))
                } else {
                    fail(format!(
                        "{}!{}: no formula in {}",
                        s.name,
                        range,
                        join_limited(&missing, 8)
                    ))
                }
            })
        }
        RangeCheck::MustNotBeHardcoded { sheet, range } => {
            with_sheet(map, sheet.as_deref(), |s| {
                let ((r1, c1), (r2, c2)) = match parse_range(range) {
                    Ok(v) => v,
                    Err(e) => return fail(format!("bad range {}: {}", range, e)),
                };
                let offenders: Vec<String> = s
                    .hardcoded
                    .iter()
                    .filter(|addr| {
                        parse_cell(addr)
                            .map(|(r, c)| r >= r1 && r <= r2 && c >= c1 && c <= c2)
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect();
                if offenders.is_empty() {
                    pass(format!("{}!{} has no hardcoded values", s.name, range))
                } else {
                    fail(format!(
                        "{}!{}: hardcoded value in {}",
                        s.name,
                        range,
                        join_limited(&offenders, 8)
                    ))
                }
            })
        }
        RangeCheck::MustUseFunction {
            sheet,
            range,
            function,
        } => with_sheet(map, sheet.as_deref(), |s| {
            let ((r1, c1), (r2, c2)) = match parse_range(range) {
                Ok(v) => v,
                Err(e) => return fail(format!("bad range {}: {}", range, e)),
            };
            let wanted = function.to_ascii_uppercase();
            let fn_re = Regex::new(r"([A-Za-z][A-Za-z0-9.]*)\s*\(").expect("function regex");
            let found = s.cells.iter().any(|cell| {
                let Ok((r, c)) = parse_cell(&cell.address) else {
                    return false;
                };
                if r < r1 || r > r2 || c < c1 || c > c2 {
                    return false;
                }
                fn_re
                    .captures_iter(&cell.formula)
                    .any(|cap| cap[1].to_ascii_uppercase() == wanted)
            });
            if found {
                pass(format!("{}!{} uses {}", s.name, range, wanted))
            } else {
                fail(format!("{}!{}: no use of {}", s.name, range, wanted))
            }
        }),
        RangeCheck::MustHavePivot => {
            if map.has_pivot {
                pass("workbook contains a pivot table".to_string())
            } else {
                fail("workbook contains no pivot table".to_string())
            }
        }
    }
}

fn with_sheet<F>(map: &WorkbookMap, sheet: Option<&str>, f: F) -> CheckResult
where
    F: FnOnce(&SheetMap) -> CheckResult,
{
    let found = match sheet {
        Some(name) => map.sheets.iter().find(|s| s.name == name),
        None => map.sheets.iter().find(|s| s.visible),
    };
    match found {
        Some(s) if s.error.is_none() => f(s),
        Some(s) => fail(format!(
            "sheet {} could not be analyzed: {}",
            s.name,
            s.error.as_deref().unwrap_or("unknown")
        )),
        None => fail(match sheet {
            Some(name) => format!("sheet {} not found", name),
            None => "workbook has no visible sheet".to_string(),
        }),
    }
}

fn pass(detail: String) -> CheckResult {
    CheckResult { pass: true, detail }
}

fn fail(detail: String) -> CheckResult {
    CheckResult {
        pass: false,
        detail,
    }
}

fn join_limited(items: &[String], limit: usize) -> String {
    if items.len() <= limit {
        items.join(", ")
    } else {
        format!(
            "{} and {} more",
            items[..limit].join(", "),
            items.len() - limit
        )
    }
}

/// Render a PDF preview next to the workbook via headless LibreOffice.
/// Best-effort; the caller treats failure as a warning, not an error.
pub fn render_preview(path: &Path) -> anyhow::Result<String> {
    let out_dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("file has no parent directory"))?;
    let output = Command::new("soffice")
        .arg("--headless")
        .arg("--convert-to")
        .arg("pdf")
        .arg(path)
        .arg("--outdir")
        .arg(out_dir)
        .output()
        .map_err(|e| anyhow::anyhow!("failed to run libreoffice: {}", e))?;
    if !output.status.success() {
        anyhow::bail!(
            "libreoffice failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    let stem = path
        .file_stem()
        .ok_or_else(|| anyhow::anyhow!("file has no stem"))?
        .to_string_lossy();
    Ok(format!("{}.pdf", stem))
}

// ---- xlsx package structure ----
//
// calamine exposes sheet visibility but not pivot caches, chart parts,
// or row/column hiding, so those come from the OOXML package directly.

struct PackageProbe {
    has_pivot: bool,
    has_charts: bool,
    /// sheet name -> (hidden 1-based row numbers, hidden column letters)
    hidden: HashMap<String, (Vec<u32>, Vec<String>)>,
}

impl PackageProbe {
    fn hidden_for(&self, sheet: &str) -> (Vec<u32>, Vec<String>) {
        self.hidden.get(sheet).cloned().unwrap_or_default()
    }
}

fn probe_package(path: &Path) -> Option<PackageProbe> {
    let file = File::open(path).ok()?;
    let mut archive = zip::ZipArchive::new(file).ok()?;

    let entry_names: Vec<String> = (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok().map(|e| e.name().to_string()))
        .collect();
    let has_pivot = entry_names
        .iter()
        .any(|n| n.starts_with("xl/pivotTables/") || n.starts_with("xl/pivotCache/"));
    let has_charts = entry_names.iter().any(|n| n.starts_with("xl/charts/"));

    let workbook_xml = read_entry(&mut archive, "xl/workbook.xml")?;
    let rels_xml = read_entry(&mut archive, "xl/_rels/workbook.xml.rels")?;

    // Attribute order inside the tags is not fixed; pull each attribute
    // out of the captured tag separately.
    let sheet_tag_re = Regex::new(r"<sheet\b[^>]*/?>").ok()?;
    let rel_tag_re = Regex::new(r"<Relationship\b[^>]*/?>").ok()?;
    let name_re = Regex::new(r#"\bname="([^"]*)""#).ok()?;
    let rid_re = Regex::new(r#"\br:id="([^"]*)""#).ok()?;
    let id_re = Regex::new(r#"\bId="([^"]*)""#).ok()?;
    let target_re = Regex::new(r#"\bTarget="([^"]*)""#).ok()?;

    let mut rid_to_target = HashMap::new();
    for tag in rel_tag_re.find_iter(&rels_xml) {
        let tag = tag.as_str();
        if let (Some(id), Some(target)) = (
            id_re.captures(tag).map(|c| c[1].to_string()),
            target_re.captures(tag).map(|c| c[1].to_string()),
        ) {
            rid_to_target.insert(id, target);
        }
    }

    let row_tag_re = Regex::new(r"<row\b[^>]*>").ok()?;
    let col_tag_re = Regex::new(r"<col\b[^>]*/?>").ok()?;
    let hidden_re = Regex::new(r#"\bhidden="(?:1|true)""#).ok()?;
    let r_re = Regex::new(r#"\br="(\d+)""#).ok()?;
    let min_re = Regex::new(r#"\bmin="(\d+)""#).ok()?;
    let max_re = Regex::new(r#"\bmax="(\d+)""#).ok()?;

    let mut hidden = HashMap::new();
    for tag in sheet_tag_re.find_iter(&workbook_xml) {
        let tag = tag.as_str();
        let Some(name) = name_re.captures(tag).map(|c| c[1].to_string()) else {
            continue;
        };
        let Some(rid) = rid_re.captures(tag).map(|c| c[1].to_string()) else {
            continue;
        };
        let Some(target) = rid_to_target.get(&rid) else {
            continue;
        };
        let entry = if target.starts_with('/') {
            target.trim_start_matches('/').to_string()
        } else {
            format!("xl/{}", target)
        };
        let Some(sheet_xml) = read_entry(&mut archive, &entry) else {
            continue;
        };

        let mut rows = Vec::new();
        for row_tag in row_tag_re.find_iter(&sheet_xml) {
            let row_tag = row_tag.as_str();
            if hidden_re.is_match(row_tag) {
                if let Some(n) = r_re
                    .captures(row_tag)
                    .and_then(|c| c[1].parse::<u32>().ok())
                {
                    rows.push(n);
                }
            }
        }
        let mut cols = Vec::new();
        for col_tag in col_tag_re.find_iter(&sheet_xml) {
            let col_tag = col_tag.as_str();
            if hidden_re.is_match(col_tag) {
                let min = min_re
                    .captures(col_tag)
                    .and_then(|c| c[1].parse::<u32>().ok());
                let max = max_re
                    .captures(col_tag)
                    .and_then(|c| c[1].parse::<u32>().ok());
                if let (Some(min), Some(max)) = (min, max) {
                    for c in min..=max.min(min + 64) {
                        cols.push(col_letters(c - 1));
                    }
                }
            }
        }
        hidden.insert(name, (rows, cols));
    }

    Some(PackageProbe {
        has_pivot,
        has_charts,
        hidden,
    })
}

fn read_entry(archive: &mut zip::ZipArchive<File>, name: &str) -> Option<String> {
    let mut s = String::new();
    archive
        .by_name(name)
        .ok()?
        .take(SHEET_XML_MAX_BYTES)
        .read_to_string(&mut s)
        .ok()?;
    Some(s)
}

// ---- A1 addressing ----

/// 0-based column index to letters: 0 -> A, 27 -> AB.
pub fn col_letters(mut col: u32) -> String {
    let mut s = String::new();
    loop {
        s.insert(0, (b'A' + (col % 26) as u8) as char);
        if col < 26 {
            break;
        }
        col = col / 26 - 1;
    }
    s
}

/// 0-based (row, col) to an A1 address.
pub fn cell_address(row: u32, col: u32) -> String {
    format!("{}{}", col_letters(col), row + 1)
}

/// A1 address to 0-based (row, col).
pub fn parse_cell(addr: &str) -> anyhow::Result<(u32, u32)> {
    let addr = addr.trim().trim_start_matches('$');
    let letters: String = addr
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    let rest: String = addr
        .chars()
        .skip(letters.len())
        .map(|c| if c == '$' { ' ' } else { c })
        .collect();
    let digits = rest.trim();
    if letters.is_empty() || digits.is_empty() {
        anyhow::bail!("malformed cell address: {}", addr);
    }
    let mut col: u32 = 0;
    for ch in letters.chars() {
        col = col * 26 + (ch.to_ascii_uppercase() as u32 - 'A' as u32 + 1);
    }
    let row: u32 = digits.parse()?;
    if row == 0 {
        anyhow::bail!("row numbers are 1-based: {}", addr);
    }
    Ok((row - 1, col - 1))
}

/// "B2:B10" (or a single cell) to inclusive 0-based corners.
pub fn parse_range(range: &str) -> anyhow::Result<((u32, u32), (u32, u32))> {
    let mut parts = range.splitn(2, ':');
    let first = parts.next().unwrap_or_default();
    let start = parse_cell(first)?;
    let end = match parts.next() {
        Some(second) => parse_cell(second)?,
        None => start,
    };
    if end.0 < start.0 || end.1 < start.1 {
        anyhow::bail!("inverted range: {}", range);
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a1_round_trips() {
        assert_eq!(cell_address(0, 0), "A1");
        assert_eq!(cell_address(4, 1), "B5");
        assert_eq!(col_letters(26), "AA");
        assert_eq!(parse_cell("B5").unwrap(), (4, 1));
        assert_eq!(parse_cell("AA10").unwrap(), (9, 26));
        assert!(parse_cell("5B").is_err());
    }

    #[test]
    fn ranges_parse_inclusive() {
        assert_eq!(parse_range("B2:B10").unwrap(), ((1, 1), (9, 1)));
        assert_eq!(parse_range("C3").unwrap(), ((2, 2), (2, 2)));
        assert!(parse_range("B10:B2").is_err());
    }
}
