//! Companion R script for an exported workbook.
//!
//! The script loads every sheet with `readxl` into a data frame named
//! after the sheet.

use std::fmt::Write as _;

use crate::workbook::Workbook;

/// R identifier for a sheet title: lower case, runs of other characters
/// become `_`, and a leading digit gets an `x` prefix.
#[must_use]
pub fn frame_name(title: &str) -> String {
    let mut name = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            name.push(c.to_ascii_lowercase());
        } else if !name.ends_with('_') {
            name.push('_');
        }
    }
    let name = name.trim_matches('_');
    match name.chars().next() {
        None => "sheet".to_owned(),
        Some(c) if c.is_ascii_digit() => format!("x{name}"),
        Some(_) => name.to_owned(),
    }
}

fn r_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Script reading `workbook_file` (relative to the script) back. Sheet
/// names must already be normalized; the meta sheet is read without
/// column names, result sheets skip their title row.
#[must_use]
pub fn r_script(workbook_file: &str, workbook: &Workbook) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "# Loads the sheets of {workbook_file} into data frames.");
    let _ = writeln!(s, "library(readxl)");
    let _ = writeln!(s);
    let _ = writeln!(s, "path <- {}", r_string(workbook_file));
    let mut used: Vec<String> = Vec::new();
    for (i, sheet) in workbook.sheets.iter().enumerate() {
        let mut name = frame_name(&sheet.name);
        if used.contains(&name) {
            name = format!("{name}_{}", i + 1);
        }
        let read = if i == 0 {
            format!("read_excel(path, sheet = {}, col_names = FALSE)", r_string(&sheet.name))
        } else {
            format!("read_excel(path, sheet = {}, skip = 1)", r_string(&sheet.name))
        };
        let _ = writeln!(s, "{name} <- {read}");
        used.push(name);
    }
    s
}
