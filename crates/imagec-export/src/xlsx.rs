//! XLSX serializer.
//!
//! Writes the minimal set of Office Open XML parts a spreadsheet needs:
//! content types, package and workbook relationships, the workbook, one
//! style sheet and one worksheet per [`Sheet`]. Strings are written
//! inline so no shared string table is needed.

use std::fmt::Write as _;
use std::io::{Seek, Write};

use imagec_store::row_label;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::error::ExportError;
use crate::workbook::{Cell, Sheet, Style, Workbook};

const XML_HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#;
const MAIN_NS: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";
const REL_NS: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
const PKG_REL_NS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";

/// Fonts: 0 regular, 1 bold. Fills: 0 none, 1 gray125 (reserved),
/// 2 grey, 3 light red. Cell formats are indexed by [`style_index`].
const STYLES: &str = r#"<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
<numFmts count="1"><numFmt numFmtId="164" formatCode="0.000"/></numFmts>
<fonts count="2"><font><sz val="11"/><name val="Calibri"/></font><font><b/><sz val="11"/><name val="Calibri"/></font></fonts>
<fills count="4"><fill><patternFill patternType="none"/></fill><fill><patternFill patternType="gray125"/></fill><fill><patternFill patternType="solid"><fgColor rgb="FFD9D9D9"/><bgColor indexed="64"/></patternFill></fill><fill><patternFill patternType="solid"><fgColor rgb="FFF4B6B6"/><bgColor indexed="64"/></patternFill></fill></fills>
<borders count="1"><border><left/><right/><top/><bottom/><diagonal/></border></borders>
<cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs>
<cellXfs count="5"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/><xf numFmtId="0" fontId="1" fillId="2" borderId="0" xfId="0" applyFont="1" applyFill="1"/><xf numFmtId="0" fontId="1" fillId="3" borderId="0" xfId="0" applyFont="1" applyFill="1"/><xf numFmtId="0" fontId="1" fillId="0" borderId="0" xfId="0" applyFont="1"/><xf numFmtId="164" fontId="0" fillId="0" borderId="0" xfId="0" applyNumberFormat="1"/></cellXfs>
<cellStyles count="1"><cellStyle name="Normal" xfId="0" builtinId="0"/></cellStyles>
</styleSheet>"#;

const fn style_index(style: Style) -> u8 {
    match style {
        Style::Normal => 0,
        Style::Header => 1,
        Style::InvalidHeader => 2,
        Style::Title => 3,
        Style::Number => 4,
    }
}

/// Serialize `workbook` into `writer` and return the writer.
///
/// Sheet names are normalized first (see [`Workbook::normalize_names`]).
///
/// # Errors
///
/// Returns [`ExportError::Empty`] for a workbook without sheets and
/// [`ExportError::Zip`] / [`ExportError::Io`] when writing fails.
pub fn write_xlsx<W: Write + Seek>(writer: W, workbook: &Workbook) -> Result<W, ExportError> {
    if workbook.sheets.is_empty() {
        return Err(ExportError::Empty);
    }
    let mut workbook = workbook.clone();
    workbook.normalize_names();

    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(writer);
    let mut part = |name: String, body: &str| -> Result<(), ExportError> {
        zip.start_file(name, options)?;
        zip.write_all(XML_HEADER.as_bytes())?;
        zip.write_all(b"\n")?;
        zip.write_all(body.as_bytes())?;
        Ok(())
    };

    let n = workbook.sheets.len();
    part("[Content_Types].xml".to_owned(), &content_types(n))?;
    part("_rels/.rels".to_owned(), &package_rels())?;
    part("xl/workbook.xml".to_owned(), &workbook_xml(&workbook))?;
    part("xl/_rels/workbook.xml.rels".to_owned(), &workbook_rels(n))?;
    part("xl/styles.xml".to_owned(), STYLES)?;
    for (i, sheet) in workbook.sheets.iter().enumerate() {
        part(format!("xl/worksheets/sheet{}.xml", i + 1), &worksheet_xml(sheet))?;
    }
    tracing::debug!(sheets = n, "xlsx written");
    Ok(zip.finish()?)
}

fn content_types(sheets: usize) -> String {
    let mut s = String::from(
        r#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/>"#,
    );
    for i in 1..=sheets {
        let _ = write!(
            s,
            r#"<Override PartName="/xl/worksheets/sheet{i}.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>"#
        );
    }
    s.push_str("</Types>");
    s
}

fn package_rels() -> String {
    format!(
        r#"<Relationships xmlns="{PKG_REL_NS}"><Relationship Id="rId1" Type="{REL_NS}/officeDocument" Target="xl/workbook.xml"/></Relationships>"#
    )
}

fn workbook_xml(workbook: &Workbook) -> String {
    let mut s = format!(r#"<workbook xmlns="{MAIN_NS}" xmlns:r="{REL_NS}"><sheets>"#);
    for (i, sheet) in workbook.sheets.iter().enumerate() {
        let id = i + 1;
        let _ = write!(
            s,
            r#"<sheet name="{}" sheetId="{id}" r:id="rId{id}"/>"#,
            escape(&sheet.name)
        );
    }
    s.push_str("</sheets></workbook>");
    s
}

fn workbook_rels(sheets: usize) -> String {
    let mut s = format!(r#"<Relationships xmlns="{PKG_REL_NS}">"#);
    for id in 1..=sheets {
        let _ = write!(
            s,
            r#"<Relationship Id="rId{id}" Type="{REL_NS}/worksheet" Target="worksheets/sheet{id}.xml"/>"#
        );
    }
    let _ = write!(
        s,
        r#"<Relationship Id="rId{}" Type="{REL_NS}/styles" Target="styles.xml"/></Relationships>"#,
        sheets + 1
    );
    s
}

fn worksheet_xml(sheet: &Sheet) -> String {
    let mut s = format!(
        r#"<worksheet xmlns="{MAIN_NS}"><cols><col min="1" max="1" width="{}" customWidth="1"/></cols><sheetData>"#,
        sheet.first_column_width
    );
    for (r, row) in sheet.rows.iter().enumerate() {
        let r = r + 1;
        if row.iter().all(|c| *c == Cell::Empty) {
            continue;
        }
        let _ = write!(s, r#"<row r="{r}">"#);
        for (c, cell) in row.iter().enumerate() {
            let reference = format!("{}{r}", column_name(c));
            match cell {
                Cell::Empty => {}
                Cell::Text(text, style) => {
                    let _ = write!(
                        s,
                        r#"<c r="{reference}" s="{}" t="inlineStr"><is><t xml:space="preserve">{}</t></is></c>"#,
                        style_index(*style),
                        escape(text)
                    );
                }
                Cell::Number(v) => {
                    let _ = write!(
                        s,
                        r#"<c r="{reference}" s="{}"><v>{v}</v></c>"#,
                        style_index(Style::Number)
                    );
                }
            }
        }
        s.push_str("</row>");
    }
    s.push_str("</sheetData></worksheet>");
    s
}

/// Spreadsheet column name of 0-based column `index`.
fn column_name(index: usize) -> String {
    row_label(u32::try_from(index + 1).unwrap_or(u32::MAX))
}

/// Escape text for XML content and attribute values. Control characters
/// XML 1.0 cannot carry are dropped.
fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\t' | '\n' | '\r' => out.push(c),
            c if c < ' ' => {}
            c => out.push(c),
        }
    }
    out
}
