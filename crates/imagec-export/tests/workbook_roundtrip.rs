//! Export a queried list table and read the workbook back with calamine.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;

use calamine::{Data, Reader, Xlsx, open_workbook};
use imagec_engine::{
    ClassId, ClassRecord, ImageRecord, ImageValidity, JobStart, JobStatus, MeasureChannel,
    MeasureKey, ObjectRow, PipelineRecord, PlateRecord, ResultSink, Validity,
};
use imagec_export::{ExportKind, Exportable, export};
use imagec_store::{ColumnSpec, Format, ResultsSettings, Stat, Store, Table, View, query};

const SETTINGS: &str = r#"{
    "imagecMeta": { "swVersion": "1.0.0", "buildTime": "2026-01-01" },
    "projectSettings": {
        "experiment": { "experimentId": "EXP-7", "scientists": ["R. Doe"] },
        "plates": [{ "plateId": 1, "name": "screen" }]
    },
    "classification": { "classes": [{ "classId": 1, "name": "nucleus" }] }
}"#;

fn populated_store() -> Store {
    let store = Store::open_in_memory().unwrap();
    let job = JobStart {
        name: "export".to_owned(),
        settings_json: SETTINGS.to_owned(),
        classes: vec![ClassRecord {
            class_id: ClassId(1),
            name: "nucleus".to_owned(),
            color: String::new(),
        }],
        pipelines: vec![PipelineRecord {
            index: 0,
            name: "nuclei".to_owned(),
            default_class: ClassId(1),
            c_stack: 0,
        }],
        plates: vec![PlateRecord {
            plate_id: 1,
            name: "screen".to_owned(),
            rows: 8,
            cols: 12,
            well_image_order: vec![vec![1]],
        }],
    };
    let job_id = store.begin_job(&job).unwrap();
    for (image_id, (row, col, label, validity)) in [
        (1, 1, "A1", ImageValidity::VALID),
        (2, 3, "B3", ImageValidity::PARTIAL),
    ]
    .into_iter()
    .enumerate()
    {
        let image_id = u64::try_from(image_id).unwrap() + 1;
        let image = ImageRecord {
            image_id,
            plate_id: 1,
            group_label: label.to_owned(),
            plate_row: row,
            plate_col: col,
            image_idx: 1,
            file_name: format!("screen_{label}_1.tif"),
            file_path: String::new(),
            width: 64,
            height: 64,
            validity,
        };
        let objects: Vec<ObjectRow> = (0..2u64)
            .map(|idx| ObjectRow {
                image_id,
                channel_id: 0,
                object_idx: idx,
                object_id: image_id * 10 + idx + 1,
                tile_idx: -1,
                t_stack: 0,
                class_id: ClassId(1),
                parent_object_id: 0,
                tracking_id: 0,
                validity: Validity::VALID,
                measurements: BTreeMap::from([(
                    MeasureKey::own(MeasureChannel::AreaSize),
                    f64::from(u32::from(row)) * 10.0 + f64::from(u32::try_from(idx).unwrap()),
                )]),
            })
            .collect();
        store.write_image(&job_id, &image, &objects, &[]).unwrap();
    }
    store.finish_job(&job_id, JobStatus::Finished).unwrap();
    store
}

fn area_avg() -> ResultsSettings {
    ResultsSettings {
        columns: vec![ColumnSpec {
            class_id: ClassId(1),
            measure: MeasureChannel::AreaSize,
            cross_channel_c_stack: None,
            stat: Stat::Avg,
        }],
        ..ResultsSettings::default()
    }
}

fn cell_f64(data: Option<&Data>) -> f64 {
    match data {
        Some(Data::Float(v)) => *v,
        #[allow(clippy::cast_precision_loss)]
        Some(Data::Int(v)) => *v as f64,
        _ => f64::NAN,
    }
}

fn cell_str(data: Option<&Data>) -> String {
    match data {
        Some(Data::String(s)) => s.clone(),
        _ => String::new(),
    }
}

#[test]
fn list_export_reads_back_unchanged() {
    let store = populated_store();
    let job = store.latest_job().unwrap();
    let tables = query(&store, &job, &area_avg(), View::Plate, Format::List).unwrap();
    let table: &Table = &tables[0];

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("results.xlsx");
    let exportables: Vec<Exportable> = tables.iter().cloned().map(Exportable::from).collect();
    let written = export(&out, ExportKind::R, &job, &exportables).unwrap();
    assert_eq!(written.len(), 2);
    let script = std::fs::read_to_string(dir.path().join("results.R")).unwrap();
    assert!(script.contains("sheet = \"screen\""), "{script}");

    let mut workbook: Xlsx<_> = open_workbook(&out).unwrap();
    let names = workbook.sheet_names();
    assert_eq!(names, vec!["Meta".to_owned(), "screen".to_owned()]);

    let meta = workbook.worksheet_range("Meta").unwrap();
    let meta_text: Vec<String> = meta.rows().flatten().map(ToString::to_string).collect();
    for expected in ["1.0.0", "EXP-7", "R. Doe", "export", "nucleus"] {
        assert!(meta_text.iter().any(|t| t == expected), "meta lacks {expected}");
    }

    let sheet = workbook.worksheet_range("screen").unwrap();
    assert_eq!(cell_str(sheet.get_value((0, 0))), table.title);
    assert_eq!(cell_str(sheet.get_value((1, 0))), "Well");
    assert_eq!(cell_str(sheet.get_value((1, 1))), table.columns[0].label());
    for (r, row) in table.rows.iter().enumerate() {
        let sheet_row = u32::try_from(r).unwrap() + 2;
        assert_eq!(cell_str(sheet.get_value((sheet_row, 0))), row.label);
        let read = cell_f64(sheet.get_value((sheet_row, 1)));
        let expected = table.get(r, 0).unwrap();
        assert!((read - expected).abs() < 1e-9, "row {r}: {read} vs {expected}");
    }
    // B3 holds a partially processed image.
    assert!(table.rows[0].valid && !table.rows[1].valid);
}

#[test]
fn nan_cells_stay_empty() {
    let store = populated_store();
    let job = store.latest_job().unwrap();
    let tables = query(&store, &job, &area_avg(), View::Plate, Format::Heatmap).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("heatmap.xlsx");
    let exportables: Vec<Exportable> = tables.into_iter().map(Exportable::from).collect();
    export(&out, ExportKind::Xlsx, &job, &exportables).unwrap();
    assert!(!dir.path().join("heatmap.R").exists());

    let mut workbook: Xlsx<_> = open_workbook(&out).unwrap();
    let name = workbook.sheet_names()[1].clone();
    let sheet = workbook.worksheet_range(&name).unwrap();
    // A1 sits at sheet row 2, column 1; A2 is empty.
    assert!((cell_f64(sheet.get_value((2, 1))) - 10.5).abs() < 1e-9);
    assert!(matches!(sheet.get_value((2, 2)), None | Some(Data::Empty)));
    let numbers = sheet
        .rows()
        .flatten()
        .filter(|c| matches!(c, Data::Float(_) | Data::Int(_)))
        .count();
    assert_eq!(numbers, 2);
}
