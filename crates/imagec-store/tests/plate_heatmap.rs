//! Plate heatmap over a partly filled 96-well plate, written through the
//! scheduler's sink interface into an on-disk store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;

use imagec_engine::{
    ClassId, ClassRecord, ImageRecord, ImageStatsRow, ImageValidity, JobStart, JobStatus,
    MeasureChannel, MeasureKey, ObjectRow, PipelineRecord, PlaneStats, PlateRecord, ResultSink,
    Validity,
};
use imagec_store::{ColumnSpec, Format, ResultsSettings, Stat, Store, View, query, row_label};

const WELLS: [(u16, u16); 10] = [
    (1, 1),
    (1, 12),
    (2, 5),
    (3, 3),
    (4, 8),
    (5, 2),
    (6, 6),
    (7, 10),
    (8, 1),
    (8, 12),
];

fn job() -> JobStart {
    JobStart {
        name: "heatmap".to_owned(),
        settings_json: r#"{"projectSettings":{"imageSetup":{"pixelSize":0.5,"pixelSizeUnit":"µm"}}}"#
            .to_owned(),
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
    }
}

fn write_well(store: &Store, job_id: &str, image_id: u64, (row, col): (u16, u16)) {
    let label = format!("{}{col}", row_label(u32::from(row)));
    let image = ImageRecord {
        image_id,
        plate_id: 1,
        group_label: label.clone(),
        plate_row: row,
        plate_col: col,
        image_idx: 1,
        file_name: format!("screen_{label}_1.tif"),
        file_path: String::new(),
        width: 512,
        height: 512,
        validity: ImageValidity::VALID,
    };
    let objects: Vec<ObjectRow> = (0..u64::from(row))
        .map(|idx| ObjectRow {
            image_id,
            channel_id: 0,
            object_idx: idx,
            object_id: image_id * 1000 + idx + 1,
            tile_idx: -1,
            t_stack: 0,
            class_id: ClassId(1),
            parent_object_id: 0,
            tracking_id: 0,
            validity: Validity::VALID,
            measurements: BTreeMap::from([(MeasureKey::own(MeasureChannel::AreaSize), 100.0)]),
        })
        .collect();
    let stats = ImageStatsRow {
        image_id,
        channel_id: 0,
        tile_idx: -1,
        t_stack: 0,
        validity: ImageValidity::VALID,
        invalidate_all: false,
        control_image_path: None,
        intensity: PlaneStats::default(),
    };
    store.write_image(job_id, &image, &objects, &[stats]).unwrap();
}

#[test]
fn plate_heatmap_has_one_cell_per_well() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("results.icdb")).unwrap();
    let job_id = store.begin_job(&job()).unwrap();
    for (i, well) in WELLS.iter().enumerate() {
        write_well(&store, &job_id, u64::try_from(i).unwrap() + 1, *well);
    }
    store.finish_job(&job_id, JobStatus::Finished).unwrap();
    drop(store);

    let store = Store::open(&dir.path().join("results.icdb")).unwrap();
    let job = store.latest_job().unwrap();
    assert_eq!(job.job_id, job_id);
    let settings = ResultsSettings {
        columns: vec![
            ColumnSpec {
                class_id: ClassId(1),
                measure: MeasureChannel::AreaSize,
                cross_channel_c_stack: None,
                stat: Stat::Count,
            },
            ColumnSpec {
                class_id: ClassId(1),
                measure: MeasureChannel::AreaSize,
                cross_channel_c_stack: None,
                stat: Stat::Sum,
            },
        ],
        ..ResultsSettings::default()
    };
    let tables = query(&store, &job, &settings, View::Plate, Format::Heatmap).unwrap();
    assert_eq!(tables.len(), 2);

    let counts = &tables[0];
    assert_eq!(counts.rows.len(), 8);
    assert_eq!(counts.columns.len(), 12);
    assert_eq!(counts.filled(), 10, "numeric cells");
    assert_eq!(counts.rows[7].label, "H");
    assert_eq!(counts.columns[11].title, "12");
    for (row, col) in WELLS {
        let value = counts
            .get(usize::from(row) - 1, usize::from(col) - 1)
            .unwrap();
        assert!((value - f64::from(row)).abs() < 1e-9, "well {row}/{col}: {value}");
    }
    assert!(counts.get(0, 1).unwrap().is_nan());

    // 100 px² at 0.5 µm per pixel.
    let sums = &tables[1];
    assert!(sums.title.contains("µm²"), "title {}", sums.title);
    let a1 = sums.get(0, 0).unwrap();
    assert!((a1 - 25.0).abs() < 1e-9, "A1 area {a1}");
}
