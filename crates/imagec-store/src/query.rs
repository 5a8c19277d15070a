//! Query layer: turns stored objects into list and heatmap tables.
//!
//! A query is scoped to one plate of one job and narrowed by
//! [`ResultsFilter`]. Only objects with validity `VALID` count, and images
//! whose statistics carry `invalidate_all` are left out entirely.
//!
//! | view  | list                    | heatmap                            |
//! |-------|-------------------------|------------------------------------|
//! | plate | one row per well        | `rows × cols` grid of wells        |
//! | well  | one row per image       | the plate's well image order grid  |
//! | image | one row per object      | density map of the image           |

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use imagec_engine::{ClassId, ImageValidity, MeasureChannel, MeasureKey};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::schema::from_sql_id;
use crate::store::{JobInfo, Store};
use crate::table::{ColumnHeader, RowHeader, Stat, Table, row_label};

/// Level of detail of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum View {
    #[default]
    Plate,
    Well,
    Image,
}

/// Shape of the produced tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Format {
    #[default]
    List,
    Heatmap,
}

/// Which part of the job a query looks at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResultsFilter {
    pub plate_id: u16,
    /// Well label such as `B3`, or a 1-based well number counted row by row.
    pub group: Option<String>,
    /// File name or numeric image id.
    pub image: Option<String>,
    pub t_stack: Option<i32>,
}

impl Default for ResultsFilter {
    fn default() -> Self {
        Self {
            plate_id: 1,
            group: None,
            image: None,
            t_stack: None,
        }
    }
}

impl FromStr for ResultsFilter {
    type Err = StoreError;

    /// `<plate> <group> [<t>] [<image>]`. With three tokens a numeric third
    /// token is the t-stack, anything else the image.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        let bad = || {
            StoreError::Filter(format!(
                "expected \"<plate> <group> [<t>] [<image>]\", got {s:?}"
            ))
        };
        let (&plate, rest) = tokens.split_first().ok_or_else(bad)?;
        if rest.len() > 3 {
            return Err(bad());
        }
        let plate_id = plate.parse().map_err(|_| bad())?;
        let group = rest.first().map(|g| (*g).to_owned());
        let (t_stack, image) = match rest.get(1..).unwrap_or_default() {
            [] => (None, None),
            [one] => match one.parse::<i32>() {
                Ok(t) => (Some(t), None),
                Err(_) => (None, Some((*one).to_owned())),
            },
            [t, image] => (
                Some(t.parse().map_err(|_| bad())?),
                Some((*image).to_owned()),
            ),
            _ => return Err(bad()),
        };
        Ok(Self {
            plate_id,
            group,
            image,
            t_stack,
        })
    }
}

/// One requested column: a measurement of a class, aggregated by `stat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSpec {
    pub class_id: ClassId,
    pub measure: MeasureChannel,
    /// Read the cross-channel value measured in this c-stack instead of
    /// the pipeline's own plane.
    #[serde(default)]
    pub cross_channel_c_stack: Option<i32>,
    #[serde(default)]
    pub stat: Stat,
}

impl ColumnSpec {
    #[must_use]
    pub fn key(&self) -> MeasureKey {
        self.cross_channel_c_stack.map_or_else(
            || MeasureKey::own(self.measure),
            |c| MeasureKey::cross(self.measure, c),
        )
    }
}

/// Column selection and layout of an export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResultsSettings {
    pub filter: ResultsFilter,
    pub columns: Vec<ColumnSpec>,
    /// Edge length of a density map cell in pixels.
    pub density_map_size: u32,
}

impl Default for ResultsSettings {
    fn default() -> Self {
        Self {
            filter: ResultsFilter::default(),
            columns: Vec::new(),
            density_map_size: 200,
        }
    }
}

impl ResultsSettings {
    /// # Errors
    ///
    /// Returns [`StoreError::Json`] for malformed settings.
    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Plate layout as stored with the job.
#[derive(Debug, Clone)]
struct Plate {
    name: String,
    rows: u16,
    cols: u16,
    well_image_order: Vec<Vec<u32>>,
}

#[derive(Debug, Clone)]
struct ImageInfo {
    image_id: u64,
    group_label: String,
    plate_row: u16,
    plate_col: u16,
    image_idx: u32,
    file_name: String,
    width: u32,
    height: u32,
    validity: ImageValidity,
}

/// One measured value of one object.
#[derive(Debug, Clone, Copy)]
struct Sample {
    image_id: u64,
    object_id: u64,
    value: f64,
    center: Option<(f64, f64)>,
}

/// Run a query against `job`. List views yield one table; heatmaps yield
/// one table per requested column.
///
/// # Errors
///
/// Returns [`StoreError::Filter`] when the filter names a plate, well or
/// image the job does not have, or when the view needs a well or an image
/// and none is given.
pub fn query(
    store: &Store,
    job: &JobInfo,
    settings: &ResultsSettings,
    view: View,
    format: Format,
) -> Result<Vec<Table>, StoreError> {
    let conn = store.conn();
    let filter = &settings.filter;
    let plate = load_plate(&conn, &job.job_id, filter.plate_id)?;
    let images = load_images(&conn, &job.job_id, filter.plate_id)?;
    let classes = load_classes(&conn, &job.job_id)?;
    let mut samples = Vec::with_capacity(settings.columns.len());
    for column in &settings.columns {
        samples.push(load_samples(&conn, &job.job_id, filter, column)?);
    }
    drop(conn);

    let setup = &job.settings.project_settings.image_setup;
    let units = Units {
        pixel_size: setup.pixel_size,
        unit: setup.pixel_size_unit.clone(),
    };
    let headers: Vec<ColumnHeader> = settings
        .columns
        .iter()
        .map(|c| units.header(c, &classes, view == View::Image && format == Format::List))
        .collect();
    let samples: Vec<Vec<Sample>> = samples
        .into_iter()
        .zip(&settings.columns)
        .map(|(s, c)| units.scale(c.measure, s))
        .collect();

    let ctx = QueryContext {
        plate,
        images,
        filter,
        columns: &settings.columns,
        headers,
        samples,
    };
    tracing::debug!(?view, ?format, columns = settings.columns.len(), "query");
    match (view, format) {
        (View::Plate, Format::List) => Ok(vec![ctx.plate_list()]),
        (View::Well, Format::List) => Ok(vec![ctx.well_list()?]),
        (View::Image, Format::List) => Ok(vec![ctx.image_list()?]),
        (View::Plate, Format::Heatmap) => Ok(ctx.plate_heatmaps()),
        (View::Well, Format::Heatmap) => ctx.well_heatmaps(),
        (View::Image, Format::Heatmap) => ctx.density_maps(settings.density_map_size),
    }
}

struct Units {
    pixel_size: f64,
    unit: String,
}

impl Units {
    /// Multiplier and unit of `channel` in physical units.
    fn of(&self, channel: MeasureChannel) -> (f64, String) {
        match channel.unit() {
            "px" => (self.pixel_size, self.unit.clone()),
            "px²" => (self.pixel_size * self.pixel_size, format!("{}²", self.unit)),
            other => (1.0, other.to_owned()),
        }
    }

    fn header(
        &self,
        column: &ColumnSpec,
        classes: &BTreeMap<ClassId, String>,
        raw: bool,
    ) -> ColumnHeader {
        let class = classes
            .get(&column.class_id)
            .cloned()
            .unwrap_or_else(|| column.class_id.to_string());
        let title = if raw {
            format!("{class} {}", column.key())
        } else {
            format!("{class} {} ({})", column.key(), column.stat.name())
        };
        ColumnHeader {
            title,
            unit: self.of(column.measure).1,
        }
    }

    fn scale(&self, channel: MeasureChannel, mut samples: Vec<Sample>) -> Vec<Sample> {
        let (factor, _) = self.of(channel);
        for s in &mut samples {
            s.value *= factor;
        }
        samples
    }
}

struct QueryContext<'a> {
    plate: Plate,
    images: Vec<ImageInfo>,
    filter: &'a ResultsFilter,
    columns: &'a [ColumnSpec],
    headers: Vec<ColumnHeader>,
    samples: Vec<Vec<Sample>>,
}

impl QueryContext<'_> {
    /// Values of column `col` taken from `images`.
    fn values_in(&self, col: usize, images: &BTreeSet<u64>) -> Vec<f64> {
        self.samples[col]
            .iter()
            .filter(|s| images.contains(&s.image_id))
            .map(|s| s.value)
            .collect()
    }

    /// Images grouped by well position.
    fn wells(&self) -> BTreeMap<(u16, u16), Vec<&ImageInfo>> {
        let mut wells: BTreeMap<(u16, u16), Vec<&ImageInfo>> = BTreeMap::new();
        for image in &self.images {
            wells
                .entry((image.plate_row, image.plate_col))
                .or_default()
                .push(image);
        }
        wells
    }

    fn group_label(&self) -> Result<String, StoreError> {
        let group = self
            .filter
            .group
            .as_deref()
            .ok_or_else(|| StoreError::Filter("this view needs a well".to_owned()))?;
        let Ok(n) = group.parse::<u32>() else {
            return Ok(group.to_ascii_uppercase());
        };
        let cols = u32::from(self.plate.cols.max(1));
        if n == 0 || n > cols * u32::from(self.plate.rows) {
            return Err(StoreError::Filter(format!("well number {n} is not on the plate")));
        }
        Ok(format!("{}{}", row_label((n - 1) / cols + 1), (n - 1) % cols + 1))
    }

    /// Images of the filtered well, ordered by image number.
    fn group_images(&self) -> Result<(String, Vec<&ImageInfo>), StoreError> {
        let label = self.group_label()?;
        let mut images: Vec<&ImageInfo> = self
            .images
            .iter()
            .filter(|i| i.group_label.eq_ignore_ascii_case(&label))
            .collect();
        if images.is_empty() {
            return Err(StoreError::Filter(format!("no images in well {label}")));
        }
        images.sort_by_key(|i| i.image_idx);
        Ok((label, images))
    }

    fn image(&self) -> Result<&ImageInfo, StoreError> {
        let (_, images) = self.group_images()?;
        let wanted = self
            .filter
            .image
            .as_deref()
            .ok_or_else(|| StoreError::Filter("this view needs an image".to_owned()))?;
        images
            .into_iter()
            .find(|i| {
                i.file_name == wanted || wanted.parse::<u64>().is_ok_and(|id| id == i.image_id)
            })
            .ok_or_else(|| StoreError::Filter(format!("no image {wanted:?} in the well")))
    }

    fn plate_list(&self) -> Table {
        let wells = self.wells();
        let rows = wells
            .values()
            .map(|images| RowHeader {
                label: images[0].group_label.clone(),
                valid: images.iter().all(|i| i.validity.is_valid()),
            })
            .collect();
        let mut table = Table::new(self.plate_title(), "Well", self.headers.clone(), rows);
        for (r, images) in wells.values().enumerate() {
            let ids: BTreeSet<u64> = images.iter().map(|i| i.image_id).collect();
            for (c, column) in self.columns.iter().enumerate() {
                table.set(r, c, column.stat.apply(&self.values_in(c, &ids)));
            }
        }
        table
    }

    fn well_list(&self) -> Result<Table, StoreError> {
        let (label, images) = self.group_images()?;
        let rows = images
            .iter()
            .map(|i| RowHeader {
                label: i.file_name.clone(),
                valid: i.validity.is_valid(),
            })
            .collect();
        let mut table = Table::new(format!("Well {label}"), "Image", self.headers.clone(), rows);
        for (r, image) in images.iter().enumerate() {
            let ids = BTreeSet::from([image.image_id]);
            for (c, column) in self.columns.iter().enumerate() {
                table.set(r, c, column.stat.apply(&self.values_in(c, &ids)));
            }
        }
        Ok(table)
    }

    fn image_list(&self) -> Result<Table, StoreError> {
        let image = self.image()?;
        let objects: BTreeSet<u64> = self
            .samples
            .iter()
            .flatten()
            .filter(|s| s.image_id == image.image_id)
            .map(|s| s.object_id)
            .collect();
        let index: BTreeMap<u64, usize> =
            objects.iter().enumerate().map(|(i, o)| (*o, i)).collect();
        let rows = objects.iter().map(|o| RowHeader::new(o.to_string())).collect();
        let mut table = Table::new(image.file_name.clone(), "Object", self.headers.clone(), rows);
        for (c, samples) in self.samples.iter().enumerate() {
            for s in samples.iter().filter(|s| s.image_id == image.image_id) {
                if let Some(&r) = index.get(&s.object_id) {
                    table.set(r, c, s.value);
                }
            }
        }
        Ok(table)
    }

    fn plate_heatmaps(&self) -> Vec<Table> {
        let wells = self.wells();
        let rows: Vec<RowHeader> = (1..=u32::from(self.plate.rows))
            .map(|r| RowHeader::new(row_label(r)))
            .collect();
        self.columns
            .iter()
            .enumerate()
            .map(|(c, column)| {
                let mut table = Table::new(
                    self.headers[c].label(),
                    "",
                    numbered_columns(usize::from(self.plate.cols)),
                    rows.clone(),
                );
                for (&(row, col), images) in &wells {
                    let ids: BTreeSet<u64> = images.iter().map(|i| i.image_id).collect();
                    // Positions are 1-based; 0 means the file name had none.
                    if let (Some(r), Some(col)) = (
                        usize::from(row).checked_sub(1),
                        usize::from(col).checked_sub(1),
                    ) {
                        table.set(r, col, column.stat.apply(&self.values_in(c, &ids)));
                    }
                }
                table
            })
            .collect()
    }

    fn well_heatmaps(&self) -> Result<Vec<Table>, StoreError> {
        let (label, images) = self.group_images()?;
        let order = &self.plate.well_image_order;
        let width = order.iter().map(Vec::len).max().unwrap_or(0);
        let rows: Vec<RowHeader> = (1..=order.len())
            .map(|r| RowHeader::new(row_label(u32::try_from(r).unwrap_or(u32::MAX))))
            .collect();
        Ok(self
            .columns
            .iter()
            .enumerate()
            .map(|(c, column)| {
                let mut table = Table::new(
                    format!("{} {label}", self.headers[c].label()),
                    "",
                    numbered_columns(width),
                    rows.clone(),
                );
                for (r, line) in order.iter().enumerate() {
                    for (col, number) in line.iter().enumerate() {
                        if let Some(image) = images.iter().find(|i| i.image_idx == *number) {
                            let ids = BTreeSet::from([image.image_id]);
                            table.set(r, col, column.stat.apply(&self.values_in(c, &ids)));
                        }
                    }
                }
                table
            })
            .collect())
    }

    /// Per-cell aggregates over object centers. Cells are the mean of the
    /// values inside them, or the object count for `COUNT` columns.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn density_maps(&self, cell_size: u32) -> Result<Vec<Table>, StoreError> {
        let image = self.image()?;
        let size = cell_size.max(1);
        let nx = image.width.div_ceil(size).max(1) as usize;
        let ny = image.height.div_ceil(size).max(1) as usize;
        let rows: Vec<RowHeader> = (1..=ny)
            .map(|r| RowHeader::new(row_label(u32::try_from(r).unwrap_or(u32::MAX))))
            .collect();
        Ok(self
            .columns
            .iter()
            .enumerate()
            .map(|(c, column)| {
                let mut cells: BTreeMap<(usize, usize), Vec<f64>> = BTreeMap::new();
                for s in self.samples[c].iter().filter(|s| s.image_id == image.image_id) {
                    let Some((x, y)) = s.center else { continue };
                    let cx = ((x.max(0.0) / f64::from(size)) as usize).min(nx - 1);
                    let cy = ((y.max(0.0) / f64::from(size)) as usize).min(ny - 1);
                    cells.entry((cy, cx)).or_default().push(s.value);
                }
                let mut table = Table::new(
                    format!("{} {}", self.headers[c].label(), image.file_name),
                    "",
                    numbered_columns(nx),
                    rows.clone(),
                );
                let stat = if column.stat == Stat::Count {
                    Stat::Count
                } else {
                    Stat::Avg
                };
                for ((r, col), values) in cells {
                    table.set(r, col, stat.apply(&values));
                }
                table
            })
            .collect())
    }

    fn plate_title(&self) -> String {
        if self.plate.name.is_empty() {
            format!("Plate {}", self.filter.plate_id)
        } else {
            self.plate.name.clone()
        }
    }
}

fn numbered_columns(n: usize) -> Vec<ColumnHeader> {
    (1..=n)
        .map(|i| ColumnHeader {
            title: i.to_string(),
            unit: String::new(),
        })
        .collect()
}

fn load_plate(conn: &Connection, job_id: &str, plate_id: u16) -> Result<Plate, StoreError> {
    let raw: Option<(String, u16, u16, String)> = conn
        .query_row(
            "SELECT name, plate_rows, plate_cols, well_image_order FROM plates
             WHERE job_id = ?1 AND plate_id = ?2",
            params![job_id, plate_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let (name, rows, cols, order) =
        raw.ok_or_else(|| StoreError::Filter(format!("job has no plate {plate_id}")))?;
    Ok(Plate {
        name,
        rows,
        cols,
        well_image_order: serde_json::from_str(&order)?,
    })
}

/// Images of the plate that were not invalidated as a whole.
fn load_images(
    conn: &Connection,
    job_id: &str,
    plate_id: u16,
) -> Result<Vec<ImageInfo>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT image_id, group_label, plate_row, plate_col, image_idx, file_name, width, height,
                validity
         FROM images i
         WHERE job_id = ?1 AND plate_id = ?2
           AND NOT EXISTS (SELECT 1 FROM image_stats s
                           WHERE s.job_id = i.job_id AND s.image_id = i.image_id
                             AND s.invalidate_all = 1)
         ORDER BY plate_row, plate_col, image_idx",
    )?;
    let images = stmt
        .query_map(params![job_id, plate_id], |r| {
            Ok(ImageInfo {
                image_id: from_sql_id(r.get(0)?),
                group_label: r.get(1)?,
                plate_row: r.get(2)?,
                plate_col: r.get(3)?,
                image_idx: r.get(4)?,
                file_name: r.get(5)?,
                width: r.get(6)?,
                height: r.get(7)?,
                validity: ImageValidity(r.get(8)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(images)
}

fn load_classes(conn: &Connection, job_id: &str) -> Result<BTreeMap<ClassId, String>, StoreError> {
    let mut stmt = conn.prepare("SELECT class_id, name FROM classes WHERE job_id = ?1")?;
    let classes = stmt
        .query_map([job_id], |r| Ok((ClassId(r.get(0)?), r.get(1)?)))?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(classes)
}

/// Valid objects of the column's class on the filtered plate, with the
/// column's measurement and the object center.
fn load_samples(
    conn: &Connection,
    job_id: &str,
    filter: &ResultsFilter,
    column: &ColumnSpec,
) -> Result<Vec<Sample>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT o.image_id, o.object_id, m.value, cx.value, cy.value
         FROM objects o
         JOIN images i ON i.job_id = o.job_id AND i.image_id = o.image_id
         JOIN object_measurements m
           ON m.job_id = o.job_id AND m.image_id = o.image_id AND m.channel_id = o.channel_id
          AND m.object_idx = o.object_idx AND m.meas_key = ?3
         LEFT JOIN object_measurements cx
           ON cx.job_id = o.job_id AND cx.image_id = o.image_id AND cx.channel_id = o.channel_id
          AND cx.object_idx = o.object_idx AND cx.meas_key = ?5
         LEFT JOIN object_measurements cy
           ON cy.job_id = o.job_id AND cy.image_id = o.image_id AND cy.channel_id = o.channel_id
          AND cy.object_idx = o.object_idx AND cy.meas_key = ?6
         WHERE o.job_id = ?1 AND i.plate_id = ?2 AND o.class_id = ?4 AND o.validity = 0
           AND (?7 IS NULL OR o.t_stack = ?7)
         ORDER BY o.image_id, o.channel_id, o.object_idx",
    )?;
    let rows = stmt.query_map(
        params![
            job_id,
            filter.plate_id,
            column.key().0,
            column.class_id.0,
            MeasureKey::own(MeasureChannel::CenterOfMassX).0,
            MeasureKey::own(MeasureChannel::CenterOfMassY).0,
            filter.t_stack
        ],
        |r| {
            let image_id = from_sql_id(r.get(0)?);
            let object_id = from_sql_id(r.get(1)?);
            let value: Option<f64> = r.get(2)?;
            let cx: Option<f64> = r.get(3)?;
            let cy: Option<f64> = r.get(4)?;
            Ok(value.map(|value| Sample {
                image_id,
                object_id,
                value,
                center: cx.zip(cy),
            }))
        },
    )?;
    let mut samples = Vec::new();
    for row in rows {
        // NULL values were NaN when written.
        if let Some(sample) = row? {
            samples.push(sample);
        }
    }
    Ok(samples)
}
