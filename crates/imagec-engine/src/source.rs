//! Image discovery, plate metadata and plane access.
//!
//! An [`ImageSource`] combines three things:
//!
//! - discovery of image files below a folder ([`ImageSource::enumerate`]),
//! - plate coordinates parsed from file names ([`FilenameParser`]),
//! - plane access through an [`ImageReader`], with tiling and z-projection
//!   layered on top ([`ImageSource::read_tile`], [`ImageSource::read_whole`]).
//!
//! Readers return whole planes in their native depth. Tiles are cut from
//! those planes with zero padding on the right and bottom edges; the valid
//! part is reported through [`TileInfo::valid_rect`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;

use crate::context::TileInfo;
use crate::error::{ConfigError, IoError};
use crate::image::{Depth, ImagePlane};
use crate::pipeline::PlaneKey;
use crate::types::{Dimensions, Rect, ZProjection};

/// File extensions picked up by [`ImageSource::enumerate`], lower case.
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "tif", "tiff", "btif", "btiff", "btf", "jpg", "jpeg", "vsi", "ics", "czi", "nd2",
];

/// Stable 64-bit id of an image: SipHash-1-3 of its path.
#[must_use]
pub fn image_id_for_path(path: &Path) -> u64 {
    let mut hasher = SipHasher13::new();
    hasher.write(path.to_string_lossy().as_bytes());
    hasher.finish()
}

/// A discovered image file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageRef {
    pub path: PathBuf,
    pub plate_id: u16,
}

impl ImageRef {
    #[must_use]
    pub fn image_id(&self) -> u64 {
        image_id_for_path(&self.path)
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// File name without extension, used to name control images.
    #[must_use]
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Well and image number of a file on its plate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WellPosition {
    /// Well label such as `B3`; empty when the name did not match.
    pub group_label: String,
    /// 1-based row (`A` = 1), `0` when unknown.
    pub row: u16,
    /// 1-based column, `0` when unknown.
    pub col: u16,
    /// Image number within the well.
    pub image_idx: u32,
}

/// Extracts [`WellPosition`]s from file names.
///
/// The pattern needs four capture groups: well label, row letter, column
/// number and image index. Row letters count from `A` = 1; `AA` follows
/// `Z` as in spreadsheet column names.
#[derive(Debug, Clone)]
pub struct FilenameParser {
    regex: Regex,
}

impl FilenameParser {
    /// # Errors
    ///
    /// Returns [`ConfigError::Regex`] when the pattern does not compile and
    /// [`ConfigError::Invalid`] when it has fewer than four groups.
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        let regex = Regex::new(pattern)?;
        if regex.captures_len() < 5 {
            return Err(ConfigError::Invalid {
                field: "filenameRegex".to_owned(),
                reason: format!(
                    "needs four capture groups, found {}",
                    regex.captures_len() - 1
                ),
            });
        }
        Ok(Self { regex })
    }

    /// Position parsed from `file_name`, `None` when the pattern does not
    /// match.
    #[must_use]
    pub fn parse(&self, file_name: &str) -> Option<WellPosition> {
        let caps = self.regex.captures(file_name)?;
        let group = |i: usize| caps.get(i).map_or("", |m| m.as_str());
        Some(WellPosition {
            group_label: group(1).to_owned(),
            row: row_number(group(2))?,
            col: group(3).parse().ok()?,
            image_idx: group(4).parse().ok()?,
        })
    }
}

/// `A` = 1, `B` = 2, ..., `Z` = 26, `AA` = 27.
fn row_number(letters: &str) -> Option<u16> {
    if letters.is_empty() {
        return None;
    }
    letters.chars().try_fold(0u16, |acc, c| {
        let c = c.to_ascii_uppercase();
        if !c.is_ascii_uppercase() {
            return None;
        }
        acc.checked_mul(26)?.checked_add(c as u16 - u16::from(b'A') + 1)
    })
}

/// Shape of an image as reported by its reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageProperties {
    /// Size of each resolution level of series 0, full resolution first.
    pub resolutions: Vec<Dimensions>,
    pub series: u32,
    pub c_stacks: u32,
    pub z_stacks: u32,
    pub t_stacks: u32,
}

impl ImageProperties {
    /// Size at `resolution`.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::OutOfRange`] for a level the image does not have.
    pub fn size(&self, path: &Path, resolution: u32) -> Result<Dimensions, IoError> {
        self.resolutions
            .get(resolution as usize)
            .copied()
            .ok_or_else(|| IoError::OutOfRange {
                path: path.to_path_buf(),
                what: "resolution",
                index: i64::from(resolution),
                available: self.resolutions.len() as u64,
            })
    }
}

/// Full description of one image: file, plate position and shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    pub image: ImageRef,
    pub well: WellPosition,
    pub properties: ImageProperties,
}

/// Address of a single plane inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PlaneIndex {
    pub series: u32,
    pub resolution: u32,
    pub c: i32,
    pub z: i32,
    pub t: i32,
}

/// Plane access for one file format family.
///
/// Implementations must be safe to call from several worker threads and
/// must report out-of-range indices as [`IoError::OutOfRange`].
pub trait ImageReader: Send + Sync {
    /// # Errors
    ///
    /// Returns [`IoError`] when the file cannot be opened or decoded.
    fn properties(&self, path: &Path) -> Result<ImageProperties, IoError>;

    /// # Errors
    ///
    /// Returns [`IoError`] when the file cannot be read or the index lies
    /// outside the image.
    fn read_plane(&self, path: &Path, index: PlaneIndex) -> Result<ImagePlane, IoError>;
}

fn check_index(
    path: &Path,
    what: &'static str,
    index: i64,
    available: u32,
) -> Result<usize, IoError> {
    usize::try_from(index)
        .ok()
        .filter(|&i| i < available as usize)
        .ok_or_else(|| IoError::OutOfRange {
            path: path.to_path_buf(),
            what,
            index,
            available: u64::from(available),
        })
}

/// Decoded c-stacks of a file.
type Decoded = Arc<Vec<ImagePlane>>;

/// Reader for the formats the `image` crate decodes (TIFF, PNG, JPEG).
///
/// Files have one series, one resolution, one z and one t plane. Gray
/// images have one c-stack; color images have one per RGB channel.
/// Recently decoded files are kept in a small cache so the tiles and
/// channels of one image decode it once.
#[derive(Debug)]
pub struct FileReader {
    cache: Mutex<VecDeque<(PathBuf, Decoded)>>,
    capacity: usize,
}

impl Default for FileReader {
    fn default() -> Self {
        Self::new(4)
    }
}

impl FileReader {
    /// Reader keeping the last `capacity` decoded files.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    fn decoded(&self, path: &Path) -> Result<Decoded, IoError> {
        // The lock is held while decoding so one file is decoded once.
        let mut cache = self.cache.lock();
        if let Some((_, planes)) = cache.iter().find(|(p, _)| p == path) {
            return Ok(Arc::clone(planes));
        }
        let planes: Decoded = Arc::new(decode_file(path)?);
        if cache.len() >= self.capacity {
            cache.pop_front();
        }
        cache.push_back((path.to_path_buf(), Arc::clone(&planes)));
        Ok(planes)
    }
}

fn decode_file(path: &Path) -> Result<Vec<ImagePlane>, IoError> {
    let image = image::open(path).map_err(|e| match e {
        image::ImageError::IoError(source) => IoError::Io {
            path: path.to_path_buf(),
            source,
        },
        source => IoError::Decode {
            path: path.to_path_buf(),
            source,
        },
    })?;
    Ok(match image {
        image::DynamicImage::ImageLuma8(gray) => vec![ImagePlane::from_gray8(gray)],
        image::DynamicImage::ImageLuma16(gray) => vec![ImagePlane::from_gray16(gray)],
        image::DynamicImage::ImageRgb8(_) | image::DynamicImage::ImageRgba8(_) => {
            let rgb = image.to_rgb8();
            (0..3)
                .map(|c| {
                    ImagePlane::from_gray8(image::GrayImage::from_fn(
                        rgb.width(),
                        rgb.height(),
                        |x, y| image::Luma([rgb.get_pixel(x, y).0[c]]),
                    ))
                })
                .collect()
        }
        image::DynamicImage::ImageRgb16(_) | image::DynamicImage::ImageRgba16(_) => {
            let rgb = image.to_rgb16();
            (0..3)
                .map(|c| {
                    ImagePlane::from_gray16(image::ImageBuffer::from_fn(
                        rgb.width(),
                        rgb.height(),
                        |x, y| image::Luma([rgb.get_pixel(x, y).0[c]]),
                    ))
                })
                .collect()
        }
        other => vec![ImagePlane::from_gray16(other.to_luma16())],
    })
}

impl ImageReader for FileReader {
    fn properties(&self, path: &Path) -> Result<ImageProperties, IoError> {
        let planes = self.decoded(path)?;
        let size = planes
            .first()
            .map_or(Dimensions::new(0, 0), ImagePlane::dimensions);
        Ok(ImageProperties {
            resolutions: vec![size],
            series: 1,
            c_stacks: u32::try_from(planes.len()).unwrap_or(u32::MAX),
            z_stacks: 1,
            t_stacks: 1,
        })
    }

    fn read_plane(&self, path: &Path, index: PlaneIndex) -> Result<ImagePlane, IoError> {
        let planes = self.decoded(path)?;
        check_index(path, "series", i64::from(index.series), 1)?;
        check_index(path, "resolution", i64::from(index.resolution), 1)?;
        check_index(path, "z", i64::from(index.z), 1)?;
        check_index(path, "t", i64::from(index.t), 1)?;
        let c = check_index(
            path,
            "c",
            i64::from(index.c),
            u32::try_from(planes.len()).unwrap_or(u32::MAX),
        )?;
        Ok(planes[c].clone())
    }
}

/// Reader over planes held in memory, keyed by path and `(c, z, t)`.
///
/// Useful for synthetic data and for embedding the engine behind another
/// image decoder.
#[derive(Debug, Default)]
pub struct MemoryReader {
    images: HashMap<PathBuf, BTreeMap<(i32, i32, i32), ImagePlane>>,
}

impl MemoryReader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `plane` as c-stack `c`, z-stack `z`, t-stack `t` of `path`.
    pub fn insert(&mut self, path: impl Into<PathBuf>, c: i32, z: i32, t: i32, plane: ImagePlane) {
        self.images
            .entry(path.into())
            .or_default()
            .insert((c, z, t), plane);
    }

    /// Paths of all registered images.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.images.keys().map(PathBuf::as_path)
    }

    fn planes(&self, path: &Path) -> Result<&BTreeMap<(i32, i32, i32), ImagePlane>, IoError> {
        self.images.get(path).ok_or_else(|| IoError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })
    }
}

impl ImageReader for MemoryReader {
    #[allow(clippy::cast_sign_loss)]
    fn properties(&self, path: &Path) -> Result<ImageProperties, IoError> {
        let planes = self.planes(path)?;
        let extent = |f: fn(&(i32, i32, i32)) -> i32| {
            planes.keys().map(f).max().map_or(0, |m| (m + 1).max(0) as u32)
        };
        let size = planes
            .values()
            .next()
            .map_or(Dimensions::new(0, 0), ImagePlane::dimensions);
        Ok(ImageProperties {
            resolutions: vec![size],
            series: 1,
            c_stacks: extent(|k| k.0),
            z_stacks: extent(|k| k.1),
            t_stacks: extent(|k| k.2),
        })
    }

    fn read_plane(&self, path: &Path, index: PlaneIndex) -> Result<ImagePlane, IoError> {
        check_index(path, "series", i64::from(index.series), 1)?;
        check_index(path, "resolution", i64::from(index.resolution), 1)?;
        let planes = self.planes(path)?;
        planes
            .get(&(index.c, index.z, index.t))
            .cloned()
            .ok_or_else(|| IoError::OutOfRange {
                path: path.to_path_buf(),
                what: "plane",
                index: i64::from(index.c),
                available: planes.len() as u64,
            })
    }
}

/// How an image is cut into tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub image_size: Dimensions,
    pub tile_width: u32,
    pub tile_height: u32,
    pub tiles_x: u32,
    pub tiles_y: u32,
}

impl TileGrid {
    /// Grid for `image_size` with composite tiles of `tile_width` ×
    /// `tile_height`.
    #[must_use]
    pub fn new(image_size: Dimensions, tile_width: u32, tile_height: u32) -> Self {
        let tile_width = tile_width.max(1);
        let tile_height = tile_height.max(1);
        Self {
            image_size,
            tile_width,
            tile_height,
            tiles_x: image_size.width.div_ceil(tile_width).max(1),
            tiles_y: image_size.height.div_ceil(tile_height).max(1),
        }
    }

    /// Whether the image fits into one composite tile.
    #[must_use]
    pub const fn is_single(&self) -> bool {
        self.image_size.width <= self.tile_width && self.image_size.height <= self.tile_height
    }

    /// Tiles in row-major order. A single tile is the whole image with
    /// index `-1`.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn tiles(&self, t_stack: i32) -> Vec<TileInfo> {
        if self.is_single() {
            return vec![TileInfo::whole(self.image_size, t_stack)];
        }
        let mut tiles = Vec::with_capacity((self.tiles_x * self.tiles_y) as usize);
        for ty in 0..self.tiles_y {
            for tx in 0..self.tiles_x {
                let origin_x = tx * self.tile_width;
                let origin_y = ty * self.tile_height;
                let valid_w = self.tile_width.min(self.image_size.width - origin_x);
                let valid_h = self.tile_height.min(self.image_size.height - origin_y);
                tiles.push(TileInfo {
                    index: (ty * self.tiles_x + tx) as i32,
                    tile_x: tx as i32,
                    tile_y: ty as i32,
                    origin_x: origin_x as i32,
                    origin_y: origin_y as i32,
                    width: self.tile_width,
                    height: self.tile_height,
                    valid_rect: Rect::new(0, 0, valid_w, valid_h),
                    image_size: self.image_size,
                    t_stack,
                });
            }
        }
        tiles
    }
}

/// Files of one plate, read through an [`ImageReader`].
pub struct ImageSource<'a> {
    reader: &'a dyn ImageReader,
    parser: FilenameParser,
    plate_id: u16,
    series: u32,
    resolution: u32,
}

impl std::fmt::Debug for ImageSource<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageSource")
            .field("parser", &self.parser)
            .field("plate_id", &self.plate_id)
            .field("series", &self.series)
            .field("resolution", &self.resolution)
            .finish_non_exhaustive()
    }
}

impl<'a> ImageSource<'a> {
    #[must_use]
    pub const fn new(
        reader: &'a dyn ImageReader,
        parser: FilenameParser,
        plate_id: u16,
        series: u32,
        resolution: u32,
    ) -> Self {
        Self {
            reader,
            parser,
            plate_id,
            series,
            resolution,
        }
    }

    /// Image files below `root` with a known extension, sorted by path.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::Io`] when `root` itself cannot be listed.
    /// Unreadable subfolders are skipped with a warning.
    pub fn enumerate(&self, root: &Path) -> Result<Vec<ImageRef>, IoError> {
        let mut found = Vec::new();
        let entries = std::fs::read_dir(root).map_err(|source| IoError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        let mut pending: Vec<std::fs::ReadDir> = vec![entries];
        while let Some(dir) = pending.pop() {
            for entry in dir {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping unreadable entry");
                        continue;
                    }
                };
                let path = entry.path();
                if path.is_dir() {
                    match std::fs::read_dir(&path) {
                        Ok(sub) => pending.push(sub),
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "skipping folder");
                        }
                    }
                } else if has_image_extension(&path) {
                    found.push(ImageRef {
                        path,
                        plate_id: self.plate_id,
                    });
                }
            }
        }
        found.sort();
        Ok(found)
    }

    /// Plate position and shape of `image`.
    ///
    /// # Errors
    ///
    /// Returns the reader's [`IoError`].
    pub fn metadata(&self, image: &ImageRef) -> Result<ImageMetadata, IoError> {
        let properties = self.reader.properties(&image.path)?;
        let well = self.parser.parse(&image.file_name()).unwrap_or_else(|| {
            tracing::warn!(file = %image.file_name(), "file name does not match the plate pattern");
            WellPosition::default()
        });
        Ok(ImageMetadata {
            image: image.clone(),
            well,
            properties,
        })
    }

    /// The plane `key` of the whole image, z-projected when requested.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::OutOfRange`] for planes the image does not have.
    pub fn read_whole(
        &self,
        image: &ImageRef,
        properties: &ImageProperties,
        key: PlaneKey,
    ) -> Result<ImagePlane, IoError> {
        let index = |z: i32| PlaneIndex {
            series: self.series,
            resolution: self.resolution,
            c: key.c_stack,
            z,
            t: key.t_stack,
        };
        if key.z_projection == ZProjection::None {
            return self.reader.read_plane(&image.path, index(key.z_stack));
        }
        let z_count = i32::try_from(properties.z_stacks).unwrap_or(i32::MAX);
        let planes = (0..z_count)
            .map(|z| self.reader.read_plane(&image.path, index(z)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(project(&planes, key.z_projection))
    }

    /// The plane `key` cut to `tile`, zero padded outside the image.
    ///
    /// # Errors
    ///
    /// See [`read_whole`](Self::read_whole).
    pub fn read_tile(
        &self,
        image: &ImageRef,
        properties: &ImageProperties,
        key: PlaneKey,
        tile: &TileInfo,
    ) -> Result<ImagePlane, IoError> {
        let whole = self.read_whole(image, properties, key)?;
        if tile.index < 0 {
            return Ok(whole);
        }
        Ok(whole.crop(tile.image_rect()))
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Collapse a z-stack into one plane of the first plane's depth.
#[allow(clippy::cast_precision_loss)]
fn project(planes: &[ImagePlane], projection: ZProjection) -> ImagePlane {
    let Some(first) = planes.first() else {
        return ImagePlane::zeros(0, 0, Depth::U16, crate::image::Channels::Gray);
    };
    let mut acc: Vec<f32> = first.to_f32_gray();
    for plane in &planes[1..] {
        for (a, v) in acc.iter_mut().zip(plane.to_f32_gray()) {
            *a = match projection {
                ZProjection::MaxIntensity => a.max(v),
                ZProjection::MinIntensity => a.min(v),
                ZProjection::AvgIntensity | ZProjection::None => *a + v,
            };
        }
    }
    if projection == ZProjection::AvgIntensity {
        let n = planes.len() as f32;
        acc.iter_mut().for_each(|a| *a /= n);
    }
    first.with_gray_values(acc).unwrap_or_else(|_| first.clone())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::settings::DEFAULT_FILENAME_REGEX;

    fn source(reader: &dyn ImageReader) -> ImageSource<'_> {
        ImageSource::new(
            reader,
            FilenameParser::new(DEFAULT_FILENAME_REGEX).unwrap(),
            1,
            0,
            0,
        )
    }

    fn key(c: i32) -> PlaneKey {
        PlaneKey {
            c_stack: c,
            z_stack: 0,
            t_stack: 0,
            z_projection: ZProjection::None,
        }
    }

    // --- filename tests ---

    #[test]
    fn default_pattern_parses_well_and_image() {
        let parser = FilenameParser::new(DEFAULT_FILENAME_REGEX).unwrap();
        let well = parser.parse("plate1_B3_12.tif").unwrap();
        assert_eq!(well.group_label, "B3");
        assert_eq!((well.row, well.col, well.image_idx), (2, 3, 12));
        assert!(parser.parse("no_match.tif").is_none());
    }

    #[test]
    fn row_letters_continue_past_z() {
        assert_eq!(row_number("A"), Some(1));
        assert_eq!(row_number("h"), Some(8));
        assert_eq!(row_number("AA"), Some(27));
        assert_eq!(row_number("1"), None);
    }

    #[test]
    fn pattern_needs_four_groups() {
        assert!(matches!(
            FilenameParser::new("_(.)_"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(FilenameParser::new("(("), Err(ConfigError::Regex(_))));
    }

    #[test]
    fn image_ids_are_stable() {
        let a = image_id_for_path(Path::new("/data/a_B3_1.tif"));
        assert_eq!(a, image_id_for_path(Path::new("/data/a_B3_1.tif")));
        assert_ne!(a, image_id_for_path(Path::new("/data/a_B3_2.tif")));
    }

    // --- enumerate tests ---

    #[test]
    fn enumerate_finds_known_extensions_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        for name in ["b_A1_1.tif", "a_A1_2.TIFF", "sub/c_A2_1.jpg", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let reader = MemoryReader::new();
        let found = source(&reader).enumerate(dir.path()).unwrap();
        let names: Vec<_> = found.iter().map(ImageRef::file_name).collect();
        assert_eq!(names, vec!["a_A1_2.TIFF", "b_A1_1.tif", "c_A2_1.jpg"]);
        assert!(found.iter().all(|r| r.plate_id == 1));
    }

    #[test]
    fn enumerate_missing_root_is_an_error() {
        let reader = MemoryReader::new();
        let err = source(&reader).enumerate(Path::new("/definitely/not/here"));
        assert!(matches!(err, Err(IoError::Io { .. })));
    }

    // --- plane tests ---

    #[test]
    fn tiles_are_padded_at_the_border() {
        let grid = TileGrid::new(Dimensions::new(250, 120), 100, 100);
        assert!(!grid.is_single());
        let tiles = grid.tiles(0);
        assert_eq!(tiles.len(), 6);
        let last = tiles.last().unwrap();
        assert_eq!((last.origin_x, last.origin_y), (200, 100));
        assert_eq!(last.valid_rect, Rect::new(0, 0, 50, 20));

        let mut reader = MemoryReader::new();
        reader.insert("x_A1_1.tif", 0, 0, 0, ImagePlane::from_fn_u16(250, 120, |_, _| 9));
        let src = source(&reader);
        let image = ImageRef {
            path: PathBuf::from("x_A1_1.tif"),
            plate_id: 1,
        };
        let props = src.metadata(&image).unwrap().properties;
        let tile = src.read_tile(&image, &props, key(0), last).unwrap();
        assert_eq!(tile.dimensions(), Dimensions::new(100, 100));
        assert!((tile.get(49, 19, 0) - 9.0).abs() < f64::EPSILON);
        assert!(tile.get(50, 19, 0).abs() < f64::EPSILON, "padding is zero");
    }

    #[test]
    fn small_images_are_a_single_tile() {
        let tiles = TileGrid::new(Dimensions::new(100, 100), 4096, 4096).tiles(2);
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].index, -1);
        assert_eq!(tiles[0].t_stack, 2);
    }

    #[test]
    fn out_of_range_plane_is_an_error() {
        let mut reader = MemoryReader::new();
        reader.insert("x.tif", 0, 0, 0, ImagePlane::from_fn_u16(4, 4, |_, _| 1));
        let image = ImageRef {
            path: PathBuf::from("x.tif"),
            plate_id: 1,
        };
        let src = source(&reader);
        let props = src.metadata(&image).unwrap().properties;
        assert_eq!(props.c_stacks, 1);
        assert!(matches!(
            src.read_whole(&image, &props, key(3)),
            Err(IoError::OutOfRange { .. })
        ));
    }

    #[test]
    fn z_projection_combines_planes() {
        let mut reader = MemoryReader::new();
        for (z, v) in [(0, 10u16), (1, 30), (2, 20)] {
            reader.insert("z.tif", 0, z, 0, ImagePlane::from_fn_u16(2, 2, move |_, _| v));
        }
        let image = ImageRef {
            path: PathBuf::from("z.tif"),
            plate_id: 1,
        };
        let src = source(&reader);
        let props = src.metadata(&image).unwrap().properties;
        assert_eq!(props.z_stacks, 3);
        let read = |projection| {
            let k = PlaneKey {
                z_projection: projection,
                ..key(0)
            };
            src.read_whole(&image, &props, k).unwrap().get(0, 0, 0)
        };
        assert!((read(ZProjection::MaxIntensity) - 30.0).abs() < f64::EPSILON);
        assert!((read(ZProjection::MinIntensity) - 10.0).abs() < f64::EPSILON);
        assert!((read(ZProjection::AvgIntensity) - 20.0).abs() < f64::EPSILON);
        assert!((read(ZProjection::None) - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn file_reader_decodes_sixteen_bit_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p_A1_1.tif");
        let img: image::ImageBuffer<image::Luma<u16>, Vec<u16>> =
            image::ImageBuffer::from_fn(8, 4, |x, _| image::Luma([u16::try_from(x).unwrap() * 1000]));
        img.save_with_format(&path, image::ImageFormat::Tiff).unwrap();
        let reader = FileReader::default();
        let props = reader.properties(&path).unwrap();
        assert_eq!(props.resolutions, vec![Dimensions::new(8, 4)]);
        let plane = reader.read_plane(&path, PlaneIndex::default()).unwrap();
        assert_eq!(plane.depth(), Depth::U16);
        assert!((plane.get(7, 0, 0) - 7000.0).abs() < f64::EPSILON);
        assert!(matches!(
            reader.read_plane(&path, PlaneIndex { z: 1, ..PlaneIndex::default() }),
            Err(IoError::OutOfRange { what: "z", .. })
        ));
    }
}
