use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GridError;

/// Column letters run `A..=Z`, so a grid has at most 26 columns.
pub const MAX_COLUMNS: u32 = 26;

/// Minimum cell edge in pixels. Below this a cell center can truncate into
/// the neighbouring cell and labels stop round-tripping.
pub const MIN_CELL_PX: u32 = 2;

const TARGET_CELL_WIDTH: f64 = 108.0;
const TARGET_CELL_HEIGHT: f64 = 120.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelPoint {
    pub x: i32,
    pub y: i32,
}

impl PixelPoint {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for PixelPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Pixel rectangle of one cell. `right` and `bottom` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellBounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl CellBounds {
    pub fn contains(&self, point: PixelPoint) -> bool {
        point.x >= self.left && point.x < self.right && point.y >= self.top && point.y < self.bottom
    }

    pub fn area(&self) -> i64 {
        (self.right - self.left) as i64 * (self.bottom - self.top) as i64
    }
}

/// A grid cell reference such as `E5`: zero-based column index, one-based row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridLabel {
    col: u32,
    row: u32,
}

impl GridLabel {
    pub fn new(col: u32, row: u32) -> Self {
        Self { col, row }
    }

    pub fn col(&self) -> u32 {
        self.col
    }

    pub fn row(&self) -> u32 {
        self.row
    }

    pub fn letter(&self) -> char {
        column_letter(self.col)
    }
}

impl fmt::Display for GridLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.letter(), self.row)
    }
}

/// Syntactic parse only: letter `A..=Z` plus a positive decimal row.
/// Range checks against a concrete grid happen in [`GridSpec::parse`].
impl FromStr for GridLabel {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let mut chars = compact.chars();
        let letter = chars
            .next()
            .ok_or_else(|| GridError::label(s, "empty label"))?
            .to_ascii_uppercase();
        if !letter.is_ascii_uppercase() {
            return Err(GridError::label(s, format!("column '{letter}' is not a letter")));
        }

        let row_str = chars.as_str();
        if row_str.is_empty() || !row_str.chars().all(|c| c.is_ascii_digit()) {
            return Err(GridError::label(s, format!("row '{row_str}' is not a number")));
        }
        let row: u32 = row_str
            .parse()
            .map_err(|_| GridError::label(s, format!("row '{row_str}' is out of range")))?;
        if row == 0 {
            return Err(GridError::label(s, "rows start at 1"));
        }

        Ok(GridLabel {
            col: letter as u32 - 'A' as u32,
            row,
        })
    }
}

impl Serialize for GridLabel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GridLabel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

pub fn column_letter(index: u32) -> char {
    char::from(b'A' + (index % MAX_COLUMNS) as u8)
}

/// Immutable grid geometry over a screen of `width` x `height` pixels.
///
/// All conversions use exact integer arithmetic on `width / cols` and
/// `height / rows`, so fractional cell sizes never drift. Deserializing goes
/// through [`GridSpec::new`], so a decoded spec is always valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawGridSpec")]
pub struct GridSpec {
    cols: u32,
    rows: u32,
    width: u32,
    height: u32,
}

impl GridSpec {
    pub fn new(cols: u32, rows: u32, width: u32, height: u32) -> Result<Self, GridError> {
        if cols == 0 || rows == 0 {
            return Err(GridError::InvalidGrid(format!(
                "grid needs at least one column and one row, got {cols}x{rows}"
            )));
        }
        if cols > MAX_COLUMNS {
            return Err(GridError::InvalidGrid(format!(
                "at most {MAX_COLUMNS} columns are supported, got {cols}"
            )));
        }
        let too_small = |extent: u32, cells: u32| {
            cells.checked_mul(MIN_CELL_PX).is_none_or(|min| extent < min)
        };
        if too_small(width, cols) || too_small(height, rows) {
            return Err(GridError::InvalidGrid(format!(
                "screen {width}x{height} is too small for a {cols}x{rows} grid"
            )));
        }
        Ok(Self {
            cols,
            rows,
            width,
            height,
        })
    }

    /// Pick a density aiming at roughly 108x120 px cells.
    pub fn auto(width: u32, height: u32) -> Result<Self, GridError> {
        let cols = (width as f64 / TARGET_CELL_WIDTH).round().clamp(8.0, 20.0) as u32;
        let rows = (height as f64 / TARGET_CELL_HEIGHT).round().clamp(15.0, 35.0) as u32;
        Self::new(cols, rows, width, height)
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn cell_width(&self) -> f64 {
        self.width as f64 / self.cols as f64
    }

    pub fn cell_height(&self) -> f64 {
        self.height as f64 / self.rows as f64
    }

    pub fn last_letter(&self) -> char {
        column_letter(self.cols - 1)
    }

    /// Same grid density over a different screen size.
    pub fn with_screen(&self, width: u32, height: u32) -> Result<Self, GridError> {
        Self::new(self.cols, self.rows, width, height)
    }

    pub fn parse(&self, text: &str) -> Result<GridLabel, GridError> {
        let label: GridLabel = text.parse()?;
        self.check(&label).map_err(|reason| GridError::label(text, reason))?;
        Ok(label)
    }

    fn check(&self, label: &GridLabel) -> Result<(), String> {
        if label.col >= self.cols {
            return Err(format!(
                "column '{}' must be A-{}",
                label.letter(),
                self.last_letter()
            ));
        }
        if label.row == 0 || label.row > self.rows {
            return Err(format!("row {} must be 1-{}", label.row, self.rows));
        }
        Ok(())
    }

    fn validate(&self, label: &GridLabel) -> Result<(), GridError> {
        self.check(label)
            .map_err(|reason| GridError::label(&label.to_string(), reason))
    }

    /// Center of the label's cell, truncated to whole pixels.
    pub fn to_pixel(&self, label: &GridLabel) -> Result<PixelPoint, GridError> {
        self.validate(label)?;
        let (w, h) = (self.width as i64, self.height as i64);
        let (c, r) = (self.cols as i64, self.rows as i64);
        let x = (2 * label.col as i64 + 1) * w / (2 * c);
        let y = (2 * label.row as i64 - 1) * h / (2 * r);
        Ok(PixelPoint::new(x as i32, y as i32))
    }

    /// Parse then convert, the usual path for model output like `"e5"`.
    pub fn locate(&self, text: &str) -> Result<PixelPoint, GridError> {
        let label = self.parse(text)?;
        self.to_pixel(&label)
    }

    /// Cell containing `point`; points off screen clamp to the nearest edge cell.
    pub fn to_label(&self, point: PixelPoint) -> GridLabel {
        let col = (point.x as i64 * self.cols as i64).div_euclid(self.width as i64);
        let row = (point.y as i64 * self.rows as i64).div_euclid(self.height as i64);
        GridLabel {
            col: col.clamp(0, self.cols as i64 - 1) as u32,
            row: row.clamp(0, self.rows as i64 - 1) as u32 + 1,
        }
    }

    /// Truncated cell edges. Neighbours share an edge expression, so cells
    /// tile the screen with no gaps or overlap.
    pub fn bounds(&self, label: &GridLabel) -> Result<CellBounds, GridError> {
        self.validate(label)?;
        let col = label.col as i64;
        let row = label.row as i64 - 1;
        let (w, h) = (self.width as i64, self.height as i64);
        let (c, r) = (self.cols as i64, self.rows as i64);
        Ok(CellBounds {
            left: (col * w / c) as i32,
            top: (row * h / r) as i32,
            right: ((col + 1) * w / c) as i32,
            bottom: ((row + 1) * h / r) as i32,
        })
    }

    /// Every label, row by row.
    pub fn labels(&self) -> impl Iterator<Item = GridLabel> + '_ {
        (1..=self.rows).flat_map(move |row| (0..self.cols).map(move |col| GridLabel { col, row }))
    }
}

#[derive(Deserialize)]
struct RawGridSpec {
    cols: u32,
    rows: u32,
    width: u32,
    height: u32,
}

impl TryFrom<RawGridSpec> for GridSpec {
    type Error = GridError;

    fn try_from(raw: RawGridSpec) -> Result<Self, Self::Error> {
        GridSpec::new(raw.cols, raw.rows, raw.width, raw.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn phone() -> GridSpec {
        GridSpec::new(10, 20, 1080, 2400).unwrap()
    }

    #[test]
    fn known_centers() {
        let spec = phone();
        assert_eq!(spec.locate("A1").unwrap(), PixelPoint::new(54, 60));
        assert_eq!(spec.locate("E5").unwrap(), PixelPoint::new(486, 540));
        assert_eq!(spec.locate("J20").unwrap(), PixelPoint::new(1026, 2340));
        assert_eq!(spec.locate("F10").unwrap(), PixelPoint::new(594, 1140));
    }

    #[test]
    fn parse_is_lenient_but_canonical() {
        let spec = phone();
        assert_eq!(spec.parse(" e5 ").unwrap().to_string(), "E5");
        assert_eq!(spec.parse("E05").unwrap().to_string(), "E5");
        assert_eq!(spec.parse("j 20").unwrap().to_string(), "J20");
    }

    #[test]
    fn rejects_bad_labels() {
        let spec = phone();
        for bad in ["K1", "A0", "A21", "Ax", "5E", "", "A", "A+5", "A-1"] {
            let err = spec.parse(bad).unwrap_err();
            assert!(matches!(err, GridError::InvalidLabel { .. }), "{bad}: {err}");
        }
        assert!(spec.to_pixel(&GridLabel::new(10, 1)).is_err());
        assert!(spec.bounds(&GridLabel::new(0, 21)).is_err());
    }

    #[test]
    fn pixel_to_label_examples() {
        let spec = phone();
        assert_eq!(spec.to_label(PixelPoint::new(540, 600)).to_string(), "F6");
        assert_eq!(spec.to_label(PixelPoint::new(539, 599)).to_string(), "E5");
        assert_eq!(spec.to_label(PixelPoint::new(54, 2340)).to_string(), "A20");
        assert_eq!(spec.to_label(PixelPoint::new(-30, -1)).to_string(), "A1");
        assert_eq!(spec.to_label(PixelPoint::new(5000, 9000)).to_string(), "J20");
    }

    #[test]
    fn bounds_of_e5() {
        let bounds = phone().bounds(&GridLabel::new(4, 5)).unwrap();
        assert_eq!(
            bounds,
            CellBounds {
                left: 432,
                top: 480,
                right: 540,
                bottom: 600
            }
        );
    }

    #[test]
    fn rejects_degenerate_specs() {
        assert!(GridSpec::new(0, 20, 1080, 2400).is_err());
        assert!(GridSpec::new(27, 20, 1080, 2400).is_err());
        assert!(GridSpec::new(10, 20, 15, 2400).is_err());
        assert!(GridSpec::new(10, u32::MAX, 1080, 2400).is_err());
    }

    #[test]
    fn deserialize_validates() {
        let spec: GridSpec =
            serde_json::from_str(r#"{"cols":10,"rows":20,"width":1080,"height":2400}"#).unwrap();
        assert_eq!(spec, phone());
        let err = serde_json::from_str::<GridSpec>(r#"{"cols":0,"rows":0,"width":0,"height":0}"#)
            .unwrap_err();
        assert!(err.to_string().contains("at least one column"), "{err}");
    }

    #[test]
    fn bounds_truncate_on_fractional_cells() {
        let spec = GridSpec::new(7, 13, 1000, 2003).unwrap();
        let b1 = spec.bounds(&GridLabel::new(1, 1)).unwrap();
        assert_eq!(
            b1,
            CellBounds {
                left: 142,
                top: 0,
                right: 285,
                bottom: 154
            }
        );
        assert_eq!(spec.to_label(PixelPoint::new(143, 1)), GridLabel::new(1, 1));
    }

    #[test]
    fn auto_density() {
        let spec = GridSpec::auto(1080, 2400).unwrap();
        assert_eq!((spec.cols(), spec.rows()), (10, 20));
        let small = GridSpec::auto(480, 800).unwrap();
        assert_eq!((small.cols(), small.rows()), (8, 15));
    }

    #[test]
    fn bounds_tile_the_screen() {
        let spec = GridSpec::new(7, 13, 1000, 2003).unwrap();
        let total: i64 = spec.labels().map(|l| spec.bounds(&l).unwrap().area()).sum();
        assert_eq!(total, 1000 * 2003);
        for label in spec.labels() {
            let b = spec.bounds(&label).unwrap();
            if label.col() + 1 < spec.cols() {
                let next = spec.bounds(&GridLabel::new(label.col() + 1, label.row())).unwrap();
                assert_eq!(b.right, next.left);
            }
            if label.row() < spec.rows() {
                let below = spec.bounds(&GridLabel::new(label.col(), label.row() + 1)).unwrap();
                assert_eq!(b.bottom, below.top);
            }
        }
    }

    fn any_spec() -> impl Strategy<Value = GridSpec> {
        (1u32..=26, 1u32..=50).prop_flat_map(|(cols, rows)| {
            (cols * MIN_CELL_PX..4000, rows * MIN_CELL_PX..4000)
                .prop_map(move |(w, h)| GridSpec::new(cols, rows, w, h).unwrap())
        })
    }

    proptest! {
        #[test]
        fn centers_round_trip(spec in any_spec()) {
            for label in spec.labels() {
                let center = spec.to_pixel(&label).unwrap();
                prop_assert_eq!(spec.to_label(center), label);
                prop_assert_eq!(spec.parse(&label.to_string()).unwrap(), label);
            }
        }

        #[test]
        fn inside_points_map_to_their_cell(
            spec in any_spec(),
            fx in 0.0f64..1.0,
            fy in 0.0f64..1.0,
        ) {
            // The truncated left/top edge pixel may belong to the previous cell.
            for label in spec.labels() {
                let b = spec.bounds(&label).unwrap();
                let x = b.left + 1 + ((b.right - b.left - 2) as f64 * fx) as i32;
                let y = b.top + 1 + ((b.bottom - b.top - 2) as f64 * fy) as i32;
                prop_assert!(b.contains(PixelPoint::new(x, y)));
                prop_assert_eq!(spec.to_label(PixelPoint::new(x, y)), label);
            }
        }

        #[test]
        fn outside_points_clamp(spec in any_spec(), dx in 1i32..5000, dy in 1i32..5000) {
            let w = spec.width() as i32;
            let h = spec.height() as i32;
            prop_assert_eq!(spec.to_label(PixelPoint::new(-dx, -dy)), GridLabel::new(0, 1));
            prop_assert_eq!(
                spec.to_label(PixelPoint::new(w + dx, h + dy)),
                GridLabel::new(spec.cols() - 1, spec.rows())
            );
            prop_assert_eq!(spec.to_label(PixelPoint::new(w - 1 + dx, 0)).col(), spec.cols() - 1);
        }

        #[test]
        fn bounds_cover_every_pixel_once(spec in any_spec()) {
            let total: i64 = spec.labels().map(|l| spec.bounds(&l).unwrap().area()).sum();
            prop_assert_eq!(total, spec.width() as i64 * spec.height() as i64);
        }
    }
}
