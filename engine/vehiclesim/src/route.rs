//! Routes and the ITN waypoint format.
//!
//! An ITN file holds one waypoint per line, fields separated by `|`:
//!
//! ```text
//! 0845453|4902352|Point 1 |0|
//! 0848501|4900249|Point 2 |0|
//! ```
//!
//! The first field is the longitude and the second the latitude, both as
//! signed integers scaled by 100 000. Remaining fields (label, flags) are
//! optional.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::coordinate::{Coordinate, CoordinateError};

/// Scale factor of the fixed-point ITN coordinates.
pub const ITN_SCALE: f64 = 100_000.0;

const ITN_EXTENSION: &str = "itn";

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("cannot read route '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: expected at least 2 '|'-separated fields, found {found}")]
    MissingFields { line: usize, found: usize },
    #[error("line {line}: {field} '{value}' is not a fixed-point integer")]
    InvalidNumber {
        line: usize,
        field: &'static str,
        value: String,
    },
    #[error("line {line}: {source}")]
    InvalidCoordinate {
        line: usize,
        #[source]
        source: CoordinateError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Waypoint {
    pub coordinate: Coordinate,
    pub label: Option<String>,
}

impl From<Coordinate> for Waypoint {
    fn from(coordinate: Coordinate) -> Self {
        Self {
            coordinate,
            label: None,
        }
    }
}

/// Ordered list of waypoints; index order is travel order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Route {
    waypoints: Vec<Waypoint>,
}

impl Route {
    pub fn new(waypoints: Vec<Waypoint>) -> Self {
        Self { waypoints }
    }

    pub fn from_coordinates(coordinates: impl IntoIterator<Item = Coordinate>) -> Self {
        Self {
            waypoints: coordinates.into_iter().map(Waypoint::from).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub fn get(&self, index: usize) -> Option<Coordinate> {
        self.waypoints.get(index).map(|w| w.coordinate)
    }

    /// Total length of all segments in kilometres.
    pub fn length_km(&self) -> f64 {
        self.waypoints
            .windows(2)
            .map(|w| w[0].coordinate.distance_km(&w[1].coordinate))
            .sum()
    }
}

/// Parse ITN text. Blank lines are skipped; any malformed record fails the
/// whole route.
pub fn parse_itn(text: &str) -> Result<Route, RouteError> {
    let mut waypoints = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        if raw.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = raw.split('|').map(str::trim).collect();
        if fields.len() < 2 {
            return Err(RouteError::MissingFields {
                line,
                found: fields.len(),
            });
        }

        let longitude = parse_fixed(fields[0], line, "longitude")?;
        let latitude = parse_fixed(fields[1], line, "latitude")?;
        let coordinate = Coordinate::new(latitude, longitude)
            .map_err(|source| RouteError::InvalidCoordinate { line, source })?;

        let label = fields
            .get(2)
            .filter(|l| !l.is_empty())
            .map(|l| l.to_string());

        waypoints.push(Waypoint { coordinate, label });
    }

    Ok(Route::new(waypoints))
}

fn parse_fixed(value: &str, line: usize, field: &'static str) -> Result<f64, RouteError> {
    value
        .parse::<i64>()
        .map(|v| v as f64 / ITN_SCALE)
        .map_err(|_| RouteError::InvalidNumber {
            line,
            field,
            value: value.to_string(),
        })
}

pub fn load_itn_file(path: impl AsRef<Path>) -> Result<Route, RouteError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| RouteError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_itn(&text)
}

/// All `*.itn` files directly inside `dir`, sorted by file name.
pub fn list_route_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, RouteError> {
    let dir = dir.as_ref();
    let io_err = |source| RouteError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        let is_itn = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(ITN_EXTENSION));
        if is_itn && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "0845453|4902352|Point 1 |0|\n\
                          0848501|4900249|Point 2 |0|\n\
                          0849295|4899460|Point 3 |0|\n";

    #[test]
    fn test_parse_itn_sample() {
        let route = parse_itn(SAMPLE).unwrap();
        assert_eq!(route.len(), 3);

        let first = &route.waypoints()[0];
        assert!((first.coordinate.longitude() - 8.45453).abs() < 1e-9);
        assert!((first.coordinate.latitude() - 49.02352).abs() < 1e-9);
        assert_eq!(first.label.as_deref(), Some("Point 1"));
    }

    #[test]
    fn test_parse_itn_minimal_and_negative_records() {
        let route = parse_itn("-0012345|-3300000\n\n  \n0000000|0000000|\r\n").unwrap();
        assert_eq!(route.len(), 2);
        assert!((route.get(0).unwrap().longitude() + 0.12345).abs() < 1e-9);
        assert!((route.get(0).unwrap().latitude() + 33.0).abs() < 1e-9);
        assert_eq!(route.waypoints()[1].label, None);
    }

    #[test]
    fn test_parse_itn_empty_text_is_empty_route() {
        assert!(parse_itn("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_itn_reports_missing_fields_line() {
        let err = parse_itn("0845453|4902352|A|0|\n0848501\n").unwrap_err();
        match err {
            RouteError::MissingFields { line, found } => {
                assert_eq!(line, 2);
                assert_eq!(found, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parse_itn_reports_non_numeric_field() {
        let err = parse_itn("\n0845453|49.02352|A|0|\n").unwrap_err();
        assert!(matches!(
            err,
            RouteError::InvalidNumber { line: 2, field: "latitude", .. }
        ));
        assert!(err.to_string().starts_with("line 2:"));
    }

    #[test]
    fn test_parse_itn_rejects_out_of_range() {
        let err = parse_itn("0845453|9500000|A|0|\n").unwrap_err();
        assert!(matches!(err, RouteError::InvalidCoordinate { line: 1, .. }));
    }

    #[test]
    fn test_route_length() {
        let route = Route::from_coordinates([
            Coordinate::new(0.0, 0.0).unwrap(),
            Coordinate::new(1.0, 0.0).unwrap(),
            Coordinate::new(2.0, 0.0).unwrap(),
        ]);
        assert!((route.length_km() - 2.0 * 111.195).abs() < 0.05);
        assert_eq!(Route::default().length_km(), 0.0);
    }

    #[test]
    fn test_load_and_list_route_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("b_route.ITN")).unwrap();
        f.write_all(SAMPLE.as_bytes()).unwrap();
        std::fs::write(dir.path().join("a_route.itn"), "0845453|4902352|\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let files = list_route_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a_route.itn", "b_route.ITN"]);

        let route = load_itn_file(&files[1]).unwrap();
        assert_eq!(route.len(), 3);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.itn");
        match load_itn_file(&missing) {
            Err(RouteError::Io { path, .. }) => assert_eq!(path, missing),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
