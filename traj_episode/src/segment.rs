//! Pose tables for one subtask segment, parsed from CSV.

use csv::{ReaderBuilder, StringRecord, Trim};
use tracing::warn;

use crate::pose::Pose;
use crate::{BBox, TrajError};

/// Required pose columns with the header aliases accepted for each.
const POSE_COLUMNS: [(&str, &str); 7] = [
    ("position_x", "位置X"),
    ("position_y", "位置Y"),
    ("position_z", "位置Z"),
    ("orientation_x", "姿态X"),
    ("orientation_y", "姿态Y"),
    ("orientation_z", "姿态Z"),
    ("orientation_w", "姿态W"),
];

const BBOX_COLUMNS: [&str; 4] = ["bbox_x1", "bbox_y1", "bbox_x2", "bbox_y2"];

/// One subtask's frames in time order, with a box per frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    pub name: String,
    pub poses: Vec<Pose>,
    pub bboxes: Vec<BBox>,
}

impl Segment {
    /// A segment whose frames all carry the zero box.
    pub fn new(name: impl Into<String>, poses: Vec<Pose>) -> Self {
        let bboxes = vec![BBox::ZERO; poses.len()];
        Self {
            name: name.into(),
            poses,
            bboxes,
        }
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }
}

/// Parse a segment from CSV bytes.
///
/// All seven pose columns must be present (English or Chinese headers) or
/// the call fails with [`TrajError::MissingColumn`] before any row is read.
/// Optional `bbox_*` columns carry pixel-space boxes; blank cells read as 0.
pub fn parse_segment_csv(name: &str, input: &[u8]) -> Result<Segment, TrajError> {
    let mut reader = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(input);
    let headers = reader.headers()?.clone();

    let mut missing = Vec::new();
    let mut pose_idx = [0usize; 7];
    for (slot, (english, chinese)) in POSE_COLUMNS.iter().enumerate() {
        match find_column(&headers, &[*english, *chinese]) {
            Some(idx) => pose_idx[slot] = idx,
            None => missing.push(*english),
        }
    }
    if !missing.is_empty() {
        return Err(TrajError::MissingColumn(missing.join(", ")));
    }

    let bbox_idx: Vec<Option<usize>> = BBOX_COLUMNS
        .iter()
        .map(|c| find_column(&headers, &[*c]))
        .collect();
    let bbox_idx: Option<Vec<usize>> = match bbox_idx.iter().filter(|i| i.is_some()).count() {
        0 => None,
        4 => Some(bbox_idx.into_iter().flatten().collect()),
        n => {
            warn!(segment = name, found = n, "partial bbox columns ignored");
            None
        }
    };

    let mut poses = Vec::new();
    let mut bboxes = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let mut values = [0.0f64; 7];
        for (slot, &col) in pose_idx.iter().enumerate() {
            values[slot] = parse_cell(&record, col, row, POSE_COLUMNS[slot].0, false)?;
        }
        poses.push(Pose::new(
            [values[0], values[1], values[2]],
            [values[3], values[4], values[5], values[6]],
        ));

        let bbox = match bbox_idx.as_ref() {
            Some(cols) => {
                let mut b = [0.0; 4];
                for (slot, &col) in cols.iter().enumerate() {
                    b[slot] = parse_cell(&record, col, row, BBOX_COLUMNS[slot], true)?;
                }
                BBox(b)
            }
            None => BBox::ZERO,
        };
        bboxes.push(bbox);
    }

    Ok(Segment {
        name: name.to_string(),
        poses,
        bboxes,
    })
}

fn find_column(headers: &StringRecord, names: &[&str]) -> Option<usize> {
    headers.iter().position(|h| {
        let h = h.trim_start_matches('\u{feff}').trim();
        names.iter().any(|n| h == *n)
    })
}

fn parse_cell(
    record: &StringRecord,
    col: usize,
    row: usize,
    column: &str,
    blank_is_zero: bool,
) -> Result<f64, TrajError> {
    let raw = record.get(col).unwrap_or("");
    if raw.is_empty() && blank_is_zero {
        return Ok(0.0);
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(TrajError::InvalidValue {
            row,
            column: column.to_string(),
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chinese_headers() {
        let csv = "\u{feff}时间,位置X,位置Y,位置Z,姿态X,姿态Y,姿态Z,姿态W\n\
                   0,1.0,2.0,3.0,0,0,0,1\n\
                   1,1.5,2.0,3.0,0,0,0.1,0.995\n";
        let seg = parse_segment_csv("1-1", csv.as_bytes()).unwrap();
        assert_eq!(seg.len(), 2);
        assert_eq!(seg.poses[0].position, [1.0, 2.0, 3.0]);
        assert_eq!(seg.poses[1].orientation, [0.0, 0.0, 0.1, 0.995]);
        assert!(seg.bboxes.iter().all(BBox::is_zero));
    }

    #[test]
    fn parses_english_headers_with_bbox_columns() {
        let csv = "position_x,position_y,position_z,orientation_x,orientation_y,orientation_z,orientation_w,bbox_x1,bbox_y1,bbox_x2,bbox_y2\n\
                   0,0,0,0,0,0,1,,,,\n\
                   1,0,0,0,0,0,1,10,20,30.5,40\n";
        let seg = parse_segment_csv("a", csv.as_bytes()).unwrap();
        assert_eq!(seg.bboxes[0], BBox::ZERO);
        assert_eq!(seg.bboxes[1], BBox([10.0, 20.0, 30.5, 40.0]));
    }

    #[test]
    fn missing_columns_fail_before_rows() {
        let csv = "位置X,位置Y,姿态X,姿态Y,姿态Z,姿态W\nnot,a,number,at,all,here\n";
        match parse_segment_csv("a", csv.as_bytes()) {
            Err(TrajError::MissingColumn(cols)) => assert_eq!(cols, "position_z"),
            other => panic!("expected missing column, got {other:?}"),
        }
    }

    #[test]
    fn unreadable_value_reports_location() {
        let csv = "位置X,位置Y,位置Z,姿态X,姿态Y,姿态Z,姿态W\n0,0,0,0,0,0,1\n0,x,0,0,0,0,1\n";
        match parse_segment_csv("a", csv.as_bytes()) {
            Err(TrajError::InvalidValue { row, column, value }) => {
                assert_eq!(row, 1);
                assert_eq!(column, "position_y");
                assert_eq!(value, "x");
            }
            other => panic!("expected invalid value, got {other:?}"),
        }
    }

    #[test]
    fn header_only_file_is_an_empty_segment() {
        let csv = "位置X,位置Y,位置Z,姿态X,姿态Y,姿态Z,姿态W\n";
        let seg = parse_segment_csv("a", csv.as_bytes()).unwrap();
        assert!(seg.is_empty());
    }
}
