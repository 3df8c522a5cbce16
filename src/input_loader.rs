use std::fs::{self, File};
use std::path::Path;

use calamine::{open_workbook_auto, Reader};
use log::{error, info, warn};

use crate::error::{Error, Result};
use crate::model::KeywordJob;

/// A location for keyword expansion, optionally with the coordinates the
/// generated keywords should be checked from.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationRecord {
    pub name: String,
    pub coordinate: Option<(f64, f64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Text,
    Csv,
    Excel,
}

fn detect_format(path: &Path) -> Format {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "xlsx" | "xlsm" | "xls" | "ods" => Format::Excel,
        "txt" => Format::Text,
        _ => Format::Csv,
    }
}

/// Reads every row of a CSV, spreadsheet (first sheet) or text file as
/// trimmed strings. Text files yield one single-cell row per line.
pub fn read_table<P: AsRef<Path>>(path: P) -> Result<Vec<Vec<String>>> {
    let path = path.as_ref();
    if !path.exists() {
        error!("Input file {:?} does not exist.", path);
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("input file {:?} does not exist", path),
        )));
    }

    let rows = match detect_format(path) {
        Format::Text => fs::read_to_string(path)?
            .lines()
            .map(|l| vec![l.trim().to_string()])
            .collect(),
        Format::Csv => read_csv(path)?,
        Format::Excel => read_excel(path)?,
    };
    info!("Read {} rows from {:?}", rows.len(), path);
    Ok(rows)
}

fn read_csv(path: &Path) -> Result<Vec<Vec<String>>> {
    let file = File::open(path)?;
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let mut rows = Vec::new();
    for record in rdr.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

fn read_excel(path: &Path) -> Result<Vec<Vec<String>>> {
    let mut workbook = open_workbook_auto(path)?;
    let worksheets = workbook.worksheets();
    let Some((name, range)) = worksheets.first() else {
        warn!("Workbook {:?} has no worksheets", path);
        return Ok(Vec::new());
    };
    info!("Reading worksheet {:?} of {:?}", name, path);
    Ok(range
        .rows()
        .map(|row| row.iter().map(|c| c.to_string().trim().to_string()).collect())
        .collect())
}

fn is_blank(row: &[String]) -> bool {
    row.iter().all(|c| c.is_empty())
}

/// Finds the first column whose lower-cased header equals one of `names`.
fn find_column(header: &[String], names: &[&str]) -> Option<usize> {
    header
        .iter()
        .position(|h| names.contains(&h.to_lowercase().as_str()))
}

/// Loads ranking jobs. The first row is a header naming the `keyword`,
/// `latitude` (or `lat`) and `longitude` (or `lng`/`long`) columns; each job's
/// row id is its 1-based row number in the file. Rows without a keyword or
/// with unusable coordinates are skipped with a warning.
pub fn load_jobs<P: AsRef<Path>>(path: P) -> Result<Vec<KeywordJob>> {
    let path = path.as_ref();
    let rows = read_table(path)?;
    let Some((header, data)) = rows.split_first() else {
        return Err(Error::validation(format!("{:?} is empty", path)));
    };

    let keyword_idx = find_column(header, &["keyword", "keywords", "generated keyword"]);
    let lat_idx = find_column(header, &["latitude", "lat"]);
    let lng_idx = find_column(header, &["longitude", "lng", "long", "lon"]);
    let (Some(keyword_idx), Some(lat_idx), Some(lng_idx)) = (keyword_idx, lat_idx, lng_idx) else {
        return Err(Error::validation(format!(
            "{:?} needs keyword, latitude and longitude header columns, found {:?}",
            path, header
        )));
    };

    let mut jobs = Vec::new();
    for (i, row) in data.iter().enumerate() {
        let row_number = i as u64 + 2;
        if is_blank(row) {
            continue;
        }
        let cell = |idx: usize| row.get(idx).map(String::as_str).unwrap_or("");
        let keyword = cell(keyword_idx);
        if keyword.is_empty() {
            warn!("Row {}: no keyword, skipping", row_number);
            continue;
        }
        match (cell(lat_idx).parse::<f64>(), cell(lng_idx).parse::<f64>()) {
            (Ok(lat), Ok(lng)) if lat.is_finite() && lng.is_finite() => {
                jobs.push(KeywordJob::new(keyword, lat, lng, row_number));
            }
            _ => warn!(
                "Row {}: invalid coordinates {:?},{:?} for {:?}, skipping",
                row_number,
                cell(lat_idx),
                cell(lng_idx),
                keyword
            ),
        }
    }

    info!("Loaded {} jobs from {:?}", jobs.len(), path);
    Ok(jobs)
}

/// Loads a single-column list (templates, plain locations). CSV and
/// spreadsheet files start with a header row; text files do not.
pub fn load_list<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let rows = read_table(path)?;
    let skip = usize::from(detect_format(path) != Format::Text);
    Ok(rows
        .into_iter()
        .skip(skip)
        .filter_map(|row| row.into_iter().next())
        .filter(|v| !v.is_empty())
        .collect())
}

/// Loads niche rows (`service, core_keyword`) after the header row. Trailing
/// empty cells are dropped so the expander sees the real column count.
pub fn load_niche<P: AsRef<Path>>(path: P) -> Result<Vec<Vec<String>>> {
    let rows = read_table(path)?;
    Ok(rows
        .into_iter()
        .skip(1)
        .filter(|row| !is_blank(row))
        .map(|mut row| {
            while row.last().is_some_and(|c| c.is_empty()) {
                row.pop();
            }
            row
        })
        .collect())
}

/// Loads locations. With a header carrying `latitude`/`longitude` columns the
/// coordinates are kept; the name comes from a `location`, `city` or `name`
/// column, else the first one.
pub fn load_locations<P: AsRef<Path>>(path: P) -> Result<Vec<LocationRecord>> {
    let path = path.as_ref();
    if detect_format(path) == Format::Text {
        return Ok(load_list(path)?
            .into_iter()
            .map(|name| LocationRecord { name, coordinate: None })
            .collect());
    }

    let rows = read_table(path)?;
    let Some((header, data)) = rows.split_first() else {
        return Ok(Vec::new());
    };
    let name_idx = find_column(header, &["location", "locations", "city", "name"]).unwrap_or(0);
    let lat_idx = find_column(header, &["latitude", "lat"]);
    let lng_idx = find_column(header, &["longitude", "lng", "long", "lon"]);

    let mut out = Vec::new();
    for (i, row) in data.iter().enumerate() {
        let Some(name) = row.get(name_idx).filter(|n| !n.is_empty()) else {
            continue;
        };
        let parse = |idx: Option<usize>| {
            idx.and_then(|i| row.get(i)).and_then(|v| v.parse::<f64>().ok())
        };
        let coordinate = match (parse(lat_idx), parse(lng_idx)) {
            (Some(lat), Some(lng)) => Some((lat, lng)),
            _ => {
                if lat_idx.is_some() {
                    warn!("Location {:?} (row {}) has no usable coordinates", name, i + 2);
                }
                None
            }
        };
        out.push(LocationRecord { name: name.clone(), coordinate });
    }
    info!("Loaded {} locations from {:?}", out.len(), path);
    Ok(out)
}
