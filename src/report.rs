use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use chrono::Local;
use log::info;

use crate::error::Result;
use crate::input_loader::LocationRecord;
use crate::keyword_expander::ExpandedKeyword;
use crate::model::{OutcomeRecord, TaskOutcome};

/// Writes the expanded keyword table. When locations carry coordinates the
/// rows get `latitude`/`longitude` columns, so the file can be fed straight
/// back in as a job list.
pub fn write_keywords<W: Write>(
    writer: W,
    keywords: &[ExpandedKeyword],
    locations: &[LocationRecord],
) -> Result<usize> {
    let coords: HashMap<&str, (f64, f64)> = locations
        .iter()
        .filter_map(|l| l.coordinate.map(|c| (l.name.as_str(), c)))
        .collect();
    let with_coords = !coords.is_empty();

    let mut wtr = csv::Writer::from_writer(writer);
    let mut header = vec!["service", "location", "core_keyword", "keyword"];
    if with_coords {
        header.extend(["latitude", "longitude"]);
    }
    wtr.write_record(&header)?;

    for kw in keywords {
        let mut row: Vec<String> = kw.as_row().iter().map(|s| s.to_string()).collect();
        if with_coords {
            match coords.get(kw.location.as_str()) {
                Some((lat, lng)) => row.extend([lat.to_string(), lng.to_string()]),
                None => row.extend([String::new(), String::new()]),
            }
        }
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(keywords.len())
}

pub fn write_keywords_file<P: AsRef<Path>>(
    path: P,
    keywords: &[ExpandedKeyword],
    locations: &[LocationRecord],
) -> Result<usize> {
    let n = write_keywords(File::create(path.as_ref())?, keywords, locations)?;
    info!("Wrote {} keywords to {:?}", n, path.as_ref());
    Ok(n)
}

/// Writes one CSV row per outcome: rank (or status), url (or status), the
/// status label, the failure reason and when it was recorded. With
/// `include_raw` the provider's task payload is appended as compact JSON.
pub fn write_outcomes<'a, W, I>(writer: W, records: I, include_raw: bool) -> Result<usize>
where
    W: Write,
    I: IntoIterator<Item = &'a OutcomeRecord>,
{
    let mut wtr = csv::Writer::from_writer(writer);
    let mut header = vec![
        "row",
        "keyword",
        "ranking_position",
        "ranking_url",
        "status",
        "reason",
        "recorded_at",
    ];
    if include_raw {
        header.push("raw_payload");
    }
    wtr.write_record(&header)?;

    let mut n = 0;
    for record in records {
        let (rank, url, reason) = match &record.outcome {
            TaskOutcome::Completed(m) => (m.rank.to_string(), m.url.clone(), String::new()),
            TaskOutcome::Failed(reason) => {
                let label = if record.outcome.status_label() == "not_found" { "Not Found" } else { "Error" };
                (label.to_string(), label.to_string(), reason.clone())
            }
            TaskOutcome::Pending => ("Pending".to_string(), "Pending".to_string(), String::new()),
        };
        let recorded_at = record
            .recorded_at
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        let mut row = vec![
            record.row_id.to_string(),
            record.keyword.clone(),
            rank,
            url,
            record.outcome.status_label().to_string(),
            reason,
            recorded_at,
        ];
        if include_raw {
            let raw = match &record.raw_payload {
                Some(v) => serde_json::to_string(v)?,
                None => String::new(),
            };
            row.push(raw);
        }
        wtr.write_record(&row)?;
        n += 1;
    }
    wtr.flush()?;
    Ok(n)
}

pub fn write_outcomes_file<'a, P, I>(path: P, records: I, include_raw: bool) -> Result<usize>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = &'a OutcomeRecord>,
{
    let n = write_outcomes(File::create(path.as_ref())?, records, include_raw)?;
    info!("Exported {} outcomes to {:?}", n, path.as_ref());
    Ok(n)
}
