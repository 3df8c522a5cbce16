use std::collections::HashSet;

use serde::Serialize;

use crate::error::{Error, Result};

/// One generated keyword: `[service, location, core_keyword, keyword]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpandedKeyword {
    pub service: String,
    pub location: String,
    pub core_keyword: String,
    pub keyword: String,
}

impl ExpandedKeyword {
    pub fn as_row(&self) -> [&str; 4] {
        [&self.service, &self.location, &self.core_keyword, &self.keyword]
    }
}

/// Cross product of templates x niche rows x locations.
///
/// Ordering is location, then niche row, then template. Placeholders are
/// replaced literally (no pattern syntax) and the result is lower-cased.
/// Blank template/location entries are dropped; niche rows must be exactly
/// `[service, core_keyword]`, both non-empty.
pub fn expand<T, L, R, C>(
    templates: &[T],
    niche: &[R],
    locations: &[L],
    niche_placeholder: &str,
    location_placeholder: &str,
) -> Result<Vec<ExpandedKeyword>>
where
    T: AsRef<str>,
    L: AsRef<str>,
    R: AsRef<[C]>,
    C: AsRef<str>,
{
    let templates = normalize_list(templates);
    let locations = normalize_list(locations);
    let niche_rows = normalize_niche(niche)?;
    let niche_ph = niche_placeholder.trim();
    let location_ph = location_placeholder.trim();

    if templates.is_empty() {
        return Err(Error::validation("no templates provided"));
    }
    if niche_rows.is_empty() {
        return Err(Error::validation(
            "no niche rows provided, expected two columns: service, core_keyword",
        ));
    }
    if locations.is_empty() {
        return Err(Error::validation("no locations provided"));
    }
    if niche_ph.is_empty() {
        return Err(Error::validation("niche placeholder is empty"));
    }
    if location_ph.is_empty() {
        return Err(Error::validation("location placeholder is empty"));
    }

    let mut out = Vec::with_capacity(templates.len() * niche_rows.len() * locations.len());
    for location in &locations {
        for (service, core_keyword) in &niche_rows {
            for template in &templates {
                let keyword = template
                    .replace(niche_ph, core_keyword)
                    .replace(location_ph, location)
                    .to_lowercase();
                out.push(ExpandedKeyword {
                    service: service.to_string(),
                    location: location.to_string(),
                    core_keyword: core_keyword.to_string(),
                    keyword,
                });
            }
        }
    }
    Ok(out)
}

/// Keeps the niche rows whose service column contains `service`, ignoring case.
pub fn filter_service(rows: Vec<Vec<String>>, service: &str) -> Vec<Vec<String>> {
    let needle = service.trim().to_lowercase();
    rows.into_iter()
        .filter(|row| {
            row.first()
                .is_some_and(|s| s.trim().to_lowercase().contains(&needle))
        })
        .collect()
}

/// Drops repeated `(service, core_keyword)` rows, keeping the first one.
/// Rows of any other shape pass through for `expand` to reject.
pub fn dedupe_niche(rows: Vec<Vec<String>>) -> Vec<Vec<String>> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|row| match row.as_slice() {
            [service, core] => seen.insert((service.trim().to_string(), core.trim().to_string())),
            _ => true,
        })
        .collect()
}

fn normalize_list<S: AsRef<str>>(values: &[S]) -> Vec<&str> {
    values
        .iter()
        .map(|v| v.as_ref().trim())
        .filter(|v| !v.is_empty())
        .collect()
}

fn normalize_niche<'a, R, C>(rows: &'a [R]) -> Result<Vec<(&'a str, &'a str)>>
where
    R: AsRef<[C]>,
    C: AsRef<str> + 'a,
{
    rows.iter()
        .enumerate()
        .map(|(i, row)| match row.as_ref() {
            [service, core] => {
                let (service, core) = (service.as_ref().trim(), core.as_ref().trim());
                if service.is_empty() || core.is_empty() {
                    Err(Error::validation(format!(
                        "niche row {} has an empty service or core keyword",
                        i + 1
                    )))
                } else {
                    Ok((service, core))
                }
            }
            other => Err(Error::validation(format!(
                "niche row {} has {} columns, expected 2 (service, core_keyword)",
                i + 1,
                other.len()
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_ROWS: [[&str; 2]; 0] = [];
    const NONE: [&str; 0] = [];

    #[test]
    fn single_combination() {
        let out = expand(
            &["{kw} near {loc}"],
            &[["wildlife", "raccoon removal"]],
            &["Dallas"],
            "{kw}",
            "{loc}",
        )
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].as_row(),
            ["wildlife", "Dallas", "raccoon removal", "raccoon removal near dallas"]
        );
    }

    #[test]
    fn size_and_order_of_cross_product() {
        let templates = ["{kw}", "{kw} {loc}", "{loc} {kw}"];
        let niche = [["svc a", "Bat Removal"], ["svc b", "Mole Control"]];
        let locations = ["Plano", "Frisco"];
        let out = expand(&templates, &niche, &locations, "{kw}", "{loc}").unwrap();

        assert_eq!(out.len(), templates.len() * niche.len() * locations.len());
        let keywords: Vec<&str> = out.iter().map(|k| k.keyword.as_str()).collect();
        assert_eq!(
            keywords[..6],
            [
                "bat removal",
                "bat removal plano",
                "plano bat removal",
                "mole control",
                "mole control plano",
                "plano mole control",
            ]
        );
        assert_eq!(out[6].location, "Frisco");
    }

    #[test]
    fn placeholders_are_literal_not_patterns() {
        let out = expand(
            &["best $kw$ in (.*)"],
            &[["svc", "a+b"]],
            &["St. Louis"],
            "$kw$",
            "(.*)",
        )
        .unwrap();
        assert_eq!(out[0].keyword, "best a+b in st. louis");
    }

    #[test]
    fn every_occurrence_is_replaced() {
        let out = expand(&["{kw} {kw} {loc}"], &[["s", "X"]], &["Y"], "{kw}", "{loc}").unwrap();
        assert_eq!(out[0].keyword, "x x y");
    }

    #[test]
    fn blank_entries_are_dropped() {
        let out = expand(&["  {kw}  ", ""], &[["s", "k"]], &["", " A "], "{kw}", "{loc}").unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].location, "A");
    }

    #[test]
    fn empty_inputs_fail_validation() {
        let niche = [["s", "k"]];
        assert!(matches!(
            expand(&NONE, &niche, &["A"], "{kw}", "{loc}"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            expand(&["{kw}"], &NO_ROWS, &["A"], "{kw}", "{loc}"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            expand(&["{kw}"], &niche, &NONE, "{kw}", "{loc}"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            expand(&["{kw}"], &niche, &["A"], "  ", "{loc}"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            expand(&["{kw}"], &niche, &["A"], "{kw}", ""),
            Err(Error::Validation(_))
        ));
    }

    fn rows(cells: &[[&str; 2]]) -> Vec<Vec<String>> {
        cells.iter().map(|r| r.iter().map(|c| c.to_string()).collect()).collect()
    }

    #[test]
    fn service_filter_is_a_case_insensitive_substring_match() {
        let niche = rows(&[
            ["Wildlife Removal", "raccoon removal"],
            ["Pest Control", "ant control"],
            ["wildlife trapping", "bat trapping"],
        ]);
        let kept = filter_service(niche, "WILDLIFE");
        assert_eq!(kept, rows(&[["Wildlife Removal", "raccoon removal"], ["wildlife trapping", "bat trapping"]]));
        assert!(filter_service(kept, "roofing").is_empty());
    }

    #[test]
    fn dedupe_keeps_the_first_of_each_pair() {
        let niche = rows(&[
            ["wildlife", "raccoon removal"],
            ["wildlife", " raccoon removal "],
            ["pest", "raccoon removal"],
            ["wildlife", "bat removal"],
        ]);
        let deduped = dedupe_niche(niche);
        assert_eq!(
            deduped,
            rows(&[["wildlife", "raccoon removal"], ["pest", "raccoon removal"], ["wildlife", "bat removal"]])
        );

        let out = expand(&["{kw} {loc}"], &deduped, &["Dallas", "Plano"], "{kw}", "{loc}").unwrap();
        assert_eq!(out.len(), 3 * 2);
    }

    #[test]
    fn dedupe_leaves_malformed_rows_for_validation() {
        let niche = vec![vec!["s".to_string(), "k".to_string(), "x".to_string()]; 2];
        assert_eq!(dedupe_niche(niche).len(), 2);
    }

    #[test]
    fn malformed_niche_rows_fail_validation() {
        let three = vec![vec!["s", "k", "extra"]];
        assert!(matches!(
            expand(&["{kw}"], &three, &["A"], "{kw}", "{loc}"),
            Err(Error::Validation(_))
        ));
        let blank = [["s", " "]];
        assert!(matches!(
            expand(&["{kw}"], &blank, &["A"], "{kw}", "{loc}"),
            Err(Error::Validation(_))
        ));
    }
}
