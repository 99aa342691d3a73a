use regex::Regex;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::intake::{ExtractedFile, FileKind};

pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.82;

/// Two fuzzy candidates closer than this are treated as a tie and the
/// submission goes to the manual queue instead of guessing.
const AMBIGUITY_MARGIN: f64 = 0.05;

const METADATA_MARKER_FILES: [&str; 2] = ["student_id.txt", "metadata.txt"];
const METADATA_MAX_BYTES: u64 = 4096;

#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub student_id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Match {
    pub student_id: String,
    pub method: &'static str,
    pub confidence: f64,
}

/// Resolve a submission to a roster student. Filename heuristics run
/// first, then metadata probing of the extracted content; `None` means
/// the submission belongs in the unmatched queue.
pub fn resolve(
    archive_name: &str,
    files: &[ExtractedFile],
    roster: &[RosterEntry],
    fuzzy_threshold: f64,
) -> Option<Match> {
    if let Some(m) = match_filename(archive_name, roster, fuzzy_threshold) {
        return Some(m);
    }
    match_metadata(files, roster)
}

fn match_filename(
    archive_name: &str,
    roster: &[RosterEntry],
    fuzzy_threshold: f64,
) -> Option<Match> {
    let stem = Path::new(archive_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(archive_name);

    // Exact id token beats everything.
    for token in stem.split(|c: char| !c.is_alphanumeric()) {
        if token.is_empty() {
            continue;
        }
        if let Some(entry) = roster
            .iter()
            .find(|r| r.student_id.eq_ignore_ascii_case(token))
        {
            return Some(Match {
                student_id: entry.student_id.clone(),
                method: "filename",
                confidence: 1.0,
            });
        }
    }

    // Fuzzy name match against the stem, best-candidate-wins unless the
    // runner-up is too close to call.
    let stem_norm = normalize(stem);
    if stem_norm.is_empty() {
        return None;
    }
    let mut scored: Vec<(&RosterEntry, f64)> = roster
        .iter()
        .map(|e| (e, name_similarity(&stem_norm, &e.name)))
        .collect();
    scored.sort_by(|x, y| y.1.partial_cmp(&x.1).unwrap_or(std::cmp::Ordering::Equal));
    let (entry, sim) = *scored.first()?;
    let runner_up = scored.get(1).map(|(_, s)| *s).unwrap_or(0.0);
    if sim < fuzzy_threshold || sim - runner_up < AMBIGUITY_MARGIN {
        return None;
    }
    Some(Match {
        student_id: entry.student_id.clone(),
        method: "filename",
        confidence: sim,
    })
}

fn match_metadata(files: &[ExtractedFile], roster: &[RosterEntry]) -> Option<Match> {
    // Marker files first: a plain id dropped in by the submission tool.
    for f in files {
        if f.is_corrupt {
            continue;
        }
        let base = Path::new(&f.rel_path)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("");
        if !METADATA_MARKER_FILES
            .iter()
            .any(|m| base.eq_ignore_ascii_case(m))
        {
            continue;
        }
        if f.size_bytes > METADATA_MAX_BYTES {
            continue;
        }
        if let Ok(content) = std::fs::read_to_string(&f.cache_path) {
            if let Some(entry) = find_roster_id(&content, roster) {
                return Some(Match {
                    student_id: entry.student_id.clone(),
                    method: "metadata",
                    confidence: 0.9,
                });
            }
        }
    }

    // Office packages record an author in docProps/core.xml.
    for f in files {
        if f.is_corrupt {
            continue;
        }
        if !matches!(f.kind, FileKind::Spreadsheet | FileKind::Document) {
            continue;
        }
        if let Some(creator) = office_creator(&f.cache_path) {
            if let Some(entry) = find_roster_id(&creator, roster) {
                return Some(Match {
                    student_id: entry.student_id.clone(),
                    method: "metadata",
                    confidence: 0.9,
                });
            }
        }
    }

    None
}

fn find_roster_id<'a>(text: &str, roster: &'a [RosterEntry]) -> Option<&'a RosterEntry> {
    for token in text.split(|c: char| !c.is_alphanumeric()) {
        if token.is_empty() {
            continue;
        }
        if let Some(entry) = roster
            .iter()
            .find(|r| r.student_id.eq_ignore_ascii_case(token))
        {
            return Some(entry);
        }
    }
    None
}

/// Pull `dc:creator` out of an OOXML package, if the file is one.
fn office_creator(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    let mut archive = zip::ZipArchive::new(file).ok()?;
    let mut xml = String::new();
    archive
        .by_name("docProps/core.xml")
        .ok()?
        .take(METADATA_MAX_BYTES)
        .read_to_string(&mut xml)
        .ok()?;
    let re = Regex::new(r"<dc:creator>([^<]*)</dc:creator>").ok()?;
    let creator = re.captures(&xml)?.get(1)?.as_str().trim().to_string();
    if creator.is_empty() {
        None
    } else {
        Some(creator)
    }
}

/// Similarity in [0, 1] between a normalized filename stem and a roster
/// name, taking the best over "First Last" / "Last First" orderings so
/// "jane_doe_hw1" and "Doe, Jane" line up.
fn name_similarity(stem_norm: &str, name: &str) -> f64 {
    let parts: Vec<String> = name
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect();
    if parts.is_empty() {
        return 0.0;
    }

    let forward = parts.join("");
    let reversed: String = parts.iter().rev().map(String::as_str).collect();

    similarity(stem_norm, &forward).max(similarity(stem_norm, &reversed))
}

fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphabetic())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    // The stem usually carries extra noise (assignment name, "final_v2");
    // score the shorter string against its best-aligned window of the
    // longer one.
    let (short, long) = if a.chars().count() <= b.chars().count() {
        (a, b)
    } else {
        (b, a)
    };
    let short_chars: Vec<char> = short.chars().collect();
    let long_chars: Vec<char> = long.chars().collect();
    if short_chars.len() < long_chars.len() {
        let window = short_chars.len();
        let mut best = 0.0f64;
        for start in 0..=(long_chars.len() - window) {
            let dist = levenshtein(&short_chars, &long_chars[start..start + window]);
            let sim = 1.0 - dist as f64 / window as f64;
            if sim > best {
                best = sim;
            }
        }
        best
    } else {
        let dist = levenshtein(&short_chars, &long_chars);
        1.0 - dist as f64 / long_chars.len() as f64
    }
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> Vec<RosterEntry> {
        vec![
            RosterEntry {
                student_id: "S10293".into(),
                name: "Doe, Jane".into(),
            },
            RosterEntry {
                student_id: "S55555".into(),
                name: "Smith, Alex".into(),
            },
        ]
    }

    #[test]
    fn exact_id_in_filename_wins() {
        let m = match_filename("S10293_hw1.zip", &roster(), DEFAULT_FUZZY_THRESHOLD).unwrap();
        assert_eq!(m.student_id, "S10293");
        assert_eq!(m.method, "filename");
        assert_eq!(m.confidence, 1.0);
    }

    #[test]
    fn unrecognizable_name_does_not_match() {
        assert!(match_filename("final_submission.zip", &roster(), DEFAULT_FUZZY_THRESHOLD).is_none());
    }

    #[test]
    fn fuzzy_name_matches_above_threshold() {
        let m = match_filename("jane_doe_hw1.zip", &roster(), DEFAULT_FUZZY_THRESHOLD).unwrap();
        assert_eq!(m.student_id, "S10293");
        assert!(m.confidence >= DEFAULT_FUZZY_THRESHOLD);
        assert!(m.confidence < 1.0 + f64::EPSILON);
    }

    #[test]
    fn levenshtein_basics() {
        let a: Vec<char> = "kitten".chars().collect();
        let b: Vec<char> = "sitting".chars().collect();
        assert_eq!(levenshtein(&a, &b), 3);
        assert_eq!(levenshtein(&a, &a), 0);
    }
}
