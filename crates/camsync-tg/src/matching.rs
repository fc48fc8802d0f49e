//! Decides which of the remote media records corresponds to the local file.
//!
//! The rules are ranked by confidence. Evidence from the file name always
//! outranks the timing coincidence, because timing alone can't tell apart
//! several uploads that are in flight at the same time.

use crate::photos::{MediaId, MediaRecord};
use chrono::prelude::*;
use itertools::Itertools;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum NameRule {
    /// Same file name stem, ignoring case and separators
    Exact,

    /// One of the stems contains the other one. The local stem found inside
    /// of the remote one outranks the opposite direction.
    Substring,

    /// Both names have at least [`MIN_COMMON_WORDS`] meaningful words in common
    WordOverlap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Confidence {
    Name(NameRule),

    /// Lower-confidence match, the record was created close in time to
    /// the moment when the local file was queued.
    Timing { offset: chrono::Duration },
}

impl Confidence {
    pub(crate) fn is_low(&self) -> bool {
        matches!(self, Confidence::Timing { .. })
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::Name(rule) => {
                let rule: &'static str = rule.into();
                write!(f, "name ({rule})")
            }
            Confidence::Timing { offset } => {
                write!(f, "timing ({}s after queueing)", offset.num_seconds())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Match<'a> {
    pub(crate) record: &'a MediaRecord,
    pub(crate) confidence: Confidence,
}

/// Bounds for the creation time of the record relative to the moment the
/// local file was queued.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimeWindow {
    pub(crate) before: chrono::Duration,
    pub(crate) after: chrono::Duration,
}

impl TimeWindow {
    fn contains(&self, offset: chrono::Duration) -> bool {
        -self.before <= offset && offset <= self.after
    }
}

/// Word overlap rule accepts the names that have at least this many
/// meaningful words in common.
const MIN_COMMON_WORDS: usize = 2;

/// Words of this length or shorter are too common to be meaningful.
const MAX_TRIVIAL_WORD_LEN: usize = 3;

#[derive(Clone, Copy)]
pub(crate) struct MatchQuery<'a> {
    pub(crate) local_name: &'a str,
    pub(crate) queued_at: DateTime<Utc>,
    pub(crate) window: TimeWindow,

    /// Records that were in the catalog before the upload of the file began.
    /// The timing rule never picks them. If it's `None`, nothing is known
    /// about the upload yet, and the timing rule is not applied at all.
    pub(crate) baseline: Option<&'a HashSet<MediaId>>,
}

/// Returns the record that corresponds to the local file, if any.
///
/// Each rule is tried against every candidate before falling back to the
/// next, less confident one. Only video records are candidates.
pub(crate) fn find_match<'a>(
    query: &MatchQuery<'_>,
    records: &'a [MediaRecord],
) -> Option<Match<'a>> {
    let videos = || records.iter().filter(|record| record.is_video());

    if let Some((record, rule)) = find_by_name(query.local_name, videos()) {
        return Some(Match {
            record,
            confidence: Confidence::Name(rule),
        });
    }

    let baseline = query.baseline?;
    let fresh = videos().filter(|record| !baseline.contains(&record.id));

    find_by_time(query.queued_at, query.window, fresh).map(|(record, offset)| Match {
        record,
        confidence: Confidence::Timing { offset },
    })
}

fn find_by_name<'a>(
    local_name: &str,
    candidates: impl Iterator<Item = &'a MediaRecord> + Clone,
) -> Option<(&'a MediaRecord, NameRule)> {
    let local = normalize_stem(local_name);

    let exact = || {
        candidates
            .clone()
            .find(|record| normalize_stem(&record.filename) == local)
    };

    let local_in_remote = || {
        candidates
            .clone()
            .find(|record| is_meaningful_substring(&normalize_stem(&record.filename), &local))
    };

    let remote_in_local = || {
        candidates
            .clone()
            .find(|record| is_meaningful_substring(&local, &normalize_stem(&record.filename)))
    };

    let word_overlap = || {
        let local_words = meaningful_words(&local);
        candidates
            .clone()
            .map(|record| {
                let remote = normalize_stem(&record.filename);
                let common = local_words.intersection(&meaningful_words(&remote)).count();
                (record, common)
            })
            .filter(|(_, common)| *common >= MIN_COMMON_WORDS)
            // `max_by_key` returns the last maximum, but we want the first
            // one in the catalog order (the newest one)
            .min_by_key(|(_, common)| std::cmp::Reverse(*common))
            .map(|(record, _)| record)
    };

    exact()
        .map(|record| (record, NameRule::Exact))
        .or_else(|| local_in_remote().map(|record| (record, NameRule::Substring)))
        .or_else(|| remote_in_local().map(|record| (record, NameRule::Substring)))
        .or_else(|| word_overlap().map(|record| (record, NameRule::WordOverlap)))
}

fn find_by_time<'a>(
    queued_at: DateTime<Utc>,
    window: TimeWindow,
    candidates: impl Iterator<Item = &'a MediaRecord>,
) -> Option<(&'a MediaRecord, chrono::Duration)> {
    candidates
        .map(|record| (record, record.creation_time - queued_at))
        .filter(|(_, offset)| window.contains(*offset))
        // `min_by_key` returns the first minimum, so ties are resolved in
        // favor of the record that comes first in the catalog order.
        .min_by_key(|(_, offset)| offset.num_milliseconds().abs())
}

/// Lowercased file name without the extension where the common separators
/// are replaced with single spaces.
pub(crate) fn normalize_stem(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|stem| stem.to_string_lossy())
        .unwrap_or_default();

    stem.to_lowercase()
        .split(|char: char| char.is_whitespace() || matches!(char, '.' | '_' | '-'))
        .filter(|word| !word.is_empty())
        .join(" ")
}

/// Short needles like `1` or `vid` are found inside of nearly any name
fn is_meaningful_substring(haystack: &str, needle: &str) -> bool {
    needle.chars().count() > MAX_TRIVIAL_WORD_LEN && haystack.contains(needle)
}

fn meaningful_words(normalized: &str) -> BTreeSet<&str> {
    normalized
        .split_whitespace()
        .filter(|word| word.chars().count() > MAX_TRIVIAL_WORD_LEN)
        .filter(|word| !word.chars().all(|char| char.is_ascii_digit()))
        .collect()
}
