//! Candidate scoring for track lookup results

use super::Video;
use crate::track::Track;

/// Candidates outside this window (seconds) are never considered
pub const MIN_CANDIDATE_SECONDS: u32 = 30;
pub const MAX_CANDIDATE_SECONDS: u32 = 900;

/// Best candidates scoring below this are rejected
pub const MIN_ACCEPTED_SCORE: f64 = 1.0;

const TITLE_WEIGHT: f64 = 50.0;
const ARTIST_WEIGHT: f64 = 30.0;
const DURATION_WEIGHT: f64 = 20.0;
const TITLE_CONTAINS_BONUS: f64 = 10.0;
const DISQUALIFIER_PENALTY: f64 = 15.0;

const DISQUALIFYING_TERMS: [&str; 7] = [
    "cover",
    "remix",
    "reaction",
    "tutorial",
    "instrumental",
    "karaoke",
    "live",
];

fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Similarity in [0, 1] between two free-text strings
pub fn string_similarity(a: &str, b: &str) -> f64 {
    let s1 = a.trim().to_lowercase();
    let s2 = b.trim().to_lowercase();
    if s1.is_empty() || s2.is_empty() {
        return 0.0;
    }

    if s1 == s2 {
        return 1.0;
    }
    if s1.contains(&s2) || s2.contains(&s1) {
        return 0.8;
    }

    let n1 = normalize(&s1);
    let n2 = normalize(&s2);
    if !n1.is_empty() && n1 == n2 {
        return 0.9;
    }
    if !n1.is_empty() && !n2.is_empty() && (n1.contains(&n2) || n2.contains(&n1)) {
        return 0.7;
    }

    let words1: Vec<&str> = n1.split(' ').filter(|w| w.chars().count() > 2).collect();
    let words2: Vec<&str> = n2.split(' ').filter(|w| w.chars().count() > 2).collect();
    if words1.is_empty() || words2.is_empty() {
        return 0.0;
    }

    let common = words1
        .iter()
        .filter(|w1| words2.iter().any(|w2| w1.contains(w2) || w2.contains(*w1)))
        .count();

    common as f64 / words1.len().max(words2.len()) as f64
}

pub fn within_duration_window(video: &Video) -> bool {
    let secs = video.length_seconds.unwrap_or(0);
    (MIN_CANDIDATE_SECONDS..=MAX_CANDIDATE_SECONDS).contains(&secs)
}

/// Weighted score of `candidate` for `track`; higher is better
pub fn score_candidate(candidate: &Video, track: &Track) -> f64 {
    let candidate_title = candidate.title.to_lowercase();
    let track_name = track.name.to_lowercase();

    let mut score = string_similarity(&candidate_title, &track_name) * TITLE_WEIGHT;

    let artists = track
        .artists
        .iter()
        .map(|a| a.name.as_str())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    if !artists.is_empty() {
        let from_title = string_similarity(&candidate_title, &artists);
        let from_author = candidate
            .author
            .as_deref()
            .map(|author| string_similarity(author, &artists))
            .unwrap_or(0.0);
        score += from_title.max(from_author) * ARTIST_WEIGHT;
    }

    if let (Some(candidate_secs), Some(track_ms)) = (candidate.length_seconds, track.duration_ms) {
        if candidate_secs > 0 && track_ms > 0 {
            let diff = (candidate_secs as f64 * 1000.0 - track_ms as f64).abs();
            let tolerance = (track_ms as f64 * 0.35).max(45_000.0);
            score += (1.0 - diff / tolerance).max(0.0) * DURATION_WEIGHT;
        }
    }

    if !track_name.is_empty()
        && !candidate_title.is_empty()
        && (candidate_title.contains(&track_name) || track_name.contains(&candidate_title))
    {
        score += TITLE_CONTAINS_BONUS;
    }

    if DISQUALIFYING_TERMS
        .iter()
        .any(|term| candidate_title.contains(term) && !track_name.contains(term))
    {
        score -= DISQUALIFIER_PENALTY;
    }

    score
}

/// Pick the best in-window candidate, or `None` when nothing scores high enough
pub fn select_best<'a>(candidates: &'a [Video], track: &Track) -> Option<(&'a Video, f64)> {
    candidates
        .iter()
        .filter(|v| within_duration_window(v))
        .map(|v| (v, score_candidate(v, track)))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .filter(|(_, score)| *score >= MIN_ACCEPTED_SCORE)
}
