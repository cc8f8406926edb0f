use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::TtlCache;
use crate::config::Config;
use crate::proxy::ProxyCircuitBreaker;
use crate::service::matching::string_similarity;

/// Playlist covers below this title similarity are rejected
const PLAYLIST_MATCH_THRESHOLD: f64 = 0.6;
const TERM_MATCH_WEIGHT: f64 = 0.3;

/// Lowercase, punctuation replaced by spaces, whitespace collapsed
fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized title with version/featuring suffixes cut off
fn clean_title(text: &str) -> String {
    let normalized = normalize_text(text);
    let words: Vec<&str> = normalized.split(' ').collect();

    let cut = (0..words.len()).find(|&i| {
        let next = words.get(i + 1).copied();
        match words[i] {
            "remix" | "version" | "slow" | "slowed" | "feat" | "ft" => true,
            "sped" => next == Some("up"),
            "ao" => next == Some("vivo"),
            "super" => next == Some("slowed"),
            _ => false,
        }
    });

    match cut {
        Some(i) => words[..i].join(" "),
        None => normalized,
    }
}

/// Split "A - B", "A | B" or "A – B" at the first separator
fn split_title(name: &str) -> Option<(String, String)> {
    let (pos, sep) = name
        .char_indices()
        .skip(1)
        .find(|(_, c)| matches!(c, '-' | '|' | '–'))?;
    let first = name[..pos].trim();
    let second = name[pos + sep.len_utf8()..].trim();
    if first.is_empty() || second.is_empty() {
        return None;
    }
    Some((normalize_text(first), clean_title(second)))
}

/// Search queries for a track cover, most specific first
fn cover_queries(name: &str, artist: &str) -> (Vec<String>, Vec<String>) {
    let title = clean_title(name);
    let artist = normalize_text(artist);
    let (part1, part2) = split_title(name).unwrap_or_default();

    let mut queries = Vec::new();
    if !part1.is_empty() && !part2.is_empty() {
        queries.push(format!("track:\"{}\" artist:\"{}\"", part2, part1));
    }
    if !part1.is_empty() {
        queries.push(format!("track:\"{}\"", part1));
    }
    if !part2.is_empty() && part2 != title {
        queries.push(format!("track:\"{}\"", part2));
    }
    if !artist.is_empty() {
        let best_title = [&part2, &part1, &title]
            .into_iter()
            .find(|s| !s.is_empty())
            .cloned()
            .unwrap_or_default();
        queries.push(format!("track:\"{}\" artist:\"{}\"", best_title, artist));
    }
    if !title.is_empty() {
        queries.push(format!("track:\"{}\"", title));
    }
    if !part1.is_empty() && !part2.is_empty() {
        queries.push(format!("{} {}", part1, part2));
    }
    if !title.is_empty() {
        queries.push(title.clone());
    }

    let mut unique = Vec::new();
    for query in queries {
        if !unique.contains(&query) {
            unique.push(query);
        }
    }

    let terms = [part1, part2, title, artist]
        .into_iter()
        .filter(|term| !term.is_empty())
        .collect();
    (unique, terms)
}

fn first_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| value.get(*key).and_then(|v| v.as_str()))
        .find(|s| !s.is_empty())
}

fn data_items(payload: &Value) -> &[Value] {
    payload
        .get("data")
        .and_then(|data| data.as_array())
        .map(|items| items.as_slice())
        .unwrap_or_default()
}

/// Best album cover among search hits, scored by matching terms
fn best_track_cover(items: &[Value], terms: &[String]) -> Option<String> {
    let mut best: Option<(f64, &str)> = None;

    for item in items {
        let Some(cover) = item
            .get("album")
            .and_then(|album| first_str(album, &["cover_xl", "cover_big", "cover_medium"]))
        else {
            continue;
        };

        let title = first_str(item, &["title", "title_short"])
            .unwrap_or_default()
            .to_lowercase();
        let artist = item
            .get("artist")
            .and_then(|artist| first_str(artist, &["name"]))
            .unwrap_or_default()
            .to_lowercase();

        let mut score = 0.0;
        for term in terms {
            let term = term.to_lowercase();
            if !title.is_empty() && (title.contains(&term) || term.contains(&title)) {
                score += TERM_MATCH_WEIGHT;
            }
            if !artist.is_empty() && (artist.contains(&term) || term.contains(&artist)) {
                score += TERM_MATCH_WEIGHT;
            }
        }

        if score > 0.0 && best.map_or(true, |(top, _)| score > top) {
            best = Some((score, cover));
        }
    }

    best.map(|(_, cover)| cover.to_string())
}

/// Finds cover art through the proxy breaker and caches it
pub struct CoverResolver {
    breaker: Arc<ProxyCircuitBreaker>,
    cache: Mutex<TtlCache<String, String>>,
    search_url: String,
    playlist_search_url: String,
    fallback: String,
}

impl CoverResolver {
    pub fn new(breaker: Arc<ProxyCircuitBreaker>, config: &Config) -> Self {
        Self {
            breaker,
            cache: Mutex::new(TtlCache::new(
                Duration::from_secs(config.cache.cover_ttl_secs),
                config.cache.capacity,
            )),
            search_url: config.services.cover_search_url.clone(),
            playlist_search_url: config.services.playlist_cover_search_url.clone(),
            fallback: config.services.fallback_cover.clone(),
        }
    }

    pub fn fallback_cover(&self) -> &str {
        &self.fallback
    }

    fn search_url(base: &str, query: &str) -> String {
        format!("{}?q={}", base, urlencoding::encode(query))
    }

    /// Cover URL for a track; the fallback cover when nothing matches
    pub async fn track_cover(&self, name: &str, artist: &str) -> String {
        let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
        let artist = artist.split_whitespace().collect::<Vec<_>>().join(" ");
        if name.is_empty() {
            return self.fallback.clone();
        }

        let key = format!("{}|{}", name, artist).to_lowercase();
        let cached = self.cache.lock().get(&key);
        if let Some(cover) = cached {
            return cover;
        }

        let (queries, terms) = cover_queries(&name, &artist);
        let mut items = Vec::new();
        for query in &queries {
            let url = Self::search_url(&self.search_url, query);
            if let Some(payload) = self.breaker.fetch_through_best_proxy(&url).await {
                items = data_items(&payload).to_vec();
                if !items.is_empty() {
                    break;
                }
            }
        }

        let cover = match best_track_cover(&items, &terms) {
            Some(cover) => cover,
            None => {
                tracing::warn!("No cover for \"{}\", using the fallback", name);
                self.fallback.clone()
            }
        };
        self.cache.lock().insert(key, cover.clone());
        cover
    }

    /// Cover of the best matching public playlist, if it is close enough
    pub async fn playlist_cover(&self, name: &str) -> Option<String> {
        let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
        if name.is_empty() {
            return None;
        }

        let key = format!("playlist:{}", name).to_lowercase();
        let cached = self.cache.lock().get(&key);
        if cached.is_some() {
            return cached;
        }

        let url = Self::search_url(&self.playlist_search_url, &name);
        let payload = self.breaker.fetch_through_best_proxy(&url).await?;

        let (score, cover) = data_items(&payload)
            .iter()
            .filter_map(|item| {
                let cover = first_str(item, &["picture_xl", "picture_big", "picture_medium"])?;
                let title = first_str(item, &["title"]).unwrap_or_default();
                Some((string_similarity(&name, title), cover))
            })
            .fold(None, |best: Option<(f64, &str)>, candidate| match best {
                Some(top) if top.0 >= candidate.0 => Some(top),
                _ => Some(candidate),
            })?;

        if score <= PLAYLIST_MATCH_THRESHOLD {
            tracing::debug!("Best playlist cover for \"{}\" scored {:.2}", name, score);
            return None;
        }

        self.cache.lock().insert(key, cover.to_string());
        Some(cover.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyEndpoint;
    use crate::service::{HttpResponse, SourceError};
    use crate::testing::FakeHttp;
    use serde_json::json;

    const PROXY: &str = "https://p.test/";

    fn ok(value: Value) -> Result<HttpResponse, SourceError> {
        Ok(HttpResponse {
            status: 200,
            content_type: Some("application/json".to_string()),
            body: value.to_string(),
        })
    }

    fn resolver(http: Arc<FakeHttp>) -> CoverResolver {
        let mut config = Config::default();
        config.proxies.endpoints = vec![ProxyEndpoint::new("p", "https://p.test/?u={url}")];
        let breaker = Arc::new(ProxyCircuitBreaker::new(http, config.proxies.clone()));
        CoverResolver::new(breaker, &config)
    }

    #[test]
    fn test_clean_title_cuts_suffixes() {
        assert_eq!(clean_title("Song (feat. Someone)"), "song");
        assert_eq!(clean_title("Song - Sped Up"), "song");
        assert_eq!(clean_title("Song Super Slowed"), "song");
        assert_eq!(clean_title("Versions of Me"), "versions of me");
    }

    #[test]
    fn test_split_title() {
        assert_eq!(
            split_title("Artist - Song (Remix)"),
            Some(("artist".to_string(), "song".to_string()))
        );
        assert_eq!(split_title("-Song"), None);
        assert_eq!(split_title("Plain Song"), None);
    }

    #[test]
    fn test_queries_are_unique_and_ordered() {
        let (queries, terms) = cover_queries("Artist - Song", "Channel");
        assert_eq!(queries[0], "track:\"song\" artist:\"artist\"");
        assert_eq!(queries[1], "track:\"artist\"");
        let mut deduped = queries.clone();
        deduped.dedup();
        assert_eq!(deduped.len(), queries.len());
        assert!(terms.contains(&"channel".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_cover_picks_best_match_and_caches() {
        let http = Arc::new(FakeHttp::default());
        http.route(
            PROXY,
            ok(json!({"data": [
                {"title": "Other", "artist": {"name": "Nobody"}, "album": {"cover_xl": "https://img/other.jpg"}},
                {"title": "Song", "artist": {"name": "Artist"}, "album": {"cover_big": "https://img/song.jpg"}}
            ]})),
        );
        let covers = resolver(http.clone());

        let cover = covers.track_cover("Song", "Artist").await;
        assert_eq!(cover, "https://img/song.jpg");
        assert_eq!(http.requests().len(), 1);

        assert_eq!(covers.track_cover("Song", "Artist").await, "https://img/song.jpg");
        assert_eq!(http.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_cover_falls_back_when_nothing_matches() {
        let http = Arc::new(FakeHttp::default());
        http.route(PROXY, ok(json!({"data": []})));
        let covers = resolver(http.clone());

        let cover = covers.track_cover("Unknown Song", "Nobody").await;
        assert_eq!(cover, covers.fallback_cover());
        let requests = http.requests().len();
        assert!(requests >= 2, "every query variant is tried");

        covers.track_cover("Unknown Song", "Nobody").await;
        assert_eq!(http.requests().len(), requests);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playlist_cover_requires_close_title() {
        let http = Arc::new(FakeHttp::default());
        http.route(
            PROXY,
            ok(json!({"data": [
                {"title": "Chill Vibes", "picture_xl": "https://img/chill.jpg"},
                {"title": "Workout", "picture_big": "https://img/workout.jpg"}
            ]})),
        );
        let covers = resolver(http.clone());

        assert_eq!(
            covers.playlist_cover("chill vibes").await.as_deref(),
            Some("https://img/chill.jpg")
        );
        assert_eq!(covers.playlist_cover("Road Trip").await, None);
    }
}
