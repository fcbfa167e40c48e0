//! Session-start URL construction.
//!
//! A [`MediaQuery`] describes the title the viewer wants to play. It expands
//! into a deterministic query-parameter list appended to the backend's
//! session-start endpoint; the backend uses these ids and hints to pick which
//! balancers to probe.

use crate::dispatch::urlencode;

/// Identifying metadata for one title.
#[derive(Debug, Clone, Default)]
pub struct MediaQuery {
    /// Catalog id of the card the viewer opened.
    pub id: u64,
    pub imdb_id: Option<String>,
    pub kinopoisk_id: Option<u64>,
    pub tmdb_id: Option<u64>,
    pub title: String,
    pub original_title: Option<String>,
    /// Whether the card is a series rather than a movie.
    pub serial: bool,
    pub original_language: Option<String>,
    /// Release date as reported by the catalog, e.g. `2021-03-18`.
    pub release_date: Option<String>,
    /// Metadata source the card came from (`tmdb`, `cub`, ...).
    pub source: Option<String>,
    /// Ask the backend to re-match the title instead of trusting cached ids.
    pub clarification: bool,
    /// The card was opened from a similar-titles row.
    pub similar: bool,
}

impl MediaQuery {
    /// Release year, taken as the first four characters of the release date.
    pub fn year(&self) -> Option<&str> {
        let date = self.release_date.as_deref()?;
        if date.len() >= 4 { Some(&date[..4]) } else { None }
    }

    /// The query pairs, in a fixed order. `rchtype` is always present, empty
    /// when the transport has not been negotiated yet.
    pub fn query_pairs(&self, rchtype: &str) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        let mut push = |name: &str, value: String| pairs.push((name.to_string(), value));

        push("id", self.id.to_string());
        if let Some(imdb) = &self.imdb_id {
            push("imdb_id", imdb.clone());
        }
        if let Some(kp) = self.kinopoisk_id {
            push("kinopoisk_id", kp.to_string());
        }
        if let Some(tmdb) = self.tmdb_id {
            push("tmdb_id", tmdb.to_string());
        }
        push("title", self.title.clone());
        if let Some(original) = &self.original_title {
            push("original_title", original.clone());
        }
        push("serial", if self.serial { "1" } else { "0" }.to_string());
        if let Some(lang) = &self.original_language {
            push("original_language", lang.clone());
        }
        if let Some(year) = self.year() {
            push("year", year.to_string());
        }
        if let Some(source) = &self.source {
            push("source", source.clone());
        }
        if self.clarification {
            push("clarification", "1".to_string());
        }
        if self.similar {
            push("similar", "true".to_string());
        }
        push("rchtype", rchtype.to_string());
        pairs
    }

    /// Append the pairs to a URL that may or may not already have a query.
    pub fn append_to(&self, url: &str, rchtype: &str) -> String {
        let mut out = url.to_string();
        for (name, value) in self.query_pairs(rchtype) {
            let sep = if out.contains('?') { '&' } else { '?' };
            out.push(sep);
            out.push_str(&name);
            out.push('=');
            out.push_str(&urlencode(&value));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> MediaQuery {
        MediaQuery {
            id: 550,
            imdb_id: Some("tt0137523".into()),
            kinopoisk_id: Some(361),
            title: "Fight Club".into(),
            original_title: Some("Fight Club".into()),
            release_date: Some("1999-10-15".into()),
            original_language: Some("en".into()),
            ..Default::default()
        }
    }

    #[test]
    fn year_is_first_four_chars() {
        assert_eq!(query().year(), Some("1999"));
        let mut q = query();
        q.release_date = Some("19".into());
        assert_eq!(q.year(), None);
        q.release_date = None;
        assert_eq!(q.year(), None);
    }

    #[test]
    fn pairs_are_deterministic_and_complete() {
        let pairs = query().query_pairs("cors");
        let names: Vec<&str> = pairs.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            [
                "id",
                "imdb_id",
                "kinopoisk_id",
                "title",
                "original_title",
                "serial",
                "original_language",
                "year",
                "rchtype"
            ]
        );
        assert_eq!(pairs.last().map(|(_, v)| v.as_str()), Some("cors"));
    }

    #[test]
    fn append_encodes_values() {
        let url = query().append_to("http://b/lite/events?life=true", "");
        assert!(url.contains("title=Fight%20Club"));
        assert!(url.contains("serial=0"));
        assert!(url.ends_with("rchtype="));
    }

    #[test]
    fn flags_appear_only_when_set() {
        let mut q = query();
        q.clarification = true;
        q.similar = true;
        let url = q.append_to("http://b/lite/events", "web");
        assert!(url.contains("clarification=1"));
        assert!(url.contains("similar=true"));
    }
}
