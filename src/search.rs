//! # Search Resolver
//!
//! Turns a free-text query into a [`SearchResult`] by calling the node's
//! `GET /api/tracks/search` endpoint and normalizing its response.
//!
//! The node answers with `{ "identifier": "...", "results": [...] }`:
//!
//! - empty `results` -> [`SearchResult::NoResult`]
//! - a search identifier (`ytsearch`, `ytmsearch`, `scsearch`) -> the flat
//!   track list, untouched, as [`SearchResult::Search`]
//! - anything else whose first entry nests a `tracks` array ->
//!   [`SearchResult::Playlist`], with the requester stamped on every track

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serenity::model::id::UserId;
use tracing::{debug, info};

use crate::node::NodeConnection;
use crate::{OrchestratorError, Result};

/// Fuente por defecto: búsqueda genérica de video.
pub const DEFAULT_IDENTIFIER: &str = "ytsearch";

/// Prefijos de los identificadores de búsqueda plana.
const SEARCH_IDENTIFIERS: [&str; 3] = ["ytsearch", "ytmsearch", "scsearch"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub identifier: String,
    pub query: String,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            identifier: DEFAULT_IDENTIFIER.to_string(),
            query: query.into(),
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    fn path(&self) -> String {
        format!(
            "/api/tracks/search?query={}&identifier={}",
            urlencoding::encode(&self.query),
            urlencoding::encode(&self.identifier)
        )
    }
}

/// Track tal como lo reporta el nodo.
///
/// El JSON del nodo se guarda tal cual; los accesores leen los campos
/// conocidos y devuelven `None` si faltan o tienen otro tipo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Track(Value);

impl Track {
    pub fn url(&self) -> Option<&str> {
        self.str_field("url")
    }

    pub fn title(&self) -> Option<&str> {
        self.str_field("title")
    }

    pub fn author(&self) -> Option<&str> {
        self.str_field("author")
    }

    pub fn extractor(&self) -> Option<&str> {
        self.str_field("extractor")
    }

    /// Miniatura, en el formato que use el nodo.
    pub fn thumbnail(&self) -> Option<&Value> {
        self.field("thumbnail")
    }

    /// Duración sin convertir (segundos o milisegundos según el nodo).
    pub fn duration(&self) -> Option<&Value> {
        self.field("duration")
    }

    pub fn created_timestamp(&self) -> Option<&Value> {
        self.field("createdTimestamp")
    }

    /// Usuario que pidió el track, si el resolver lo asignó.
    pub fn requester(&self) -> Option<UserId> {
        self.str_field("requester")
            .and_then(|id| id.parse::<u64>().ok())
            .filter(|id| *id != 0)
            .map(UserId::new)
    }

    pub fn raw(&self) -> &Value {
        &self.0
    }

    pub fn into_raw(self) -> Value {
        self.0
    }

    /// Marca el track con quien lo pidió. Entradas que no son objetos quedan igual.
    fn stamp_requester(&mut self, requester: UserId) {
        if let Value::Object(fields) = &mut self.0 {
            fields.insert("requester".to_string(), Value::String(requester.to_string()));
        }
    }

    fn field(&self, name: &str) -> Option<&Value> {
        self.0.get(name).filter(|value| !value.is_null())
    }

    fn str_field(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }
}

impl From<Value> for Track {
    fn from(raw: Value) -> Self {
        Self(raw)
    }
}

/// Metadatos de una playlist, tomados de la primera entrada de la respuesta.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlaylistInfo {
    pub id: String,
    pub title: String,
    pub url: String,
    pub author: String,
    pub extractor: String,
}

impl PlaylistInfo {
    fn from_entry(entry: &Value) -> Self {
        let text = |name: &str| {
            match entry.get(name) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => String::new(),
            }
        };

        Self {
            id: text("id"),
            title: text("title"),
            url: text("url"),
            author: text("author"),
            extractor: text("extractor"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResultType {
    NoResult,
    SearchResult,
    Playlist,
}

impl SearchResultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoResult => "NO_RESULT",
            Self::SearchResult => "SEARCH_RESULT",
            Self::Playlist => "PLAYLIST",
        }
    }
}

/// Resultado normalizado de una búsqueda.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum SearchResult {
    #[serde(rename = "NO_RESULT")]
    NoResult { tracks: Vec<Track>, requester: UserId },
    #[serde(rename = "SEARCH_RESULT")]
    Search { tracks: Vec<Track>, requester: UserId },
    #[serde(rename = "PLAYLIST")]
    Playlist {
        playlist: PlaylistInfo,
        tracks: Vec<Track>,
        requester: UserId,
    },
}

impl SearchResult {
    pub fn result_type(&self) -> SearchResultType {
        match self {
            Self::NoResult { .. } => SearchResultType::NoResult,
            Self::Search { .. } => SearchResultType::SearchResult,
            Self::Playlist { .. } => SearchResultType::Playlist,
        }
    }

    pub fn tracks(&self) -> &[Track] {
        match self {
            Self::NoResult { tracks, .. }
            | Self::Search { tracks, .. }
            | Self::Playlist { tracks, .. } => tracks,
        }
    }

    pub fn requester(&self) -> UserId {
        match self {
            Self::NoResult { requester, .. }
            | Self::Search { requester, .. }
            | Self::Playlist { requester, .. } => *requester,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks().is_empty()
    }
}

pub(crate) async fn resolve(
    node: &NodeConnection,
    query: &SearchQuery,
    requester: UserId,
) -> Result<SearchResult> {
    info!("🔍 Buscando '{}' ({})", query.query, query.identifier);

    let body = node.make_request(Method::GET, &query.path()).await?;
    let result = normalize(body, requester)?;

    debug!(
        "Búsqueda '{}': {} con {} tracks",
        query.query,
        result.result_type().as_str(),
        result.tracks().len()
    );
    Ok(result)
}

fn normalize(mut body: Value, requester: UserId) -> Result<SearchResult> {
    if !body.is_object() {
        return Err(OrchestratorError::Protocol(format!(
            "respuesta de búsqueda inesperada: {}",
            body
        )));
    }

    let identifier = body
        .get("identifier")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let mut results = match body.get_mut("results").map(Value::take) {
        Some(Value::Array(results)) => results,
        _ => Vec::new(),
    };

    let Some(first) = results.first() else {
        return Ok(SearchResult::NoResult {
            tracks: Vec::new(),
            requester,
        });
    };
    let nests_tracks = first.get("tracks").map_or(false, Value::is_array);

    if is_search_identifier(&identifier) || !nests_tracks {
        let tracks = results.into_iter().map(Track::from).collect();
        return Ok(SearchResult::Search { tracks, requester });
    }

    // Playlist metadata and tracks come from the first entry only.
    let mut entry = results.swap_remove(0);
    let tracks = match entry.get_mut("tracks").map(Value::take) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };
    let tracks = tracks
        .into_iter()
        .map(|raw| {
            let mut track = Track::from(raw);
            track.stamp_requester(requester);
            track
        })
        .collect();

    Ok(SearchResult::Playlist {
        playlist: PlaylistInfo::from_entry(&entry),
        tracks,
        requester,
    })
}

fn is_search_identifier(identifier: &str) -> bool {
    SEARCH_IDENTIFIERS
        .iter()
        .any(|prefix| identifier.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeOptions;
    use crate::orchestrator::{Orchestrator, OrchestratorConfig};
    use crate::testing::NullSender;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn user(id: u64) -> UserId {
        UserId::new(id)
    }

    async fn orchestrator_for(server: &MockServer) -> Orchestrator {
        let port = server.address().port();
        let orchestrator = Orchestrator::new(OrchestratorConfig::new(
            NodeOptions::new("127.0.0.1", port, "secret"),
            Arc::new(NullSender),
        ))
        .unwrap();
        orchestrator.node().set_token("tok-1".to_string());
        orchestrator
    }

    #[test]
    fn test_query_defaults_and_encoding() {
        let query = SearchQuery::new("lofi beats & chill");
        assert_eq!(query.identifier, DEFAULT_IDENTIFIER);
        assert_eq!(
            query.path(),
            "/api/tracks/search?query=lofi%20beats%20%26%20chill&identifier=ytsearch"
        );

        let query = SearchQuery::new("x").with_identifier("scsearch");
        assert!(query.path().ends_with("identifier=scsearch"));
    }

    #[test]
    fn test_empty_results_are_no_result() {
        for identifier in ["ytsearch", "scsearch", "ytplaylist", ""] {
            let result = normalize(json!({"identifier": identifier, "results": []}), user(1)).unwrap();
            assert_eq!(
                result,
                SearchResult::NoResult {
                    tracks: Vec::new(),
                    requester: user(1)
                }
            );
        }
    }

    #[test]
    fn test_search_tracks_pass_through() {
        let body = json!({
            "identifier": "ytsearch",
            "results": [
                {"url": "u1", "title": "t1", "duration": 215000, "author": "a1",
                 "createdTimestamp": 1700000000, "extractor": "youtube", "views": 10},
                {"url": "u2", "title": "t2", "duration": 1.5, "thumbnail": "th2"}
            ]
        });

        let result = normalize(body, user(1)).unwrap();
        assert_eq!(result.result_type(), SearchResultType::SearchResult);
        assert_eq!(result.requester(), user(1));

        let tracks = result.tracks();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].duration(), Some(&json!(215000)));
        assert_eq!(tracks[0].created_timestamp(), Some(&json!(1700000000)));
        assert_eq!(tracks[0].raw()["views"], json!(10));
        assert_eq!(tracks[0].requester(), None);
        assert_eq!(tracks[1].duration().and_then(Value::as_f64), Some(1.5));
        assert_eq!(tracks[1].thumbnail(), Some(&json!("th2")));
    }

    #[test]
    fn test_flat_results_are_kept_verbatim() {
        let raw = json!([
            {"createdTimestamp": 1700000000, "title": "t1", "url": "u1"},
            {"author": null, "title": null, "url": "u2"},
            {"thumbnail": {"url": "x", "width": 120}, "url": "u3"},
            {"duration": "3:45", "url": "u4"}
        ]);
        let body = json!({"identifier": "ytsearch", "results": raw.clone()});

        let result = normalize(body, user(1)).unwrap();
        assert_eq!(result.tracks().len(), 4);

        let tracks = serde_json::to_value(result.tracks()).unwrap();
        assert_eq!(tracks, raw);
        assert_eq!(
            serde_json::to_string(result.tracks()).unwrap(),
            serde_json::to_string(&raw).unwrap()
        );
    }

    #[test]
    fn test_unexpected_field_types_read_as_missing() {
        let body = json!({
            "identifier": "ytsearch",
            "results": [
                {"author": null, "title": null, "url": "u1"},
                {"thumbnail": {"url": "x"}, "duration": "3:45", "title": 5}
            ]
        });

        let result = normalize(body, user(1)).unwrap();
        let tracks = result.tracks();

        assert_eq!(tracks[0].author(), None);
        assert_eq!(tracks[0].title(), None);
        assert_eq!(tracks[0].url(), Some("u1"));
        assert_eq!(tracks[1].thumbnail(), Some(&json!({"url": "x"})));
        assert_eq!(tracks[1].duration(), Some(&json!("3:45")));
        assert_eq!(tracks[1].title(), None);
    }

    #[test]
    fn test_non_object_body_is_protocol_error() {
        assert!(matches!(
            normalize(json!(["not", "an", "object"]), user(1)),
            Err(OrchestratorError::Protocol(_))
        ));
    }

    #[test]
    fn test_playlist_stamps_requester() {
        let body = json!({
            "identifier": "ytplaylist",
            "results": [{
                "id": "PL1", "title": "Mix", "url": "https://example.com/list",
                "author": "someone", "extractor": "youtube",
                "tracks": [
                    {"url": "u1", "title": "t1", "duration": 100},
                    {"url": "u2", "title": null, "duration": "2:00"},
                    {"url": "u3", "title": "t3", "duration": 300}
                ]
            }]
        });

        let result = normalize(body, user(7)).unwrap();
        match &result {
            SearchResult::Playlist { playlist, tracks, requester } => {
                assert_eq!(playlist.id, "PL1");
                assert_eq!(playlist.title, "Mix");
                assert_eq!(playlist.extractor, "youtube");
                assert_eq!(tracks.len(), 3);
                assert!(tracks.iter().all(|t| t.requester() == Some(user(7))));
                assert_eq!(tracks[1].duration(), Some(&json!("2:00")));
                assert_eq!(tracks[2].duration(), Some(&json!(300)));
                assert_eq!(*requester, user(7));
            }
            other => panic!("expected playlist, got {:?}", other),
        }
    }

    #[test]
    fn test_playlist_metadata_tolerates_odd_types() {
        let body = json!({
            "identifier": "ytplaylist",
            "results": [{"id": 99, "title": null, "tracks": [{"url": "u1"}]}]
        });

        match normalize(body, user(1)).unwrap() {
            SearchResult::Playlist { playlist, .. } => {
                assert_eq!(playlist.id, "99");
                assert_eq!(playlist.title, "");
            }
            other => panic!("expected playlist, got {:?}", other),
        }
    }

    #[test]
    fn test_search_identifier_wins_over_nested_tracks() {
        let body = json!({
            "identifier": "scsearch",
            "results": [{"url": "u1", "title": "t1", "tracks": []}]
        });
        assert_eq!(normalize(body, user(1)).unwrap().result_type(), SearchResultType::SearchResult);
    }

    #[test]
    fn test_single_track_lookup_is_flat() {
        let body = json!({"identifier": "ytvideo", "results": [{"url": "u1", "title": "t1"}]});
        let result = normalize(body, user(1)).unwrap();
        assert_eq!(result.result_type(), SearchResultType::SearchResult);
        assert_eq!(result.tracks().len(), 1);
    }

    #[test]
    fn test_serialized_discriminant() {
        let result = SearchResult::NoResult {
            tracks: Vec::new(),
            requester: user(5),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["type"], "NO_RESULT");
        assert_eq!(value["tracks"], json!([]));
    }

    #[tokio::test]
    async fn test_search_against_node() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tracks/search"))
            .and(query_param("query", "lofi beats"))
            .and(query_param("identifier", "ytsearch"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "identifier": "ytsearch",
                "results": [{"url": "u1", "title": "t1"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let orchestrator = orchestrator_for(&server).await;
        let result = orchestrator
            .search(SearchQuery::new("lofi beats").with_identifier("ytsearch"), user(1))
            .await
            .unwrap();

        assert_eq!(result.result_type(), SearchResultType::SearchResult);
        assert_eq!(result.requester(), user(1));
        assert_eq!(result.tracks().len(), 1);
        assert_eq!(result.tracks()[0].url(), Some("u1"));
        assert_eq!(result.tracks()[0].title(), Some("t1"));
    }

    #[tokio::test]
    async fn test_search_surfaces_request_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tracks/search"))
            .respond_with(ResponseTemplate::new(503).set_body_string("node overloaded"))
            .mount(&server)
            .await;

        let orchestrator = orchestrator_for(&server).await;
        let err = orchestrator
            .search(SearchQuery::new("anything"), user(1))
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(503));
        match err {
            OrchestratorError::Request { message, .. } => assert_eq!(message, "node overloaded"),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
