// Last.fm scrobbler implementation
// API Documentation: https://www.last.fm/api/scrobbling

use super::signature::RequestParams;
use super::traits::ScrobbleService;
use crate::error::{Result, ScrobblerError};
use crate::metadata::TrackMetadata;
use crate::store::PendingScrobble;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

pub const API_URL: &str = "https://ws.audioscrobbler.com/2.0/";
/// Last.fm refuses batches larger than this
pub const MAX_BATCH_SIZE: usize = 50;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How a method is sent; fixed per API method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transport {
    Get,
    Post,
}

/// `scrobbles.scrobble` is an object for a single scrobble and an array otherwise
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::Many(items) => items,
            Self::One(item) => vec![item],
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScrobblesResponse {
    scrobbles: ScrobblesBody,
}

#[derive(Debug, Deserialize)]
struct ScrobblesBody {
    #[serde(default)]
    scrobble: Option<OneOrMany<ScrobbleResult>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScrobbleResult {
    ignored_message: IgnoredMessage,
}

#[derive(Debug, Deserialize)]
struct IgnoredMessage {
    code: Value,
}

impl IgnoredMessage {
    fn accepted(&self) -> bool {
        match &self.code {
            Value::String(code) => code == "0",
            Value::Number(code) => code.as_i64() == Some(0),
            _ => false,
        }
    }
}

/// Client for the subset of the Last.fm API a scrobbler needs
pub struct LastFmClient {
    pub(crate) api_key: String,
    api_secret: String,
    api_url: String,
    timeout: Duration,
    session_key: RwLock<Option<String>>,
    pub(crate) pending_token: Mutex<Option<String>>,
}

impl LastFmClient {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            api_url: API_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            session_key: RwLock::new(None),
            pending_token: Mutex::new(None),
        }
    }

    /// Point the client at another endpoint (mirrors, tests)
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use (or forget) a session key obtained earlier
    pub fn set_session_key(&self, session_key: Option<String>) {
        *self
            .session_key
            .write()
            .unwrap_or_else(PoisonError::into_inner) = session_key;
    }

    pub fn session_key(&self) -> Option<String> {
        self.session_key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session_key().is_some()
    }

    /// Sign and send one API call, returning the decoded JSON body.
    pub(crate) fn call(
        &self,
        method: &str,
        mut params: RequestParams,
        transport: Transport,
    ) -> Result<Value> {
        params.insert("method", method);
        params.insert("api_key", self.api_key.as_str());
        if let Some(session_key) = self.session_key() {
            params.insert("sk", session_key);
        }
        let pairs = params.into_signed(&self.api_secret);

        log::debug!("Last.fm {} ({:?})", method, transport);
        let response = match transport {
            Transport::Get => attohttpc::get(&self.api_url)
                .params(&pairs)
                .timeout(self.timeout)
                .send()?,
            Transport::Post => attohttpc::post(&self.api_url)
                .timeout(self.timeout)
                .form(&pairs)?
                .send()?,
        };

        let status = response.status();
        let body = response.text()?;

        let value: Option<Value> = serde_json::from_str(&body).ok();
        if let Some(err) = value.as_ref().and_then(api_error) {
            log::error!("Last.fm {} failed: {}", method, err);
            return Err(err);
        }
        if !status.is_success() {
            log::error!("Last.fm {} returned HTTP {}: {}", method, status, body);
            return Err(ScrobblerError::RemoteRejected {
                status: status.as_u16(),
                body,
            });
        }
        value.ok_or_else(|| {
            log::error!("Last.fm {} returned an unreadable body: {}", method, body);
            ScrobblerError::RemoteRejected {
                status: status.as_u16(),
                body,
            }
        })
    }
}

/// `{"error": 9, "message": "..."}`
fn api_error(value: &Value) -> Option<ScrobblerError> {
    let code = value.get("error")?.as_i64()?;
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some(ScrobblerError::Api { code, message })
}

fn rounded_seconds(seconds: f64) -> String {
    (seconds.round() as i64).to_string()
}

fn now_playing_params(track: &TrackMetadata) -> Result<RequestParams> {
    let (Some(title), Some(artist)) = (&track.title, &track.artist) else {
        return Err(ScrobblerError::NotScrobbleable(format!(
            "{} is missing title or artist",
            track
        )));
    };
    let mut params = RequestParams::new();
    params.insert("track", title.as_str());
    params.insert("artist", artist.as_str());
    params.insert_opt("albumArtist", track.album_artist.as_deref());
    params.insert_opt("album", track.album.as_deref());
    params.insert_opt("duration", track.duration_seconds.map(rounded_seconds));
    Ok(params)
}

fn scrobble_params(batch: &[PendingScrobble]) -> RequestParams {
    let mut params = RequestParams::new();
    params.insert_list("artist", batch.iter().map(|s| Some(s.artist.as_str())));
    params.insert_list("track", batch.iter().map(|s| Some(s.track.as_str())));
    params.insert_list("album", batch.iter().map(|s| s.album.as_deref()));
    params.insert_list("albumArtist", batch.iter().map(|s| s.album_artist.as_deref()));
    params.insert_list("duration", batch.iter().map(|s| s.duration_seconds.map(rounded_seconds)));
    params.insert_list(
        "timestamp",
        batch.iter().map(|s| Some(s.played_at.timestamp().to_string())),
    );
    params
}

/// Pick the accepted scrobbles out of a `track.scrobble` response.
/// Results are matched to the batch by position.
pub(crate) fn accepted_scrobbles(
    value: Value,
    batch: &[PendingScrobble],
) -> Result<Vec<PendingScrobble>> {
    let response: ScrobblesResponse = serde_json::from_value(value)?;
    let results = response
        .scrobbles
        .scrobble
        .map(OneOrMany::into_vec)
        .unwrap_or_default();

    if results.len() != batch.len() {
        log::warn!(
            "Last.fm returned {} results for {} scrobbles",
            results.len(),
            batch.len()
        );
    }

    Ok(results
        .iter()
        .zip(batch)
        .filter(|(result, _)| result.ignored_message.accepted())
        .map(|(_, scrobble)| scrobble.clone())
        .collect())
}

impl ScrobbleService for LastFmClient {
    fn set_session_key(&self, session_key: Option<String>) {
        LastFmClient::set_session_key(self, session_key);
    }

    fn update_now_playing(&self, track: &TrackMetadata) -> Result<()> {
        log::debug!("Sending now playing to Last.fm: {}", track);
        let params = now_playing_params(track)?;
        self.call("track.updateNowPlaying", params, Transport::Post)?;
        log::info!("Last.fm: Now playing updated");
        Ok(())
    }

    fn scrobble(&self, batch: &[PendingScrobble]) -> Result<Vec<PendingScrobble>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        if batch.len() > MAX_BATCH_SIZE {
            return Err(ScrobblerError::InvalidBatch(format!(
                "{} scrobbles, at most {} per request",
                batch.len(),
                MAX_BATCH_SIZE
            )));
        }

        let value = self.call("track.scrobble", scrobble_params(batch), Transport::Post)?;
        let accepted = accepted_scrobbles(value, batch)?;
        log::info!("Last.fm: {} of {} scrobbles accepted", accepted.len(), batch.len());
        Ok(accepted)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    pub(crate) fn pending(id: i64, track: &str) -> PendingScrobble {
        PendingScrobble {
            id,
            track: track.to_string(),
            artist: "Artist".to_string(),
            album: None,
            album_artist: None,
            duration_seconds: Some(200.4),
            play_count: None,
            played_at: Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap(),
        }
    }

    /// Serve one canned HTTP response and hand back the raw request.
    pub(crate) fn serve_once(status: &str, body: &str) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/2.0/", listener.local_addr().unwrap());
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            stream.write_all(response.as_bytes()).unwrap();
            tx.send(String::from_utf8_lossy(&request).into_owned()).unwrap();
        });

        (url, rx)
    }

    #[test]
    fn test_single_result_is_not_an_array() {
        let batch = vec![pending(1, "Song")];
        let body = json!({
            "scrobbles": {
                "scrobble": {
                    "track": {"#text": "Song", "corrected": "0"},
                    "ignoredMessage": {"code": "0", "#text": ""}
                },
                "@attr": {"accepted": 1, "ignored": 0}
            }
        });
        assert_eq!(accepted_scrobbles(body, &batch).unwrap(), batch);
    }

    #[test]
    fn test_ignored_results_are_dropped_by_index() {
        let batch = vec![pending(1, "A"), pending(2, "B"), pending(3, "C")];
        let body = json!({
            "scrobbles": {
                "scrobble": [
                    {"ignoredMessage": {"code": "0", "#text": ""}},
                    {"ignoredMessage": {"code": "3", "#text": "Timestamp too old"}},
                    {"ignoredMessage": {"code": 0}}
                ]
            }
        });
        let accepted = accepted_scrobbles(body, &batch).unwrap();
        assert_eq!(accepted, vec![batch[0].clone(), batch[2].clone()]);
    }

    #[test]
    fn test_missing_results_accept_nothing() {
        let batch = vec![pending(1, "A")];
        let body = json!({"scrobbles": {"@attr": {"accepted": 0, "ignored": 0}}});
        assert!(accepted_scrobbles(body, &batch).unwrap().is_empty());
        assert!(accepted_scrobbles(json!({"unexpected": true}), &batch).is_err());
    }

    #[test]
    fn test_scrobble_params_keep_indices() {
        let mut second = pending(2, "B");
        second.album = Some("Album".to_string());
        second.duration_seconds = None;
        let params = scrobble_params(&[pending(1, "A"), second]);

        assert_eq!(params.get("track[0]"), Some("A"));
        assert_eq!(params.get("track[1]"), Some("B"));
        assert_eq!(params.get("album[0]"), None);
        assert_eq!(params.get("album[1]"), Some("Album"));
        assert_eq!(params.get("duration[0]"), Some("200"));
        assert_eq!(params.get("duration[1]"), None);
        assert_eq!(params.get("timestamp[1]"), Some("1700000002"));
    }

    #[test]
    fn test_now_playing_requires_title_and_artist() {
        let track = TrackMetadata::default().with_title("Song");
        assert!(now_playing_params(&track).is_err());

        let track = track.with_artist("Artist").with_duration(199.6);
        let params = now_playing_params(&track).unwrap();
        assert_eq!(params.get("duration"), Some("200"));
        assert_eq!(params.get("album"), None);
    }

    #[test]
    fn test_oversized_batch_is_refused() {
        let client = LastFmClient::new("key", "secret").with_api_url("http://127.0.0.1:9/");
        let batch: Vec<_> = (0..51).map(|i| pending(i, "Song")).collect();
        assert!(matches!(
            client.scrobble(&batch),
            Err(ScrobblerError::InvalidBatch(_))
        ));
        assert!(client.scrobble(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_scrobble_posts_signed_form() {
        let (url, request) = serve_once(
            "200 OK",
            r##"{"scrobbles":{"scrobble":{"ignoredMessage":{"code":"0","#text":""}}}}"##,
        );
        let client = LastFmClient::new("key", "secret").with_api_url(url);
        client.set_session_key(Some("session".to_string()));

        let batch = vec![pending(1, "Song")];
        assert_eq!(client.scrobble(&batch).unwrap(), batch);

        let request = request.recv().unwrap();
        assert!(request.starts_with("POST /2.0/"));
        let body = request.split("\r\n\r\n").nth(1).unwrap();
        assert!(body.contains("method=track.scrobble"));
        assert!(body.contains("sk=session"));
        assert!(body.contains("track%5B0%5D=Song"));
        assert!(body.contains("api_sig="));
        assert!(body.ends_with("format=json"));
    }

    #[test]
    fn test_api_error_is_reported() {
        let (url, _request) = serve_once(
            "403 Forbidden",
            r#"{"error":9,"message":"Invalid session key - Please re-authenticate"}"#,
        );
        let client = LastFmClient::new("key", "secret").with_api_url(url);
        let err = client.scrobble(&[pending(1, "Song")]).unwrap_err();
        assert!(matches!(err, ScrobblerError::Api { code: 9, .. }));
    }

    #[test]
    fn test_unreadable_body_is_rejected() {
        let (url, _request) = serve_once("502 Bad Gateway", "<html>oops</html>");
        let client = LastFmClient::new("key", "secret").with_api_url(url);
        let err = client
            .update_now_playing(&TrackMetadata::default().with_title("A").with_artist("B"))
            .unwrap_err();
        assert!(matches!(err, ScrobblerError::RemoteRejected { status: 502, .. }));
    }
}
