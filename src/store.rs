// Scrobble store
// SQLite-backed queue of pending scrobbles, the account record and settings

use crate::error::{Result, ScrobblerError};
use crate::metadata::{TrackMetadata, MIN_TRACK_DURATION};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const SCHEMA_V1: &str = include_str!("../migrations/001_initial.sql");

pub const KEY_SEND_SCROBBLES: &str = "SEND_SCROBBLES";
pub const KEY_OPEN_AT_LOGIN: &str = "OPEN_AT_LOGIN";
pub const KEY_AUTO_UPDATE: &str = "AUTO_UPDATE";
pub const KEY_LAST_SCROBBLE_TIME: &str = "LAST_SCROBBLE_TIME";

/// The authenticated Last.fm account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub username: String,
    pub session_key: String,
}

/// A scrobble waiting to be accepted by Last.fm
#[derive(Debug, Clone, PartialEq)]
pub struct PendingScrobble {
    pub id: i64,
    pub track: String,
    pub artist: String,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub duration_seconds: Option<f64>,
    pub play_count: Option<u32>,
    /// When the track started playing
    pub played_at: DateTime<Utc>,
}

impl PendingScrobble {
    pub fn metadata(&self) -> TrackMetadata {
        TrackMetadata {
            title: Some(self.track.clone()),
            artist: Some(self.artist.clone()),
            album_artist: self.album_artist.clone(),
            album: self.album.clone(),
            duration_seconds: self.duration_seconds,
            play_count: self.play_count,
        }
    }
}

/// Time and identity of the most recent scrobble, kept in the settings table
/// so duplicates are caught even after the queue has been flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastScrobbleMarker {
    pub played_at: DateTime<Utc>,
    pub identity: u64,
}

impl LastScrobbleMarker {
    /// `"<epochSeconds>;<identityHash>"`
    pub fn to_setting(&self) -> String {
        format!("{};{}", self.played_at.timestamp(), self.identity)
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (time, identity) = value.split_once(';')?;
        // Older values may carry fractional seconds
        let seconds = time.trim().parse::<f64>().ok()?.floor() as i64;
        let played_at = Utc.timestamp_opt(seconds, 0).single()?;
        let identity = identity.trim().parse::<u64>().ok()?;
        Some(Self {
            played_at,
            identity,
        })
    }
}

impl Default for LastScrobbleMarker {
    fn default() -> Self {
        Self {
            played_at: DateTime::<Utc>::default(),
            identity: 0,
        }
    }
}

/// What `record_scrobble` did with a track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// Same track scrobbled less than its duration ago
    Duplicate,
    NotScrobbleable,
}

pub struct ScrobbleStore {
    conn: Connection,
}

impl ScrobbleStore {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        run_migrations(&conn)?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self { conn })
    }

    // ── Account ─────────────────────────────────────────────────

    pub fn account(&self) -> Result<Option<Account>> {
        self.conn
            .query_row(
                "SELECT username, token FROM account WHERE id = 1",
                [],
                |row| {
                    Ok(Account {
                        username: row.get(0)?,
                        session_key: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    /// Store the account, replacing any previous one.
    pub fn add_account(&self, username: &str, token: &str) -> Result<Account> {
        self.conn.execute(
            "INSERT OR REPLACE INTO account (id, username, token) VALUES (1, ?1, ?2)",
            params![username, token],
        )?;
        Ok(Account {
            username: username.to_string(),
            session_key: token.to_string(),
        })
    }

    /// Remove the account. Pending scrobbles are kept.
    pub fn delete_account(&self) -> Result<()> {
        self.conn.execute("DELETE FROM account", [])?;
        Ok(())
    }

    // ── Scrobble queue ──────────────────────────────────────────

    /// Append one scrobble to the queue.
    pub fn save_scrobble(
        &self,
        metadata: &TrackMetadata,
        played_at: DateTime<Utc>,
    ) -> Result<i64> {
        let (Some(track), Some(artist)) = (&metadata.title, &metadata.artist) else {
            return Err(ScrobblerError::NotScrobbleable(format!(
                "{} is missing title or artist",
                metadata
            )));
        };
        if !metadata.can_be_scrobbled() {
            return Err(ScrobblerError::NotScrobbleable(format!(
                "{} is shorter than {}s or has no duration",
                metadata, MIN_TRACK_DURATION
            )));
        }
        self.conn.execute(
            "INSERT INTO scrobble (track, artist, album, album_artist, duration, played_count, played_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                track,
                artist,
                metadata.album,
                metadata.album_artist,
                metadata.duration_seconds,
                metadata.play_count,
                played_at.timestamp(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Scrobbles ordered by play time, oldest first when `ascending`.
    pub fn get_scrobbles(
        &self,
        limit: Option<usize>,
        ascending: bool,
    ) -> Result<Vec<PendingScrobble>> {
        let order = if ascending { "ASC" } else { "DESC" };
        let sql = format!(
            "SELECT id, track, artist, album, album_artist, duration, played_count, played_at
             FROM scrobble ORDER BY played_at {order}, id {order} LIMIT ?1"
        );
        // SQLite treats a negative limit as "no limit"
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit], row_to_scrobble)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Newest queued scrobble, if any.
    pub fn last_scrobble(&self) -> Result<Option<PendingScrobble>> {
        Ok(self.get_scrobbles(Some(1), false)?.into_iter().next())
    }

    /// Delete exactly the given scrobbles in one transaction.
    pub fn remove_scrobbles(&mut self, batch: &[PendingScrobble]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM scrobble WHERE id = ?1")?;
            for scrobble in batch {
                removed += stmt.execute(params![scrobble.id])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM scrobble", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Save a scrobble unless it repeats the previous one.
    ///
    /// The same track counts as one listen while less than its duration has
    /// passed since the previous scrobble started. The queue's newest entry is
    /// the reference; once the queue is empty the `LAST_SCROBBLE_TIME` marker is.
    pub fn record_scrobble(
        &self,
        metadata: &TrackMetadata,
        played_at: DateTime<Utc>,
    ) -> Result<SaveOutcome> {
        let duration = match metadata.duration_seconds {
            Some(duration) if metadata.can_be_scrobbled() => duration,
            _ => return Ok(SaveOutcome::NotScrobbleable),
        };

        let (same_track, previous_at) = match self.last_scrobble()? {
            Some(last) => (last.metadata() == *metadata, last.played_at),
            None => {
                let marker = self.last_scrobble_marker()?;
                (marker.identity == metadata.identity_hash(), marker.played_at)
            }
        };
        let since_previous = played_at.signed_duration_since(previous_at).num_seconds() as f64;
        if same_track && since_previous < duration {
            log::warn!(
                "Same song scrobbled {}s ago, less than its duration, not saving: {}",
                since_previous,
                metadata
            );
            return Ok(SaveOutcome::Duplicate);
        }

        // Queue entry and marker are written together or not at all
        let tx = self.conn.unchecked_transaction()?;
        self.save_scrobble(metadata, played_at)?;
        self.set_last_scrobble_marker(LastScrobbleMarker {
            played_at,
            identity: metadata.identity_hash(),
        })?;
        tx.commit()?;
        Ok(SaveOutcome::Saved)
    }

    // ── Settings ────────────────────────────────────────────────

    /// Read a setting, writing the default on first access.
    fn setting(&self, key: &str, default: &str) -> Result<String> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM setting WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            Some(value) => Ok(value),
            None => {
                self.conn.execute(
                    "INSERT OR IGNORE INTO setting (key, value) VALUES (?1, ?2)",
                    params![key, default],
                )?;
                Ok(default.to_string())
            }
        }
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO setting (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn bool_setting(&self, key: &str, default: bool) -> Result<bool> {
        let value = self.setting(key, &default.to_string())?;
        Ok(value.parse().unwrap_or_else(|_| {
            log::warn!("Setting {} has invalid value {:?}, using {}", key, value, default);
            default
        }))
    }

    /// Send scrobbles as soon as they happen (true) or keep them queued (false)
    pub fn send_scrobbles(&self) -> Result<bool> {
        self.bool_setting(KEY_SEND_SCROBBLES, true)
    }

    pub fn set_send_scrobbles(&self, value: bool) -> Result<()> {
        self.set_setting(KEY_SEND_SCROBBLES, &value.to_string())
    }

    pub fn open_at_login(&self) -> Result<bool> {
        self.bool_setting(KEY_OPEN_AT_LOGIN, false)
    }

    pub fn set_open_at_login(&self, value: bool) -> Result<()> {
        self.set_setting(KEY_OPEN_AT_LOGIN, &value.to_string())
    }

    pub fn auto_update(&self) -> Result<bool> {
        self.bool_setting(KEY_AUTO_UPDATE, false)
    }

    pub fn set_auto_update(&self, value: bool) -> Result<()> {
        self.set_setting(KEY_AUTO_UPDATE, &value.to_string())
    }

    pub fn last_scrobble_marker(&self) -> Result<LastScrobbleMarker> {
        let default = LastScrobbleMarker::default().to_setting();
        let value = self.setting(KEY_LAST_SCROBBLE_TIME, &default)?;
        Ok(LastScrobbleMarker::parse(&value).unwrap_or_default())
    }

    pub fn set_last_scrobble_marker(&self, marker: LastScrobbleMarker) -> Result<()> {
        self.set_setting(KEY_LAST_SCROBBLE_TIME, &marker.to_setting())
    }
}

// ── Migrations ──────────────────────────────────────────────────

/// Run schema migrations using `PRAGMA user_version` for version tracking.
fn run_migrations(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", 1)?;
    }
    Ok(())
}

fn row_to_scrobble(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingScrobble> {
    let played_at: i64 = row.get(7)?;
    Ok(PendingScrobble {
        id: row.get(0)?,
        track: row.get(1)?,
        artist: row.get(2)?,
        album: row.get(3)?,
        album_artist: row.get(4)?,
        duration_seconds: row.get(5)?,
        play_count: row.get(6)?,
        played_at: Utc.timestamp_opt(played_at, 0).single().unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song(title: &str) -> TrackMetadata {
        TrackMetadata::default()
            .with_title(title)
            .with_artist("Artist")
            .with_album("Album")
            .with_duration(180.0)
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_account_lifecycle() {
        let store = ScrobbleStore::open_memory().unwrap();
        assert_eq!(store.account().unwrap(), None);

        store.add_account("first", "key-1").unwrap();
        let account = store.add_account("second", "key-2").unwrap();
        assert_eq!(store.account().unwrap(), Some(account));

        store.save_scrobble(&song("A"), t(0)).unwrap();
        store.delete_account().unwrap();
        assert_eq!(store.account().unwrap(), None);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_scrobbles_come_back_ordered() {
        let store = ScrobbleStore::open_memory().unwrap();
        for (i, offset) in [300, 0, 600, 100, 200].iter().enumerate() {
            store
                .save_scrobble(&song(&format!("Song {}", i)), t(*offset))
                .unwrap();
        }

        let all = store.get_scrobbles(None, true).unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].played_at <= w[1].played_at));

        let newest = store.get_scrobbles(Some(2), false).unwrap();
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].played_at, t(600));
        assert_eq!(newest[1].played_at, t(300));
        assert_eq!(store.last_scrobble().unwrap().unwrap().played_at, t(600));
    }

    #[test]
    fn test_optional_fields_round_trip() {
        let store = ScrobbleStore::open_memory().unwrap();
        let track = TrackMetadata::default()
            .with_title("Song")
            .with_artist("Artist")
            .with_duration(95.5)
            .with_play_count(4);
        store.save_scrobble(&track, t(0)).unwrap();

        let saved = &store.get_scrobbles(None, true).unwrap()[0];
        assert_eq!(saved.album, None);
        assert_eq!(saved.album_artist, None);
        assert_eq!(saved.duration_seconds, Some(95.5));
        assert_eq!(saved.play_count, Some(4));
        assert_eq!(saved.metadata(), track);
    }

    #[test]
    fn test_save_requires_title_and_artist() {
        let store = ScrobbleStore::open_memory().unwrap();
        let untitled = TrackMetadata::default().with_artist("Artist");
        assert!(matches!(
            store.save_scrobble(&untitled, t(0)),
            Err(ScrobblerError::NotScrobbleable(_))
        ));
        assert!(store.save_scrobble(&song("Jingle").with_duration(12.0), t(0)).is_err());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_remove_exact_batch() {
        let mut store = ScrobbleStore::open_memory().unwrap();
        for i in 0..5 {
            store.save_scrobble(&song(&format!("Song {}", i)), t(i)).unwrap();
        }
        let all = store.get_scrobbles(None, true).unwrap();
        let removed = store.remove_scrobbles(&[all[1].clone(), all[3].clone()]).unwrap();
        assert_eq!(removed, 2);

        let left: Vec<String> = store
            .get_scrobbles(None, true)
            .unwrap()
            .into_iter()
            .map(|s| s.track)
            .collect();
        assert_eq!(left, vec!["Song 0", "Song 2", "Song 4"]);
        assert_eq!(store.remove_scrobbles(&[]).unwrap(), 0);
    }

    #[test]
    fn test_settings_defaults_are_materialized() {
        let store = ScrobbleStore::open_memory().unwrap();
        assert!(store.send_scrobbles().unwrap());
        assert!(!store.open_at_login().unwrap());
        assert!(!store.auto_update().unwrap());
        assert_eq!(store.last_scrobble_marker().unwrap(), LastScrobbleMarker::default());

        let stored: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM setting", [], |row| row.get(0))
            .unwrap();
        assert_eq!(stored, 4);

        store.set_send_scrobbles(false).unwrap();
        store.set_open_at_login(true).unwrap();
        store.set_auto_update(true).unwrap();
        assert!(!store.send_scrobbles().unwrap());
        assert!(store.open_at_login().unwrap());
        assert!(store.auto_update().unwrap());
    }

    #[test]
    fn test_marker_format() {
        let marker = LastScrobbleMarker {
            played_at: t(0),
            identity: 42,
        };
        assert_eq!(marker.to_setting(), "1700000000;42");
        assert_eq!(LastScrobbleMarker::parse("1700000000;42"), Some(marker));
        assert_eq!(LastScrobbleMarker::parse("1700000000.75;42"), Some(marker));
        assert_eq!(LastScrobbleMarker::parse("garbage"), None);
    }

    #[test]
    fn test_duplicate_against_queue_tail() {
        let store = ScrobbleStore::open_memory().unwrap();
        let track = song("Song");

        assert_eq!(store.record_scrobble(&track, t(0)).unwrap(), SaveOutcome::Saved);
        assert_eq!(store.record_scrobble(&track, t(60)).unwrap(), SaveOutcome::Duplicate);
        assert_eq!(
            store.record_scrobble(&track.clone().with_duration(181.0), t(179)).unwrap(),
            SaveOutcome::Duplicate
        );
        assert_eq!(store.record_scrobble(&track, t(180)).unwrap(), SaveOutcome::Saved);
        assert_eq!(store.record_scrobble(&song("Other"), t(200)).unwrap(), SaveOutcome::Saved);
        assert_eq!(store.count().unwrap(), 3);
    }

    #[test]
    fn test_duplicate_against_marker_after_flush() {
        let mut store = ScrobbleStore::open_memory().unwrap();
        let track = song("Song");
        store.record_scrobble(&track, t(0)).unwrap();

        let sent = store.get_scrobbles(None, true).unwrap();
        store.remove_scrobbles(&sent).unwrap();
        assert_eq!(store.count().unwrap(), 0);

        assert_eq!(store.record_scrobble(&track, t(30)).unwrap(), SaveOutcome::Duplicate);
        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(store.record_scrobble(&track, t(200)).unwrap(), SaveOutcome::Saved);
    }

    #[test]
    fn test_failed_marker_write_leaves_queue_unchanged() {
        let store = ScrobbleStore::open_memory().unwrap();
        store.last_scrobble_marker().unwrap();
        store
            .conn
            .execute_batch(
                "CREATE TRIGGER no_marker_insert BEFORE INSERT ON setting
                 WHEN NEW.key = 'LAST_SCROBBLE_TIME'
                 BEGIN SELECT RAISE(ABORT, 'marker write failed'); END;
                 CREATE TRIGGER no_marker_update BEFORE UPDATE ON setting
                 WHEN NEW.key = 'LAST_SCROBBLE_TIME'
                 BEGIN SELECT RAISE(ABORT, 'marker write failed'); END;",
            )
            .unwrap();

        assert!(store.record_scrobble(&song("A"), t(0)).is_err());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_unscrobbleable_tracks_are_never_saved() {
        let store = ScrobbleStore::open_memory().unwrap();
        let short = song("Jingle").with_duration(12.0);
        let anonymous = TrackMetadata::default().with_title("Song").with_duration(200.0);

        assert_eq!(store.record_scrobble(&short, t(0)).unwrap(), SaveOutcome::NotScrobbleable);
        assert_eq!(store.record_scrobble(&anonymous, t(0)).unwrap(), SaveOutcome::NotScrobbleable);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("scrobbles.db");
        {
            let store = ScrobbleStore::open(&path).unwrap();
            store.add_account("user", "key").unwrap();
            store.save_scrobble(&song("A"), t(0)).unwrap();
            store.save_scrobble(&song("B"), t(10)).unwrap();
            store.set_send_scrobbles(false).unwrap();
        }

        let store = ScrobbleStore::open(&path).unwrap();
        assert_eq!(store.count().unwrap(), 2);
        assert_eq!(store.account().unwrap().unwrap().username, "user");
        assert!(!store.send_scrobbles().unwrap());
    }
}
