// AppleScript probe for Music.app / iTunes
// Runs small scripts through `osascript` and parses their `key: value` output

use super::{PermissionStatus, PlayerProbe, PlayerState};
use crate::error::{Result, ScrobblerError};
use crate::metadata::TrackMetadata;
use regex::Regex;
use std::collections::HashMap;
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const SCRIPT_TIMEOUT: Duration = Duration::from_secs(10);
const WAIT_STEP: Duration = Duration::from_millis(25);

// AppleEvent error codes that show up in osascript's stderr
const ERR_NOT_AUTHORIZED: &str = "(-1743)";
const ERR_CONSENT_REQUIRED: &str = "(-1744)";
const ERR_PROC_NOT_FOUND: &str = "(-600)";

/// Value of one output line
#[derive(Debug, Clone, PartialEq)]
enum ScriptValue {
    Text(String),
    Number(f64),
}

pub struct OsascriptProbe {
    app: String,
    timeout: Duration,
    line_regex: Regex,
    number_regex: Regex,
}

impl OsascriptProbe {
    /// Probe for the given application name (`Music` or `iTunes`)
    pub fn new(app: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            timeout: SCRIPT_TIMEOUT,
            // Both patterns are constant and known to compile
            line_regex: Regex::new(r"(?i)^(\w[a-z0-9_\-]+): +(.+)$").expect("valid line regex"),
            number_regex: Regex::new(r"(?i)^\d+([.,]\d+(E\d+)?)?$").expect("valid number regex"),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn current_track_script(&self) -> String {
        format!(
            r#"on getOrNull(value)
    if value is "" or value is 0 then
        return "null"
    else if class of value is text then
        return quote & value & quote
    else
        return value
    end if
end getOrNull

tell application "{app}"
    set t to current track
    "name: " & my getOrNull(name of t) & "
artist: " & my getOrNull(artist of t) & "
album: " & my getOrNull(album of t) & "
duration: " & (duration of t as text) & "
albumArtist: " & my getOrNull(album artist of t) & "
playedCount: " & (played count of t as text)
end tell"#,
            app = self.app
        )
    }

    /// Run a script and return its stdout, or the stderr text on failure.
    fn execute(&self, script: &str) -> std::result::Result<String, String> {
        let mut child = Command::new("osascript")
            .arg("-e")
            .arg(script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("failed to spawn osascript: {}", e))?;

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(format!("osascript timed out after {:?}", self.timeout));
                }
                Ok(None) => thread::sleep(WAIT_STEP),
                Err(e) => return Err(format!("failed to wait for osascript: {}", e)),
            }
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_string(&mut stdout);
        }
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_string(&mut stderr);
        }

        if status.success() {
            Ok(stdout)
        } else {
            Err(stderr.trim().to_string())
        }
    }

    fn run(&self, script: &str) -> Result<HashMap<String, ScriptValue>> {
        let output = self.execute(script).map_err(|stderr| {
            if stderr.contains(ERR_NOT_AUTHORIZED) {
                ScrobblerError::PermissionDenied(self.app.clone())
            } else if stderr.contains(ERR_CONSENT_REQUIRED) {
                ScrobblerError::UserActionRequired(self.app.clone())
            } else {
                ScrobblerError::Probe(stderr)
            }
        })?;
        Ok(self.parse_output(&output))
    }

    fn parse_output(&self, output: &str) -> HashMap<String, ScriptValue> {
        let mut values = HashMap::new();
        for line in output.lines() {
            let Some(caps) = self.line_regex.captures(line.trim_end()) else {
                continue;
            };
            let key = caps[1].to_string();
            let raw = caps[2].trim();

            if raw == "null" {
                continue;
            }
            if self.number_regex.is_match(raw) {
                if let Ok(number) = raw.replace(',', ".").parse::<f64>() {
                    values.insert(key, ScriptValue::Number(number));
                    continue;
                }
            }
            let text = raw
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .unwrap_or(raw);
            values.insert(key, ScriptValue::Text(text.to_string()));
        }
        values
    }
}

fn text(values: &HashMap<String, ScriptValue>, key: &str) -> Option<String> {
    match values.get(key)? {
        ScriptValue::Text(s) => Some(s.clone()),
        ScriptValue::Number(_) => None,
    }
}

fn number(values: &HashMap<String, ScriptValue>, key: &str) -> Option<f64> {
    match values.get(key)? {
        ScriptValue::Number(n) => Some(*n),
        ScriptValue::Text(_) => None,
    }
}

impl PlayerProbe for OsascriptProbe {
    fn name(&self) -> &str {
        &self.app
    }

    fn is_running(&self) -> bool {
        Command::new("pgrep")
            .arg("-x")
            .arg(&self.app)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn check_permission(&self) -> PermissionStatus {
        let script = format!(r#"tell application "{}" to get name"#, self.app);
        match self.execute(&script) {
            Ok(_) => PermissionStatus::Granted,
            Err(stderr) if stderr.contains(ERR_NOT_AUTHORIZED) => PermissionStatus::Denied,
            Err(stderr) if stderr.contains(ERR_CONSENT_REQUIRED) => {
                PermissionStatus::UserActionRequired
            }
            Err(stderr) if stderr.contains(ERR_PROC_NOT_FOUND) => PermissionStatus::AppNotRunning,
            Err(stderr) => {
                log::warn!("Permission check for {} failed: {}", self.app, stderr);
                PermissionStatus::Granted
            }
        }
    }

    fn player_state(&self) -> Result<PlayerState> {
        let script = format!(
            "tell application \"{}\"\n    \"state: \" & player state\nend tell",
            self.app
        );
        let values = self.run(&script)?;
        Ok(text(&values, "state")
            .map(|s| PlayerState::from_script(&s))
            .unwrap_or(PlayerState::Stopped))
    }

    fn current_track(&self) -> Result<TrackMetadata> {
        let values = self.run(&self.current_track_script())?;
        Ok(TrackMetadata {
            title: text(&values, "name"),
            artist: text(&values, "artist"),
            album_artist: text(&values, "albumArtist"),
            album: text(&values, "album"),
            duration_seconds: number(&values, "duration"),
            play_count: number(&values, "playedCount").map(|n| n as u32),
        }
        .normalized())
    }

    fn position_seconds(&self) -> Result<f64> {
        let script = format!(
            "tell application \"{}\"\n    \"position: \" & (player position as text)\nend tell",
            self.app
        );
        let values = self.run(&script)?;
        number(&values, "position")
            .ok_or_else(|| ScrobblerError::Probe("player position missing from output".into()))
    }
}
