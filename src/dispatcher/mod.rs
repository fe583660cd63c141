//! Command dispatcher (C11): routes recognized text either to the direct
//! command table (pattern match, no LLM involved) or scans an LLM response
//! for `<command>...</command>` tool tags and executes each against a
//! registered device callback.

use crate::error::{Result, SpeechError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// What a device callback (or a direct-command match) produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Handled without anything further to say.
    Silent,
    /// Speak this text directly (direct-command mode).
    Spoken(String),
    /// Feed this text to the LLM as a system message and let it respond.
    FeedToLlm(String),
}

/// One registered device: given an action name and optional value, produces
/// an outcome. Implemented per device (lights, music, thermostat, ...); the
/// concrete tool implementations behind each device are outside this crate's
/// scope, only the calling contract is specified here.
pub trait DeviceCallback: Send + Sync {
    /// Invoke the action. `value` is the captured/extracted argument, if
    /// any (e.g. "Iron Man" for `play %s`).
    fn invoke(&self, action: &str, value: Option<&str>) -> CallbackOutcome;
}

/// `{device_name -> callback}` table, populated by the embedding
/// application (the concrete tool implementations are out of scope here).
#[derive(Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, Box<dyn DeviceCallback>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback under `device_name`, replacing any prior entry.
    pub fn register(&mut self, device_name: impl Into<String>, callback: Box<dyn DeviceCallback>) {
        self.devices.insert(device_name.into(), callback);
    }

    fn invoke(&self, device: &str, action: &str, value: Option<&str>) -> Option<CallbackOutcome> {
        self.devices.get(device).map(|cb| cb.invoke(action, value))
    }
}

/// One action a device table entry recognizes: a trigger pattern (wildcard
/// or regex) and the `{device, action}` pair to invoke on a match, with an
/// emit template that renders the captured value (`%s` placeholder).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEntry {
    /// Action name passed to the device callback (e.g. `"play"`).
    pub name: String,
    /// Shell-glob-style trigger with a single `*` capture (e.g. `"play *"`).
    #[serde(default)]
    pub trigger_wildcard: Option<String>,
    /// Regex trigger with a single capture group, used instead of (or in
    /// addition to) `trigger_wildcard`.
    #[serde(default)]
    pub trigger_regex: Option<String>,
    /// Logical topic this action emits to (forwarded to the callback's
    /// caller for logging; no MQTT transport is implemented in this crate).
    pub emit_topic: String,
    /// Template rendered with the captured value substituted for `%s`.
    pub emit_template: String,
}

/// One device's action table, as loaded from the command-table JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Device category (opaque to the dispatcher; e.g. `"music"`).
    #[serde(rename = "type")]
    pub device_type: String,
    /// Device name; matches a key registered in [`DeviceRegistry`].
    pub name: String,
    /// Recognized actions for this device.
    pub actions: Vec<ActionEntry>,
}

/// Top-level command-table JSON shape: `{ "devices": [ ... ] }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandTable {
    /// All configured devices.
    pub devices: Vec<DeviceEntry>,
}

impl CommandTable {
    /// Load a command table from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON in
    /// the expected shape.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SpeechError::Dispatcher(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| SpeechError::Dispatcher(format!("cannot parse {}: {e}", path.display())))
    }
}

/// A successful direct-command match, prior to callback invocation.
struct Match<'a> {
    device: &'a str,
    action: &'a str,
    value: Option<String>,
    emit_topic: &'a str,
    emit_template: &'a str,
}

/// Ties a loaded [`CommandTable`] to a [`DeviceRegistry`] and implements the
/// two invocation pathways described in the spec: the text-to-command
/// matcher and the tool-tag processor.
pub struct CommandDispatcher {
    table: CommandTable,
    registry: DeviceRegistry,
    max_recursion: u32,
}

impl CommandDispatcher {
    /// Build a dispatcher from a loaded table and registry.
    pub fn new(table: CommandTable, registry: DeviceRegistry, max_recursion: u32) -> Self {
        Self {
            table,
            registry,
            max_recursion,
        }
    }

    /// Fixed-point bound on chained tool-tag follow-up calls.
    pub fn max_recursion(&self) -> u32 {
        self.max_recursion
    }

    /// Attempt to match `text` (already trimmed, case-sensitive as
    /// received) against the direct command table. On a match, the
    /// callback is invoked and its outcome returned; trailing punctuation
    /// is trimmed from the captured value before invocation.
    pub fn try_direct(&self, text: &str) -> Option<CallbackOutcome> {
        let m = self.find_match(text)?;
        tracing::debug!(
            device = m.device,
            action = m.action,
            topic = m.emit_topic,
            rendered = %render_template(m.emit_template, m.value.as_deref()),
            "direct command matched",
        );
        self.registry.invoke(m.device, m.action, m.value.as_deref())
    }

    fn find_match<'a>(&'a self, text: &str) -> Option<Match<'a>> {
        for device in &self.table.devices {
            for action in &device.actions {
                if let Some(value) = match_action(action, text) {
                    return Some(Match {
                        device: &device.name,
                        action: &action.name,
                        value,
                        emit_topic: &action.emit_topic,
                        emit_template: &action.emit_template,
                    });
                }
            }
        }
        None
    }

    /// Scan an LLM response for `<command>{"device":...,"action":...,
    /// "value":...}</command>` spans, execute each against the registry,
    /// and return the text with tags stripped plus the executed outcomes
    /// in order of appearance.
    pub fn process_tool_tags(&self, text: &str) -> ToolTagResult {
        const OPEN: &str = "<command>";
        const CLOSE: &str = "</command>";

        let mut stripped = String::with_capacity(text.len());
        let mut outcomes = Vec::new();
        let mut rest = text;

        while let Some(start) = rest.find(OPEN) {
            stripped.push_str(&rest[..start]);
            let after_open = &rest[start + OPEN.len()..];
            let Some(end) = after_open.find(CLOSE) else {
                // Unterminated tag: keep the remainder verbatim and stop.
                stripped.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let payload = after_open[..end].trim();
            match serde_json::from_str::<ToolTagPayload>(payload) {
                Ok(tag) => {
                    let outcome = self
                        .registry
                        .invoke(&tag.device, &tag.action, tag.value.as_deref());
                    outcomes.push((tag, outcome));
                }
                Err(e) => {
                    tracing::warn!("malformed <command> tag ignored: {e}");
                }
            }
            rest = &after_open[end + CLOSE.len()..];
        }
        stripped.push_str(rest);

        ToolTagResult {
            stripped_text: stripped.trim().to_owned(),
            executed: outcomes,
        }
    }
}

/// A parsed `<command>` tag payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolTagPayload {
    /// Target device name.
    pub device: String,
    /// Action to invoke.
    pub action: String,
    /// Optional captured value argument.
    #[serde(default)]
    pub value: Option<String>,
}

/// Result of scanning an LLM response for tool tags.
pub struct ToolTagResult {
    /// `text` with every `<command>...</command>` span removed.
    pub stripped_text: String,
    /// Each executed tag and the outcome its callback produced (`None` if
    /// no device with that name was registered).
    pub executed: Vec<(ToolTagPayload, Option<CallbackOutcome>)>,
}

/// Match `text` against one action's trigger, returning the captured value
/// (if the pattern has a capture) with trailing punctuation trimmed.
/// `trigger_regex` takes precedence if both are configured.
fn match_action(action: &ActionEntry, text: &str) -> Option<Option<String>> {
    if let Some(pattern) = &action.trigger_regex {
        let re = Regex::new(pattern).ok()?;
        let caps = re.captures(text)?;
        return Some(caps.get(1).map(|m| trim_trailing_punctuation(m.as_str())));
    }
    if let Some(wildcard) = &action.trigger_wildcard {
        return match_wildcard(wildcard, text).map(|v| v.map(|s| trim_trailing_punctuation(&s)));
    }
    None
}

/// Match a single-`*`-wildcard pattern against `text`, case-insensitively.
/// Returns `Some(None)` for a literal (no-capture) match, `Some(Some(value))`
/// when `*` captured a non-empty remainder, `None` on no match.
fn match_wildcard(pattern: &str, text: &str) -> Option<Option<String>> {
    let text_lower = text.to_lowercase();
    match pattern.find('*') {
        None => (pattern.to_lowercase() == text_lower).then_some(None),
        Some(star) => {
            let prefix = &pattern[..star].to_lowercase();
            let suffix = &pattern[star + 1..].to_lowercase();
            if !text_lower.starts_with(prefix.as_str()) || !text_lower.ends_with(suffix.as_str()) {
                return None;
            }
            let start = prefix.len();
            let end = text.len().saturating_sub(suffix.len());
            if start > end {
                return None;
            }
            let captured = text[start..end].trim();
            if captured.is_empty() {
                None
            } else {
                Some(Some(captured.to_owned()))
            }
        }
    }
}

fn trim_trailing_punctuation(s: &str) -> String {
    s.trim()
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .to_owned()
}

/// Render `template`'s `%s` placeholder with `value` (used by callers that
/// want the rendered emit string rather than the raw captured value).
pub fn render_template(template: &str, value: Option<&str>) -> String {
    match value {
        Some(v) => template.replacen("%s", v, 1),
        None => template.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoCallback;
    impl DeviceCallback for EchoCallback {
        fn invoke(&self, action: &str, value: Option<&str>) -> CallbackOutcome {
            CallbackOutcome::Spoken(format!("{action}:{}", value.unwrap_or("")))
        }
    }

    fn dispatcher() -> CommandDispatcher {
        let table = CommandTable {
            devices: vec![DeviceEntry {
                device_type: "speaker".into(),
                name: "music".into(),
                actions: vec![ActionEntry {
                    name: "play".into(),
                    trigger_wildcard: Some("play *".into()),
                    trigger_regex: None,
                    emit_topic: "music/play".into(),
                    emit_template: "play %s".into(),
                }],
            }],
        };
        let mut registry = DeviceRegistry::new();
        registry.register("music", Box::new(EchoCallback));
        CommandDispatcher::new(table, registry, 4)
    }

    #[test]
    fn s1_direct_command_matches_and_dispatches() {
        let d = dispatcher();
        let outcome = d.try_direct("play Iron Man").unwrap();
        assert_eq!(outcome, CallbackOutcome::Spoken("play:Iron Man".into()));
    }

    #[test]
    fn trailing_punctuation_is_trimmed_from_captured_value() {
        let d = dispatcher();
        let outcome = d.try_direct("play Iron Man.").unwrap();
        assert_eq!(outcome, CallbackOutcome::Spoken("play:Iron Man".into()));
    }

    #[test]
    fn no_match_returns_none() {
        let d = dispatcher();
        assert!(d.try_direct("what time is it").is_none());
    }

    #[test]
    fn tool_tag_processor_strips_tags_and_executes() {
        let d = dispatcher();
        let text = "Sure. <command>{\"device\":\"music\",\"action\":\"play\",\"value\":\"jazz\"}</command> Enjoy.";
        let result = d.process_tool_tags(text);
        assert_eq!(result.stripped_text, "Sure.  Enjoy.");
        assert_eq!(result.executed.len(), 1);
        assert_eq!(
            result.executed[0].1,
            Some(CallbackOutcome::Spoken("play:jazz".into()))
        );
    }

    #[test]
    fn tool_tag_with_unregistered_device_yields_none_outcome() {
        let d = dispatcher();
        let text = "<command>{\"device\":\"lamp\",\"action\":\"on\"}</command>";
        let result = d.process_tool_tags(text);
        assert_eq!(result.executed[0].1, None);
    }

    #[test]
    fn render_template_substitutes_single_placeholder() {
        assert_eq!(render_template("play %s", Some("jazz")), "play jazz");
        assert_eq!(render_template("stop", None), "stop");
    }

    #[test]
    fn wildcard_match_is_case_insensitive() {
        let d = dispatcher();
        let outcome = d.try_direct("PLAY Iron Man").unwrap();
        assert_eq!(outcome, CallbackOutcome::Spoken("play:Iron Man".into()));
    }
}
