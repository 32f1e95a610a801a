use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// A slider movement, normalized to `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliderMove {
    pub slider_id: u16,
    pub percent: f32,
}

/// A switch transition. `prev_state` is filled in by the event hub from the
/// last known state, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchChange {
    pub switch_id: u16,
    pub state: bool,
    pub prev_state: Option<bool>,
}

/// Events flowing from the active transport to subscribers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    SliderMove(SliderMove),
    SwitchChange(SwitchChange),
}

/// One decoded state payload, carrying the raw device-scale value before any
/// clamping or inversion. This is also what the relay re-broadcasts.
#[derive(Debug, Clone, PartialEq)]
pub enum RawState {
    /// Potentiometer position, device scale 0-100.
    Pot { id: u16, value: f64 },
    Switch { id: u16, state: bool },
}

/// Knobs the decoder needs from configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    pub invert_sliders: bool,
}

static POT_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^sensor-pot(\d+)$").unwrap());
static SW_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^binary_sensor-sw(\d+)$").unwrap());
static ANSI_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*m").unwrap());
static JSON_LOG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[[A-Z]\]\[json:\d+\]:\s*(\{.*\})").unwrap());

/// Parse one state payload into a [`RawState`]. Unknown ids, malformed JSON
/// and missing fields all yield `None`; the caller drops those silently.
pub fn decode_payload(payload: &[u8]) -> Option<RawState> {
    let raw: Value = serde_json::from_slice(payload).ok()?;
    let id = raw.get("id")?.as_str()?;

    if let Some(caps) = POT_PATTERN.captures(id) {
        let id: u16 = caps[1].parse().ok()?;
        let value = raw.get("value")?.as_f64()?;
        return Some(RawState::Pot { id, value });
    }

    if let Some(caps) = SW_PATTERN.captures(id) {
        let id: u16 = caps[1].parse().ok()?;
        let state = if let Some(v) = raw.get("value").and_then(Value::as_bool) {
            v
        } else if let Some(s) = raw.get("state").and_then(Value::as_str) {
            s.eq_ignore_ascii_case("on")
        } else {
            return None;
        };
        return Some(RawState::Switch { id, state });
    }

    None
}

impl RawState {
    /// The wire form of the sensor id, e.g. `sensor-pot3` or
    /// `binary_sensor-sw0`.
    pub fn wire_name(&self) -> String {
        match self {
            Self::Pot { id, .. } => format!("sensor-pot{id}"),
            Self::Switch { id, .. } => format!("binary_sensor-sw{id}"),
        }
    }

    /// The raw value as JSON, for relay frames and the state store.
    pub fn json_value(&self) -> Value {
        match self {
            Self::Pot { value, .. } => {
                // The device sends integers; keep them integral when they are.
                if value.fract() == 0.0 {
                    Value::from(*value as i64)
                } else {
                    Value::from(*value)
                }
            }
            Self::Switch { state, .. } => Value::from(*state),
        }
    }

    /// Convert to a typed event, applying clamping and slider inversion.
    /// `prev_state` attachment happens later, in the hub.
    pub fn into_event(self, opts: DecodeOptions) -> Event {
        match self {
            Self::Pot { id, value } => {
                let mut percent = (value as f32 / 100.0).clamp(0.0, 1.0);
                if opts.invert_sliders {
                    percent = 1.0 - percent;
                }
                Event::SliderMove(SliderMove {
                    slider_id: id,
                    percent,
                })
            }
            Self::Switch { id, state } => Event::SwitchChange(SwitchChange {
                switch_id: id,
                state,
                prev_state: None,
            }),
        }
    }
}

/// Remove ANSI color sequences from a serial line.
pub fn strip_ansi(line: &str) -> String {
    ANSI_PATTERN.replace_all(line, "").into_owned()
}

/// Extract the JSON payload from one serial line, if present.
///
/// A trimmed line that is itself a `{...}` object is taken verbatim.
/// Otherwise the embedded payload of a log-tagged line of the form
/// `[W][json:42]: {...}` is extracted. Anything else yields `None`.
pub fn extract_payload(line: &str) -> Option<String> {
    let clean = strip_ansi(line);
    let trimmed = clean.trim();

    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed.to_string());
    }

    JSON_LOG_PATTERN
        .captures(&clean)
        .map(|caps| caps[1].to_string())
}
