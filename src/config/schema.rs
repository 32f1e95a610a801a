use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

/// Root configuration.
///
/// The on-disk form keys mappings by decimal strings (TOML table keys are
/// always strings); [`RawAppConfig`] holds that form and the `TryFrom`
/// conversion produces the typed maps used everywhere else.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(try_from = "RawAppConfig")]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    pub slider_mapping: HashMap<u16, Vec<String>>,
    pub switch_mapping: HashMap<u16, Vec<String>>,
    pub invert_sliders: bool,
    pub invert_switches: bool,
    /// Pins a slider to a fixed percent (0-100), e.g. for a faulty pot.
    pub slider_override: HashMap<u16, u8>,
    pub button_actions: ButtonActions,
}

/// How to reach the device, and whether to relay its stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub serial_port: Option<String>,

    #[serde(default)]
    pub serial_baud: Option<u32>,

    #[serde(default)]
    pub sse_url: Option<String>,

    /// Relay server listen port; 0 or absent disables the relay.
    #[serde(default)]
    pub relay_port: u16,
}

impl ConnectionConfig {
    pub fn serial_configured(&self) -> bool {
        self.serial_port.as_deref().is_some_and(|p| !p.is_empty())
            && self.serial_baud.is_some_and(|b| b != 0)
    }

    pub fn sse_configured(&self) -> bool {
        self.sse_url.as_deref().is_some_and(|u| !u.is_empty())
    }

    pub fn relay_enabled(&self) -> bool {
        self.relay_port > 0
    }
}

/// Which press gesture triggered an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Single,
    Double,
    Long,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Double => "double",
            Self::Long => "long",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All button actions plus the reload policy.
#[derive(Debug, Clone, Default)]
pub struct ButtonActions {
    /// When true, a config reload cancels every in-flight action and kills
    /// tracked children before the new table applies.
    pub cancel_on_reload: bool,
    pub buttons: HashMap<u16, ButtonConfig>,
}

/// Per-button action table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ButtonConfig {
    #[serde(default)]
    pub single: Option<ActionConfig>,

    #[serde(default)]
    pub double: Option<ActionConfig>,

    #[serde(default)]
    pub long: Option<ActionConfig>,
}

impl ButtonConfig {
    pub fn action(&self, kind: ActionKind) -> Option<&ActionConfig> {
        match kind {
            ActionKind::Single => self.single.as_ref(),
            ActionKind::Double => self.double.as_ref(),
            ActionKind::Long => self.long.as_ref(),
        }
    }

    /// True if any gesture has an action attached.
    pub fn has_actions(&self) -> bool {
        self.single.is_some() || self.double.is_some() || self.long.is_some()
    }
}

/// One action: a step sequence and its exclusivity policy.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionConfig {
    #[serde(default = "default_exclusive")]
    pub exclusive: bool,

    #[serde(default)]
    pub steps: Vec<Step>,
}

/// A single unit of work in an action sequence.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Execute {
        app: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        wait: bool,
        /// Timeout for `wait = true`. Omitted falls back to a 30 s default;
        /// an explicit 0 means effectively infinite.
        #[serde(default)]
        wait_timeout_ms: Option<u64>,
        /// Only valid with `wait = false`: wait for the child's window.
        #[serde(default)]
        wait_window: Option<WaitWindow>,
    },
    Delay {
        ms: u64,
    },
    Keystroke {
        keys: String,
    },
    Typing {
        text: String,
        #[serde(default = "default_char_delay")]
        char_delay_ms: u64,
    },
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Execute { .. } => "execute",
            Self::Delay { .. } => "delay",
            Self::Keystroke { .. } => "keystroke",
            Self::Typing { .. } => "typing",
        }
    }
}

/// Window-wait parameters for `Execute` with `wait = false`.
#[derive(Debug, Clone, Deserialize)]
pub struct WaitWindow {
    pub timeout_ms: u64,

    /// Require the window to be in the foreground.
    #[serde(default)]
    pub focused: bool,

    /// Substring filter on the window title.
    #[serde(default)]
    pub title: Option<String>,
}

// --- On-disk form ---

#[derive(Debug, Default, Deserialize)]
struct RawAppConfig {
    #[serde(default)]
    connection: ConnectionConfig,

    #[serde(default)]
    slider_mapping: HashMap<String, Vec<String>>,

    #[serde(default)]
    switch_mapping: HashMap<String, Vec<String>>,

    #[serde(default)]
    invert_sliders: bool,

    #[serde(default)]
    invert_switches: bool,

    #[serde(default)]
    slider_override: HashMap<String, i64>,

    #[serde(default)]
    button_actions: RawButtonActions,
}

#[derive(Debug, Default, Deserialize)]
struct RawButtonActions {
    #[serde(default)]
    cancel_on_reload: bool,

    #[serde(flatten)]
    buttons: HashMap<String, ButtonConfig>,
}

fn parse_id(key: &str, section: &str) -> Result<u16, String> {
    key.parse()
        .map_err(|_| format!("{section}: key '{key}' is not a sensor id"))
}

impl TryFrom<RawAppConfig> for AppConfig {
    type Error = String;

    fn try_from(raw: RawAppConfig) -> Result<Self, Self::Error> {
        let mut slider_mapping = HashMap::new();
        for (key, targets) in raw.slider_mapping {
            let id = parse_id(&key, "slider_mapping")?;
            let targets: Vec<String> = targets.into_iter().filter(|t| !t.is_empty()).collect();
            slider_mapping.insert(id, targets);
        }

        let mut switch_mapping = HashMap::new();
        for (key, targets) in raw.switch_mapping {
            let id = parse_id(&key, "switch_mapping")?;
            let targets: Vec<String> = targets.into_iter().filter(|t| !t.is_empty()).collect();
            switch_mapping.insert(id, targets);
        }

        let mut slider_override = HashMap::new();
        for (key, percent) in raw.slider_override {
            let id = parse_id(&key, "slider_override")?;
            // out-of-range overrides clamp rather than fail the whole load
            if !(0..=100).contains(&percent) {
                warn!(slider = id, value = percent, "slider_override out of range, clamping to 0-100");
            }
            slider_override.insert(id, percent.clamp(0, 100) as u8);
        }

        let mut buttons = HashMap::new();
        for (key, config) in raw.button_actions.buttons {
            let id = parse_id(&key, "button_actions")?;
            buttons.insert(id, config);
        }

        Ok(Self {
            connection: raw.connection,
            slider_mapping,
            switch_mapping,
            invert_sliders: raw.invert_sliders,
            invert_switches: raw.invert_switches,
            slider_override,
            button_actions: ButtonActions {
                cancel_on_reload: raw.button_actions.cancel_on_reload,
                buttons,
            },
        })
    }
}

// --- Defaults ---

fn default_exclusive() -> bool {
    true
}

fn default_char_delay() -> u64 {
    1
}
