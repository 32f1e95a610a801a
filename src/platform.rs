//! Contracts for the platform-specific collaborators mixd drives but does
//! not implement: window inspection and keyboard synthesis. Desktop builds
//! plug real implementations in; everything here ships with inert defaults
//! so the daemon runs headless.

use crate::error::{MixError, Result};
use std::time::Duration;

/// Opaque handle to a top-level window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHandle(pub u64);

/// Keyboard modifier keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Ctrl,
    Alt,
    Shift,
    Meta,
}

/// Window lookup and readiness probing, used by Execute steps that wait for
/// a window and by Typing steps that verify the foreground target.
pub trait WindowProbe: Send + Sync {
    /// The current foreground window, if any.
    fn foreground_window(&self) -> Option<WindowHandle>;

    /// A visible top-level window owned by `pid`, optionally filtered by a
    /// substring of the window title.
    fn window_for_pid(&self, pid: u32, title_filter: Option<&str>) -> Option<WindowHandle>;

    fn is_foreground(&self, window: WindowHandle) -> bool;

    /// Attempt to bring a window to the foreground.
    fn focus_window(&self, window: WindowHandle) -> bool;

    /// Probe whether the window is ready for input. Implementations must
    /// bound the probe by `timeout` (callers pass at most 100 ms).
    fn window_ready(&self, window: WindowHandle, timeout: Duration) -> bool;
}

/// Synthesizes key events. Modifier state is held by the implementation;
/// `release_all` must be safe to call at any point.
pub trait InputSynth: Send + Sync {
    /// Cheap availability check, performed once per step.
    fn available(&self) -> Result<()>;

    fn press_modifier(&self, modifier: Modifier) -> Result<()>;
    fn release_modifier(&self, modifier: Modifier) -> Result<()>;

    /// Press and release a named key. Returns `Ok(false)` for names the
    /// platform does not know, which callers skip.
    fn tap_key(&self, key: &str) -> Result<bool>;

    /// Send one Unicode character as a key event.
    fn send_char(&self, ch: char) -> Result<()>;

    /// Release any modifiers still held.
    fn release_all(&self) -> Result<()>;
}

/// Resolves the processes attached to the focused window, for the
/// `deej.current` mapping target.
pub trait WindowInspector: Send + Sync {
    /// Process basenames of the focused window's owners. Empty on platforms
    /// without an implementation.
    fn foreground_process_names(&self) -> Vec<String>;
}

/// Probe for platforms without window inspection.
#[derive(Default)]
pub struct NoWindowProbe;

impl WindowProbe for NoWindowProbe {
    fn foreground_window(&self) -> Option<WindowHandle> {
        None
    }

    fn window_for_pid(&self, _pid: u32, _title_filter: Option<&str>) -> Option<WindowHandle> {
        None
    }

    fn is_foreground(&self, _window: WindowHandle) -> bool {
        false
    }

    fn focus_window(&self, _window: WindowHandle) -> bool {
        false
    }

    fn window_ready(&self, _window: WindowHandle, _timeout: Duration) -> bool {
        false
    }
}

/// Synth for platforms without key injection; every use reports
/// `keystroke_unavailable`.
#[derive(Default)]
pub struct UnavailableSynth;

impl UnavailableSynth {
    fn err() -> MixError {
        MixError::KeystrokeUnavailable("no input synthesizer on this platform".to_string())
    }
}

impl InputSynth for UnavailableSynth {
    fn available(&self) -> Result<()> {
        Err(Self::err())
    }

    fn press_modifier(&self, _modifier: Modifier) -> Result<()> {
        Err(Self::err())
    }

    fn release_modifier(&self, _modifier: Modifier) -> Result<()> {
        Err(Self::err())
    }

    fn tap_key(&self, _key: &str) -> Result<bool> {
        Err(Self::err())
    }

    fn send_char(&self, _ch: char) -> Result<()> {
        Err(Self::err())
    }

    fn release_all(&self) -> Result<()> {
        Ok(())
    }
}

/// Inspector that reports no focused processes.
#[derive(Default)]
pub struct NoWindowInspector;

impl WindowInspector for NoWindowInspector {
    fn foreground_process_names(&self) -> Vec<String> {
        Vec::new()
    }
}
