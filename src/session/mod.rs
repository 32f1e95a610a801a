pub mod map;
pub mod mock;
pub mod target;

use crate::error::Result;
use std::sync::{Arc, Mutex};

/// A platform-level handle to one addressable audio stream: a running app,
/// a device's master channel, the system bus, or the microphone.
///
/// Implementations live outside this crate (PulseAudio, WASAPI); mixd only
/// drives the capability set. Volume and mute calls may touch the platform
/// and are never made while the session map's cache lock is held.
pub trait Session: Send + Sync {
    fn get_volume(&self) -> f32;
    fn set_volume(&self, value: f32) -> Result<()>;

    fn get_mute(&self) -> bool;
    /// `silent` suppresses any user-visible feedback for re-assertions.
    fn set_mute(&self, mute: bool, silent: bool) -> Result<()>;

    /// How many active switch mappings currently hold this session muted.
    fn switch_mute_count(&self) -> u32;
    fn set_switch_mute_count(&self, count: u32);
    /// Adjust by `delta`, flooring at zero. Returns the new count.
    fn adjust_switch_mute_count(&self, delta: i32) -> u32;

    /// Canonical lookup key: lowercase process basename, friendly device
    /// name, or one of `master` / `system` / `mic`.
    fn key(&self) -> String;

    /// Absolute path of the owning process, or empty.
    fn process_path(&self) -> String;

    /// Give the underlying platform object back. Called exactly once per
    /// session, on refresh or registry shutdown.
    fn release(&self);
}

/// Shared switch-mute accounting for `Session` implementations.
///
/// The invariant `count >= 0` (and mute asserted while positive) is enforced
/// here under per-session mutual exclusion.
#[derive(Default)]
pub struct SwitchMuteCounter {
    count: Mutex<u32>,
}

impl SwitchMuteCounter {
    pub fn count(&self) -> u32 {
        *self.count.lock().unwrap()
    }

    pub fn set(&self, count: u32) {
        *self.count.lock().unwrap() = count;
    }

    pub fn adjust(&self, delta: i32) -> u32 {
        let mut count = self.count.lock().unwrap();
        *count = count.saturating_add_signed(delta);
        *count
    }
}

/// One audio endpoint as reported by the platform, for inventory logging.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub kind: String,
    pub description: String,
}

/// Enumerates the platform's audio sessions. The implementation is an
/// external collaborator; [`mock::MockBackend`](mock) stands in for tests.
pub trait SessionBackend: Send + Sync {
    fn all_sessions(&self) -> Result<Vec<Arc<dyn Session>>>;
    fn all_devices(&self) -> Result<Vec<DeviceInfo>>;
    fn release(&self) -> Result<()>;
}

/// Backend for builds without a platform audio integration: reports no
/// devices and no sessions, so mappings simply never match.
#[derive(Default)]
pub struct NullBackend;

impl SessionBackend for NullBackend {
    fn all_sessions(&self) -> Result<Vec<Arc<dyn Session>>> {
        Ok(Vec::new())
    }

    fn all_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(Vec::new())
    }

    fn release(&self) -> Result<()> {
        Ok(())
    }
}
