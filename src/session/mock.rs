//! In-memory session backend for tests. Sessions record every volume and
//! mute call so assertions can inspect exactly what the map applied.

use super::{DeviceInfo, Session, SessionBackend, SwitchMuteCounter};
use crate::error::{MixError, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub struct MockSession {
    key: String,
    process_path: String,
    volume: Mutex<f32>,
    muted: Mutex<bool>,
    mute_counter: SwitchMuteCounter,
    fail_volume: AtomicBool,
    pub volume_calls: Mutex<Vec<f32>>,
    pub mute_calls: Mutex<Vec<(bool, bool)>>,
    pub release_count: AtomicUsize,
}

impl MockSession {
    pub fn new(key: &str) -> Arc<Self> {
        Self::with_path(key, "")
    }

    pub fn with_path(key: &str, process_path: &str) -> Arc<Self> {
        Arc::new(Self {
            key: key.to_string(),
            process_path: process_path.to_string(),
            volume: Mutex::new(0.0),
            muted: Mutex::new(false),
            mute_counter: SwitchMuteCounter::default(),
            fail_volume: AtomicBool::new(false),
            volume_calls: Mutex::new(Vec::new()),
            mute_calls: Mutex::new(Vec::new()),
            release_count: AtomicUsize::new(0),
        })
    }

    /// Make subsequent `set_volume` calls fail, as a stale session would.
    pub fn fail_volume(&self, fail: bool) {
        self.fail_volume.store(fail, Ordering::SeqCst);
    }

    pub fn released(&self) -> usize {
        self.release_count.load(Ordering::SeqCst)
    }
}

impl Session for MockSession {
    fn get_volume(&self) -> f32 {
        *self.volume.lock().unwrap()
    }

    fn set_volume(&self, value: f32) -> Result<()> {
        self.volume_calls.lock().unwrap().push(value);
        if self.fail_volume.load(Ordering::SeqCst) {
            return Err(MixError::SessionRefreshRequired(format!(
                "stale session: {}",
                self.key
            )));
        }
        *self.volume.lock().unwrap() = value;
        Ok(())
    }

    fn get_mute(&self) -> bool {
        *self.muted.lock().unwrap()
    }

    fn set_mute(&self, mute: bool, silent: bool) -> Result<()> {
        self.mute_calls.lock().unwrap().push((mute, silent));
        *self.muted.lock().unwrap() = mute;
        Ok(())
    }

    fn switch_mute_count(&self) -> u32 {
        self.mute_counter.count()
    }

    fn set_switch_mute_count(&self, count: u32) {
        self.mute_counter.set(count);
    }

    fn adjust_switch_mute_count(&self, delta: i32) -> u32 {
        self.mute_counter.adjust(delta)
    }

    fn key(&self) -> String {
        self.key.clone()
    }

    fn process_path(&self) -> String {
        self.process_path.clone()
    }

    fn release(&self) {
        self.release_count.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockBackend {
    sessions: Mutex<Vec<Arc<MockSession>>>,
    pub enumerate_count: AtomicUsize,
    pub released: AtomicBool,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_sessions(sessions: Vec<Arc<MockSession>>) -> Arc<Self> {
        let backend = Self::new();
        *backend.sessions.lock().unwrap() = sessions;
        backend
    }

    /// Replace what the next enumeration returns.
    pub fn set_sessions(&self, sessions: Vec<Arc<MockSession>>) {
        *self.sessions.lock().unwrap() = sessions;
    }

    pub fn enumerations(&self) -> usize {
        self.enumerate_count.load(Ordering::SeqCst)
    }
}

impl SessionBackend for MockBackend {
    fn all_sessions(&self) -> Result<Vec<Arc<dyn Session>>> {
        self.enumerate_count.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.clone() as Arc<dyn Session>)
            .collect())
    }

    fn all_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(vec![DeviceInfo {
            name: "Mock Output".to_string(),
            kind: "sink".to_string(),
            description: String::new(),
        }])
    }

    fn release(&self) -> Result<()> {
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}
