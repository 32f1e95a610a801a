use super::target::{
    self, has_special_transform, is_device_key, is_path, normalize_key, path_matches,
    SPECIAL_CURRENT, SPECIAL_UNMAPPED,
};
use super::{Session, SessionBackend};
use crate::config::bus::ConfigBus;
use crate::config::schema::AppConfig;
use crate::error::Result;
use crate::event::{SliderMove, SwitchChange};
use crate::platform::WindowInspector;
use crate::state::DeviceState;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Re-enumerating sessions is expensive; non-forced refreshes are suppressed
/// inside this window.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Beyond this age the cache is considered moldy and the next event forces a
/// refresh, so newly opened processes are always picked up eventually.
const MAX_REFRESH_INTERVAL: Duration = Duration::from_secs(45);

struct Cache {
    by_key: HashMap<String, Vec<Arc<dyn Session>>>,
    unmapped: Vec<Arc<dyn Session>>,
    last_refresh: Instant,
}

/// Maps slider and switch events onto audio sessions.
///
/// Owns the session cache between refreshes. Every session in a replaced
/// snapshot is released exactly once before the new snapshot is observable.
/// The cache lock is never held across a volume or mute call.
pub struct SessionMap {
    backend: Arc<dyn SessionBackend>,
    bus: Arc<ConfigBus>,
    device_state: Arc<DeviceState>,
    inspector: Arc<dyn WindowInspector>,
    cache: Mutex<Cache>,
}

impl SessionMap {
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        bus: Arc<ConfigBus>,
        device_state: Arc<DeviceState>,
        inspector: Arc<dyn WindowInspector>,
    ) -> Self {
        Self {
            backend,
            bus,
            device_state,
            inspector,
            cache: Mutex::new(Cache {
                by_key: HashMap::new(),
                unmapped: Vec::new(),
                last_refresh: Instant::now(),
            }),
        }
    }

    /// Log the device inventory once and take the initial snapshot.
    pub fn initialize(&self) -> Result<()> {
        match self.backend.all_devices() {
            Ok(devices) => {
                info!(count = devices.len(), "available audio devices");
                for device in devices {
                    if device.description.is_empty() {
                        info!(name = %device.name, kind = %device.kind, "audio device");
                    } else {
                        info!(
                            name = %device.name,
                            kind = %device.kind,
                            description = %device.description,
                            "audio device"
                        );
                    }
                }
            }
            Err(e) => warn!("failed to enumerate audio devices: {e}"),
        }

        self.refresh(true);
        Ok(())
    }

    /// Discard the cache, release every prior session, and re-enumerate.
    /// Non-forced refreshes are rate-limited to one per five seconds.
    pub fn refresh(&self, force: bool) {
        {
            let mut cache = self.cache.lock().unwrap();
            if !force && cache.last_refresh.elapsed() < MIN_REFRESH_INTERVAL {
                return;
            }

            cache.last_refresh = Instant::now();

            // Release before the new snapshot becomes observable.
            for sessions in cache.by_key.values() {
                for session in sessions {
                    session.release();
                }
            }
            cache.by_key.clear();
            cache.unmapped.clear();
        }

        let sessions = match self.backend.all_sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!("failed to re-acquire audio sessions: {e}");
                return;
            }
        };

        let config = self.bus.current();

        // Sessions discovered while a mapped switch is held must come up
        // muted. Counts are derived from remembered switch states; mute
        // calls happen outside the cache lock.
        let mut to_mute = Vec::new();
        for session in &sessions {
            let count = self.derive_switch_mute_count(&config, session.as_ref());
            session.set_switch_mute_count(count);
            if count > 0 && !session.get_mute() {
                to_mute.push(session.clone());
            }
        }

        {
            let mut cache = self.cache.lock().unwrap();
            for session in &sessions {
                let key = session.key();
                debug!(key = %key, "audio session acquired");
                if !self.session_mapped(&config, session.as_ref()) {
                    cache.unmapped.push(session.clone());
                }
                cache.by_key.entry(key).or_default().push(session.clone());
            }
        }

        for session in to_mute {
            if let Err(e) = session.set_mute(true, true) {
                warn!("failed to apply initial mute state: {e}");
            }
        }

        info!(count = sessions.len(), "acquired audio sessions");
    }

    /// Release the whole cache and the backend. Called on shutdown.
    pub fn release(&self) -> Result<()> {
        {
            let mut cache = self.cache.lock().unwrap();
            for sessions in cache.by_key.values() {
                for session in sessions {
                    session.release();
                }
            }
            cache.by_key.clear();
            cache.unmapped.clear();
        }
        self.backend.release()
    }

    fn is_stale(&self) -> bool {
        self.cache.lock().unwrap().last_refresh.elapsed() > MAX_REFRESH_INTERVAL
    }

    pub fn handle_slider_move(&self, event: SliderMove) {
        if self.is_stale() {
            debug!("stale session cache on slider move, refreshing");
            self.refresh(true);
        }

        let config = self.bus.current();
        let Some(targets) = config.slider_mapping.get(&event.slider_id) else {
            return;
        };

        let mut target_found = false;
        let mut adjustment_failed = false;

        for raw_target in targets {
            for resolved in self.resolve_target(raw_target) {
                for session in self.matching_sessions(&resolved) {
                    target_found = true;

                    if let Err(e) = session.set_volume(event.percent) {
                        warn!(key = %session.key(), "failed to set session volume: {e}");
                        adjustment_failed = true;
                    }

                    // A held switch outranks the slider: re-assert mute.
                    if session.switch_mute_count() > 0 {
                        if let Err(e) = session.set_mute(true, true) {
                            warn!(key = %session.key(), "failed to re-assert mute: {e}");
                            adjustment_failed = true;
                        }
                    }
                }
            }
        }

        if !target_found {
            // Processes may have opened since the last snapshot; the soft
            // cooldown keeps this from spamming.
            self.refresh(false);
        } else if adjustment_failed {
            // Typically a stale master session; only a forced refresh cures it.
            self.refresh(true);
        }
    }

    pub fn handle_switch_change(&self, event: SwitchChange) {
        if self.is_stale() {
            debug!("stale session cache on switch event, refreshing");
            self.refresh(true);
        }

        let config = self.bus.current();
        let Some(targets) = config.switch_mapping.get(&event.switch_id) else {
            return;
        };

        let mut state = event.state;
        let mut prev_state = event.prev_state;
        if config.invert_switches {
            state = !state;
            prev_state = prev_state.map(|p| !p);
        }

        let mut target_found = false;
        let mut action_failed = false;
        let mut applied: HashSet<usize> = HashSet::new();

        for raw_target in targets {
            for resolved in self.resolve_target(raw_target) {
                for session in self.matching_sessions(&resolved) {
                    target_found = true;

                    // Coalesce: each session is adjusted at most once per event.
                    let identity = Arc::as_ptr(&session).cast::<()>() as usize;
                    if !applied.insert(identity) {
                        continue;
                    }

                    action_failed |=
                        apply_switch_state(session.as_ref(), state, prev_state);
                }
            }
        }

        if !target_found {
            self.refresh(false);
        } else if action_failed {
            self.refresh(true);
        }
    }

    /// Resolve one mapping target to session keys or path prefixes.
    fn resolve_target(&self, raw_target: &str) -> Vec<String> {
        let target = normalize_key(raw_target);

        if !has_special_transform(&target) {
            return vec![target];
        }

        match target.as_str() {
            SPECIAL_CURRENT => {
                let mut names: Vec<String> = self
                    .inspector
                    .foreground_process_names()
                    .into_iter()
                    .map(|n| normalize_key(&n))
                    .collect();
                names.sort();
                names.dedup();
                names
            }
            SPECIAL_UNMAPPED => {
                let cache = self.cache.lock().unwrap();
                cache.unmapped.iter().map(|s| s.key()).collect()
            }
            _ => {
                debug!(target = %target, "unknown special transform");
                Vec::new()
            }
        }
    }

    /// All sessions a resolved target addresses. Collected under the cache
    /// lock; the lock is released before the caller touches the platform.
    fn matching_sessions(&self, resolved: &str) -> Vec<Arc<dyn Session>> {
        let cache = self.cache.lock().unwrap();

        if is_path(resolved) {
            cache
                .by_key
                .values()
                .flatten()
                .filter(|s| path_matches(&s.process_path(), resolved))
                .cloned()
                .collect()
        } else {
            cache.by_key.get(resolved).cloned().unwrap_or_default()
        }
    }

    /// Whether any non-special slider target matches this session. Master,
    /// system, mic and device sessions always count as mapped.
    fn session_mapped(&self, config: &AppConfig, session: &dyn Session) -> bool {
        let key = session.key();

        if key == target::MASTER_KEY || key == target::SYSTEM_KEY || key == target::MIC_KEY {
            return true;
        }
        if is_device_key(&key) {
            return true;
        }

        for targets in config.slider_mapping.values() {
            for raw_target in targets {
                if has_special_transform(raw_target) {
                    continue;
                }
                let resolved = normalize_key(raw_target);
                let matched = if is_path(&resolved) {
                    path_matches(&session.process_path(), &resolved)
                } else {
                    resolved == key
                };
                if matched {
                    return true;
                }
            }
        }

        false
    }

    /// Recompute a fresh session's mute count from the remembered switch
    /// states and the current switch mapping.
    fn derive_switch_mute_count(&self, config: &AppConfig, session: &dyn Session) -> u32 {
        let mut count = 0;

        'switches: for (switch_id, targets) in &config.switch_mapping {
            let Some(mut state) = self.device_state.switch_state(*switch_id) else {
                continue;
            };
            if config.invert_switches {
                state = !state;
            }
            if !state {
                continue;
            }

            for raw_target in targets {
                for resolved in self.resolve_target(raw_target) {
                    let matched = if is_path(&resolved) {
                        path_matches(&session.process_path(), &resolved)
                    } else {
                        resolved == session.key()
                    };
                    if matched {
                        count += 1;
                        continue 'switches;
                    }
                }
            }
        }

        count
    }
}

/// Apply one switch transition to one session. Returns true when a mute call
/// failed, which makes the caller force a refresh.
fn apply_switch_state(session: &dyn Session, state: bool, prev_state: Option<bool>) -> bool {
    if prev_state == Some(state) {
        return false;
    }

    let delta = match prev_state {
        Some(_) => {
            if state {
                1
            } else {
                -1
            }
        }
        None => i32::from(state),
    };

    if delta != 0 {
        session.adjust_switch_mute_count(delta);
    }

    if session.switch_mute_count() > 0 {
        if !session.get_mute() {
            if let Err(e) = session.set_mute(true, false) {
                warn!(key = %session.key(), "failed to mute session: {e}");
                return true;
            }
        }
        return false;
    }

    // Unmute only on an active turn-off (or when history is unknown).
    if session.get_mute() && (prev_state.is_none() || !state) {
        if let Err(e) = session.set_mute(false, false) {
            warn!(key = %session.key(), "failed to unmute session: {e}");
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RawState;
    use crate::platform::NoWindowInspector;
    use crate::session::mock::{MockBackend, MockSession};

    fn parse(toml_str: &str) -> AppConfig {
        toml::from_str(toml_str).unwrap()
    }

    fn map_with(
        config: AppConfig,
        backend: Arc<MockBackend>,
    ) -> (SessionMap, Arc<ConfigBus>, Arc<DeviceState>) {
        let bus = Arc::new(ConfigBus::new(config));
        let state = Arc::new(DeviceState::new());
        let map = SessionMap::new(
            backend,
            bus.clone(),
            state.clone(),
            Arc::new(NoWindowInspector),
        );
        (map, bus, state)
    }

    fn slider(slider_id: u16, percent: f32) -> SliderMove {
        SliderMove { slider_id, percent }
    }

    fn switch(switch_id: u16, state: bool, prev_state: Option<bool>) -> SwitchChange {
        SwitchChange {
            switch_id,
            state,
            prev_state,
        }
    }

    #[tokio::test]
    async fn slider_sets_volume_on_mapped_session() {
        let firefox = MockSession::new("firefox");
        let backend = MockBackend::with_sessions(vec![firefox.clone()]);
        let config = parse(
            r#"
[slider_mapping]
3 = ["firefox"]
"#,
        );
        let (map, _bus, _state) = map_with(config, backend.clone());
        map.initialize().unwrap();

        map.handle_slider_move(slider(3, 0.42));

        assert_eq!(*firefox.volume_calls.lock().unwrap(), vec![0.42]);
        // one enumeration at init, no refresh triggered by the event
        assert_eq!(backend.enumerations(), 1);
    }

    #[tokio::test]
    async fn unmapped_slider_is_ignored() {
        let firefox = MockSession::new("firefox");
        let backend = MockBackend::with_sessions(vec![firefox.clone()]);
        let (map, _bus, _state) = map_with(parse("[slider_mapping]\n3 = [\"firefox\"]"), backend);
        map.initialize().unwrap();

        map.handle_slider_move(slider(7, 0.5));
        assert!(firefox.volume_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn switch_mute_accumulates_and_drains() {
        let discord = MockSession::new("discord");
        let backend = MockBackend::with_sessions(vec![discord.clone()]);
        let config = parse(
            r#"
[switch_mapping]
0 = ["discord"]
1 = ["discord"]
"#,
        );
        let (map, _bus, _state) = map_with(config, backend);
        map.initialize().unwrap();

        map.handle_switch_change(switch(0, true, None));
        map.handle_switch_change(switch(1, true, None));
        map.handle_switch_change(switch(0, false, Some(true)));

        assert_eq!(discord.switch_mute_count(), 1);
        assert!(discord.get_mute());

        map.handle_switch_change(switch(1, false, Some(true)));
        assert_eq!(discord.switch_mute_count(), 0);
        assert!(!discord.get_mute());
    }

    #[tokio::test]
    async fn mute_count_never_goes_negative() {
        let discord = MockSession::new("discord");
        let backend = MockBackend::with_sessions(vec![discord.clone()]);
        let (map, _bus, _state) =
            map_with(parse("[switch_mapping]\n0 = [\"discord\"]"), backend);
        map.initialize().unwrap();

        map.handle_switch_change(switch(0, false, Some(true)));
        map.handle_switch_change(switch(0, false, Some(true)));
        assert_eq!(discord.switch_mute_count(), 0);
    }

    #[tokio::test]
    async fn repeated_state_is_a_no_op() {
        let discord = MockSession::new("discord");
        let backend = MockBackend::with_sessions(vec![discord.clone()]);
        let (map, _bus, _state) =
            map_with(parse("[switch_mapping]\n0 = [\"discord\"]"), backend);
        map.initialize().unwrap();

        map.handle_switch_change(switch(0, true, None));
        map.handle_switch_change(switch(0, true, Some(true)));
        assert_eq!(discord.switch_mute_count(), 1);
        assert_eq!(discord.mute_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn slider_reasserts_mute_while_switch_held() {
        let spotify = MockSession::new("spotify");
        let backend = MockBackend::with_sessions(vec![spotify.clone()]);
        let config = parse(
            r#"
[slider_mapping]
0 = ["spotify"]

[switch_mapping]
0 = ["spotify"]
"#,
        );
        let (map, _bus, _state) = map_with(config, backend);
        map.initialize().unwrap();

        map.handle_switch_change(switch(0, true, None));
        map.handle_slider_move(slider(0, 0.6));

        assert!(spotify.get_mute());
        // mute asserted by the switch, then re-asserted silently by the slider
        let calls = spotify.mute_calls.lock().unwrap();
        assert_eq!(*calls, vec![(true, false), (true, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn soft_window_suppresses_unforced_refresh() {
        let backend = MockBackend::with_sessions(vec![MockSession::new("firefox")]);
        let (map, _bus, _state) = map_with(AppConfig::default(), backend.clone());
        map.initialize().unwrap();
        assert_eq!(backend.enumerations(), 1);

        map.refresh(false);
        assert_eq!(backend.enumerations(), 1);

        map.refresh(true);
        assert_eq!(backend.enumerations(), 2);

        tokio::time::advance(Duration::from_secs(6)).await;
        map.refresh(false);
        assert_eq!(backend.enumerations(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hard_window_forces_refresh_on_next_event() {
        let firefox = MockSession::new("firefox");
        let backend = MockBackend::with_sessions(vec![firefox.clone()]);
        let (map, _bus, _state) = map_with(parse("[slider_mapping]\n0 = [\"firefox\"]"), backend.clone());
        map.initialize().unwrap();
        assert_eq!(backend.enumerations(), 1);

        tokio::time::advance(Duration::from_secs(46)).await;
        map.handle_slider_move(slider(0, 0.5));
        assert_eq!(backend.enumerations(), 2);
    }

    #[tokio::test]
    async fn missing_target_requests_soft_refresh() {
        let backend = MockBackend::with_sessions(vec![MockSession::new("firefox")]);
        let (map, _bus, _state) = map_with(parse("[slider_mapping]\n0 = [\"chrome\"]"), backend.clone());
        map.initialize().unwrap();

        // suppressed by the soft window right after init
        map.handle_slider_move(slider(0, 0.5));
        assert_eq!(backend.enumerations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn volume_failure_forces_refresh() {
        let master = MockSession::new("master");
        master.fail_volume(true);
        let backend = MockBackend::with_sessions(vec![master.clone()]);
        let (map, _bus, _state) = map_with(parse("[slider_mapping]\n0 = [\"master\"]"), backend.clone());
        map.initialize().unwrap();
        assert_eq!(backend.enumerations(), 1);

        map.handle_slider_move(slider(0, 0.5));
        // forced refresh bypasses the soft window
        assert_eq!(backend.enumerations(), 2);
        // the stale session was released by that refresh
        assert_eq!(master.released(), 1);
    }

    #[tokio::test]
    async fn refresh_releases_previous_snapshot_exactly_once() {
        let old = MockSession::new("firefox");
        let backend = MockBackend::with_sessions(vec![old.clone()]);
        let (map, _bus, _state) = map_with(AppConfig::default(), backend.clone());
        map.initialize().unwrap();

        let new = MockSession::new("firefox");
        backend.set_sessions(vec![new.clone()]);
        map.refresh(true);

        assert_eq!(old.released(), 1);
        assert_eq!(new.released(), 0);
    }

    #[tokio::test]
    async fn path_target_matches_by_prefix() {
        let game = MockSession::with_path("factorio", "/opt/games/factorio/bin/factorio");
        let other = MockSession::with_path("vim", "/usr/bin/vim");
        let backend = MockBackend::with_sessions(vec![game.clone(), other.clone()]);
        let (map, _bus, _state) =
            map_with(parse("[slider_mapping]\n0 = [\"/opt/games\"]"), backend);
        map.initialize().unwrap();

        map.handle_slider_move(slider(0, 0.3));
        assert_eq!(*game.volume_calls.lock().unwrap(), vec![0.3]);
        assert!(other.volume_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unmapped_transform_targets_leftover_sessions() {
        let mapped = MockSession::new("firefox");
        let stray = MockSession::new("game");
        let master = MockSession::new("master");
        let backend =
            MockBackend::with_sessions(vec![mapped.clone(), stray.clone(), master.clone()]);
        let config = parse(
            r#"
[slider_mapping]
0 = ["firefox"]
5 = ["deej.unmapped"]
"#,
        );
        let (map, _bus, _state) = map_with(config, backend);
        map.initialize().unwrap();

        map.handle_slider_move(slider(5, 0.2));

        assert_eq!(*stray.volume_calls.lock().unwrap(), vec![0.2]);
        // master always counts as mapped, firefox is explicitly mapped
        assert!(mapped.volume_calls.lock().unwrap().is_empty());
        assert!(master.volume_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_discovered_while_switch_held_comes_up_muted() {
        let backend = MockBackend::with_sessions(vec![]);
        let config = parse("[switch_mapping]\n0 = [\"discord\"]");
        let (map, _bus, state) = map_with(config, backend.clone());
        map.initialize().unwrap();

        // switch 0 went on while discord wasn't running
        state.record(&RawState::Switch { id: 0, state: true });

        let discord = MockSession::new("discord");
        backend.set_sessions(vec![discord.clone()]);
        map.refresh(true);

        assert_eq!(discord.switch_mute_count(), 1);
        assert!(discord.get_mute());
    }

    #[tokio::test]
    async fn inverted_switches_flip_mute_direction() {
        let discord = MockSession::new("discord");
        let backend = MockBackend::with_sessions(vec![discord.clone()]);
        let mut config = parse("[switch_mapping]\n0 = [\"discord\"]");
        config.invert_switches = true;
        let (map, _bus, _state) = map_with(config, backend);
        map.initialize().unwrap();

        // physical off reads as logical on
        map.handle_switch_change(switch(0, false, None));
        assert_eq!(discord.switch_mute_count(), 1);
        assert!(discord.get_mute());
    }

    #[tokio::test]
    async fn release_shuts_down_backend() {
        let session = MockSession::new("firefox");
        let backend = MockBackend::with_sessions(vec![session.clone()]);
        let (map, _bus, _state) = map_with(AppConfig::default(), backend.clone());
        map.initialize().unwrap();

        map.release().unwrap();
        assert_eq!(session.released(), 1);
        assert!(backend.released.load(std::sync::atomic::Ordering::SeqCst));
    }
}
