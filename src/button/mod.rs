pub mod keys;
pub mod step;

use crate::config::bus::ConfigBus;
use crate::config::schema::{ActionKind, ButtonActions, Step};
use crate::error::{MixError, Result};
use crate::event::SwitchChange;
use crate::notify::Notifier;
use crate::platform::{InputSynth, WindowProbe};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use step::{run_step, StepContext};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Hold at least this long before release to register a long press.
const LONG_PRESS: Duration = Duration::from_millis(500);

/// A second press starting within this window makes a double press.
const DOUBLE_WINDOW: Duration = Duration::from_millis(300);

/// How often naturally-exited children are reaped from the tracked set.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Children started with `wait = false`, kept killable until they exit or a
/// `cancel_all` sweeps them.
#[derive(Default)]
pub struct TrackedChildren {
    children: tokio::sync::Mutex<HashMap<String, Child>>,
}

impl TrackedChildren {
    pub async fn track(&self, key: String, child: Child) {
        debug!(key, pid = ?child.id(), "tracking child process");
        self.children.lock().await.insert(key, child);
    }

    pub async fn len(&self) -> usize {
        self.children.lock().await.len()
    }

    /// Remove children that have already exited.
    pub async fn reap(&self) {
        let mut children = self.children.lock().await;
        children.retain(|key, child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!(key, %status, "tracked child exited");
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(key, "failed to poll tracked child: {e}");
                false
            }
        });
    }

    /// Terminate every tracked child and confirm each exit before returning.
    pub async fn kill_all(&self) {
        let mut children = std::mem::take(&mut *self.children.lock().await);
        for (key, child) in &mut children {
            debug!(key, pid = ?child.id(), "force killing tracked child");
            let _ = child.start_kill();
        }
        for (_, mut child) in children {
            let _ = child.wait().await;
        }
    }
}

enum PressState {
    Down { at: Instant },
    AwaitSecond { deadline: Instant },
    SecondDown,
}

/// Executes button action sequences with exclusivity, cancellation and
/// child-process tracking.
///
/// The device reports buttons as momentary switch transitions; the engine
/// classifies them into single, double and long presses host-side. Lock
/// order is `running` before `tracked`, never the reverse.
pub struct ButtonEngine {
    notifier: Arc<dyn Notifier>,
    synth: Arc<dyn InputSynth>,
    probe: Arc<dyn WindowProbe>,
    actions: ArcSwap<ButtonActions>,
    running: Mutex<HashMap<String, CancellationToken>>,
    tracked: Arc<TrackedChildren>,
}

impl ButtonEngine {
    pub fn new(
        bus: &ConfigBus,
        notifier: Arc<dyn Notifier>,
        synth: Arc<dyn InputSynth>,
        probe: Arc<dyn WindowProbe>,
    ) -> Arc<Self> {
        Arc::new(Self {
            notifier,
            synth,
            probe,
            actions: ArcSwap::from_pointee(bus.current().button_actions.clone()),
            running: Mutex::new(HashMap::new()),
            tracked: Arc::new(TrackedChildren::default()),
        })
    }

    pub fn tracked_children(&self) -> Arc<TrackedChildren> {
        self.tracked.clone()
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    /// Kick off the action bound to `(button_id, kind)`, if any. Exclusive
    /// actions drop the press while an instance with the same key runs.
    pub fn handle_press(self: &Arc<Self>, button_id: u16, kind: ActionKind) {
        let table = self.actions.load();
        let Some(action) = table
            .buttons
            .get(&button_id)
            .and_then(|b| b.action(kind))
        else {
            return;
        };
        if action.steps.is_empty() {
            return;
        }

        let key = format!("{button_id}_{kind}");
        let steps = action.steps.clone();
        let cancel = CancellationToken::new();

        {
            let mut running = self.running.lock().unwrap();
            if action.exclusive && running.contains_key(&key) {
                debug!(key, "action already running (exclusive), dropping press");
                return;
            }
            running.insert(key.clone(), cancel.clone());
        }

        info!(button = button_id, %kind, steps = steps.len(), "starting button action");

        let engine = self.clone();
        tokio::spawn(async move {
            let result = engine.execute_steps(&steps, &key, &cancel).await;
            engine.running.lock().unwrap().remove(&key);
            cancel.cancel();

            match result {
                Ok(()) => debug!(key, "action completed"),
                Err(MixError::Cancelled) => debug!(key, "action cancelled"),
                Err(e) => {
                    warn!(key, "action failed: {e}");
                    engine.notify_failure(&e);
                }
            }
        });
    }

    async fn execute_steps(
        &self,
        steps: &[Step],
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let ctx = StepContext {
            cancel,
            synth: self.synth.as_ref(),
            probe: self.probe.as_ref(),
            tracked: self.tracked.as_ref(),
            action_key: key,
        };

        for (index, step) in steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(MixError::Cancelled);
            }
            debug!(key, index, kind = step.kind(), "executing step");
            run_step(step, index, &ctx).await?;
        }

        Ok(())
    }

    fn notify_failure(&self, error: &MixError) {
        match error {
            MixError::ExecutableNotFound { app } => self.notifier.notify(
                "Failed to execute application",
                &format!("Cannot find or run: {app}\n\nPlease check your configuration."),
            ),
            e if e.is_user_facing() => self.notifier.notify("Button action failed", &e.to_string()),
            _ => {}
        }
    }

    /// Cancel every running action and terminate every tracked child. Every
    /// child present at the start of the call is confirmed exited before the
    /// call returns.
    pub async fn cancel_all(&self) {
        let cancelled = {
            let mut running = self.running.lock().unwrap();
            let tokens: Vec<_> = running.drain().map(|(_, token)| token).collect();
            tokens
        };
        let count = cancelled.len();
        for token in cancelled {
            token.cancel();
        }

        self.tracked.kill_all().await;

        if count > 0 {
            info!(actions = count, "cancelled running button actions");
        }
    }

    /// Swap the action table for the reloaded config. In-flight actions keep
    /// their old steps; future presses see the new table. With
    /// `cancel_on_reload` set, in-flight work is torn down first.
    pub async fn apply_reload(&self, actions: &ButtonActions) {
        if actions.cancel_on_reload {
            self.cancel_all().await;
        }
        self.actions.store(Arc::new(actions.clone()));
        debug!(buttons = actions.buttons.len(), "button action table swapped");
    }

    /// Press-classification loop: consumes raw switch transitions and turns
    /// them into single/double/long presses for buttons that have actions.
    pub async fn run(
        self: Arc<Self>,
        mut switches: mpsc::Receiver<SwitchChange>,
        cancel: CancellationToken,
    ) {
        let mut states: HashMap<u16, PressState> = HashMap::new();

        loop {
            let next_deadline = states
                .values()
                .filter_map(|s| match s {
                    PressState::AwaitSecond { deadline } => Some(*deadline),
                    _ => None,
                })
                .min();

            tokio::select! {
                _ = cancel.cancelled() => return,

                event = switches.recv() => match event {
                    None => {
                        debug!("switch channel closed, classifier exiting");
                        return;
                    }
                    Some(event) => self.classify(&mut states, event),
                },

                _ = sleep_until_or_forever(next_deadline) => {
                    let now = Instant::now();
                    let expired: Vec<u16> = states
                        .iter()
                        .filter_map(|(id, s)| match s {
                            PressState::AwaitSecond { deadline } if *deadline <= now => Some(*id),
                            _ => None,
                        })
                        .collect();
                    for id in expired {
                        states.remove(&id);
                        self.handle_press(id, ActionKind::Single);
                    }
                }

                _ = tokio::time::sleep(REAP_INTERVAL), if next_deadline.is_none() => {
                    self.tracked.reap().await;
                }
            }
        }
    }

    fn classify(self: &Arc<Self>, states: &mut HashMap<u16, PressState>, event: SwitchChange) {
        let table = self.actions.load();
        let Some(button) = table.buttons.get(&event.switch_id) else {
            return;
        };
        if !button.has_actions() {
            return;
        }

        let id = event.switch_id;
        if event.state {
            match states.get(&id) {
                None => {
                    states.insert(id, PressState::Down { at: Instant::now() });
                }
                Some(PressState::AwaitSecond { .. }) => {
                    states.insert(id, PressState::SecondDown);
                }
                Some(_) => {}
            }
        } else {
            match states.remove(&id) {
                Some(PressState::Down { at }) => {
                    if at.elapsed() >= LONG_PRESS {
                        self.handle_press(id, ActionKind::Long);
                    } else if button.double.is_some() {
                        states.insert(
                            id,
                            PressState::AwaitSecond {
                                deadline: Instant::now() + DOUBLE_WINDOW,
                            },
                        );
                    } else {
                        // no double configured, fire immediately
                        self.handle_press(id, ActionKind::Single);
                    }
                }
                Some(PressState::SecondDown) => {
                    self.handle_press(id, ActionKind::Double);
                }
                _ => {}
            }
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::AppConfig;
    use crate::notify::testing::RecordingNotifier;
    use crate::platform::testing::RecordingSynth;
    use crate::platform::NoWindowProbe;

    fn engine_with(config: &str) -> (Arc<ButtonEngine>, Arc<RecordingNotifier>) {
        let config: AppConfig = toml::from_str(config).unwrap();
        let bus = ConfigBus::new(config);
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = ButtonEngine::new(
            &bus,
            notifier.clone(),
            Arc::new(RecordingSynth::default()),
            Arc::new(NoWindowProbe),
        );
        (engine, notifier)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn unmapped_press_does_nothing() {
        let (engine, notifier) = engine_with("");
        engine.handle_press(0, ActionKind::Single);
        settle().await;
        assert_eq!(engine.running_count(), 0);
        assert!(notifier.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exclusive_action_drops_second_press() {
        let (engine, _) = engine_with(
            r#"
[button_actions.0.single]
exclusive = true
steps = [{ type = "delay", ms = 5000 }]
"#,
        );

        engine.handle_press(0, ActionKind::Single);
        settle().await;
        assert_eq!(engine.running_count(), 1);

        engine.handle_press(0, ActionKind::Single);
        settle().await;
        assert_eq!(engine.running_count(), 1);

        engine.cancel_all().await;
        settle().await;
        assert_eq!(engine.running_count(), 0);
    }

    #[tokio::test]
    async fn non_exclusive_actions_may_overlap() {
        let (engine, _) = engine_with(
            r#"
[button_actions.0.single]
exclusive = false
steps = [{ type = "delay", ms = 5000 }]

[button_actions.1.single]
exclusive = false
steps = [{ type = "delay", ms = 5000 }]
"#,
        );

        engine.handle_press(0, ActionKind::Single);
        engine.handle_press(1, ActionKind::Single);
        settle().await;
        assert_eq!(engine.running_count(), 2);
        engine.cancel_all().await;
    }

    #[tokio::test]
    async fn missing_executable_notifies_by_name() {
        let (engine, notifier) = engine_with(
            r#"
[button_actions.2.single]
steps = [{ type = "execute", app = "no-such-binary-mixd" }]
"#,
        );

        engine.handle_press(2, ActionKind::Single);
        settle().await;

        let messages = notifier.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "Failed to execute application");
        assert!(messages[0].1.contains("no-such-binary-mixd"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_all_terminates_tracked_children() {
        let (engine, _) = engine_with(
            r#"
[button_actions.0.single]
steps = [{ type = "execute", app = "sleep", args = ["60"] }]
"#,
        );

        engine.handle_press(0, ActionKind::Single);
        settle().await;
        assert_eq!(engine.tracked_children().len().await, 1);

        engine.cancel_all().await;
        assert_eq!(engine.tracked_children().len().await, 0);
        assert_eq!(engine.running_count(), 0);
    }

    #[tokio::test]
    async fn reload_with_cancel_flag_clears_running_actions() {
        let (engine, _) = engine_with(
            r#"
[button_actions]
cancel_on_reload = true

[button_actions.0.single]
steps = [{ type = "delay", ms = 60000 }]
"#,
        );

        engine.handle_press(0, ActionKind::Single);
        settle().await;
        assert_eq!(engine.running_count(), 1);

        let new_config: AppConfig = toml::from_str(
            r#"
[button_actions]
cancel_on_reload = true
"#,
        )
        .unwrap();
        engine.apply_reload(&new_config.button_actions).await;
        settle().await;

        assert_eq!(engine.running_count(), 0);
        // old mapping is gone
        engine.handle_press(0, ActionKind::Single);
        settle().await;
        assert_eq!(engine.running_count(), 0);
    }

    #[tokio::test]
    async fn reload_without_flag_keeps_inflight_action() {
        let (engine, _) = engine_with(
            r#"
[button_actions.0.single]
steps = [{ type = "delay", ms = 5000 }]
"#,
        );

        engine.handle_press(0, ActionKind::Single);
        settle().await;

        let new_config: AppConfig = toml::from_str("").unwrap();
        engine.apply_reload(&new_config.button_actions).await;
        settle().await;

        // in-flight action still runs with its old steps
        assert_eq!(engine.running_count(), 1);
        engine.cancel_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn classifier_fires_single_after_double_window() {
        let (engine, _) = engine_with(
            r#"
[button_actions.3.single]
steps = [{ type = "delay", ms = 10000 }]

[button_actions.3.double]
steps = [{ type = "delay", ms = 10000 }]
"#,
        );

        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(engine.clone().run(rx, cancel.clone()));

        tx.send(SwitchChange { switch_id: 3, state: true, prev_state: None })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(SwitchChange { switch_id: 3, state: false, prev_state: Some(true) })
            .await
            .unwrap();

        // double window passes with no second press
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(engine.running_count(), 1);

        cancel.cancel();
        handle.await.unwrap();
        engine.cancel_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn classifier_detects_double_press() {
        let (engine, _) = engine_with(
            r#"
[button_actions.3.double]
steps = [{ type = "delay", ms = 10000 }]
"#,
        );

        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(engine.clone().run(rx, cancel.clone()));

        for _ in 0..2 {
            tx.send(SwitchChange { switch_id: 3, state: true, prev_state: None })
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(SwitchChange { switch_id: 3, state: false, prev_state: Some(true) })
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.running_count(), 1);

        cancel.cancel();
        handle.await.unwrap();
        engine.cancel_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn classifier_detects_long_press() {
        let (engine, _) = engine_with(
            r#"
[button_actions.5.long]
steps = [{ type = "delay", ms = 10000 }]
"#,
        );

        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(engine.clone().run(rx, cancel.clone()));

        tx.send(SwitchChange { switch_id: 5, state: true, prev_state: None })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;
        tx.send(SwitchChange { switch_id: 5, state: false, prev_state: Some(true) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(engine.running_count(), 1);

        cancel.cancel();
        handle.await.unwrap();
        engine.cancel_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn single_only_button_fires_immediately() {
        let (engine, _) = engine_with(
            r#"
[button_actions.7.single]
steps = [{ type = "delay", ms = 10000 }]
"#,
        );

        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(engine.clone().run(rx, cancel.clone()));

        tx.send(SwitchChange { switch_id: 7, state: true, prev_state: None })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(SwitchChange { switch_id: 7, state: false, prev_state: Some(true) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(engine.running_count(), 1);

        cancel.cancel();
        handle.await.unwrap();
        engine.cancel_all().await;
    }
}
