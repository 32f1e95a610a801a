use super::keys::{parse_combo, translate_escapes};
use super::TrackedChildren;
use crate::config::schema::{Step, WaitWindow};
use crate::error::{MixError, Result};
use crate::platform::{InputSynth, WindowProbe};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Timeout for `wait = true` when `wait_timeout_ms` is omitted.
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// An explicit `wait_timeout_ms = 0` means infinite, but the action must
/// stay cancellable.
const EFFECTIVELY_INFINITE: Duration = Duration::from_secs(24 * 60 * 60);

/// Polling interval while waiting for a window to appear.
const WINDOW_POLL: Duration = Duration::from_millis(50);

/// Budget for the non-blocking window readiness probe.
const READINESS_PROBE: Duration = Duration::from_millis(100);

/// Everything one step needs from its surrounding action.
pub(crate) struct StepContext<'a> {
    pub cancel: &'a CancellationToken,
    pub synth: &'a dyn InputSynth,
    pub probe: &'a dyn WindowProbe,
    pub tracked: &'a TrackedChildren,
    /// Action key, `"{button}_{kind}"`; child tracking keys derive from it.
    pub action_key: &'a str,
}

/// Execute one step. Cancellation is honored at every suspension point.
pub(crate) async fn run_step(step: &Step, index: usize, ctx: &StepContext<'_>) -> Result<()> {
    match step {
        Step::Execute {
            app,
            args,
            wait,
            wait_timeout_ms,
            wait_window,
        } => {
            run_execute(
                app,
                args,
                *wait,
                *wait_timeout_ms,
                wait_window.as_ref(),
                index,
                ctx,
            )
            .await
        }
        Step::Delay { ms } => run_delay(*ms, ctx).await,
        Step::Keystroke { keys } => run_keystroke(keys, ctx),
        Step::Typing {
            text,
            char_delay_ms,
        } => run_typing(text, *char_delay_ms, ctx).await,
    }
}

/// Resolve an app to an executable path: absolute paths must exist, bare
/// names are searched on PATH.
fn resolve_app(app: &str) -> Result<PathBuf> {
    let path = Path::new(app);
    if path.is_absolute() {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(MixError::ExecutableNotFound {
            app: app.to_string(),
        });
    }

    which::which(app).map_err(|_| MixError::ExecutableNotFound {
        app: app.to_string(),
    })
}

fn spawn_error(app: &str, error: &std::io::Error) -> MixError {
    if error.kind() == std::io::ErrorKind::PermissionDenied {
        MixError::PermissionDenied(format!("cannot run {app}"))
    } else {
        MixError::ExecutionFailed(format!("failed to start {app}: {error}"))
    }
}

async fn kill_child(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

async fn run_execute(
    app: &str,
    args: &[String],
    wait: bool,
    wait_timeout_ms: Option<u64>,
    wait_window: Option<&WaitWindow>,
    index: usize,
    ctx: &StepContext<'_>,
) -> Result<()> {
    let resolved = resolve_app(app)?;

    let mut child = Command::new(&resolved)
        .args(args)
        .spawn()
        .map_err(|e| spawn_error(app, &e))?;

    if wait {
        let timeout = match wait_timeout_ms {
            None => DEFAULT_WAIT_TIMEOUT,
            Some(0) => EFFECTIVELY_INFINITE,
            Some(ms) => Duration::from_millis(ms),
        };
        debug!(app, ?timeout, "waiting for process to complete");

        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                debug!(app, "killing process, action cancelled");
                kill_child(&mut child).await;
                Err(MixError::Cancelled)
            }
            result = tokio::time::timeout(timeout, child.wait()) => match result {
                Err(_) => {
                    debug!(app, "killing process, wait timed out");
                    kill_child(&mut child).await;
                    Err(MixError::Timeout(format!(
                        "{app} did not complete within {timeout:?}"
                    )))
                }
                Ok(Err(e)) => Err(MixError::ExecutionFailed(format!("wait on {app}: {e}"))),
                Ok(Ok(status)) if status.success() => Ok(()),
                Ok(Ok(status)) => Err(MixError::ExecutionFailed(format!(
                    "{app} exited with {status}"
                ))),
            }
        }
    } else {
        if let Some(window) = wait_window {
            if let Err(e) = wait_for_window(&mut child, window, ctx).await {
                debug!(app, "killing process, window wait failed: {e}");
                kill_child(&mut child).await;
                return Err(e);
            }
        }

        // Keep the child killable on cancel_on_reload and shutdown.
        let child_key = format!("{}#{index}", ctx.action_key);
        ctx.tracked.track(child_key, child).await;
        Ok(())
    }
}

/// Poll for a window belonging to the spawned process. If the process exits
/// first it was a launcher, and any foreground window satisfies the wait.
async fn wait_for_window(
    child: &mut Child,
    window: &WaitWindow,
    ctx: &StepContext<'_>,
) -> Result<()> {
    let deadline = Instant::now() + Duration::from_millis(window.timeout_ms);
    let pid = child.id();

    loop {
        if ctx.cancel.is_cancelled() {
            return Err(MixError::Cancelled);
        }
        if Instant::now() >= deadline {
            return Err(MixError::Timeout(format!(
                "window did not appear within {} ms",
                window.timeout_ms
            )));
        }

        let launcher = pid.is_none() || matches!(child.try_wait(), Ok(Some(_)));
        let found = if launcher {
            ctx.probe.foreground_window()
        } else {
            ctx.probe
                .window_for_pid(pid.unwrap_or_default(), window.title.as_deref())
        };

        if let Some(handle) = found {
            if window.focused && !ctx.probe.is_foreground(handle) {
                ctx.probe.focus_window(handle);
            } else if ctx.probe.window_ready(handle, READINESS_PROBE) {
                return Ok(());
            }
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(MixError::Cancelled),
            _ = tokio::time::sleep(WINDOW_POLL) => {}
        }
    }
}

async fn run_delay(ms: u64, ctx: &StepContext<'_>) -> Result<()> {
    if ms == 0 {
        return Err(MixError::ExecutionFailed(
            "delay duration must be positive".to_string(),
        ));
    }

    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(MixError::Cancelled),
        _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(()),
    }
}

fn run_keystroke(keys: &str, ctx: &StepContext<'_>) -> Result<()> {
    ctx.synth.available()?;

    let Some(combo) = parse_combo(keys) else {
        debug!(keys, "unparseable key combination, skipping");
        return Ok(());
    };

    let result = (|| -> Result<()> {
        for modifier in &combo.modifiers {
            ctx.synth.press_modifier(*modifier)?;
        }
        if !ctx.synth.tap_key(&combo.key)? {
            debug!(key = %combo.key, "unknown key name, skipped");
        }
        for modifier in combo.modifiers.iter().rev() {
            ctx.synth.release_modifier(*modifier)?;
        }
        Ok(())
    })();

    if result.is_err() {
        // don't leave modifiers held after a partial combo
        let _ = ctx.synth.release_all();
    }
    result
}

async fn run_typing(text: &str, char_delay_ms: u64, ctx: &StepContext<'_>) -> Result<()> {
    ctx.synth.available()?;

    match ctx.probe.foreground_window() {
        Some(window) => {
            if !ctx.probe.window_ready(window, READINESS_PROBE) {
                warn!("foreground window not confirming input readiness, typing anyway");
            }
        }
        None => warn!("no foreground window found, typing may not land anywhere"),
    }

    let translated = translate_escapes(text);
    let delay = Duration::from_millis(char_delay_ms.max(1));

    for ch in translated.chars() {
        if ctx.cancel.is_cancelled() {
            let _ = ctx.synth.release_all();
            return Err(MixError::Cancelled);
        }
        if let Err(e) = ctx.synth.send_char(ch) {
            let _ = ctx.synth.release_all();
            return Err(e);
        }
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                let _ = ctx.synth.release_all();
                return Err(MixError::Cancelled);
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    ctx.synth.release_all()
}
