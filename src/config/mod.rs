pub mod bus;
pub mod schema;
pub mod watcher;

use crate::error::{MixError, Result};
use schema::{AppConfig, Step};
use std::path::Path;

/// Load and parse configuration from a TOML file.
///
/// # Errors
/// Returns `MixError::ConfigNotFound` if the file doesn't exist,
/// `MixError::Io` on read errors, `MixError::TomlParse` on syntax errors,
/// or `MixError::Config` on validation failures.
pub fn load(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        return Err(MixError::ConfigNotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)?;
    let content = expand_env_vars(&content);
    let config: AppConfig = toml::from_str(&content)?;

    validate(&config)?;
    Ok(config)
}

/// Expand `${VAR}` and `$VAR` patterns in the config string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' {
            if chars.peek() == Some(&'{') {
                chars.next(); // consume '{'
                let var_name: String = chars.by_ref().take_while(|&c| c != '}').collect();
                if let Ok(val) = std::env::var(&var_name) {
                    result.push_str(&val);
                } else {
                    // Keep original if env var not found
                    use std::fmt::Write;
                    let _ = write!(result, "${{{var_name}}}");
                }
            } else {
                let var_name: String = chars
                    .by_ref()
                    .take_while(|c| c.is_alphanumeric() || *c == '_')
                    .collect();
                if var_name.is_empty() {
                    result.push('$');
                } else if let Ok(val) = std::env::var(&var_name) {
                    result.push_str(&val);
                } else {
                    result.push('$');
                    result.push_str(&var_name);
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}

/// Validate config constraints that serde cannot express.
fn validate(config: &AppConfig) -> Result<()> {
    if config.connection.serial_port.as_deref().is_some_and(|p| !p.is_empty())
        && !config.connection.serial_baud.is_some_and(|b| b != 0)
    {
        return Err(MixError::Config(
            "connection: serial_port is set but serial_baud is missing or zero".to_string(),
        ));
    }

    for (button_id, button) in &config.button_actions.buttons {
        for kind in [
            schema::ActionKind::Single,
            schema::ActionKind::Double,
            schema::ActionKind::Long,
        ] {
            let Some(action) = button.action(kind) else {
                continue;
            };
            for (idx, step) in action.steps.iter().enumerate() {
                validate_step(step).map_err(|msg| {
                    MixError::Config(format!(
                        "button {button_id} {kind} step {idx}: {msg}"
                    ))
                })?;
            }
        }
    }

    Ok(())
}

fn validate_step(step: &Step) -> std::result::Result<(), String> {
    match step {
        Step::Execute {
            app,
            wait,
            wait_timeout_ms,
            wait_window,
            ..
        } => {
            if app.is_empty() {
                return Err("execute: app is required".to_string());
            }
            if wait_timeout_ms.is_some_and(|ms| ms > 0) && !wait {
                return Err("execute: wait_timeout_ms requires wait = true".to_string());
            }
            if let Some(window) = wait_window {
                if *wait {
                    return Err("execute: wait_window requires wait = false".to_string());
                }
                if window.timeout_ms == 0 {
                    return Err("execute: wait_window.timeout_ms must be positive".to_string());
                }
            }
            Ok(())
        }
        Step::Delay { ms } => {
            if *ms == 0 {
                return Err("delay: ms must be positive".to_string());
            }
            Ok(())
        }
        Step::Keystroke { keys } => {
            if keys.is_empty() {
                return Err("keystroke: keys is required".to_string());
            }
            Ok(())
        }
        Step::Typing { text, .. } => {
            if text.is_empty() {
                return Err("typing: text is required".to_string());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_expansion() {
        std::env::set_var("MIXD_TEST_VAR", "hello");
        let result = expand_env_vars("url = \"${MIXD_TEST_VAR}/path\"");
        assert_eq!(result, "url = \"hello/path\"");
        std::env::remove_var("MIXD_TEST_VAR");
    }

    #[test]
    fn env_var_missing_kept() {
        let result = expand_env_vars("url = \"${MIXD_NONEXISTENT}/path\"");
        assert_eq!(result, "url = \"${MIXD_NONEXISTENT}/path\"");
    }

    #[test]
    fn serial_port_without_baud_is_rejected() {
        let config: AppConfig = toml::from_str(
            r#"
[connection]
serial_port = "/dev/ttyUSB0"
"#,
        )
        .unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn delay_of_zero_is_rejected() {
        let config: AppConfig = toml::from_str(
            r#"
[button_actions.0.single]
steps = [{ type = "delay", ms = 0 }]
"#,
        )
        .unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn wait_timeout_without_wait_is_rejected() {
        let config: AppConfig = toml::from_str(
            r#"
[button_actions.0.single]
steps = [{ type = "execute", app = "ls", wait_timeout_ms = 1000 }]
"#,
        )
        .unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn wait_window_with_wait_is_rejected() {
        let config: AppConfig = toml::from_str(
            r#"
[button_actions.0.single]
steps = [{ type = "execute", app = "ls", wait = true, wait_window = { timeout_ms = 500 } }]
"#,
        )
        .unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn well_formed_action_passes() {
        let config: AppConfig = toml::from_str(
            r#"
[button_actions.1.double]
steps = [
    { type = "execute", app = "xdg-open", args = ["https://example.com"] },
    { type = "delay", ms = 100 },
]
"#,
        )
        .unwrap();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn load_example_config() {
        let dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
        let path = std::path::PathBuf::from(dir).join("config.example.toml");
        if path.exists() {
            let config = load(&path).unwrap();
            assert!(config.connection.serial_configured() || config.connection.sse_configured());
        }
    }
}
