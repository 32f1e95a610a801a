//! Pure helpers for keystroke combos and typing text.

use crate::platform::Modifier;

/// A parsed key combination: zero or more modifiers plus a final key name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCombo {
    pub modifiers: Vec<Modifier>,
    pub key: String,
}

fn parse_modifier(name: &str) -> Option<Modifier> {
    match name {
        "ctrl" | "control" => Some(Modifier::Ctrl),
        "alt" => Some(Modifier::Alt),
        "shift" => Some(Modifier::Shift),
        "win" | "windows" | "meta" | "super" | "cmd" => Some(Modifier::Meta),
        _ => None,
    }
}

/// Parse a `+`-joined combo like `Ctrl+Shift+M`. Every part except the last
/// must be a known modifier name; the final part is the key, passed to the
/// platform as-is (lowercased). Returns `None` for combos that cannot be
/// parsed, which callers skip.
pub fn parse_combo(keys: &str) -> Option<KeyCombo> {
    let parts: Vec<String> = keys
        .split('+')
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect();

    let (key, modifier_parts) = parts.split_last()?;

    let mut modifiers = Vec::with_capacity(modifier_parts.len());
    for part in modifier_parts {
        modifiers.push(parse_modifier(part)?);
    }

    Some(KeyCombo {
        modifiers,
        key: key.clone(),
    })
}

/// Translate the escape sequences `\n`, `\r`, `\t` and `\\` in typing text.
/// Unknown escapes pass through unchanged.
pub fn translate_escapes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_key_has_no_modifiers() {
        let combo = parse_combo("F5").unwrap();
        assert!(combo.modifiers.is_empty());
        assert_eq!(combo.key, "f5");
    }

    #[test]
    fn modifiers_parse_in_order() {
        let combo = parse_combo("Ctrl+Shift+M").unwrap();
        assert_eq!(combo.modifiers, vec![Modifier::Ctrl, Modifier::Shift]);
        assert_eq!(combo.key, "m");
    }

    #[test]
    fn modifier_aliases_resolve() {
        assert_eq!(
            parse_combo("Control+a").unwrap().modifiers,
            vec![Modifier::Ctrl]
        );
        assert_eq!(
            parse_combo("Super+l").unwrap().modifiers,
            vec![Modifier::Meta]
        );
        assert_eq!(
            parse_combo("Win+d").unwrap().modifiers,
            vec![Modifier::Meta]
        );
    }

    #[test]
    fn unknown_modifier_fails_parse() {
        assert!(parse_combo("Hyper+x").is_none());
    }

    #[test]
    fn empty_combo_fails_parse() {
        assert!(parse_combo("").is_none());
        assert!(parse_combo("+").is_none());
    }

    #[test]
    fn whitespace_around_parts_is_tolerated() {
        let combo = parse_combo(" Ctrl + T ").unwrap();
        assert_eq!(combo.modifiers, vec![Modifier::Ctrl]);
        assert_eq!(combo.key, "t");
    }

    #[test]
    fn escapes_translate() {
        assert_eq!(translate_escapes(r"line1\nline2"), "line1\nline2");
        assert_eq!(translate_escapes(r"a\tb"), "a\tb");
        assert_eq!(translate_escapes(r"cr\rlf"), "cr\rlf");
        assert_eq!(translate_escapes(r"back\\slash"), "back\\slash");
    }

    #[test]
    fn unknown_escapes_pass_through() {
        assert_eq!(translate_escapes(r"c:\x"), r"c:\x");
        assert_eq!(translate_escapes("trailing\\"), "trailing\\");
    }
}
