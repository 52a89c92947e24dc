//! Locale-derived defaults.
//!
//! A graphics device without a `keymap` attribute gets the keymap of the
//! process locale, e.g. `de` for `de_DE.UTF-8`.

use std::env;

/// Keymap used when no locale variable names a language.
pub const FALLBACK_KEYMAP: &str = "en-us";

const LOCALE_VARS: [&str; 3] = ["LC_ALL", "LC_MESSAGES", "LANG"];

/// Keymap for the current process environment.
pub fn default_keymap() -> String {
    let locale = LOCALE_VARS
        .iter()
        .filter_map(|var| env::var(var).ok())
        .find(|value| !value.is_empty());

    locale
        .as_deref()
        .and_then(keymap_from_locale)
        .unwrap_or_else(|| FALLBACK_KEYMAP.to_string())
}

/// Two-letter language code of a POSIX locale string.
///
/// Returns `None` for `C`, `POSIX` and strings without a language part.
pub fn keymap_from_locale(locale: &str) -> Option<String> {
    let language = locale
        .split(|c| c == '_' || c == '.' || c == '@')
        .next()
        .unwrap_or_default();

    if language.eq_ignore_ascii_case("c") || language.eq_ignore_ascii_case("posix") {
        return None;
    }
    if language.len() < 2 || !language.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }

    Some(language[..2].to_ascii_lowercase())
}
