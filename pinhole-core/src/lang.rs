//! Process-wide language selector. The message catalog itself lives with the
//! driver; the core only records which language diagnostics should use. The
//! selector is set once before concurrent use.

use once_cell::sync::OnceCell;
use serde::Deserialize;

/// Supported diagnostic languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Zh,
}

static LANGUAGE: OnceCell<Language> = OnceCell::new();

/// Select the process language. Later calls are ignored; the first caller
/// wins.
pub fn set_language(lang: Language) {
    let _ = LANGUAGE.set(lang);
}

/// Current process language, defaulting to English.
pub fn language() -> Language {
    LANGUAGE.get().copied().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_setter_wins() {
        set_language(Language::Zh);
        set_language(Language::En);
        assert_eq!(language(), Language::Zh);
    }
}
