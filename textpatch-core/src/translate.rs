use std::collections::HashMap;

use crate::Result;

/// The engine's view of the machine-translation backend: a total function
/// from source text to replacement text. The real network-backed client
/// lives outside this crate; anything implementing this trait can drive
/// [`crate::entries::build_entries`].
pub trait Translator {
    fn translate(&self, text: &str, source_lang: &str, target_lang: &str) -> Result<String>;
}

/// Returns the input unchanged. Useful for dry runs that exercise the whole
/// relocation path without changing any text.
pub struct PassthroughTranslator;

impl Translator for PassthroughTranslator {
    fn translate(&self, text: &str, _source_lang: &str, _target_lang: &str) -> Result<String> {
        Ok(text.to_string())
    }
}

/// Exact-match lookup table; text without a glossary entry passes through
/// unchanged.
pub struct GlossaryTranslator {
    entries: HashMap<String, String>,
}

impl GlossaryTranslator {
    pub fn new<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        GlossaryTranslator {
            entries: entries.into_iter().collect(),
        }
    }
}

impl Translator for GlossaryTranslator {
    fn translate(&self, text: &str, _source_lang: &str, _target_lang: &str) -> Result<String> {
        Ok(self
            .entries
            .get(text)
            .cloned()
            .unwrap_or_else(|| text.to_string()))
    }
}
