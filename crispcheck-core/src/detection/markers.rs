//! The fixed evidence set for a Crisp chat integration.

use crate::automation::ScriptPredicate;

/// Host that only appears in traffic when the widget is loaded.
pub const PROVIDER_HOST_MARKER: &str = "crisp.chat";

/// Text found in the loader snippet and in any markup that references it.
pub const SCRIPT_MARKER: &str = "crisp.chat";

/// Global the embed snippet assigns before loading the widget.
pub const GLOBAL_IDENTIFIER_MARKER: &str = "CRISP_WEBSITE_ID";

/// Globals defined once the widget runtime is present.
pub const WIDGET_BINDINGS: &[&str] = &["$crisp", "CRISP_WEBSITE_ID"];

pub const WIDGET_PREDICATE: ScriptPredicate = ScriptPredicate::any_defined(WIDGET_BINDINGS);

/// Best-effort guess at something that opens a chat window.
pub const CHAT_AFFORDANCE_SELECTOR: &str =
    "div[class*='chat'], button[class*='chat'], [data-crisp-id], #crisp-chatbox";

pub fn url_has_provider(url: &str) -> bool {
    url.contains(PROVIDER_HOST_MARKER)
}

/// Whether `text` (a response body or rendered markup) carries either marker.
pub fn text_has_marker(text: &str) -> bool {
    text.contains(SCRIPT_MARKER) || text.contains(GLOBAL_IDENTIFIER_MARKER)
}
