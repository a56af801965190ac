//! Element selectors used by the login flow.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Selector {
    Css(&'static str),
    XPath(&'static str),
    /// A clickable element whose visible text equals the given string.
    Text(&'static str),
}

pub const LOGIN_BUTTON: Selector = Selector::Text("Log in");
pub const EMAIL_INPUT: Selector = Selector::XPath("//input[contains(@id,'username')]");
pub const PASSWORD_INPUT: Selector = Selector::XPath("//input[contains(@id,'password')]");
pub const CONTINUE_BUTTON: Selector = Selector::Text("Continue");
pub const NEW_CHAT_BUTTON: Selector = Selector::Text("New chat");
pub const DIALOG: Selector = Selector::XPath("//div[contains(@role,'dialog')]");
pub const DIALOG_NEXT: Selector =
    Selector::XPath("//div[contains(@role,'dialog')]//button[normalize-space(.)='Next']");
pub const DIALOG_DONE: Selector =
    Selector::XPath("//div[contains(@role,'dialog')]//button[normalize-space(.)='Done']");

impl Selector {
    /// A script expression evaluating to the first matching element, or `null`.
    pub fn lookup_js(&self) -> String {
        match self {
            Selector::Css(css) => format!("document.querySelector({})", js_string(css)),
            Selector::XPath(xpath) => format!(
                "document.evaluate({}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue",
                js_string(xpath)
            ),
            Selector::Text(text) => format!(
                "(Array.from(document.querySelectorAll('button, a, [role=button], input[type=submit]'))\
                 .find(e => ((e.innerText || e.value || '').trim()) === {}) || null)",
                js_string(text)
            ),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Css(s) => write!(f, "css={}", s),
            Selector::XPath(s) => write!(f, "xpath={}", s),
            Selector::Text(s) => write!(f, "text='{}'", s),
        }
    }
}

fn js_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}
