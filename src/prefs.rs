//! Per-app notification switches stored under `functions.app_functions.<app>`
//! of an agent config. Missing keys default to on.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Sms,
    Calls,
    WebChat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppPrefs {
    pub enabled: bool,
    pub sms: bool,
    pub calls: bool,
    pub web_chat: bool,
    pub translations: bool,
}

impl Default for AppPrefs {
    fn default() -> Self {
        Self {
            enabled: true,
            sms: true,
            calls: true,
            web_chat: true,
            translations: true,
        }
    }
}

pub fn app_prefs(functions: Option<&Value>, app: &str) -> AppPrefs {
    functions
        .and_then(|f| f.get("app_functions"))
        .and_then(|a| a.get(app))
        .and_then(|p| serde_json::from_value(p.clone()).ok())
        .unwrap_or_default()
}

pub fn should_notify(functions: Option<&Value>, app: &str, channel: Channel) -> bool {
    let prefs = app_prefs(functions, app);
    prefs.enabled
        && match channel {
            Channel::Sms => prefs.sms,
            Channel::Calls => prefs.calls,
            Channel::WebChat => prefs.web_chat,
        }
}
