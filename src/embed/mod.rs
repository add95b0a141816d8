//! Embedded static resources.
//!
//! # Module Structure
//!
//! - `template` - Template types for typed variable injection
//! - `client` - Browser runtime prepended to hot builds (client.js)
//!
//! # Usage
//!
//! ```ignore
//! use embed::client::{CLIENT_JS, ClientVars};
//!
//! let prelude = CLIENT_JS.render(&ClientVars { target_name: "Main".into(), .. });
//! ```

mod template;

pub use template::{Template, TemplateVars};

pub mod client {
    use super::{Template, TemplateVars};
    use crate::actor::ws::reconnect_schedule;
    use crate::core::CompilationMode;

    /// Variables for client.js.
    pub struct ClientVars {
        pub version: &'static str,
        pub target_name: String,
        pub compiled_timestamp: u64,
        pub mode: CompilationMode,
        pub ws_port: u16,
    }

    fn json_string(value: &str) -> String {
        serde_json::to_string(value).unwrap_or_else(|_| "\"\"".into())
    }

    impl TemplateVars for ClientVars {
        fn apply(&self, content: &str) -> String {
            let delays: Vec<u64> = reconnect_schedule()
                .iter()
                .map(|d| d.as_millis() as u64)
                .collect();
            content
                .replace("__ELM_WATCH_VERSION__", &json_string(self.version))
                .replace("__ELM_WATCH_TARGET_NAME__", &json_string(&self.target_name))
                .replace(
                    "__ELM_WATCH_COMPILED_TIMESTAMP__",
                    &self.compiled_timestamp.to_string(),
                )
                .replace(
                    "__ELM_WATCH_COMPILATION_MODE__",
                    &json_string(self.mode.as_str()),
                )
                .replace("__ELM_WATCH_WEBSOCKET_PORT__", &self.ws_port.to_string())
                .replace(
                    "__ELM_WATCH_RECONNECT_DELAYS__",
                    &serde_json::to_string(&delays).unwrap_or_else(|_| "[1000]".into()),
                )
        }
    }

    /// Hot reload runtime, prepended to every hot build.
    pub const CLIENT_JS: Template<ClientVars> = Template::new(include_str!("client.js"));
}
