use std::collections::HashMap;
use std::sync::OnceLock;

static CATALOG: OnceLock<Catalog> = OnceLock::new();

/// Load the message catalog for the current locale. Calling this is optional;
/// the first lookup loads it otherwise.
pub fn init() {
    catalog();
}

fn catalog() -> &'static Catalog {
    CATALOG.get_or_init(Catalog::from_env)
}

/// Look up a message by key.
pub fn t(key: &str) -> String {
    catalog().get(key)
}

/// Look up a message and substitute `{$name}` placeholders.
pub fn t_with_args(key: &str, args: &[(&str, &dyn std::fmt::Display)]) -> String {
    catalog().get_with_args(key, args)
}

#[derive(Debug)]
pub struct Catalog {
    language: &'static str,
    messages: HashMap<String, String>,
}

impl Catalog {
    fn from_env() -> Self {
        Self::for_language(Self::detect_language())
    }

    pub fn for_language(language: &'static str) -> Self {
        let source = match language {
            "nn" => include_str!("../locales/nn.ftl"),
            _ => include_str!("../locales/en.ftl"),
        };
        Self {
            language,
            messages: parse_ftl(source),
        }
    }

    pub fn language(&self) -> &'static str {
        self.language
    }

    fn detect_language() -> &'static str {
        for var in ["LC_ALL", "LC_MESSAGES", "LANG"] {
            let Ok(value) = std::env::var(var) else {
                continue;
            };
            // "nn_NO.UTF-8" -> "nn"
            let code = value
                .split(['.', '_', '-'])
                .next()
                .unwrap_or_default()
                .to_lowercase();
            match code.as_str() {
                "nn" | "nno" => return "nn",
                "en" | "c" | "posix" => return "en",
                _ => continue,
            }
        }
        "en"
    }

    fn get(&self, key: &str) -> String {
        self.messages.get(key).cloned().unwrap_or_else(|| {
            tracing::warn!(key, "missing message key");
            format!("MISSING: {key}")
        })
    }

    fn get_with_args(&self, key: &str, args: &[(&str, &dyn std::fmt::Display)]) -> String {
        let mut message = self.get(key);
        for (name, value) in args {
            message = message.replace(&format!("{{${name}}}"), &value.to_string());
        }
        message
    }
}

// Only the `key = value` subset of Fluent is used by the bundled catalogs.
fn parse_ftl(source: &str) -> HashMap<String, String> {
    source
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(" = "))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

#[macro_export]
macro_rules! t {
    ($key:expr) => {
        $crate::i18n::t($key)
    };
}

#[macro_export]
macro_rules! t_args {
    ($key:expr, $($name:expr => $value:expr),* $(,)?) => {{
        let args: &[(&str, &dyn std::fmt::Display)] = &[
            $(
                ($name, &$value),
            )*
        ];
        $crate::i18n::t_with_args($key, args)
    }};
}
