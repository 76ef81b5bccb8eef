use std::{collections::HashMap, env, fs, io::ErrorKind, path::Path};

use crate::{finish::FinishFlags, Result};

/// Process-level defaults for finishers built by the bot.
///
/// Only behavior flags live here; the completors themselves are wired in code
/// (see [`crate::finish::Completors`]).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub panic_guard: bool,
    pub finish_session_transaction: bool,
    pub finish_chat_transaction: bool,
    pub log_filter: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            panic_guard: true,
            finish_session_transaction: false,
            finish_chat_transaction: false,
            log_filter: None,
        }
    }
}

impl Config {
    /// Load from the process environment, falling back to `.env` in the working
    /// directory for keys the environment does not set.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(".env"))
    }

    /// Like [`load`](Self::load) with an explicit dotenv file. A missing file is not an
    /// error; the process environment always wins over the file.
    pub fn load_from(dotenv: &Path) -> Result<Self> {
        let file = match fs::read_to_string(dotenv) {
            Ok(contents) => parse_dotenv(&contents),
            Err(err) if err.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self::from_lookup(|key| env::var(key).ok().or_else(|| file.get(key).cloned())))
    }

    /// Build from an arbitrary key lookup. Missing keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| lookup(key).map_or(default, |v| truthy(&v));

        Self {
            panic_guard: flag("FINISHER_PANIC_GUARD", defaults.panic_guard),
            finish_session_transaction: flag(
                "FINISHER_FINISH_SESSION_TRANSACTION",
                defaults.finish_session_transaction,
            ),
            finish_chat_transaction: flag(
                "FINISHER_FINISH_CHAT_TRANSACTION",
                defaults.finish_chat_transaction,
            ),
            log_filter: lookup("FINISHER_LOG_FILTER").filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn default_flags(&self) -> FinishFlags {
        let mut flags = FinishFlags::empty();
        flags.set(FinishFlags::PANIC_GUARD, self.panic_guard);
        flags.set(
            FinishFlags::FINISH_SESSION_TRANSACTION,
            self.finish_session_transaction,
        );
        flags.set(
            FinishFlags::FINISH_CHAT_TRANSACTION,
            self.finish_chat_transaction,
        );
        flags
    }
}

/// `KEY=value` pairs from a dotenv file. Blank lines, `#` comments and lines without
/// `=` are skipped; one pair of matching quotes around the value is removed.
fn parse_dotenv(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, value)| (key.trim().to_string(), unquote(value.trim()).to_string()))
        .collect()
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .iter()
        .find_map(|q| value.strip_prefix(*q)?.strip_suffix(*q))
        .unwrap_or(value)
}

fn truthy(s: &str) -> bool {
    ["1", "true", "yes", "on"]
        .iter()
        .any(|t| s.trim().eq_ignore_ascii_case(t))
}
