use std::{
    collections::HashMap,
    env,
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use directories::BaseDirs;

#[derive(Debug, Clone)]
pub struct Config {
    inner: HashMap<String, String>,
    pub config_path: PathBuf,
}

impl Config {
    pub fn load() -> Self {
        Self::load_from(&default_config_path())
    }

    pub fn load_from(config_path: &Path) -> Self {
        let mut map = default_map();

        // Read .coderunrc if exists
        if config_path.exists() {
            if let Ok(file) = fs::File::open(config_path) {
                let reader = BufReader::new(file);
                for line in reader.lines().map_while(Result::ok) {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    if let Some((k, v)) = line.split_once('=') {
                        map.insert(k.trim().to_string(), v.trim().to_string());
                    }
                }
            }
        }

        // Overlay environment variables (take precedence)
        for (k, v) in env::vars() {
            if is_config_key(&k) {
                map.insert(k, v);
            }
        }

        Self { inner: map, config_path: config_path.to_path_buf() }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        // ENV first
        if let Ok(v) = env::var(key) {
            return Some(v);
        }
        self.inner.get(key).cloned()
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.trim().parse::<usize>().ok())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse::<u64>().ok())
    }

    /// Comma-separated values, blanks dropped.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn field_limit(&self) -> usize {
        self.get_usize("FIELD_LIMIT").unwrap_or(1024)
    }
}

/// The login name of whoever runs the CLI.
pub fn current_user() -> String {
    env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .ok()
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| "local".to_string())
}

fn is_config_key(k: &str) -> bool {
    // Accept known keys or CODERUN_* for forward-compat
    const KEYS: &[&str] = &[
        "TIMEOUT_MS",
        "MEMORY_LIMIT_MB",
        "STACK_SIZE_KB",
        "REQUEST_TIMEOUT",
        "DEV_USER_IDS",
        "PRETTIFY_MARKDOWN",
        "FIELD_LIMIT",
    ];

    KEYS.contains(&k) || k.starts_with("CODERUN_")
}

fn default_config_path() -> PathBuf {
    let base = BaseDirs::new()
        .map(|b| b.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("~/.config"));
    base.join("coderun").join(".coderunrc")
}

fn default_map() -> HashMap<String, String> {
    let mut m = HashMap::new();

    // Numbers
    m.insert("TIMEOUT_MS".into(), "750".into());
    m.insert("MEMORY_LIMIT_MB".into(), "64".into());
    m.insert("STACK_SIZE_KB".into(), "512".into());
    m.insert("REQUEST_TIMEOUT".into(), "60".into());
    m.insert("FIELD_LIMIT".into(), "1024".into());

    // Strings
    m.insert("DEV_USER_IDS".into(), current_user());

    // Bools as strings
    m.insert("PRETTIFY_MARKDOWN".into(), "true".into());

    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn rc_file_overrides_defaults() {
        let mut rc = tempfile::NamedTempFile::new().unwrap();
        writeln!(rc, "# limits").unwrap();
        writeln!(rc, "CODERUN_TEST_ONLY_KEY = 1500").unwrap();
        writeln!(rc, "CODERUN_TEST_ONLY_IDS=alice, bob ,,").unwrap();
        writeln!(rc, "not a pair").unwrap();

        let cfg = Config::load_from(rc.path());
        assert_eq!(cfg.get_u64("CODERUN_TEST_ONLY_KEY"), Some(1500));
        assert_eq!(cfg.get_list("CODERUN_TEST_ONLY_IDS"), vec!["alice", "bob"]);
        assert_eq!(cfg.config_path, rc.path());
    }

    #[test]
    fn missing_file_keeps_defaults() {
        let cfg = Config::load_from(Path::new("/definitely/not/here/.coderunrc"));
        assert!(cfg.get("STACK_SIZE_KB").is_some());
        assert!(cfg.get_usize("FIELD_LIMIT").is_some());
        assert!(!cfg.get_list("DEV_USER_IDS").is_empty());
    }
}
