use super::{Config, ConfigLayer};

pub fn merge_layers(layers: impl IntoIterator<Item = ConfigLayer>) -> Config {
    let mut config = Config::default();
    for layer in layers {
        layer.apply_to(&mut config);
    }
    config
}

pub fn apply_env_overrides(config: &mut Config) {
    apply_env_overrides_from(config, |key| std::env::var(key).ok());
}

/// Applies `BM_*` overrides read through `lookup`. Unparseable values are
/// logged and ignored.
pub fn apply_env_overrides_from(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let read = |key: &str| {
        lookup(key)
            .map(|raw| raw.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    if let Some(addr) = read("BM_LISTEN_ADDR") {
        config.net.listen_addr = addr;
    }

    if let Some(raw) = read("BM_RESYNC_SAFETY_THRESHOLD_MINS") {
        match raw.parse::<u64>() {
            Ok(value) => config.resync.safety_threshold_mins = value,
            Err(err) => {
                tracing::warn!("invalid BM_RESYNC_SAFETY_THRESHOLD_MINS, ignoring: {err}");
            }
        }
    }

    if let Some(raw) = read("BM_NUM_GATHER_SLAVES") {
        match raw.parse::<usize>() {
            Ok(value) if value > 0 => config.resync.num_gather_slaves = value,
            Ok(_) => tracing::warn!("BM_NUM_GATHER_SLAVES must be positive, ignoring"),
            Err(err) => tracing::warn!("invalid BM_NUM_GATHER_SLAVES, ignoring: {err}"),
        }
    }

    if let Some(raw) = read("BM_STORE_CLIENT_XATTRS") {
        match parse_bool(&raw) {
            Some(value) => config.mirror.store_client_xattrs = value,
            None => tracing::warn!(value = %raw, "invalid BM_STORE_CLIENT_XATTRS, ignoring"),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: BTreeMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn later_layers_win() {
        let mut first = ConfigLayer::default();
        first.resync.walk_depth = Some(3);
        first.mirror.buddy_mirror_subdir = Some("first".into());

        let mut second = ConfigLayer::default();
        second.mirror.buddy_mirror_subdir = Some("second".into());

        let config = merge_layers([first, second]);
        assert_eq!(config.resync.walk_depth, 3);
        assert_eq!(config.mirror.buddy_mirror_subdir, "second");
        assert_eq!(config.resync.num_sync_slaves, 12);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        apply_env_overrides_from(
            &mut config,
            lookup(&[
                ("BM_LISTEN_ADDR", " 127.0.0.1:9999 "),
                ("BM_RESYNC_SAFETY_THRESHOLD_MINS", "0"),
                ("BM_NUM_GATHER_SLAVES", "2"),
                ("BM_STORE_CLIENT_XATTRS", "off"),
            ]),
        );
        assert_eq!(config.net.listen_addr, "127.0.0.1:9999");
        assert_eq!(config.resync.safety_threshold_mins, 0);
        assert_eq!(config.resync.num_gather_slaves, 2);
        assert!(!config.mirror.store_client_xattrs);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut config = Config::default();
        apply_env_overrides_from(
            &mut config,
            lookup(&[
                ("BM_LISTEN_ADDR", "   "),
                ("BM_RESYNC_SAFETY_THRESHOLD_MINS", "ten"),
                ("BM_NUM_GATHER_SLAVES", "0"),
                ("BM_STORE_CLIENT_XATTRS", "maybe"),
            ]),
        );
        let defaults = Config::default();
        assert_eq!(config.net.listen_addr, defaults.net.listen_addr);
        assert_eq!(config.resync.safety_threshold_mins, 10);
        assert_eq!(config.resync.num_gather_slaves, 6);
        assert!(config.mirror.store_client_xattrs);
    }
}
