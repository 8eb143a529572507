// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

use crate::schema::parse_chat_ids;
use crate::Config;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/televibe/config.yaml"));
    paths.push(PathBuf::from("/etc/televibe/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/televibe/config.yaml"));
        paths.push(home.join(".config/televibe/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".televibe/config.yaml"));
    paths.push(PathBuf::from(".televibe/config.yml"));
    paths.push(PathBuf::from("televibe.yaml"));
    paths.push(PathBuf::from("televibe.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files, then applying
/// environment overrides for the secrets.  The `extra` argument may provide
/// an explicit path (e.g. `--config` CLI flag), merged at highest priority.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let mut config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty())
    {
        Config::default()
    } else {
        serde_yaml::from_value(merged).context("invalid configuration")?
    };

    apply_env_overrides(&mut config)?;

    if config.telegram_allowed_chat_ids.is_empty() {
        warn!("telegram_allowed_chat_ids is empty; any chat may drive the orchestrator");
    }

    Ok(config)
}

/// Secrets are taken from the environment when present so tokens never need
/// to live in version-controlled YAML.
fn apply_env_overrides(config: &mut Config) -> anyhow::Result<()> {
    if let Ok(token) = std::env::var("TELEVIBE_BOT_TOKEN") {
        if !token.is_empty() {
            config.telegram_bot_token = token;
        }
    }
    if let Ok(ids) = std::env::var("TELEVIBE_ALLOWED_CHAT_IDS") {
        config.telegram_allowed_chat_ids =
            parse_chat_ids(&ids).context("parsing TELEVIBE_ALLOWED_CHAT_IDS")?;
    }
    Ok(())
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
