use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Loads env files before clap parses, so that `PROM_MIGRATOR_*` values in
/// them feed the flags' `env` fallbacks.
pub fn bootstrap_from_args(args: &[OsString]) -> Result<()> {
    let explicit_env_file = extract_env_file_arg(args);
    load_env(explicit_env_file.as_ref())
}

pub fn load_env(explicit_env_file: Option<&PathBuf>) -> Result<()> {
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    for (key, value) in collect_env_values(&cwd, explicit_env_file)? {
        std::env::set_var(key, value);
    }
    Ok(())
}

/// Values to export, sorted by key. Variables already present in the process
/// environment are never overridden.
fn collect_env_values(
    cwd: &Path,
    explicit_env_file: Option<&PathBuf>,
) -> Result<Vec<(String, String)>> {
    let mut loaded = HashMap::new();

    for env_file in resolve_env_files(cwd, explicit_env_file) {
        if !env_file.exists() && explicit_env_file.is_none() {
            continue;
        }

        let parsed = dotenvy::from_path_iter(&env_file)
            .with_context(|| format!("failed to read env file {}", env_file.display()))?;
        for item in parsed {
            let (key, value) =
                item.with_context(|| format!("failed to parse env file {}", env_file.display()))?;
            if std::env::var_os(&key).is_some() {
                continue;
            }
            // Later files override earlier ones.
            loaded.insert(key, value);
        }
    }

    let mut envs: Vec<(String, String)> = loaded.into_iter().collect();
    envs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(envs)
}

fn extract_env_file_arg(args: &[OsString]) -> Option<PathBuf> {
    let mut explicit = None;
    let mut idx = 1usize;
    while idx < args.len() {
        let Some(arg) = args[idx].to_str() else {
            idx += 1;
            continue;
        };

        if arg == "--" {
            break;
        }

        if arg == "--env-file" {
            if let Some(next) = args.get(idx + 1) {
                explicit = Some(PathBuf::from(next));
            }
            idx += 2;
            continue;
        }

        if let Some(value) = arg.strip_prefix("--env-file=") {
            explicit = Some(PathBuf::from(value));
        }

        idx += 1;
    }
    explicit
}

fn resolve_env_files(cwd: &Path, explicit_env_file: Option<&PathBuf>) -> Vec<PathBuf> {
    if let Some(path) = explicit_env_file {
        let full_path = if path.is_absolute() {
            path.clone()
        } else {
            cwd.join(path)
        };
        return vec![full_path];
    }

    vec![cwd.join(".env"), cwd.join(".env.local")]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn env_file_flag_is_found_in_both_spellings() {
        assert_eq!(
            extract_env_file_arg(&argv(&["prom-migrator", "migrate", "--env-file", "a.env"])),
            Some(PathBuf::from("a.env"))
        );
        assert_eq!(
            extract_env_file_arg(&argv(&["prom-migrator", "--env-file=b.env", "status"])),
            Some(PathBuf::from("b.env"))
        );
        assert_eq!(
            extract_env_file_arg(&argv(&["prom-migrator", "--", "--env-file", "c.env"])),
            None
        );
    }

    #[test]
    fn local_file_overrides_base_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "PROM_MIGRATOR_TEST_ONLY_A=base\nPROM_MIGRATOR_TEST_ONLY_B=base\n",
        )
        .unwrap();
        std::fs::write(dir.path().join(".env.local"), "PROM_MIGRATOR_TEST_ONLY_B=local\n").unwrap();

        let values = collect_env_values(dir.path(), None).unwrap();
        assert_eq!(
            values,
            vec![
                ("PROM_MIGRATOR_TEST_ONLY_A".to_string(), "base".to_string()),
                ("PROM_MIGRATOR_TEST_ONLY_B".to_string(), "local".to_string()),
            ]
        );
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = PathBuf::from("nope.env");
        assert!(collect_env_values(dir.path(), Some(&missing)).is_err());
    }
}
