use crate::error::{LaunchError, PathFixError};
use crate::platform::Platform;
use crate::process::ProcessLauncher;
use serde::Serialize;
use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use walkdir::WalkDir;

pub const REQUIRED_COMMANDS: [&str; 3] = ["pg_dump", "pg_restore", "psql"];

/// Command whose executable marks a directory as a PostgreSQL install.
const PRIMARY_COMMAND: &str = "pg_dump";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandFailure {
    NotFound,
    TimedOut,
    NonZeroExit,
    OtherError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolAvailability {
    pub available: bool,
    pub info: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<CommandFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvironmentStatus {
    pub installed: bool,
    pub commands_available: BTreeMap<String, ToolAvailability>,
    pub missing_commands: Vec<String>,
    pub path_issues: bool,
    pub suggested_paths: Vec<PathBuf>,
}

impl EnvironmentStatus {
    pub fn is_available(&self, command: &str) -> bool {
        self.commands_available
            .get(command)
            .is_some_and(|tool| tool.available)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathFix {
    pub message: String,
    /// Set when the in-process update succeeded but persisting it did not.
    pub warning: Option<String>,
}

pub struct EnvironmentProbe {
    launcher: Arc<dyn ProcessLauncher>,
    platform: Platform,
    version_timeout: Duration,
    candidates: Vec<String>,
}

impl EnvironmentProbe {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, platform: Platform, version_timeout: Duration) -> Self {
        let candidates = platform
            .candidate_patterns()
            .iter()
            .map(|p| p.to_string())
            .collect();
        Self {
            launcher,
            platform,
            version_timeout,
            candidates,
        }
    }

    /// Searches `patterns` before the platform defaults.
    pub fn with_extra_candidates(mut self, patterns: &[String]) -> Self {
        let mut candidates = patterns.to_vec();
        candidates.append(&mut self.candidates);
        self.candidates = candidates;
        self
    }

    #[cfg(test)]
    pub fn with_candidates(mut self, patterns: Vec<String>) -> Self {
        self.candidates = patterns;
        self
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn probe(&self) -> EnvironmentStatus {
        let mut status = EnvironmentStatus::default();

        for command in REQUIRED_COMMANDS {
            let tool = self.check_command(command);
            if !tool.available {
                tracing::info!(command, info = %tool.info, "required command unavailable");
                status.missing_commands.push(command.to_string());
            }
            status.commands_available.insert(command.to_string(), tool);
        }

        if status.missing_commands.is_empty() {
            status.installed = true;
        } else {
            status.suggested_paths = self.find_installations();
            status.path_issues = !status.suggested_paths.is_empty();
        }
        status
    }

    fn check_command(&self, command: &str) -> ToolAvailability {
        let result = self.launcher.run(
            command,
            &["--version".to_string()],
            Some(self.version_timeout),
            None,
        );
        match result {
            Ok(output) if output.success() => ToolAvailability {
                available: true,
                info: output.stdout.trim().to_string(),
                failure: None,
            },
            Ok(output) => ToolAvailability {
                available: false,
                info: output.stderr,
                failure: Some(CommandFailure::NonZeroExit),
            },
            Err(LaunchError::NotFound { .. }) => ToolAvailability {
                available: false,
                info: format!("{command} not found"),
                failure: Some(CommandFailure::NotFound),
            },
            Err(LaunchError::TimedOut { .. }) => ToolAvailability {
                available: false,
                info: format!("{command} command timed out"),
                failure: Some(CommandFailure::TimedOut),
            },
            Err(err @ LaunchError::Io { .. }) => ToolAvailability {
                available: false,
                info: err.to_string(),
                failure: Some(CommandFailure::OtherError),
            },
        }
    }

    /// Candidate directories that contain the primary executable, in
    /// discovery order.
    pub fn find_installations(&self) -> Vec<PathBuf> {
        let executable = self.platform.executable_name(PRIMARY_COMMAND);
        let mut found = Vec::new();
        for pattern in &self.candidates {
            for dir in expand_pattern(Path::new(pattern)) {
                if dir.join(&executable).is_file() && !found.contains(&dir) {
                    found.push(dir);
                }
            }
        }
        found
    }

    /// Adds `dir` to this process's PATH and tries to make it permanent.
    pub fn apply_path_fix(&self, dir: &Path) -> Result<PathFix, PathFixError> {
        if !dir.is_dir() {
            return Err(PathFixError::MissingDirectory(dir.to_path_buf()));
        }

        let current = env::var_os("PATH").unwrap_or_default();
        if env::split_paths(&current).any(|entry| entry == dir) {
            return Ok(PathFix {
                message: format!("{} is already in PATH", dir.display()),
                warning: None,
            });
        }

        let updated: OsString = env::join_paths(
            std::iter::once(dir.to_path_buf()).chain(env::split_paths(&current)),
        )
        .map_err(|source| PathFixError::Join {
            path: dir.to_path_buf(),
            source,
        })?;
        env::set_var("PATH", &updated);
        tracing::info!(dir = %dir.display(), "added directory to PATH for this session");

        let message = format!("{} added to PATH for this session", dir.display());
        match self.platform.persist_path(dir, self.launcher.as_ref()) {
            Ok(note) => Ok(PathFix {
                message: format!("{message}; {note}"),
                warning: None,
            }),
            Err(warning) => {
                tracing::warn!(%warning, "persistent PATH update failed");
                Ok(PathFix {
                    message,
                    warning: Some(warning),
                })
            }
        }
    }
}

/// Expands `*` wildcards in path components, newest-looking entries first.
fn expand_pattern(pattern: &Path) -> Vec<PathBuf> {
    let mut bases = vec![PathBuf::new()];
    for component in pattern.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_string_lossy();
                if let Some((prefix, suffix)) = part.split_once('*') {
                    bases = bases
                        .iter()
                        .flat_map(|base| matching_children(base, prefix, suffix))
                        .collect();
                } else {
                    for base in &mut bases {
                        base.push(&*part);
                    }
                }
            }
            other => {
                for base in &mut bases {
                    base.push(other.as_os_str());
                }
            }
        }
        if bases.is_empty() {
            break;
        }
    }
    bases.retain(|dir| dir.is_dir());
    bases
}

fn matching_children(base: &Path, prefix: &str, suffix: &str) -> Vec<PathBuf> {
    WalkDir::new(base)
        .min_depth(1)
        .max_depth(1)
        .sort_by(|a, b| b.file_name().cmp(a.file_name()))
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_dir())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy();
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        })
        .map(|entry| entry.into_path())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::{FakeLauncher, Script};
    use std::fs;
    use std::sync::Mutex;

    // Tests that rewrite PATH must not interleave.
    static PATH_LOCK: Mutex<()> = Mutex::new(());

    fn probe_with(launcher: FakeLauncher) -> EnvironmentProbe {
        EnvironmentProbe::new(Arc::new(launcher), Platform::Linux, Duration::from_secs(10))
            .with_candidates(Vec::new())
    }

    fn fake_install(root: &Path, version: &str) -> PathBuf {
        let bin = root.join("PostgreSQL").join(version).join("bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("pg_dump"), "").unwrap();
        bin
    }

    #[test]
    fn all_commands_present_means_installed() {
        let status = probe_with(FakeLauncher::all_ok()).probe();
        assert!(status.installed);
        assert!(status.missing_commands.is_empty());
        assert!(!status.path_issues);
        assert_eq!(status.commands_available["psql"].info, "psql (PostgreSQL) 16.2");
    }

    #[test]
    fn version_probe_uses_flag_and_timeout() {
        let launcher = Arc::new(FakeLauncher::all_ok());
        EnvironmentProbe::new(launcher.clone(), Platform::Linux, Duration::from_secs(10))
            .with_candidates(Vec::new())
            .probe();
        let calls = launcher.calls();
        assert_eq!(calls.len(), 3);
        for (call, expected) in calls.iter().zip(REQUIRED_COMMANDS) {
            assert_eq!(call.0, expected);
            assert_eq!(call.1, vec!["--version".to_string()]);
            assert_eq!(call.2, Some(Duration::from_secs(10)));
        }
    }

    #[test]
    fn failures_are_classified() {
        let launcher = FakeLauncher::default()
            .with("pg_dump", Script::TimedOut)
            .with("pg_restore", Script::fail(2, "broken install"))
            .with("psql", Script::Io("permission denied".into()));
        let status = probe_with(launcher).probe();

        assert!(!status.installed);
        assert_eq!(status.missing_commands, REQUIRED_COMMANDS.to_vec());
        let tools = &status.commands_available;
        assert_eq!(tools["pg_dump"].failure, Some(CommandFailure::TimedOut));
        assert_eq!(tools["pg_dump"].info, "pg_dump command timed out");
        assert_eq!(tools["pg_restore"].failure, Some(CommandFailure::NonZeroExit));
        assert_eq!(tools["pg_restore"].info, "broken install");
        assert_eq!(tools["psql"].failure, Some(CommandFailure::OtherError));
    }

    #[test]
    fn missing_command_suggests_installed_directory() {
        let root = tempfile::tempdir().unwrap();
        let bin = fake_install(root.path(), "16");
        let pattern = root.path().join("PostgreSQL").join("*").join("bin");

        let launcher = FakeLauncher::all_ok().with("psql", Script::NotFound);
        let status = probe_with(launcher)
            .with_candidates(vec![pattern.to_string_lossy().into_owned()])
            .probe();

        assert!(!status.installed);
        assert_eq!(status.missing_commands, vec!["psql".to_string()]);
        assert_eq!(status.commands_available["psql"].info, "psql not found");
        assert!(status.path_issues);
        assert_eq!(status.suggested_paths, vec![bin]);
    }

    #[test]
    fn directories_without_pg_dump_are_ignored() {
        let root = tempfile::tempdir().unwrap();
        let keep = fake_install(root.path(), "15");
        fs::create_dir_all(root.path().join("PostgreSQL").join("14").join("bin")).unwrap();
        let pattern = root.path().join("PostgreSQL").join("*").join("bin");

        let found = probe_with(FakeLauncher::default())
            .with_candidates(vec![pattern.to_string_lossy().into_owned()])
            .find_installations();
        assert_eq!(found, vec![keep]);
    }

    #[test]
    fn wildcard_matches_prefix_and_suffix() {
        let root = tempfile::tempdir().unwrap();
        for name in ["pgsql-15", "pgsql-16", "other"] {
            fs::create_dir_all(root.path().join(name).join("bin")).unwrap();
        }
        let expanded = expand_pattern(&root.path().join("pgsql-*").join("bin"));
        assert_eq!(
            expanded,
            vec![root.path().join("pgsql-16/bin"), root.path().join("pgsql-15/bin")]
        );
    }

    #[test]
    fn path_fix_is_idempotent_for_known_entries() {
        let _env = PATH_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let reg = Script::ok("    Path    REG_EXPAND_SZ    C:\\Windows\r\n");
        let launcher = Arc::new(FakeLauncher::default().with("reg", reg));
        let probe = EnvironmentProbe::new(launcher.clone(), Platform::Windows, Duration::from_secs(10));

        let first = probe.apply_path_fix(dir.path()).unwrap();
        assert!(first.warning.is_none());
        let path = env::var_os("PATH").unwrap();
        assert!(env::split_paths(&path).any(|p| p == dir.path()));

        let calls_after_first = launcher.calls().len();
        let second = probe.apply_path_fix(dir.path()).unwrap();
        assert!(second.message.contains("already in PATH"));
        assert_eq!(launcher.calls().len(), calls_after_first);
    }

    #[test]
    fn failed_persist_keeps_session_update() {
        let _env = PATH_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::default().with("reg", Script::fail(1, "Access is denied.")));
        let probe = EnvironmentProbe::new(launcher, Platform::Windows, Duration::from_secs(10));

        let fix = probe.apply_path_fix(dir.path()).unwrap();
        assert!(fix.warning.is_some());
        let path = env::var_os("PATH").unwrap();
        assert!(env::split_paths(&path).any(|p| p == dir.path()));
    }

    #[test]
    fn path_fix_rejects_missing_directory() {
        let probe = probe_with(FakeLauncher::default());
        let err = probe.apply_path_fix(Path::new("/no/such/pg/bin")).unwrap_err();
        assert!(matches!(err, PathFixError::MissingDirectory(_)));
    }
}
