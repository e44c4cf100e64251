use crate::process::ProcessLauncher;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const WINDOWS_ENV_KEY: &str = r"HKLM\SYSTEM\CurrentControlSet\Control\Session Manager\Environment";

/// Operating-system family, selected once at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }

    /// Directory patterns (one `*` per component at most) where PostgreSQL
    /// client tools are commonly installed.
    pub fn candidate_patterns(self) -> &'static [&'static str] {
        match self {
            Platform::Windows => &[
                r"C:\Program Files\PostgreSQL\*\bin",
                r"C:\Program Files (x86)\PostgreSQL\*\bin",
                r"C:\postgresql\bin",
                r"C:\postgres\bin",
            ],
            Platform::MacOs => &[
                "/Library/PostgreSQL/*/bin",
                "/Applications/Postgres.app/Contents/Versions/*/bin",
                "/opt/homebrew/opt/libpq/bin",
                "/opt/homebrew/bin",
                "/usr/local/opt/libpq/bin",
                "/usr/local/bin",
            ],
            Platform::Linux => &[
                "/usr/lib/postgresql/*/bin",
                "/usr/pgsql-*/bin",
                "/opt/postgresql/bin",
                "/usr/local/pgsql/bin",
                "/usr/local/bin",
                "/usr/bin",
            ],
        }
    }

    pub fn executable_name(self, command: &str) -> String {
        match self {
            Platform::Windows => format!("{command}.exe"),
            Platform::MacOs | Platform::Linux => command.to_string(),
        }
    }

    pub fn install_hint(self) -> &'static str {
        match self {
            Platform::Windows => {
                "Open System Properties > Environment Variables, edit PATH and add the PostgreSQL bin directory \
                 (for example C:\\Program Files\\PostgreSQL\\16\\bin), then restart your applications."
            }
            Platform::MacOs | Platform::Linux => {
                "Add the PostgreSQL bin directory to your shell start-up file, for example:\n  \
                 export PATH=\"/usr/local/pgsql/bin:$PATH\"\nthen open a new terminal."
            }
        }
    }

    /// Best-effort persistent PATH update. `Ok` carries a note on what was
    /// done, `Err` a warning for the user.
    pub fn persist_path(self, dir: &Path, launcher: &dyn ProcessLauncher) -> Result<String, String> {
        match self {
            Platform::Windows => persist_windows(dir, launcher),
            Platform::MacOs | Platform::Linux => {
                let home = dirs::home_dir().ok_or_else(|| "cannot locate home directory".to_string())?;
                let shell = std::env::var("SHELL").unwrap_or_default();
                let file = self.startup_file(&shell, &home);
                match append_path_export(&file, dir, is_fish(&shell)) {
                    Ok(true) => Ok(format!("added to {}", file.display())),
                    Ok(false) => Ok(format!("already present in {}", file.display())),
                    Err(err) => Err(format!("could not update {}: {err}", file.display())),
                }
            }
        }
    }

    pub fn startup_file(self, shell: &str, home: &Path) -> PathBuf {
        let name = Path::new(shell)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("");
        match name {
            "zsh" => home.join(".zshrc"),
            "bash" if self == Platform::MacOs => home.join(".bash_profile"),
            "bash" => home.join(".bashrc"),
            "fish" => home.join(".config").join("fish").join("config.fish"),
            _ => home.join(".profile"),
        }
    }
}

fn is_fish(shell: &str) -> bool {
    shell.ends_with("fish")
}

/// Appends a PATH export for `dir` unless the file already mentions it.
/// Returns whether the file was changed.
pub fn append_path_export(file: &Path, dir: &Path, fish: bool) -> std::io::Result<bool> {
    let dir_str = dir.to_string_lossy();
    let existing = match fs::read_to_string(file) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err),
    };
    if existing.contains(dir_str.as_ref()) {
        return Ok(false);
    }

    let quoted = shlex::try_quote(&dir_str)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let line = if fish {
        format!("set -gx PATH {quoted} $PATH")
    } else {
        format!("export PATH={quoted}:\"$PATH\"")
    };

    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut handle = fs::OpenOptions::new().create(true).append(true).open(file)?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        writeln!(handle)?;
    }
    writeln!(handle, "\n# Added by pgdm: PostgreSQL client tools")?;
    writeln!(handle, "{line}")?;
    Ok(true)
}

fn persist_windows(dir: &Path, launcher: &dyn ProcessLauncher) -> Result<String, String> {
    let dir_str = dir.to_string_lossy().to_string();
    let query = launcher
        .run(
            "reg",
            &["query".into(), WINDOWS_ENV_KEY.into(), "/v".into(), "Path".into()],
            None,
            None,
        )
        .map_err(|e| format!("could not read system PATH: {e}"))?;
    if !query.success() {
        return Err(format!("could not read system PATH: {}", query.stderr.trim()));
    }
    let current = parse_reg_value(&query.stdout).unwrap_or_default();
    if current.split(';').any(|entry| entry.eq_ignore_ascii_case(&dir_str)) {
        return Ok("already present in system PATH".to_string());
    }

    let value = if current.is_empty() {
        dir_str
    } else {
        format!("{};{}", current.trim_end_matches(';'), dir_str)
    };
    let update = launcher
        .run(
            "reg",
            &[
                "add".into(),
                WINDOWS_ENV_KEY.into(),
                "/v".into(),
                "Path".into(),
                "/t".into(),
                "REG_EXPAND_SZ".into(),
                "/d".into(),
                value,
                "/f".into(),
            ],
            None,
            None,
        )
        .map_err(|e| format!("could not update system PATH: {e}"))?;
    if update.success() {
        Ok("system PATH updated; log off and on again to apply".to_string())
    } else {
        Err(format!(
            "Administrator privileges required to update system PATH: {}",
            update.stderr.trim()
        ))
    }
}

/// Extracts the data column of a `reg query` line such as
/// `    Path    REG_EXPAND_SZ    C:\a;C:\b`.
fn parse_reg_value(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once("REG_")?;
        let (_, value) = rest.split_once(char::is_whitespace)?;
        Some(value.trim().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::{FakeLauncher, Script};

    #[test]
    fn executable_names_follow_platform() {
        assert_eq!(Platform::Windows.executable_name("pg_dump"), "pg_dump.exe");
        assert_eq!(Platform::Linux.executable_name("pg_dump"), "pg_dump");
    }

    #[test]
    fn startup_file_follows_shell() {
        let home = Path::new("/home/u");
        assert_eq!(Platform::Linux.startup_file("/bin/zsh", home), home.join(".zshrc"));
        assert_eq!(Platform::Linux.startup_file("/bin/bash", home), home.join(".bashrc"));
        assert_eq!(Platform::MacOs.startup_file("/bin/bash", home), home.join(".bash_profile"));
        assert_eq!(
            Platform::Linux.startup_file("/usr/bin/fish", home),
            home.join(".config/fish/config.fish")
        );
        assert_eq!(Platform::Linux.startup_file("", home), home.join(".profile"));
    }

    #[test]
    fn export_line_is_appended_once() {
        let dir = tempfile::tempdir().unwrap();
        let rc = dir.path().join(".bashrc");
        fs::write(&rc, "alias ll='ls -l'").unwrap();
        let bin = Path::new("/opt/PostgreSQL 16/bin");

        assert!(append_path_export(&rc, bin, false).unwrap());
        assert!(!append_path_export(&rc, bin, false).unwrap());

        let content = fs::read_to_string(&rc).unwrap();
        assert!(content.starts_with("alias ll='ls -l'\n"));
        assert_eq!(content.matches("export PATH=").count(), 1);
        let quoted = shlex::try_quote("/opt/PostgreSQL 16/bin").unwrap();
        assert!(content.contains(&format!("export PATH={quoted}:\"$PATH\"")));
    }

    #[test]
    fn fish_uses_set_gx() {
        let dir = tempfile::tempdir().unwrap();
        let rc = dir.path().join("fish").join("config.fish");
        assert!(append_path_export(&rc, Path::new("/usr/lib/postgresql/16/bin"), true).unwrap());
        let content = fs::read_to_string(&rc).unwrap();
        let quoted = shlex::try_quote("/usr/lib/postgresql/16/bin").unwrap();
        assert!(content.contains(&format!("set -gx PATH {quoted} $PATH")));
    }

    #[test]
    fn parses_reg_query_output() {
        let out = "\r\nHKEY_LOCAL_MACHINE\\SYSTEM\\...\\Environment\r\n    Path    REG_EXPAND_SZ    C:\\Windows;C:\\Tools\r\n";
        assert_eq!(parse_reg_value(out).as_deref(), Some("C:\\Windows;C:\\Tools"));
    }

    #[test]
    fn windows_persist_reports_unreadable_registry() {
        let launcher = FakeLauncher::default().with(
            "reg",
            Script::Exit {
                code: 1,
                stdout: "    Path    REG_EXPAND_SZ    C:\\Windows\r\n".to_string(),
                stderr: "ERROR: Access is denied.".to_string(),
            },
        );
        let err = persist_windows(Path::new(r"C:\Program Files\PostgreSQL\16\bin"), &launcher).unwrap_err();
        assert!(err.contains("could not read system PATH"));
    }

    #[test]
    fn windows_persist_skips_known_entry() {
        let launcher = FakeLauncher::default().with(
            "reg",
            Script::ok("    Path    REG_EXPAND_SZ    C:\\Windows;C:\\PG\\bin\r\n"),
        );
        let msg = persist_windows(Path::new("C:\\PG\\bin"), &launcher).unwrap();
        assert!(msg.contains("already present"));
        assert_eq!(launcher.calls().len(), 1);
    }
}
