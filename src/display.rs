use crate::connection::{redact, truncate_with_ellipsis};
use crate::platform::Platform;
use crate::probe::{EnvironmentStatus, REQUIRED_COMMANDS};
use crate::runner::{Completion, ConnectionTest, Outcome};
use crate::storage::{file_size, modified_time, OperationKind, OperationRecord};
use colored::*;
use std::path::Path;
use unicode_width::UnicodeWidthStr;

const DOWNLOAD_URL: &str = "https://www.postgresql.org/download/";

pub fn render_status(status: &EnvironmentStatus, platform: Platform) -> String {
    let mut out = String::new();
    if status.installed {
        out.push_str(&format!(
            "{}\n",
            "PostgreSQL is properly installed and configured!".green().bold()
        ));
        for command in REQUIRED_COMMANDS {
            let info = status
                .commands_available
                .get(command)
                .map(|tool| tool.info.as_str())
                .unwrap_or_default();
            out.push_str(&format!("  {} {}: {}\n", "✓".green(), command, info));
        }
        return out;
    }

    out.push_str(&format!("{}\n", "PostgreSQL setup issues detected:".red().bold()));
    for command in &status.missing_commands {
        let info = status
            .commands_available
            .get(command)
            .map(|tool| tool.info.trim())
            .unwrap_or_default();
        out.push_str(&format!("  {} {}: {}\n", "✗".red(), command, info));
    }

    if status.path_issues {
        out.push_str(&format!("\n{}\n", "PostgreSQL installation found at:".yellow()));
        for path in &status.suggested_paths {
            out.push_str(&format!("  {}\n", path.display()));
        }
        out.push_str(&format!(
            "\n{}\n",
            "Run `pgdm check --fix` to add the first location to PATH.".dimmed()
        ));
    } else {
        out.push_str(&format!(
            "\nPostgreSQL client tools need to be installed: {}\n",
            DOWNLOAD_URL.cyan()
        ));
        out.push_str("Make sure to include the command line tools during installation.\n");
    }
    out.push_str(&format!("\n{}\n", platform.install_hint().dimmed()));
    out
}

/// Shows the newest `limit` records of `records` (stored oldest first).
pub fn render_history(records: &[OperationRecord], limit: usize) -> String {
    if records.is_empty() {
        return "No operations recorded yet.\n\nPerform backup or restore operations to see them here.\n"
            .to_string();
    }

    let title = "DATABASE OPERATIONS HISTORY";
    let mut out = format!(
        "{}\n{}\n\n",
        title.bold(),
        "=".repeat(UnicodeWidthStr::width(title).max(50))
    );
    for (i, entry) in records.iter().rev().take(limit).enumerate() {
        let operation = match entry.operation {
            OperationKind::Backup => entry.operation.to_string().cyan(),
            OperationKind::Restore => entry.operation.to_string().magenta(),
        };
        let status = if entry.status.starts_with("Success") {
            entry.status.green()
        } else {
            entry.status.red()
        };
        let file = Path::new(&entry.file_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "N/A".to_string());
        let database = if entry.database.is_empty() { "N/A" } else { entry.database.as_str() };

        out.push_str(&format!("#{:02} {} - {}\n", i + 1, operation, entry.timestamp));
        out.push_str(&format!("    Status: {}\n", status));
        out.push_str(&format!("    File: {}\n", file));
        out.push_str(&format!("    Database: {}\n", database));
        out.push_str(&format!("{}\n\n", "-".repeat(40).dimmed()));
    }
    out
}

/// Full diagnostic text; nothing is truncated here.
pub fn render_error_report(title: &str, detail: &str) -> String {
    format!("{}\n\n{}\n", title.red().bold(), detail.trim_end())
}

pub fn render_completion(done: &Completion) -> String {
    let label = match done.kind {
        OperationKind::Backup => "Backup",
        OperationKind::Restore => "Restore",
    };
    match &done.outcome {
        Outcome::Success => {
            let mut out = format!("{}\n", format!("{label} completed successfully!").green().bold());
            match done.kind {
                OperationKind::Backup => {
                    out.push_str(&format!("Saved to: {}\n", done.file_path.display()));
                    out.push_str(&format!("File size: {}\n", file_size(&done.file_path)));
                }
                OperationKind::Restore => {
                    out.push_str(&format!("Restored from: {}\n", done.file_path.display()));
                }
            }
            out
        }
        Outcome::ToolReportedFailure { stderr } => render_error_report(
            &format!("{label} operation failed!"),
            &format!("Error details:\n{stderr}"),
        ),
        Outcome::ToolUnavailable { program } => render_error_report(
            &format!("{program} not found"),
            "Please ensure PostgreSQL is installed and added to PATH (see `pgdm check`).",
        ),
        Outcome::UnexpectedError { message } => {
            render_error_report(&format!("{label} failed!"), &format!("Unexpected error: {message}"))
        }
    }
}

pub fn render_connection_test(result: &ConnectionTest) -> String {
    match result {
        ConnectionTest::Passed => format!("{}\n", "Connection successful!".green().bold()),
        ConnectionTest::Failed { stderr } => {
            render_error_report("Connection failed!", &format!("Error details:\n{stderr}"))
        }
        ConnectionTest::TimedOut => render_error_report(
            "Connection test timed out!",
            "The connection attempt took too long.",
        ),
        ConnectionTest::ToolMissing => render_error_report(
            "psql not found!",
            "Please ensure PostgreSQL client tools are installed and added to your PATH.",
        ),
        ConnectionTest::Error { message } => {
            render_error_report("Connection test error!", &format!("Error details:\n{message}"))
        }
    }
}

pub fn render_overwrite_prompt(path: &Path) -> String {
    let location = path.parent().map(|p| p.display().to_string()).unwrap_or_default();
    format!(
        "{}\n  Location: {}\n  Current file size: {}\n  Last modified: {}\n{}",
        format!(
            "The file '{}' already exists.",
            path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        )
        .yellow()
        .bold(),
        location,
        file_size(path),
        modified_time(path),
        "Overwrite it? The existing backup will be lost. [yes/no]: ".yellow()
    )
}

pub fn render_restore_prompt(descriptor: &str, file: &Path) -> String {
    format!(
        "{}\n  Target database: {}\n  File: {}\n  Size: {}\n  Modified: {}\n{}\n{}",
        "Confirm restore operation".yellow().bold(),
        truncate_with_ellipsis(&redact(descriptor), 80),
        file.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
        file_size(file),
        modified_time(file),
        "This may overwrite existing data in the target database and cannot be undone.".red(),
        "Proceed with the restore? [yes/no]: ".yellow()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ToolAvailability;
    use std::path::PathBuf;

    fn plain() {
        colored::control::set_override(false);
    }

    fn record(operation: OperationKind, status: &str, file_path: &str) -> OperationRecord {
        OperationRecord {
            timestamp: "2024-05-01 10:00:00".to_string(),
            operation,
            status: status.to_string(),
            file_path: file_path.to_string(),
            database: "postgresql://u:***@h/db".to_string(),
        }
    }

    #[test]
    fn history_lists_entries_in_given_order() {
        plain();
        let text = render_history(
            &[
                record(OperationKind::Backup, "Failed: permission denied", ""),
                record(OperationKind::Restore, "Success: b.dump", "/backups/b.dump"),
            ],
            50,
        );
        let first = text.find("#01 RESTORE").unwrap();
        let second = text.find("#02 BACKUP").unwrap();
        assert!(first < second);
        assert!(text.contains("    File: b.dump\n"));
        assert!(text.contains("    File: N/A\n"));
    }

    #[test]
    fn only_newest_entries_are_shown() {
        plain();
        let records: Vec<_> = (0..60)
            .map(|i| record(OperationKind::Backup, &format!("Success: {i}.dump"), ""))
            .collect();
        let text = render_history(&records, 50);
        assert!(text.contains("#01 BACKUP"));
        assert!(text.contains("#50 BACKUP"));
        assert!(!text.contains("#51"));
        assert!(text.find("Success: 59.dump").unwrap() < text.find("Success: 10.dump").unwrap());
        assert!(!text.contains("Success: 9.dump"));
    }

    #[test]
    fn empty_history_has_placeholder() {
        assert!(render_history(&[], 50).starts_with("No operations recorded yet."));
    }

    #[test]
    fn missing_tools_show_suggestions() {
        plain();
        let mut status = EnvironmentStatus::default();
        status.commands_available.insert(
            "psql".to_string(),
            ToolAvailability {
                available: false,
                info: "psql not found".to_string(),
                failure: None,
            },
        );
        status.missing_commands.push("psql".to_string());
        status.path_issues = true;
        status.suggested_paths.push(PathBuf::from("/usr/lib/postgresql/16/bin"));

        let text = render_status(&status, Platform::Linux);
        assert!(text.contains("psql: psql not found"));
        assert!(text.contains("/usr/lib/postgresql/16/bin"));
        assert!(text.contains("check --fix"));
    }

    #[test]
    fn error_report_keeps_full_detail() {
        plain();
        let detail = "x".repeat(500);
        assert!(render_error_report("Backup failed", &detail).contains(&detail));
    }
}
