use crate::error::LaunchError;
use std::io::{self, BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use wait_timeout::ChildExt;

/// Captured result of a finished process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Receives stderr lines while the process runs.
pub type LineSink<'a> = &'a (dyn Fn(&str) + Sync);

/// Seam for running external tools. The argument vector is passed as-is,
/// never through a shell.
pub trait ProcessLauncher: Send + Sync {
    fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Option<Duration>,
        on_stderr: Option<LineSink<'_>>,
    ) -> Result<ProcessOutput, LaunchError>;
}

pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Option<Duration>,
        on_stderr: Option<LineSink<'_>>,
    ) -> Result<ProcessOutput, LaunchError> {
        let io_err = |source: io::Error| LaunchError::Io {
            program: program.to_string(),
            source,
        };

        tracing::debug!(program, ?args, "spawning process");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| {
                if source.kind() == io::ErrorKind::NotFound {
                    LaunchError::NotFound {
                        program: program.to_string(),
                    }
                } else {
                    io_err(source)
                }
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io_err(io::Error::other("stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io_err(io::Error::other("stderr not captured")))?;

        thread::scope(|scope| {
            let stdout_handle = scope.spawn(move || -> io::Result<Vec<u8>> {
                let mut reader = stdout;
                let mut collected = Vec::new();
                reader.read_to_end(&mut collected)?;
                Ok(collected)
            });

            let stderr_handle = scope.spawn(move || -> io::Result<Vec<u8>> {
                let mut reader = BufReader::new(stderr);
                let mut collected = Vec::new();
                let mut line = Vec::new();
                loop {
                    line.clear();
                    let bytes_read = reader.read_until(b'\n', &mut line)?;
                    if bytes_read == 0 {
                        break;
                    }
                    collected.extend_from_slice(&line);
                    if let Some(sink) = on_stderr {
                        sink(String::from_utf8_lossy(&line).trim_end());
                    }
                }
                Ok(collected)
            });

            let status = match timeout {
                Some(limit) => match child.wait_timeout(limit).map_err(io_err)? {
                    Some(status) => status,
                    None => {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(LaunchError::TimedOut {
                            program: program.to_string(),
                            timeout: limit,
                        });
                    }
                },
                None => child.wait().map_err(io_err)?,
            };

            let stdout_bytes = stdout_handle
                .join()
                .map_err(|_| io_err(io::Error::other("stdout reader panicked")))?
                .map_err(io_err)?;
            let stderr_bytes = stderr_handle
                .join()
                .map_err(|_| io_err(io::Error::other("stderr reader panicked")))?
                .map_err(io_err)?;

            Ok(ProcessOutput {
                exit_code: status.code(),
                stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
                stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
            })
        })
    }
}
