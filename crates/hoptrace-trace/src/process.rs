use crate::backend::Invocation;
use crate::error::TraceError;
use std::io::{self, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Handles of a running backend.
pub struct SpawnedBackend {
    pub stdout: Box<dyn Read + Send>,
    pub stderr: Option<Box<dyn Read + Send>>,
    pub stdin: Option<Box<dyn Write + Send>>,
    pub control: Arc<dyn ProcessControl>,
}

/// Lifecycle control over a running backend.
pub trait ProcessControl: Send + Sync {
    /// Stops the process. Calling it on an exited process is a no-op.
    fn terminate(&self) -> io::Result<()>;
    /// Waits for exit and returns the exit code, if the platform reports one.
    fn wait(&self) -> io::Result<Option<i32>>;
}

pub trait BackendLauncher: Send + Sync {
    fn launch(&self, invocation: &Invocation) -> Result<SpawnedBackend, TraceError>;
}

/// Launches the real executable with all three standard streams piped.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl BackendLauncher for SystemLauncher {
    fn launch(&self, invocation: &Invocation) -> Result<SpawnedBackend, TraceError> {
        let program = invocation.program.display().to_string();
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        hide_console_window(&mut command);

        let mut child = command
            .spawn()
            .map_err(|source| TraceError::BackendUnavailable {
                program: program.clone(),
                source,
            })?;
        debug!(%program, pid = child.id(), "spawned trace backend");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| missing_pipe(&program, "stdout"))?;
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();

        Ok(SpawnedBackend {
            stdout: Box::new(stdout),
            stderr: stderr.map(|pipe| Box::new(pipe) as Box<dyn Read + Send>),
            stdin: stdin.map(|pipe| Box::new(pipe) as Box<dyn Write + Send>),
            control: Arc::new(ChildControl {
                child: Mutex::new(child),
            }),
        })
    }
}

fn missing_pipe(program: &str, name: &str) -> TraceError {
    TraceError::BackendUnavailable {
        program: program.to_string(),
        source: io::Error::new(io::ErrorKind::BrokenPipe, format!("missing {name} pipe")),
    }
}

#[cfg(windows)]
pub(crate) fn hide_console_window(command: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    command.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
pub(crate) fn hide_console_window(_command: &mut Command) {}

struct ChildControl {
    child: Mutex<Child>,
}

const WAIT_POLL: Duration = Duration::from_millis(10);

impl ProcessControl for ChildControl {
    fn terminate(&self) -> io::Result<()> {
        let mut child = self.child.lock().unwrap_or_else(|err| err.into_inner());
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        match child.kill() {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(err),
        }
    }

    // Polls so a concurrent terminate() never waits on this lock.
    fn wait(&self) -> io::Result<Option<i32>> {
        loop {
            {
                let mut child = self.child.lock().unwrap_or_else(|err| err.into_inner());
                if let Some(status) = child.try_wait()? {
                    return Ok(status.code());
                }
            }
            thread::sleep(WAIT_POLL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Dialect;
    use std::path::PathBuf;

    #[test]
    fn missing_program_is_backend_unavailable() {
        let invocation = Invocation {
            program: PathBuf::from("hoptrace-definitely-missing-binary"),
            args: vec!["example.com".to_string()],
            dialect: Dialect::RichBackend,
            realtime: true,
        };
        match SystemLauncher.launch(&invocation) {
            Err(TraceError::BackendUnavailable { program, .. }) => {
                assert_eq!(program, "hoptrace-definitely-missing-binary");
            }
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("launch should fail"),
        }
    }
}
