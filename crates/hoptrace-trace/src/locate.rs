//! Finding backend executables and asking them for their version.
//!
//! A bundled copy wins over a system-wide one: each search root is checked
//! for `tools/<program>` and then `<program>`, and only then is `PATH`
//! consulted.

use crate::backend::BackendDescriptor;
use crate::error::TraceError;
use crate::process::hide_console_window;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

const TOOLS_DIR: &str = "tools";

#[derive(Debug, Clone)]
pub struct BackendLocator {
    roots: Vec<PathBuf>,
    /// `None` searches the process `PATH`.
    search_path: Option<OsString>,
}

impl Default for BackendLocator {
    /// Searches next to the running executable, then the working directory.
    fn default() -> Self {
        let mut roots = Vec::new();
        if let Some(dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            roots.push(dir);
        }
        if let Ok(cwd) = std::env::current_dir() {
            if !roots.contains(&cwd) {
                roots.push(cwd);
            }
        }
        Self {
            roots,
            search_path: None,
        }
    }
}

impl BackendLocator {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            search_path: None,
        }
    }

    /// Replaces the `PATH` value used for the last lookup step.
    pub fn with_search_path(mut self, search_path: impl Into<OsString>) -> Self {
        self.search_path = Some(search_path.into());
        self
    }

    pub fn locate(&self, descriptor: &BackendDescriptor) -> Option<PathBuf> {
        let name = descriptor.executable_name();
        for root in &self.roots {
            for candidate in [root.join(TOOLS_DIR).join(&name), root.join(&name)] {
                if candidate.is_file() {
                    debug!(backend = descriptor.name, path = %candidate.display(), "found bundled backend");
                    return Some(candidate);
                }
            }
        }

        let found = match &self.search_path {
            Some(search_path) => {
                let cwd = self.roots.first().cloned().unwrap_or_default();
                which::which_in(descriptor.program, Some(search_path), cwd)
            }
            None => which::which(descriptor.program),
        };
        match found {
            Ok(path) => {
                debug!(backend = descriptor.name, path = %path.display(), "found backend on PATH");
                Some(path)
            }
            Err(err) => {
                debug!(backend = descriptor.name, error = %err, "backend not found");
                None
            }
        }
    }

    pub fn is_available(&self, descriptor: &BackendDescriptor) -> bool {
        self.locate(descriptor).is_some()
    }
}

/// Looks the backend up in the default places.
pub fn locate_backend(descriptor: &BackendDescriptor) -> Option<PathBuf> {
    BackendLocator::default().locate(descriptor)
}

pub fn is_available(descriptor: &BackendDescriptor) -> bool {
    locate_backend(descriptor).is_some()
}

/// First non-empty line the backend prints for its version flag.
pub fn backend_version(
    descriptor: &BackendDescriptor,
    program: &Path,
) -> Result<String, TraceError> {
    let flag = descriptor.version_flag.ok_or_else(|| {
        TraceError::InvalidRequest(format!("{} does not report a version", descriptor.name))
    })?;
    let unavailable = |source: io::Error| TraceError::BackendUnavailable {
        program: program.display().to_string(),
        source,
    };

    let mut command = Command::new(program);
    command
        .arg(flag)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    hide_console_window(&mut command);
    let output = command.output().map_err(unavailable)?;

    let stdout = descriptor.decode_output(&output.stdout);
    let stderr = descriptor.decode_output(&output.stderr);
    if !output.status.success() {
        return Err(TraceError::ProcessTerminatedUnexpectedly {
            code: output.status.code(),
            output: stderr.trim().to_string(),
        });
    }
    stdout
        .lines()
        .chain(stderr.lines())
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            unavailable(io::Error::new(
                io::ErrorKind::InvalidData,
                "backend printed no version",
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{NATIVE_UNIX, RICH_BACKEND};
    use std::fs;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("hoptrace-locate-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[cfg(unix)]
    fn write_script(path: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn tools_dir_wins_over_root() {
        let root = scratch("tools");
        let name = RICH_BACKEND.executable_name();
        fs::create_dir_all(root.join("tools")).unwrap();
        fs::write(root.join("tools").join(&name), b"").unwrap();
        fs::write(root.join(&name), b"").unwrap();

        let locator = BackendLocator::new(vec![root.clone()]).with_search_path("");
        assert_eq!(locator.locate(&RICH_BACKEND), Some(root.join("tools").join(&name)));

        fs::remove_file(root.join("tools").join(&name)).unwrap();
        assert_eq!(locator.locate(&RICH_BACKEND), Some(root.join(&name)));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_backend_is_unavailable() {
        let root = scratch("missing");
        let locator = BackendLocator::new(vec![root.clone()]).with_search_path(root.as_os_str());
        assert_eq!(locator.locate(&RICH_BACKEND), None);
        assert!(!locator.is_available(&RICH_BACKEND));
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn search_path_is_the_last_resort() {
        let root = scratch("path-root");
        let bin = scratch("path-bin");
        write_script(&bin.join("nexttrace"), "exit 0");

        let locator = BackendLocator::new(vec![root.clone()]).with_search_path(bin.as_os_str());
        assert_eq!(locator.locate(&RICH_BACKEND), Some(bin.join("nexttrace")));
        let _ = fs::remove_dir_all(root);
        let _ = fs::remove_dir_all(bin);
    }

    #[cfg(unix)]
    #[test]
    fn version_is_first_output_line() {
        let dir = scratch("version");
        let program = dir.join("nexttrace");
        write_script(
            &program,
            "echo\necho 'NextTrace v1.3.1 2024-05-01T10:00:00Z 9f1c2ab'\necho 'https://github.com/nxtrace/NTrace-core'",
        );

        let version = backend_version(&RICH_BACKEND, &program).unwrap();
        assert_eq!(version, "NextTrace v1.3.1 2024-05-01T10:00:00Z 9f1c2ab");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn version_errors() {
        let missing = Path::new("hoptrace-definitely-missing-binary");
        assert!(matches!(
            backend_version(&RICH_BACKEND, missing),
            Err(TraceError::BackendUnavailable { .. })
        ));
        assert!(matches!(
            backend_version(&NATIVE_UNIX, missing),
            Err(TraceError::InvalidRequest(_))
        ));
    }
}
