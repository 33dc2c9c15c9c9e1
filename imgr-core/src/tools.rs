//! Helper programs around the copy: lookup, version strings, unmount and
//! eject.
use crate::method::CopyMethod;
use std::env;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tracing::{info, warn};

/// Executables used by a run. Defaults to the bare names, resolved on `PATH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub dd: String,
    pub ddrescue: String,
    pub readom: String,
    pub umount: String,
    pub eject: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            dd: "dd".into(),
            ddrescue: "ddrescue".into(),
            readom: "readom".into(),
            umount: "umount".into(),
            eject: "eject".into(),
        }
    }
}

impl ToolPaths {
    pub fn copy_program(&self, method: CopyMethod) -> &str {
        match method {
            CopyMethod::DirectCopy => &self.dd,
            CopyMethod::RescueCopy => &self.ddrescue,
            CopyMethod::OpticalCopy => &self.readom,
        }
    }
}

/// Whether `program` can be executed: either a path to an executable file,
/// or a name found in one of the `PATH` directories.
pub fn is_installed(program: &str) -> bool {
    if program.contains('/') {
        return is_executable(Path::new(program));
    }

    env::var_os("PATH")
        .map(|paths| {
            env::split_paths(&paths)
                .map(|dir| dir.join(program))
                .any(|candidate| is_executable(&candidate))
        })
        .unwrap_or(false)
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn capture(argv: &[&str]) -> std::io::Result<Output> {
    Command::new(argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .output()
}

/// First line of `<program> --version` that mentions `tool`, trimmed. Empty
/// if the program is missing or prints nothing recognisable.
pub fn version_string(program: &str, tool: &str) -> String {
    let Ok(output) = capture(&[program, "--version"]) else {
        return String::new();
    };
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    stdout
        .lines()
        .chain(stderr.lines())
        .find(|line| line.contains(tool))
        .map(|line| line.trim().to_string())
        .unwrap_or_default()
}

/// Runs a helper command and logs what it did. Returns the exit code, or
/// `None` if it could not be run. Never fails the caller.
fn run_logged(argv: &[&str]) -> Option<i32> {
    let cmd_line = argv.join(" ");
    info!("Command: {cmd_line}");

    match capture(argv) {
        Ok(output) => {
            let code = output.status.code();
            info!("{} status: {}", argv[0], code.map_or("signal".into(), |c| c.to_string()));
            info!("{} stdout: {}", argv[0], String::from_utf8_lossy(&output.stdout).trim());
            info!("{} stderr: {}", argv[0], String::from_utf8_lossy(&output.stderr).trim());
            code
        }
        Err(e) => {
            warn!("could not run {}: {e}", argv[0]);
            None
        }
    }
}

/// Unmounts `device`, best effort. A device that was not mounted makes
/// `umount` exit non-zero, which is expected and only logged.
pub fn unmount(program: &str, device: &Path) -> Option<i32> {
    let device = device.to_string_lossy();
    run_logged(&[program, &*device])
}

/// Ejects removable media from `device`, best effort.
pub fn eject(program: &str, device: &Path) -> Option<i32> {
    let device = device.to_string_lossy();
    run_logged(&[program, &*device])
}

/// Resolves `program` to the path it would run from, for display.
pub fn resolve(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        return is_executable(Path::new(program)).then(|| PathBuf::from(program));
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_programs_on_path() {
        assert!(is_installed("sh"));
        assert!(resolve("sh").is_some());
        assert!(!is_installed("imgr-no-such-tool"));
        assert!(!is_installed("/nonexistent/dd"));
    }

    #[test]
    fn non_executable_file_is_not_installed() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(!is_installed(file.path().to_str().unwrap()));
    }

    #[test]
    fn version_of_missing_tool_is_empty() {
        assert_eq!(version_string("/nonexistent/ddrescue", "ddrescue"), "");
    }

    #[test]
    fn helper_exit_codes_are_returned() {
        assert_eq!(unmount("true", Path::new("/dev/loop7")), Some(0));
        assert_eq!(eject("false", Path::new("/dev/sr0")), Some(1));
        assert_eq!(unmount("/nonexistent/umount", Path::new("/dev/loop7")), None);
    }

    #[test]
    fn copy_program_per_method() {
        let tools = ToolPaths {
            ddrescue: "/opt/bin/ddrescue".into(),
            ..ToolPaths::default()
        };
        assert_eq!(tools.copy_program(CopyMethod::RescueCopy), "/opt/bin/ddrescue");
        assert_eq!(tools.copy_program(CopyMethod::DirectCopy), "dd");
    }
}
