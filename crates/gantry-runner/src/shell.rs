//! Script wrapping and tar packaging for in-container execution.

use gantry_core::error::{Error, Result};
use tar::Header;

/// In-container path of the combined stdout/stderr capture file.
pub const OUTPUT_LOG_PATH: &str = "/shell_command_output.log";

/// Name of the staged script inside the container's `/home/` directory.
pub const SCRIPT_NAME: &str = "shell_command.sh";

/// Fixed wrapper prefix: POSIX shell, combined output redirected into
/// the capture file.
fn wrap_command(command: &str) -> String {
    format!("#!/bin/sh\nexec > {} 2>&1\n{}", OUTPUT_LOG_PATH, command)
}

/// Wrap user script lines into executable shell scripts.
///
/// With `solo` each line becomes its own wrapped script; otherwise all
/// lines are joined (newline-separated, trailing newline) into one.
/// Empty input yields no scripts.
pub fn prepare_shell_commands(solo: bool, lines: &[String]) -> Vec<String> {
    if lines.is_empty() {
        return Vec::new();
    }

    if solo {
        lines.iter().map(|line| wrap_command(line)).collect()
    } else {
        let mut joined = String::new();
        for line in lines {
            joined.push_str(line);
            joined.push('\n');
        }
        vec![wrap_command(&joined)]
    }
}

/// Package a wrapped script as a tar archive with a single executable
/// `shell_command.sh` entry.
pub fn shell_to_tar(script: &str) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut header = Header::new_gnu();
    header
        .set_path(SCRIPT_NAME)
        .map_err(|e| Error::Internal(format!("Failed to write tar header: {}", e)))?;
    header.set_mode(0o777);
    header.set_size(script.len() as u64);
    header.set_cksum();

    builder
        .append(&header, script.as_bytes())
        .map_err(|e| Error::Internal(format!("Failed to write tar entry: {}", e)))?;

    builder
        .into_inner()
        .map_err(|e| Error::Internal(format!("Failed to finish tar: {}", e)))
}

/// Strip the fixed wrapper prefix back off a wrapped script, for
/// human-readable command echo.
pub fn unwrap_command(script: &str) -> String {
    script.lines().skip(2).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_script_yields_no_commands() {
        assert!(prepare_shell_commands(true, &[]).is_empty());
        assert!(prepare_shell_commands(false, &[]).is_empty());
    }

    #[test]
    fn test_solo_wraps_each_line() {
        let cmds = prepare_shell_commands(true, &lines(&["echo one", "echo two"]));
        assert_eq!(cmds.len(), 2);
        assert_eq!(
            cmds[0],
            "#!/bin/sh\nexec > /shell_command_output.log 2>&1\necho one"
        );
        assert_eq!(
            cmds[1],
            "#!/bin/sh\nexec > /shell_command_output.log 2>&1\necho two"
        );
    }

    #[test]
    fn test_combined_joins_lines_in_order() {
        let cmds = prepare_shell_commands(false, &lines(&["echo one", "echo two", "echo three"]));
        assert_eq!(cmds.len(), 1);
        assert_eq!(
            cmds[0],
            "#!/bin/sh\nexec > /shell_command_output.log 2>&1\necho one\necho two\necho three\n"
        );
    }

    #[test]
    fn test_unwrap_returns_user_lines() {
        let cmds = prepare_shell_commands(true, &lines(&["make build"]));
        assert_eq!(unwrap_command(&cmds[0]), "make build");

        let combined = prepare_shell_commands(false, &lines(&["a", "b"]));
        assert_eq!(unwrap_command(&combined[0]), "a\nb");
    }

    #[test]
    fn test_shell_to_tar_single_executable_entry() {
        let script = "#!/bin/sh\necho hi";
        let archive = shell_to_tar(script).unwrap();

        let mut reader = tar::Archive::new(archive.as_slice());
        let mut entries = reader.entries().unwrap();

        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str(), Some(SCRIPT_NAME));
        assert_eq!(entry.header().mode().unwrap(), 0o777);

        let mut contents = String::new();
        entry.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, script);

        assert!(entries.next().is_none());
    }
}
