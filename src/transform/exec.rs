use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;

use serde::Deserialize;

use crate::error::{ConfigError, TransformError};
use crate::file::File;

use super::{FileTransform, StepContext};

pub(super) const NAME: &str = "exec";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecOptions {
    /// Program and arguments. `{path}` in any argument is replaced with the
    /// path of the file being transformed.
    pub command: Vec<String>,
    /// New extension for the output, if the command changes the file type.
    pub extension: Option<String>,
}

/// Pipes file contents through an external command, e.g. a transpiler.
///
/// The contents go to stdin and stdout becomes the new contents. A non-zero
/// exit fails the file with the command's stderr.
pub struct Exec {
    program: String,
    args: Vec<String>,
    extension: Option<String>,
}

impl Exec {
    pub fn new(options: ExecOptions) -> Result<Self, ConfigError> {
        let mut command = options.command.into_iter();
        let program = command.next().ok_or_else(|| ConfigError::Options {
            name: NAME.to_string(),
            source: serde::de::Error::custom("`command` must name a program"),
        })?;

        Ok(Self {
            program,
            args: command.collect(),
            extension: options.extension,
        })
    }
}

impl FileTransform for Exec {
    fn name(&self) -> &str {
        NAME
    }

    fn transform(&self, _: &StepContext<'_>, mut file: File) -> Result<Option<File>, TransformError> {
        let path = file.path();
        let fail = |message: String| TransformError::new(NAME, path.clone(), message);

        let mut child = Command::new(&self.program)
            .args(self.args.iter().map(|a| a.replace("{path}", path.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| fail(format!("couldn't run '{}': {e}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| fail("stdin not piped".into()))?;

        // written from another thread, the child may fill stdout first
        let input = file.contents.clone();
        let writer = thread::spawn(move || stdin.write_all(&input));

        let output = child
            .wait_with_output()
            .map_err(|e| fail(format!("couldn't read output of '{}': {e}", self.program)))?;

        match writer.join() {
            Ok(Ok(())) => {}
            // the command may exit without reading everything
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(fail(format!("couldn't write to '{}': {e}", self.program))),
            Err(_) => return Err(fail("stdin writer panicked".into())),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fail(format!(
                "'{}' exited with {}:\n{}",
                self.program,
                output.status,
                stderr.trim_end()
            )));
        }

        file.replace(output.stdout, None);
        if let Some(extension) = &self.extension {
            file.set_extension(extension);
        }

        Ok(Some(file))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::{Environment, Mode};

    fn exec(command: &[&str], extension: Option<&str>) -> Exec {
        Exec::new(ExecOptions {
            command: command.iter().map(|s| s.to_string()).collect(),
            extension: extension.map(String::from),
        })
        .unwrap()
    }

    fn run(exec: &Exec, file: File) -> Result<Option<File>, TransformError> {
        let env = Environment::new("/p", Mode::Build);
        exec.transform(&StepContext { env: &env }, file)
    }

    #[test]
    fn pipes_through_stdin_and_stdout() {
        let out = run(&exec(&["tr", "a-z", "A-Z"], Some("txt")), File::new("/p", "a.js", "let a;"))
            .unwrap()
            .unwrap();
        assert_eq!(out.contents, b"LET A;");
        assert_eq!(out.relative, "a.txt");
    }

    #[test]
    fn substitutes_the_path() {
        let out = run(&exec(&["echo", "{path}"], None), File::new("/p/app", "a.js", ""))
            .unwrap()
            .unwrap();
        assert_eq!(out.contents, b"/p/app/a.js\n");
    }

    #[test]
    fn failure_carries_stderr() {
        let err = run(
            &exec(&["sh", "-c", "echo 'SyntaxError: nope' >&2; exit 3"], None),
            File::new("/p", "a.js", "x"),
        )
        .unwrap_err();
        assert_eq!(err.transform, "exec");
        assert!(err.message.contains("SyntaxError: nope"));
    }

    #[test]
    fn missing_program_is_reported() {
        let err = run(&exec(&["definitely-not-a-command-x"], None), File::new("/p", "a.js", "x"))
            .unwrap_err();
        assert!(err.message.contains("couldn't run"));
    }

    #[test]
    fn empty_command_is_a_config_error() {
        assert!(matches!(
            Exec::new(ExecOptions::default()),
            Err(ConfigError::Options { .. })
        ));
    }
}
