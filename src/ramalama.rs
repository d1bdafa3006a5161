//! Adapter around the ramalama CLI: model listing and serve-command
//! construction. All subprocess invocations of the tool go through here.

use std::process::Stdio;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

/// Handle on the configured serving tool. `command` is the executable
/// followed by preset arguments, e.g. `["uvx", "ramalama"]`.
#[derive(Debug, Clone)]
pub struct Ramalama {
    pub command: Vec<String>,
}

/// One entry of `ramalama list --json`.
#[derive(Debug, Clone, Deserialize)]
pub struct Model {
    #[serde(rename = "Name")]
    pub name: String,
    /// RFC 3339 timestamp string, passed through as-is.
    #[serde(rename = "Modified")]
    pub modified: String,
    #[serde(rename = "Size")]
    pub size: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ServeArgs {
    pub model: String,
    pub port: u16,
    pub alias: Option<String>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("ramalama command should not be empty")]
    CommandEmpty,
    #[error("failed to start ramalama: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to parse ramalama model list: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("ramalama exited with {0}")]
    Exit(std::process::ExitStatus),
}

impl Ramalama {
    fn split_command(&self) -> Result<(&String, &[String]), Error> {
        self.command.split_first().ok_or(Error::CommandEmpty)
    }

    /// Run `<command...> list --json` and decode its stdout. stderr is
    /// discarded; the child is always reaped.
    pub async fn list_models(&self) -> Result<Vec<Model>, Error> {
        let (program, preset) = self.split_command()?;

        let output = Command::new(program)
            .args(preset)
            .args(["list", "--json"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(Error::Spawn)?;

        if !output.status.success() {
            return Err(Error::Exit(output.status));
        }

        // The tool prints `null` rather than `[]` when no models exist.
        let models: Option<Vec<Model>> =
            serde_json::from_slice(&output.stdout).map_err(Error::Parse)?;
        Ok(models.unwrap_or_default())
    }

    /// Build (but do not spawn) `<command...> serve --pull never
    /// [-n alias] -p <port> <model>`. The serving tool exposes an
    /// OpenAI-compatible API with `GET /health` on the given port.
    pub fn serve_command(&self, args: &ServeArgs) -> Result<Command, Error> {
        let (program, preset) = self.split_command()?;

        let mut cmd = Command::new(program);
        cmd.args(preset).args(["serve", "--pull", "never"]);
        if let Some(alias) = &args.alias {
            cmd.args(["-n", alias]);
        }
        cmd.arg("-p").arg(args.port.to_string()).arg(&args.model);
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(command: &[&str]) -> Ramalama {
        Ramalama {
            command: command.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_list_models_empty_command() {
        let err = tool(&[]).list_models().await.unwrap_err();
        assert!(matches!(err, Error::CommandEmpty));
    }

    #[tokio::test]
    async fn test_list_models_spawn_failure() {
        let err = tool(&["/nonexistent/rama-swap-test-binary"])
            .list_models()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
    }

    #[test]
    fn test_serve_command_empty_command() {
        let err = tool(&[]).serve_command(&ServeArgs::default()).unwrap_err();
        assert!(matches!(err, Error::CommandEmpty));
    }

    #[test]
    fn test_serve_command_argv() {
        let cmd = tool(&["uvx", "ramalama"])
            .serve_command(&ServeArgs {
                model: "org/model".to_string(),
                port: 4918,
                alias: None,
            })
            .unwrap();
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "uvx");
        let argv: Vec<_> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            argv,
            ["ramalama", "serve", "--pull", "never", "-p", "4918", "org/model"]
        );
    }

    #[test]
    fn test_serve_command_with_alias() {
        let cmd = tool(&["ramalama"])
            .serve_command(&ServeArgs {
                model: "m".to_string(),
                port: 1,
                alias: Some("friendly".to_string()),
            })
            .unwrap();
        let argv: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            argv,
            ["serve", "--pull", "never", "-n", "friendly", "-p", "1", "m"]
        );
    }

    #[cfg(unix)]
    mod stub {
        use super::*;
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        /// Write an executable shell script and return its tempdir + path.
        pub(super) fn script(body: &str) -> (tempfile::TempDir, String) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("stub-ramalama");
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "#!/bin/sh\n{body}").unwrap();
            let mut perms = file.metadata().unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            (dir, path.to_string_lossy().into_owned())
        }

        #[tokio::test]
        async fn test_list_models_parses_stub_output() {
            let (_dir, path) = script(
                r#"echo '[{"Name":"tiny","Modified":"2024-01-01T00:00:00Z","Size":7}]'"#,
            );
            let models = tool(&[&path]).list_models().await.unwrap();
            assert_eq!(models.len(), 1);
            assert_eq!(models[0].name, "tiny");
            assert_eq!(models[0].modified, "2024-01-01T00:00:00Z");
            assert_eq!(models[0].size, 7);
        }

        #[tokio::test]
        async fn test_list_models_null_output() {
            let (_dir, path) = script("echo null");
            let models = tool(&[&path]).list_models().await.unwrap();
            assert!(models.is_empty());
        }

        #[tokio::test]
        async fn test_list_models_malformed_json() {
            let (_dir, path) = script("echo not-json");
            let err = tool(&[&path]).list_models().await.unwrap_err();
            assert!(matches!(err, Error::Parse(_)));
        }

        #[tokio::test]
        async fn test_list_models_nonzero_exit() {
            let (_dir, path) = script("exit 3");
            let err = tool(&[&path]).list_models().await.unwrap_err();
            assert!(matches!(err, Error::Exit(_)));
        }

        #[tokio::test]
        async fn test_list_models_receives_list_subcommand() {
            // The stub echoes its argv back as the model name.
            let (_dir, path) = script(
                r#"printf '[{"Name":"%s","Modified":"2024-01-01T00:00:00Z","Size":0}]' "$*""#,
            );
            let models = tool(&[&path]).list_models().await.unwrap();
            assert_eq!(models[0].name, "list --json");
        }
    }
}
