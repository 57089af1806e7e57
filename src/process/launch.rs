//! Worker launch description and command construction.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::ipc::PipePaths;
use crate::types::ModelConfig;

/// Fully resolved worker launch, as produced by an environment provisioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Applied on top of the parent environment, in order.
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    /// The configured command unchanged, plus the resource descriptor.
    pub fn from_config(config: &ModelConfig) -> Self {
        let mut env: Vec<(String, String)> = config
            .command
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.extend(config.resources.to_env());
        Self {
            program: config.command.program.clone(),
            args: config.command.args.clone(),
            env,
            working_dir: config.command.working_dir.clone(),
        }
    }

    /// Build the child command for one worker instance.
    ///
    /// stdout and stderr are piped for forwarding; stdin is closed. The child
    /// is killed if its handle is dropped.
    pub fn command(&self, pipes: &PipePaths, pipe_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .envs(pipes.to_env(pipe_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LaunchCommand, ResourceLimits};

    #[test]
    fn test_from_config_exports_resources_after_user_env() {
        let mut config = ModelConfig::new("fruit", "/opt/venv/bin/python");
        config.command = LaunchCommand::new("/opt/venv/bin/python")
            .arg("model.py")
            .env("MODEL_VARIANT", "small");
        config.resources = ResourceLimits::new().with("gpu_ids", "1");

        let spec = LaunchSpec::from_config(&config);
        assert_eq!(spec.args, vec!["model.py"]);
        assert_eq!(
            spec.env,
            vec![
                ("MODEL_VARIANT".to_string(), "small".to_string()),
                ("MODELSERVE_RESOURCE_GPU_IDS".to_string(), "1".to_string()),
                ("CUDA_VISIBLE_DEVICES".to_string(), "1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_command_exports_pipe_locations() {
        let dir = tempfile::tempdir().unwrap();
        let pipes = PipePaths::in_dir(dir.path());
        let spec = LaunchSpec {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), "echo $MODELSERVE_REQUEST_PIPE:$EXTRA".into()],
            env: vec![("EXTRA".into(), "yes".into())],
            working_dir: Some(dir.path().to_path_buf()),
        };
        let output = spec.command(&pipes, dir.path()).output().await.unwrap();
        let stdout = String::from_utf8(output.stdout).unwrap();
        assert_eq!(
            stdout.trim(),
            format!("{}:yes", pipes.request.display())
        );
    }
}
