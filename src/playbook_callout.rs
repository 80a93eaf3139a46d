use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::callout::{Callout, CalloutError, CalloutOutcome};
use crate::config::AnsibleConfig;
use crate::host::HostId;

/// Runs the configured `ansible-playbook` binary once per host.
///
/// The host id and payload path are forced into the extra vars as
/// `host_id` and `host_variable_file`, on top of whatever extra vars the
/// configuration sets. Stdout and stderr lines become the host's log.
pub struct PlaybookCallout {
    config: AnsibleConfig,
}

impl PlaybookCallout {
    pub fn new(config: AnsibleConfig) -> Self {
        Self { config }
    }

    /// Arguments passed to the binary for one host, options first, then
    /// the playbooks.
    pub fn command_args(
        &self,
        host: &HostId,
        payload_path: &Path,
    ) -> Result<Vec<String>, CalloutError> {
        if self.config.playbooks.is_empty() {
            return Err(CalloutError::Config("no playbooks configured".to_string()));
        }

        let mut extra_vars = self.config.extra_vars.clone();
        extra_vars.insert("host_id".to_string(), Value::String(host.to_string()));
        extra_vars.insert(
            "host_variable_file".to_string(),
            Value::String(payload_path.display().to_string()),
        );
        let extra_vars = serde_json::to_string(&Value::Object(extra_vars))
            .map_err(|e| CalloutError::Config(format!("extra vars: {e}")))?;

        let mut args = Vec::new();
        if let Some(inventory) = &self.config.inventory {
            args.push("--inventory".to_string());
            args.push(inventory.clone());
        }
        if let Some(connection) = &self.config.connection {
            args.push("--connection".to_string());
            args.push(connection.clone());
        }
        if let Some(key) = &self.config.private_key {
            args.push("--private-key".to_string());
            args.push(key.display().to_string());
        }
        if let Some(user) = &self.config.user {
            args.push("--user".to_string());
            args.push(user.clone());
        }
        args.push("--extra-vars".to_string());
        args.push(extra_vars);
        args.extend(self.config.playbooks.iter().cloned());
        Ok(args)
    }

    fn render(&self, args: &[String]) -> String {
        let mut line = self.config.binary.display().to_string();
        for arg in args {
            line.push(' ');
            if arg.contains(|c: char| c.is_whitespace() || c == '"') {
                line.push('\'');
                line.push_str(arg);
                line.push('\'');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

fn lines(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw).lines().map(String::from).collect()
}

#[async_trait]
impl Callout for PlaybookCallout {
    async fn run(
        &self,
        cancel: &CancellationToken,
        host: &HostId,
        payload_path: &Path,
        dry_run: bool,
    ) -> Result<CalloutOutcome, CalloutError> {
        let args = self.command_args(host, payload_path)?;
        let command_line = self.render(&args);

        if dry_run {
            let line = format!("[SIMULATING] Calling playbook for item {host}: {command_line}");
            return Ok(CalloutOutcome::Succeeded { output: vec![line] });
        }

        debug!(host = %host, command = %command_line, "calling playbook");
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        // The child is only spawned when `output()` is first polled.
        let output = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(CalloutError::Cancelled),
            output = cmd.output() => output.map_err(|source| CalloutError::Spawn {
                binary: self.config.binary.display().to_string(),
                source,
            })?,
        };

        let mut log = vec![format!("Calling playbook for item {host}: {command_line}")];
        log.extend(lines(&output.stdout));
        let stderr = lines(&output.stderr);
        log.extend(stderr.iter().cloned());

        let exit_code = output.status.code().unwrap_or(1);
        if exit_code == 0 {
            info!(host = %host, lines = log.len(), "playbook completed");
            Ok(CalloutOutcome::Succeeded { output: log })
        } else {
            info!(host = %host, exit_code, "playbook failed");
            let error = match stderr.last() {
                Some(last) => last.clone(),
                None => format!("playbook exited with code {exit_code}"),
            };
            Ok(CalloutOutcome::Failed {
                exit_code,
                output: log,
                error,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn config(binary: &str) -> AnsibleConfig {
        AnsibleConfig {
            binary: PathBuf::from(binary),
            playbooks: vec!["site.yml".to_string()],
            ..AnsibleConfig::default()
        }
    }

    fn host(id: &str) -> HostId {
        HostId::new(id).unwrap()
    }

    #[test]
    fn args_force_host_vars_over_configured_ones() {
        let mut cfg = config("ansible-playbook");
        cfg.inventory = Some("target-host-a,".to_string());
        cfg.user = Some("deploy".to_string());
        cfg.extra_vars
            .insert("host_id".to_string(), Value::String("wrong".to_string()));
        cfg.extra_vars
            .insert("ansible_port".to_string(), Value::from(2222));
        let op = PlaybookCallout::new(cfg);

        let args = op
            .command_args(&host("H1"), Path::new("/state/H1.json"))
            .unwrap();
        assert_eq!(&args[..4], ["--inventory", "target-host-a,", "--user", "deploy"]);
        assert_eq!(args[4], "--extra-vars");
        let vars: Value = serde_json::from_str(&args[5]).unwrap();
        assert_eq!(vars["host_id"], "H1");
        assert_eq!(vars["host_variable_file"], "/state/H1.json");
        assert_eq!(vars["ansible_port"], 2222);
        assert_eq!(args.last().unwrap(), "site.yml");
    }

    #[test]
    fn no_playbooks_is_config_error() {
        let mut cfg = config("ansible-playbook");
        cfg.playbooks.clear();
        let err = PlaybookCallout::new(cfg)
            .command_args(&host("H1"), Path::new("x.json"))
            .unwrap_err();
        assert!(matches!(err, CalloutError::Config(_)));
    }

    #[tokio::test]
    async fn successful_run_captures_output() {
        let op = PlaybookCallout::new(config("echo"));
        let outcome = op
            .run(&CancellationToken::new(), &host("H1"), Path::new("/s/H1.json"), false)
            .await
            .unwrap();
        match outcome {
            CalloutOutcome::Succeeded { output } => {
                assert_eq!(output.len(), 2);
                assert!(output[1].ends_with("site.yml"), "got: {output:?}");
                assert!(output[1].contains(r#""host_id":"H1""#), "got: {output:?}");
            }
            CalloutOutcome::Failed { .. } => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed_outcome() {
        let op = PlaybookCallout::new(config("false"));
        let outcome = op
            .run(&CancellationToken::new(), &host("H1"), Path::new("x.json"), false)
            .await
            .unwrap();
        match outcome {
            CalloutOutcome::Failed { exit_code, error, .. } => {
                assert_eq!(exit_code, 1);
                assert_eq!(error, "playbook exited with code 1");
            }
            CalloutOutcome::Succeeded { .. } => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let op = PlaybookCallout::new(config("/nonexistent/ansible-playbook"));
        let err = op
            .run(&CancellationToken::new(), &host("H1"), Path::new("x.json"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, CalloutError::Spawn { .. }));
    }

    #[tokio::test]
    async fn dry_run_never_spawns() {
        let op = PlaybookCallout::new(config("/nonexistent/ansible-playbook"));
        let outcome = op
            .run(&CancellationToken::new(), &host("H1"), Path::new("x.json"), true)
            .await
            .unwrap();
        match outcome {
            CalloutOutcome::Succeeded { output } => {
                assert_eq!(output.len(), 1);
                assert!(output[0].starts_with("[SIMULATING] Calling playbook for item H1: /nonexistent/ansible-playbook --extra-vars"));
            }
            CalloutOutcome::Failed { .. } => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn cancelled_token_never_spawns() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let started = dir.path().join("started");
        let script = dir.path().join("recording-playbook");
        std::fs::write(
            &script,
            format!("#!/bin/sh
echo run >> {}
sleep 30
", started.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let op = PlaybookCallout::new(config(script.to_str().unwrap()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        for _ in 0..20 {
            let err = op
                .run(&cancel, &host("H1"), Path::new("x.json"), false)
                .await
                .unwrap_err();
            assert!(matches!(err, CalloutError::Cancelled));
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!started.exists(), "playbook was started after cancellation");
    }

    #[tokio::test]
    async fn cancellation_stops_running_playbook() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow-playbook");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let op = PlaybookCallout::new(config(script.to_str().unwrap()));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = op
            .run(&cancel, &host("H1"), Path::new("x.json"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, CalloutError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
