use std::process::ExitCode;
use std::time::Duration;

use clap::Subcommand;
use lifecycle::Controller;
use serde_json::json;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use super::{GlobalArgs, build_controller, print_json};
use crate::error::DaemonResult;

/// One-shot operations against the configured stores and provider.
#[derive(Subcommand)]
pub enum OpCommand {
    /// Create a sandbox and arm its idle timeout
    Create {
        #[arg(long)]
        owner: String,
        /// Template (snapshot) to boot; the provider default otherwise
        #[arg(long)]
        template: Option<String>,
    },
    /// Connect to a sandbox, resuming it if paused
    Connect { sandbox_id: Uuid },
    /// Pause a running sandbox
    Pause {
        sandbox_id: Uuid,
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    /// Delete a sandbox and its record
    Delete { sandbox_id: Uuid },
    /// Print the recorded status of a sandbox
    Status { sandbox_id: Uuid },
    /// Print the full record of a sandbox
    Info { sandbox_id: Uuid },
    /// List the sandboxes of an owner, oldest first
    List {
        #[arg(long)]
        owner: String,
    },
    /// Run a shell command inside a sandbox
    Exec {
        sandbox_id: Uuid,
        /// Detach and return immediately
        #[arg(long)]
        background: bool,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Print a file from a sandbox
    Read { sandbox_id: Uuid, path: String },
    /// Write a file into a sandbox, from --content or stdin
    Write {
        sandbox_id: Uuid,
        path: String,
        #[arg(long)]
        content: Option<String>,
    },
    /// Remove a file from a sandbox
    Rm { sandbox_id: Uuid, path: String },
    /// Create a directory inside a sandbox
    Mkdir {
        sandbox_id: Uuid,
        path: String,
        #[arg(long)]
        exist_ok: bool,
    },
    /// Print the public URL of a sandbox port
    Expose { sandbox_id: Uuid, port: u16 },
    /// Replace the idle timeout of a sandbox
    Timeout { sandbox_id: Uuid, secs: u64 },
    /// List messages that exhausted their retries, newest first
    DeadLetters {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Correct records that drifted from the provider
    Reconcile {
        #[arg(long)]
        owner: String,
    },
    /// Check that the delay store is reachable
    Health,
}

pub async fn run_op(global: &GlobalArgs, op: OpCommand) -> DaemonResult<ExitCode> {
    let config = global.load_config().await?;
    let controller = build_controller(&config).await?;
    let result = dispatch(&controller, op).await;
    // Creating a sandbox starts the consumer lazily; stop it before exiting.
    controller.shutdown().await;
    result
}

async fn dispatch(controller: &Controller, op: OpCommand) -> DaemonResult<ExitCode> {
    match op {
        OpCommand::Create { owner, template } => {
            let handle = controller
                .create_sandbox(&owner, template.as_deref())
                .await?;
            print_json(&controller.get_sandbox_info(handle.sandbox_id).await?)?;
        }
        OpCommand::Connect { sandbox_id } => {
            let handle = controller.connect(sandbox_id).await?;
            print_json(&json!({
                "sandbox_id": handle.sandbox_id,
                "provider_sandbox_id": handle.provider_sandbox_id(),
            }))?;
        }
        OpCommand::Pause { sandbox_id, reason } => {
            controller.pause_sandbox(sandbox_id, &reason).await?;
            print_status(controller, sandbox_id).await?;
        }
        OpCommand::Delete { sandbox_id } => {
            controller.delete_sandbox(sandbox_id).await?;
            print_json(&json!({ "sandbox_id": sandbox_id, "deleted": true }))?;
        }
        OpCommand::Status { sandbox_id } => print_status(controller, sandbox_id).await?,
        OpCommand::Info { sandbox_id } => {
            print_json(&controller.get_sandbox_info(sandbox_id).await?)?;
        }
        OpCommand::List { owner } => print_json(&controller.list_sandboxes(&owner).await?)?,
        OpCommand::Exec {
            sandbox_id,
            background,
            command,
        } => {
            let result = controller
                .run_cmd(sandbox_id, &command.join(" "), background)
                .await?;
            print_json(&json!({
                "exit_code": result.exit_code,
                "stdout": result.stdout,
                "stderr": result.stderr,
            }))?;
            if result.exit_code != 0 {
                return Ok(ExitCode::FAILURE);
            }
        }
        OpCommand::Read { sandbox_id, path } => {
            print!("{}", controller.read_file(sandbox_id, &path).await?);
        }
        OpCommand::Write {
            sandbox_id,
            path,
            content,
        } => {
            let content = match content {
                Some(c) => c,
                None => {
                    let mut buf = String::new();
                    tokio::io::stdin().read_to_string(&mut buf).await?;
                    buf
                }
            };
            controller.write_file(sandbox_id, &path, &content).await?;
        }
        OpCommand::Rm { sandbox_id, path } => controller.delete_file(sandbox_id, &path).await?,
        OpCommand::Mkdir {
            sandbox_id,
            path,
            exist_ok,
        } => {
            controller
                .create_directory(sandbox_id, &path, exist_ok)
                .await?;
        }
        OpCommand::Expose { sandbox_id, port } => {
            let url = controller.expose_port(sandbox_id, port).await?;
            print_json(&json!({ "port": port, "url": url }))?;
        }
        OpCommand::Timeout { sandbox_id, secs } => {
            let fires_at = controller
                .schedule_timeout(sandbox_id, Duration::from_secs(secs))
                .await?;
            print_json(&json!({ "sandbox_id": sandbox_id, "fires_at": fires_at }))?;
        }
        OpCommand::DeadLetters { limit } => {
            print_json(&controller.scheduler().dead_letters(limit).await?)?;
        }
        OpCommand::Reconcile { owner } => {
            print_json(&controller.reconcile_owner(&owner).await?)?;
        }
        OpCommand::Health => {
            let healthy = controller.scheduler().health_check().await;
            print_json(&json!({ "delay_store": healthy }))?;
            if !healthy {
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn print_status(controller: &Controller, sandbox_id: Uuid) -> DaemonResult<()> {
    let status = controller.get_sandbox_status(sandbox_id).await?;
    print_json(&json!({ "sandbox_id": sandbox_id, "status": status }))
}

#[cfg(test)]
mod tests {
    use lifecycle::SandboxStatus;

    use super::*;
    use crate::config::DaemonConfig;

    #[tokio::test]
    async fn sandbox_operations_dispatch_to_controller() {
        let controller = build_controller(&DaemonConfig::default()).await.unwrap();
        let handle = controller.create_sandbox("u1", None).await.unwrap();
        let id = handle.sandbox_id;

        let code = dispatch(
            &controller,
            OpCommand::Write {
                sandbox_id: id,
                path: "/tmp/hello.txt".into(),
                content: Some("hi".into()),
            },
        )
        .await
        .unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
        assert_eq!(controller.read_file(id, "/tmp/hello.txt").await.unwrap(), "hi");

        dispatch(
            &controller,
            OpCommand::Pause {
                sandbox_id: id,
                reason: "test".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            controller.get_sandbox_status(id).await.unwrap(),
            SandboxStatus::Paused
        );

        dispatch(&controller, OpCommand::Delete { sandbox_id: id })
            .await
            .unwrap();
        assert!(
            controller
                .get_sandbox_status(id)
                .await
                .unwrap_err()
                .is_not_found()
        );
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_sandbox_is_an_error() {
        let controller = build_controller(&DaemonConfig::default()).await.unwrap();
        let err = dispatch(
            &controller,
            OpCommand::Status {
                sandbox_id: Uuid::new_v4(),
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("not found"), "got: {err}");
    }

    #[tokio::test]
    async fn health_reports_success_for_memory_store() {
        let controller = build_controller(&DaemonConfig::default()).await.unwrap();
        let code = dispatch(&controller, OpCommand::Health).await.unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
    }
}
