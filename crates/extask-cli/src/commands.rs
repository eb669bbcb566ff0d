//! Subcommand handlers. Each prints JSON to stdout.

use anyhow::{Context, Result};
use chrono::Duration;
use extask_core::{Blob, Engine, ErrorPayload, ExternalTask, NewExternalTask};
use serde_json::{Value, json};
use tracing::info;

use super::Commands;

pub async fn run(engine: &Engine, command: Commands) -> Result<()> {
    match command {
        Commands::Create {
            topic,
            correlation_id,
            process_model_id,
            process_instance_id,
            flow_node_instance_id,
            payload,
            caller_context,
        } => {
            let id = engine
                .facade()
                .create(NewExternalTask {
                    topic,
                    correlation_id,
                    process_model_id,
                    process_instance_id,
                    flow_node_instance_id,
                    caller_context: Blob::new(caller_context),
                    payload: Blob::new(payload),
                })
                .await
                .context("Failed to create task")?;
            print_json(&json!({ "id": id.to_string() }))
        }
        Commands::Fetch {
            worker,
            topic,
            max_tasks,
            lock_ms,
        } => {
            let lock_duration = lock_ms
                .map(Duration::milliseconds)
                .unwrap_or_else(|| engine.leases().default_lock_duration());
            let tasks = engine
                .leases()
                .fetch_and_lock(&worker, &topic, max_tasks, lock_duration)
                .await
                .context("Failed to fetch tasks")?;
            info!(worker = %worker, topic = %topic, count = tasks.len(), "fetched");
            print_json(&Value::Array(tasks.iter().map(task_json).collect()))
        }
        Commands::Extend {
            worker,
            task,
            lock_ms,
        } => {
            engine
                .leases()
                .extend_lease(&worker, task, Duration::milliseconds(lock_ms))
                .await
                .with_context(|| format!("Failed to extend lease on {task}"))?;
            show(engine, task).await
        }
        Commands::Complete {
            worker,
            task,
            result,
        } => {
            engine
                .leases()
                .finish_with_success(&worker, task, Blob::new(result))
                .await
                .with_context(|| format!("Failed to complete {task}"))?;
            show(engine, task).await
        }
        Commands::Fail {
            worker,
            task,
            error,
        } => {
            engine
                .leases()
                .finish_with_error(&worker, task, Blob::new(error))
                .await
                .with_context(|| format!("Failed to fail {task}"))?;
            show(engine, task).await
        }
        Commands::BpmnError { worker, task, code } => {
            engine
                .leases()
                .handle_bpmn_error(&worker, task, &code)
                .await
                .with_context(|| format!("Failed to record BPMN error on {task}"))?;
            show(engine, task).await
        }
        Commands::ServiceError {
            worker,
            task,
            message,
            details,
        } => {
            engine
                .leases()
                .handle_service_error(&worker, task, &message, &details)
                .await
                .with_context(|| format!("Failed to record service error on {task}"))?;
            show(engine, task).await
        }
        Commands::Show { task } => show(engine, task).await,
        Commands::Find {
            correlation_id,
            process_instance_id,
            flow_node_instance_id,
        } => {
            let task = engine
                .facade()
                .get_by_instance_triple(&correlation_id, &process_instance_id, &flow_node_instance_id)
                .await
                .context("Failed to find task")?;
            print_json(&task_json(&task))
        }
        Commands::Purge { process_model_id } => {
            let deleted = engine
                .facade()
                .delete_by_process_model_id(&process_model_id)
                .await
                .context("Failed to purge tasks")?;
            print_json(&json!({ "deleted": deleted }))
        }
    }
}

async fn show(engine: &Engine, task: extask_core::TaskId) -> Result<()> {
    let task = engine
        .facade()
        .get_by_id(task)
        .await
        .with_context(|| format!("Failed to load {task}"))?;
    print_json(&task_json(&task))
}

fn print_json(value: &Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to render output")?
    );
    Ok(())
}

fn task_json(task: &ExternalTask) -> Value {
    let error = task.error.as_ref().map(|e| match e {
        ErrorPayload::Structured(failure) => {
            serde_json::to_value(failure).unwrap_or_else(|_| json!(failure.message))
        }
        ErrorPayload::Plain(text) | ErrorPayload::Raw(text) => json!(text),
    });
    json!({
        "id": task.id.to_string(),
        "topic": task.topic,
        "correlation_id": task.correlation_id,
        "process_model_id": task.process_model_id,
        "process_instance_id": task.process_instance_id,
        "flow_node_instance_id": task.flow_node_instance_id,
        "state": task.state.as_str(),
        "worker_id": task.worker_id,
        "lock_expiration_time": task.lock_expiration_time.map(|t| t.to_rfc3339()),
        "payload": task.payload.to_json(),
        "result": task.result.as_ref().map(Blob::to_json),
        "error": error,
        "created_at": task.created_at.to_rfc3339(),
        "finished_at": task.finished_at.map(|t| t.to_rfc3339()),
    })
}
