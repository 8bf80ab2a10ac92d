//! CLI command implementations.

use crate::LogFormat;
use anyhow::{Context, Result, bail};
use complect_config::{SystemConfig, WorkerSpec, find_worker, load_system_config, worker_table};
use complect_db::{NewTask, PgTaskQueue, TaskQueue, create_pool, run_migrations};
use complect_scheduler::{Supervisor, run_worker};
use serde_json::{Map, Value};
use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

fn load(path: &Path) -> Result<SystemConfig> {
    load_system_config(path)
        .with_context(|| format!("Failed to load config file: {}", path.display()))
}

pub async fn supervise(config_path: &Path, log_format: LogFormat) -> Result<()> {
    let config = load(config_path)?;
    let specs = worker_table(&config);
    if specs.is_empty() {
        bail!("No workers configured in {}", config_path.display());
    }

    let program = std::env::current_exe().context("Can't locate the complect binary")?;
    let base_args: Vec<OsString> = vec![
        "--config".into(),
        config_path.as_os_str().to_os_string(),
        "--log-format".into(),
        log_format.as_str().into(),
    ];

    Supervisor::new(program, base_args, specs).run().await?;
    Ok(())
}

pub async fn worker(config_path: &Path, name: &str) -> Result<()> {
    let config = load(config_path)?;
    let spec = find_worker(&config, name)
        .with_context(|| format!("No worker named {} in {}", name, config_path.display()))?;
    info!(worker = %spec.name, task_type = %spec.task_type, "Starting worker");
    run_worker(Arc::new(config), spec).await
}

pub async fn migrate(config_path: &Path) -> Result<()> {
    let config = load(config_path)?;
    let pool = create_pool(config.database_url()?, config.database.max_connections).await?;
    run_migrations(&pool).await?;
    info!("Migrations applied");
    Ok(())
}

pub fn validate(path: &Path) -> Result<()> {
    let config = load(path)?;
    println!("Configuration is valid");
    print!("{}", render_worker_table(&worker_table(&config)));
    Ok(())
}

pub async fn enqueue(config_path: &Path, task_type: &str, script: &str, args: &str) -> Result<()> {
    let args = parse_task_args(args)?;
    let config = load(config_path)?;
    let pool = create_pool(config.database_url()?, config.database.max_connections).await?;
    let queue = PgTaskQueue::new(pool);

    let task = queue.enqueue(NewTask::new(task_type, script, args)).await?;
    println!("{}", task.id);
    Ok(())
}

pub fn targets(config_path: &Path) -> Result<()> {
    let config = load(config_path)?;
    println!("{:<24} {:<10} {:<12} ROUTING", "NAME", "ROLE", "VARIANT");
    for target in config.compilers.iter().chain(&config.deployers) {
        let routing = target.routing_key();
        println!(
            "{:<24} {:<10} {:<12} {}",
            target.name,
            target.role.as_str(),
            target.variant(),
            if routing.is_empty() { "*" } else { &routing }
        );
    }
    Ok(())
}

fn parse_task_args(args: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(args).context("Task arguments are not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("Task arguments must be a JSON object, got {}", other),
    }
}

fn render_worker_table(specs: &[WorkerSpec]) -> String {
    let mut out = format!("{:<28} {:<12} FILTERS\n", "WORKER", "TYPE");
    for spec in specs {
        let filters = spec
            .filters
            .iter()
            .map(|f| format!("{}={:?}", f.key, f.value))
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&format!("{:<28} {:<12} {}\n", spec.name, spec.task_type, filters));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use complect_config::parse_system_config;

    const CONFIG: &str = r#"
database url="postgres://complect:pw@127.0.0.1:5432/complect"
worker-type "testcase"
compiler "sova" exclusive=#true group="main" {
    ssh host="10.0.0.5" user="root"
    engine-path "/usr/local/InfEngine"
    data-path "/dldata"
}
"#;

    #[test]
    fn test_parse_task_args() {
        let args = parse_task_args(r#"{"complect_id":"abc","do_update":false}"#).unwrap();
        assert_eq!(args["complect_id"], "abc");
        assert!(parse_task_args("[1,2]").is_err());
        assert!(parse_task_args("not json").is_err());
    }

    #[test]
    fn test_render_worker_table() {
        let config = parse_system_config(CONFIG).unwrap();
        let table = render_worker_table(&worker_table(&config));
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("testcase"));
        assert!(lines[2].starts_with("compiler-sova"));
        assert!(lines[2].contains(r#"target="main""#));
    }

    #[test]
    fn test_validate_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("complect.kdl");
        std::fs::write(&path, CONFIG).unwrap();
        assert!(validate(&path).is_ok());
        assert!(validate(&dir.path().join("missing.kdl")).is_err());
    }
}
