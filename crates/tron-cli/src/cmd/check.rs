use std::path::Path;

use anyhow::Context;
use serde::Serialize;
use tron_core::config::{ConfigWarning, MasterConfig, WarnLevel};
use tron_core::service::Service;
use tron_core::Job;

use crate::local_pools;
use crate::output::{print_json, print_table};

#[derive(Serialize)]
struct JobSummary {
    name: String,
    node: String,
    schedule: String,
    actions: Vec<String>,
    enabled: bool,
}

#[derive(Serialize)]
struct ServiceSummary {
    name: String,
    node: String,
    count: u32,
    monitor_interval: u64,
    enabled: bool,
}

#[derive(Serialize)]
struct CheckReport {
    warnings: Vec<ConfigWarning>,
    jobs: Vec<JobSummary>,
    services: Vec<ServiceSummary>,
}

pub fn run(config_path: &Path, json: bool) -> anyhow::Result<()> {
    let config = MasterConfig::load(config_path)
        .with_context(|| format!("failed to load config {}", config_path.display()))?;

    let mut warnings = config.validate();
    let mut jobs = Vec::new();
    let mut services = Vec::new();

    // entity construction renders templates and resolves nodes, which
    // validation alone does not
    if !has_errors(&warnings) {
        let pools = local_pools(&config).context("failed to build node pools")?;
        for cfg in &config.jobs {
            match Job::from_config(cfg, &pools) {
                Ok(job) => jobs.push(JobSummary {
                    name: job.name.clone(),
                    node: cfg.node.clone(),
                    schedule: job.scheduler.to_string(),
                    actions: job.action_graph().names().into_iter().map(String::from).collect(),
                    enabled: job.enabled,
                }),
                Err(e) => warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("job '{}': {e}", cfg.name),
                }),
            }
        }
        for cfg in &config.services {
            match Service::from_config(cfg, &pools) {
                Ok(_) => services.push(ServiceSummary {
                    name: cfg.name.clone(),
                    node: cfg.node.clone(),
                    count: cfg.count,
                    monitor_interval: cfg.monitor_interval,
                    enabled: cfg.enabled,
                }),
                Err(e) => warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("service '{}': {e}", cfg.name),
                }),
            }
        }
    }

    let errors = warnings
        .iter()
        .filter(|w| w.level == WarnLevel::Error)
        .count();
    let report = CheckReport {
        warnings,
        jobs,
        services,
    };

    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }

    if errors > 0 {
        anyhow::bail!("config has {errors} error(s)");
    }
    Ok(())
}

fn has_errors(warnings: &[ConfigWarning]) -> bool {
    warnings.iter().any(|w| w.level == WarnLevel::Error)
}

fn print_report(report: &CheckReport) {
    for w in &report.warnings {
        let tag = match w.level {
            WarnLevel::Warning => "warning",
            WarnLevel::Error => "error",
        };
        eprintln!("{tag}: {}", w.message);
    }
    if !report.jobs.is_empty() {
        let rows = report
            .jobs
            .iter()
            .map(|j| {
                vec![
                    j.name.clone(),
                    j.node.clone(),
                    j.schedule.clone(),
                    j.actions.join(","),
                    enabled_label(j.enabled).to_string(),
                ]
            })
            .collect();
        print_table(&["JOB", "NODE", "SCHEDULE", "ACTIONS", "STATE"], rows);
    }
    if !report.services.is_empty() {
        if !report.jobs.is_empty() {
            println!();
        }
        let rows = report
            .services
            .iter()
            .map(|s| {
                vec![
                    s.name.clone(),
                    s.node.clone(),
                    s.count.to_string(),
                    format!("{}s", s.monitor_interval),
                    enabled_label(s.enabled).to_string(),
                ]
            })
            .collect();
        print_table(&["SERVICE", "NODE", "COUNT", "MONITOR", "STATE"], rows);
    }
    if report.jobs.is_empty() && report.services.is_empty() && !has_errors(&report.warnings) {
        println!("No jobs or services configured.");
    }
}

fn enabled_label(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}
