// SPDX-License-Identifier: GPL-2.0
//
// Copyright (c) 2025 The xpu_limiter Authors

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-container accelerator usage against configured quotas.
//!
//! One-shot: collects utilization samples for the trailing period, maps
//! device host pids back to container pids and prints one table or JSON
//! document.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;

use xpu_limiter::config::MEGABYTE;
use xpu_limiter::device::XpuManager;
use xpu_limiter::{NvmlManager, PidManager, ResourceConfig};

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Json,
    Table,
}

/// Show per-container accelerator usage and quotas.
#[derive(Debug, Parser)]
#[command(name = "xpu-monitor", version)]
struct Opts {
    /// Time period in seconds over which computing power is averaged.
    #[clap(short, long, default_value_t = 60,
           value_parser = clap::value_parser!(u32).range(1..=86400))]
    period: u32,

    /// Output format.
    #[clap(short, long, value_enum, default_value_t = OutputFormat::Table)]
    output: OutputFormat,
}

#[derive(Debug, Default, Serialize)]
struct ProcessUsage {
    pid: i32,
    core: u32,
    memory: u64,
}

#[derive(Debug, Serialize)]
struct DieUsage {
    device: u32,
    core: u32,
    core_quota: u32,
    memory: u64,
    memory_quota: u64,
    processes: Vec<ProcessUsage>,
}

#[derive(Debug, Serialize)]
struct Report {
    r#type: &'static str,
    vxpus: Vec<DieUsage>,
}

fn collect(
    xpu: &dyn XpuManager,
    pids: &PidManager,
    config: &ResourceConfig,
    since_us: u64,
    own_pid: i32,
) -> Result<Report> {
    let mut vxpus = Vec::new();
    for device in 0..xpu.device_count()? {
        let core_quota = if config.limit_compute() {
            config.compute_quota()
        } else {
            100
        };
        let memory_quota = if config.limit_memory() {
            config.memory_quota()
        } else {
            xpu.total_memory(device)?
        };

        let mut procs: BTreeMap<i32, ProcessUsage> = BTreeMap::new();
        let mut memory = 0;
        let mut core = 0;
        for sample in xpu.process_memory(device)? {
            let Some(pid) = pids.container_pid(sample.host_pid as i32) else {
                continue;
            };
            if pid == own_pid {
                continue;
            }
            let proc = procs.entry(pid).or_insert(ProcessUsage {
                pid,
                ..Default::default()
            });
            proc.memory = sample.used_bytes;
            memory += sample.used_bytes;
        }
        for sample in xpu.process_utilization(device, since_us)? {
            let Some(pid) = pids.container_pid(sample.host_pid as i32) else {
                continue;
            };
            if pid == own_pid {
                continue;
            }
            let proc = procs.entry(pid).or_insert(ProcessUsage {
                pid,
                ..Default::default()
            });
            proc.core = sample.sm_util;
            core += sample.sm_util;
        }

        vxpus.push(DieUsage {
            device,
            core,
            core_quota,
            memory,
            memory_quota,
            processes: procs.into_values().collect(),
        });
    }
    Ok(Report {
        r#type: "vGPU",
        vxpus,
    })
}

fn render_table(report: &Report) -> String {
    let mut out = format!("{} num: {}\n", report.r#type, report.vxpus.len());
    for die in &report.vxpus {
        out.push_str(&format!(
            "{} {} usage {:02}%, limit {:02}%, memory usage {:6}/{}MB\n",
            report.r#type,
            die.device,
            die.core,
            die.core_quota,
            die.memory / MEGABYTE,
            die.memory_quota / MEGABYTE,
        ));
        for proc in &die.processes {
            out.push_str(&format!(
                "pid {}, core usage {:02}%, memory usage {:6}MB\n",
                proc.pid,
                proc.core,
                proc.memory / MEGABYTE,
            ));
        }
    }
    out
}

fn sample_window_start(period: u32) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    now.saturating_sub(Duration::from_secs(period as u64))
        .as_micros() as u64
}

fn run(opts: &Opts) -> Result<()> {
    let xpu = Arc::new(NvmlManager::probe(0)?);
    xpu.init()?;

    let config_base = Path::new(xpu_limiter::config::CONFIG_BASE_DIR);
    let config = ResourceConfig::load(&config_base.join(xpu.config_file()))?;
    let pids = PidManager::new(config_base.to_path_buf());
    if pids.path().exists() {
        pids.refresh()?;
    }

    let report = collect(
        xpu.as_ref(),
        &pids,
        &config,
        sample_window_start(opts.period),
        std::process::id() as i32,
    )?;
    match opts.output {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&report).context("JSON encoding failed")?
        ),
        OutputFormat::Table => print!("{}", render_table(&report)),
    }
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(log::LevelFilter::Error)
        .set_location_level(log::LevelFilter::Off)
        .set_target_level(log::LevelFilter::Off)
        .set_thread_level(log::LevelFilter::Off);
    simplelog::TermLogger::init(
        log::LevelFilter::Warn,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    run(&opts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_bounds_are_enforced() {
        assert!(Opts::try_parse_from(["xpu-monitor", "-p", "0"]).is_err());
        assert!(Opts::try_parse_from(["xpu-monitor", "-p", "86401"]).is_err());
        let opts = Opts::try_parse_from(["xpu-monitor", "-p", "86400"]).unwrap();
        assert_eq!(opts.period, 86400);
        let opts = Opts::try_parse_from(["xpu-monitor"]).unwrap();
        assert_eq!(opts.period, 60);
        assert_eq!(opts.output, OutputFormat::Table);
    }

    #[test]
    fn output_format_values() {
        let opts = Opts::try_parse_from(["xpu-monitor", "-o", "json"]).unwrap();
        assert_eq!(opts.output, OutputFormat::Json);
        assert!(Opts::try_parse_from(["xpu-monitor", "-o", "xml"]).is_err());
    }

    fn fixed_report() -> Report {
        Report {
            r#type: "vGPU",
            vxpus: vec![DieUsage {
                device: 0,
                core: 37,
                core_quota: 50,
                memory: 123 * MEGABYTE,
                memory_quota: 4096 * MEGABYTE,
                processes: vec![
                    ProcessUsage {
                        pid: 42,
                        core: 20,
                        memory: 64 * MEGABYTE,
                    },
                    ProcessUsage {
                        pid: 43,
                        core: 17,
                        memory: 59 * MEGABYTE,
                    },
                ],
            }],
        }
    }

    #[test]
    fn table_rendering() {
        let table = render_table(&fixed_report());
        assert_eq!(
            table,
            "vGPU num: 1\n\
             vGPU 0 usage 37%, limit 50%, memory usage    123/4096MB\n\
             pid 42, core usage 20%, memory usage     64MB\n\
             pid 43, core usage 17%, memory usage     59MB\n"
        );
    }

    #[test]
    fn json_rendering_round_trips() {
        let json = serde_json::to_string(&fixed_report()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "vGPU");
        assert_eq!(value["vxpus"][0]["core_quota"], 50);
        assert_eq!(value["vxpus"][0]["processes"][1]["pid"], 43);
    }
}
