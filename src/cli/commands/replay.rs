//! Replay command - run a scenario and print its effects

use crate::cache::CacheEntryInfo;
use crate::caps::{DumpView, Notification};
use crate::cli::args::{OutputFormat, ReplayArgs, ViewArg};
use crate::config::Config;
use crate::error::FusecapResult;
use crate::replay::{Replay, Scenario, StepRecord};
use console::style;
use serde::Serialize;

#[derive(Serialize)]
struct ReplayOutput<'a> {
    steps: &'a [StepRecord],
    dump: &'a str,
    cache: &'a [CacheEntryInfo],
}

/// Execute the replay command
pub async fn execute(args: ReplayArgs, config: &Config) -> FusecapResult<()> {
    let scenario = Scenario::load(&args.scenario).await?;
    let mut replay = Replay::new(&scenario, config)?;
    let steps = replay.run(&scenario.steps).await;

    let view = match args.view {
        ViewArg::Time => DumpView::Time,
        ViewArg::Inode => DumpView::Inode,
        ViewArg::Path => DumpView::Path,
    };
    let dump = replay.dump(view, args.filter.as_deref())?;
    let cache = replay.cache_entries();

    match args.format {
        OutputFormat::Table => print_table(&steps, &dump, &cache),
        OutputFormat::Json => {
            let output = ReplayOutput {
                steps: &steps,
                dump: &dump,
                cache: &cache,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

fn print_table(steps: &[StepRecord], dump: &str, cache: &[CacheEntryInfo]) {
    println!(
        "{:<5} {:<18} {}",
        style("STEP").bold(),
        style("OP").bold(),
        style("RESULT").bold()
    );
    println!("{}", "-".repeat(60));

    for step in steps {
        let result = if step.ok {
            style(step.result.as_str()).green()
        } else {
            style(step.result.as_str()).red()
        };
        println!("{:<5} {:<18} {}", step.index, step.op, result);
        for n in &step.notifications {
            println!("{:<5} {}", "", style(describe(n)).dim());
        }
    }

    println!();
    println!("{}", style("Capabilities").bold());
    if dump.is_empty() {
        println!("  (none)");
    } else {
        print!("{}", dump);
    }

    if !cache.is_empty() {
        println!();
        println!(
            "{:<18} {:<10} {:<10} {:<12} {:<8}",
            style("INODE").bold(),
            style("SIZE").bold(),
            style("BUFFERED").bold(),
            style("LIFETIME").bold(),
            style("PARTIAL").bold()
        );
        for entry in cache {
            println!(
                "{:<18} {:<10} {:<10} {:<12} {:<8}",
                format!("{:016x}", entry.inode),
                entry.size,
                entry.buffered,
                entry.lifetime,
                entry.partial
            );
        }
    }
}

fn describe(n: &Notification) -> String {
    match n {
        Notification::Release { inode, client_uuid, .. } => {
            format!("-> release i:{:016x} u:{}", inode, client_uuid)
        }
        Notification::Refresh { inode, client_uuid, .. } => {
            format!("-> refresh i:{:016x} u:{}", inode, client_uuid)
        }
        Notification::Delete {
            inode,
            client_uuid,
            name,
            ..
        } => format!("-> delete i:{:016x} u:{} name:{}", inode, client_uuid, name),
        Notification::Md {
            inode,
            parent_inode,
            client_uuid,
            ..
        } => format!(
            "-> md i:{:016x} p:{:016x} u:{}",
            inode, parent_inode, client_uuid
        ),
        Notification::Cap {
            inode,
            auth_id,
            client_uuid,
        } => format!("-> cap i:{:016x} a:{} u:{}", inode, auth_id, client_uuid),
    }
}
