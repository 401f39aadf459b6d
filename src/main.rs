use std::{sync::Arc, time::Duration};

use clap::Parser;
use pathdex::{
    Error,
    config::Config,
    data_dir::DataDir,
    error,
    service::{Collaborators, Service},
    shard,
    watcher::QueueWatcher,
};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{CacheAction, Cli, Command, ConfigAction, SuffixAction};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("PATHDEX_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config = Config::load(&data_dir.settings_file())?;

    match cli.command {
        Command::Search(args) => {
            let mut config = config;
            if let Some(max) = args.max {
                config.max_results = max;
            }
            with_service(data_dir, config, |service| {
                cmd_search(service, &args)
            })?;
        }
        Command::Rebuild(args) => {
            with_service(data_dir, config, |service| {
                service.update_index(args.drop_previous)?;
                println!("Index rebuilt");
                Ok(())
            })?;
        }
        Command::Optimize => {
            with_service(data_dir, config, |service| {
                if service.optimize()? {
                    println!("Index compacted");
                } else {
                    println!("Index is serving a snapshot, nothing compacted");
                }
                Ok(())
            })?;
        }
        Command::Suffix { action } => {
            with_service(data_dir, config, |service| {
                cmd_suffix(service, action)
            })?;
        }
        Command::Cache { action } => {
            with_service(data_dir, config, |service| {
                cmd_cache(service, action)
            })?;
        }
        Command::Config { action } => {
            cmd_config(&data_dir, config, action)?;
        }
        Command::Status(args) => {
            with_service(data_dir, config, |service| {
                cmd_status(service, args.json)
            })?;
        }
        Command::Serve => {
            let watcher = Arc::new(QueueWatcher::new());
            let parts = Collaborators::from_config(&config)
                .with_watcher(watcher.clone());
            let service = Service::open(data_dir, config, parts)?;
            pathdex::serve::run_stdio(service, watcher)?;
        }
        Command::Completions(args) => {
            args.generate();
        }
    }

    Ok(())
}

/// Open the service, run `f`, and close the service even when `f` fails.
fn with_service(
    data_dir: DataDir,
    config: Config,
    f: impl FnOnce(&Service) -> error::Result<()>,
) -> error::Result<()> {
    let parts = Collaborators::from_config(&config);
    let service = Service::open(data_dir, config, parts)?;
    let outcome = f(&service);
    let closed = service.close();
    outcome.and(closed)
}

fn cmd_search(service: &Service, args: &cli::SearchArgs) -> error::Result<()> {
    if service.needs_rebuild() {
        tracing::warn!("index looks empty, run `pathdex rebuild` first");
    }
    let timeout = Duration::from_secs(args.timeout);
    let task = service.search(&args.query, timeout)?;
    let results = task.all_results();

    if args.json {
        let out = serde_json::json!({
            "query": args.query,
            "uuid": task.id(),
            "results": results,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if results.is_empty() {
        println!("No results found.");
    } else {
        for path in &results {
            println!("{path}");
        }
    }
    Ok(())
}

fn cmd_suffix(service: &Service, action: SuffixAction) -> error::Result<()> {
    match action {
        SuffixAction::Add { suffix, priority } => {
            service.add_suffix(&suffix, priority)?;
            println!("Set priority of '{suffix}' to {priority}");
        }
        SuffixAction::Remove { suffix } => {
            if !service.delete_suffix(&suffix)? {
                return Err(Error::Config(format!(
                    "suffix '{suffix}' cannot be removed"
                )));
            }
            println!("Removed suffix '{suffix}'");
        }
        SuffixAction::Update {
            old_suffix,
            suffix,
            priority,
        } => {
            service.update_suffix(&old_suffix, &suffix, priority)?;
            println!("Replaced '{old_suffix}' with '{suffix}' ({priority})");
        }
        SuffixAction::Clear => {
            service.clear_suffixes()?;
            println!("Cleared suffix priorities");
        }
        SuffixAction::List { json } => {
            let mut suffixes = service.suffixes();
            suffixes.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            if json {
                println!("{}", serde_json::to_string_pretty(&suffixes)?);
            } else {
                for (suffix, priority) in &suffixes {
                    println!("{priority}\t{suffix}");
                }
            }
        }
    }
    Ok(())
}

fn cmd_cache(service: &Service, action: CacheAction) -> error::Result<()> {
    match action {
        CacheAction::Add { path } => {
            service.add_to_cache(&path);
            service.flush()?;
            println!("Recorded use of {path}");
        }
        CacheAction::Remove { path } => {
            service.remove_from_cache(&path);
            service.flush()?;
            println!("Forgot {path}");
        }
        CacheAction::List { count, json } => {
            let paths = service.frequently_used(count);
            if json {
                println!("{}", serde_json::to_string_pretty(&paths)?);
            } else if paths.is_empty() {
                println!("No frequently used paths.");
            } else {
                for path in &paths {
                    println!("{path}");
                }
            }
        }
    }
    Ok(())
}

fn cmd_config(
    data_dir: &DataDir,
    mut config: Config,
    action: ConfigAction,
) -> error::Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            return Ok(());
        }
        ConfigAction::SetDisks { roots } => {
            let mut disks = Vec::with_capacity(roots.len());
            for root in roots {
                if !root.is_dir() {
                    return Err(Error::Config(format!(
                        "not a directory: {}",
                        root.display()
                    )));
                }
                let root = root.canonicalize()?;
                println!(
                    "Monitoring {} as disk {}",
                    root.display(),
                    shard::disk_id(&root)
                );
                disks.push(root);
            }
            config.disks = disks;
        }
        ConfigAction::SetIgnore { paths } => {
            config.ignore_paths = paths;
        }
    }
    config.validate()?.save(&data_dir.settings_file())?;
    println!("Saved {}", data_dir.settings_file().display());
    Ok(())
}

fn cmd_status(service: &Service, json: bool) -> error::Result<()> {
    let report = service.report();
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("Status: {:?}", report.status);
    println!("Disks: {}", report.disks.join(", "));
    println!("Pending writes: {}", report.pending_writes);
    println!("Search tasks: {}", report.tasks);
    println!(
        "Memory cache: {}/{} records",
        report.memory_cache_used, report.memory_cache_budget
    );
    println!("Frequently used paths: {}", report.frequent_paths);
    println!(
        "Accelerator: {}",
        if report.accelerator { "on" } else { "off" }
    );
    if service.needs_rebuild() {
        println!("The index looks empty; run `pathdex rebuild`.");
    }
    Ok(())
}
