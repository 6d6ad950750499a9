use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clone_store::{open_registry, CloneRecord, CloneRegistry, CloneStoreConfig};
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
    "Usage:\n  clone-store [--config <path>] [-v] sources\n  clone-store [--config <path>] [-v] create <identifier> <display-name>\n  clone-store [--config <path>] [-v] list [--recover]\n  clone-store [--config <path>] [-v] remove <clone-id>\n  clone-store [--config <path>] [-v] rename <clone-id> <display-name>\n  clone-store [--config <path>] [-v] reconcile [--repair]\n  clone-store [--config <path>] [-v] purge-orphans\n  clone-store [--config <path>] [-v] status"
}

struct GlobalArgs {
    config: Option<PathBuf>,
    verbose: bool,
    rest: Vec<String>,
}

fn parse_global(args: Vec<String>) -> Result<GlobalArgs> {
    let mut config = None;
    let mut verbose = false;
    let mut rest = Vec::new();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let Some(path) = iter.next() else {
                    bail!("--config needs a path\n{}", usage());
                };
                config = Some(PathBuf::from(path));
            }
            "-v" | "--verbose" => verbose = true,
            _ => rest.push(arg),
        }
    }
    Ok(GlobalArgs {
        config,
        verbose,
        rest,
    })
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "clone_store=debug"
    } else {
        "clone_store=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> Result<()> {
    let global = parse_global(std::env::args().skip(1).collect())?;
    init_tracing(global.verbose);

    let config = CloneStoreConfig::discover(global.config.as_deref())?;
    let registry = open_registry(&config)?;
    let args: Vec<&str> = global.rest.iter().map(String::as_str).collect();

    match args.as_slice() {
        ["sources"] => list_sources(&registry),
        ["create", identifier, display_name] => create(&registry, identifier, display_name),
        ["list"] => list(&registry, false),
        ["list", "--recover"] => list(&registry, true),
        ["remove", clone_id] => {
            registry
                .remove_clone(clone_id)
                .with_context(|| format!("removing clone '{clone_id}'"))?;
            println!("removed {clone_id}");
            Ok(())
        }
        ["rename", clone_id, display_name] => {
            let record = registry
                .rename_clone(clone_id, display_name)
                .with_context(|| format!("renaming clone '{clone_id}'"))?;
            print_record(&record);
            Ok(())
        }
        ["reconcile"] => {
            for record in registry.scan_storage()? {
                print_record(&record);
            }
            Ok(())
        }
        ["reconcile", "--repair"] => {
            let adopted = registry.repair()?;
            println!("adopted {} clone(s)", adopted.len());
            for record in &adopted {
                print_record(record);
            }
            Ok(())
        }
        ["purge-orphans"] => {
            let removed = registry.purge_orphans()?;
            for path in &removed {
                println!("purged {}", path.display());
            }
            println!("purged {} orphan directory(ies)", removed.len());
            Ok(())
        }
        ["status"] => {
            let status = registry.status();
            println!("root:    {}", status.root.display());
            println!("clones:  {}", status.clones);
            println!("payload: {} bytes", status.payload_bytes);
            Ok(())
        }
        _ => bail!(usage()),
    }
}

fn list_sources(registry: &CloneRegistry) -> Result<()> {
    for source in registry.list_cloneable_sources()? {
        let protected = if source.is_protected { " [protected]" } else { "" };
        println!(
            "{}\t{}\t{}{}",
            source.identifier, source.display_name, source.version_label, protected
        );
    }
    Ok(())
}

fn create(registry: &CloneRegistry, identifier: &str, display_name: &str) -> Result<()> {
    let Some(source) = registry.find_source(identifier)? else {
        bail!("no source named '{identifier}' in the inventory");
    };
    let record = registry
        .create_clone(&source, display_name)
        .with_context(|| format!("cloning '{identifier}'"))?;
    print_record(&record);
    Ok(())
}

fn list(registry: &CloneRegistry, recover: bool) -> Result<()> {
    let mut records = registry.list_clones();
    if records.is_empty() && recover {
        tracing::info!(root = %registry.root().display(), "metadata empty, scanning storage root");
        records = registry.scan_storage()?;
    }
    for record in &records {
        print_record(record);
    }
    Ok(())
}

fn print_record(record: &CloneRecord) {
    let created = record
        .created_at
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| record.created_at.unix_timestamp().to_string());
    println!(
        "{}\t{}\t{}\t{} bytes\t{}",
        record.clone_id,
        record.display_name,
        created,
        record.payload_size_bytes,
        record.storage_path.display()
    );
}
