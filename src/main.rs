//! tub - inspect and edit recorded driving datastores.

#![forbid(unsafe_code)]

use std::io::{self, BufWriter, Write};
use std::path::Path;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tubstore::cli::{self, Commands, IndexArg};
use tubstore::config::Config;
use tubstore::record::to_line;
use tubstore::{Datastore, DatastoreOptions, IndexSet};

fn main() {
    if let Err(err) = main_impl() {
        print_error_with_hints(&err);
        std::process::exit(1);
    }
}

fn main_impl() -> Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let config = Config::load(cli.config.as_deref())?;
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    let result = match cli.command {
        Commands::Info { path } => info(&path, &config, &mut out),
        Commands::Cat {
            path,
            indexed,
            limit,
        } => cat(&path, &config, indexed, limit, &mut out),
        Commands::Get { path, index } => get(&path, &config, index, &mut out),
        Commands::Delete { path, indexes } => {
            edit(&path, &config, &indexes, Datastore::delete_records)
        }
        Commands::Restore { path, indexes } => {
            edit(&path, &config, &indexes, Datastore::restore_records)
        }
    };
    match result.and_then(|()| out.flush().map_err(anyhow::Error::from)) {
        Err(err) if is_broken_pipe(&err) => Ok(()),
        other => other,
    }
}

fn open_read_only(path: &Path, config: &Config) -> Result<Datastore> {
    let options = DatastoreOptions::read_only().with_read_strategy(config.read_strategy());
    Ok(Datastore::open(path, options)?)
}

fn info(path: &Path, config: &Config, out: &mut impl Write) -> Result<()> {
    let mut store = open_read_only(path, config)?;
    writeln!(out, "path:            {}", store.base_path().display())?;
    writeln!(out, "inputs:          {}", to_line(store.inputs())?)?;
    writeln!(out, "types:           {}", to_line(store.types())?)?;
    writeln!(out, "metadata:        {}", to_line(store.metadata())?)?;
    writeln!(out, "records:         {}", store.len())?;
    writeln!(out, "current index:   {}", store.current_index())?;
    writeln!(out, "deleted:         {}", store.deleted_indexes().len())?;
    writeln!(out, "max segment len: {}", store.max_segment_len())?;
    writeln!(out, "segments:        {}", store.segment_paths().len())?;
    for name in store.segment_paths() {
        writeln!(out, "  {name}")?;
    }
    match store.sessions() {
        Some(history) => {
            writeln!(out, "sessions:        {}", history.all_full_ids.len())?;
            for id in &history.all_full_ids {
                writeln!(out, "  {id}")?;
            }
        }
        None => writeln!(out, "sessions:        0")?,
    }
    store.close();
    Ok(())
}

fn cat(
    path: &Path,
    config: &Config,
    indexed: bool,
    limit: Option<usize>,
    out: &mut impl Write,
) -> Result<()> {
    let store = open_read_only(path, config)?;
    let records = store.iter_indexed().take(limit.unwrap_or(usize::MAX));
    for item in records {
        let (index, record) = item?;
        let line = to_line(&record)?;
        if indexed {
            writeln!(out, "{index}\t{line}")?;
        } else {
            writeln!(out, "{line}")?;
        }
    }
    Ok(())
}

fn get(path: &Path, config: &Config, index: u64, out: &mut impl Write) -> Result<()> {
    let store = open_read_only(path, config)?;
    let record = store
        .read_record(index)?
        .with_context(|| format!("record {index} was never written"))?;
    writeln!(out, "{}", to_line(&record)?)?;
    if store.is_deleted(index) {
        tracing::info!(index, "record is marked deleted");
    }
    Ok(())
}

fn edit<F>(path: &Path, config: &Config, indexes: &[IndexArg], apply: F) -> Result<()>
where
    F: FnOnce(&mut Datastore, IndexSet) -> tubstore::Result<()>,
{
    // A writable open would create a missing datastore.
    if !Datastore::exists(path) {
        return Err(tubstore::Error::DatastoreNotFound {
            path: path.display().to_string(),
        }
        .into());
    }
    let mut store = Datastore::open(path, config.datastore_options())?;
    apply(&mut store, cli::expand_indexes(indexes).collect())?;
    store.close();
    Ok(())
}

fn is_broken_pipe(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|io_err| io_err.kind() == io::ErrorKind::BrokenPipe)
    })
}

fn print_error_with_hints(err: &anyhow::Error) {
    for cause in err.chain() {
        if let Some(tub_error) = cause.downcast_ref::<tubstore::Error>() {
            eprint!("{}", tubstore::error_hints::format_error_with_hints(tub_error));
            return;
        }
    }

    eprintln!("{err}");
}
