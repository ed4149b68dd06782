use std::env;
use std::fs::metadata;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::CommandFactory;
use clap::Parser;
use clap::Subcommand;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use strum::EnumString;
use tidemark::store::Store;
use tidemark::tree::Timestamp;
use tidemark::tree::TIME_MAX;
use tidemark::Value;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Store location
    store: String,

    /// Create a new store (fails if the file exists)
    #[arg(short, long, default_value_t = false)]
    create: bool,

    /// Root block capacity in bytes
    #[arg(short, long, default_value_t = 16_384)]
    block_size: u32,

    /// Answer queries as of this timestamp (milliseconds since epoch)
    #[arg(short, long)]
    as_of: Option<Timestamp>,

    #[command(subcommand)]
    parameter: Option<Parameter>,
}

#[derive(Debug, EnumString, Subcommand)]
#[strum(ascii_case_insensitive)]
enum Parameter {
    /// Append a value to this key's history
    Add { key: String, value: String },
    /// Soft-delete every key
    Clear,
    /// Soft-delete this key's history
    ClearKey { key: String },
    /// Does the store hold a live value for this key
    Contains { key: String },
    /// List live key/value pairs
    Entries,
    /// Get this key's live value
    Get { key: String },
    /// Interactive Help
    Help,
    /// Show this key's full history, deleted entries included
    History { key: String },
    /// List live keys
    Keys,
    /// Soft-delete one value from this key's history
    Remove { key: String, value: String },
    /// Replace this key's value
    Set { key: String, value: String },
    /// Count keys with a live value
    Size,
    /// Count keys ever stored
    TotalSize,
}

fn get_history_file() -> Option<PathBuf> {
    dirs::preference_dir()
        .and_then(|mut base| {
            base.push("tidemark");
            // Note: Not create_dir_all(), because we don't want to create preference
            // dirs if they don't exist.
            if metadata(base.clone()).ok().is_none() {
                std::fs::create_dir(base.clone()).ok()?
            }
            Some(base)
        })
        .map(|mut base| {
            base.push("history.txt");
            base
        })
}

async fn interactive(store: Store, as_of: Option<Timestamp>) -> Result<()> {
    let mut rl = DefaultEditor::new()?;
    if let Some(file_location) = get_history_file() {
        if let Err(e) = rl.load_history(&file_location) {
            println!("error loading history: {e}");
        }
    }
    println!("terminate with ctrl-c or ctrl-d");
    loop {
        let readline = rl.readline("mark: ");
        match readline {
            Ok(line) => {
                if line.is_empty() {
                    continue;
                }
                // EnumString doesn't deal with variant parameters, so...
                let words = line.split_whitespace().collect::<Vec<&str>>();
                let parameter = match Parameter::from_str(words[0]) {
                    Ok(p) => match p {
                        Parameter::Add { .. } => {
                            if words.len() != 3 {
                                println!("usage: add <key> <value>");
                                continue;
                            }
                            Parameter::Add {
                                key: words[1].to_string(),
                                value: words[2].to_string(),
                            }
                        }
                        Parameter::ClearKey { .. } => {
                            if words.len() != 2 {
                                println!("usage: clearkey <key>");
                                continue;
                            }
                            Parameter::ClearKey {
                                key: words[1].to_string(),
                            }
                        }
                        Parameter::Contains { .. } => {
                            if words.len() != 2 {
                                println!("usage: contains <key>");
                                continue;
                            }
                            Parameter::Contains {
                                key: words[1].to_string(),
                            }
                        }
                        Parameter::Get { .. } => {
                            if words.len() != 2 {
                                println!("usage: get <key>");
                                continue;
                            }
                            Parameter::Get {
                                key: words[1].to_string(),
                            }
                        }
                        Parameter::History { .. } => {
                            if words.len() != 2 {
                                println!("usage: history <key>");
                                continue;
                            }
                            Parameter::History {
                                key: words[1].to_string(),
                            }
                        }
                        Parameter::Remove { .. } => {
                            if words.len() != 3 {
                                println!("usage: remove <key> <value>");
                                continue;
                            }
                            Parameter::Remove {
                                key: words[1].to_string(),
                                value: words[2].to_string(),
                            }
                        }
                        Parameter::Set { .. } => {
                            if words.len() != 3 {
                                println!("usage: set <key> <value>");
                                continue;
                            }
                            Parameter::Set {
                                key: words[1].to_string(),
                                value: words[2].to_string(),
                            }
                        }
                        p => p,
                    },
                    Err(_) => {
                        println!("unknown command: {}", words[0]);
                        continue;
                    }
                };
                let _ = rl.add_history_entry(line.as_str());
                process_parameter(&store, &parameter, as_of).await;
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }
    if let Some(file_location) = get_history_file() {
        if let Err(e) = rl.save_history(&file_location) {
            println!("error saving history: {e}");
        }
    }
    store.close().await
}

async fn process_parameter(store: &Store, parameter: &Parameter, as_of: Option<Timestamp>) {
    let time = as_of.unwrap_or(TIME_MAX);
    match parameter {
        Parameter::Add { key, value } => {
            let (k, v) = (key.clone(), value.clone());
            let result = store
                .transaction(move |tx| async move {
                    let at = tx.timestamp();
                    Ok(tx.root().add(&Value::from(k), Value::from(v), at))
                })
                .await;
            match result {
                Ok(_) => println!("added: {key}: {value}"),
                Err(e) => println!("add failed: {e}"),
            }
        }
        Parameter::Clear => {
            let result = store
                .transaction(move |tx| async move {
                    let at = tx.timestamp();
                    Ok(tx.root().clear(at))
                })
                .await;
            match result {
                Ok(_) => println!("cleared"),
                Err(e) => println!("clear failed: {e}"),
            }
        }
        Parameter::ClearKey { key } => {
            let k = key.clone();
            let result = store
                .transaction(move |tx| async move {
                    let at = tx.timestamp();
                    Ok(tx.root().clear_entry(&Value::from(k), at))
                })
                .await;
            match result {
                Ok(_) => println!("cleared: {key}"),
                Err(e) => println!("clear failed: {e}"),
            }
        }
        Parameter::Contains { key } => {
            if store.snapshot().contains_key(&Value::from(key.as_str()), time) {
                println!("true");
            } else {
                println!("false");
            }
        }
        Parameter::Entries => {
            let mut sep = "";
            for (key, value) in store.snapshot().entries(time) {
                print!("{sep}{key}:{value}");
                sep = ", ";
            }
            println!();
        }
        Parameter::Get { key } => match store.snapshot().get(&Value::from(key.as_str()), time) {
            Some(value) => println!("{value}"),
            None => println!("not found"),
        },
        Parameter::Help => {
            let help = Cli::command().render_help().to_string();

            let mut print_it = false;

            for line in help.lines() {
                if line.starts_with("Arguments:") {
                    print_it = false;
                }
                if print_it && !line.is_empty() {
                    println!("{}", line);
                }
                if line.starts_with("Commands:") {
                    print_it = true;
                }
            }
        }
        Parameter::History { key } => {
            match store.snapshot().history(&Value::from(key.as_str())) {
                Some(history) => {
                    for entry in history.entries() {
                        if entry.deleted_at == TIME_MAX {
                            println!("{} (created {})", entry.value, entry.created_at);
                        } else {
                            println!(
                                "{} (created {}, deleted {})",
                                entry.value, entry.created_at, entry.deleted_at
                            );
                        }
                    }
                }
                None => println!("not found"),
            }
        }
        Parameter::Keys => {
            let mut sep = "";
            for key in store.snapshot().keys(time) {
                print!("{sep}{key}");
                sep = ", ";
            }
            println!();
        }
        Parameter::Remove { key, value } => {
            let (k, v) = (key.clone(), value.clone());
            let result = store
                .transaction(move |tx| async move {
                    let at = tx.timestamp();
                    Ok(tx.root().remove(&Value::from(k), &Value::from(v), at))
                })
                .await;
            match result {
                Ok(_) => println!("removed: {key}: {value}"),
                Err(e) => println!("remove failed: {e}"),
            }
        }
        Parameter::Set { key, value } => {
            let (k, v) = (key.clone(), value.clone());
            let result = store
                .transaction(move |tx| async move {
                    let at = tx.timestamp();
                    Ok(tx.root().set(&Value::from(k), Value::from(v), at))
                })
                .await;
            match result {
                Ok(_) => println!("set: {key}: {value}"),
                Err(e) => println!("set failed: {e}"),
            }
        }
        Parameter::Size => println!("size: {}", store.snapshot().size(time)),
        Parameter::TotalSize => println!("total size: {}", store.snapshot().total_size()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_dir = match env::var("TMPDIR") {
        Ok(d) => d,
        Err(_e) => ".".to_string(),
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, "tidemark.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt().with_writer(non_blocking).init();

    let store = if cli.create {
        Store::create(&cli.store, cli.block_size).await?
    } else {
        Store::open(&cli.store, cli.block_size).await?
    };

    match cli.parameter {
        Some(parameter) => {
            process_parameter(&store, &parameter, cli.as_of).await;
            store.close().await?;
        }
        None => interactive(store, cli.as_of).await?,
    }
    Ok(())
}
