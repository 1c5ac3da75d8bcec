use bred_core::config::Config;
use bred_redirects::{ErrorKind, MergeOptions};
use cli_helpers::prelude::*;
use std::path::PathBuf;

const PAIRS_EXAMPLE: &str = "old,new
/old/path/to/content,/new/path/to/content
/old/path/to/other,/new/path/to/other";

fn main() -> Result<(), Error> {
    let opts: Opts = Opts::parse();
    opts.verbose.init_logging()?;

    let config = opts
        .config
        .as_ref()
        .map(Config::load)
        .transpose()?
        .unwrap_or_default();

    let options = MergeOptions {
        map: opts.map.or(config.document.map),
        backup: opts.backup || config.document.backup,
        dry_run: opts.dry_run,
    };

    match bred_redirects::merge_files(&opts.pairs, &opts.document, &options) {
        Ok(result) => {
            log::info!("Skipped {} existing redirects", result.duplicates());

            if options.dry_run {
                println!("{} redirects would be added.", result.added);
            } else {
                println!("Completed! {} redirects added.", result.added);
            }
        }
        Err(error) => {
            report(&error);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn report(error: &bred_redirects::Error) {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);

    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = std::error::Error::source(cause);
    }

    log::error!("{}", message);

    match error.kind() {
        ErrorKind::NotFound => {
            eprintln!("Either the pairs file or the document could not be found.");
        }
        ErrorKind::MalformedPairsRow => {
            eprintln!("Please use a CSV file with the following format:\n\n{}", PAIRS_EXAMPLE);
        }
        ErrorKind::MalformedDocument => {
            eprintln!("The document is either invalid XML or the wrong type of file.");
        }
        ErrorKind::MissingRewriteMap => {
            eprintln!("The document does not look like a web.config with a rewriteMap section.");
        }
        ErrorKind::AccessDenied | ErrorKind::Other => {}
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("CLI argument reading error")]
    Args(#[from] cli_helpers::Error),
    #[error("Configuration error")]
    Config(#[from] bred_core::Error),
}

#[derive(Debug, Parser)]
#[clap(name = "bred", about, version, author)]
struct Opts {
    #[clap(flatten)]
    verbose: Verbosity,
    /// CSV file of old and new URLs, with a header row
    #[clap(long)]
    pairs: PathBuf,
    /// The web.config file to update in place
    #[clap(long)]
    document: PathBuf,
    /// Name of the rewrite map to update (the first one by default)
    #[clap(long)]
    map: Option<String>,
    /// Copy the document to a .bak file before saving
    #[clap(long)]
    backup: bool,
    /// Report what would be added without changing the document
    #[clap(long)]
    dry_run: bool,
    /// TOML configuration file
    #[clap(long)]
    config: Option<PathBuf>,
}
