mod cli;
mod config;
mod logging;

use clap::Parser;
use color_eyre::Result;

use offline_gateway::db::Database;

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = cli::Args::parse();

  // Load configuration; a --base-url alone is enough to run
  let mut config = config::Config::load(args.config.as_deref(), args.base_url.is_some())?;
  if let Some(base_url) = &args.base_url {
    config.backend.base_url = Some(base_url.clone());
  }

  let db_path = match &config.storage.path {
    Some(path) => path.clone(),
    None => Database::default_path()?,
  };
  let _log_guard = logging::init(args.verbose, db_path.parent());

  let app = cli::App::build(&config, &db_path, args.offline)?;
  app.run(args.command).await
}
