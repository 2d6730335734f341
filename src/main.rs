mod cli;

use clap::Parser;
use cli::{Cli, Commands, GetArgs};
use grail_access::access::ProtocolApi;
use grail_access::config::{Config, config_path};
use grail_access::fetch::{Fetched, fetch_all};
use grail_access::observability::init_tracing;
use grail_access::protocols::Request;
use grail_access::proxy::seed_from_process_env;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "grail-fetch failed");
            eprintln!("grail-fetch: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, BoxError> {
    let (mut config, path) = load_config(cli.config)?;
    init_tracing(&config.logging.filter);

    if seed_from_process_env(&mut config.proxies) {
        config.save_to_path(&path)?;
    }

    match cli.command {
        Commands::Get(args) => get(&config, args),
        Commands::Proxy(args) => {
            let api = ProtocolApi::from_config(&config);
            let decision = api.route(&args.url)?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(explicit: Option<PathBuf>) -> Result<(Config, PathBuf), BoxError> {
    match explicit {
        Some(path) => Ok((Config::load_from_path(&path)?, path)),
        None => Ok((Config::load()?, config_path())),
    }
}

fn get(config: &Config, args: GetArgs) -> Result<ExitCode, BoxError> {
    let chunk_size = args.chunk_size.unwrap_or(config.fetch.chunk_size).as_usize().max(1);
    let requests: Vec<Request> = args.urls.iter().map(Request::get).collect();

    let mut api = ProtocolApi::from_config(config);
    let results = fetch_all(&mut api, &requests, chunk_size);

    let mut stdout = std::io::stdout().lock();
    let mut failed = false;
    for result in results {
        match result {
            Ok(fetched) => write_fetched(&mut stdout, &fetched, args.include)?,
            Err(err) => {
                failed = true;
                eprintln!("grail-fetch: {err}");
            }
        }
    }
    stdout.flush()?;

    let snapshot = api.metrics().snapshot();
    tracing::info!(
        opened = snapshot.sessions_opened,
        proxied = snapshot.sessions_proxied,
        failed = snapshot.sessions_failed,
        bytes = snapshot.bytes_delivered,
        "Fetch finished"
    );

    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

fn write_fetched(out: &mut impl Write, fetched: &Fetched, include: bool) -> std::io::Result<()> {
    let mut head = format!("{} {}\n", fetched.meta.status, fetched.meta.reason);
    for (name, value) in &fetched.meta.headers {
        head.push_str(&format!("{name}: {value}\n"));
    }

    if include {
        out.write_all(head.as_bytes())?;
        out.write_all(b"\n")?;
    } else {
        eprint!("{}\n{head}", fetched.url);
    }
    out.write_all(&fetched.body)
}
