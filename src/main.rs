use anyhow::{bail, Context, Result};
use download_cache::logging::CacheLogger;
use download_cache::{CacheConfig, CacheManager};
use futures_util::future::join_all;
use std::path::PathBuf;

const USAGE: &str = "usage: download-cache [--dir <path>] [--config <file.json>] <url>...";

struct Args {
    dir: Option<PathBuf>,
    config: Option<PathBuf>,
    urls: Vec<String>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        dir: None,
        config: None,
        urls: Vec::new(),
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--dir" => args.dir = Some(iter.next().context("--dir needs a path")?.into()),
            "--config" => {
                args.config = Some(iter.next().context("--config needs a path")?.into())
            }
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            flag if flag.starts_with("--") => bail!("unknown option {}\n{}", flag, USAGE),
            _ => args.urls.push(arg),
        }
    }

    if args.urls.is_empty() {
        bail!("no urls given\n{}", USAGE);
    }
    Ok(args)
}

fn build_config(args: &Args) -> Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => CacheConfig::for_app("download-cache")?,
    };
    if let Some(dir) = &args.dir {
        config.root_dir = dir.clone();
    }
    config.apply_env_overrides()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;
    let config = build_config(&args)?;

    if let Some(logs) = &config.logs {
        if let Err(e) = CacheLogger::init(logs.log_file.clone(), logs.error_file.clone()) {
            eprintln!("Failed to initialize logger: {}", e);
        }
    }

    let cache = CacheManager::with_http(config)?;

    let handles: Vec<_> = args.urls.iter().map(|url| cache.get(url, None)).collect();
    let results = join_all(handles.iter().map(|handle| handle.file())).await;

    let mut failed = 0;
    for ((url, handle), result) in args.urls.iter().zip(&handles).zip(results) {
        match result {
            Ok(path) => println!("{} -> {}", url, path.display()),
            Err(e) => {
                failed += 1;
                eprintln!("{} failed: {}", url, e);
            }
        }
        cache.release(handle);
    }

    let report = cache.sweep();
    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("{}", serde_json::to_string_pretty(&cache.statistics())?);

    CacheLogger::shutdown();
    if failed > 0 {
        bail!("{} of {} downloads failed", failed, args.urls.len());
    }
    Ok(())
}
