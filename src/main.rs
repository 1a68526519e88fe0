mod cli;

use clap::Parser;
use cli::{Cli, Commands, GetArgs, GroupArgs};
use courier::batch::BatchRequest;
use courier::chain::ChainRequest;
use courier::config::Config;
use courier::manager::RequestManager;
use courier::request::{CachePolicy, Request, RequestConfig, ResponseSerializer, RetryLimits};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "courier=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = match cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    let manager = RequestManager::from_config(config)?;

    match cli.command {
        Commands::Get(args) => get(&manager, args).await?,
        Commands::Batch(args) => batch(&manager, args).await?,
        Commands::Chain(args) => chain(&manager, args).await?,
    }

    manager.flush().await;
    Ok(())
}

async fn get(manager: &RequestManager, args: GetArgs) -> Result<(), BoxError> {
    let mut cache = match args.cache_ttl {
        Some(ttl) => CachePolicy::with_ttl(ttl).preloaded(),
        None => CachePolicy::default(),
    };
    // Preview and live response print in order
    cache.write_async = Some(false);

    let retry = args.retry.map(|count| RetryLimits {
        count,
        interval: Duration::from_millis(args.retry_interval_ms),
        timeout: None,
    });

    let config = RequestConfig::builder()
        .path(args.path)
        .response_serializer(ResponseSerializer::Raw)
        .cache(cache)
        .maybe_retry(retry)
        .maybe_download_path(args.output.clone())
        .build();

    let request = Request::new(manager, config);
    request.on_success(|r| {
        if r.is_data_from_cache() {
            eprintln!("(cached)");
            if let Some(body) = r.response_string() {
                println!("{body}");
            }
        }
    });

    let payload = request.send().await?;
    match payload.file_path() {
        Some(path) => eprintln!("saved to {}", path.display()),
        None => match payload.text() {
            Some(text) => println!("{text}"),
            None => eprintln!("{} bytes of binary data", payload.data().len()),
        },
    }
    eprintln!(
        "status {} after {} attempt(s) in {:?}",
        request.status_code().unwrap_or_default(),
        request.attempts(),
        request.total_elapsed()
    );

    Ok(())
}

fn group_requests(manager: &RequestManager, paths: Vec<String>) -> Vec<Request> {
    paths
        .into_iter()
        .map(|path| {
            Request::new(
                manager,
                RequestConfig::builder()
                    .path(path)
                    .response_serializer(ResponseSerializer::Raw)
                    .build(),
            )
        })
        .collect()
}

fn print_summary(requests: &[Request]) {
    for request in requests {
        let outcome = match request.error() {
            Some(error) => error.to_string(),
            None if request.is_finished() => "ok".to_string(),
            None => format!("{:?}", request.state()).to_lowercase(),
        };
        println!(
            "{:>3} {} {}",
            request
                .status_code()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
            request.config().path,
            outcome
        );
    }
}

async fn batch(manager: &RequestManager, args: GroupArgs) -> Result<(), BoxError> {
    let batch = BatchRequest::new(manager, group_requests(manager, args.paths));
    batch.stopped_on_failure(!args.keep_going);

    let outcome = batch.send().await;
    print_summary(batch.requests());
    outcome?;
    Ok(())
}

async fn chain(manager: &RequestManager, args: GroupArgs) -> Result<(), BoxError> {
    let chain = ChainRequest::new(manager);
    chain.stopped_on_failure(!args.keep_going);
    for request in group_requests(manager, args.paths) {
        chain.add_request(request);
    }

    let outcome = chain.send().await;
    print_summary(&chain.requests());
    outcome?;
    Ok(())
}
