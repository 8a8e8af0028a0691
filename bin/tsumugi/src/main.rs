use clap::Parser;
use tsumugi_cli::TsumugiArgs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = TsumugiArgs::parse();

    let level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let mut logger = pretty_env_logger::formatted_builder();
    logger.filter_level(level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        logger.parse_filters(&filters);
    }
    logger.init();

    let code = args.run().await?;
    std::process::exit(code);
}
