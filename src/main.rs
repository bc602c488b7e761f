use clap::Parser;
use cpm::cpm_config::Cli;
use cpm::cpm_controllers::CPMControllers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Set up panic hook for better error messages
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("\n{}", "═".repeat(70));
        eprintln!("❌ APPLICATION PANIC");
        eprintln!("{}", "═".repeat(70));
        eprintln!("\nThe application encountered an unexpected error:");
        eprintln!("{}", panic_info);
        eprintln!("\n💡 Troubleshooting:");
        eprintln!("  • Run again with RUST_LOG=debug for details");
        eprintln!("  • Check your internet connection and https://www.cp.pt/");
        eprintln!("  • Report this issue if it persists");
        eprintln!("\n{}", "═".repeat(70));
    }));

    // A missing .env file is fine
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    CPMControllers::run(cli).await
}
