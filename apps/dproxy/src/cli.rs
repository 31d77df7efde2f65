use clap::Parser;

#[derive(Parser)]
#[command(name = "dproxy", about = "LLM reverse proxy with interaction capture")]
pub(crate) struct Cli {
    #[arg(long, default_value_t = 8080)]
    pub(crate) port: u16,
    #[arg(long, default_value = "INFO", value_parser = ["DEBUG", "INFO", "WARNING", "ERROR"])]
    pub(crate) log_level: String,
}
