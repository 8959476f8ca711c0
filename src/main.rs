use clap::Parser;

fn main() -> pplex::error::Result<()> {
    env_logger::init();
    let args = pplex::Args::parse();

    let stdout = std::io::stdout();
    let stderr = std::io::stderr();
    pplex::run(stdout, stderr, args)
}
