use clap::Parser;

fn main() {
    promoctl::init_tracing();
    let cli = promoctl::Cli::parse();
    if let Err(err) = promoctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
