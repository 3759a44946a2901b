use clap::Parser;

fn main() {
    let cli = vfetchctl::Cli::parse();
    if let Err(err) = vfetchctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
