//! wxindex binary entrypoint.

fn main() {
    if let Err(err) = wxindex_cli::app::run() {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
