//! Demo entry point: serves `<cwd>/resources` with the stock configuration.

use hearth::server::{Config, Server};
use log::error;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = Config::default();
    if let Some(arg) = std::env::args().nth(1) {
        match arg.parse() {
            Ok(port) => config.port = port,
            Err(_) => {
                eprintln!("usage: hearth [port]");
                std::process::exit(2);
            }
        }
    }

    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = server.run() {
        error!("{err}");
        std::process::exit(1);
    }
}
