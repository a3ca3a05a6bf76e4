use std::net::SocketAddr;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address the HTTP server should bind to. Use port 0 for an
    /// ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_defaults_to_local_port_8080() {
        let cli = Cli::parse_from(["realtime_hub"]);
        assert_eq!(cli.listen, "127.0.0.1:8080".parse().unwrap());
    }

    #[test]
    fn listen_accepts_ephemeral_port() {
        let cli = Cli::parse_from(["realtime_hub", "--listen", "0.0.0.0:0"]);
        assert_eq!(cli.listen.port(), 0);
    }
}
