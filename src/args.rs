use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Port for client commands
    #[arg(long, default_value_t = 5000)]
    #[clap(value_parser = clap::value_parser!(u16).range(1..))]
    pub command_port: u16,
    /// Port for command acknowledgments and payloads
    #[arg(long, default_value_t = 5001)]
    #[clap(value_parser = clap::value_parser!(u16).range(1..))]
    pub response_port: u16,
    /// Port for the live-data push
    #[arg(long, default_value_t = 5002)]
    #[clap(value_parser = clap::value_parser!(u16).range(1..))]
    pub live_data_port: u16,
    /// Host of the Delsys Trigno base station
    #[arg(long, default_value = "127.0.0.1")]
    pub delsys_host: String,
    /// Serial port of the Magstim stimulator; scanned from USB ids when unset
    #[arg(long)]
    pub magstim_port: Option<PathBuf>,
    /// Live-data push cadence (milliseconds)
    #[arg(long, default_value_t = 100)]
    pub live_data_interval: u64,
    /// How long a client may take to bring up its sockets and shake hands
    /// (milliseconds)
    #[arg(long, default_value_t = 5000)]
    pub timeout_period: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_protocol() {
        let cli = Cli::parse_from(["gaitd"]);
        assert_eq!(cli.command_port, 5000);
        assert_eq!(cli.response_port, 5001);
        assert_eq!(cli.live_data_port, 5002);
        assert_eq!(cli.live_data_interval, 100);
        assert_eq!(cli.timeout_period, 5000);
        assert!(cli.magstim_port.is_none());
    }

    #[test]
    fn ports_are_overridable() {
        let cli = Cli::parse_from([
            "gaitd",
            "--command-port",
            "6000",
            "--magstim-port",
            "/dev/ttyUSB0",
        ]);
        assert_eq!(cli.command_port, 6000);
        assert_eq!(
            cli.magstim_port,
            Some(PathBuf::from("/dev/ttyUSB0"))
        );
    }
}
