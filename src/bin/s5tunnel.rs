//! s5tunnel Binary
//!
//! Usage: s5tunnel <COMMAND> [ARGS]
//!
//! Commands:
//!   local <port> <peer_host> <peer_port>  Run the local agent
//!   server <port>                         Run the server agent
//!   -c, --config <FILE>                   Run from a configuration file
//!   -g, --generate [local|server]         Print a configuration template
//!   -h, --help                            Print help information

use std::env;

use s5tunnel::{ProxyConfig, ProxyConfigFile, Reactor, DEFAULT_LOCAL_PORT, DEFAULT_SERVER_PORT};

fn main() -> anyhow::Result<()> {
    // Initialize tracing; respects RUST_LOG (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-g" | "--generate" => {
            generate_config(args.get(2).map(String::as_str))?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            let config = ProxyConfigFile::load(&args[2])?.to_config()?;
            run(config)?;
        }
        "local" => {
            if args.len() < 5 {
                eprintln!("Error: local requires <port> <peer_host> <peer_port>");
                return Ok(());
            }
            let port = parse_port(&args[2])?;
            let peer_port = parse_port(&args[4])?;
            run(ProxyConfig::local(port, args[3].as_str(), peer_port))?;
        }
        "server" => {
            if args.len() < 3 {
                eprintln!("Error: server requires <port>");
                return Ok(());
            }
            run(ProxyConfig::server(parse_port(&args[2])?))?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"s5tunnel - two-sided SOCKS5 tunnel

USAGE:
    s5tunnel <COMMAND> [ARGS]

COMMANDS:
    local <port> <peer_host> <peer_port>   Accept SOCKS5 clients and tunnel to a server agent
    server <port>                          Accept tunnel connections and dial targets
    -c, --config <FILE>                    Run from a TOML or JSON configuration file
    -g, --generate [local|server]          Print a configuration template
    -h, --help                             Print help information

EXAMPLES:
    Run a server agent:
        s5tunnel server 9000

    Run a local agent pointing at it:
        s5tunnel local 1080 127.0.0.1 9000

    Generate and use a configuration:
        s5tunnel --generate local > local.toml
        s5tunnel --config local.toml
"#
    );
}

fn parse_port(value: &str) -> anyhow::Result<u16> {
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid port {:?}: {}", value, e))
}

fn generate_config(role: Option<&str>) -> anyhow::Result<()> {
    let config = match role.unwrap_or("local") {
        "local" => ProxyConfig::local(DEFAULT_LOCAL_PORT, "127.0.0.1", DEFAULT_SERVER_PORT),
        "server" => ProxyConfig::server(DEFAULT_SERVER_PORT),
        other => anyhow::bail!("unknown role {:?} (expected local or server)", other),
    };

    let config_file = ProxyConfigFile::from_config(&config);

    println!("# s5tunnel {} agent configuration", config.role.mode());
    println!("# Optional: dial_timeout_secs, handshake_timeout_secs");
    println!();
    println!("{}", config_file.to_toml()?);

    Ok(())
}

fn run(config: ProxyConfig) -> anyhow::Result<()> {
    tracing::info!(
        "Starting s5tunnel {} agent on {}",
        config.role.mode(),
        config.bind_address()
    );

    let reactor = Reactor::bind(config)?;
    reactor.run()?;

    Ok(())
}
