use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use leasehold::options::OptionCode;
use leasehold::{
    Config, DhcpRequest, DhcpResponse, Error, Handler4, Lease, LeaseEngine, RangeConfig, Result,
};

const MAC_LEN: usize = 6;

#[derive(Parser)]
#[command(name = "leasehold")]
#[command(author, version, about = "DHCPv4 lease engine administration", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration
    ShowConfig,
    /// Build every configured engine and report startup errors
    Check,
    /// List persisted leases
    ListLeases {
        /// Only show this interface
        #[arg(short, long)]
        interface: Option<String>,
    },
    /// Run one lease decision for a hardware address
    Assign {
        #[arg(short, long)]
        interface: String,

        /// Hardware address, e.g. 02:00:c0:a8:01:07
        #[arg(short, long)]
        mac: String,

        #[arg(long)]
        hostname: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;

    match cli.command.unwrap_or(Commands::Check) {
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Check => {
            info!("Checking {} range(s) from {:?}", config.ranges.len(), cli.config);
            for range in &config.ranges {
                let engine = LeaseEngine::new(range.clone()).await?;
                println!(
                    "{:<10} {} - {}  {} lease(s), {} free",
                    engine.interface(),
                    engine.range().start(),
                    engine.range().end(),
                    engine.list_leases().await.len(),
                    engine.free_address_count().await
                );
                engine.close().await?;
            }
            Ok(())
        }
        Commands::ListLeases { interface } => {
            let ranges: Vec<&RangeConfig> = match interface.as_deref() {
                Some(name) => vec![find_range(&config, name)?],
                None => config.ranges.iter().collect(),
            };

            for range in ranges {
                let engine = LeaseEngine::new(range.clone()).await?;
                print_leases(engine.interface(), &engine.list_leases().await);
                engine.close().await?;
            }
            Ok(())
        }
        Commands::Assign {
            interface,
            mac,
            hostname,
        } => {
            let range = find_range(&config, &interface)?;
            let hardware_address = parse_mac(&mac)?;
            let engine = LeaseEngine::new(range.clone()).await?;

            let mut request = DhcpRequest::new(hardware_address);
            if let Some(hostname) = hostname.as_deref() {
                request = request.with_raw_option(OptionCode::Hostname as u8, hostname.as_bytes());
            }
            let (response, _) = engine.handle(&request, DhcpResponse::default()).await;

            match (response.yiaddr, response.lease_time()) {
                (Some(address), Some(seconds)) => {
                    println!("{} -> {} (lease time {}s)", mac, address, seconds)
                }
                _ => println!("{}: no address assigned, see log for details", mac),
            }
            engine.close().await
        }
    }
}

fn find_range<'a>(config: &'a Config, interface: &str) -> Result<&'a RangeConfig> {
    config
        .range(interface)
        .ok_or_else(|| Error::InvalidConfig(format!("no range configured for {}", interface)))
}

fn parse_mac(mac: &str) -> Result<Vec<u8>> {
    let invalid = || Error::InvalidHardwareAddress(format!("invalid MAC address: {:?}", mac));

    let octets = mac
        .split([':', '-'])
        .map(|part| {
            if part.len() != 2 || !part.bytes().all(|byte| byte.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            u8::from_str_radix(part, 16).map_err(|_| invalid())
        })
        .collect::<Result<Vec<u8>>>()?;

    if octets.len() != MAC_LEN {
        return Err(invalid());
    }
    Ok(octets)
}

fn print_leases(interface: &str, leases: &[Lease]) {
    if leases.is_empty() {
        println!("{}: no leases.", interface);
        return;
    }

    println!("{}:", interface);
    println!(
        "{:<20} {:<16} {:<24} {:<10} {}",
        "Client ID", "IP Address", "Expires At", "Remaining", "Hostname"
    );
    println!("{}", "-".repeat(86));

    for lease in leases {
        let remaining = lease.remaining_seconds();
        let remaining_str = if remaining > 0 {
            format!("{}s", remaining)
        } else {
            "expired".to_string()
        };

        println!(
            "{:<20} {:<16} {:<24} {:<10} {}",
            lease.client_id,
            lease.ip_address,
            lease.expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
            remaining_str,
            lease.hostname.as_deref().unwrap_or("-")
        );
    }
}
