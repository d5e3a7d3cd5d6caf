//! Routing monitor.
//!
//! Dumps the kernel's routes and rules, then prints route notifications as
//! they arrive. Needs `CAP_NET_ADMIN` only with `--interface`, which also
//! puts the interface under per-device table management for the duration of
//! the run.
//!
//! Usage:
//!   cargo run --example monitor -- [--duration <secs>] [--interface <index> --name <ifname>]
//!
//! Examples:
//!   cargo run --example monitor                          # Watch for 60 seconds
//!   cargo run --example monitor -- -d 10                 # Watch for 10 seconds
//!   sudo cargo run --example monitor -- -i 2 -n eth0     # Manage eth0 while watching

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use policyroute::{
    Error, Groups, IpFamily, Mode, RouteEntry, RoutingConfig, RoutingPolicyEntry, RoutingService,
    RtnlEntity, RtnlHandler, RtnlMessage, RtnlSocket,
};

/// Watch kernel routing traffic
#[derive(Parser, Debug)]
#[command(name = "policyroute-monitor")]
#[command(about = "Print kernel route and rule changes")]
struct Args {
    /// How long to watch, in seconds
    #[arg(short, long, default_value_t = 60)]
    duration: u64,

    /// Interface index to register with the routing service
    #[arg(short, long, requires = "name")]
    interface: Option<i32>,

    /// Interface name matching --interface
    #[arg(short, long)]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging (compact single-line format)
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("policyroute=info".parse()?),
        )
        .init();

    let args = Args::parse();

    println!("Policy Routing Monitor");
    println!("======================");
    println!();

    let routing = match (args.interface, &args.name) {
        (Some(index), Some(name)) => {
            let routing = RoutingService::start(RoutingConfig::default()).await?;
            routing.register_device(index, name).await?;
            println!("Managing {} (index {}) in table {}", name, index, routing.per_device_table(index).await?);
            Some((routing, index, name.clone()))
        }
        _ => None,
    };

    // Rule changes are only visible through the dumps below.
    let mut socket = RtnlSocket::new();
    socket.start(Groups::routing())?;
    let socket = Arc::new(socket);
    let rtnl = RtnlHandler::new(socket.clone());
    for family in IpFamily::ALL {
        rtnl.send_message(RtnlMessage::new(
            Mode::Get,
            RtnlEntity::route(0, RouteEntry::default_route(family)),
        ))?;
        rtnl.send_message(RtnlMessage::new(
            Mode::Get,
            RtnlEntity::rule(RoutingPolicyEntry::new(family)),
        ))?;
    }

    println!("Watching for {} seconds...", args.duration);
    println!();

    let watch = Duration::from_secs(args.duration);
    let result = socket
        .wait_for(watch, |msg| {
            print_message(&msg);
            false
        })
        .await;
    match result {
        Ok(()) | Err(Error::Timeout) => {}
        Err(e) => return Err(e.into()),
    }

    if let Some((routing, index, name)) = routing {
        if let Some(route) = routing.get_default_route(index, IpFamily::V4).await? {
            println!("Default IPv4 route of {}: {}", name, route);
        }
        routing.clear(index, &name).await?;
    }

    println!();
    println!("Done.");
    Ok(())
}

fn print_message(msg: &RtnlMessage) {
    match &msg.entity {
        RtnlEntity::Route {
            interface_index,
            entry,
        } => println!("[{}] route dev {}: {}", msg.mode, interface_index, entry),
        RtnlEntity::Rule { entry, .. } => println!("[{}] rule: {}", msg.mode, entry),
        RtnlEntity::Error { errno } if *errno != 0 => {
            println!("[error] seq {}: {}", msg.seq, std::io::Error::from_raw_os_error(*errno))
        }
        _ => {}
    }
}
