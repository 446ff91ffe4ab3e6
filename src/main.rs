mod checksum;
mod cli;
mod client;
mod daemon;
mod emulation;
mod error;
mod forwarder;
mod icmp_endpoint;
mod ip;
mod peer;
mod privs;
mod protocol;
mod resolve;
mod server;
mod signal;
mod tun;

use crossterm::style::Stylize;
use rand::Rng;

use cli::Options;
use client::Client;
use error::AppError;
use icmp_endpoint::{IcmpEndpoint, Role};
use server::Server;
use tun::TunDevice;

fn run() -> Result<(), AppError> {
    let opts = Options::from_args()?;

    signal::install().map_err(AppError::Signal)?;

    if opts.server {
        run_server(&opts)
    } else {
        run_client(&opts)
    }
}

fn run_server(opts: &Options) -> Result<(), AppError> {
    let mut endpoint = IcmpEndpoint::open(Role::Server, opts.mtu, opts.ttl_hops)?;
    let mut tun = TunDevice::open(opts.mtu)?;

    println!(
        "{} {} (mtu {})",
        "server listening on".green(),
        tun.name().bold(),
        tun.mtu()
    );

    if endpoint.using_user_space_filter() {
        eprintln!(
            "{}",
            "kernel icmp filter unavailable, falling back to user-space filtering".yellow()
        );
    }

    if let Some(user) = &opts.user {
        privs::drop_privs(user)?;
    }

    if opts.daemon {
        daemon::daemonize()?;
    }

    let mut server = Server::new(opts);
    forwarder::run(&mut endpoint, &mut tun, &mut server)?;
    Ok(())
}

fn run_client(opts: &Options) -> Result<(), AppError> {
    let host = opts
        .host
        .as_deref()
        .expect("cli parsing guarantees a host in client mode");

    let server_ip = resolve::resolve_host(host)?;

    let mut endpoint = IcmpEndpoint::open(Role::Client, opts.mtu, opts.ttl_hops)?;
    let mut tun = TunDevice::open(opts.mtu)?;

    println!(
        "{} {} -> {} (mtu {})",
        "client on".green(),
        tun.name().bold(),
        server_ip,
        tun.mtu()
    );

    if endpoint.using_user_space_filter() {
        eprintln!(
            "{}",
            "kernel icmp filter unavailable, falling back to user-space filtering".yellow()
        );
    }

    if let Some(user) = &opts.user {
        privs::drop_privs(user)?;
    }

    let mut rng = rand::thread_rng();
    let id = opts.id.unwrap_or_else(|| rng.gen());
    let initial_seq = rng.gen();

    let mut client = Client::new(server_ip, id, initial_seq, opts);
    client.start(&mut endpoint)?;

    forwarder::run(&mut endpoint, &mut tun, &mut client)?;
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{} {}", "error:".red().bold(), err);
        std::process::exit(1);
    }
}
