use std::{net::IpAddr, num::NonZeroUsize, path::PathBuf, process::ExitCode};

use anyhow::Context;
use clap::Parser;
use ssh_tarpit::{
    Config, Endpoint, Tarpit,
    config::{self, DEFAULT_MAX_CLIENTS, Privileges},
    listener::{self, BoundListeners},
    system::{self, Forked},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Holds SSH scanners on fake banners until they give up")]
struct Cli {
    /// Port and decoy banner, e.g. `2222=SSH-2.0-OpenSSH_5.3`. Repeatable.
    /// `\r`, `\n`, `\t` and `\\` are decoded; `\r\n` is appended when the
    /// banner has no line terminator.
    #[arg(short, long = "listen", value_name = "PORT=BANNER")]
    listen: Vec<Endpoint>,

    /// Address to bind every port on. Repeatable. Defaults to a dual-stack `::`.
    #[arg(short, long = "bind", value_name = "ADDR")]
    bind: Vec<IpAddr>,

    /// Connections held at once before the oldest is dropped.
    #[arg(short = 'n', long, default_value_t = DEFAULT_MAX_CLIENTS)]
    max_clients: NonZeroUsize,

    /// User (name or uid) to switch to after binding.
    #[arg(long)]
    user: Option<String>,

    /// Group (name or gid) to switch to after binding. Defaults to the user's group.
    #[arg(long)]
    group: Option<String>,

    /// Directory to chroot into after binding, e.g. `/var/empty`.
    #[arg(long)]
    chroot: Option<PathBuf>,

    /// Fork into the background once the sockets are bound.
    #[arg(short, long)]
    daemon: bool,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> Config {
        let defaults = Config::default();
        Config {
            endpoints: if self.listen.is_empty() {
                config::default_endpoints()
            } else {
                self.listen
            },
            bind_addrs: if self.bind.is_empty() {
                defaults.bind_addrs
            } else {
                self.bind
            },
            max_clients: self.max_clients,
            privileges: Privileges {
                user: self.user,
                group: self.group,
                chroot: self.chroot,
            },
            daemonize: self.daemon,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    match run(cli.into_config()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("[!] {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    for endpoint in config.endpoints.iter().filter(|e| !e.looks_like_ssh()) {
        warn!(?endpoint, "banner does not look like an SSH identification line");
    }

    system::ensure_descriptor_budget(config.socket_count(), config.max_clients.get())?;
    let bound = listener::bind(&config)?;
    info!(
        sockets = bound.len(),
        max_clients = config.max_clients.get(),
        addrs = ?bound.local_addrs(),
        "listening"
    );

    if !config.privileges.is_empty() {
        system::drop_privileges(&config.privileges).context("dropping privileges")?;
    }
    if config.daemonize {
        if let Forked::Parent(pid) = system::daemonize()? {
            info!(%pid, "daemon started");
            return Ok(());
        }
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(serve(bound, config.max_clients))
}

async fn serve(bound: BoundListeners, max_clients: NonZeroUsize) -> anyhow::Result<()> {
    let listeners = bound.register()?;
    match Tarpit::new(listeners, max_clients).run().await {
        Ok(never) => match never {},
        Err(err) => Err(err).context("tarpit loop stopped"),
    }
}
