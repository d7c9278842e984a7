//! The Supervisor (§4.5): wires the DNS hijack server and reverse proxy together, mutates
//! the resolver file, launches the child process, and forwards signals to it. This is
//! the only module that performs process-level I/O (exec, signals, privilege drop).

use crate::config::{
    RuntimeConfig, DEFAULT_DNS_PORT, DEFAULT_HTTP_PROXY_PORT, DEFAULT_INTERNAL_ZONE, DEFAULT_NDOTS,
};
use crate::proxy::{self, ProxyState};
use crate::{dns, oracle, region, resolvconf};
use anyhow::{bail, Context, Result};
use clap::Parser;
use hickory_client::client::Client;
use hickory_proto::runtime::TokioRuntimeProvider;
use hickory_proto::udp::UdpClientStream;
use hickory_server::ServerFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{error, info, warn};

const TCP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "runsd", about = "In-container DNS hijack + auth-injecting reverse proxy sidecar")]
pub struct Cli {
    #[arg(long, default_value = "/etc/resolv.conf")]
    pub resolv_conf_file: PathBuf,

    #[arg(long, default_value = DEFAULT_INTERNAL_ZONE)]
    pub domain: String,

    #[arg(long, default_value_t = DEFAULT_NDOTS)]
    pub ndots: usize,

    #[arg(long)]
    pub nameserver: Option<SocketAddr>,

    #[arg(long)]
    pub gcp_region: Option<String>,

    #[arg(long, env = "CLOUD_RUN_PROJECT_HASH")]
    pub gcp_project_hash: Option<String>,

    #[arg(long, default_value_t = false)]
    pub skip_dns_hijack: bool,

    #[arg(long, default_value_t = false)]
    pub skip_http_proxy: bool,

    #[arg(long, default_value_t = DEFAULT_DNS_PORT)]
    pub dns_port: u16,

    #[arg(long, default_value_t = DEFAULT_HTTP_PROXY_PORT)]
    pub http_proxy_port: u16,

    #[arg(long)]
    pub user: Option<String>,

    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// The child command and its arguments, after `--`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub child: Vec<String>,
}

fn probe_ipv6() -> bool {
    std::net::TcpListener::bind("[::1]:0").is_ok()
}

fn is_on_platform(cli: &Cli, upstream: SocketAddr) -> bool {
    cli.gcp_region.is_some() || upstream.ip().to_string() == oracle::METADATA_IP
}

async fn build_config(cli: &Cli, client: &reqwest::Client) -> Result<RuntimeConfig> {
    if std::env::var("PORT").as_deref() == Ok("80") {
        bail!("PORT=80 would collide with the HTTP proxy listener");
    }

    let existing = resolvconf::read(&cli.resolv_conf_file).await?;
    let upstream_nameserver = resolvconf::pick_upstream(cli.nameserver, &existing)?;
    let serve_ipv6 = probe_ipv6();
    let on_platform = is_on_platform(cli, upstream_nameserver);

    let (current_region, project_hash) = if on_platform {
        let region = match &cli.gcp_region {
            Some(r) => r.clone(),
            None => oracle::region_from_metadata(client)
                .await
                .context("discovering region from metadata endpoint")?,
        };
        let hash = match &cli.gcp_project_hash {
            Some(h) => h.clone(),
            None => oracle::project_hash(client, &region)
                .await
                .context("discovering project hash from admin API")?,
        };
        (region, hash)
    } else {
        (cli.gcp_region.clone().unwrap_or_default(), cli.gcp_project_hash.clone().unwrap_or_default())
    };

    if on_platform && !region::is_known(&current_region) {
        bail!("unknown region {current_region:?}: not in the closed region catalog");
    }

    Ok(RuntimeConfig {
        internal_zone: cli.domain.clone(),
        ndots: cli.ndots,
        upstream_nameserver,
        current_region,
        project_hash,
        serve_ipv6,
        dns_port: cli.dns_port,
        http_proxy_port: cli.http_proxy_port,
        version: env!("CARGO_PKG_VERSION"),
        on_platform,
    })
}

async fn bind_dns_listeners(config: &Arc<RuntimeConfig>, client: &reqwest::Client) -> Result<ServerFuture<dns::DnsHijackHandler>> {
    let conn = UdpClientStream::builder(config.upstream_nameserver, TokioRuntimeProvider::new()).build();
    let (upstream_client, background) = Client::connect(conn)
        .await
        .context("connecting recursive DNS client to upstream nameserver")?;
    tokio::spawn(background);
    let _ = client;

    let handler = dns::DnsHijackHandler::new(config.clone(), upstream_client);
    let mut server = ServerFuture::new(handler);

    let udp_v4 = UdpSocket::bind(config.dns_bind_v4())
        .await
        .context("binding DNS UDP v4 listener")?;
    server.register_socket(udp_v4);

    let tcp_v4 = TcpListener::bind(config.dns_bind_v4())
        .await
        .context("binding DNS TCP v4 listener")?;
    server.register_listener(tcp_v4, TCP_TIMEOUT);

    if config.serve_ipv6 {
        let udp_v6 = UdpSocket::bind(config.dns_bind_v6())
            .await
            .context("binding DNS UDP v6 listener")?;
        server.register_socket(udp_v6);

        let tcp_v6 = TcpListener::bind(config.dns_bind_v6())
            .await
            .context("binding DNS TCP v6 listener")?;
        server.register_listener(tcp_v6, TCP_TIMEOUT);
    }

    Ok(server)
}

async fn bind_proxy_listeners(
    config: Arc<RuntimeConfig>,
    client: reqwest::Client,
) -> Result<(TcpListener, Option<TcpListener>, axum::Router)> {
    let state = Arc::new(ProxyState { config: config.clone(), client });
    let app = axum::Router::new().fallback(proxy::handle).with_state(state);

    let v4 = TcpListener::bind(config.proxy_bind_v4())
        .await
        .context("binding HTTP proxy v4 listener")?;
    let v6 = if config.serve_ipv6 {
        Some(
            TcpListener::bind(config.proxy_bind_v6())
                .await
                .context("binding HTTP proxy v6 listener")?,
        )
    } else {
        None
    };

    Ok((v4, v6, app))
}

#[cfg(unix)]
fn drop_privileges(user: &str) -> Result<()> {
    let user = nix::unistd::User::from_name(user)
        .with_context(|| format!("looking up user {user:?}"))?
        .ok_or_else(|| anyhow::anyhow!("no such user: {user:?}"))?;
    nix::unistd::setgid(user.gid).context("setgid")?;
    nix::unistd::setuid(user.uid).context("setuid")?;
    Ok(())
}

#[cfg(unix)]
async fn spawn_child(cli: &Cli) -> Result<tokio::process::Child> {
    let (program, args) = cli
        .child
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("no child command given; usage: runsd [flags] -- child [args...]"))?;

    let mut command = tokio::process::Command::new(program);
    command.args(args).stdin(Stdio::inherit()).stdout(Stdio::inherit()).stderr(Stdio::inherit());

    if let Some(user) = &cli.user {
        let user = user.clone();
        unsafe {
            command.pre_exec(move || drop_privileges(&user).map_err(std::io::Error::other));
        }
    }

    command.spawn().context("spawning child process")
}

#[cfg(unix)]
async fn forward_signals_to(pid: nix::unistd::Pid) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

    loop {
        let sig = tokio::select! {
            _ = sigint.recv() => nix::sys::signal::Signal::SIGINT,
            _ = sigterm.recv() => nix::sys::signal::Signal::SIGTERM,
        };
        if let Err(e) = nix::sys::signal::kill(pid, sig) {
            warn!("failed to forward {sig:?} to child: {e}");
        }
    }
}

pub async fn run(cli: Cli) -> Result<i32> {
    if cli.child.is_empty() {
        bail!("no child command given; usage: runsd [flags] -- child [args...]");
    }

    let client = reqwest::Client::builder()
        .build()
        .context("building shared HTTP client")?;

    let config = Arc::new(build_config(&cli, &client).await?);
    info!(
        region = %config.current_region,
        ipv6 = config.serve_ipv6,
        on_platform = config.on_platform,
        "runsd bootstrapped"
    );

    if !config.on_platform {
        // §4.5 step 9: off-platform is a graceful no-op — skip both servers and the
        // resolver mutation so local development with the wrapper entrypoint works
        // unchanged.
        info!("not running on platform; skipping DNS hijack and HTTP proxy");
    }

    let dns_server = if config.on_platform && !cli.skip_dns_hijack {
        let server = bind_dns_listeners(&config, &client).await?;
        let existing = resolvconf::read(&cli.resolv_conf_file).await?;
        let rendered = resolvconf::render(&config, &existing.search_domains);
        resolvconf::write(&cli.resolv_conf_file, &rendered).await?;
        Some(server)
    } else {
        None
    };

    let proxy_listeners = if config.on_platform && !cli.skip_http_proxy {
        Some(bind_proxy_listeners(config.clone(), client.clone()).await?)
    } else {
        None
    };

    let mut child = spawn_child(&cli).await?;
    let child_pid = child
        .id()
        .ok_or_else(|| anyhow::anyhow!("child process has no pid immediately after spawn"))?;
    let nix_pid = nix::unistd::Pid::from_raw(child_pid as i32);

    let signal_task = tokio::spawn(forward_signals_to(nix_pid));

    let dns_task = async {
        match dns_server {
            Some(server) => {
                if let Err(e) = server.block_until_done().await {
                    error!("DNS server exited: {e}");
                }
            }
            None => std::future::pending::<()>().await,
        }
    };

    let proxy_task = async {
        match proxy_listeners {
            Some((v4, v6, app)) => match v6 {
                Some(v6) => {
                    let app_v6 = app.clone();
                    tokio::select! {
                        r = axum::serve(v4, app) => { if let Err(e) = r { error!("proxy v4 listener exited: {e}"); } }
                        r = axum::serve(v6, app_v6) => { if let Err(e) = r { error!("proxy v6 listener exited: {e}"); } }
                    }
                }
                None => {
                    if let Err(e) = axum::serve(v4, app).await {
                        error!("proxy v4 listener exited: {e}");
                    }
                }
            },
            None => std::future::pending::<()>().await,
        }
    };

    let exit_code = tokio::select! {
        _ = dns_task => bail!("a DNS listener task exited unexpectedly"),
        _ = proxy_task => bail!("an HTTP proxy listener task exited unexpectedly"),
        status = child.wait() => {
            let status = status.context("waiting on child process")?;
            status.code().ok_or_else(|| anyhow::anyhow!("child process exited without a decodable exit code (likely killed by a signal)"))?
        }
    };

    signal_task.abort();
    Ok(exit_code)
}
