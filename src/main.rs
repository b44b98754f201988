//! # Driftlink — Main Entry Point
//!
//! Parses CLI arguments, initializes logging, and dispatches to one of the
//! three subcommands: `serve` (run capability back-ends), `socks` (run the
//! local SOCKS front-end), or `servers` (discovery).

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use driftlink::transport::FolderTransport;
use driftlink::{BlobTransport, Client, ProxyMode, Server, Socks4Backend, Socks5Backend, SocksFrontEnd};
use tracing::{info, warn};

use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

use driftlink::cli::{Args, Command, ServeArgs, ServersArgs, SocksArgs, TransportArgs, TransportChoice};
use driftlink::logging::ColorizedFormatter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let guard;
    let detailed_log_layer;

    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path.parent().unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("driftlink.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "driftlink.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry().with(detailed_log_layer).with(stdout_log).init();
    let _log_guard = guard;

    match args.command {
        Command::Serve(serve_args) => run_serve(serve_args).await,
        Command::Socks(socks_args) => run_socks(socks_args).await,
        Command::Servers(servers_args) => run_servers(servers_args).await,
    }
}

/// Builds the folder transport binding; the only one this CLI can
/// construct without an external credentialed client. IMAP/FTP require a
/// `MailboxClient`/`FtpClient` collaborator this CLI surface doesn't
/// provide — embed `driftlink` as a library and construct `ImapTransport`/
/// `FtpTransport` directly for those bindings.
fn build_folder_transport(args: &TransportArgs) -> Result<FolderTransport> {
    match args.transport {
        TransportChoice::Folder => {
            let root = args.root.clone().context("--root is required for the folder transport")?;
            let mut transport = FolderTransport::new(root);
            if let Some(poll_interval) = args.poll_interval {
                transport = transport.with_poll_interval(poll_interval);
            }
            Ok(transport)
        }
        TransportChoice::Imap | TransportChoice::Ftp => {
            bail!(
                "the {:?} transport needs a credentialed client (MailboxClient/FtpClient) this CLI \
                 doesn't construct; embed driftlink as a library and build ImapTransport/FtpTransport directly",
                args.transport
            )
        }
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let folder = build_folder_transport(&args.transport)?.with_broadcast_ttl(args.broadcast_ttl);
    let transport = Arc::new(folder);
    let _reaper = transport.clone().spawn_reaper();

    let mut server = Server::new(args.rid.clone(), transport as Arc<dyn BlobTransport>);
    server.register_capability(Arc::new(Socks4Backend::new("socks")));
    server.register_capability(Arc::new(Socks5Backend::new("socks5")));
    let server = Arc::new(server);

    info!(rid = %args.rid, "driftlink server starting");
    let serve_task = tokio::spawn(server.clone().serve_forever());

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    server.stop().await?;
    serve_task.abort();
    Ok(())
}

async fn run_socks(args: SocksArgs) -> Result<()> {
    let transport = Arc::new(build_folder_transport(&args.transport)?) as Arc<dyn BlobTransport>;
    let client = Arc::new(Client::new(args.cid.clone(), transport));
    let mode = if args.socks5 { ProxyMode::Socks5 } else { ProxyMode::Socks4 };
    let front = Arc::new(SocksFrontEnd::new(client, args.rid.clone(), mode));

    println!(
        "# driftlink socks proxy listening on 127.0.0.1:{port} (capability {capa:?} against {rid:?})",
        port = args.listen_port,
        capa = mode.capability(),
        rid = args.rid,
    );
    if args.socks5 {
        println!("export ALL_PROXY=socks5h://127.0.0.1:{}/", args.listen_port);
    } else {
        println!("export http_proxy=socks4://127.0.0.1:{}/", args.listen_port);
    }

    front.serve(("127.0.0.1", args.listen_port)).await?;
    Ok(())
}

async fn run_servers(args: ServersArgs) -> Result<()> {
    let transport = Arc::new(build_folder_transport(&args.transport)?) as Arc<dyn BlobTransport>;
    let client = Client::new(args.cid, transport);

    match args.rid {
        Some(rid) => {
            let capabilities = client.capabilities(&rid).await?;
            println!("{rid} advertises: {}", capabilities.join(", "));
        }
        None => {
            let servers = client.list_servers().await?;
            if servers.is_empty() {
                warn!("no servers currently advertising a capability record");
            }
            for rid in servers {
                println!("{rid}");
            }
        }
    }
    Ok(())
}
