// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! sluiced: an IMS-style SIP B2BUA with rtpproxy media steering.
//!
//! Terminates dialogs from two endpoints, bridges their signalling, keeps
//! a minimal digest-authenticated registrar, and points both legs' media
//! at an external RTPProxy so everything flows through this host.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use sluice_media::MediaSessionManager;
use sluice_rtpp::{ControlAddress, RtppClient};
use sluice_transaction::TransactionManager;
use sluice_transport::{run_tcp, run_udp, InboundPacket};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{info, warn};

use sluiced::config::{Config, ConfigFile};
use sluiced::dispatcher::RequestDispatcher;
use sluiced::route_packet;
use sluiced::services::ServiceRegistry;
use sluiced::transport::SluiceTransportDispatcher;

/// SIP B2BUA with registrar and RTPProxy media steering.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to a JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the bind address (ip).
    #[arg(long)]
    bind: Option<String>,
    /// Override the SIP port.
    #[arg(long)]
    port: Option<u16>,
    /// Override the advertised host ("AUTO" detects at startup).
    #[arg(long)]
    advertised_host: Option<String>,
    /// Override the rtpproxy control socket (udp:host:port or unix:/path).
    #[arg(long)]
    rtpproxy: Option<String>,
    /// Enable the TCP listener.
    #[arg(long)]
    enable_tcp: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let mut file = match &args.config {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::default(),
    };
    if let Some(bind) = args.bind {
        file.bind_address = bind;
    }
    if let Some(port) = args.port {
        file.bind_port = port;
    }
    if let Some(host) = args.advertised_host {
        file.advertised_host = host;
    }
    if let Some(rtpproxy) = args.rtpproxy {
        file.rtpproxy_control = rtpproxy;
    }
    if args.enable_tcp {
        file.enable_tcp = true;
    }
    let config = Arc::new(Config::resolve(file)?);

    let control = ControlAddress::parse(&config.rtpproxy_control)
        .ok_or_else(|| anyhow!("invalid rtpproxy_control {:?}", config.rtpproxy_control))?;
    let rtpp = RtppClient::connect(&control).await?;
    match rtpp.probe().await {
        Ok(version) => info!(%version, "rtpproxy reachable"),
        Err(e) => warn!(%e, "rtpproxy probe failed; continuing, calls will 503"),
    }
    let media = MediaSessionManager::new(rtpp, &config.identity.advertised_host);

    let udp_socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
    let dispatcher = Arc::new(SluiceTransportDispatcher::new(Arc::clone(&udp_socket)));

    let services = Arc::new(ServiceRegistry::new(
        config.clone(),
        dispatcher.clone(),
        media,
    ));
    let manager = TransactionManager::with_timers(dispatcher, config.timers);
    services.set_transactions(manager.clone());
    let request_dispatcher = Arc::new(RequestDispatcher::new(services.clone()));

    let (tx, mut rx) = mpsc::channel::<InboundPacket>(1024);
    tokio::spawn({
        let tx = tx.clone();
        let socket = Arc::clone(&udp_socket);
        async move {
            if let Err(e) = run_udp(socket, tx).await {
                tracing::error!(%e, "udp listener exited");
            }
        }
    });
    if config.enable_tcp {
        let bind = config.bind_addr.to_string();
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_tcp(&bind, tx).await {
                tracing::error!(%e, "tcp listener exited");
            }
        });
    }

    info!(
        bind = %config.bind_addr,
        advertised = %format!("{}:{}", config.identity.advertised_host, config.identity.advertised_port),
        tcp = config.enable_tcp,
        "sluiced started"
    );

    while let Some(packet) = rx.recv().await {
        route_packet(&manager, &request_dispatcher, &services, packet).await;
    }
    Ok(())
}
