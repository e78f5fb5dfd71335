// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{bail, Context, Result};
use calloop::{
    channel::{self, Event},
    signals::{Signal, Signals},
    EventLoop,
};
use clap_lex::RawArgs;
use futures_executor::{block_on, ThreadPool};
use std::process;
use tracing::{error, info};
use zbus::{
    fdo::{RequestNameFlags, RequestNameReply},
    names::WellKnownName,
};

use crate::{dbus::DESKTOP_SERVICE, state::State, utils::dirs::HostDirs};

pub mod app_info;
pub mod config;
pub mod dbus;
pub mod documents;
pub mod error;
pub mod fd;
pub mod handles;
pub mod launcher;
mod logger;
pub mod options;
pub mod permissions;
pub mod portals;
pub mod request;
pub mod restore;
pub mod session;
pub mod state;
#[cfg(feature = "systemd")]
pub mod systemd;
pub mod utils;

#[derive(Debug, Default, Clone, Copy)]
struct Args {
    replace: bool,
    verbose: bool,
}

fn main() {
    if let Err(err) = main_inner() {
        error!("Error occured in main(): {:?}", err);
        eprintln!("portal-broker: {err:#}");
        process::exit(1);
    }
}

/// `None` if the process should exit right away.
fn parse_args(raw_args: &RawArgs) -> Result<Option<Args>> {
    let mut cursor = raw_args.cursor();
    let mut args = Args::default();
    // Skip the binary name.
    let _ = raw_args.next_os(&mut cursor);
    while let Some(arg) = raw_args.next_os(&mut cursor) {
        match arg.to_str() {
            Some("--help") | Some("-h") => {
                print_help(env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            Some("--version") | Some("-V") => {
                println!("portal-broker {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            Some("--replace") | Some("-r") => args.replace = true,
            Some("--verbose") | Some("-v") => args.verbose = true,
            _ => bail!("Unknown argument {:?}", arg),
        }
    }
    Ok(Some(args))
}

fn main_inner() -> Result<()> {
    let Some(args) = parse_args(&RawArgs::from_args())? else {
        return Ok(());
    };

    logger::init_logger(args.verbose)?;
    info!("Portal broker starting up!");

    let xdg = xdg::BaseDirectories::new().ok();
    let dirs = HostDirs::from_env(xdg.as_ref());
    let config = config::load(xdg.as_ref());
    let executor = ThreadPool::builder()
        .pool_size(config.worker_threads.max(1))
        .name_prefix("portal-worker-")
        .create()
        .context("Failed to start the worker pool")?;

    let mut event_loop = EventLoop::<State>::try_new().context("Failed to initialize event loop")?;
    let (bus_events, bus_source) = channel::channel();

    let broker = block_on(async {
        let connection = zbus::Connection::session()
            .await
            .context("Failed to connect to the session bus")?;
        let broker = state::Broker::new(connection, executor.clone(), config, dirs).await?;
        portals::register(&broker)
            .await
            .context("Failed to export the portals")?;
        let own_name = WellKnownName::from_static_str(DESKTOP_SERVICE)?;
        dbus::name_owners::watch(&broker.dbus, &executor, own_name, bus_events)
            .await
            .context("Failed to watch bus names")?;

        let flags = if args.replace {
            RequestNameFlags::AllowReplacement | RequestNameFlags::ReplaceExisting
        } else {
            RequestNameFlags::AllowReplacement | RequestNameFlags::DoNotQueue
        };
        let reply = broker
            .dbus
            .request_name(WellKnownName::from_static_str(DESKTOP_SERVICE)?, flags)
            .await
            .context("Failed to request the portal bus name")?;
        match reply {
            RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner => {}
            reply => bail!("{DESKTOP_SERVICE} is owned by another process ({reply:?}), try --replace"),
        }
        info!(name = DESKTOP_SERVICE, "Owning bus name");
        Ok::<_, anyhow::Error>(broker)
    })?;

    let mut state = State::new(broker, event_loop.get_signal());

    event_loop
        .handle()
        .insert_source(bus_source, |event, _, state| match event {
            Event::Msg(event) => state.handle_bus_event(event),
            Event::Closed => {
                error!("Bus watcher stopped");
                state.stop();
            }
        })
        .map_err(|err| err.error)
        .context("Failed to init the bus event source")?;
    let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM]).context("Failed to block signals")?;
    event_loop
        .handle()
        .insert_source(signals, |signal, _, state| {
            info!(signal = ?signal.signal(), "Received signal");
            state.stop();
        })
        .map_err(|err| err.error)
        .context("Failed to init the signal source")?;

    #[cfg(feature = "systemd")]
    systemd::ready();

    event_loop.run(None, &mut state, |_| {})?;
    info!("Shutting down");
    Ok(())
}

fn print_help(version: &str) {
    println!(
        r#"portal-broker {version}

Brokers desktop portal requests from applications to the desktop's
portal implementations.

Options:
  -r, --replace  Replace a running instance
  -v, --verbose  Log debug messages
  -h, --help     Show this message
  -V, --version  Show the version of portal-broker"#
    );
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_args() {
        let args = parse_args(&RawArgs::new(["portal-broker", "--replace", "-v"])).unwrap().unwrap();
        assert!(args.replace);
        assert!(args.verbose);
        assert!(parse_args(&RawArgs::new(["portal-broker", "--bogus"])).is_err());
    }
}
