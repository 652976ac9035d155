// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! ServerContext is the main entry point of the broker. It wires up the
//! apps and handles kernel signals.

use std::fs::File;
use std::io::{Read, Write};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;

use crate::commands::{
    ServerContextToAuthCmd, ServerContextToBridgeCmd, ServerContextToDispatcherCmd,
};
use crate::config::Config;
use crate::error::{Error, ErrorKind};

mod init;
mod run;

pub use run::{run_server, run_server_with_config, DEFAULT_CONFIG};

pub const CHANNEL_CAPACITY: usize = 16;

/// Seconds to wait for the dispatcher to persist state on shutdown.
const SHUTDOWN_TIMEOUT: u64 = 10;

/// Manages lifetime of the dispatcher, listeners and the other apps.
/// All kernel signals are handled here.
#[derive(Debug)]
pub struct ServerContext {
    config: Config,

    dispatcher_sender: Option<Sender<ServerContextToDispatcherCmd>>,
    auth_sender: Option<Sender<ServerContextToAuthCmd>>,
    bridge_sender: Option<Sender<ServerContextToBridgeCmd>>,
}

impl ServerContext {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self {
            config,
            dispatcher_sender: None,
            auth_sender: None,
            bridge_sender: None,
        }
    }

    /// Notify a running broker to reload users and acl rules by sending
    /// SIGHUP, used by `--reload`.
    ///
    /// # Errors
    ///
    /// Returns error if the pid file is unreadable or the signal fails.
    #[cfg(unix)]
    pub fn send_reload_signal(&mut self) -> Result<(), Error> {
        self.send_signal(nc::SIGHUP)
    }

    /// Stop a running broker by sending SIGTERM, used by `--stop`.
    ///
    /// # Errors
    ///
    /// Returns error if the pid file is unreadable or the signal fails.
    #[cfg(unix)]
    pub fn send_stop_signal(&mut self) -> Result<(), Error> {
        self.send_signal(nc::SIGTERM)
    }

    #[cfg(unix)]
    fn send_signal(&mut self, sig: i32) -> Result<(), Error> {
        let mut fd = File::open(&self.config.general().pid_file)?;
        let mut pid_str = String::new();
        fd.read_to_string(&mut pid_str)?;
        let pid = pid_str.trim().parse::<i32>().map_err(|err| {
            Error::from_string(
                ErrorKind::PidError,
                format!(
                    "Failed to parse pid {pid_str} from file {:?}, err: {err:?}",
                    self.config.general().pid_file
                ),
            )
        })?;
        unsafe {
            nc::kill(pid, sig).map_err(|err| {
                Error::from_string(
                    ErrorKind::PidError,
                    format!("Failed to signal process {pid}, got {}", nc::strerror(err)),
                )
            })
        }
    }

    fn write_pid(&self) -> Result<(), Error> {
        let pid = std::process::id();
        let mut fd = File::create(&self.config.general().pid_file)?;
        write!(fd, "{pid}")?;
        Ok(())
    }

    /// Init modules and run the tokio runtime until a stop signal arrives.
    ///
    /// # Errors
    ///
    /// Returns error if initialization fails; such errors are fatal.
    pub fn run_loop(&mut self, runtime: Runtime) -> Result<(), Error> {
        self.write_pid()?;

        runtime.block_on(async {
            self.init_modules(&runtime).await?;
            self.run_inner_loop().await
        })
    }

    #[cfg(unix)]
    async fn run_inner_loop(&mut self) -> Result<(), Error> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    log::info!("SIGINT received, shutting down");
                    return self.shutdown().await;
                }
                _ = sigterm.recv() => {
                    log::info!("SIGTERM received, shutting down");
                    return self.shutdown().await;
                }
                _ = sighup.recv() => {
                    log::info!("SIGHUP received, reloading");
                    self.reload().await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    async fn run_inner_loop(&mut self) -> Result<(), Error> {
        tokio::signal::ctrl_c().await?;
        log::info!("Interrupt received, shutting down");
        self.shutdown().await
    }

    /// Reload the password file and acl rules.
    async fn reload(&mut self) {
        if let Some(auth_sender) = &self.auth_sender {
            if let Err(err) = auth_sender.send(ServerContextToAuthCmd::Reload).await {
                log::error!("server: Failed to send reload to auth: {err}");
            }
        }
        if let Some(dispatcher_sender) = &self.dispatcher_sender {
            if let Err(err) = dispatcher_sender
                .send(ServerContextToDispatcherCmd::Reload)
                .await
            {
                log::error!("server: Failed to send reload to dispatcher: {err}");
            }
        }
    }

    /// Stop the bridges, let the dispatcher persist its state and remove
    /// the pid file.
    async fn shutdown(&mut self) -> Result<(), Error> {
        if let Some(bridge_sender) = &self.bridge_sender {
            if let Err(err) = bridge_sender.send(ServerContextToBridgeCmd::Shutdown).await {
                log::warn!("server: Failed to stop bridges: {err}");
            }
        }

        if let Some(dispatcher_sender) = &self.dispatcher_sender {
            let (ack_sender, ack_receiver) = oneshot::channel();
            if let Err(err) = dispatcher_sender
                .send(ServerContextToDispatcherCmd::Shutdown(ack_sender))
                .await
            {
                log::error!("server: Failed to send shutdown to dispatcher: {err}");
            } else if tokio::time::timeout(Duration::from_secs(SHUTDOWN_TIMEOUT), ack_receiver)
                .await
                .is_err()
            {
                log::error!("server: Dispatcher did not finish persisting in time");
            }
        }

        let _ret = std::fs::remove_file(&self.config.general().pid_file);
        Ok(())
    }
}
