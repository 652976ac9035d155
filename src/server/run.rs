// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use clap::{Arg, ArgAction};
use std::path::Path;
use tokio::runtime::Runtime;

use super::ServerContext;
use crate::config::Config;
use crate::error::{Error, ErrorKind};
use crate::log::init_log;
use crate::storage::record_ffdc;

pub const DEFAULT_CONFIG: &str = "/etc/veles/veles.toml";
const OPT_CONFIG: &str = "config";
const OPT_RELOAD: &str = "reload";
const OPT_STOP: &str = "stop";
const OPT_TEST: &str = "test";

/// Entry point of the broker.
///
/// # Errors
///
/// Returns error on invalid arguments or config, or when the broker hits a
/// fatal error. Fatal errors leave an FFDC record in the persistence
/// directory.
pub fn run_server() -> Result<(), Error> {
    let matches = clap::Command::new("Veles")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Lightweight MQTT broker")
        .arg(
            Arg::new(OPT_CONFIG)
                .short('c')
                .long(OPT_CONFIG)
                .value_name("config_file")
                .help("Specify config file path"),
        )
        .arg(
            Arg::new(OPT_RELOAD)
                .short('r')
                .long(OPT_RELOAD)
                .action(ArgAction::SetTrue)
                .help("Reload users and acl of a running broker"),
        )
        .arg(
            Arg::new(OPT_STOP)
                .short('s')
                .long(OPT_STOP)
                .action(ArgAction::SetTrue)
                .help("Stop a running broker"),
        )
        .arg(
            Arg::new(OPT_TEST)
                .short('t')
                .long(OPT_TEST)
                .action(ArgAction::SetTrue)
                .help("Test config file and exit"),
        )
        .get_matches();

    let config_file = match matches.get_one::<String>(OPT_CONFIG) {
        Some(config_file) => Some(config_file.as_str()),
        None if Path::new(DEFAULT_CONFIG).exists() => Some(DEFAULT_CONFIG),
        None => None,
    };

    let config = if let Some(config_file) = config_file {
        let config_content = std::fs::read_to_string(config_file)?;
        let config: Config = toml::from_str(&config_content).map_err(|err| {
            Error::from_string(ErrorKind::ConfigError, format!("Invalid config: {err}"))
        })?;
        config.validate()?;

        if matches.get_flag(OPT_TEST) {
            println!("The configuration file {config_file} syntax is Ok");
            return Ok(());
        }
        config
    } else {
        Config::default()
    };

    let mut server = ServerContext::new(config.clone());

    #[cfg(unix)]
    if matches.get_flag(OPT_RELOAD) {
        return server.send_reload_signal();
    }

    #[cfg(unix)]
    if matches.get_flag(OPT_STOP) {
        return server.send_stop_signal();
    }

    init_log(config.log())?;

    let runtime = Runtime::new()?;
    let ret = server.run_loop(runtime);
    if let Err(err) = &ret {
        if err.kind() == &ErrorKind::Fatal {
            match record_ffdc(
                config.storage().persistence_location(),
                "fatal broker error",
                &err.to_string(),
            ) {
                Ok(path) => log::error!("Fatal error, FFDC written to {path:?}"),
                Err(ffdc_err) => log::error!("Fatal error, FFDC write failed: {ffdc_err}"),
            }
        }
    }
    ret
}

/// Run server with predefined config.
///
/// Useful for integration tests.
///
/// # Errors
///
/// Returns error if broker init fails.
pub fn run_server_with_config(config: Config) -> Result<(), Error> {
    init_log(config.log())?;
    let mut server = ServerContext::new(config);
    let runtime = Runtime::new()?;
    server.run_loop(runtime)
}
