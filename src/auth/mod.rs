// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Auth app: answers credential checks from the listeners.
//!
//! The password file holds one `username:password` entry per line, in clear
//! text, with `#` comment lines.

use codec::ConnectReturnCode;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::{Receiver, Sender};

use crate::commands::{AuthToListenerCmd, ListenerToAuthCmd, ServerContextToAuthCmd};
use crate::config;
use crate::error::Error;
use crate::types::ListenerId;

#[derive(Debug)]
pub struct AuthApp {
    allow_anonymous: bool,
    password_file: Option<PathBuf>,
    users: HashMap<String, String>,

    listener_senders: HashMap<ListenerId, Sender<AuthToListenerCmd>>,
    listener_receiver: Receiver<ListenerToAuthCmd>,

    server_ctx_receiver: Receiver<ServerContextToAuthCmd>,
}

impl AuthApp {
    /// Create the auth app, reading the password file if configured.
    ///
    /// # Errors
    ///
    /// Returns error if the password file cannot be read.
    pub fn new(
        security: &config::Security,
        listener_senders: Vec<(ListenerId, Sender<AuthToListenerCmd>)>,
        listener_receiver: Receiver<ListenerToAuthCmd>,
        server_ctx_receiver: Receiver<ServerContextToAuthCmd>,
    ) -> Result<Self, Error> {
        let users = match security.password_file() {
            Some(password_file) => load_password_file(password_file)?,
            None => HashMap::new(),
        };
        Ok(Self {
            allow_anonymous: security.allow_anonymous(),
            password_file: security.password_file().cloned(),
            users,
            listener_senders: listener_senders.into_iter().collect(),
            listener_receiver,
            server_ctx_receiver,
        })
    }

    pub async fn run_loop(&mut self) -> ! {
        loop {
            tokio::select! {
                Some(cmd) = self.listener_receiver.recv() => {
                    if let Err(err) = self.handle_listener_cmd(cmd).await {
                        log::error!("auth: handle listener cmd failed: {err}");
                    }
                }
                Some(cmd) = self.server_ctx_receiver.recv() => {
                    self.handle_server_ctx_cmd(&cmd);
                }
            }
        }
    }

    async fn handle_listener_cmd(&mut self, cmd: ListenerToAuthCmd) -> Result<(), Error> {
        match cmd {
            ListenerToAuthCmd::RequestAuth(session_gid, username, password) => {
                let return_code = self.check(&username, &password);
                let response = AuthToListenerCmd::ResponseAuth(session_gid.session_id(), return_code);
                if let Some(sender) = self.listener_senders.get(&session_gid.listener_id()) {
                    sender.send(response).await.map_err(Into::into)
                } else {
                    log::error!(
                        "auth: Unknown listener id: {}",
                        session_gid.listener_id()
                    );
                    Ok(())
                }
            }
        }
    }

    fn handle_server_ctx_cmd(&mut self, cmd: &ServerContextToAuthCmd) {
        match cmd {
            ServerContextToAuthCmd::Reload => {
                let Some(password_file) = self.password_file.clone() else {
                    return;
                };
                match load_password_file(&password_file) {
                    Ok(users) => {
                        log::info!("auth: Reloaded {} users", users.len());
                        self.users = users;
                    }
                    Err(err) => {
                        log::error!("auth: Failed to reload password file: {err}");
                    }
                }
            }
        }
    }

    fn check(&self, username: &str, password: &[u8]) -> ConnectReturnCode {
        if username.is_empty() {
            return if self.allow_anonymous {
                ConnectReturnCode::Accepted
            } else {
                ConnectReturnCode::NotAuthorized
            };
        }
        match self.users.get(username) {
            Some(expected) if expected.as_bytes() == password => ConnectReturnCode::Accepted,
            Some(_) => ConnectReturnCode::BadUserNameOrPassword,
            None => ConnectReturnCode::NotAuthorized,
        }
    }
}

fn load_password_file(path: &Path) -> Result<HashMap<String, String>, Error> {
    let fd = File::open(path)?;
    let reader = BufReader::new(fd);
    let mut users = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once(':') {
            Some((username, password)) => {
                users.insert(username.to_string(), password.to_string());
            }
            None => {
                log::warn!("auth: Skipping malformed password line");
            }
        }
    }
    Ok(users)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_password_file() {
        let mut path = std::env::temp_dir();
        path.push(format!("veles-passwd-test-{}.conf", std::process::id()));
        let mut file = File::create(&path).unwrap();
        file.write_all(b"# users\nadmin:secret\nguest:guest\n\nbroken-line\n")
            .unwrap();

        let users = load_password_file(&path).unwrap();
        let _ret = std::fs::remove_file(&path);
        assert_eq!(users.len(), 2);
        assert_eq!(users.get("admin").map(String::as_str), Some("secret"));
    }
}
