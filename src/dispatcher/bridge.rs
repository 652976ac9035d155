// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Bridge cmd handlers.

use super::{Dispatcher, Route, RouteTarget};
use crate::commands::BridgeToDispatcherCmd;
use crate::error::Error;

impl Dispatcher {
    pub(super) async fn handle_bridge_cmd(
        &mut self,
        cmd: BridgeToDispatcherCmd,
    ) -> Result<(), Error> {
        match cmd {
            BridgeToDispatcherCmd::Publish(client_id, publication) => {
                // A publish arriving over the bridge routes like any other;
                // the bridge's own no_local subscriptions keep it from
                // echoing straight back.
                self.route_publish(&client_id, publication).await
            }
            BridgeToDispatcherCmd::Subscribe(client_id, filter, qos, priority) => {
                match self
                    .engine
                    .subscribe(&client_id, &filter, qos, true, false, priority)
                {
                    Ok(_is_new) => {
                        self.routes.entry(client_id).or_insert(Route {
                            target: RouteTarget::Bridge,
                            clean_session: true,
                            username: None,
                        });
                    }
                    Err(err) => {
                        log::error!("dispatcher: Invalid bridge filter {filter}: {err:?}");
                    }
                }
                Ok(())
            }
        }
    }
}
