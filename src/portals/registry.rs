// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use tracing::info;
use zbus::message::Header;

use crate::{error::PortalError, options::VarDict, state::Broker};

/// Lets unconfined applications tell the broker who they are.
pub struct Registry {
    broker: Arc<Broker>,
}

impl Registry {
    pub fn new(broker: Arc<Broker>) -> Registry {
        Registry { broker }
    }
}

#[zbus::interface(name = "org.freedesktop.host.portal.Registry")]
impl Registry {
    async fn register(
        &self,
        #[zbus(header)] header: Header<'_>,
        app_id: String,
        _options: VarDict,
    ) -> Result<(), PortalError> {
        let call = self.broker.authorize(&header).await?;
        let registered = self
            .broker
            .app_infos
            .register(&call.sender, &call.app_info, &app_id)?;
        info!(sender = %call.sender, app_id = %registered.id(), "Host application registered");
        Ok(())
    }

    #[zbus(property)]
    fn version(&self) -> u32 {
        1
    }
}
