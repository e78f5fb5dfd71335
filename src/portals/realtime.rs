// SPDX-License-Identifier: GPL-3.0-only

//! Scheduling requests relayed to RealtimeKit, with the caller's pid
//! namespace translated away.

use std::sync::Arc;

use tracing::debug;
use zbus::{fdo, message::Header};

use crate::{
    error::PortalError,
    state::{Broker, Call},
    utils::unblock,
};

#[zbus::proxy(
    interface = "org.freedesktop.RealtimeKit1",
    default_service = "org.freedesktop.RealtimeKit1",
    default_path = "/org/freedesktop/RealtimeKit1",
    gen_blocking = false
)]
pub trait RealtimeKit {
    #[zbus(name = "MakeThreadRealtimeWithPID")]
    fn make_thread_realtime_with_pid(&self, process: u64, thread: u64, priority: u32) -> zbus::Result<()>;

    #[zbus(name = "MakeThreadHighPriorityWithPID")]
    fn make_thread_high_priority_with_pid(&self, process: u64, thread: u64, priority: i32) -> zbus::Result<()>;

    #[zbus(property)]
    fn max_realtime_priority(&self) -> zbus::Result<i32>;

    #[zbus(property)]
    fn min_nice_level(&self) -> zbus::Result<i32>;

    #[zbus(property, name = "RTTimeUSecMax")]
    fn rttime_usec_max(&self) -> zbus::Result<i64>;
}

fn narrow(id: u64) -> Result<u32, PortalError> {
    u32::try_from(id).map_err(|_| PortalError::invalid(format!("Invalid process id {id}")))
}

pub struct Realtime {
    broker: Arc<Broker>,
}

impl Realtime {
    pub fn new(broker: Arc<Broker>) -> Realtime {
        Realtime { broker }
    }

    async fn proxy(&self) -> fdo::Result<RealtimeKitProxy<'static>> {
        let system_bus = self
            .broker
            .system_bus
            .as_ref()
            .ok_or_else(|| fdo::Error::ServiceUnknown("No system bus".to_string()))?;
        Ok(RealtimeKitProxy::new(system_bus).await?)
    }

    /// Host ids of `process` and its `thread`.
    async fn map(&self, call: &Call, process: u64, thread: u64) -> Result<(u64, u64), PortalError> {
        let (process, thread) = (narrow(process)?, narrow(thread)?);
        let app_info = call.app_info.clone();
        let runtime_dir = self.broker.dirs.runtime_dir.clone();
        let (host_process, host_thread) = unblock(&self.broker.executor, move || {
            let process = app_info
                .map_pids(&runtime_dir, &[process])?
                .first()
                .copied()
                .ok_or_else(|| crate::app_info::IdentityError::PidMapping(format!("process {process} not found")))?;
            let thread = app_info
                .map_tids(&runtime_dir, process, &[thread])?
                .first()
                .copied()
                .ok_or_else(|| crate::app_info::IdentityError::PidMapping(format!("thread {thread} not found")))?;
            Ok::<_, crate::app_info::IdentityError>((process, thread))
        })
        .await??;
        debug!(
            app_id = call.app_info.id(),
            process, thread, host_process, host_thread, "Mapped realtime thread"
        );
        Ok((host_process.into(), host_thread.into()))
    }
}

#[zbus::interface(name = "org.freedesktop.portal.Realtime")]
impl Realtime {
    #[zbus(name = "MakeThreadRealtimeWithPID")]
    async fn make_thread_realtime_with_pid(
        &self,
        #[zbus(header)] header: Header<'_>,
        process: u64,
        thread: u64,
        priority: u32,
    ) -> Result<(), PortalError> {
        let call = self.broker.authorize(&header).await?;
        let (process, thread) = self.map(&call, process, thread).await?;
        self.proxy()
            .await?
            .make_thread_realtime_with_pid(process, thread, priority)
            .await?;
        Ok(())
    }

    #[zbus(name = "MakeThreadHighPriorityWithPID")]
    async fn make_thread_high_priority_with_pid(
        &self,
        #[zbus(header)] header: Header<'_>,
        process: u64,
        thread: u64,
        priority: i32,
    ) -> Result<(), PortalError> {
        let call = self.broker.authorize(&header).await?;
        let (process, thread) = self.map(&call, process, thread).await?;
        self.proxy()
            .await?
            .make_thread_high_priority_with_pid(process, thread, priority)
            .await?;
        Ok(())
    }

    #[zbus(property)]
    async fn max_realtime_priority(&self) -> fdo::Result<i32> {
        Ok(self.proxy().await?.max_realtime_priority().await?)
    }

    #[zbus(property)]
    async fn min_nice_level(&self) -> fdo::Result<i32> {
        Ok(self.proxy().await?.min_nice_level().await?)
    }

    #[zbus(property, name = "RTTimeUSecMax")]
    async fn rttime_usec_max(&self) -> fdo::Result<i64> {
        Ok(self.proxy().await?.rttime_usec_max().await?)
    }

    #[zbus(property)]
    fn version(&self) -> u32 {
        1
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_narrow_ids() {
        assert_eq!(narrow(42).unwrap(), 42);
        assert!(matches!(narrow(u64::MAX), Err(PortalError::InvalidArgument(_))));
    }
}
