// SPDX-License-Identifier: GPL-3.0-only

//! Location sessions backed by GeoClue, with the accuracy an application
//! may see kept in the permission store.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use futures_util::{
    future::{abortable, AbortHandle},
    StreamExt,
};
use tracing::{debug, warn};
use zbus::{
    message::Header,
    object_server::SignalEmitter,
    zvariant::{ObjectPath, OwnedObjectPath, Value},
};

use super::{
    access::{ask, Prompt},
    begin_request, create_session, handle_token, RequestReply,
};
use crate::{
    error::PortalError,
    handles::Handle,
    options::{filter_options, get_str, get_u32, to_value, validate_token, OptionSpec, VarDict},
    permissions::{self, PermissionStore},
    request::Response,
    session::{CloseReason, Session, SessionData},
    state::Broker,
};

const TABLE: &str = "location";

/// Accuracy levels of the portal, from coarsest to finest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Accuracy {
    None,
    Country,
    City,
    Neighborhood,
    Street,
    #[default]
    Exact,
}

const ACCURACIES: &[(Accuracy, &str)] = &[
    (Accuracy::None, "NONE"),
    (Accuracy::Country, "COUNTRY"),
    (Accuracy::City, "CITY"),
    (Accuracy::Neighborhood, "NEIGHBORHOOD"),
    (Accuracy::Street, "STREET"),
    (Accuracy::Exact, "EXACT"),
];

impl Accuracy {
    pub fn from_u32(value: u32) -> Option<Accuracy> {
        ACCURACIES.get(usize::try_from(value).ok()?).map(|(accuracy, _)| *accuracy)
    }

    pub fn name(self) -> &'static str {
        ACCURACIES
            .iter()
            .find(|(accuracy, _)| *accuracy == self)
            .map_or("NONE", |(_, name)| name)
    }

    pub fn from_name(name: &str) -> Option<Accuracy> {
        ACCURACIES
            .iter()
            .find(|(_, known)| *known == name)
            .map(|(accuracy, _)| *accuracy)
    }

    /// GeoClue's `GClueAccuracyLevel`.
    pub fn geoclue_level(self) -> u32 {
        match self {
            Accuracy::None => 0,
            Accuracy::Country => 1,
            Accuracy::City => 4,
            Accuracy::Neighborhood => 5,
            Accuracy::Street => 6,
            Accuracy::Exact => 8,
        }
    }
}

/// Accuracy granted by a stored `[accuracy, last used]` list.
pub fn stored_accuracy(list: &[String]) -> Option<Accuracy> {
    Accuracy::from_name(list.first()?)
}

fn store_accuracy(store: &dyn PermissionStore, app_id: &str, accuracy: Accuracy) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs());
    let list = [accuracy.name().to_string(), now.to_string()];
    if let Err(err) = permissions::set(store, app_id, TABLE, TABLE, &list) {
        warn!(app_id, %err, "Failed to store location permission");
    }
}

fn validate_accuracy(key: &str, value: &Value<'_>, _: &VarDict) -> Result<(), PortalError> {
    match value {
        Value::U32(accuracy) if Accuracy::from_u32(*accuracy).is_some() => Ok(()),
        _ => Err(PortalError::invalid(format!("Option {key} is not an accuracy level"))),
    }
}

const CREATE_OPTIONS: &[OptionSpec] = &[
    OptionSpec::validated("session_handle_token", "s", validate_token),
    OptionSpec::new("distance-threshold", "u"),
    OptionSpec::new("time-threshold", "u"),
    OptionSpec::validated("accuracy", "u", validate_accuracy),
];

#[zbus::proxy(
    interface = "org.freedesktop.GeoClue2.Manager",
    default_service = "org.freedesktop.GeoClue2",
    default_path = "/org/freedesktop/GeoClue2/Manager",
    gen_blocking = false
)]
pub trait GeoClueManager {
    fn get_client(&self) -> zbus::Result<OwnedObjectPath>;
}

#[zbus::proxy(
    interface = "org.freedesktop.GeoClue2.Client",
    default_service = "org.freedesktop.GeoClue2",
    gen_blocking = false
)]
pub trait GeoClueClient {
    fn start(&self) -> zbus::Result<()>;

    fn stop(&self) -> zbus::Result<()>;

    #[zbus(property)]
    fn set_desktop_id(&self, value: &str) -> zbus::Result<()>;

    #[zbus(property)]
    fn set_distance_threshold(&self, value: u32) -> zbus::Result<()>;

    #[zbus(property)]
    fn set_time_threshold(&self, value: u32) -> zbus::Result<()>;

    #[zbus(property)]
    fn set_requested_accuracy_level(&self, value: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    fn location_updated(&self, old: ObjectPath<'_>, new: ObjectPath<'_>) -> zbus::Result<()>;
}

#[zbus::proxy(
    interface = "org.freedesktop.GeoClue2.Location",
    default_service = "org.freedesktop.GeoClue2",
    gen_blocking = false
)]
pub trait GeoClueLocation {
    #[zbus(property)]
    fn latitude(&self) -> zbus::Result<f64>;

    #[zbus(property)]
    fn longitude(&self) -> zbus::Result<f64>;

    #[zbus(property)]
    fn altitude(&self) -> zbus::Result<f64>;

    #[zbus(property)]
    fn accuracy(&self) -> zbus::Result<f64>;

    #[zbus(property)]
    fn speed(&self) -> zbus::Result<f64>;

    #[zbus(property)]
    fn heading(&self) -> zbus::Result<f64>;

    #[zbus(property)]
    fn description(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn timestamp(&self) -> zbus::Result<(u64, u64)>;
}

/// One position as reported to the application.
#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub accuracy: f64,
    pub speed: f64,
    pub heading: f64,
    pub description: String,
    pub timestamp: (u64, u64),
}

impl Fix {
    async fn read(proxy: &GeoClueLocationProxy<'_>) -> zbus::Result<Fix> {
        Ok(Fix {
            latitude: proxy.latitude().await?,
            longitude: proxy.longitude().await?,
            altitude: proxy.altitude().await?,
            accuracy: proxy.accuracy().await?,
            speed: proxy.speed().await?,
            heading: proxy.heading().await?,
            description: proxy.description().await?,
            timestamp: proxy.timestamp().await?,
        })
    }

    pub fn to_dict(&self) -> Result<VarDict, PortalError> {
        Ok(VarDict::from([
            ("Latitude".to_string(), to_value(self.latitude)?),
            ("Longitude".to_string(), to_value(self.longitude)?),
            ("Altitude".to_string(), to_value(self.altitude)?),
            ("Accuracy".to_string(), to_value(self.accuracy)?),
            ("Speed".to_string(), to_value(self.speed)?),
            ("Heading".to_string(), to_value(self.heading)?),
            ("Description".to_string(), to_value(self.description.as_str())?),
            ("Timestamp".to_string(), to_value(self.timestamp)?),
        ]))
    }
}

/// A running GeoClue client and the task relaying its updates.
pub struct LocationClient {
    proxy: GeoClueClientProxy<'static>,
    updates: AbortHandle,
}

impl LocationClient {
    pub async fn stop(self) {
        self.updates.abort();
        if let Err(err) = self.proxy.stop().await {
            debug!(?err, "GeoClue client not stopped");
        }
    }
}

/// State of a location session.
#[derive(Default)]
pub struct LocationSession {
    pub accuracy: Accuracy,
    pub distance_threshold: u32,
    pub time_threshold: u32,
    client: Option<LocationClient>,
}

impl std::fmt::Debug for LocationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationSession")
            .field("accuracy", &self.accuracy)
            .field("distance_threshold", &self.distance_threshold)
            .field("time_threshold", &self.time_threshold)
            .field("running", &self.client.is_some())
            .finish()
    }
}

impl LocationSession {
    pub fn take_client(&mut self) -> Option<LocationClient> {
        self.client.take()
    }
}

pub struct Location {
    broker: Arc<Broker>,
}

impl Location {
    pub fn new(broker: Arc<Broker>) -> Location {
        Location { broker }
    }
}

/// Accuracy `app_id` may use, asking the user if nothing is stored yet.
/// `None` if the dialog failed.
async fn granted_accuracy(
    broker: &Broker,
    request: &crate::request::Request,
    app_id: &str,
    parent_window: &str,
    requested: Accuracy,
) -> Result<Option<Accuracy>, PortalError> {
    let stored = match permissions::get(&*broker.permissions, app_id, TABLE, TABLE) {
        Ok(list) => stored_accuracy(&list),
        Err(err) => {
            warn!(app_id, %err, "Failed to read location permission");
            None
        }
    };
    if let Some(stored) = stored {
        store_accuracy(&*broker.permissions, app_id, stored);
        return Ok(Some(stored));
    }

    let prompt = Prompt::new(
        format!("Give {app_id} access to your location?"),
        "Location access can be changed at any time from the privacy settings.",
    )
    .grant("Allow")
    .deny("Deny")
    .icon("find-location-symbolic");
    let Some(answer) = ask(broker, request, app_id, parent_window, &prompt).await? else {
        return Ok(None);
    };
    let accuracy = if answer.granted { requested } else { Accuracy::None };
    if answer.remember {
        store_accuracy(&*broker.permissions, app_id, accuracy);
    }
    Ok(Some(accuracy))
}

async fn start_client(broker: &Arc<Broker>, session: &Arc<Session>, accuracy: Accuracy) -> Result<(), PortalError> {
    let system_bus = broker
        .system_bus
        .as_ref()
        .ok_or_else(|| PortalError::failed("No system bus"))?;
    let (distance, time) = session.with_data(|data| match data {
        SessionData::Location(location) => (location.distance_threshold, location.time_threshold),
        _ => (0, 0),
    });
    let path = GeoClueManagerProxy::new(system_bus).await?.get_client().await?;
    let proxy = GeoClueClientProxy::builder(system_bus).path(path)?.build().await?;
    let desktop_id = match session.app_info().id() {
        "" => "portal-broker",
        id => id,
    };
    proxy.set_desktop_id(desktop_id).await?;
    proxy.set_distance_threshold(distance).await?;
    proxy.set_time_threshold(time).await?;
    proxy.set_requested_accuracy_level(accuracy.geoclue_level()).await?;
    let mut updates = proxy.receive_location_updated().await?;
    proxy.start().await?;

    let connection = system_bus.clone();
    let forwarded = session.clone();
    let (relay, handle) = abortable(async move {
        while let Some(signal) = updates.next().await {
            let Ok(args) = signal.args() else {
                continue;
            };
            let fix = async {
                let location = GeoClueLocationProxy::builder(&connection)
                    .path(args.new.into_owned())?
                    .build()
                    .await?;
                Fix::read(&location).await
            }
            .await;
            let location = match fix.map_err(PortalError::from).and_then(|fix| fix.to_dict()) {
                Ok(location) => location,
                Err(err) => {
                    warn!(%err, "Cannot read GeoClue location");
                    continue;
                }
            };
            let path = forwarded.path().clone();
            forwarded
                .forward(|emitter| async move { Location::location_updated(&emitter, &path, &location).await })
                .await;
        }
    });
    broker.executor.spawn_ok(async move {
        let _ = relay.await;
    });

    let client = LocationClient { proxy, updates: handle };
    let orphan = session.with_data(|data| match data {
        SessionData::Location(location) => {
            location.client = Some(client);
            None
        }
        _ => Some(client),
    });
    if let Some(client) = orphan {
        client.stop().await;
    }
    Ok(())
}

#[zbus::interface(name = "org.freedesktop.portal.Location")]
impl Location {
    /// Returns the session handle directly, there is no request.
    async fn create_session(
        &self,
        #[zbus(header)] header: Header<'_>,
        options: VarDict,
    ) -> Result<OwnedObjectPath, PortalError> {
        let call = self.broker.authorize(&header).await?;
        let options = filter_options(&options, CREATE_OPTIONS)?;
        let data = LocationSession {
            accuracy: get_u32(&options, "accuracy")
                .and_then(Accuracy::from_u32)
                .unwrap_or_default(),
            distance_threshold: get_u32(&options, "distance-threshold").unwrap_or(0),
            time_threshold: get_u32(&options, "time-threshold").unwrap_or(0),
            client: None,
        };
        let session = create_session(
            &self.broker,
            &call,
            get_str(&options, "session_handle_token"),
            None,
            SessionData::Location(data),
        )?;
        if let Err(err) = self.broker.sessions.publish(&session).await {
            self.broker.sessions.close(&session, CloseReason::Failed);
            return Err(err.into());
        }
        Ok(session.path().to_owned().into())
    }

    async fn start(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
        parent_window: String,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        let call = self.broker.authorize(&header).await?;
        let session = self.broker.sessions.lookup(&session_handle, &call.sender)?;
        let token = handle_token(&options);
        let requested = session.with_data(|data| match data {
            SessionData::Location(location) => Ok(location.accuracy),
            data => Err(PortalError::invalid(format!("Not a location session but {}", data.name()))),
        })?;
        session.begin_start()?;
        let broker = self.broker.clone();
        let started = session.clone();
        begin_request(&self.broker, &call, token.as_deref(), Some(session), move |request| async move {
            let app_id = request.app_info().id().to_string();
            let granted = if app_id.is_empty() {
                Some(requested)
            } else {
                granted_accuracy(&broker, &request, &app_id, &parent_window, requested).await?
            };
            let accuracy = match granted {
                Some(granted) => granted.min(requested),
                None => return Ok(Response::other()),
            };
            if accuracy == Accuracy::None {
                debug!(app_id, "Location access denied");
                return Ok(Response::other());
            }

            start_client(&broker, &started, accuracy).await?;
            if !started.mark_started() {
                debug!(path = %started.path(), "Session closed while starting");
                return Ok(Response::other());
            }
            debug!(app_id, ?accuracy, "Location session started");
            Ok(Response::success(VarDict::new()))
        })
        .await
    }

    #[zbus(signal)]
    async fn location_updated(
        emitter: &SignalEmitter<'_>,
        session_handle: &ObjectPath<'_>,
        location: &VarDict,
    ) -> zbus::Result<()>;

    #[zbus(property)]
    fn version(&self) -> u32 {
        1
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::permissions::MemoryPermissionStore;

    #[test]
    fn test_accuracy_levels() {
        let levels = (0..6)
            .filter_map(Accuracy::from_u32)
            .map(Accuracy::geoclue_level)
            .collect::<Vec<_>>();
        assert_eq!(levels, vec![0, 1, 4, 5, 6, 8]);
        assert_eq!(Accuracy::from_u32(6), None);
        assert_eq!(Accuracy::from_name("CITY"), Some(Accuracy::City));
        assert_eq!(Accuracy::Street.name(), "STREET");
    }

    #[test]
    fn test_stored_accuracy() {
        let store = MemoryPermissionStore::default();
        store_accuracy(&store, "org.example.Maps", Accuracy::City);
        let list = permissions::get(&store, "org.example.Maps", TABLE, TABLE).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(stored_accuracy(&list), Some(Accuracy::City));
        assert!(list[1].parse::<u64>().is_ok());
        assert_eq!(stored_accuracy(&[]), None);
        // Granted accuracy caps a finer request.
        assert_eq!(Accuracy::City.min(Accuracy::Exact), Accuracy::City);
    }

    #[test]
    fn test_fix_dict() {
        let fix = Fix {
            latitude: 52.5,
            longitude: 13.4,
            altitude: -1.7976931348623157e308,
            accuracy: 20.0,
            speed: -1.0,
            heading: -1.0,
            description: String::new(),
            timestamp: (1_700_000_000, 0),
        };
        let dict = fix.to_dict().unwrap();
        assert_eq!(dict.len(), 8);
        assert_eq!(dict["Timestamp"].value_signature().to_string(), "(tt)");
        assert_eq!(dict["Latitude"].value_signature().to_string(), "d");
    }
}
