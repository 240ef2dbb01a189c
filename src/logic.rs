use anyhow::Result;
use log::{debug, error, info, warn};
use std::time::Duration;

use crate::{
    config::{ConfigError, ConfigStore, Configuration},
    gate::{self, Inputs, Route, ServeCause, UpdateCause},
    http::HttpTransport,
    ota::{FirmwareSlot, FirmwareUpdater, UpdateOutcome},
    persist::{FirmwareFlag, PersistentCounter, UpdateFlag, UpdateRequest},
    portal::{BootReport, LocalServer, Portal},
    reset::{ResetClassifier, ResetReason},
    storage::{Storage, CONFIG_KEY},
    wifi::{ConnectError, ConnectivityManager, Radio},
};

macro_rules! func {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);

        match &name[..name.len() - 3].rfind(':') {
            Some(pos) => &name[pos + 1..name.len() - 3],
            None => &name[..name.len() - 3],
        }
    }};
}

/// A joined network on which the application may run its cycle.
#[derive(Debug, PartialEq, Eq)]
pub struct Session {
    base_url: String,
    probation: bool,
}

impl Session {
    /// The device's service URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns `true` while freshly installed firmware runs its first cycle.
    #[must_use]
    pub fn probation(&self) -> bool {
        self.probation
    }
}

/// How a boot ends.
///
/// # Variants
/// * `Run` - The network is joined; run the application cycle, then confirm it.
/// * `Serving` - The local server is up; keep it alive for `window`, then restart.
/// * `Reboot` - New firmware was installed; restart into it.
/// * `Offline` - The network could not be joined; rest and try again next boot.
/// * `Halt` - No usable configuration; idle until an external reset.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Run(Session),
    Serving { window: Duration },
    Reboot,
    Offline(ConnectError),
    Halt,
}

/// The boot supervisor: one instance per boot.
///
/// [`Supervisor::init`] does all the bookkeeping of entering a boot and takes
/// the routing decision; [`Supervisor::execute`] carries it out.
pub struct Supervisor<S: Storage> {
    storage: S,
    counter: PersistentCounter<S>,
    flag: FirmwareFlag<S>,
    config: Option<ConfigStore>,
    boot_count: u32,
    reset: ResetReason,
    flag_at_entry: UpdateFlag,
    route: Route,
    version: &'static str,
}

impl<S: Storage> Supervisor<S> {
    /// Enters a boot.
    ///
    /// Classifies the reset, loads the configuration (the one stored through
    /// the local server, else `factory`), increments the boot counter, then
    /// decides the route and persists what entering it implies.
    ///
    /// # Arguments
    /// * `storage` - The persisted state.
    /// * `classifier` - Source of the reset reason.
    /// * `factory` - The configuration built into the firmware, if any.
    /// * `version` - Version of the running firmware.
    pub fn init<C: ResetClassifier>(
        storage: S,
        classifier: &C,
        factory: Option<&str>,
        version: &'static str,
    ) -> Self {
        let counter = PersistentCounter::new(storage.clone());
        let flag = FirmwareFlag::new(storage.clone());
        let request = UpdateRequest::new(storage.clone());

        let reset = classifier.classify();
        let flag_at_entry = flag.load();
        let update_requested = request.pending();
        let stored = storage.get_str(CONFIG_KEY).unwrap_or_else(|e| {
            warn!("Stored configuration unreadable: {e:#}");
            None
        });
        let loaded = load_config(stored.as_deref(), factory);

        let boot_count = counter.increment();
        info!(
            "Boot #{boot_count} (reset: {reset}, update flag: {flag_at_entry}, firmware {version})"
        );
        if reset.is_crash() {
            warn!("Previous boot ended in a fault, {boot_count} boot(s) without a completed cycle");
        }

        let (config, route) = match loaded {
            Ok(store) => {
                let route = gate::decide(&Inputs {
                    boot_count,
                    reset,
                    flag: flag_at_entry,
                    update_requested,
                    config: store.current(),
                });
                (Some(store), route)
            }
            Err(e) => {
                error!("Configuration rejected: {e}");
                let factory = factory.and_then(|raw| ConfigStore::parse(raw).ok());
                let route = gate::fallback(factory.as_ref().map(ConfigStore::current));
                (factory, route)
            }
        };
        info!("Route: {route:?}");

        match route {
            Route::Recover { .. } => flag.clear(),
            Route::Normal { probation: true } => flag.set(UpdateFlag::Probation),
            Route::Update { .. } => request.clear(),
            Route::Normal { probation: false } | Route::LocalServer { .. } | Route::Halt => {}
        }

        Self {
            storage,
            counter,
            flag,
            config,
            boot_count,
            reset,
            flag_at_entry,
            route,
            version,
        }
    }

    /// The route decided on entry.
    ///
    /// # Returns
    /// The [`Route`] that [`Supervisor::execute`] carries out; it never
    /// changes during the boot.
    #[must_use]
    pub fn route(&self) -> Route {
        self.route
    }

    /// Boot counter of this boot, already incremented.
    #[must_use]
    pub fn boot_count(&self) -> u32 {
        self.boot_count
    }

    /// Why this boot happened, as classified on entry.
    #[must_use]
    pub fn reset(&self) -> ResetReason {
        self.reset
    }

    /// The update flag as found on entry, before the route rewrote it.
    ///
    /// # Returns
    /// The stored [`UpdateFlag`] at boot; the live value may since have been
    /// cleared or moved to [`UpdateFlag::Probation`].
    #[must_use]
    pub fn flag_at_entry(&self) -> UpdateFlag {
        self.flag_at_entry
    }

    /// The configuration in effect this boot, `None` on [`Route::Halt`].
    #[must_use]
    pub fn config(&self) -> Option<&Configuration> {
        self.config.as_ref().map(ConfigStore::current)
    }

    /// Carries out the route.
    ///
    /// # Errors
    /// Returns an error if the local server or its access point cannot be
    /// started. Network and update failures are outcomes, not errors.
    pub fn execute<R, T, O, L>(
        &mut self,
        net: &mut ConnectivityManager<R>,
        updater: &mut FirmwareUpdater<T, O>,
        server: &mut L,
    ) -> Result<Outcome>
    where
        R: Radio,
        T: HttpTransport,
        O: FirmwareSlot,
        L: LocalServer<S>,
    {
        debug!("{}: {:?}", func!(), self.route);

        let Some(config) = self.config().cloned() else {
            return Ok(Outcome::Halt);
        };

        match self.route {
            Route::Halt => Ok(Outcome::Halt),
            Route::LocalServer { cause } => self.serve(&config, cause, net, server),
            Route::Recover { serve: true } => {
                self.serve(&config, ServeCause::UnconfirmedUpdate, net, server)
            }
            Route::Recover { serve: false } => self.run(&config, net, false),
            Route::Normal { probation } => self.run(&config, net, probation),
            Route::Update { cause } => self.update(&config, cause, net, updater),
        }
    }

    fn run<R: Radio>(
        &self,
        config: &Configuration,
        net: &mut ConnectivityManager<R>,
        probation: bool,
    ) -> Result<Outcome> {
        debug!("{}: probation: {probation}", func!());

        if let Err(e) = net.connect(config, config.policy().connect_timeout()) {
            return Ok(Outcome::Offline(e));
        }

        Ok(Outcome::Run(Session {
            base_url: net.base_url()?.to_owned(),
            probation,
        }))
    }

    fn update<R: Radio, T: HttpTransport, O: FirmwareSlot>(
        &self,
        config: &Configuration,
        cause: UpdateCause,
        net: &mut ConnectivityManager<R>,
        updater: &mut FirmwareUpdater<T, O>,
    ) -> Result<Outcome> {
        debug!("{}: cause: {cause:?}", func!());

        if let Err(e) = net.connect(config, config.policy().connect_timeout()) {
            return Ok(Outcome::Offline(e));
        }
        let base_url = net.base_url()?.to_owned();

        self.flag.set(UpdateFlag::InProgress);
        let outcome = updater.check_and_apply(
            &base_url,
            config.ota().manifest_url.as_deref(),
            self.version,
            config.policy().update_timeout(),
        );

        match outcome {
            UpdateOutcome::Applied { version } => {
                self.flag.set(UpdateFlag::Applied);
                info!("Firmware {version} installed, rebooting into it");
                return Ok(Outcome::Reboot);
            }
            UpdateOutcome::NoUpdateAvailable => info!("Firmware {} is current", self.version),
            UpdateOutcome::Failed(reason) => warn!("Update abandoned for this boot: {reason}"),
        }
        self.flag.clear();

        Ok(Outcome::Run(Session {
            base_url,
            probation: false,
        }))
    }

    fn serve<R: Radio, L: LocalServer<S>>(
        &self,
        config: &Configuration,
        cause: ServeCause,
        net: &mut ConnectivityManager<R>,
        server: &mut L,
    ) -> Result<Outcome> {
        debug!("{}: cause: {cause}", func!());

        if let Err(e) = net.connect(config, config.policy().connect_timeout()) {
            warn!("{e}, serving on a local access point instead");
            net.host_access_point(config.device_id())?;
        }

        let report = BootReport {
            boot_count: self.boot_count,
            reset: self.reset,
            flag_at_entry: self.flag_at_entry,
            cause,
            version: self.version,
        };
        server.serve(Portal::new(self.storage.clone(), config.clone(), report))?;

        let window = config.policy().local_server_window();
        info!("Local server up for {}s ({cause})", window.as_secs());

        Ok(Outcome::Serving { window })
    }

    /// Records that the application completed a full cycle.
    ///
    /// Clears the boot counter and the update flag together and confirms the
    /// running firmware so the bootloader keeps it. Only a [`Session`] from
    /// [`Outcome::Run`] can confirm.
    pub fn confirm_cycle<T: HttpTransport, O: FirmwareSlot>(
        &self,
        session: Session,
        updater: &mut FirmwareUpdater<T, O>,
    ) {
        debug!("{}: probation: {}", func!(), session.probation);

        self.counter.clear();
        self.flag.clear();
        if let Err(e) = updater.confirm() {
            warn!("Failed to confirm the running firmware: {e:#}");
        }

        if session.probation {
            info!("Firmware {} confirmed", self.version);
        }
    }
}

fn load_config(stored: Option<&str>, factory: Option<&str>) -> Result<ConfigStore, ConfigError> {
    match stored.or(factory) {
        Some(raw) => ConfigStore::parse(raw),
        None => Err(ConfigError::Missing("configuration")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sim::{Reply, SimRadio, SimServer, SimSlot, SimTransport},
        storage::RamStorage,
    };

    const CONFIG: &str = r#"{"ssid":"garden","password":"pw","host":"h","deviceId":"d",
        "features":{"allowLocalServer":true,"allowAutoUpdate":true}}"#;

    struct Rig {
        net: ConnectivityManager<SimRadio>,
        transport: SimTransport,
        slot: SimSlot,
        updater: FirmwareUpdater<SimTransport, SimSlot>,
        server: SimServer<RamStorage>,
    }

    impl Rig {
        fn new(radio: SimRadio) -> Self {
            let transport = SimTransport::default();
            let slot = SimSlot::default();
            Self {
                net: ConnectivityManager::new(radio),
                updater: FirmwareUpdater::new(transport.clone(), slot.clone()),
                transport,
                slot,
                server: SimServer::default(),
            }
        }

        fn execute(&mut self, supervisor: &mut Supervisor<RamStorage>) -> Outcome {
            supervisor
                .execute(&mut self.net, &mut self.updater, &mut self.server)
                .unwrap()
        }
    }

    #[test]
    fn func_names_the_enclosing_function() {
        fn caller() -> &'static str {
            func!()
        }
        assert_eq!(caller(), "caller");
    }

    #[test]
    fn normal_boot_runs_and_confirms() {
        let storage = RamStorage::new();
        storage.set_str(CONFIG_KEY, CONFIG).unwrap();
        let mut supervisor = Supervisor::init(storage.clone(), &ResetReason::PowerOn, None, "1.0.0");
        assert_eq!(supervisor.route(), Route::Normal { probation: false });
        assert_eq!(supervisor.boot_count(), 1);

        let mut rig = Rig::new(SimRadio::default());
        let Outcome::Run(session) = rig.execute(&mut supervisor) else {
            panic!("expected a session");
        };
        assert_eq!(session.base_url(), "http://h/api/devices/d");

        supervisor.confirm_cycle(session, &mut rig.updater);
        assert_eq!(PersistentCounter::new(storage).load(), 0);
        assert!(rig.slot.marked_valid());
    }

    #[test]
    fn stored_config_beats_factory() {
        let storage = RamStorage::new();
        storage.set_str(CONFIG_KEY, CONFIG).unwrap();
        let factory = r#"{"ssid":"factory","password":"","host":"f"}"#;
        let supervisor = Supervisor::init(storage, &ResetReason::PowerOn, Some(factory), "1.0.0");
        assert_eq!(supervisor.config().map(Configuration::ssid), Some("garden"));
    }

    #[test]
    fn bad_config_serves_with_factory_settings() {
        let storage = RamStorage::new();
        storage.set_str(CONFIG_KEY, "{not json").unwrap();
        let factory = r#"{"ssid":"factory","password":"","host":"f","deviceId":"fallback"}"#;
        let mut supervisor = Supervisor::init(storage, &ResetReason::PowerOn, Some(factory), "1.0.0");
        assert_eq!(
            supervisor.route(),
            Route::LocalServer {
                cause: ServeCause::BadConfig
            }
        );

        let mut rig = Rig::new(SimRadio::failing(ConnectError::TimedOut));
        assert!(matches!(rig.execute(&mut supervisor), Outcome::Serving { .. }));
        assert_eq!(rig.net.radio().access_point().as_deref(), Some("fallback"));
        assert!(rig.server.is_serving());
    }

    #[test]
    fn no_config_at_all_halts() {
        let mut supervisor = Supervisor::init(RamStorage::new(), &ResetReason::PowerOn, None, "1.0.0");
        assert_eq!(supervisor.route(), Route::Halt);
        let mut rig = Rig::new(SimRadio::default());
        assert_eq!(rig.execute(&mut supervisor), Outcome::Halt);
        assert_eq!(rig.net.radio().joins(), 0);
    }

    #[test]
    fn connect_failure_on_normal_is_offline() {
        let storage = RamStorage::new();
        storage.set_str(CONFIG_KEY, CONFIG).unwrap();
        let mut supervisor = Supervisor::init(storage, &ResetReason::DeepSleepWake, None, "1.0.0");
        let mut rig = Rig::new(SimRadio::failing(ConnectError::AuthFailed));
        assert_eq!(
            rig.execute(&mut supervisor),
            Outcome::Offline(ConnectError::AuthFailed)
        );
    }

    #[test]
    fn requested_update_is_consumed_and_applied() {
        let storage = RamStorage::new();
        storage.set_str(CONFIG_KEY, CONFIG).unwrap();
        UpdateRequest::new(storage.clone()).set();

        let mut supervisor = Supervisor::init(storage.clone(), &ResetReason::DeepSleepWake, None, "1.0.0");
        assert_eq!(
            supervisor.route(),
            Route::Update {
                cause: UpdateCause::Requested
            }
        );
        assert!(!UpdateRequest::new(storage.clone()).pending());

        let mut rig = Rig::new(SimRadio::default());
        rig.transport.push(Reply::ok(r#"{"version":"1.1.0"}"#));
        rig.transport.push(Reply::ok("image"));
        assert_eq!(rig.execute(&mut supervisor), Outcome::Reboot);
        assert_eq!(FirmwareFlag::new(storage).load(), UpdateFlag::Applied);
        assert_eq!(rig.slot.image().as_deref(), Some(&b"image"[..]));
    }

    #[test]
    fn failed_update_continues_normally() {
        let storage = RamStorage::new();
        storage.set_str(CONFIG_KEY, CONFIG).unwrap();
        UpdateRequest::new(storage.clone()).set();

        let mut supervisor = Supervisor::init(storage.clone(), &ResetReason::DeepSleepWake, None, "1.0.0");
        let mut rig = Rig::new(SimRadio::default());
        rig.transport.push(Reply::status(500));
        assert!(matches!(rig.execute(&mut supervisor), Outcome::Run(_)));
        assert_eq!(FirmwareFlag::new(storage).load(), UpdateFlag::Idle);
        assert_eq!(rig.transport.requests().len(), 1);
    }
}
