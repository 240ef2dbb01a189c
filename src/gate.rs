//! The once-per-boot routing decision.
//!
//! [`decide`] is a pure function of what the boot found on entry. Every
//! storage side effect of entering a route (clearing or rewriting the update
//! flag, consuming the manual request) is applied by the supervisor.

use std::fmt;

use crate::{
    config::Configuration,
    persist::UpdateFlag,
    reset::ResetReason,
};

/// Why this boot serves the local server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServeCause {
    /// The boot counter passed the threshold.
    BootLoop,
    /// The reset pin started this boot.
    ExternalReset,
    /// The previous boot installed firmware that never confirmed.
    UnconfirmedUpdate,
    /// The stored configuration is unusable; the factory one is serving.
    BadConfig,
}

impl fmt::Display for ServeCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServeCause::BootLoop => write!(f, "boot-loop"),
            ServeCause::ExternalReset => write!(f, "external-reset"),
            ServeCause::UnconfirmedUpdate => write!(f, "unconfirmed-update"),
            ServeCause::BadConfig => write!(f, "bad-config"),
        }
    }
}

/// Why this boot attempts a firmware update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateCause {
    /// Recovery by upgrade, the local server being disabled.
    BootLoop,
    /// `ota.checkOnBoot` is set.
    CheckOnBoot,
    /// Somebody asked for it through the local server.
    Requested,
}

/// What the boot does once the decision is taken.
///
/// # Variants
/// * `Normal` - Join the network and run the application cycle. `probation` is set while freshly installed firmware runs its first cycle.
/// * `Recover` - The previous update never confirmed. Serve the local server if `serve`, otherwise run normally.
/// * `Update` - Join the network and look for new firmware.
/// * `LocalServer` - Serve configuration and diagnostics instead of the application.
/// * `Halt` - No usable configuration and no way to get one; idle until an external reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Normal { probation: bool },
    Recover { serve: bool },
    Update { cause: UpdateCause },
    LocalServer { cause: ServeCause },
    Halt,
}

/// Everything the boot found on entry.
#[derive(Clone, Copy, Debug)]
pub struct Inputs<'a> {
    /// Boot counter, already incremented for this boot.
    pub boot_count: u32,
    pub reset: ResetReason,
    /// Update flag as found, before any rewrite.
    pub flag: UpdateFlag,
    /// Manual update trigger.
    pub update_requested: bool,
    pub config: &'a Configuration,
}

/// Picks the route of this boot.
///
/// Rules, first match wins:
/// 1. An update left `InProgress` or on `Probation` never confirmed: `Recover`.
///    An `Applied` flag means the new image is starting its first cycle: `Normal`
///    on probation. Neither ever leads to `Update`.
/// 2. More boots than `bootLoopThreshold` without a completed cycle: `LocalServer`,
///    else `Update`, else `Normal`, as the feature flags allow.
/// 3. Reset pin with `serverOnExternalReset`: `LocalServer` if allowed.
/// 4. `ota.checkOnBoot` or a manual request: `Update` if allowed.
/// 5. `Normal`.
#[must_use]
pub fn decide(inputs: &Inputs<'_>) -> Route {
    let features = inputs.config.features();
    let policy = inputs.config.policy();

    if inputs.flag.is_unconfirmed() {
        return Route::Recover {
            serve: features.allow_local_server,
        };
    }
    if inputs.flag == UpdateFlag::Applied {
        return Route::Normal { probation: true };
    }

    if inputs.boot_count > policy.boot_loop_threshold {
        return if features.allow_local_server {
            Route::LocalServer {
                cause: ServeCause::BootLoop,
            }
        } else if features.allow_auto_update {
            Route::Update {
                cause: UpdateCause::BootLoop,
            }
        } else {
            Route::Normal { probation: false }
        };
    }

    if inputs.reset == ResetReason::ExternalReset
        && policy.server_on_external_reset
        && features.allow_local_server
    {
        return Route::LocalServer {
            cause: ServeCause::ExternalReset,
        };
    }

    if features.allow_auto_update {
        if inputs.update_requested {
            return Route::Update {
                cause: UpdateCause::Requested,
            };
        }
        if inputs.config.ota().check_on_boot {
            return Route::Update {
                cause: UpdateCause::CheckOnBoot,
            };
        }
    }

    Route::Normal { probation: false }
}

/// Route of a boot whose configuration did not parse.
///
/// `factory` is the built-in configuration, if the firmware carries a valid one.
#[must_use]
pub fn fallback(factory: Option<&Configuration>) -> Route {
    match factory {
        Some(config) if config.features().allow_local_server => Route::LocalServer {
            cause: ServeCause::BadConfig,
        },
        _ => Route::Halt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLAGS: [UpdateFlag; 4] = [
        UpdateFlag::Idle,
        UpdateFlag::InProgress,
        UpdateFlag::Applied,
        UpdateFlag::Probation,
    ];

    const RESETS: [ResetReason; 6] = [
        ResetReason::PowerOn,
        ResetReason::ExternalReset,
        ResetReason::SoftwareReset,
        ResetReason::Crash,
        ResetReason::DeepSleepWake,
        ResetReason::Unknown,
    ];

    fn config(local_server: bool, auto_update: bool, check_on_boot: bool) -> Configuration {
        Configuration::parse(&format!(
            r#"{{"ssid":"n","password":"s","host":"h",
                "features":{{"allowLocalServer":{local_server},"allowAutoUpdate":{auto_update}}},
                "ota":{{"checkOnBoot":{check_on_boot}}}}}"#
        ))
        .unwrap()
    }

    fn every_config() -> Vec<Configuration> {
        let mut configs = Vec::new();
        for local_server in [false, true] {
            for auto_update in [false, true] {
                for check_on_boot in [false, true] {
                    configs.push(config(local_server, auto_update, check_on_boot));
                }
            }
        }
        configs
    }

    fn route(
        config: &Configuration,
        boot_count: u32,
        reset: ResetReason,
        flag: UpdateFlag,
        update_requested: bool,
    ) -> Route {
        decide(&Inputs {
            boot_count,
            reset,
            flag,
            update_requested,
            config,
        })
    }

    #[test]
    fn set_flag_never_routes_to_update() {
        for config in every_config() {
            for flag in FLAGS.into_iter().filter(|f| *f != UpdateFlag::Idle) {
                for reset in RESETS {
                    for count in [1, 3, 4, 100] {
                        for requested in [false, true] {
                            let route = route(&config, count, reset, flag, requested);
                            assert!(
                                !matches!(route, Route::Update { .. }),
                                "{flag} at count {count} gave {route:?}"
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn unconfirmed_update_recovers() {
        let config = config(true, true, true);
        assert_eq!(
            route(&config, 1, ResetReason::Crash, UpdateFlag::InProgress, false),
            Route::Recover { serve: true }
        );
        let config = self::config(false, true, true);
        assert_eq!(
            route(&config, 1, ResetReason::Crash, UpdateFlag::Probation, false),
            Route::Recover { serve: false }
        );
    }

    #[test]
    fn applied_update_runs_on_probation() {
        let config = config(true, true, true);
        assert_eq!(
            route(&config, 1, ResetReason::SoftwareReset, UpdateFlag::Applied, true),
            Route::Normal { probation: true }
        );
    }

    #[test]
    fn boot_loop_prefers_local_server() {
        for auto_update in [false, true] {
            let config = config(true, auto_update, false);
            assert_eq!(
                route(&config, 4, ResetReason::Crash, UpdateFlag::Idle, false),
                Route::LocalServer {
                    cause: ServeCause::BootLoop
                }
            );
        }
    }

    #[test]
    fn boot_loop_without_local_server_updates() {
        let config = config(false, true, false);
        assert_eq!(
            route(&config, 4, ResetReason::Crash, UpdateFlag::Idle, false),
            Route::Update {
                cause: UpdateCause::BootLoop
            }
        );
    }

    #[test]
    fn threshold_itself_is_not_a_loop() {
        let config = config(true, false, false);
        assert_eq!(
            route(&config, 3, ResetReason::Crash, UpdateFlag::Idle, false),
            Route::Normal { probation: false }
        );
    }

    #[test]
    fn everything_disabled_is_always_normal() {
        let config = config(false, false, true);
        for count in 0..20 {
            for reset in RESETS {
                for requested in [false, true] {
                    assert_eq!(
                        route(&config, count, reset, UpdateFlag::Idle, requested),
                        Route::Normal { probation: false }
                    );
                }
            }
        }
    }

    #[test]
    fn external_reset_opens_the_local_server() {
        let config = config(true, false, false);
        assert_eq!(
            route(&config, 1, ResetReason::ExternalReset, UpdateFlag::Idle, false),
            Route::LocalServer {
                cause: ServeCause::ExternalReset
            }
        );

        let raw = r#"{"ssid":"n","password":"s","host":"h","policy":{"serverOnExternalReset":false}}"#;
        let config = Configuration::parse(raw).unwrap();
        assert_eq!(
            route(&config, 1, ResetReason::ExternalReset, UpdateFlag::Idle, false),
            Route::Normal { probation: false }
        );
    }

    #[test]
    fn update_triggers_need_auto_update() {
        let config = config(true, true, false);
        assert_eq!(
            route(&config, 1, ResetReason::DeepSleepWake, UpdateFlag::Idle, true),
            Route::Update {
                cause: UpdateCause::Requested
            }
        );
        let config = self::config(true, true, true);
        assert_eq!(
            route(&config, 1, ResetReason::DeepSleepWake, UpdateFlag::Idle, false),
            Route::Update {
                cause: UpdateCause::CheckOnBoot
            }
        );
        let config = self::config(true, false, true);
        assert_eq!(
            route(&config, 1, ResetReason::DeepSleepWake, UpdateFlag::Idle, true),
            Route::Normal { probation: false }
        );
    }

    #[test]
    fn fresh_device_with_features_off_is_normal() {
        let config = config(false, false, false);
        assert_eq!(
            route(&config, 1, ResetReason::PowerOn, UpdateFlag::Idle, false),
            Route::Normal { probation: false }
        );
    }

    #[test]
    fn bad_config_falls_back_to_factory_server_or_halts() {
        assert_eq!(
            fallback(Some(&config(true, false, false))),
            Route::LocalServer {
                cause: ServeCause::BadConfig
            }
        );
        assert_eq!(fallback(Some(&config(false, true, false))), Route::Halt);
        assert_eq!(fallback(None), Route::Halt);
    }
}
