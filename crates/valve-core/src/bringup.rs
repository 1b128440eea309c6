//! Network bring-up sequencing
//!
//! Bring-up is a strictly ordered, one-shot state machine:
//!
//! ```text
//! Uninitialized -> StorageReady -> RadioConfigured -> RadioStarted
//!               -> AddressBound -> ListenerStarted
//! ```
//!
//! Each transition either advances the state or ends the sequence with a
//! [`BringUpError`]. The sequencer never halts the device itself; the caller
//! decides what a failed bring-up means. The only recovery performed here is
//! erasing and re-initializing a settings store that reports itself unusable,
//! and only once.

use log::{debug, error, info, warn};
use thiserror_no_std::Error;

use crate::config::{ConfigError, NetworkConfig};
use crate::settings::{StorageFault, StorageStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BringUpState {
    Uninitialized,
    StorageReady,
    RadioConfigured,
    RadioStarted,
    AddressBound,
    ListenerStarted,
}

impl BringUpState {
    /// The state the next transition leads to, `None` once complete.
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Uninitialized => Some(Self::StorageReady),
            Self::StorageReady => Some(Self::RadioConfigured),
            Self::RadioConfigured => Some(Self::RadioStarted),
            Self::RadioStarted => Some(Self::AddressBound),
            Self::AddressBound => Some(Self::ListenerStarted),
            Self::ListenerStarted => None,
        }
    }
}

/// Outcome of switching a facility on or off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Changed,
    /// The facility was already in the requested state; not an error
    AlreadyInState,
}

/// Platform operations the sequencer drives, in the order it calls them.
///
/// The firmware implements this on top of the ESP32-S3 radio, flash and
/// network stack; the simulator implements it in memory.
#[allow(async_fn_in_trait)]
pub trait BringUpPlatform {
    type Error: core::fmt::Debug;

    /// Opens the settings store and reports whether it is usable.
    fn init_storage(&mut self) -> Result<StorageStatus, Self::Error>;
    fn erase_storage(&mut self) -> Result<(), Self::Error>;

    /// Creates the access-point network interface. Always called before
    /// [`Self::init_radio`]; an interface created after the driver comes up
    /// would never be bound to it.
    fn create_ap_interface(&mut self) -> Result<(), Self::Error>;
    fn init_radio(&mut self) -> Result<(), Self::Error>;
    fn configure_access_point(&mut self, config: &NetworkConfig<'_>) -> Result<(), Self::Error>;
    /// Starts the radio; the access point begins beaconing.
    async fn start_radio(&mut self) -> Result<(), Self::Error>;

    /// Stopping an already stopped leasing facility returns
    /// [`Toggle::AlreadyInState`].
    fn stop_leasing(&mut self) -> Result<Toggle, Self::Error>;
    fn assign_address(&mut self, config: &NetworkConfig<'_>) -> Result<(), Self::Error>;
    /// Starting an already running leasing facility returns
    /// [`Toggle::AlreadyInState`].
    fn start_leasing(&mut self, config: &NetworkConfig<'_>) -> Result<Toggle, Self::Error>;

    /// Starts the HTTP listener and registers the control route.
    fn start_listener(&mut self, port: u16) -> Result<(), Self::Error>;
}

#[derive(Error, Debug)]
pub enum BringUpError<E: core::fmt::Debug> {
    #[error("invalid network config: {0}")]
    Config(ConfigError),
    #[error("settings store unusable after erase: {0:?}")]
    StorageUnrecoverable(StorageFault),
    #[error("bring-up failed before {stage:?}: {cause:?}")]
    Stage { stage: BringUpState, cause: E },
}

impl<E: core::fmt::Debug> BringUpError<E> {
    /// The state that could not be reached
    pub fn stage(&self) -> BringUpState {
        match self {
            Self::Config(_) => BringUpState::Uninitialized,
            Self::StorageUnrecoverable(_) => BringUpState::StorageReady,
            Self::Stage { stage, .. } => *stage,
        }
    }
}

/// Drives a [`BringUpPlatform`] from `Uninitialized` to `ListenerStarted`.
pub struct Sequencer<'c, P> {
    state: BringUpState,
    config: &'c NetworkConfig<'c>,
    platform: P,
}

impl<'c, P: BringUpPlatform> Sequencer<'c, P> {
    /// Validates `config` up front so no transition starts with a bad one.
    pub fn new(config: &'c NetworkConfig<'c>, platform: P) -> Result<Self, BringUpError<P::Error>> {
        config.validate().map_err(BringUpError::Config)?;
        Ok(Self {
            state: BringUpState::Uninitialized,
            config,
            platform,
        })
    }

    pub fn state(&self) -> BringUpState {
        self.state
    }

    /// Runs every remaining transition. On success the platform is handed
    /// back so the caller can keep its runtime resources alive; on failure
    /// the sequencer is consumed and cannot be resumed.
    pub async fn run(mut self) -> Result<P, BringUpError<P::Error>> {
        while let Some(next) = self.state.next() {
            if let Err(e) = self.advance(next).await {
                error!("bring-up stopped in {:?}: {}", self.state, e);
                return Err(e);
            }
            self.state = next;
            info!("bring-up: {:?}", next);
        }
        Ok(self.platform)
    }

    async fn advance(&mut self, next: BringUpState) -> Result<(), BringUpError<P::Error>> {
        let stage = |cause| BringUpError::Stage { stage: next, cause };
        let config = self.config;

        match next {
            BringUpState::Uninitialized => Ok(()),
            BringUpState::StorageReady => self.init_storage(),
            BringUpState::RadioConfigured => {
                self.platform.create_ap_interface().map_err(stage)?;
                self.platform.init_radio().map_err(stage)?;
                self.platform
                    .configure_access_point(config)
                    .map_err(stage)?;
                info!(
                    "access point \"{}\" on channel {} ({}, max {} stations)",
                    config.ssid,
                    config.channel,
                    config.access_mode.label(),
                    config.max_connections
                );
                Ok(())
            }
            BringUpState::RadioStarted => self.platform.start_radio().await.map_err(stage),
            BringUpState::AddressBound => {
                // The address cannot change while the leasing facility runs
                if self.platform.stop_leasing().map_err(stage)? == Toggle::AlreadyInState {
                    debug!("leasing facility already stopped");
                }
                self.platform.assign_address(config).map_err(stage)?;
                info!(
                    "static address {}/{}",
                    config.static_address,
                    config.prefix_len().unwrap_or(0)
                );
                if config.leasing.enabled {
                    if self.platform.start_leasing(config).map_err(stage)?
                        == Toggle::AlreadyInState
                    {
                        debug!("leasing facility already running");
                    }
                } else {
                    info!("leasing facility left stopped");
                }
                Ok(())
            }
            BringUpState::ListenerStarted => self.platform.start_listener(config.port).map_err(stage),
        }
    }

    fn init_storage(&mut self) -> Result<(), BringUpError<P::Error>> {
        let stage = |cause| BringUpError::Stage {
            stage: BringUpState::StorageReady,
            cause,
        };

        let StorageStatus::NeedsErase(fault) = self.platform.init_storage().map_err(stage)? else {
            return Ok(());
        };

        warn!("settings store unusable ({:?}); erasing", fault);
        self.platform.erase_storage().map_err(stage)?;

        match self.platform.init_storage().map_err(stage)? {
            StorageStatus::Ready => Ok(()),
            StorageStatus::NeedsErase(fault) => Err(BringUpError::StorageUnrecoverable(fault)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use embassy_futures::block_on;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        InitStorage,
        EraseStorage,
        CreateInterface,
        InitRadio,
        Configure,
        StartRadio,
        StopLeasing,
        AssignAddress,
        StartLeasing,
        StartListener(u16),
    }

    #[derive(Debug, PartialEq, Eq)]
    struct Refused(Call);

    /// Records calls; storage answers come from a script, and one call can
    /// be made to fail.
    #[derive(Debug)]
    struct MockPlatform {
        calls: Vec<Call>,
        storage_answers: Vec<StorageStatus>,
        leasing_running: bool,
        fail_on: Option<Call>,
    }

    impl MockPlatform {
        fn new() -> Self {
            Self {
                calls: Vec::new(),
                storage_answers: Vec::new(),
                leasing_running: false,
                fail_on: None,
            }
        }

        fn record(&mut self, call: Call) -> Result<(), Refused> {
            self.calls.push(call);
            if self.fail_on == Some(call) {
                Err(Refused(call))
            } else {
                Ok(())
            }
        }
    }

    impl BringUpPlatform for MockPlatform {
        type Error = Refused;

        fn init_storage(&mut self) -> Result<StorageStatus, Refused> {
            self.record(Call::InitStorage)?;
            if self.storage_answers.is_empty() {
                Ok(StorageStatus::Ready)
            } else {
                Ok(self.storage_answers.remove(0))
            }
        }

        fn erase_storage(&mut self) -> Result<(), Refused> {
            self.record(Call::EraseStorage)
        }

        fn create_ap_interface(&mut self) -> Result<(), Refused> {
            self.record(Call::CreateInterface)
        }

        fn init_radio(&mut self) -> Result<(), Refused> {
            self.record(Call::InitRadio)
        }

        fn configure_access_point(&mut self, _config: &NetworkConfig<'_>) -> Result<(), Refused> {
            self.record(Call::Configure)
        }

        async fn start_radio(&mut self) -> Result<(), Refused> {
            self.record(Call::StartRadio)
        }

        fn stop_leasing(&mut self) -> Result<Toggle, Refused> {
            self.record(Call::StopLeasing)?;
            let was_running = core::mem::replace(&mut self.leasing_running, false);
            Ok(if was_running {
                Toggle::Changed
            } else {
                Toggle::AlreadyInState
            })
        }

        fn assign_address(&mut self, _config: &NetworkConfig<'_>) -> Result<(), Refused> {
            self.record(Call::AssignAddress)
        }

        fn start_leasing(&mut self, _config: &NetworkConfig<'_>) -> Result<Toggle, Refused> {
            self.record(Call::StartLeasing)?;
            let was_running = core::mem::replace(&mut self.leasing_running, true);
            Ok(if was_running {
                Toggle::AlreadyInState
            } else {
                Toggle::Changed
            })
        }

        fn start_listener(&mut self, port: u16) -> Result<(), Refused> {
            self.record(Call::StartListener(port))
        }
    }

    const HAPPY_PATH: [Call; 9] = [
        Call::InitStorage,
        Call::CreateInterface,
        Call::InitRadio,
        Call::Configure,
        Call::StartRadio,
        Call::StopLeasing,
        Call::AssignAddress,
        Call::StartLeasing,
        Call::StartListener(8080),
    ];

    fn run(config: &NetworkConfig<'_>, platform: MockPlatform) -> Result<MockPlatform, BringUpError<Refused>> {
        let sequencer = Sequencer::new(config, platform)?;
        assert_eq!(sequencer.state(), BringUpState::Uninitialized);
        block_on(sequencer.run())
    }

    #[test]
    fn test_transitions_in_order() {
        let config = NetworkConfig::default();
        let platform = run(&config, MockPlatform::new()).unwrap();

        assert_eq!(platform.calls, HAPPY_PATH);
        assert!(platform.leasing_running);
    }

    #[test]
    fn test_leasing_already_stopped_is_not_an_error() {
        let config = NetworkConfig::default();
        let mut platform = MockPlatform::new();
        platform.leasing_running = false;

        let platform = run(&config, platform).unwrap();
        assert_eq!(platform.calls, HAPPY_PATH);
    }

    #[test]
    fn test_leasing_running_is_stopped_first() {
        let config = NetworkConfig::default();
        let mut platform = MockPlatform::new();
        platform.leasing_running = true;

        let platform = run(&config, platform).unwrap();
        let stop = platform.calls.iter().position(|c| *c == Call::StopLeasing);
        let assign = platform.calls.iter().position(|c| *c == Call::AssignAddress);
        assert!(stop < assign);
    }

    #[test]
    fn test_leasing_disabled_stays_stopped() {
        let mut config = NetworkConfig::default();
        config.leasing.enabled = false;

        let platform = run(&config, MockPlatform::new()).unwrap();
        assert!(!platform.calls.contains(&Call::StartLeasing));
        assert!(!platform.leasing_running);
    }

    #[test]
    fn test_corrupt_storage_erased_once() {
        let config = NetworkConfig::default();
        let mut platform = MockPlatform::new();
        platform.storage_answers = alloc::vec![
            StorageStatus::NeedsErase(StorageFault::NewVersion),
            StorageStatus::Ready,
        ];

        let platform = run(&config, platform).unwrap();
        assert_eq!(
            &platform.calls[..4],
            [
                Call::InitStorage,
                Call::EraseStorage,
                Call::InitStorage,
                Call::CreateInterface
            ]
        );
    }

    #[test]
    fn test_storage_still_bad_after_erase_is_fatal() {
        let config = NetworkConfig::default();
        let mut platform = MockPlatform::new();
        platform.storage_answers = alloc::vec![
            StorageStatus::NeedsErase(StorageFault::Corrupt),
            StorageStatus::NeedsErase(StorageFault::NoFreePages),
        ];

        let err = run(&config, platform).unwrap_err();
        assert!(matches!(
            err,
            BringUpError::StorageUnrecoverable(StorageFault::NoFreePages)
        ));
        assert_eq!(err.stage(), BringUpState::StorageReady);
    }

    #[test]
    fn test_failed_stage_stops_sequence() {
        let config = NetworkConfig::default();
        let mut platform = MockPlatform::new();
        platform.fail_on = Some(Call::StartRadio);

        let err = run(&config, platform).unwrap_err();
        match err {
            BringUpError::Stage { stage, cause } => {
                assert_eq!(stage, BringUpState::RadioStarted);
                assert_eq!(cause, Refused(Call::StartRadio));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_config_rejected_before_any_call() {
        let config = NetworkConfig {
            channel: 0,
            ..Default::default()
        };
        let err = Sequencer::new(&config, MockPlatform::new()).err().unwrap();
        assert!(matches!(err, BringUpError::Config(ConfigError::Channel(0))));
    }

    #[test]
    fn test_state_order() {
        let mut state = BringUpState::Uninitialized;
        let mut seen = 1;
        while let Some(next) = state.next() {
            assert!(next > state);
            state = next;
            seen += 1;
        }
        assert_eq!(state, BringUpState::ListenerStarted);
        assert_eq!(seen, 6);
    }
}
